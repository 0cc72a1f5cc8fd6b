use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use interconnect::{HandlerError, IcError, IcOptions, IcSession};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::endpoint::runner_endpoint;
use super::messages::{
    GetLaunchParams, LaunchParamsReply, RunErrorParams, RunExecuteParams, SetConfigParams,
    SetConfigReply, GET_LAUNCH_PARAMS, RUN_EXECUTE,
};
use super::registry::RunnerRegistry;
use crate::broker::{BrokerRunManager, RunCloseReason, RunnerBrokerManager};
use crate::config::HeartbeatConfig;
use crate::dispatch::DispatchError;
use crate::metrics;
use crate::model::{new_id, RunErrorRecord, Runner, RunnerState, ServerDeployment, ServerRun};
use crate::store::Stores;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    /// Socket is up; waiting for `server/set_config`.
    Registering,
    Ready,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    Closed,
    AlreadyClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    SocketClosed,
    SocketError,
    HeartbeatTimeout,
    /// The runner registered again on a newer connection.
    Superseded,
    /// The liveness sweep found the runner stale.
    Unregistered,
    Shutdown,
}

impl CloseReason {
    pub fn label(self) -> &'static str {
        match self {
            CloseReason::SocketClosed => "socket_closed",
            CloseReason::SocketError => "socket_error",
            CloseReason::HeartbeatTimeout => "heartbeat_timeout",
            CloseReason::Superseded => "superseded",
            CloseReason::Unregistered => "unregistered",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

/// Frames for the socket writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    Text(String),
    Close,
}

/// Everything a runner connection needs from the rest of the process.
#[derive(Clone)]
pub struct RunnerDeps {
    pub stores: Stores,
    pub registry: RunnerRegistry,
    pub heartbeat: HeartbeatConfig,
    pub ic_request_timeout: Duration,
}

struct Assignment {
    run: ServerRun,
    deployment: ServerDeployment,
    reply: oneshot::Sender<Result<BrokerRunManager, DispatchError>>,
}

/// Gateway side of one runner WebSocket.
pub struct RunnerConnection {
    id: String,
    runner_id: String,
    deps: RunnerDeps,
    ic: IcSession,
    outbound: mpsc::UnboundedSender<WireFrame>,
    state: Mutex<ConnectionState>,
    config: Mutex<Option<SetConfigParams>>,
    broker: Mutex<Option<Arc<RunnerBrokerManager>>>,
    assignments: Mutex<Option<mpsc::UnboundedSender<Assignment>>>,
    last_pong: Mutex<Instant>,
    last_persisted: Mutex<Instant>,
    cancel: CancellationToken,
    closing: AtomicBool,
    closed: watch::Sender<Option<CloseReason>>,
}

impl RunnerConnection {
    /// Create the connection. Frames for the socket come out of the returned
    /// receiver; inbound text goes to [`receive_text`](Self::receive_text).
    pub fn open(
        runner_id: impl Into<String>,
        deps: RunnerDeps,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<WireFrame>) {
        let runner_id = runner_id.into();
        let (wire_tx, wire_rx) = mpsc::unbounded_channel();
        let (ic_tx, mut ic_rx) = mpsc::unbounded_channel::<String>();
        let endpoint = runner_endpoint();
        let options = IcOptions {
            request_timeout: deps.ic_request_timeout,
        };

        let connection = Arc::new_cyclic(|weak: &Weak<RunnerConnection>| {
            let ic = endpoint.connect_with(weak.clone(), ic_tx, options);
            let now = Instant::now();
            let (closed, _) = watch::channel(None);
            RunnerConnection {
                id: new_id("rconn"),
                runner_id,
                deps,
                ic,
                outbound: wire_tx.clone(),
                state: Mutex::new(ConnectionState::Connecting),
                config: Mutex::new(None),
                broker: Mutex::new(None),
                assignments: Mutex::new(None),
                last_pong: Mutex::new(now),
                last_persisted: Mutex::new(now),
                cancel: CancellationToken::new(),
                closing: AtomicBool::new(false),
                closed,
            }
        });

        tokio::spawn(async move {
            while let Some(text) = ic_rx.recv().await {
                if wire_tx.send(WireFrame::Text(text)).is_err() {
                    break;
                }
            }
        });
        metrics::RUNNER_CONNECTIONS.inc();
        (connection, wire_rx)
    }

    /// Socket is accepted: wait for registration and start heartbeating.
    pub fn start(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if *state != ConnectionState::Connecting {
                return;
            }
            *state = ConnectionState::Registering;
        }
        *self.last_pong.lock() = Instant::now();
        self.spawn_heartbeat();
    }

    pub fn connection_id(&self) -> &str {
        &self.id
    }

    pub fn runner_id(&self) -> &str {
        &self.runner_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.config
            .lock()
            .as_ref()
            .map(|config| config.tags.iter().any(|t| t == tag))
            .unwrap_or(false)
    }

    pub fn capacity(&self) -> u32 {
        self.config
            .lock()
            .as_ref()
            .map(|config| config.max_concurrent_jobs)
            .unwrap_or(0)
    }

    pub fn broker(&self) -> Option<Arc<RunnerBrokerManager>> {
        self.broker.lock().clone()
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn last_pong_elapsed(&self) -> Duration {
        self.last_pong.lock().elapsed()
    }

    /// Feed one inbound text frame from the socket.
    pub fn receive_text(&self, text: &str) {
        match text {
            "ping" => {
                let _ = self.outbound.send(WireFrame::Text("pong".into()));
            }
            "pong" => {
                *self.last_pong.lock() = Instant::now();
                self.persist_heartbeat();
            }
            _ => {
                if let Err(err) = self.ic.receive(text) {
                    warn!(
                        runner_id = %self.runner_id,
                        error = %err,
                        "rejected interconnect frame"
                    );
                }
            }
        }
    }

    /// Resolves once the connection has been torn down.
    pub async fn closed(&self) -> Option<CloseReason> {
        let mut closed = self.closed.subscribe();
        let reason = closed.wait_for(Option::is_some).await;
        reason.ok().and_then(|r| *r)
    }

    fn spawn_heartbeat(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let config = self.deps.heartbeat;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(connection) = weak.upgrade() else {
                    break;
                };
                let silent_for = connection.last_pong_elapsed();
                if silent_for > config.timeout {
                    warn!(
                        runner_id = %connection.runner_id,
                        silent_ms = silent_for.as_millis() as u64,
                        "runner missed heartbeat; closing"
                    );
                    connection.close(CloseReason::HeartbeatTimeout).await;
                    break;
                }
                let _ = connection.outbound.send(WireFrame::Text("ping".into()));
            }
        });
    }

    /// Record a received pong as `last_seen_at`, at most once per
    /// `persist_interval`.
    fn persist_heartbeat(&self) {
        if self.config.lock().is_none() {
            return;
        }
        {
            let mut last = self.last_persisted.lock();
            if last.elapsed() < self.deps.heartbeat.persist_interval {
                return;
            }
            *last = Instant::now();
        }
        let runners = Arc::clone(&self.deps.stores.runners);
        let runner_id = self.runner_id.clone();
        let seen_at = Utc::now();
        tokio::spawn(async move {
            if let Err(err) = runners.touch_runner(&runner_id, seen_at).await {
                warn!(runner_id = %runner_id, error = %err, "failed to persist heartbeat");
            }
        });
    }

    pub(crate) async fn set_config(
        self: Arc<Self>,
        params: SetConfigParams,
    ) -> Result<SetConfigReply, HandlerError> {
        if matches!(
            self.state(),
            ConnectionState::Closing | ConnectionState::Closed
        ) {
            return Err(HandlerError::new("connection_closed", "connection is closing"));
        }
        let runner = Runner {
            id: self.runner_id.clone(),
            state: RunnerState::Online,
            tags: params.tags.clone(),
            max_concurrent_jobs: params.max_concurrent_jobs,
            version: params.version.clone(),
            last_seen_at: Utc::now(),
        };
        self.deps
            .stores
            .runners
            .upsert_runner(runner)
            .await
            .map_err(|err| HandlerError::new("store_error", err.to_string()))?;

        info!(
            runner_id = %self.runner_id,
            connection_id = %self.id,
            tags = ?params.tags,
            max_concurrent_jobs = params.max_concurrent_jobs,
            "runner registered"
        );
        *self.config.lock() = Some(params);
        *self.last_persisted.lock() = Instant::now();

        if let Some(previous) = self.deps.registry.register(Arc::clone(&self)) {
            if previous.id != self.id {
                info!(
                    runner_id = %self.runner_id,
                    previous = %previous.id,
                    "superseding older runner connection"
                );
                tokio::spawn(async move {
                    previous.close(CloseReason::Superseded).await;
                });
            }
        }
        Ok(SetConfigReply::ok())
    }

    pub(crate) async fn mark_ready(self: Arc<Self>) {
        if self.config.lock().is_none() {
            warn!(runner_id = %self.runner_id, "server/ready before server/set_config; ignoring");
            return;
        }
        {
            let mut state = self.state.lock();
            let current = *state;
            if current != ConnectionState::Registering {
                debug!(runner_id = %self.runner_id, state = ?current, "ignoring server/ready");
                return;
            }
            *state = ConnectionState::Ready;
        }

        let broker = RunnerBrokerManager::new(
            self.runner_id.clone(),
            self.ic.clone(),
            Arc::clone(&self.deps.stores.runs),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        *self.broker.lock() = Some(Arc::clone(&broker));
        *self.assignments.lock() = Some(tx);
        // close() may have run between the state flip and the stores above.
        if self.cancel.is_cancelled() {
            self.assignments.lock().take();
            broker.stop_all().await;
            return;
        }
        self.spawn_assignment_processor(broker, rx);
        info!(runner_id = %self.runner_id, connection_id = %self.id, "runner ready");
    }

    /// The broker of a ready connection. Run notifications that arrive
    /// earlier are dropped.
    pub(crate) fn ready_broker(&self, method: &str) -> Option<Arc<RunnerBrokerManager>> {
        if !self.is_ready() {
            warn!(runner_id = %self.runner_id, method, "run notification before server/ready; dropping");
            return None;
        }
        self.broker()
    }

    pub(crate) async fn record_run_error(&self, params: RunErrorParams) {
        let Some(broker) = self.ready_broker(super::messages::RUN_ERROR) else {
            return;
        };
        let run_id = params.server_run_id;
        let session_id = match broker.session_for_run(&run_id) {
            Some(session_id) => Some(session_id),
            None => match self.deps.stores.runs.get_run(&run_id).await {
                Ok(run) => run.map(|run| run.session_id),
                Err(err) => {
                    warn!(run_id = %run_id, error = %err, "failed to look up errored run");
                    None
                }
            },
        };
        match session_id {
            Some(session_id) => {
                warn!(
                    runner_id = %self.runner_id,
                    run_id = %run_id,
                    code = %params.error.code,
                    "run reported an error"
                );
                let record = RunErrorRecord::new(
                    &session_id,
                    Some(&run_id),
                    params.error.code,
                    params.error.message,
                );
                if let Err(err) = self.deps.stores.errors.record_error(record).await {
                    warn!(run_id = %run_id, error = %err, "failed to record run error");
                }
            }
            None => debug!(run_id = %run_id, "run/error for unknown run"),
        }
        broker.handle_error(&run_id).await;
    }

    fn spawn_assignment_processor(
        self: &Arc<Self>,
        broker: Arc<RunnerBrokerManager>,
        mut rx: mpsc::UnboundedReceiver<Assignment>,
    ) {
        let weak = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                let assignment = tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = rx.recv() => match next {
                        Some(assignment) => assignment,
                        None => break,
                    },
                };
                let Some(connection) = weak.upgrade() else {
                    break;
                };
                let broker = Arc::clone(&broker);
                tokio::spawn(async move {
                    connection.launch(broker, assignment).await;
                });
            }
        });
    }

    /// Start `run` on this runner. Resolves once `run/execute` succeeded.
    pub async fn assign(
        &self,
        run: ServerRun,
        deployment: ServerDeployment,
    ) -> Result<BrokerRunManager, DispatchError> {
        let unavailable = || DispatchError::RunnerUnavailable(format!("runner {} is not ready", self.runner_id));
        let sender = self.assignments.lock().clone().ok_or_else(unavailable)?;
        let (reply, rx) = oneshot::channel();
        sender
            .send(Assignment {
                run,
                deployment,
                reply,
            })
            .map_err(|_| unavailable())?;
        rx.await.map_err(|_| unavailable())?
    }

    async fn launch(&self, broker: Arc<RunnerBrokerManager>, assignment: Assignment) {
        let Assignment {
            run,
            deployment,
            reply,
        } = assignment;
        let result = self.execute(&broker, &run, &deployment).await;
        if let Err(Ok(orphan)) = reply.send(result) {
            debug!(run_id = %run.id, "dispatcher went away; closing launched run");
            orphan.close().await;
        }
    }

    async fn execute(
        &self,
        broker: &Arc<RunnerBrokerManager>,
        run: &ServerRun,
        deployment: &ServerDeployment,
    ) -> Result<BrokerRunManager, DispatchError> {
        let manager = broker
            .create(run)
            .map_err(|err| DispatchError::RunnerUnavailable(err.to_string()))?;

        let params = GetLaunchParams {
            server_run_id: run.id.clone(),
            server_deployment_id: deployment.id.clone(),
            config: deployment.config.clone(),
        };
        let launch_params = match self
            .request::<LaunchParamsReply>(GET_LAUNCH_PARAMS, &params)
            .await
        {
            Ok(LaunchParamsReply::Success { launch_params }) => launch_params,
            Ok(LaunchParamsReply::Error { message }) => {
                broker.discard(&run.id, RunCloseReason::LaunchRejected).await;
                return Err(DispatchError::LaunchRejected(message));
            }
            Err(err) => {
                broker.discard(&run.id, RunCloseReason::LaunchFailed).await;
                return Err(DispatchError::LaunchFailed(err.to_string()));
            }
        };

        let execute = RunExecuteParams {
            server_run_id: run.id.clone(),
            source: deployment.source.clone(),
            launch_params,
        };
        if let Err(err) = self.request::<Value>(RUN_EXECUTE, &execute).await {
            broker.discard(&run.id, RunCloseReason::LaunchFailed).await;
            return Err(DispatchError::LaunchFailed(err.to_string()));
        }

        info!(
            runner_id = %self.runner_id,
            run_id = %run.id,
            session_id = %run.session_id,
            "run started"
        );
        Ok(manager)
    }

    async fn request<T: DeserializeOwned>(
        &self,
        name: &str,
        payload: impl Serialize,
    ) -> Result<T, IcError> {
        let result = self.ic.request::<T>(name, payload).await;
        let outcome = match &result {
            Ok(_) => "ok",
            Err(err) => err.code(),
        };
        metrics::IC_REQUESTS.with_label_values(&[name, outcome]).inc();
        result
    }

    /// Tear the connection down. Only the first call does any work.
    pub async fn close(&self, reason: CloseReason) -> CloseOutcome {
        if self.closing.swap(true, Ordering::SeqCst) {
            return CloseOutcome::AlreadyClosed;
        }
        *self.state.lock() = ConnectionState::Closing;
        self.cancel.cancel();

        self.assignments.lock().take();
        let broker = self.broker.lock().take();
        if let Some(broker) = broker {
            broker.stop_all().await;
        }

        if self.deps.registry.remove_if(&self.runner_id, &self.id) {
            if let Err(err) = self.deps.stores.runners.mark_offline(&self.runner_id).await {
                warn!(runner_id = %self.runner_id, error = %err, "failed to mark runner offline");
            }
        }
        self.ic.close();
        let _ = self.outbound.send(WireFrame::Close);

        *self.state.lock() = ConnectionState::Closed;
        self.closed.send_replace(Some(reason));
        metrics::RUNNER_CONNECTIONS.dec();
        metrics::RUNNER_CLOSES.with_label_values(&[reason.label()]).inc();
        info!(
            runner_id = %self.runner_id,
            connection_id = %self.id,
            reason = reason.label(),
            "runner connection closed"
        );
        CloseOutcome::Closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryStore, RunnerStore, StoreError};
    use async_trait::async_trait;
    use chrono::DateTime;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use test_timeout::tokio_timeout_test;

    /// Runner store that counts `touch_runner` calls.
    struct CountingRunners {
        inner: Arc<InMemoryStore>,
        touches: AtomicUsize,
    }

    #[async_trait]
    impl RunnerStore for CountingRunners {
        async fn upsert_runner(&self, runner: Runner) -> Result<(), StoreError> {
            self.inner.upsert_runner(runner).await
        }

        async fn get_runner(&self, id: &str) -> Result<Option<Runner>, StoreError> {
            self.inner.get_runner(id).await
        }

        async fn touch_runner(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
            self.touches.fetch_add(1, Ordering::SeqCst);
            self.inner.touch_runner(id, at).await
        }

        async fn mark_offline(&self, id: &str) -> Result<(), StoreError> {
            self.inner.mark_offline(id).await
        }

        async fn list_runners(&self) -> Result<Vec<Runner>, StoreError> {
            self.inner.list_runners().await
        }
    }

    fn deps(store: Arc<InMemoryStore>) -> RunnerDeps {
        RunnerDeps {
            stores: Stores::in_memory(store),
            registry: RunnerRegistry::default(),
            heartbeat: HeartbeatConfig::default(),
            ic_request_timeout: Duration::from_secs(5),
        }
    }

    fn frame(kind: &str, name: &str, payload: Value) -> String {
        let frame = match kind {
            "request" => json!({"kind": "request", "id": "1", "name": name, "payload": payload}),
            _ => json!({"kind": "notification", "name": name, "payload": payload}),
        };
        frame.to_string()
    }

    async fn next_text(rx: &mut mpsc::UnboundedReceiver<WireFrame>) -> Value {
        loop {
            match rx.recv().await.expect("frame") {
                WireFrame::Text(text) if text == "ping" => continue,
                WireFrame::Text(text) => return serde_json::from_str(&text).unwrap(),
                WireFrame::Close => panic!("connection closed"),
            }
        }
    }

    #[tokio_timeout_test(5)]
    async fn registers_and_becomes_ready() {
        let store = InMemoryStore::new();
        let deps = deps(store.clone());
        let registry = deps.registry.clone();
        let (connection, mut outbound) = RunnerConnection::open("runner_a", deps);
        connection.start();

        connection.receive_text(&frame("notification", "server/ready", Value::Null));
        tokio::task::yield_now().await;
        assert_eq!(connection.state(), ConnectionState::Registering);

        connection.receive_text(&frame(
            "request",
            "server/set_config",
            json!({"tags": ["docker"], "maxConcurrentJobs": 3, "version": "1.4.0"}),
        ));
        let reply = next_text(&mut outbound).await;
        assert_eq!(reply["ok"], true);
        assert_eq!(reply["payload"]["status"], "ok");

        connection.receive_text(&frame("notification", "server/ready", Value::Null));
        while !connection.is_ready() {
            tokio::task::yield_now().await;
        }
        assert!(connection.has_tag("docker"));
        assert_eq!(connection.capacity(), 3);
        assert!(registry.get("runner_a").is_some());
        let runner = store.get_runner("runner_a").await.unwrap().unwrap();
        assert_eq!(runner.state, RunnerState::Online);
        assert_eq!(runner.version.as_deref(), Some("1.4.0"));

        assert_eq!(connection.close(CloseReason::SocketClosed).await, CloseOutcome::Closed);
        let runner = store.get_runner("runner_a").await.unwrap().unwrap();
        assert_eq!(runner.state, RunnerState::Offline);
        assert!(registry.get("runner_a").is_none());
    }

    #[tokio_timeout_test(5)]
    async fn answers_runner_ping() {
        let store = InMemoryStore::new();
        let (connection, mut outbound) = RunnerConnection::open("runner_b", deps(store));
        connection.receive_text("ping");
        assert_eq!(outbound.recv().await, Some(WireFrame::Text("pong".into())));
        connection.close(CloseReason::Shutdown).await;
        assert_eq!(outbound.recv().await, Some(WireFrame::Close));
    }

    #[tokio_timeout_test(5)]
    async fn invalid_set_config_is_rejected() {
        let store = InMemoryStore::new();
        let (connection, mut outbound) = RunnerConnection::open("runner_c", deps(store.clone()));
        connection.start();
        connection.receive_text(&frame("request", "server/set_config", json!({"tags": "docker"})));
        let reply = next_text(&mut outbound).await;
        assert_eq!(reply["ok"], false);
        assert_eq!(reply["error"]["code"], "invalid_payload");
        assert!(store.get_runner("runner_c").await.unwrap().is_none());
        connection.close(CloseReason::Shutdown).await;
    }

    #[tokio_timeout_test(5)]
    async fn newer_connection_supersedes_older() {
        let store = InMemoryStore::new();
        let deps = deps(store.clone());
        let registry = deps.registry.clone();
        let config = json!({"tags": ["docker"], "maxConcurrentJobs": 1});

        let (first, mut first_out) = RunnerConnection::open("runner_d", deps.clone());
        first.start();
        first.receive_text(&frame("request", "server/set_config", config.clone()));
        next_text(&mut first_out).await;

        let (second, mut second_out) = RunnerConnection::open("runner_d", deps);
        second.start();
        second.receive_text(&frame("request", "server/set_config", config));
        next_text(&mut second_out).await;

        assert_eq!(first.closed().await, Some(CloseReason::Superseded));
        let live = registry.get("runner_d").expect("registered");
        assert_eq!(live.connection_id(), second.connection_id());
        // The superseded close must not flip the runner offline.
        let runner = store.get_runner("runner_d").await.unwrap().unwrap();
        assert_eq!(runner.state, RunnerState::Online);
        second.close(CloseReason::Shutdown).await;
    }

    #[tokio_timeout_test(5, paused)]
    async fn pong_receipt_is_persisted_at_most_once_per_interval() {
        let store = InMemoryStore::new();
        let counting = Arc::new(CountingRunners {
            inner: store.clone(),
            touches: AtomicUsize::new(0),
        });
        let runners: Arc<dyn RunnerStore> = counting.clone();
        let mut deps = deps(store.clone());
        deps.stores.runners = runners;
        let (connection, mut outbound) = RunnerConnection::open("runner_e", deps);
        connection.receive_text(&frame(
            "request",
            "server/set_config",
            json!({"tags": ["docker"], "maxConcurrentJobs": 1}),
        ));
        next_text(&mut outbound).await;
        let registered = store.get_runner("runner_e").await.unwrap().unwrap().last_seen_at;

        async fn pong_at(connection: &RunnerConnection, after: Duration) {
            tokio::time::advance(after).await;
            connection.receive_text("pong");
            for _ in 0..4 {
                tokio::task::yield_now().await;
            }
        }

        // Pongs inside the first minute are not written.
        pong_at(&connection, Duration::from_secs(7)).await;
        pong_at(&connection, Duration::from_secs(30)).await;
        assert_eq!(counting.touches.load(Ordering::SeqCst), 0);

        pong_at(&connection, Duration::from_secs(24)).await;
        assert_eq!(counting.touches.load(Ordering::SeqCst), 1);
        pong_at(&connection, Duration::from_secs(7)).await;
        pong_at(&connection, Duration::from_secs(40)).await;
        assert_eq!(counting.touches.load(Ordering::SeqCst), 1);

        pong_at(&connection, Duration::from_secs(14)).await;
        assert_eq!(counting.touches.load(Ordering::SeqCst), 2);
        let runner = store.get_runner("runner_e").await.unwrap().unwrap();
        assert!(runner.last_seen_at >= registered);
        connection.close(CloseReason::Shutdown).await;
    }
}

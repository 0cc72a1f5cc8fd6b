use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use futures::stream::{self, Stream};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use super::TransportGuard;
use crate::broker::{BrokerError, BrokerRunManager, PendingResponses};
use crate::dispatch::{DispatchError, Dispatcher};
use crate::mcp;
use crate::model::{ServerDeployment, ServerInstance, Session};
use crate::store::Stores;

const EVENT_CAPACITY: usize = 1024;
const HISTORY_LEN: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A message from the server, numbered for `Last-Event-ID` replay.
    Message { event_id: u64, message: Value },
    /// A `metorial/debug` notification.
    Debug(Value),
    /// The subscriber fell behind and `skipped` events were lost. Always the
    /// last event of a subscription.
    Lagged { skipped: u64 },
    Closed,
}

#[derive(Clone)]
pub struct SessionDeps {
    pub stores: Stores,
    pub dispatcher: Arc<Dispatcher>,
}

/// Client messages waiting for the forwarder, in arrival order.
enum Outbound {
    Forward(Vec<Value>),
    Exchange {
        messages: Vec<Value>,
        started: oneshot::Sender<Result<PendingResponses, Rejection>>,
    },
}

/// Why a batch never reached the runner.
struct Rejection {
    code: &'static str,
    reason: String,
}

impl From<DispatchError> for Rejection {
    fn from(err: DispatchError) -> Self {
        Self {
            code: err.code(),
            reason: err.to_string(),
        }
    }
}

impl From<BrokerError> for Rejection {
    fn from(err: BrokerError) -> Self {
        Self {
            code: RUNNER_SEND_FAILED,
            reason: err.to_string(),
        }
    }
}

/// Session-level relay between any number of client transports and the
/// session's current server run.
pub struct SessionConnection {
    session: RwLock<Session>,
    instance: ServerInstance,
    deployment: ServerDeployment,
    deps: SessionDeps,
    events: broadcast::Sender<SessionEvent>,
    history: Mutex<VecDeque<(u64, Value)>>,
    next_event_id: AtomicU64,
    outbound: mpsc::UnboundedSender<Outbound>,
    run: Mutex<Option<BrokerRunManager>>,
    dispatching: tokio::sync::Mutex<()>,
    stopped: AtomicBool,
    closed: watch::Sender<bool>,
    pub(super) transports: AtomicUsize,
    pub(super) idle_epoch: AtomicU64,
}

impl SessionConnection {
    pub fn new(
        session: Session,
        instance: ServerInstance,
        deployment: ServerDeployment,
        deps: SessionDeps,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (closed, _) = watch::channel(false);
        let (outbound, queue) = mpsc::unbounded_channel();
        let connection = Arc::new(Self {
            session: RwLock::new(session),
            instance,
            deployment,
            deps,
            events,
            history: Mutex::new(VecDeque::with_capacity(HISTORY_LEN)),
            next_event_id: AtomicU64::new(1),
            outbound,
            run: Mutex::new(None),
            dispatching: tokio::sync::Mutex::new(()),
            stopped: AtomicBool::new(false),
            closed,
            transports: AtomicUsize::new(0),
            idle_epoch: AtomicU64::new(0),
        });
        tokio::spawn(forward_outbound(Arc::downgrade(&connection), queue));
        connection
    }

    pub fn session(&self) -> Session {
        self.session.read().clone()
    }

    pub fn session_id(&self) -> String {
        self.session.read().id.clone()
    }

    pub fn instance(&self) -> &ServerInstance {
        &self.instance
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self, include_debug: bool) -> SessionSubscription {
        SessionSubscription {
            receiver: self.events.subscribe(),
            include_debug,
            finished: false,
            _transport: None,
        }
    }

    /// Buffered messages newer than `last_event_id`, oldest first.
    pub fn replay_after(&self, last_event_id: u64) -> Vec<(u64, Value)> {
        self.history
            .lock()
            .iter()
            .filter(|(id, _)| *id > last_event_id)
            .cloned()
            .collect()
    }

    pub fn debug(&self, kind: &str, extra: Value) {
        let _ = self
            .events
            .send(SessionEvent::Debug(mcp::debug_notification(kind, extra)));
    }

    fn publish(&self, message: Value) -> u64 {
        let event_id = self.next_event_id.fetch_add(1, Ordering::SeqCst);
        {
            let mut history = self.history.lock();
            if history.len() == HISTORY_LEN {
                history.pop_front();
            }
            history.push_back((event_id, message.clone()));
        }
        let _ = self.events.send(SessionEvent::Message { event_id, message });
        event_id
    }

    fn live_run(&self) -> Option<BrokerRunManager> {
        self.run
            .lock()
            .as_ref()
            .filter(|run| !run.is_closed())
            .cloned()
    }

    /// Current run, dispatching a new one if there is none or it closed.
    pub async fn ensure_run(self: &Arc<Self>) -> Result<BrokerRunManager, DispatchError> {
        if self.is_stopped() {
            return Err(DispatchError::Abandoned);
        }
        if let Some(run) = self.live_run() {
            return Ok(run);
        }
        let _dispatching = self.dispatching.lock().await;
        if let Some(run) = self.live_run() {
            return Ok(run);
        }
        if self.is_stopped() {
            return Err(DispatchError::Abandoned);
        }

        let session = self.session();
        let run = self
            .deps
            .dispatcher
            .dispatch(&session, &self.deployment)
            .await?;
        {
            // stop() flips the flag before it takes the slot, so either it
            // sees this run or this sees the flag.
            let mut current = self.run.lock();
            if !self.is_stopped() {
                *current = Some(run.clone());
            }
        }
        if self.is_stopped() {
            run.close().await;
            return Err(DispatchError::Abandoned);
        }
        info!(
            session_id = %session.id,
            run_id = %run.server_run_id(),
            runner_id = %run.runner_id(),
            "session attached to run"
        );
        self.debug(
            "run_started",
            json!({"serverRunId": run.server_run_id(), "runnerId": run.runner_id()}),
        );
        self.spawn_run_reader(run.clone());
        Ok(run)
    }

    fn spawn_run_reader(self: &Arc<Self>, run: BrokerRunManager) {
        let connection = Arc::clone(self);
        let mut messages = run.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    next = messages.recv() => match next {
                        Some(message) => {
                            connection.publish(message);
                        }
                        None => break,
                    },
                    reason = run.wait_for_close() => {
                        // Flush what the runner sent before closing.
                        while let Ok(message) = messages.try_recv() {
                            connection.publish(message);
                        }
                        debug!(run_id = %run.server_run_id(), reason = reason.label(), "run closed");
                        connection.debug(
                            "run_closed",
                            json!({"serverRunId": run.server_run_id(), "reason": reason.label()}),
                        );
                        break;
                    }
                }
            }
        });
    }

    /// Store the protocol version of a first `initialize`.
    pub async fn capture_protocol_version(&self, messages: &[Value]) {
        if self.session.read().mcp_version.is_some() {
            return;
        }
        let Some(version) = messages.iter().find_map(mcp::initialize_protocol_version) else {
            return;
        };
        let session_id = self.session_id();
        match self
            .deps
            .stores
            .sessions
            .set_mcp_version(&session_id, version)
            .await
        {
            Ok(version) => self.session.write().mcp_version = Some(version),
            Err(err) => warn!(session_id = %session_id, error = %err, "failed to store protocol version"),
        }
    }

    /// Queue messages for the runner without waiting for replies. Messages
    /// reach the runner in the order they were queued; failures surface as
    /// gateway errors on the session stream.
    pub async fn send_messages(&self, messages: Vec<Value>) {
        self.capture_protocol_version(&messages).await;
        self.enqueue(Outbound::Forward(messages));
    }

    /// Queue a batch and hand every reply to `on_message`. Requests that
    /// cannot be answered get a gateway error instead.
    pub async fn send_messages_and_wait<F>(&self, messages: Vec<Value>, mut on_message: F)
    where
        F: FnMut(Value),
    {
        self.capture_protocol_version(&messages).await;
        let requests: Vec<Value> = messages
            .iter()
            .filter(|m| mcp::is_request(m))
            .map(|m| m["id"].clone())
            .collect();

        let (started, exchange) = oneshot::channel();
        self.enqueue(Outbound::Exchange { messages, started });
        let pending = match exchange.await {
            Ok(Ok(pending)) => pending,
            Ok(Err(rejection)) => {
                warn!(session_id = %self.session_id(), code = rejection.code, error = %rejection.reason, "batch not forwarded");
                for id in requests {
                    on_message(mcp::gateway_error(id, rejection.code, rejection.reason.clone()));
                }
                return;
            }
            Err(_) => {
                for id in requests {
                    on_message(mcp::gateway_error(
                        id,
                        DispatchError::Abandoned.code(),
                        "session relay stopped",
                    ));
                }
                return;
            }
        };

        match pending.wait(|reply| on_message(reply)).await {
            Ok(()) => {}
            Err(BrokerError::RunClosed { reason, pending }) => {
                for key in pending {
                    let id = serde_json::from_str(&key).unwrap_or(Value::Null);
                    on_message(mcp::gateway_error(
                        id,
                        "run_closed",
                        format!("server run closed ({}) before replying", reason.label()),
                    ));
                }
            }
            Err(err) => {
                for id in requests {
                    on_message(mcp::gateway_error(id, RUNNER_SEND_FAILED, err.to_string()));
                }
            }
        }
    }

    fn enqueue(&self, outbound: Outbound) {
        if self.outbound.send(outbound).is_err() {
            debug!(session_id = %self.session_id(), "outbound queue closed");
        }
    }

    /// Send one queued batch. Runs on the forwarder task only.
    async fn forward(self: &Arc<Self>, outbound: Outbound) {
        match outbound {
            Outbound::Forward(messages) => {
                let sent = match self.ensure_run().await {
                    Ok(run) => run.send_messages(&messages).map_err(Rejection::from),
                    Err(err) => Err(Rejection::from(err)),
                };
                if let Err(rejection) = sent {
                    warn!(session_id = %self.session_id(), code = rejection.code, error = %rejection.reason, "failed to forward messages");
                    for id in messages.iter().filter(|m| mcp::is_request(m)).map(|m| m["id"].clone()) {
                        self.publish(mcp::gateway_error(id, rejection.code, rejection.reason.clone()));
                    }
                }
            }
            Outbound::Exchange { messages, started } => {
                let exchange = match self.ensure_run().await {
                    Ok(run) => run.start_exchange(&messages).map_err(Rejection::from),
                    Err(err) => Err(Rejection::from(err)),
                };
                let _ = started.send(exchange);
            }
        }
    }

    /// Stop relaying and close the current run. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.events.send(SessionEvent::Closed);
        self.closed.send_replace(true);
        // A dispatch still in flight sees the flag and closes its own run.
        let run = self.run.lock().take();
        if let Some(run) = run {
            run.close().await;
        }
        info!(session_id = %self.session_id(), "session relay stopped");
    }

    pub async fn wait_for_close(&self) {
        let mut closed = self.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }
}

/// Drains the relay's outbound queue one batch at a time.
async fn forward_outbound(connection: Weak<SessionConnection>, mut queue: mpsc::UnboundedReceiver<Outbound>) {
    while let Some(outbound) = queue.recv().await {
        let Some(connection) = connection.upgrade() else {
            break;
        };
        connection.forward(outbound).await;
    }
}

const RUNNER_SEND_FAILED: &str = "runner_send_failed";

/// One transport's view of the session stream.
pub struct SessionSubscription {
    receiver: broadcast::Receiver<SessionEvent>,
    include_debug: bool,
    finished: bool,
    _transport: Option<TransportGuard>,
}

impl SessionSubscription {
    pub(super) fn attached(mut self, transport: TransportGuard) -> Self {
        self._transport = Some(transport);
        self
    }

    /// Next event this subscriber should see. `None` once the session
    /// closed or after a [`SessionEvent::Lagged`].
    pub async fn next(&mut self) -> Option<SessionEvent> {
        if self.finished {
            return None;
        }
        loop {
            match self.receiver.recv().await {
                Ok(SessionEvent::Closed) | Err(broadcast::error::RecvError::Closed) => {
                    self.finished = true;
                    return None;
                }
                Ok(SessionEvent::Debug(_)) if !self.include_debug => continue,
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "session subscriber lagged; ending its stream");
                    self.finished = true;
                    return Some(SessionEvent::Lagged { skipped });
                }
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = SessionEvent> + Send + 'static {
        stream::unfold(self, |mut subscription| async move {
            subscription.next().await.map(|event| (event, subscription))
        })
    }
}

/// Structured error telling a subscriber it missed `skipped` events.
pub fn lagged_error(skipped: u64) -> Value {
    mcp::gateway_error(
        Value::Null,
        "stream_lagged",
        format!("{skipped} message(s) were dropped; reconnect to resume"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{RunCloseReason, RunnerBrokerManager};
    use crate::config::DispatchConfig;
    use crate::dispatch::queue::InMemoryJobQueue;
    use crate::model::{Actor, LaunchSource, NewServerRun};
    use crate::store::{InMemoryStore, RunCreation, ServerRunStore, SessionStore};
    use interconnect::Endpoint;
    use std::time::Duration;
    use test_timeout::tokio_timeout_test;

    fn connection(wait: Duration) -> (Arc<SessionConnection>, Arc<InMemoryStore>) {
        let store = InMemoryStore::new();
        let config = DispatchConfig {
            wait_timeout: wait,
            ..DispatchConfig::default()
        };
        let dispatcher = Dispatcher::new(Arc::new(InMemoryJobQueue::new()), &config);
        let actor = Actor {
            organization_id: "org-1".into(),
            actor_id: "key_1".into(),
        };
        let session = Session::new(&actor, "inst-1");
        let instance = ServerInstance {
            id: "inst-1".into(),
            server_id: "srv-1".into(),
            organization_id: "org-1".into(),
            server_deployment_id: "dep-1".into(),
        };
        let deployment = ServerDeployment {
            id: "dep-1".into(),
            server_id: "srv-1".into(),
            server_version_id: "ver-1".into(),
            source: LaunchSource::Docker {
                image: "ghcr.io/acme/server".into(),
                tag: "1".into(),
            },
            config: json!({}),
        };
        let deps = SessionDeps {
            stores: Stores::in_memory(store.clone()),
            dispatcher,
        };
        (SessionConnection::new(session, instance, deployment, deps), store)
    }

    #[tokio::test(start_paused = true)]
    async fn undispatchable_requests_get_gateway_errors() {
        let (connection, _) = connection(Duration::from_secs(1));
        let mut replies = Vec::new();
        connection
            .send_messages_and_wait(
                vec![
                    json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}),
                    json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
                ],
                |reply| replies.push(reply),
            )
            .await;
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0]["id"], 1);
        assert_eq!(replies[0]["error"]["code"], mcp::SERVER_ERROR);
        assert_eq!(replies[0]["error"]["data"]["code"], "dispatch_timeout");
    }

    #[tokio_timeout_test(5)]
    async fn debug_events_only_reach_debug_subscribers() {
        let (connection, _) = connection(Duration::from_secs(1));
        let mut plain = connection.subscribe(false);
        let mut verbose = connection.subscribe(true);

        connection.debug("init", json!({}));
        connection.publish(json!({"jsonrpc": "2.0", "method": "notifications/message"}));

        assert!(matches!(verbose.next().await, Some(SessionEvent::Debug(_))));
        assert!(matches!(
            verbose.next().await,
            Some(SessionEvent::Message { event_id: 1, .. })
        ));
        assert!(matches!(
            plain.next().await,
            Some(SessionEvent::Message { event_id: 1, .. })
        ));

        connection.stop().await;
        assert_eq!(plain.next().await, None);
        connection.wait_for_close().await;
    }

    #[tokio_timeout_test(5)]
    async fn replay_keeps_the_latest_events() {
        let (connection, _) = connection(Duration::from_secs(1));
        for n in 0..(HISTORY_LEN + 4) {
            connection.publish(json!({"jsonrpc": "2.0", "method": "tick", "params": {"n": n}}));
        }
        let all = connection.replay_after(0);
        assert_eq!(all.len(), HISTORY_LEN);
        assert_eq!(all[0].0, 5);
        let tail = connection.replay_after((HISTORY_LEN + 2) as u64);
        assert_eq!(tail.len(), 2);
    }

    #[tokio_timeout_test(5)]
    async fn initialize_stores_protocol_version() {
        let (connection, store) = connection(Duration::from_secs(1));
        store.create_session(connection.session()).await.unwrap();
        connection
            .capture_protocol_version(&[json!({
                "jsonrpc": "2.0",
                "id": 0,
                "method": "initialize",
                "params": {"protocolVersion": "2024-11-05"}
            })])
            .await;
        assert_eq!(connection.session().mcp_version.as_deref(), Some("2024-11-05"));
        let stored = store.get_session(&connection.session_id()).await.unwrap().unwrap();
        assert_eq!(stored.mcp_version.as_deref(), Some("2024-11-05"));
    }

    #[tokio_timeout_test(5)]
    async fn lagging_subscriber_is_told_and_ended() {
        let (connection, _) = connection(Duration::from_secs(1));
        let mut subscription = connection.subscribe(false);
        for n in 0..(EVENT_CAPACITY + 5) {
            connection.publish(json!({"jsonrpc": "2.0", "id": n, "result": {}}));
        }
        assert_eq!(
            subscription.next().await,
            Some(SessionEvent::Lagged { skipped: 5 })
        );
        assert_eq!(subscription.next().await, None);

        let error = lagged_error(5);
        assert_eq!(error["error"]["data"]["code"], "stream_lagged");
        assert!(error["id"].is_null());
    }

    #[tokio_timeout_test(5)]
    async fn stop_closes_the_run_while_a_dispatch_is_in_flight() {
        let (connection, store) = connection(Duration::from_secs(1));
        let (ic_tx, _ic_rx) = tokio::sync::mpsc::unbounded_channel();
        let ic = Arc::new(Endpoint::<()>::new()).connect((), ic_tx);
        let broker = RunnerBrokerManager::new("runner_s", ic, store.clone());
        let run = match store
            .create_for_session(NewServerRun {
                session_id: connection.session_id(),
                server_deployment_id: "dep-1".into(),
                runner_id: "runner_s".into(),
            })
            .await
            .unwrap()
        {
            RunCreation::Created(run) | RunCreation::Existing(run) => run,
        };
        let manager = broker.create(&run).unwrap();
        *connection.run.lock() = Some(manager.clone());

        let live = connection.ensure_run().await.unwrap();
        assert_eq!(live.server_run_id(), run.id);

        let dispatching = connection.dispatching.lock().await;
        connection.stop().await;
        assert_eq!(manager.close_reason(), Some(RunCloseReason::Stopped));
        drop(dispatching);
        assert_eq!(connection.ensure_run().await.unwrap_err(), DispatchError::Abandoned);
    }
}

//! Per-runner registry of in-flight server runs.
//!
//! A [`RunnerBrokerManager`] lives exactly as long as one ready runner
//! connection. Each run it hosts gets a [`RunHandle`]: an unbounded fan-out of
//! the messages the runner emits for that run, a table of request ids some
//! caller is waiting on, and a close signal that is set exactly once.
//! Client-facing code holds a [`BrokerRunManager`] to talk to one run.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use interconnect::{IcError, IcSession};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::mcp;
use crate::metrics;
use crate::model::{RunStatus, ServerRun};
use crate::store::ServerRunStore;

pub const RUN_MESSAGE: &str = "run/mcp/message";
pub const RUN_CLOSE: &str = "run/close";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunCloseReason {
    /// The runner reported `run/closed`.
    Closed,
    /// The runner reported `run/error`.
    Errored,
    /// The runner connection went away with the run still open.
    RunnerDisconnected,
    /// The gateway closed the run.
    Stopped,
    /// The runner refused to produce launch parameters.
    LaunchRejected,
    /// The run never got past launch.
    LaunchFailed,
}

impl RunCloseReason {
    pub fn label(self) -> &'static str {
        match self {
            RunCloseReason::Closed => "closed",
            RunCloseReason::Errored => "run_error",
            RunCloseReason::RunnerDisconnected => "runner_disconnected",
            RunCloseReason::Stopped => "stopped",
            RunCloseReason::LaunchRejected => "launch_params_rejected",
            RunCloseReason::LaunchFailed => "run_launch_failed",
        }
    }

    fn run_status(self) -> RunStatus {
        match self {
            RunCloseReason::Closed | RunCloseReason::Stopped => RunStatus::Closed,
            RunCloseReason::Errored
            | RunCloseReason::RunnerDisconnected
            | RunCloseReason::LaunchRejected
            | RunCloseReason::LaunchFailed => RunStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BrokerError {
    #[error("broker for runner {0} is stopped")]
    Stopped(String),
    #[error("run {0} is already registered")]
    Duplicate(String),
    #[error("run closed ({}) with {} request(s) unanswered", reason.label(), pending.len())]
    RunClosed {
        reason: RunCloseReason,
        pending: Vec<String>,
    },
    #[error(transparent)]
    Interconnect(#[from] IcError),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RunMessagePayload<'a> {
    server_run_id: &'a str,
    message: &'a Value,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RunClosePayload<'a> {
    server_run_id: &'a str,
}

struct RunHandle {
    run_id: String,
    session_id: String,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Value>>>,
    /// Receiver created with the handle so nothing emitted before the first
    /// subscriber attaches is lost.
    first_receiver: Mutex<Option<mpsc::UnboundedReceiver<Value>>>,
    claims: Mutex<HashMap<String, mpsc::UnboundedSender<Value>>>,
    closed: watch::Sender<Option<RunCloseReason>>,
}

impl RunHandle {
    fn new(run: &ServerRun) -> Self {
        let (first_tx, first) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(None);
        Self {
            run_id: run.id.clone(),
            session_id: run.session_id.clone(),
            subscribers: Mutex::new(vec![first_tx]),
            first_receiver: Mutex::new(Some(first)),
            claims: Mutex::new(HashMap::new()),
            closed,
        }
    }

    fn deliver(&self, message: Value) {
        if let Some(key) = mcp::response_id_key(&message) {
            let waiter = self.claims.lock().get(&key).cloned();
            if let Some(waiter) = waiter {
                if waiter.send(message.clone()).is_ok() {
                    return;
                }
            }
        }
        self.subscribers
            .lock()
            .retain(|subscriber| subscriber.send(message.clone()).is_ok());
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<Value> {
        if let Some(first) = self.first_receiver.lock().take() {
            return first;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Set the close reason. Only the first call wins.
    fn close(&self, reason: RunCloseReason) -> bool {
        self.closed.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        })
    }

    fn close_reason(&self) -> Option<RunCloseReason> {
        *self.closed.borrow()
    }
}

pub struct RunnerBrokerManager {
    runner_id: String,
    ic: IcSession,
    runs: Arc<dyn ServerRunStore>,
    handles: DashMap<String, Arc<RunHandle>>,
    stopped: AtomicBool,
}

impl RunnerBrokerManager {
    pub fn new(runner_id: impl Into<String>, ic: IcSession, runs: Arc<dyn ServerRunStore>) -> Arc<Self> {
        Arc::new(Self {
            runner_id: runner_id.into(),
            ic,
            runs,
            handles: DashMap::new(),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn runner_id(&self) -> &str {
        &self.runner_id
    }

    pub fn create(self: &Arc<Self>, run: &ServerRun) -> Result<BrokerRunManager, BrokerError> {
        if self.is_stopped() {
            return Err(BrokerError::Stopped(self.runner_id.clone()));
        }
        let handle = match self.handles.entry(run.id.clone()) {
            Entry::Occupied(_) => return Err(BrokerError::Duplicate(run.id.clone())),
            Entry::Vacant(slot) => {
                let handle = Arc::new(RunHandle::new(run));
                slot.insert(Arc::clone(&handle));
                handle
            }
        };
        // stop_all flips the flag before draining; re-check so a handle
        // inserted concurrently cannot outlive the manager.
        if self.is_stopped() {
            self.handles.remove_if(&run.id, |_, h| Arc::ptr_eq(h, &handle));
            return Err(BrokerError::Stopped(self.runner_id.clone()));
        }
        self.refresh_gauge();
        debug!(runner_id = %self.runner_id, run_id = %run.id, "run registered");
        Ok(BrokerRunManager {
            handle,
            broker: Arc::clone(self),
        })
    }

    pub fn run(self: &Arc<Self>, run_id: &str) -> Option<BrokerRunManager> {
        let handle = self.handles.get(run_id).map(|h| Arc::clone(h.value()))?;
        Some(BrokerRunManager {
            handle,
            broker: Arc::clone(self),
        })
    }

    /// Deliver a runner message to its run. Unknown runs are dropped.
    pub fn handle_message(&self, run_id: &str, message: Value) {
        let handle = self.handles.get(run_id).map(|h| Arc::clone(h.value()));
        match handle {
            Some(handle) => handle.deliver(message),
            None => {
                metrics::BROKER_DROPPED.inc();
                debug!(runner_id = %self.runner_id, run_id, "dropping message for unknown run");
            }
        }
    }

    pub async fn handle_closed(&self, run_id: &str) {
        self.finish(run_id, RunCloseReason::Closed).await;
    }

    pub async fn handle_error(&self, run_id: &str) {
        self.finish(run_id, RunCloseReason::Errored).await;
    }

    /// Drop a run whose launch failed before `run/execute` succeeded.
    pub async fn discard(&self, run_id: &str, reason: RunCloseReason) {
        self.finish(run_id, reason).await;
    }

    /// Ask the runner to stop the run, then close it locally.
    pub async fn close_run(&self, run_id: &str) {
        if !self.handles.contains_key(run_id) {
            return;
        }
        if let Err(err) = self.ic.notify(
            RUN_CLOSE,
            RunClosePayload {
                server_run_id: run_id,
            },
        ) {
            debug!(run_id, error = %err, "run/close not delivered");
        }
        self.finish(run_id, RunCloseReason::Stopped).await;
    }

    /// Force-close every run. Later [`create`](Self::create) calls fail.
    pub async fn stop_all(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let run_ids: Vec<String> = self.handles.iter().map(|h| h.key().clone()).collect();
        if !run_ids.is_empty() {
            info!(
                runner_id = %self.runner_id,
                runs = run_ids.len(),
                "failing runs of disconnected runner"
            );
        }
        for run_id in run_ids {
            self.finish(&run_id, RunCloseReason::RunnerDisconnected).await;
        }
        metrics::ACTIVE_RUNS
            .remove_label_values(&[self.runner_id.as_str()])
            .ok();
    }

    pub fn active_runs(&self) -> usize {
        self.handles.len()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn session_for_run(&self, run_id: &str) -> Option<String> {
        self.handles.get(run_id).map(|h| h.session_id.clone())
    }

    async fn finish(&self, run_id: &str, reason: RunCloseReason) {
        let Some((_, handle)) = self.handles.remove(run_id) else {
            return;
        };
        if !self.is_stopped() {
            self.refresh_gauge();
        }
        if !handle.close(reason) {
            return;
        }
        debug!(run_id, reason = reason.label(), "run finished");
        if let Err(err) = self
            .runs
            .finish_run(run_id, reason.run_status(), Some(reason.label()))
            .await
        {
            warn!(run_id, error = %err, "failed to persist run status");
        }
    }

    fn refresh_gauge(&self) {
        metrics::ACTIVE_RUNS
            .with_label_values(&[self.runner_id.as_str()])
            .set(self.handles.len() as i64);
    }
}

/// Client-side handle to one run hosted by a [`RunnerBrokerManager`].
#[derive(Clone)]
pub struct BrokerRunManager {
    handle: Arc<RunHandle>,
    broker: Arc<RunnerBrokerManager>,
}

impl std::fmt::Debug for BrokerRunManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerRunManager")
            .field("server_run_id", &self.handle.run_id)
            .field("runner_id", &self.broker.runner_id)
            .field("closed", &self.handle.close_reason())
            .finish()
    }
}

impl BrokerRunManager {
    pub fn server_run_id(&self) -> &str {
        &self.handle.run_id
    }

    pub fn runner_id(&self) -> &str {
        self.broker.runner_id()
    }

    /// Messages the runner emits for this run that nobody claimed. The first
    /// subscriber also gets everything emitted before it attached.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Value> {
        self.handle.subscribe()
    }

    pub fn send_messages(&self, messages: &[Value]) -> Result<(), BrokerError> {
        if let Some(reason) = self.handle.close_reason() {
            return Err(BrokerError::RunClosed {
                reason,
                pending: Vec::new(),
            });
        }
        for message in messages {
            self.broker.ic.notify(
                RUN_MESSAGE,
                RunMessagePayload {
                    server_run_id: &self.handle.run_id,
                    message,
                },
            )?;
        }
        Ok(())
    }

    /// Send a batch and resolve once every request in it has been answered.
    /// Answers are handed to `on_message` and never reach the subscribers.
    pub async fn send_messages_and_wait_for_response<F>(
        &self,
        messages: &[Value],
        on_message: F,
    ) -> Result<(), BrokerError>
    where
        F: FnMut(Value),
    {
        self.start_exchange(messages)?.wait(on_message).await
    }

    /// Claim the request ids of `messages`, then send them. The returned
    /// [`PendingResponses`] collects the answers.
    pub fn start_exchange(&self, messages: &[Value]) -> Result<PendingResponses, BrokerError> {
        let pending: HashSet<String> = messages.iter().filter_map(mcp::request_id_key).collect();
        let (tx, answers) = mpsc::unbounded_channel();
        let claims = ClaimGuard::new(Arc::clone(&self.handle), &pending, tx);
        let closed = self.handle.closed.subscribe();
        self.send_messages(messages)?;
        Ok(PendingResponses {
            pending,
            answers,
            closed,
            _claims: claims,
        })
    }

    pub async fn wait_for_close(&self) -> RunCloseReason {
        let mut closed = self.handle.closed.subscribe();
        let reason = closed.wait_for(Option::is_some).await;
        reason
            .ok()
            .and_then(|r| *r)
            .unwrap_or(RunCloseReason::RunnerDisconnected)
    }

    pub fn is_closed(&self) -> bool {
        self.handle.close_reason().is_some()
    }

    pub fn close_reason(&self) -> Option<RunCloseReason> {
        self.handle.close_reason()
    }

    pub async fn close(&self) {
        self.broker.close_run(&self.handle.run_id).await;
    }
}

/// Requests of one exchange that still wait for an answer.
pub struct PendingResponses {
    pending: HashSet<String>,
    answers: mpsc::UnboundedReceiver<Value>,
    closed: watch::Receiver<Option<RunCloseReason>>,
    _claims: ClaimGuard,
}

impl PendingResponses {
    pub async fn wait<F>(mut self, mut on_message: F) -> Result<(), BrokerError>
    where
        F: FnMut(Value),
    {
        while !self.pending.is_empty() {
            tokio::select! {
                biased;
                Some(message) = self.answers.recv() => {
                    if let Some(key) = mcp::response_id_key(&message) {
                        self.pending.remove(&key);
                    }
                    on_message(message);
                }
                reason = self.closed.wait_for(Option::is_some) => {
                    let reason = reason
                        .ok()
                        .and_then(|r| *r)
                        .unwrap_or(RunCloseReason::RunnerDisconnected);
                    let mut pending: Vec<String> = self.pending.drain().collect();
                    pending.sort();
                    return Err(BrokerError::RunClosed { reason, pending });
                }
            }
        }
        Ok(())
    }
}

/// Registers response claims for the lifetime of one exchange.
struct ClaimGuard {
    handle: Arc<RunHandle>,
    keys: Vec<String>,
}

impl ClaimGuard {
    fn new(
        handle: Arc<RunHandle>,
        keys: &HashSet<String>,
        waiter: mpsc::UnboundedSender<Value>,
    ) -> Self {
        {
            let mut claims = handle.claims.lock();
            for key in keys {
                claims.insert(key.clone(), waiter.clone());
            }
        }
        Self {
            handle,
            keys: keys.iter().cloned().collect(),
        }
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        let mut claims = self.handle.claims.lock();
        for key in &self.keys {
            claims.remove(key);
        }
    }
}

#![allow(dead_code)]

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use interconnect::{Endpoint, HandlerError, IcSession};
use mcp_gateway::auth::StaticKeyAuthenticator;
use mcp_gateway::config::{ApiKey, GatewayConfig};
use mcp_gateway::dispatch::processor::{spawn_workers, JobProcessor};
use mcp_gateway::dispatch::queue::InMemoryJobQueue;
use mcp_gateway::model::{LaunchSource, ServerDeployment, ServerInstance};
use mcp_gateway::routes;
use mcp_gateway::state::AppState;
use mcp_gateway::store::{InMemoryStore, Stores};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

pub const API_TOKEN: &str = "tok-org-1";
pub const OTHER_ORG_TOKEN: &str = "tok-org-2";
pub const RUNNER_KEY: &str = "rk-test";
pub const INSTANCE: &str = "inst-1";
pub const SIBLING_INSTANCE: &str = "inst-2";
pub const FOREIGN_INSTANCE: &str = "inst-foreign";

pub fn config() -> GatewayConfig {
    GatewayConfig {
        api_keys: vec![
            ApiKey {
                token: API_TOKEN.into(),
                organization_id: "org-1".into(),
            },
            ApiKey {
                token: OTHER_ORG_TOKEN.into(),
                organization_id: "org-2".into(),
            },
        ],
        runner_keys: HashSet::from([RUNNER_KEY.to_string()]),
        ..GatewayConfig::default()
    }
}

/// App state over an in-memory store holding two org-1 instances and one
/// instance of another organization, all on a docker deployment.
pub async fn test_state() -> (AppState, Arc<InMemoryStore>) {
    test_state_with(config()).await
}

pub async fn test_state_with(config: GatewayConfig) -> (AppState, Arc<InMemoryStore>) {
    let store = InMemoryStore::new();
    store
        .insert_deployment(ServerDeployment {
            id: "dep-docker".into(),
            server_id: "srv-1".into(),
            server_version_id: "ver-1".into(),
            source: LaunchSource::Docker {
                image: "ghcr.io/acme/echo".into(),
                tag: "1.0.0".into(),
            },
            config: json!({"greeting": "hello"}),
        })
        .await;
    for (id, organization) in [
        (INSTANCE, "org-1"),
        (SIBLING_INSTANCE, "org-1"),
        (FOREIGN_INSTANCE, "org-9"),
    ] {
        store
            .insert_instance(ServerInstance {
                id: id.into(),
                server_id: "srv-1".into(),
                organization_id: organization.into(),
                server_deployment_id: "dep-docker".into(),
            })
            .await;
    }
    let auth = Arc::new(StaticKeyAuthenticator::new(&config.api_keys));
    let state = AppState::new(
        config,
        Stores::in_memory(store.clone()),
        Arc::new(InMemoryJobQueue::new()),
        auth,
    );
    (state, store)
}

/// Serve the router on an ephemeral port together with queue workers.
pub async fn spawn_gateway(state: AppState) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let app = routes::router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    spawn_workers(JobProcessor::new(state), 2, CancellationToken::new());
    addr
}

/// How a [`FakeRunner`] answers launch requests.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunnerScript {
    /// Answer `get_launch_params` with `{"type": "error"}`.
    pub reject_launch: bool,
}

pub struct FakeRunnerState {
    ic: OnceLock<IcSession>,
    script: RunnerScript,
    launch_requests: AtomicUsize,
    executions: AtomicUsize,
}

type RunnerCtx = Arc<FakeRunnerState>;

/// A runner speaking the interconnect over a real socket. Every MCP request
/// it receives is answered with `{"echo": <method>}`, in arrival order.
pub struct FakeRunner {
    pub ic: IcSession,
    state: RunnerCtx,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl FakeRunner {
    pub async fn connect(addr: SocketAddr, tags: &[&str]) -> FakeRunner {
        Self::connect_scripted(addr, tags, RunnerScript::default()).await
    }

    pub async fn connect_scripted(addr: SocketAddr, tags: &[&str], script: RunnerScript) -> FakeRunner {
        let url = format!(
            "ws://{addr}/metorial_runner_interconnect?metorial_runner_connection_key={RUNNER_KEY}"
        );
        let (socket, _) = tokio_tungstenite::connect_async(url)
            .await
            .expect("runner connect");
        let (mut sink, mut stream) = socket.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

        let writer = tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        });

        let ctx: RunnerCtx = Arc::new(FakeRunnerState {
            ic: OnceLock::new(),
            script,
            launch_requests: AtomicUsize::new(0),
            executions: AtomicUsize::new(0),
        });
        let ic = Arc::new(runner_endpoint()).connect(ctx.clone(), out_tx.clone());
        let _ = ctx.ic.set(ic.clone());

        let reader_ic = ic.clone();
        let reader = tokio::spawn(async move {
            while let Some(Ok(message)) = stream.next().await {
                match message {
                    Message::Text(text) if text == "ping" => {
                        let _ = out_tx.send("pong".into());
                    }
                    Message::Text(text) if text == "pong" => {}
                    Message::Text(text) => {
                        let _ = reader_ic.receive(&text);
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            reader_ic.close();
        });

        let reply: Value = ic
            .request(
                "server/set_config",
                json!({"tags": tags, "maxConcurrentJobs": 4, "version": "test"}),
            )
            .await
            .expect("set_config");
        assert_eq!(reply["status"], "ok");
        ic.notify("server/ready", json!({})).expect("ready");

        FakeRunner {
            ic,
            state: ctx,
            reader,
            writer,
        }
    }

    pub fn launch_requests(&self) -> usize {
        self.state.launch_requests.load(Ordering::SeqCst)
    }

    pub fn executions(&self) -> usize {
        self.state.executions.load(Ordering::SeqCst)
    }

    pub fn disconnect(self) {
        self.ic.close();
        self.reader.abort();
        self.writer.abort();
    }
}

fn runner_endpoint() -> Endpoint<RunnerCtx> {
    Endpoint::new()
        .request("get_launch_params", |ctx: RunnerCtx, params: Value| async move {
            ctx.launch_requests.fetch_add(1, Ordering::SeqCst);
            if params["serverRunId"].as_str().is_none() {
                return Err(HandlerError::new("bad_request", "missing serverRunId"));
            }
            if ctx.script.reject_launch {
                return Ok(json!({"type": "error", "message": "deployment config is invalid"}));
            }
            Ok(json!({"type": "success", "launchParams": {"env": {}}}))
        })
        .request("run/execute", |ctx: RunnerCtx, _params: Value| async move {
            ctx.executions.fetch_add(1, Ordering::SeqCst);
            Ok::<_, HandlerError>(json!({}))
        })
        .notification("run/mcp/message", |ctx: RunnerCtx, params: Value| async move {
            let Some(ic) = ctx.ic.get() else {
                return;
            };
            let message = &params["message"];
            let (Some(method), Some(id)) = (message["method"].as_str(), message.get("id")) else {
                return;
            };
            let reply = json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {"echo": method},
            });
            let _ = ic.notify(
                "run/mcp/message",
                json!({"serverRunId": params["serverRunId"], "message": reply}),
            );
        })
        .notification("run/close", |ctx: RunnerCtx, params: Value| async move {
            if let Some(ic) = ctx.ic.get() {
                let _ = ic.notify("run/closed", json!({"serverRunId": params["serverRunId"]}));
            }
        })
}

/// Wait until `count` runners finished registering.
pub async fn wait_for_ready_runners(state: &AppState, count: usize) {
    while state.runners().ready_count() < count {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Minimal SSE reader over a byte stream: yields `(event, data)` pairs.
pub struct SseReader<S> {
    stream: S,
    buffer: String,
}

impl<S, B, E> SseReader<S>
where
    S: futures_util::stream::Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: std::fmt::Debug,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buffer: String::new(),
        }
    }

    pub async fn next_event(&mut self) -> Option<(String, String)> {
        loop {
            if let Some(end) = self.buffer.find("\n\n") {
                let block: String = self.buffer.drain(..end + 2).collect();
                let mut event = String::from("message");
                let mut data = Vec::new();
                for line in block.lines() {
                    if let Some(value) = line.strip_prefix("event:") {
                        event = value.trim().to_string();
                    } else if let Some(value) = line.strip_prefix("data:") {
                        data.push(value.trim_start().to_string());
                    }
                }
                if data.is_empty() {
                    // keep-alive comment
                    continue;
                }
                return Some((event, data.join("\n")));
            }
            let chunk = self.stream.next().await?.expect("sse chunk");
            self.buffer
                .push_str(&String::from_utf8_lossy(chunk.as_ref()));
        }
    }
}

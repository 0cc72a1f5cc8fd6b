use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::Parser;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub listen_addr: SocketAddr,
    pub log_filter: String,
    /// Prefix for URLs handed back to clients (SSE `endpoint` event). Empty
    /// means relative URLs.
    pub public_base_url: String,
    pub queue_backend: QueueBackend,
    pub redis_url: Option<String>,
    pub api_keys: Vec<ApiKey>,
    pub runner_keys: HashSet<String>,
    pub catalog_path: Option<PathBuf>,
    pub heartbeat: HeartbeatConfig,
    pub ic_request_timeout: Duration,
    pub dispatch: DispatchConfig,
    pub queue_workers: usize,
    pub liveness: LivenessConfig,
    /// How long a session relay survives with no client transport attached.
    pub session_idle_grace: Duration,
    pub shutdown_grace: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    pub timeout: Duration,
    pub persist_interval: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(7),
            timeout: Duration::from_secs(10),
            persist_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchConfig {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub wait_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_millis(1_000),
            wait_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessConfig {
    pub interval: Duration,
    pub stale_after: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            stale_after: Duration::from_secs(60),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 4310)),
            log_filter: "info,mcp_gateway=debug".into(),
            public_base_url: String::new(),
            queue_backend: QueueBackend::InMemory,
            redis_url: None,
            api_keys: Vec::new(),
            runner_keys: HashSet::new(),
            catalog_path: None,
            heartbeat: HeartbeatConfig::default(),
            ic_request_timeout: Duration::from_secs(30),
            dispatch: DispatchConfig::default(),
            queue_workers: 4,
            liveness: LivenessConfig::default(),
            session_idle_grace: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueBackend {
    InMemory,
    Redis,
}

impl FromStr for QueueBackend {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" | "in-memory" | "inmemory" => Ok(QueueBackend::InMemory),
            "redis" => Ok(QueueBackend::Redis),
            other => Err(anyhow!("unknown queue backend `{other}`")),
        }
    }
}

/// Client API key mapped to the organization it acts for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiKey {
    pub token: String,
    pub organization_id: String,
}

impl FromStr for ApiKey {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (token, organization_id) = value
            .split_once(':')
            .ok_or_else(|| anyhow!("api key must look like `token:organization`"))?;
        if token.is_empty() || organization_id.is_empty() {
            return Err(anyhow!("api key must look like `token:organization`"));
        }
        Ok(ApiKey {
            token: token.to_string(),
            organization_id: organization_id.to_string(),
        })
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "mcp-gateway",
    author,
    version,
    about = "MCP hosting gateway: client transports, runner interconnect and run dispatch"
)]
pub struct Cli {
    /// Address the HTTP listener binds to.
    #[arg(long, env = "MCP_GATEWAY_LISTEN_ADDR", default_value = "0.0.0.0:4310")]
    listen_addr: String,

    /// tracing filter; RUST_LOG takes precedence when set.
    #[arg(long, env = "MCP_GATEWAY_LOG", default_value = "info,mcp_gateway=debug")]
    log_filter: String,

    /// Public URL prefix used when advertising endpoints to clients.
    #[arg(long, env = "MCP_GATEWAY_PUBLIC_URL", default_value = "")]
    public_base_url: String,

    /// Job queue backend (`memory` or `redis`).
    #[arg(long, env = "MCP_GATEWAY_QUEUE_BACKEND", default_value = "memory")]
    queue_backend: String,

    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Comma separated `token:organization` pairs accepted from clients.
    #[arg(long, env = "MCP_GATEWAY_API_KEYS", value_delimiter = ',')]
    api_keys: Vec<String>,

    /// Comma separated connection keys accepted from runners.
    #[arg(long, env = "MCP_GATEWAY_RUNNER_KEYS", value_delimiter = ',')]
    runner_keys: Vec<String>,

    /// JSON file listing server instances and deployments.
    #[arg(long, env = "MCP_GATEWAY_CATALOG")]
    catalog_path: Option<PathBuf>,

    #[arg(long, env = "MCP_GATEWAY_HEARTBEAT_INTERVAL_SECS", default_value_t = 7)]
    heartbeat_interval_secs: u64,

    #[arg(long, env = "MCP_GATEWAY_HEARTBEAT_TIMEOUT_SECS", default_value_t = 10)]
    heartbeat_timeout_secs: u64,

    #[arg(long, env = "MCP_GATEWAY_HEARTBEAT_PERSIST_SECS", default_value_t = 60)]
    heartbeat_persist_secs: u64,

    #[arg(long, env = "MCP_GATEWAY_IC_REQUEST_TIMEOUT_SECS", default_value_t = 30)]
    ic_request_timeout_secs: u64,

    #[arg(long, env = "MCP_GATEWAY_DISPATCH_ATTEMPTS", default_value_t = 3)]
    dispatch_attempts: u32,

    #[arg(long, env = "MCP_GATEWAY_DISPATCH_BACKOFF_MS", default_value_t = 1_000)]
    dispatch_backoff_ms: u64,

    /// How long a client waits for its session to be placed on a runner.
    #[arg(long, env = "MCP_GATEWAY_DISPATCH_WAIT_SECS", default_value_t = 120)]
    dispatch_wait_secs: u64,

    #[arg(long, env = "MCP_GATEWAY_QUEUE_WORKERS", default_value_t = 4)]
    queue_workers: usize,

    #[arg(long, env = "MCP_GATEWAY_LIVENESS_INTERVAL_SECS", default_value_t = 60)]
    liveness_interval_secs: u64,

    #[arg(long, env = "MCP_GATEWAY_LIVENESS_STALE_SECS", default_value_t = 60)]
    liveness_stale_secs: u64,

    /// Seconds a session relay is kept after its last client disconnects.
    #[arg(long, env = "MCP_GATEWAY_SESSION_IDLE_SECS", default_value_t = 60)]
    session_idle_secs: u64,

    /// Grace period applied during shutdown.
    #[arg(long, env = "MCP_GATEWAY_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    shutdown_grace_secs: u64,
}

impl TryFrom<Cli> for GatewayConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        let queue_backend: QueueBackend = cli.queue_backend.parse()?;
        let api_keys = cli
            .api_keys
            .iter()
            .map(|raw| raw.trim())
            .filter(|raw| !raw.is_empty())
            .map(ApiKey::from_str)
            .collect::<Result<Vec<_>, _>>()
            .context("invalid MCP_GATEWAY_API_KEYS")?;
        let runner_keys = cli
            .runner_keys
            .into_iter()
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty())
            .collect();
        if cli.queue_workers == 0 {
            return Err(anyhow!("queue workers must be at least 1"));
        }
        if cli.dispatch_attempts == 0 {
            return Err(anyhow!("dispatch attempts must be at least 1"));
        }

        Ok(GatewayConfig {
            listen_addr,
            log_filter: cli.log_filter,
            public_base_url: cli.public_base_url.trim_end_matches('/').to_string(),
            queue_backend,
            redis_url: cli.redis_url.filter(|url| !url.is_empty()),
            api_keys,
            runner_keys,
            catalog_path: cli.catalog_path,
            heartbeat: HeartbeatConfig {
                interval: Duration::from_secs(cli.heartbeat_interval_secs),
                timeout: Duration::from_secs(cli.heartbeat_timeout_secs),
                persist_interval: Duration::from_secs(cli.heartbeat_persist_secs),
            },
            ic_request_timeout: Duration::from_secs(cli.ic_request_timeout_secs),
            dispatch: DispatchConfig {
                max_attempts: cli.dispatch_attempts,
                backoff_base: Duration::from_millis(cli.dispatch_backoff_ms),
                wait_timeout: Duration::from_secs(cli.dispatch_wait_secs),
            },
            queue_workers: cli.queue_workers,
            liveness: LivenessConfig {
                interval: Duration::from_secs(cli.liveness_interval_secs),
                stale_after: Duration::from_secs(cli.liveness_stale_secs),
            },
            session_idle_grace: Duration::from_secs(cli.session_idle_secs),
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_match_config_defaults() {
        let cli = Cli::try_parse_from(["mcp-gateway"]).unwrap();
        let config = GatewayConfig::try_from(cli).unwrap();
        let defaults = GatewayConfig::default();
        assert_eq!(config.listen_addr, defaults.listen_addr);
        assert_eq!(config.heartbeat, defaults.heartbeat);
        assert_eq!(config.dispatch, defaults.dispatch);
        assert_eq!(config.liveness, defaults.liveness);
        assert_eq!(config.queue_backend, QueueBackend::InMemory);
        assert_eq!(config.ic_request_timeout, Duration::from_secs(30));
        assert_eq!(config.session_idle_grace, defaults.session_idle_grace);
    }

    #[test]
    fn parses_key_lists() {
        let cli = Cli::try_parse_from([
            "mcp-gateway",
            "--api-keys",
            "tok-a:org-1, tok-b:org-2",
            "--runner-keys",
            "rk-1,,rk-2",
            "--queue-backend",
            "redis",
            "--public-base-url",
            "https://mcp.example.com/",
        ])
        .unwrap();
        let config = GatewayConfig::try_from(cli).unwrap();
        assert_eq!(config.api_keys.len(), 2);
        assert_eq!(config.api_keys[1].organization_id, "org-2");
        assert!(config.runner_keys.contains("rk-2"));
        assert_eq!(config.runner_keys.len(), 2);
        assert_eq!(config.queue_backend, QueueBackend::Redis);
        assert_eq!(config.public_base_url, "https://mcp.example.com");
    }

    #[test]
    fn rejects_malformed_api_key() {
        let cli = Cli::try_parse_from(["mcp-gateway", "--api-keys", "no-organization"]).unwrap();
        assert!(GatewayConfig::try_from(cli).is_err());
    }
}

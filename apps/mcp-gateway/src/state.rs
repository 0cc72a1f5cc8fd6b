use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use crate::auth::{Authenticator, StaticKeyAuthenticator};
use crate::config::GatewayConfig;
use crate::dispatch::queue::{build_queue, QueueHandle};
use crate::dispatch::Dispatcher;
use crate::runner::{RunnerDeps, RunnerRegistry};
use crate::session::{SessionConnections, SessionDeps};
use crate::store::{Catalog, InMemoryStore, Stores};

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: GatewayConfig,
    stores: Stores,
    runners: RunnerRegistry,
    sessions: SessionConnections,
    dispatcher: Arc<Dispatcher>,
    auth: Arc<dyn Authenticator>,
    shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        config: GatewayConfig,
        stores: Stores,
        queue: QueueHandle,
        auth: Arc<dyn Authenticator>,
    ) -> Self {
        let dispatcher = Dispatcher::new(queue, &config.dispatch);
        let sessions = SessionConnections::new(config.session_idle_grace);
        Self {
            inner: Arc::new(AppStateInner {
                config,
                stores,
                runners: RunnerRegistry::default(),
                sessions,
                dispatcher,
                auth,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// In-memory stores seeded from the configured catalog, the configured
    /// queue backend and the static API key table.
    pub fn from_config(config: GatewayConfig) -> anyhow::Result<Self> {
        let catalog = match &config.catalog_path {
            Some(path) => Catalog::load(path)
                .with_context(|| format!("loading catalog {}", path.display()))?,
            None => Catalog::default(),
        };
        let stores = Stores::in_memory(InMemoryStore::with_catalog(catalog));
        let queue = build_queue(config.queue_backend, config.redis_url.as_deref());
        let auth = Arc::new(StaticKeyAuthenticator::new(&config.api_keys));
        Ok(Self::new(config, stores, queue, auth))
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    pub fn stores(&self) -> &Stores {
        &self.inner.stores
    }

    pub fn runners(&self) -> &RunnerRegistry {
        &self.inner.runners
    }

    pub fn sessions(&self) -> &SessionConnections {
        &self.inner.sessions
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.inner.dispatcher
    }

    pub fn auth(&self) -> &Arc<dyn Authenticator> {
        &self.inner.auth
    }

    /// Cancelled once the process starts shutting down.
    pub fn shutdown(&self) -> &CancellationToken {
        &self.inner.shutdown
    }

    pub fn runner_deps(&self) -> RunnerDeps {
        RunnerDeps {
            stores: self.inner.stores.clone(),
            registry: self.inner.runners.clone(),
            heartbeat: self.inner.config.heartbeat,
            ic_request_timeout: self.inner.config.ic_request_timeout,
        }
    }

    pub fn session_deps(&self) -> SessionDeps {
        SessionDeps {
            stores: self.inner.stores.clone(),
            dispatcher: Arc::clone(&self.inner.dispatcher),
        }
    }
}

//! Live session relays shared by every transport a client opens.

pub mod connection;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::info;

use crate::model::{ServerDeployment, ServerInstance, Session};

pub use connection::{
    lagged_error, SessionConnection, SessionDeps, SessionEvent, SessionSubscription,
};

#[derive(Clone)]
pub struct SessionConnections {
    live: Arc<DashMap<String, Arc<SessionConnection>>>,
    /// How long a relay with no attached transport is kept.
    idle_grace: Duration,
}

impl SessionConnections {
    pub fn new(idle_grace: Duration) -> Self {
        Self {
            live: Arc::new(DashMap::new()),
            idle_grace,
        }
    }

    /// Attach a transport to the live relay for `session`, creating the
    /// relay on first use. The relay is stopped once the last guard is
    /// dropped and nothing reattaches within the idle grace.
    pub fn attach(
        &self,
        session: Session,
        instance: ServerInstance,
        deployment: ServerDeployment,
        deps: &SessionDeps,
    ) -> TransportGuard {
        let connection = match self.live.entry(session.id.clone()) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_stopped() {
                    entry.insert(SessionConnection::new(session, instance, deployment, deps.clone()));
                }
                Arc::clone(entry.get())
            }
            Entry::Vacant(entry) => {
                let connection = SessionConnection::new(session, instance, deployment, deps.clone());
                entry.insert(Arc::clone(&connection));
                connection
            }
        };
        connection.transports.fetch_add(1, Ordering::SeqCst);
        TransportGuard {
            connection,
            sessions: self.clone(),
        }
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<SessionConnection>> {
        self.live
            .get(session_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Stop and forget the relay. Returns whether one was live.
    pub async fn stop(&self, session_id: &str) -> bool {
        match self.live.remove(session_id) {
            Some((_, connection)) => {
                connection.stop().await;
                true
            }
            None => false,
        }
    }

    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.live.iter().map(|entry| entry.key().clone()).collect();
        for id in ids {
            self.stop(&id).await;
        }
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    fn detached(&self, connection: &Arc<SessionConnection>) {
        if connection.transports.fetch_sub(1, Ordering::SeqCst) != 1 {
            return;
        }
        let epoch = connection.idle_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let sessions = self.clone();
        let connection = Arc::clone(connection);
        runtime.spawn(async move {
            tokio::time::sleep(sessions.idle_grace).await;
            sessions.evict_idle(&connection, epoch).await;
        });
    }

    async fn evict_idle(&self, connection: &Arc<SessionConnection>, epoch: u64) {
        let session_id = connection.session_id();
        // Checked under the shard lock so a concurrent attach either keeps
        // the relay alive or gets a fresh one.
        let evicted = self.live.remove_if(&session_id, |_, live| {
            Arc::ptr_eq(live, connection)
                && live.transports.load(Ordering::SeqCst) == 0
                && live.idle_epoch.load(Ordering::SeqCst) == epoch
        });
        if evicted.is_some() {
            info!(session_id = %session_id, "evicting idle session relay");
            connection.stop().await;
        }
    }
}

/// One transport attached to a session relay. Dropping it detaches.
pub struct TransportGuard {
    connection: Arc<SessionConnection>,
    sessions: SessionConnections,
}

impl TransportGuard {
    pub fn connection(&self) -> &Arc<SessionConnection> {
        &self.connection
    }

    /// Subscribe to the session stream. The transport stays attached for as
    /// long as the subscription lives.
    pub fn subscribe(self, include_debug: bool) -> SessionSubscription {
        let subscription = self.connection.subscribe(include_debug);
        subscription.attached(self)
    }
}

impl Drop for TransportGuard {
    fn drop(&mut self) {
        self.sessions.detached(&self.connection);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatchConfig;
    use crate::dispatch::queue::InMemoryJobQueue;
    use crate::dispatch::Dispatcher;
    use crate::model::{Actor, LaunchSource};
    use crate::store::{InMemoryStore, Stores};
    use serde_json::json;
    use test_timeout::tokio_timeout_test;

    fn fixture() -> (Session, ServerInstance, ServerDeployment, SessionDeps) {
        let actor = Actor {
            organization_id: "org-1".into(),
            actor_id: "key_1".into(),
        };
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
            stores: Stores::in_memory(InMemoryStore::new()),
            dispatcher: Dispatcher::new(Arc::new(InMemoryJobQueue::new()), &DispatchConfig::default()),
        };
        (Session::new(&actor, "inst-1"), instance, deployment, deps)
    }

    #[tokio_timeout_test(5, paused)]
    async fn relay_is_evicted_after_last_transport_idles() {
        let sessions = SessionConnections::new(Duration::from_secs(30));
        let (session, instance, deployment, deps) = fixture();
        let session_id = session.id.clone();

        let first = sessions.attach(session.clone(), instance.clone(), deployment.clone(), &deps);
        let second = sessions.attach(session.clone(), instance.clone(), deployment.clone(), &deps);
        assert!(Arc::ptr_eq(first.connection(), second.connection()));
        let relay = Arc::clone(first.connection());

        drop(first);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(sessions.get(&session_id).is_some());

        drop(second);
        tokio::time::sleep(Duration::from_secs(10)).await;
        // Reattaching inside the grace keeps the relay.
        let again = sessions.attach(session.clone(), instance.clone(), deployment.clone(), &deps);
        assert!(Arc::ptr_eq(again.connection(), &relay));
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(!relay.is_stopped());

        drop(again);
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(sessions.is_empty());
        assert!(relay.is_stopped());

        // A later request gets a fresh relay for the same session.
        let fresh = sessions.attach(session, instance, deployment, &deps);
        assert!(!Arc::ptr_eq(fresh.connection(), &relay));
        assert!(!fresh.connection().is_stopped());
    }
}

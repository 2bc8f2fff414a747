//! Wiring of the routing core.
//!
//! A [`ServerContext`] owns one instance of every component: the session
//! arena, the routing table, the session manager and the routers. Hosts
//! build it once with [`ServerContextBuilder`] and hand out `Arc`s.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info};

use crate::cluster::{ClusterEvent, ClusterTaskHandler, ClusterTransport, StandaloneCluster};
use crate::config::RouterConfig;
use crate::interceptor::InterceptorManager;
use crate::policy::{
    DisabledOfflineStore, MulticastRouter, NoPrivacy, OfflineStore, OpenDirectory, PrivacyPolicy,
    RemoteServerDialer, UserDirectory,
};
use crate::router::{PacketRouter, RouterCore};
use crate::routing::{RoutingCaches, RoutingTable};
use crate::session::{SessionArena, SessionCaches, SessionManager};
use crate::RouterError;

/// The cluster-wide caches of one node.
#[derive(Clone, Default)]
pub struct ClusterCaches {
    pub routing: RoutingCaches,
    pub sessions: SessionCaches,
}

/// Every component of a running router.
pub struct ServerContext {
    config: RouterConfig,
    cluster: Arc<dyn ClusterTransport>,
    arena: Arc<SessionArena>,
    routing: Arc<RoutingTable>,
    sessions: Arc<SessionManager>,
    interceptors: Arc<InterceptorManager>,
    router: Arc<PacketRouter>,
}

impl ServerContext {
    pub fn builder(config: RouterConfig) -> ServerContextBuilder {
        ServerContextBuilder::new(config)
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn cluster(&self) -> &Arc<dyn ClusterTransport> {
        &self.cluster
    }

    pub fn arena(&self) -> &Arc<SessionArena> {
        &self.arena
    }

    pub fn routing(&self) -> &Arc<RoutingTable> {
        &self.routing
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn interceptors(&self) -> &Arc<InterceptorManager> {
        &self.interceptors
    }

    pub fn router(&self) -> &Arc<PacketRouter> {
        &self.router
    }

    /// Where the cluster transport hands tasks sent by other members.
    pub fn cluster_handler(&self) -> Arc<dyn ClusterTaskHandler> {
        self.sessions.clone()
    }

    /// Reconcile routes after a membership change.
    pub async fn handle_cluster_event(&self, event: ClusterEvent) {
        match event {
            ClusterEvent::JoinedCluster => {
                self.routing.joined_cluster();
            }
            ClusterEvent::LeftCluster => {
                let dropped = self.routing.left_cluster().await;
                info!(dropped, "Left cluster, dropped remote routes");
            }
            ClusterEvent::NodeJoined(node) => {
                debug!(node = %node, "Cluster node joined");
            }
            ClusterEvent::NodeLeft(node) => {
                let dropped = self.routing.left_cluster_node(&node).await;
                info!(node = %node, dropped, "Cluster node left");
            }
        }
    }
}

impl fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerContext")
            .field("domain", &self.config.domain)
            .field("node_id", self.cluster.node_id())
            .field("sessions", &self.arena.len())
            .finish()
    }
}

/// Builder for [`ServerContext`]. Anything not supplied falls back to the
/// standalone, in-memory default.
pub struct ServerContextBuilder {
    config: RouterConfig,
    cluster: Option<Arc<dyn ClusterTransport>>,
    caches: ClusterCaches,
    privacy: Arc<dyn PrivacyPolicy>,
    offline: Arc<dyn OfflineStore>,
    users: Arc<dyn UserDirectory>,
    multicast: Option<Arc<dyn MulticastRouter>>,
    dialer: Option<Arc<dyn RemoteServerDialer>>,
    interceptors: Arc<InterceptorManager>,
}

impl ServerContextBuilder {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            config,
            cluster: None,
            caches: ClusterCaches::default(),
            privacy: Arc::new(NoPrivacy),
            offline: Arc::new(DisabledOfflineStore),
            users: Arc::new(OpenDirectory),
            multicast: None,
            dialer: None,
            interceptors: Arc::new(InterceptorManager::new()),
        }
    }

    pub fn cluster(mut self, cluster: Arc<dyn ClusterTransport>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    pub fn caches(mut self, caches: ClusterCaches) -> Self {
        self.caches = caches;
        self
    }

    pub fn privacy(mut self, privacy: Arc<dyn PrivacyPolicy>) -> Self {
        self.privacy = privacy;
        self
    }

    pub fn offline_store(mut self, offline: Arc<dyn OfflineStore>) -> Self {
        self.offline = offline;
        self
    }

    pub fn users(mut self, users: Arc<dyn UserDirectory>) -> Self {
        self.users = users;
        self
    }

    pub fn multicast(mut self, multicast: Arc<dyn MulticastRouter>) -> Self {
        self.multicast = Some(multicast);
        self
    }

    pub fn dialer(mut self, dialer: Arc<dyn RemoteServerDialer>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    pub fn interceptors(mut self, interceptors: Arc<InterceptorManager>) -> Self {
        self.interceptors = interceptors;
        self
    }

    pub fn build(self) -> Result<Arc<ServerContext>, RouterError> {
        self.config.validate()?;

        let cluster = self
            .cluster
            .unwrap_or_else(|| Arc::new(StandaloneCluster::default()));
        let arena = Arc::new(SessionArena::new());
        let routing = Arc::new(
            RoutingTable::new(
                self.config.domain.clone(),
                Arc::clone(&cluster),
                self.caches.routing,
                Arc::clone(&arena),
            )
            .with_federation(self.config.federation_enabled, self.dialer),
        );
        let sessions = SessionManager::new(
            &self.config,
            Arc::clone(&arena),
            Arc::clone(&routing),
            self.caches.sessions,
            Arc::clone(&self.offline),
        );

        let core = Arc::new(RouterCore {
            config: self.config.clone(),
            routing: Arc::clone(&routing),
            sessions: Arc::clone(&sessions),
            interceptors: Arc::clone(&self.interceptors),
            privacy: self.privacy,
            offline: self.offline,
            users: self.users,
            multicast: self.multicast,
        });
        let router = Arc::new(PacketRouter::new(core));

        info!(
            domain = %self.config.domain,
            node_id = %cluster.node_id(),
            federation = self.config.federation_enabled,
            "Routing core assembled"
        );

        Ok(Arc::new(ServerContext {
            config: self.config,
            cluster,
            arena,
            routing,
            sessions,
            interceptors: self.interceptors,
            router,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_rejects_invalid_config() {
        let result = ServerContext::builder(RouterConfig::new("")).build();
        assert!(matches!(result, Err(RouterError::Config(_))));
    }

    #[test]
    fn test_build_wires_components() {
        let ctx = ServerContext::builder(RouterConfig::new("waddle.social"))
            .build()
            .unwrap();
        assert_eq!(ctx.routing().domain(), "waddle.social");
        assert!(ctx.routing().is_local_domain("waddle.social"));
        assert!(ctx.router().iq_router().supports("urn:xmpp:ping"));
        assert!(ctx.arena().is_empty());
    }
}

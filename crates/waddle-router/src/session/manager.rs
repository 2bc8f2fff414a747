//! Session lifecycle: creation, binding, presence state, detachment and
//! removal, plus the bookkeeping for server and component sessions.

use std::fmt;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use jid::{BareJid, FullJid, Jid};
use tokio::runtime::Handle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use xmpp_parsers::presence::{Presence, Type as PresenceType};

use crate::address::{domain_jid, DomainPair, StreamId};
use crate::cluster::{Cache, ClusterTask, ClusterTaskHandler, ClusterTaskResult, LocalCache};
use crate::config::{RouterConfig, SessionConfig};
use crate::connection::{CloseListener, Connection};
use crate::error::stream_errors;
use crate::metrics;
use crate::policy::OfflineStore;
use crate::routing::RoutingTable;
use crate::session::{Session, SessionArena, SessionKind, SessionStatus};
use crate::stanza::Stanza;
use crate::RouterError;

/// Cluster-visible session indexes.
#[derive(Clone)]
pub struct SessionCaches {
    /// Stream ID of an incoming server session -> domains validated on it
    pub validated_domains: Arc<dyn Cache<StreamId, Vec<String>>>,
    /// Remote domain -> incoming server streams serving it
    pub incoming_by_domain: Arc<dyn Cache<String, Vec<StreamId>>>,
}

impl SessionCaches {
    pub fn local() -> Self {
        Self {
            validated_domains: LocalCache::shared("Validated Domains"),
            incoming_by_domain: LocalCache::shared("Incoming Server Sessions"),
        }
    }
}

impl Default for SessionCaches {
    fn default() -> Self {
        Self::local()
    }
}

/// Owns every session of this node.
pub struct SessionManager {
    domain: String,
    config: SessionConfig,
    conflict_limit: i32,
    arena: Arc<SessionArena>,
    routing: Arc<RoutingTable>,
    caches: SessionCaches,
    offline: Arc<dyn OfflineStore>,
}

/// Close listener registered on every connection the manager hands out.
struct ConnectionClosed {
    manager: Weak<SessionManager>,
}

impl CloseListener for ConnectionClosed {
    fn on_close(&self, handback: &StreamId) {
        if let Some(manager) = self.manager.upgrade() {
            manager.handle_connection_closed(handback);
        }
    }
}

impl SessionManager {
    pub fn new(
        config: &RouterConfig,
        arena: Arc<SessionArena>,
        routing: Arc<RoutingTable>,
        caches: SessionCaches,
        offline: Arc<dyn OfflineStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            domain: config.domain.clone(),
            config: config.sessions.clone(),
            conflict_limit: config.conflict_limit,
            arena,
            routing,
            caches,
            offline,
        })
    }

    pub fn arena(&self) -> &Arc<SessionArena> {
        &self.arena
    }

    pub fn routing(&self) -> &Arc<RoutingTable> {
        &self.routing
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn get_session(&self, stream_id: &StreamId) -> Option<Arc<Session>> {
        self.arena.get(stream_id)
    }

    /// Create a session for a freshly accepted connection.
    #[instrument(skip(self, connection), fields(kind = %kind))]
    pub fn create_session(
        self: &Arc<Self>,
        kind: SessionKind,
        connection: Arc<dyn Connection>,
    ) -> Arc<Session> {
        let stream_id = StreamId::generate();
        self.watch_connection(&connection, &stream_id);

        let session = Arc::new(
            Session::new(
                stream_id.clone(),
                kind,
                self.domain.as_str(),
                Some(connection),
            )
            .with_max_backlog(self.config.max_detached_backlog),
        );
        self.arena.insert(Arc::clone(&session));
        debug!(stream_id = %stream_id, "Session created");
        self.record_counts();
        session
    }

    fn watch_connection(self: &Arc<Self>, connection: &Arc<dyn Connection>, stream_id: &StreamId) {
        let listener = Arc::new(ConnectionClosed {
            manager: Arc::downgrade(self),
        });
        connection.register_close_listener(listener, stream_id.clone());
    }

    /// Bind `jid` to an authenticated client session.
    ///
    /// If another session holds the same full JID, the conflict limit
    /// decides: `-1` refuses the new bind, otherwise the old session is
    /// kicked once its conflict counter exceeds the limit. A holder on
    /// another node is settled by that node.
    #[instrument(skip(self, session), fields(jid = %jid, stream_id = %session.stream_id()))]
    pub async fn bind(
        &self,
        session: &Arc<Session>,
        jid: FullJid,
        anonymous: bool,
    ) -> Result<(), RouterError> {
        if session.is_closed() {
            return Err(RouterError::SessionClosed(session.stream_id().to_string()));
        }

        if let Some(existing) = self
            .routing
            .get_client_route(&jid)
            .filter(|existing| existing.stream_id() != session.stream_id())
        {
            if !self.kick_for_conflict(&existing).await {
                return Err(RouterError::ResourceConflict(jid.to_string()));
            }
        } else if let Some(route) = self
            .routing
            .client_route_info(&jid)
            .filter(|route| route.node_id != *self.routing.node_id())
        {
            if self.conflict_limit < 0 {
                debug!(node = %route.node_id, "Resource in use on another node and kicking is disabled");
                return Err(RouterError::ResourceConflict(jid.to_string()));
            }
            let task = ClusterTask::ResolveConflict { jid: jid.clone() };
            match self
                .routing
                .cluster()
                .do_synchronous_cluster_task(task, &route.node_id)
                .await
            {
                Ok(ClusterTaskResult::Refused) => {
                    return Err(RouterError::ResourceConflict(jid.to_string()));
                }
                Ok(_) => info!(node = %route.node_id, "Session holding the resource on another node resolved"),
                Err(e) => {
                    warn!(node = %route.node_id, error = %e, "Owner of the resource unreachable, taking the route over");
                }
            }
        }

        session.set_address(Jid::from(jid.clone()));
        session.set_anonymous(anonymous);
        session.set_status(SessionStatus::Authenticated);
        self.routing.add_client_route(&jid, session)?;
        info!("Resource bound");
        self.record_counts();
        Ok(())
    }

    /// Apply the conflict limit to `existing`; returns whether it was kicked.
    async fn kick_for_conflict(&self, existing: &Arc<Session>) -> bool {
        if self.conflict_limit < 0 {
            debug!("Resource in use and kicking is disabled");
            return false;
        }
        let conflicts = existing.increment_conflict_count();
        if conflicts <= self.conflict_limit {
            debug!(conflicts, limit = self.conflict_limit, "Resource in use");
            return false;
        }
        info!(old_stream_id = %existing.stream_id(), "Kicking session holding the resource");
        self.remove_session(existing, Some(stream_errors::CONFLICT))
            .await;
        true
    }

    /// The session sent available presence.
    #[instrument(skip(self, session, presence), fields(stream_id = %session.stream_id()))]
    pub fn session_available(
        &self,
        session: &Arc<Session>,
        presence: Presence,
    ) -> Result<(), RouterError> {
        let jid = session
            .full_jid()
            .ok_or_else(|| RouterError::SessionNotFound(session.stream_id().to_string()))?;
        let was_available = session.is_available();
        session.set_presence(presence);

        if !self.routing.set_client_route_availability(&jid, true) {
            self.routing.add_client_route(&jid, session)?;
        }
        if was_available {
            return Ok(());
        }

        if session.priority() >= 0 && !session.is_anonymous() {
            self.flush_offline(session);
        }

        for other in self.routing.local_sessions_of(&jid.to_bare()) {
            if other.stream_id() == session.stream_id() || !other.is_available() {
                continue;
            }
            let mut other_presence = other.presence();
            other_presence.from = other.address();
            other_presence.to = Some(Jid::from(jid.clone()));
            session.deliver(Stanza::Presence(other_presence));
        }
        debug!(jid = %jid, "Session available");
        Ok(())
    }

    /// The session sent unavailable presence.
    pub fn session_unavailable(&self, session: &Session, presence: Presence) {
        session.set_presence(presence);
        if let Some(jid) = session.full_jid() {
            self.routing.set_client_route_availability(&jid, false);
            debug!(jid = %jid, "Session unavailable");
        }
    }

    /// React to a priority change from `old_priority`.
    ///
    /// When the user had no resource with a non-negative priority and this
    /// one now has one, its offline messages are delivered here.
    pub fn change_priority(&self, session: &Session, old_priority: i8) -> usize {
        if session.is_anonymous() || old_priority >= 0 || session.priority() < 0 {
            return 0;
        }
        let Some(user) = session.bare_jid() else {
            return 0;
        };

        let other_non_negative = self.routing.local_sessions_of(&user).iter().any(|other| {
            other.stream_id() != session.stream_id()
                && other.is_available()
                && other.priority() >= 0
        });
        if other_non_negative {
            return 0;
        }
        self.flush_offline(session)
    }

    fn flush_offline(&self, session: &Session) -> usize {
        let Some(user) = session.bare_jid() else {
            return 0;
        };
        let messages = self.offline.take_messages(&user);
        let delivered = messages
            .into_iter()
            .map(|message| session.deliver(Stanza::Message(message)))
            .filter(|result| result.is_sent())
            .count();
        if delivered > 0 {
            info!(user = %user, delivered, "Delivered offline messages");
        }
        delivered
    }

    /// Send `presence` from `from` to the user's other resources.
    pub async fn broadcast_presence_to_other_resources(
        &self,
        from: &FullJid,
        presence: Presence,
    ) -> usize {
        let mut delivered = 0;
        for resource in self.routing.user_routes(&from.to_bare()) {
            if resource == *from {
                continue;
            }
            let to = Jid::from(resource);
            let mut copy = presence.clone();
            copy.to = Some(to.clone());
            if self
                .routing
                .route_packet(&to, Stanza::Presence(copy))
                .await
                .is_delivered()
            {
                delivered += 1;
            }
        }
        delivered
    }

    /// Deliver `stanza` to every bound resource of `user`.
    pub async fn user_broadcast(&self, user: &BareJid, stanza: Stanza) -> usize {
        let mut delivered = 0;
        for resource in self.routing.user_routes(user) {
            let to = Jid::from(resource);
            let mut copy = stanza.clone();
            copy.set_to(Some(to.clone()));
            if self.routing.route_packet(&to, copy).await.is_delivered() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Deliver `stanza` to every client session in the cluster.
    pub async fn broadcast(&self, stanza: Stanza) -> usize {
        self.routing.broadcast_packet(stanza, false).await
    }

    /// Remove a session: drop its routes, close it and tell others it left.
    ///
    /// Returns `false` when the session was already gone.
    #[instrument(skip(self, session), fields(stream_id = %session.stream_id(), kind = %session.kind()))]
    pub async fn remove_session(&self, session: &Arc<Session>, stream_error: Option<&str>) -> bool {
        if self.arena.remove(session.stream_id()).is_none() {
            return false;
        }
        self.release_client_route(session);
        session.close(stream_error);
        self.finish_removal(session).await;
        true
    }

    fn release_client_route(&self, session: &Session) {
        if session.kind() != SessionKind::Client {
            return;
        }
        if let Some(jid) = session.full_jid() {
            self.routing
                .remove_client_route_if_owned(&jid, session.stream_id());
        }
    }

    async fn finish_removal(&self, session: &Session) {
        match session.kind() {
            SessionKind::Client => self.send_unavailable_presence(session).await,
            SessionKind::IncomingServer => {
                self.unregister_incoming_server(session.stream_id()).await;
            }
            SessionKind::OutgoingServer => {
                if let Some(remote) = session.address() {
                    let pair = DomainPair::new(self.domain.as_str(), remote.domain().as_str());
                    self.routing.remove_server_route(&pair);
                }
            }
            SessionKind::Component => {
                if let Some(address) = session.address() {
                    self.routing.remove_component_route(address.domain().as_str());
                }
            }
            SessionKind::ConnectionMultiplexer => {}
        }
        debug!(stream_id = %session.stream_id(), "Session removed");
        self.record_counts();
    }

    /// Unavailable presence on behalf of a departing client session.
    ///
    /// Goes to the user's other resources when the session was available,
    /// and to every entity it sent directed presence to.
    async fn send_unavailable_presence(&self, session: &Session) {
        let Some(jid) = session.full_jid() else {
            return;
        };
        let mut presence = Presence::new(PresenceType::Unavailable);
        presence.from = Some(Jid::from(jid.clone()));

        if session.is_available() {
            self.broadcast_presence_to_other_resources(&jid, presence.clone())
                .await;
        }

        for recipient in self.routing.directed_presences().take_recipients(&jid) {
            let mut directed = presence.clone();
            directed.to = Some(recipient.clone());
            self.routing
                .route_packet(&recipient, Stanza::Presence(directed))
                .await;
        }
    }

    /// Called when a session's connection closes.
    ///
    /// A resumable client session is detached and keeps its route; any
    /// other session loses its route at once, and the presence work runs
    /// on the runtime.
    pub fn handle_connection_closed(self: &Arc<Self>, stream_id: &StreamId) {
        let Some(session) = self.arena.get(stream_id) else {
            return;
        };

        if session.kind() == SessionKind::Client
            && session.is_resumable()
            && session.is_authenticated()
        {
            session.detach();
            info!(stream_id = %stream_id, "Connection lost, session detached");
            return;
        }

        if self.arena.remove(stream_id).is_none() {
            return;
        }
        self.release_client_route(&session);
        session.close(None);

        match Handle::try_current() {
            Ok(handle) => {
                let manager = Arc::clone(self);
                handle.spawn(async move {
                    manager.finish_removal(&session).await;
                });
            }
            Err(_) => warn!(stream_id = %stream_id, "No runtime, skipping presence cleanup"),
        }
    }

    /// Stop writing to the session's connection and buffer instead.
    pub fn detach(&self, session: &Session) {
        session.detach();
        info!(stream_id = %session.stream_id(), "Session detached");
    }

    /// Re-attach a detached session to a new connection.
    ///
    /// Buffered stanzas are delivered before returning.
    #[instrument(skip(self, connection), fields(stream_id = %stream_id))]
    pub fn resume(
        self: &Arc<Self>,
        stream_id: &StreamId,
        connection: Arc<dyn Connection>,
    ) -> Result<Arc<Session>, RouterError> {
        let session = self
            .arena
            .get(stream_id)
            .ok_or_else(|| RouterError::SessionNotFound(stream_id.to_string()))?;
        if session.is_closed() {
            return Err(RouterError::SessionClosed(stream_id.to_string()));
        }
        if !session.is_detached() {
            return Err(RouterError::SessionNotFound(format!(
                "{stream_id} is not detached"
            )));
        }

        self.watch_connection(&connection, stream_id);
        session.attach(connection);
        let flushed = session.flush_backlog();
        info!(flushed, "Session resumed");
        Ok(session)
    }

    /// End a detached session whose resumption window passed.
    ///
    /// Acts only while the session still owns its route; returns whether
    /// it did.
    pub async fn terminate_detached(&self, session: &Arc<Session>) -> bool {
        if !session.is_detached() {
            return false;
        }
        let owns_route = session
            .full_jid()
            .and_then(|jid| self.routing.get_client_route(&jid))
            .map(|current| current.stream_id() == session.stream_id())
            .unwrap_or(false);
        if !owns_route {
            debug!(stream_id = %session.stream_id(), "Detached session was replaced");
            return false;
        }
        self.remove_session(session, None).await
    }

    /// Drop a detached session without telling anyone.
    pub fn remove_detached(&self, session: &Session) -> bool {
        if !session.is_detached() {
            return false;
        }
        if self.arena.remove(session.stream_id()).is_none() {
            return false;
        }
        self.release_client_route(session);
        session.close(None);
        self.record_counts();
        true
    }

    // ------------------------------------------------------------------
    // Server and component sessions
    // ------------------------------------------------------------------

    /// Record `domain` as validated on an incoming server stream.
    #[instrument(skip(self, session), fields(domain = %domain, stream_id = %session.stream_id()))]
    pub async fn register_incoming_server_session(
        &self,
        domain: &str,
        session: &Session,
    ) -> Result<(), RouterError> {
        if session.is_closed() {
            return Err(RouterError::SessionClosed(session.stream_id().to_string()));
        }
        let stream_id = session.stream_id().clone();
        let lock = self.caches.validated_domains.key_lock(&stream_id);
        let _guard = lock.lock().await;

        self.caches.validated_domains.compute(
            stream_id.clone(),
            &mut |current: Option<&Vec<String>>| {
                let mut domains = current.cloned().unwrap_or_default();
                if !domains.iter().any(|d| d == domain) {
                    domains.push(domain.to_string());
                }
                Some(domains)
            },
        );
        self.caches.incoming_by_domain.compute(
            domain.to_string(),
            &mut |current: Option<&Vec<StreamId>>| {
                let mut streams = current.cloned().unwrap_or_default();
                if !streams.contains(&stream_id) {
                    streams.push(stream_id.clone());
                }
                Some(streams)
            },
        );
        session.set_status(SessionStatus::Authenticated);
        debug!("Incoming server session registered");
        Ok(())
    }

    /// Forget that `domain` was validated on `stream_id`.
    pub async fn unregister_incoming_server_session(&self, domain: &str, stream_id: &StreamId) -> bool {
        let lock = self.caches.validated_domains.key_lock(stream_id);
        let _guard = lock.lock().await;

        let mut removed = false;
        self.caches.validated_domains.compute(
            stream_id.clone(),
            &mut |current: Option<&Vec<String>>| {
                let mut domains = current?.clone();
                let before = domains.len();
                domains.retain(|d| d != domain);
                removed = domains.len() != before;
                (!domains.is_empty()).then_some(domains)
            },
        );
        self.remove_incoming_index(domain, stream_id);
        removed
    }

    /// Forget every domain validated on `stream_id`.
    pub async fn unregister_incoming_server(&self, stream_id: &StreamId) -> usize {
        let lock = self.caches.validated_domains.key_lock(stream_id);
        let _guard = lock.lock().await;

        let domains = self
            .caches
            .validated_domains
            .remove(stream_id)
            .unwrap_or_default();
        for domain in &domains {
            self.remove_incoming_index(domain, stream_id);
        }
        domains.len()
    }

    fn remove_incoming_index(&self, domain: &str, stream_id: &StreamId) {
        self.caches.incoming_by_domain.compute(
            domain.to_string(),
            &mut |current: Option<&Vec<StreamId>>| {
                let mut streams = current?.clone();
                streams.retain(|s| s != stream_id);
                (!streams.is_empty()).then_some(streams)
            },
        );
    }

    /// Local incoming server sessions serving `domain`.
    pub fn get_incoming_server_sessions(&self, domain: &str) -> Vec<Arc<Session>> {
        self.caches
            .incoming_by_domain
            .get(&domain.to_string())
            .unwrap_or_default()
            .iter()
            .filter_map(|stream_id| self.arena.get(stream_id))
            .collect()
    }

    pub fn validated_domains(&self, stream_id: &StreamId) -> Vec<String> {
        self.caches
            .validated_domains
            .get(stream_id)
            .unwrap_or_default()
    }

    /// Route `pair` through an outgoing server session.
    pub fn register_outgoing_server_session(
        &self,
        pair: &DomainPair,
        session: &Session,
    ) -> Result<(), RouterError> {
        let remote = domain_jid(&pair.remote)
            .ok_or_else(|| RouterError::malformed(format!("invalid domain {}", pair.remote)))?;
        session.set_address(remote);
        session.set_status(SessionStatus::Authenticated);
        self.routing.add_server_route(pair, session)
    }

    pub fn unregister_outgoing_server_session(&self, pair: &DomainPair) -> bool {
        self.routing.remove_server_route(pair)
    }

    /// Route `domain` to a component session.
    pub fn register_component_session(&self, domain: &str, session: &Session) -> Result<(), RouterError> {
        let address = domain_jid(domain)
            .ok_or_else(|| RouterError::malformed(format!("invalid domain {domain}")))?;
        session.set_address(address);
        session.set_status(SessionStatus::Authenticated);
        self.routing.add_component_route(domain, session)
    }

    pub fn unregister_component_session(&self, domain: &str) -> bool {
        self.routing.remove_component_route(domain)
    }

    // ------------------------------------------------------------------
    // Counters and sweeps
    // ------------------------------------------------------------------

    pub fn active_client_count(&self) -> usize {
        self.arena
            .of_kind(SessionKind::Client)
            .iter()
            .filter(|s| s.is_authenticated())
            .count()
    }

    pub fn pre_auth_count(&self) -> usize {
        self.arena
            .all()
            .iter()
            .filter(|s| s.status() == SessionStatus::Connecting)
            .count()
    }

    pub fn incoming_server_count(&self) -> usize {
        self.arena.of_kind(SessionKind::IncomingServer).len()
    }

    fn record_counts(&self) {
        metrics::record_session_count(self.active_client_count() as i64, "client");
        metrics::record_session_count(self.pre_auth_count() as i64, "pre_auth");
        metrics::record_session_count(self.incoming_server_count() as i64, "incoming_server");
    }

    /// Close server sessions without traffic for longer than the idle timeout.
    pub async fn close_idle_server_sessions(&self, now: Instant) -> usize {
        let timeout = self.config.server_idle_timeout();
        let idle: Vec<Arc<Session>> = self
            .arena
            .all()
            .into_iter()
            .filter(|s| s.kind().is_server())
            .filter(|s| now.saturating_duration_since(s.last_active()) > timeout)
            .collect();

        let mut closed = 0;
        for session in idle {
            if self
                .remove_session(&session, Some(stream_errors::CONNECTION_TIMEOUT))
                .await
            {
                closed += 1;
            }
        }
        closed
    }

    /// Close sessions that never authenticated within the pre-auth timeout.
    pub async fn close_stale_pre_auth_sessions(&self, now: Instant) -> usize {
        let timeout = self.config.pre_auth_timeout();
        let stale: Vec<Arc<Session>> = self
            .arena
            .all()
            .into_iter()
            .filter(|s| s.status() == SessionStatus::Connecting)
            .filter(|s| now.saturating_duration_since(s.connected_at()) > timeout)
            .collect();

        let mut closed = 0;
        for session in stale {
            if self
                .remove_session(&session, Some(stream_errors::CONNECTION_TIMEOUT))
                .await
            {
                closed += 1;
            }
        }
        closed
    }

    /// End detached sessions whose resumption window passed.
    pub async fn reap_detached_sessions(&self, now: Instant) -> usize {
        let timeout = self.config.detach_timeout();
        let expired: Vec<Arc<Session>> = self
            .arena
            .of_kind(SessionKind::Client)
            .into_iter()
            .filter(|s| {
                s.is_detached()
                    && s.detached_since()
                        .map(|since| now.saturating_duration_since(since) >= timeout)
                        .unwrap_or(false)
            })
            .collect();

        let mut reaped = 0;
        for session in expired {
            if self.terminate_detached(&session).await || self.remove_detached(&session) {
                reaped += 1;
            }
        }
        reaped
    }
}

/// Cluster tasks addressed to this node. Conflicts are settled here, the
/// rest is routing work.
#[async_trait]
impl ClusterTaskHandler for SessionManager {
    async fn handle_cluster_task(&self, task: ClusterTask) -> ClusterTaskResult {
        match task {
            ClusterTask::ResolveConflict { jid } => match self.routing.get_client_route(&jid) {
                Some(existing) => {
                    if self.kick_for_conflict(&existing).await {
                        ClusterTaskResult::Delivered
                    } else {
                        ClusterTaskResult::Refused
                    }
                }
                None => ClusterTaskResult::NoRoute,
            },
            other => self.routing.handle_cluster_task(other).await,
        }
    }
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("domain", &self.domain)
            .field("session_count", &self.arena.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::StandaloneCluster;
    use crate::connection::{ChannelConnection, OutboundStanza};
    use crate::policy::InMemoryOfflineStore;
    use crate::routing::RoutingCaches;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use xmpp_parsers::message::Message;

    fn manager(config: RouterConfig) -> (Arc<SessionManager>, Arc<InMemoryOfflineStore>) {
        let arena = Arc::new(SessionArena::new());
        let routing = Arc::new(RoutingTable::new(
            config.domain.as_str(),
            Arc::new(StandaloneCluster::default()),
            RoutingCaches::local(),
            Arc::clone(&arena),
        ));
        let offline = Arc::new(InMemoryOfflineStore::new(10));
        let manager = SessionManager::new(
            &config,
            arena,
            routing,
            SessionCaches::local(),
            Arc::clone(&offline) as Arc<dyn OfflineStore>,
        );
        (manager, offline)
    }

    fn connect(manager: &Arc<SessionManager>) -> (Arc<Session>, mpsc::Receiver<OutboundStanza>) {
        let (conn, rx) = ChannelConnection::new(64, true);
        (manager.create_session(SessionKind::Client, conn), rx)
    }

    fn full(s: &str) -> FullJid {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_conflict_limit_zero_kicks_old_session() {
        let (manager, _) = manager(RouterConfig::new("waddle.social"));
        let (old, mut old_rx) = connect(&manager);
        let (new, _new_rx) = connect(&manager);
        let jid = full("alice@waddle.social/phone");

        manager.bind(&old, jid.clone(), false).await.unwrap();
        manager.bind(&new, jid.clone(), false).await.unwrap();

        assert!(old.is_closed());
        assert!(matches!(
            old_rx.try_recv(),
            Ok(OutboundStanza::RawText(text)) if text.contains("<conflict")
        ));
        assert_eq!(
            manager.routing().get_client_route(&jid).map(|s| s.stream_id().clone()),
            Some(new.stream_id().clone())
        );
    }

    #[tokio::test]
    async fn test_conflict_limit_never_kick() {
        let (manager, _) = manager(RouterConfig::new("waddle.social").with_conflict_limit(-1));
        let (old, _old_rx) = connect(&manager);
        let (new, _new_rx) = connect(&manager);
        let jid = full("alice@waddle.social/phone");

        manager.bind(&old, jid.clone(), false).await.unwrap();
        let err = manager.bind(&new, jid, false).await.unwrap_err();

        assert!(matches!(err, RouterError::ResourceConflict(_)));
        assert!(!old.is_closed());
    }

    #[tokio::test]
    async fn test_available_flushes_offline_messages() {
        let (manager, offline) = manager(RouterConfig::new("waddle.social"));
        let mut stored = Message::new(Some("alice@waddle.social".parse().unwrap()));
        stored.from = Some("bob@waddle.social/laptop".parse().unwrap());
        assert!(offline.store_offline(&stored));

        let (session, mut rx) = connect(&manager);
        manager
            .bind(&session, full("alice@waddle.social/phone"), false)
            .await
            .unwrap();
        manager
            .session_available(&session, Presence::new(PresenceType::None))
            .unwrap();

        assert!(matches!(
            rx.try_recv(),
            Ok(OutboundStanza::Stanza(Stanza::Message(_)))
        ));
        assert_eq!(offline.get_size("alice"), 0);
    }

    #[tokio::test]
    async fn test_resume_replays_backlog() {
        let (manager, _) = manager(RouterConfig::new("waddle.social"));
        let (session, _rx) = connect(&manager);
        let jid = full("alice@waddle.social/phone");
        manager.bind(&session, jid.clone(), false).await.unwrap();
        session.set_resumable(true);

        manager.detach(&session);
        let to = Jid::from(jid.clone());
        manager
            .routing()
            .route_packet(&to, Stanza::Message(Message::new(Some(to.clone()))))
            .await;
        assert_eq!(session.backlog_len(), 1);

        let (new_conn, mut new_rx) = ChannelConnection::new(64, true);
        let resumed = manager.resume(session.stream_id(), new_conn).unwrap();
        assert_eq!(resumed.stream_id(), session.stream_id());
        assert!(new_rx.try_recv().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_ends_expired_detached_sessions() {
        let (manager, _) = manager(RouterConfig::new("waddle.social"));
        let (session, _rx) = connect(&manager);
        let jid = full("alice@waddle.social/phone");
        manager.bind(&session, jid.clone(), false).await.unwrap();
        manager.detach(&session);

        assert_eq!(manager.reap_detached_sessions(Instant::now()).await, 0);

        tokio::time::advance(manager.config().detach_timeout() + Duration::from_secs(1)).await;
        assert_eq!(manager.reap_detached_sessions(Instant::now()).await, 1);
        assert!(!manager.routing().has_client_route(&jid));
        assert!(manager.get_session(session.stream_id()).is_none());
    }

    #[tokio::test]
    async fn test_incoming_server_index() {
        let (manager, _) = manager(RouterConfig::new("waddle.social"));
        let (conn, _rx) = ChannelConnection::new(8, true);
        let session = manager.create_session(SessionKind::IncomingServer, conn);

        manager
            .register_incoming_server_session("example.com", &session)
            .await
            .unwrap();
        manager
            .register_incoming_server_session("chat.example.com", &session)
            .await
            .unwrap();
        assert_eq!(manager.get_incoming_server_sessions("example.com").len(), 1);
        assert_eq!(manager.validated_domains(session.stream_id()).len(), 2);

        assert!(
            manager
                .unregister_incoming_server_session("example.com", session.stream_id())
                .await
        );
        assert!(manager.get_incoming_server_sessions("example.com").is_empty());
        assert_eq!(manager.unregister_incoming_server(session.stream_id()).await, 1);
    }

    #[tokio::test]
    async fn test_connection_close_removes_route() {
        let (manager, _) = manager(RouterConfig::new("waddle.social"));
        let (conn, _rx) = ChannelConnection::new(8, true);
        let session = manager.create_session(SessionKind::Client, conn.clone());
        let jid = full("alice@waddle.social/phone");
        manager.bind(&session, jid.clone(), false).await.unwrap();

        conn.close();

        assert!(!manager.routing().has_client_route(&jid));
        assert!(session.is_closed());
    }
}

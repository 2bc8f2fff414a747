//! The routing table.
//!
//! Maps addresses to destinations: full client JIDs to sessions, domain
//! pairs to server-to-server sessions and component domains to the nodes
//! hosting them. The cluster-visible part lives in [`Cache`]s shared by
//! all members; the node-local part maps routes to stream IDs that are
//! resolved through the [`SessionArena`], so the table never owns a
//! session.
//!
//! ## Resolution order
//!
//! 1. A component hosting the target domain (local instance preferred)
//! 2. A server-to-server route for a remote domain
//! 3. A full client JID on the local domain, on this node or another one
//! 4. The remote-server dialer, when federation is enabled
//!
//! Bare JIDs are not resolved here: the routers pick resources with
//! [`RoutingTable::get_routes`] and route each full JID.

mod directed;

pub use directed::DirectedPresences;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use jid::{BareJid, FullJid, Jid};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use xmpp_parsers::presence::{Presence, Type as PresenceType};

use crate::address::{DomainPair, NodeId, StreamId};
use crate::cluster::{
    Cache, ClusterTask, ClusterTaskHandler, ClusterTaskResult, ClusterTransport, LocalCache,
};
use crate::connection::SendResult;
use crate::policy::RemoteServerDialer;
use crate::session::{Session, SessionArena};
use crate::stanza::Stanza;
use crate::RouterError;

/// Cluster-wide record of a client route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRoute {
    /// Node holding the session
    pub node_id: NodeId,
    /// Whether the session has sent available presence
    pub available: bool,
}

/// Outcome of [`RoutingTable::route_packet`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingResult {
    /// Handed to a session on this node
    DeliveredLocal,
    /// Handed to the cluster member holding the route
    ForwardedToNode(NodeId),
    /// Handed to a server-to-server session or the dialer
    SentToRemote,
    /// Handed to a component
    SentToComponent,
    /// No destination exists
    NoRoute,
    /// The target is remote and federation is off
    FederationDisabled,
    /// A destination exists but did not take the stanza
    Failed { reason: String },
}

impl RoutingResult {
    pub fn is_delivered(&self) -> bool {
        matches!(
            self,
            RoutingResult::DeliveredLocal
                | RoutingResult::ForwardedToNode(_)
                | RoutingResult::SentToRemote
                | RoutingResult::SentToComponent
        )
    }
}

/// Handles to the cluster-visible routing caches.
///
/// Cloning shares the underlying caches.
#[derive(Clone)]
pub struct RoutingCaches {
    /// Full JID of registered users -> route
    pub users: Arc<dyn Cache<FullJid, ClientRoute>>,
    /// Full JID of anonymous users -> route
    pub anonymous_users: Arc<dyn Cache<FullJid, ClientRoute>>,
    /// Bare JID -> bound resources in binding order
    pub user_sessions: Arc<dyn Cache<BareJid, Vec<FullJid>>>,
    /// Domain pair -> node owning the outgoing session
    pub servers: Arc<dyn Cache<DomainPair, NodeId>>,
    /// Component domain -> nodes hosting it
    pub components: Arc<dyn Cache<String, Vec<NodeId>>>,
}

impl RoutingCaches {
    /// Fresh in-process caches.
    pub fn local() -> Self {
        Self {
            users: LocalCache::shared("Routing Users Cache"),
            anonymous_users: LocalCache::shared("Routing AnonymousUsers Cache"),
            user_sessions: LocalCache::shared("Routing User Sessions"),
            servers: LocalCache::shared("Routing Servers Cache"),
            components: LocalCache::shared("Routing Components Cache"),
        }
    }
}

impl Default for RoutingCaches {
    fn default() -> Self {
        Self::local()
    }
}

/// Cluster-aware address to destination map.
pub struct RoutingTable {
    domain: String,
    node_id: NodeId,
    cluster: Arc<dyn ClusterTransport>,
    caches: RoutingCaches,
    arena: Arc<SessionArena>,
    local_clients: DashMap<FullJid, StreamId>,
    local_servers: DashMap<DomainPair, StreamId>,
    local_components: DashMap<String, StreamId>,
    directed: DirectedPresences,
    federation_enabled: bool,
    dialer: Option<Arc<dyn RemoteServerDialer>>,
}

impl RoutingTable {
    pub fn new(
        domain: impl Into<String>,
        cluster: Arc<dyn ClusterTransport>,
        caches: RoutingCaches,
        arena: Arc<SessionArena>,
    ) -> Self {
        let domain = domain.into();
        let node_id = cluster.node_id().clone();
        info!(domain = %domain, node_id = %node_id, "Creating routing table");
        Self {
            domain,
            node_id,
            cluster,
            caches,
            arena,
            local_clients: DashMap::new(),
            local_servers: DashMap::new(),
            local_components: DashMap::new(),
            directed: DirectedPresences::new(),
            federation_enabled: false,
            dialer: None,
        }
    }

    /// Allow routing to domains without a server route.
    pub fn with_federation(
        mut self,
        enabled: bool,
        dialer: Option<Arc<dyn RemoteServerDialer>>,
    ) -> Self {
        self.federation_enabled = enabled;
        self.dialer = dialer;
        self
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn cluster(&self) -> &Arc<dyn ClusterTransport> {
        &self.cluster
    }

    pub fn directed_presences(&self) -> &DirectedPresences {
        &self.directed
    }

    pub fn is_local_domain(&self, domain: &str) -> bool {
        domain == self.domain
    }

    // ------------------------------------------------------------------
    // Client routes
    // ------------------------------------------------------------------

    /// Register `session` as the owner of `jid`.
    ///
    /// An existing route for the same JID is replaced. Returns whether the
    /// route is new.
    #[instrument(skip(self, session), fields(jid = %jid, stream_id = %session.stream_id()))]
    pub fn add_client_route(&self, jid: &FullJid, session: &Session) -> Result<bool, RouterError> {
        if session.is_closed() {
            warn!("Refusing route to closed session");
            return Err(RouterError::SessionClosed(session.stream_id().to_string()));
        }

        let route = ClientRoute {
            node_id: self.node_id.clone(),
            available: session.is_available(),
        };
        let (cache, other) = if session.is_anonymous() {
            (&self.caches.anonymous_users, &self.caches.users)
        } else {
            (&self.caches.users, &self.caches.anonymous_users)
        };
        let replaced_other = other.remove(jid).is_some();
        let previous = cache.put(jid.clone(), route);
        self.track_user_session(jid);
        self.local_clients
            .insert(jid.clone(), session.stream_id().clone());

        let added = previous.is_none() && !replaced_other;
        debug!(added, available = session.is_available(), "Client route registered");
        Ok(added)
    }

    /// Update the availability flag of an existing route.
    pub fn set_client_route_availability(&self, jid: &FullJid, available: bool) -> bool {
        let mut update = |current: Option<&ClientRoute>| {
            current.map(|route| ClientRoute {
                node_id: route.node_id.clone(),
                available,
            })
        };
        self.caches.users.compute(jid.clone(), &mut update).is_some()
            || self
                .caches
                .anonymous_users
                .compute(jid.clone(), &mut update)
                .is_some()
    }

    /// Remove the route for `jid`, whoever owns it.
    #[instrument(skip(self), fields(jid = %jid))]
    pub fn remove_client_route(&self, jid: &FullJid) -> bool {
        let removed_user = self.caches.users.remove(jid).is_some();
        let removed_anonymous = self.caches.anonymous_users.remove(jid).is_some();
        let removed_local = self.local_clients.remove(jid).is_some();
        self.untrack_user_session(jid);

        let removed = removed_user || removed_anonymous || removed_local;
        debug!(removed, "Client route removed");
        removed
    }

    /// Remove the route for `jid` only if `stream_id` still owns it locally.
    ///
    /// Used when a session goes away, so a newer bind of the same JID keeps
    /// its route.
    pub fn remove_client_route_if_owned(&self, jid: &FullJid, stream_id: &StreamId) -> bool {
        if self
            .local_clients
            .remove_if(jid, |_, owner| owner == stream_id)
            .is_none()
        {
            return false;
        }

        let node_id = &self.node_id;
        let mut drop_own = |current: Option<&ClientRoute>| {
            current.filter(|route| route.node_id != *node_id).cloned()
        };
        let still_routed = self.caches.users.compute(jid.clone(), &mut drop_own).is_some()
            | self
                .caches
                .anonymous_users
                .compute(jid.clone(), &mut drop_own)
                .is_some();
        if !still_routed {
            self.untrack_user_session(jid);
        }
        debug!(jid = %jid, stream_id = %stream_id, "Client route released by its session");
        true
    }

    /// The local session routed at `jid`.
    pub fn get_client_route(&self, jid: &FullJid) -> Option<Arc<Session>> {
        let stream_id = self.local_clients.get(jid)?.value().clone();
        self.arena
            .get(&stream_id)
            .filter(|session| !session.is_closed())
    }

    /// The local session for `jid`, if this node still owns the route.
    ///
    /// A local entry whose route another node has taken over is dropped.
    fn owned_client_route(&self, jid: &FullJid) -> Option<Arc<Session>> {
        let session = self.get_client_route(jid)?;
        match self.client_route_info(jid) {
            Some(route) if route.node_id != self.node_id => {
                debug!(jid = %jid, owner = %route.node_id, "Route taken over by another node, dropping local entry");
                self.local_clients
                    .remove_if(jid, |_, owner| owner == session.stream_id());
                None
            }
            _ => Some(session),
        }
    }

    /// The cluster-wide record for `jid`.
    pub fn client_route_info(&self, jid: &FullJid) -> Option<ClientRoute> {
        self.caches
            .users
            .get(jid)
            .or_else(|| self.caches.anonymous_users.get(jid))
    }

    pub fn has_client_route(&self, jid: &FullJid) -> bool {
        self.client_route_info(jid).is_some()
    }

    pub fn is_anonymous_route(&self, jid: &FullJid) -> bool {
        self.caches.anonymous_users.contains_key(jid)
    }

    /// Whether the destination for `jid` is hosted on this node.
    pub fn is_local_route(&self, jid: &Jid) -> bool {
        if jid.node().is_none() {
            return self.local_components.contains_key(jid.domain().as_str());
        }
        match jid.clone().try_into_full() {
            Ok(full) => self.local_clients.contains_key(&full),
            Err(_) => false,
        }
    }

    /// Every bound resource of `user` in binding order, available or not.
    pub fn user_routes(&self, user: &BareJid) -> Vec<FullJid> {
        self.caches.user_sessions.get(user).unwrap_or_default()
    }

    /// Local sessions of `user` in binding order.
    pub fn local_sessions_of(&self, user: &BareJid) -> Vec<Arc<Session>> {
        self.user_routes(user)
            .iter()
            .filter_map(|jid| self.get_client_route(jid))
            .collect()
    }

    pub fn local_client_count(&self) -> usize {
        self.local_clients.len()
    }

    /// Every client session routed on this node.
    pub fn get_local_sessions(&self) -> Vec<Arc<Session>> {
        let stream_ids: Vec<StreamId> = self
            .local_clients
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        stream_ids
            .iter()
            .filter_map(|stream_id| self.arena.get(stream_id))
            .filter(|session| !session.is_closed())
            .collect()
    }

    fn track_user_session(&self, jid: &FullJid) {
        self.caches
            .user_sessions
            .compute(jid.to_bare(), &mut |current: Option<&Vec<FullJid>>| {
                let mut resources = current.cloned().unwrap_or_default();
                if !resources.contains(jid) {
                    resources.push(jid.clone());
                }
                Some(resources)
            });
    }

    fn untrack_user_session(&self, jid: &FullJid) {
        self.caches
            .user_sessions
            .compute(jid.to_bare(), &mut |current: Option<&Vec<FullJid>>| {
                let mut resources = current?.clone();
                resources.retain(|resource| resource != jid);
                (!resources.is_empty()).then_some(resources)
            });
    }

    // ------------------------------------------------------------------
    // Server and component routes
    // ------------------------------------------------------------------

    /// Register the outgoing session for `pair`.
    ///
    /// A pair owned by another node cannot be taken over.
    #[instrument(skip(self, session), fields(pair = %pair))]
    pub fn add_server_route(&self, pair: &DomainPair, session: &Session) -> Result<(), RouterError> {
        if session.is_closed() {
            return Err(RouterError::SessionClosed(session.stream_id().to_string()));
        }
        if let Some(owner) = self
            .caches
            .servers
            .put_if_absent(pair.clone(), self.node_id.clone())
        {
            if owner != self.node_id {
                warn!(owner = %owner, "Server route owned by another node");
                return Err(RouterError::RouteOwnedElsewhere {
                    route: pair.to_string(),
                    node: owner.to_string(),
                });
            }
        }
        self.local_servers
            .insert(pair.clone(), session.stream_id().clone());
        debug!("Server route registered");
        Ok(())
    }

    /// Remove the locally owned route for `pair`.
    pub fn remove_server_route(&self, pair: &DomainPair) -> bool {
        if self.local_servers.remove(pair).is_none() {
            return false;
        }
        let node_id = &self.node_id;
        self.caches
            .servers
            .compute(pair.clone(), &mut |current: Option<&NodeId>| {
                current.filter(|owner| *owner != node_id).cloned()
            });
        debug!(pair = %pair, "Server route removed");
        true
    }

    pub fn has_server_route(&self, pair: &DomainPair) -> bool {
        self.caches.servers.contains_key(pair)
    }

    pub fn get_server_route(&self, pair: &DomainPair) -> Option<Arc<Session>> {
        let stream_id = self.local_servers.get(pair)?.value().clone();
        self.arena
            .get(&stream_id)
            .filter(|session| !session.is_closed())
    }

    /// Register this node as a host of the component at `domain`.
    #[instrument(skip(self, session), fields(domain = %domain))]
    pub fn add_component_route(&self, domain: &str, session: &Session) -> Result<(), RouterError> {
        if session.is_closed() {
            return Err(RouterError::SessionClosed(session.stream_id().to_string()));
        }
        let node_id = &self.node_id;
        self.caches
            .components
            .compute(domain.to_string(), &mut |current: Option<&Vec<NodeId>>| {
                let mut nodes = current.cloned().unwrap_or_default();
                if !nodes.contains(node_id) {
                    nodes.push(node_id.clone());
                }
                Some(nodes)
            });
        self.local_components
            .insert(domain.to_string(), session.stream_id().clone());
        debug!("Component route registered");
        Ok(())
    }

    /// Stop hosting the component at `domain` on this node.
    ///
    /// Returns `true` when no node hosts it any more.
    pub fn remove_component_route(&self, domain: &str) -> bool {
        self.local_components.remove(domain);
        let node_id = &self.node_id;
        let remaining = self
            .caches
            .components
            .compute(domain.to_string(), &mut |current: Option<&Vec<NodeId>>| {
                let mut nodes = current?.clone();
                nodes.retain(|node| node != node_id);
                (!nodes.is_empty()).then_some(nodes)
            });
        debug!(domain, gone = remaining.is_none(), "Component route removed");
        remaining.is_none()
    }

    pub fn has_component_route(&self, domain: &str) -> bool {
        self.caches.components.contains_key(&domain.to_string())
    }

    /// Nodes hosting the component at `domain`.
    pub fn component_nodes(&self, domain: &str) -> Vec<NodeId> {
        self.caches
            .components
            .get(&domain.to_string())
            .unwrap_or_default()
    }

    fn local_component_session(&self, domain: &str) -> Option<Arc<Session>> {
        let stream_id = self.local_components.get(domain)?.value().clone();
        self.arena
            .get(&stream_id)
            .filter(|session| !session.is_closed())
    }

    // ------------------------------------------------------------------
    // Lookup and delivery
    // ------------------------------------------------------------------

    /// Candidate destinations for `jid` as seen by `requester`.
    ///
    /// Client routes count when available, or when the requester received
    /// directed presence from that resource. A bare JID expands to its
    /// resources in binding order.
    pub fn get_routes(&self, jid: &Jid, requester: Option<&Jid>) -> Vec<Jid> {
        let domain = jid.domain().as_str();
        if jid.node().is_none() {
            let pair = DomainPair::new(self.domain.as_str(), domain);
            return if self.has_component_route(domain) || self.has_server_route(&pair) {
                vec![jid.clone()]
            } else {
                Vec::new()
            };
        }

        match jid.clone().try_into_full() {
            Ok(full) => {
                if self.is_routable_to(&full, requester) {
                    vec![jid.clone()]
                } else {
                    Vec::new()
                }
            }
            Err(bare) => self
                .user_routes(&bare)
                .into_iter()
                .filter(|full| self.is_routable_to(full, requester))
                .map(Jid::from)
                .collect(),
        }
    }

    fn is_routable_to(&self, jid: &FullJid, requester: Option<&Jid>) -> bool {
        match self.client_route_info(jid) {
            Some(route) => {
                route.available
                    || requester
                        .map(|requester| self.directed.has_directed_presence(jid, requester))
                        .unwrap_or(false)
            }
            None => false,
        }
    }

    /// Hand `stanza` to the destination of `to`.
    ///
    /// Never fails loudly: an unresolvable address yields
    /// [`RoutingResult::NoRoute`] and the caller applies its own fallback.
    #[instrument(skip(self, stanza), fields(to = %to, stanza = stanza.name()))]
    pub async fn route_packet(&self, to: &Jid, stanza: Stanza) -> RoutingResult {
        let domain = to.domain().as_str();

        let result = if self.has_component_route(domain) {
            self.route_to_component(domain, to, stanza).await
        } else if self.is_local_domain(domain) {
            self.route_to_client(to, stanza).await
        } else {
            self.route_to_remote_server(domain, to, stanza).await
        };

        debug!(result = ?result, "Routed stanza");
        result
    }

    async fn route_to_component(&self, domain: &str, to: &Jid, stanza: Stanza) -> RoutingResult {
        if let Some(session) = self.local_component_session(domain) {
            return deliver_to_session(&session, stanza, RoutingResult::SentToComponent);
        }

        for node in self
            .component_nodes(domain)
            .into_iter()
            .filter(|node| *node != self.node_id)
        {
            let task = ClusterTask::RoutePacket {
                to: to.clone(),
                stanza: stanza.clone(),
            };
            match self.cluster.do_synchronous_cluster_task(task, &node).await {
                Ok(ClusterTaskResult::Delivered) => return RoutingResult::ForwardedToNode(node),
                Ok(_) => debug!(node = %node, "Component not reachable on node"),
                Err(e) => warn!(node = %node, error = %e, "Failed to route to component node"),
            }
        }
        RoutingResult::NoRoute
    }

    async fn route_to_client(&self, to: &Jid, stanza: Stanza) -> RoutingResult {
        let Ok(full) = to.clone().try_into_full() else {
            return RoutingResult::NoRoute;
        };

        if let Some(session) = self.owned_client_route(&full) {
            return deliver_to_session(&session, stanza, RoutingResult::DeliveredLocal);
        }

        match self.client_route_info(&full) {
            Some(route) if route.node_id != self.node_id => {
                let task = ClusterTask::RoutePacket {
                    to: to.clone(),
                    stanza,
                };
                match self
                    .cluster
                    .do_synchronous_cluster_task(task, &route.node_id)
                    .await
                {
                    Ok(ClusterTaskResult::Delivered) => {
                        RoutingResult::ForwardedToNode(route.node_id)
                    }
                    Ok(_) => RoutingResult::NoRoute,
                    Err(e) => {
                        warn!(node = %route.node_id, error = %e, "Remote route failed, removing it");
                        self.remove_client_route(&full);
                        RoutingResult::NoRoute
                    }
                }
            }
            Some(_) => {
                debug!("Stale local route without session, removing it");
                self.remove_client_route(&full);
                RoutingResult::NoRoute
            }
            None => RoutingResult::NoRoute,
        }
    }

    async fn route_to_remote_server(
        &self,
        remote_domain: &str,
        to: &Jid,
        stanza: Stanza,
    ) -> RoutingResult {
        let pair = DomainPair::new(self.domain.as_str(), remote_domain);

        if let Some(session) = self.get_server_route(&pair) {
            return deliver_to_session(&session, stanza, RoutingResult::SentToRemote);
        }

        if let Some(owner) = self.caches.servers.get(&pair) {
            if owner != self.node_id {
                let task = ClusterTask::RoutePacket {
                    to: to.clone(),
                    stanza: stanza.clone(),
                };
                match self.cluster.do_synchronous_cluster_task(task, &owner).await {
                    Ok(ClusterTaskResult::Delivered) => {
                        return RoutingResult::ForwardedToNode(owner)
                    }
                    Ok(_) => debug!(node = %owner, "Owning node lost the server session"),
                    Err(e) => warn!(node = %owner, error = %e, "Failed to reach server route owner"),
                }
            }
        }

        if !self.federation_enabled {
            debug!(pair = %pair, "Federation disabled, not dialing");
            return RoutingResult::FederationDisabled;
        }

        match &self.dialer {
            Some(dialer) => match dialer.dial_and_send(&pair, stanza).await {
                Ok(()) => RoutingResult::SentToRemote,
                Err(e) => RoutingResult::Failed {
                    reason: e.to_string(),
                },
            },
            None => RoutingResult::NoRoute,
        }
    }

    /// Route using destinations hosted on this node only.
    pub fn route_local(&self, to: &Jid, stanza: Stanza) -> RoutingResult {
        let domain = to.domain().as_str();

        if let Some(session) = self.local_component_session(domain) {
            return deliver_to_session(&session, stanza, RoutingResult::SentToComponent);
        }

        if self.is_local_domain(domain) {
            return match to
                .clone()
                .try_into_full()
                .ok()
                .and_then(|full| self.owned_client_route(&full))
            {
                Some(session) => {
                    deliver_to_session(&session, stanza, RoutingResult::DeliveredLocal)
                }
                None => RoutingResult::NoRoute,
            };
        }

        let pair = DomainPair::new(self.domain.as_str(), domain);
        match self.get_server_route(&pair) {
            Some(session) => deliver_to_session(&session, stanza, RoutingResult::SentToRemote),
            None => RoutingResult::NoRoute,
        }
    }

    /// Deliver `stanza` to every client session, or only the local ones.
    ///
    /// Returns the number of local sessions reached.
    pub async fn broadcast_packet(&self, stanza: Stanza, only_local: bool) -> usize {
        let delivered = self.broadcast_local(&stanza);
        if !only_local && self.cluster.is_clustered() {
            if let Err(e) = self
                .cluster
                .do_cluster_task(ClusterTask::BroadcastLocal { stanza })
                .await
            {
                warn!(error = %e, "Cluster broadcast failed");
            }
        }
        delivered
    }

    fn broadcast_local(&self, stanza: &Stanza) -> usize {
        self.get_local_sessions()
            .iter()
            .filter(|session| session.deliver(stanza.clone()).is_sent())
            .count()
    }

    /// Tell client sessions that `jid` went offline.
    pub async fn broadcast_unavailable(&self, jid: &FullJid, only_local: bool) -> usize {
        let mut presence = Presence::new(PresenceType::Unavailable);
        presence.from = Some(Jid::from(jid.clone()));
        presence.to = Some(Jid::from(jid.to_bare()));
        self.broadcast_packet(Stanza::Presence(presence), only_local)
            .await
    }

    // ------------------------------------------------------------------
    // Cluster membership
    // ------------------------------------------------------------------

    /// Publish this node's routes into the shared caches after joining.
    #[instrument(skip(self), fields(node_id = %self.node_id))]
    pub fn joined_cluster(&self) -> usize {
        let published = self.republish_local_routes();
        info!(published, "Re-published local routes after joining cluster");
        published
    }

    /// Keep only this node's routes after losing the cluster.
    ///
    /// Client routes of other nodes are dropped and local sessions are told
    /// those users went offline.
    #[instrument(skip(self), fields(node_id = %self.node_id))]
    pub async fn left_cluster(&self) -> usize {
        self.republish_local_routes();

        let own = self.node_id.clone();
        let dropped = self.purge_node_routes(|node| *node != own);
        for jid in &dropped {
            self.broadcast_unavailable(jid, true).await;
        }
        info!(dropped = dropped.len(), "Dropped routes of other nodes after leaving cluster");
        dropped.len()
    }

    /// Purge the routes of a departed node. Only the senior member acts.
    #[instrument(skip(self), fields(node_id = %self.node_id, departed = %node))]
    pub async fn left_cluster_node(&self, node: &NodeId) -> usize {
        if !self.cluster.is_senior_member() {
            debug!("Not the senior member, leaving cleanup to it");
            return 0;
        }

        let dropped = self.purge_node_routes(|owner| owner == node);
        for jid in &dropped {
            self.broadcast_unavailable(jid, false).await;
        }
        info!(dropped = dropped.len(), "Purged routes of departed node");
        dropped.len()
    }

    fn republish_local_routes(&self) -> usize {
        let clients: Vec<(FullJid, StreamId)> = self
            .local_clients
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        let mut published = 0;
        for (jid, stream_id) in clients {
            let Some(session) = self.arena.get(&stream_id) else {
                continue;
            };
            let route = ClientRoute {
                node_id: self.node_id.clone(),
                available: session.is_available(),
            };
            if session.is_anonymous() {
                self.caches.anonymous_users.put(jid.clone(), route);
            } else {
                self.caches.users.put(jid.clone(), route);
            }
            self.track_user_session(&jid);
            published += 1;
        }

        let servers: Vec<DomainPair> = self
            .local_servers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for pair in servers {
            self.caches.servers.put(pair, self.node_id.clone());
            published += 1;
        }

        let components: Vec<String> = self
            .local_components
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        let node_id = &self.node_id;
        for domain in components {
            self.caches
                .components
                .compute(domain, &mut |current: Option<&Vec<NodeId>>| {
                    let mut nodes = current.cloned().unwrap_or_default();
                    if !nodes.contains(node_id) {
                        nodes.push(node_id.clone());
                    }
                    Some(nodes)
                });
            published += 1;
        }
        published
    }

    /// Remove every route whose owner matches; returns the dropped client JIDs.
    fn purge_node_routes(&self, owned_by: impl Fn(&NodeId) -> bool) -> Vec<FullJid> {
        let mut dropped = Vec::new();
        for cache in [&self.caches.users, &self.caches.anonymous_users] {
            for (jid, route) in cache.entries() {
                if owned_by(&route.node_id) {
                    cache.remove(&jid);
                    self.untrack_user_session(&jid);
                    dropped.push(jid);
                }
            }
        }

        for (pair, owner) in self.caches.servers.entries() {
            if owned_by(&owner) {
                self.caches.servers.remove(&pair);
            }
        }

        for domain in self.caches.components.keys() {
            self.caches
                .components
                .compute(domain, &mut |current: Option<&Vec<NodeId>>| {
                    let mut nodes = current?.clone();
                    nodes.retain(|node| !owned_by(node));
                    (!nodes.is_empty()).then_some(nodes)
                });
        }
        dropped
    }
}

fn deliver_to_session(session: &Session, stanza: Stanza, success: RoutingResult) -> RoutingResult {
    match session.deliver(stanza) {
        SendResult::Sent => success,
        SendResult::ChannelFull => RoutingResult::Failed {
            reason: "outbound channel full".to_string(),
        },
        SendResult::NotConnected | SendResult::ChannelClosed => RoutingResult::NoRoute,
    }
}

#[async_trait]
impl ClusterTaskHandler for RoutingTable {
    async fn handle_cluster_task(&self, task: ClusterTask) -> ClusterTaskResult {
        match task {
            ClusterTask::RoutePacket { to, stanza } => {
                if self.route_local(&to, stanza).is_delivered() {
                    ClusterTaskResult::Delivered
                } else {
                    ClusterTaskResult::NoRoute
                }
            }
            ClusterTask::BroadcastLocal { stanza } => {
                ClusterTaskResult::Broadcast(self.broadcast_local(&stanza))
            }
            ClusterTask::ResolveConflict { jid } => {
                debug!(jid = %jid, "Conflict resolution needs the session manager");
                ClusterTaskResult::NoRoute
            }
        }
    }
}

impl fmt::Debug for RoutingTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutingTable")
            .field("domain", &self.domain)
            .field("node_id", &self.node_id)
            .field("local_clients", &self.local_clients.len())
            .field("local_servers", &self.local_servers.len())
            .field("local_components", &self.local_components.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::StandaloneCluster;
    use crate::connection::{ChannelConnection, Connection};
    use crate::session::{SessionKind, SessionStatus};
    use xmpp_parsers::message::Message;

    fn table() -> (RoutingTable, Arc<SessionArena>) {
        let arena = Arc::new(SessionArena::new());
        let table = RoutingTable::new(
            "waddle.social",
            Arc::new(StandaloneCluster::new(NodeId::new("node-a"))),
            RoutingCaches::local(),
            Arc::clone(&arena),
        );
        (table, arena)
    }

    fn session(arena: &SessionArena, kind: SessionKind) -> Arc<Session> {
        let (conn, _rx) = ChannelConnection::new(16, true);
        let session = Arc::new(Session::new(
            StreamId::generate(),
            kind,
            "waddle.social",
            Some(conn as Arc<dyn Connection>),
        ));
        session.set_status(SessionStatus::Authenticated);
        arena.insert(Arc::clone(&session));
        session
    }

    fn full(s: &str) -> FullJid {
        s.parse().unwrap()
    }

    #[test]
    fn test_closed_session_is_never_routed() {
        let (table, arena) = table();
        let s = session(&arena, SessionKind::Client);
        s.close(None);

        assert!(table
            .add_client_route(&full("alice@waddle.social/phone"), &s)
            .is_err());
        assert!(!table.has_client_route(&full("alice@waddle.social/phone")));
    }

    #[test]
    fn test_release_keeps_newer_owner() {
        let (table, arena) = table();
        let jid = full("alice@waddle.social/phone");
        let old = session(&arena, SessionKind::Client);
        let new = session(&arena, SessionKind::Client);

        table.add_client_route(&jid, &old).unwrap();
        table.add_client_route(&jid, &new).unwrap();

        assert!(!table.remove_client_route_if_owned(&jid, old.stream_id()));
        assert_eq!(
            table.get_client_route(&jid).map(|s| s.stream_id().clone()),
            Some(new.stream_id().clone())
        );

        assert!(table.remove_client_route_if_owned(&jid, new.stream_id()));
        assert!(!table.has_client_route(&jid));
    }

    #[test]
    fn test_anonymous_routes_are_separate() {
        let (table, arena) = table();
        let jid = full("guest@waddle.social/web");
        let s = session(&arena, SessionKind::Client);
        s.set_anonymous(true);

        table.add_client_route(&jid, &s).unwrap();
        assert!(table.is_anonymous_route(&jid));
        assert!(table.has_client_route(&jid));
    }

    #[test]
    fn test_server_route_is_put_if_absent() {
        let (table, arena) = table();
        let pair = DomainPair::new("waddle.social", "example.com");
        table
            .caches
            .servers
            .put(pair.clone(), NodeId::new("node-b"));

        let s = session(&arena, SessionKind::OutgoingServer);
        let err = table.add_server_route(&pair, &s).unwrap_err();
        assert!(matches!(err, RouterError::RouteOwnedElsewhere { .. }));
        assert!(!table.remove_server_route(&pair));
        assert!(table.has_server_route(&pair));
    }

    #[test]
    fn test_component_route_removal_reports_last_host() {
        let (table, arena) = table();
        let s = session(&arena, SessionKind::Component);
        table.add_component_route("muc.waddle.social", &s).unwrap();
        table
            .caches
            .components
            .compute("muc.waddle.social".to_string(), &mut |current: Option<&Vec<NodeId>>| {
                let mut nodes = current.cloned().unwrap_or_default();
                nodes.push(NodeId::new("node-b"));
                Some(nodes)
            });

        assert!(!table.remove_component_route("muc.waddle.social"));
        assert_eq!(table.component_nodes("muc.waddle.social"), vec![NodeId::new("node-b")]);
    }

    #[tokio::test]
    async fn test_route_to_component_prefers_local() {
        let (table, arena) = table();
        let (conn, mut rx) = ChannelConnection::new(16, true);
        let component = Arc::new(Session::new(
            StreamId::generate(),
            SessionKind::Component,
            "waddle.social",
            Some(conn as Arc<dyn Connection>),
        ));
        component.set_status(SessionStatus::Authenticated);
        arena.insert(Arc::clone(&component));
        table
            .add_component_route("muc.waddle.social", &component)
            .unwrap();

        let to: Jid = "room@muc.waddle.social".parse().unwrap();
        let result = table
            .route_packet(&to, Stanza::Message(Message::new(Some(to.clone()))))
            .await;

        assert_eq!(result, RoutingResult::SentToComponent);
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_remote_domain_without_federation() {
        let (table, _arena) = table();
        let to: Jid = "bob@example.com".parse().unwrap();
        let result = table
            .route_packet(&to, Stanza::Message(Message::new(Some(to.clone()))))
            .await;
        assert_eq!(result, RoutingResult::FederationDisabled);
        assert!(!result.is_delivered());
    }
}

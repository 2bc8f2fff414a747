//! Sessions and their lifecycle.
//!
//! A [`Session`] is the server-side state of one stream: who it belongs to,
//! how far it got through authentication, its last presence and the
//! connection it writes to. Sessions live in the [`SessionArena`], keyed by
//! stream ID; everything else (the routing table, directed presence, the
//! incoming-server indexes) refers to them by key only.

mod cleanup;
mod manager;

pub use cleanup::{
    spawn_detached_reaper, spawn_pre_auth_cleanup, spawn_server_idle_cleanup,
};
pub use manager::{SessionCaches, SessionManager};

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use jid::{BareJid, FullJid, Jid};
use tokio::time::Instant;
use tracing::debug;
use xmpp_parsers::presence::{Presence, Show, Type as PresenceType};

use crate::address::StreamId;
use crate::connection::{Connection, SendResult};
use crate::error::generate_stream_error;
use crate::policy::StanzaFilter;
use crate::stanza::Stanza;

/// What is on the other end of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKind {
    /// A client (pre-auth until it binds a resource)
    Client,
    /// An external component
    Component,
    /// A remote server connected to us
    IncomingServer,
    /// A connection we opened to a remote server
    OutgoingServer,
    /// A connection manager multiplexing client streams
    ConnectionMultiplexer,
}

impl SessionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionKind::Client => "client",
            SessionKind::Component => "component",
            SessionKind::IncomingServer => "incoming_server",
            SessionKind::OutgoingServer => "outgoing_server",
            SessionKind::ConnectionMultiplexer => "multiplexer",
        }
    }

    pub fn is_server(&self) -> bool {
        matches!(self, SessionKind::IncomingServer | SessionKind::OutgoingServer)
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How far a session got.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionStatus {
    Connecting,
    Authenticated,
    Closed,
}

/// Rank of a presence `show` value; lower is more available.
pub fn show_rank(show: Option<&Show>) -> u8 {
    match show {
        Some(Show::Chat) => 0,
        None => 1,
        Some(Show::Away) => 2,
        Some(Show::Xa) => 3,
        Some(Show::Dnd) => 4,
    }
}

struct SessionState {
    address: Option<Jid>,
    status: SessionStatus,
    last_active: Instant,
    presence: Presence,
    detached_at: Option<Instant>,
}

/// The server-side state of one stream.
pub struct Session {
    stream_id: StreamId,
    kind: SessionKind,
    server_domain: String,
    created_at: DateTime<Utc>,
    connected_at: Instant,
    state: RwLock<SessionState>,
    connection: RwLock<Option<Arc<dyn Connection>>>,
    stanza_filter: RwLock<Option<Arc<dyn StanzaFilter>>>,
    backlog: Mutex<VecDeque<Stanza>>,
    max_backlog: usize,
    carbons_enabled: AtomicBool,
    anonymous: AtomicBool,
    resumable: AtomicBool,
    conflict_count: AtomicI32,
}

impl Session {
    /// Create a session in `Connecting` state.
    pub fn new(
        stream_id: StreamId,
        kind: SessionKind,
        server_domain: impl Into<String>,
        connection: Option<Arc<dyn Connection>>,
    ) -> Self {
        Self {
            stream_id,
            kind,
            server_domain: server_domain.into(),
            created_at: Utc::now(),
            connected_at: Instant::now(),
            state: RwLock::new(SessionState {
                address: None,
                status: SessionStatus::Connecting,
                last_active: Instant::now(),
                presence: Presence::new(PresenceType::Unavailable),
                detached_at: None,
            }),
            connection: RwLock::new(connection),
            stanza_filter: RwLock::new(None),
            backlog: Mutex::new(VecDeque::new()),
            max_backlog: 500,
            carbons_enabled: AtomicBool::new(false),
            anonymous: AtomicBool::new(false),
            resumable: AtomicBool::new(false),
            conflict_count: AtomicI32::new(0),
        }
    }

    /// Limit the stanzas buffered while detached.
    pub fn with_max_backlog(mut self, max_backlog: usize) -> Self {
        self.max_backlog = max_backlog;
        self
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, SessionState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, SessionState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_connection(&self) -> Option<Arc<dyn Connection>> {
        self.connection
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    /// The domain this server answers as on this stream.
    pub fn server_domain(&self) -> &str {
        &self.server_domain
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Monotonic creation time, used by the timeout sweeps.
    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    /// Bound address (full JID for clients, domain for servers/components).
    pub fn address(&self) -> Option<Jid> {
        self.read_state().address.clone()
    }

    pub fn full_jid(&self) -> Option<FullJid> {
        self.address().and_then(|jid| jid.try_into_full().ok())
    }

    pub fn bare_jid(&self) -> Option<BareJid> {
        self.address().map(|jid| jid.to_bare())
    }

    pub fn set_address(&self, address: Jid) {
        self.write_state().address = Some(address);
    }

    pub fn status(&self) -> SessionStatus {
        self.read_state().status
    }

    pub fn set_status(&self, status: SessionStatus) {
        self.write_state().status = status;
    }

    pub fn is_authenticated(&self) -> bool {
        self.status() == SessionStatus::Authenticated
    }

    pub fn is_closed(&self) -> bool {
        self.status() == SessionStatus::Closed
    }

    pub fn last_active(&self) -> Instant {
        self.read_state().last_active
    }

    /// Record activity on the stream.
    pub fn touch(&self) {
        self.write_state().last_active = Instant::now();
    }

    /// Last broadcast presence (unavailable until the first one).
    pub fn presence(&self) -> Presence {
        self.read_state().presence.clone()
    }

    pub fn set_presence(&self, presence: Presence) {
        self.write_state().presence = presence;
    }

    pub fn is_available(&self) -> bool {
        self.read_state().presence.type_ == PresenceType::None
    }

    pub fn priority(&self) -> i8 {
        self.read_state().presence.priority
    }

    pub fn show_rank(&self) -> u8 {
        show_rank(self.read_state().presence.show.as_ref())
    }

    pub fn is_carbons_enabled(&self) -> bool {
        self.carbons_enabled.load(Ordering::Relaxed)
    }

    pub fn set_carbons_enabled(&self, enabled: bool) {
        self.carbons_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_anonymous(&self) -> bool {
        self.anonymous.load(Ordering::Relaxed)
    }

    pub fn set_anonymous(&self, anonymous: bool) {
        self.anonymous.store(anonymous, Ordering::Relaxed);
    }

    /// Whether the session survives a dropped connection (stream management).
    pub fn is_resumable(&self) -> bool {
        self.resumable.load(Ordering::Relaxed)
    }

    pub fn set_resumable(&self, resumable: bool) {
        self.resumable.store(resumable, Ordering::Relaxed);
    }

    /// Count one more conflicting bind against this session.
    pub fn increment_conflict_count(&self) -> i32 {
        self.conflict_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Install the filter consulted by [`Session::can_process`].
    pub fn set_stanza_filter(&self, filter: Option<Arc<dyn StanzaFilter>>) {
        *self
            .stanza_filter
            .write()
            .unwrap_or_else(PoisonError::into_inner) = filter;
    }

    /// Whether this session would accept `stanza`.
    pub fn can_process(&self, stanza: &Stanza) -> bool {
        self.stanza_filter
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|filter| filter.can_process(stanza))
            .unwrap_or(true)
    }

    pub fn is_secure(&self) -> bool {
        self.current_connection()
            .map(|conn| conn.is_secure())
            .unwrap_or(false)
    }

    /// A detached session has lost its connection but keeps its route.
    pub fn is_detached(&self) -> bool {
        self.read_state().detached_at.is_some() && !self.is_closed()
    }

    pub fn detached_since(&self) -> Option<Instant> {
        self.read_state().detached_at
    }

    /// Start buffering, then drop the connection reference.
    pub fn detach(&self) -> Option<Arc<dyn Connection>> {
        self.write_state().detached_at = Some(Instant::now());
        self.connection
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Attach a (new) connection, ending detachment.
    pub fn attach(&self, connection: Arc<dyn Connection>) {
        *self
            .connection
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(connection);
        let mut state = self.write_state();
        state.detached_at = None;
        state.last_active = Instant::now();
    }

    /// Hand a stanza to the connection, or buffer it while detached.
    pub fn deliver(&self, stanza: Stanza) -> SendResult {
        if self.is_closed() {
            return SendResult::NotConnected;
        }

        if self.is_detached() {
            let mut backlog = self.backlog.lock().unwrap_or_else(PoisonError::into_inner);
            if backlog.len() >= self.max_backlog {
                backlog.pop_front();
                debug!(stream_id = %self.stream_id, "Detached backlog full, dropped oldest stanza");
            }
            backlog.push_back(stanza);
            return SendResult::Sent;
        }

        match self.current_connection() {
            Some(connection) => connection.deliver(stanza),
            None => SendResult::NotConnected,
        }
    }

    pub fn deliver_raw_text(&self, text: &str) -> SendResult {
        match self.current_connection() {
            Some(connection) => connection.deliver_raw_text(text),
            None => SendResult::NotConnected,
        }
    }

    /// Deliver everything buffered while detached. Returns how many were sent.
    pub fn flush_backlog(&self) -> usize {
        let pending: Vec<Stanza> = self
            .backlog
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();

        pending
            .into_iter()
            .map(|stanza| self.deliver(stanza))
            .filter(SendResult::is_sent)
            .count()
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Mark the session closed and close its connection.
    ///
    /// With a stream error condition the error is written before the
    /// stream is shut.
    pub fn close(&self, stream_error: Option<&str>) {
        let was_closed = {
            let mut state = self.write_state();
            let was_closed = state.status == SessionStatus::Closed;
            state.status = SessionStatus::Closed;
            was_closed
        };
        if was_closed {
            return;
        }

        if let Some(connection) = self.current_connection() {
            if let Some(condition) = stream_error {
                connection.deliver_raw_text(&generate_stream_error(condition, None));
            }
            connection.close();
        }
        debug!(stream_id = %self.stream_id, kind = %self.kind, "Session closed");
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .field("address", &self.address())
            .field("status", &self.status())
            .finish()
    }
}

/// Owner of every session on this node, keyed by stream ID.
#[derive(Default)]
pub struct SessionArena {
    sessions: DashMap<StreamId, Arc<Session>>,
}

impl SessionArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: Arc<Session>) {
        self.sessions.insert(session.stream_id().clone(), session);
    }

    pub fn get(&self, stream_id: &StreamId) -> Option<Arc<Session>> {
        self.sessions.get(stream_id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn remove(&self, stream_id: &StreamId) -> Option<Arc<Session>> {
        self.sessions.remove(stream_id).map(|(_, session)| session)
    }

    pub fn contains(&self, stream_id: &StreamId) -> bool {
        self.sessions.contains_key(stream_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Snapshot of every session.
    pub fn all(&self) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Snapshot of the sessions of one kind.
    pub fn of_kind(&self, kind: SessionKind) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .filter(|entry| entry.value().kind() == kind)
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }
}

impl fmt::Debug for SessionArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionArena")
            .field("session_count", &self.sessions.len())
            .finish()
    }
}

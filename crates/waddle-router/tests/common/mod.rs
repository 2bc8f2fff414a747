//! Shared harness for the routing core integration tests.
//!
//! Provides a connection that records what it was sent, an offline store
//! that counts calls, and a loopback cluster that wires several
//! [`ServerContext`]s together in one process.

#![allow(dead_code)]

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use jid::{BareJid, FullJid, Jid};
use waddle_router::cluster::{ClusterTask, ClusterTaskHandler, ClusterTaskResult, ClusterTransport};
use waddle_router::connection::{CloseListener, CloseListeners, Connection, SendResult};
use waddle_router::policy::{OfflineStore, StanzaFilter};
use waddle_router::{
    ClusterCaches, NodeId, RouterConfig, RouterError, ServerContext, Session, SessionKind, Stanza,
    StreamId,
};
use xmpp_parsers::message::{Body, Message, MessageType};
use xmpp_parsers::presence::{Presence, Type as PresenceType};

pub const DOMAIN: &str = "waddle.social";

pub fn jid(s: &str) -> Jid {
    s.parse().unwrap()
}

pub fn full(s: &str) -> FullJid {
    s.parse().unwrap()
}

pub fn bare(s: &str) -> BareJid {
    s.parse().unwrap()
}

/// Send router logs to the test output once per test binary.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("waddle_router=debug")
            .with_test_writer()
            .try_init();
    });
}

/// A connection that keeps everything delivered to it.
#[derive(Default)]
pub struct RecordingConnection {
    stanzas: Mutex<Vec<Stanza>>,
    raw: Mutex<Vec<String>>,
    closed: AtomicBool,
    listeners: CloseListeners,
}

impl RecordingConnection {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn stanzas(&self) -> Vec<Stanza> {
        self.stanzas.lock().unwrap().clone()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.stanzas()
            .into_iter()
            .filter_map(|stanza| match stanza {
                Stanza::Message(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    pub fn presences(&self) -> Vec<Presence> {
        self.stanzas()
            .into_iter()
            .filter_map(|stanza| match stanza {
                Stanza::Presence(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    /// Delivered stanzas that are error replies.
    pub fn errors(&self) -> Vec<Stanza> {
        self.stanzas()
            .into_iter()
            .filter(Stanza::is_error)
            .collect()
    }

    pub fn raw_text(&self) -> Vec<String> {
        self.raw.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.stanzas.lock().unwrap().clear();
        self.raw.lock().unwrap().clear();
    }

    /// Simulate the peer dropping the socket.
    pub fn drop_connection(&self) {
        self.close();
    }
}

impl fmt::Debug for RecordingConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordingConnection")
            .field("delivered", &self.stanzas.lock().unwrap().len())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl Connection for RecordingConnection {
    fn deliver(&self, stanza: Stanza) -> SendResult {
        if self.closed.load(Ordering::SeqCst) {
            return SendResult::ChannelClosed;
        }
        self.stanzas.lock().unwrap().push(stanza);
        SendResult::Sent
    }

    fn deliver_raw_text(&self, text: &str) -> SendResult {
        if self.closed.load(Ordering::SeqCst) {
            return SendResult::ChannelClosed;
        }
        self.raw.lock().unwrap().push(text.to_string());
        SendResult::Sent
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.listeners.fire();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn is_secure(&self) -> bool {
        true
    }

    fn register_close_listener(&self, listener: Arc<dyn CloseListener>, handback: StreamId) {
        self.listeners.register(listener, handback);
    }
}

/// Offline store that counts calls and accepts or refuses everything.
pub struct RecordingOfflineStore {
    accept: bool,
    calls: AtomicUsize,
    stored: Mutex<Vec<Message>>,
}

impl RecordingOfflineStore {
    pub fn accepting() -> Arc<Self> {
        Arc::new(Self {
            accept: true,
            calls: AtomicUsize::new(0),
            stored: Mutex::new(Vec::new()),
        })
    }

    pub fn refusing() -> Arc<Self> {
        Arc::new(Self {
            accept: false,
            calls: AtomicUsize::new(0),
            stored: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn stored(&self) -> Vec<Message> {
        self.stored.lock().unwrap().clone()
    }
}

impl OfflineStore for RecordingOfflineStore {
    fn store_offline(&self, message: &Message) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.accept {
            self.stored.lock().unwrap().push(message.clone());
        }
        self.accept
    }

    fn get_size(&self, username: &str) -> usize {
        self.stored
            .lock()
            .unwrap()
            .iter()
            .filter(|m| {
                m.to.as_ref().and_then(|to| to.node().map(|n| n.to_string()))
                    == Some(username.to_string())
            })
            .count()
    }

    fn take_messages(&self, user: &BareJid) -> Vec<Message> {
        let mut stored = self.stored.lock().unwrap();
        let (mine, rest): (Vec<Message>, Vec<Message>) = stored
            .drain(..)
            .partition(|m| m.to.as_ref().map(Jid::to_bare).as_ref() == Some(user));
        *stored = rest;
        mine
    }
}

/// A session filter refusing everything that comes from `blocked`.
pub struct RefuseFrom {
    pub blocked: BareJid,
}

impl StanzaFilter for RefuseFrom {
    fn can_process(&self, stanza: &Stanza) -> bool {
        stanza.from().map(Jid::to_bare).as_ref() != Some(&self.blocked)
    }
}

/// Tasks delivered between [`LoopbackNode`]s of one process.
#[derive(Default)]
pub struct LoopbackHub {
    nodes: DashMap<NodeId, Weak<dyn ClusterTaskHandler>>,
}

impl LoopbackHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, node: NodeId, handler: &Arc<dyn ClusterTaskHandler>) {
        self.nodes.insert(node, Arc::downgrade(handler));
    }

    /// Make `node` unreachable, as if it crashed.
    pub fn disconnect(&self, node: &NodeId) {
        self.nodes.remove(node);
    }

    fn handler(&self, node: &NodeId) -> Option<Arc<dyn ClusterTaskHandler>> {
        self.nodes.get(node).and_then(|entry| entry.value().upgrade())
    }
}

/// A cluster member talking to its peers through a [`LoopbackHub`].
pub struct LoopbackNode {
    id: NodeId,
    hub: Arc<LoopbackHub>,
    senior: bool,
}

impl LoopbackNode {
    pub fn new(id: &str, hub: Arc<LoopbackHub>, senior: bool) -> Arc<Self> {
        Arc::new(Self {
            id: NodeId::new(id),
            hub,
            senior,
        })
    }
}

#[async_trait]
impl ClusterTransport for LoopbackNode {
    fn node_id(&self) -> &NodeId {
        &self.id
    }

    fn is_clustered(&self) -> bool {
        true
    }

    fn is_senior_member(&self) -> bool {
        self.senior
    }

    async fn do_synchronous_cluster_task(
        &self,
        task: ClusterTask,
        node: &NodeId,
    ) -> Result<ClusterTaskResult, RouterError> {
        let handler = self
            .hub
            .handler(node)
            .ok_or_else(|| RouterError::cluster(format!("node {node} unreachable")))?;
        Ok(handler.handle_cluster_task(task).await)
    }

    async fn do_cluster_task(&self, task: ClusterTask) -> Result<(), RouterError> {
        let peers: Vec<NodeId> = self
            .hub
            .nodes
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|node| *node != self.id)
            .collect();
        for node in peers {
            if let Some(handler) = self.hub.handler(&node) {
                handler.handle_cluster_task(task.clone()).await;
            }
        }
        Ok(())
    }
}

/// A standalone context with a recording offline store.
pub fn context_with(config: RouterConfig) -> (Arc<ServerContext>, Arc<RecordingOfflineStore>) {
    init_tracing();
    let offline = RecordingOfflineStore::refusing();
    let ctx = ServerContext::builder(config)
        .offline_store(offline.clone())
        .build()
        .unwrap();
    (ctx, offline)
}

pub fn context() -> (Arc<ServerContext>, Arc<RecordingOfflineStore>) {
    context_with(RouterConfig::new(DOMAIN))
}

/// Two contexts sharing their caches through a loopback cluster.
///
/// The first node is the senior member.
pub fn cluster_pair() -> (Arc<ServerContext>, Arc<ServerContext>, Arc<LoopbackHub>) {
    init_tracing();
    let hub = LoopbackHub::new();
    let caches = ClusterCaches::default();

    let build = |id: &str, senior: bool| {
        let node = LoopbackNode::new(id, Arc::clone(&hub), senior);
        let ctx = ServerContext::builder(RouterConfig::new(DOMAIN))
            .cluster(node)
            .caches(caches.clone())
            .build()
            .unwrap();
        let handler = ctx.cluster_handler();
        hub.register(NodeId::new(id), &handler);
        ctx
    };

    let a = build("node-a", true);
    let b = build("node-b", false);
    (a, b, hub)
}

/// A client session and the connection it writes to.
pub struct Client {
    pub session: Arc<Session>,
    pub conn: Arc<RecordingConnection>,
    pub jid: FullJid,
}

impl Client {
    /// Send a stanza as this client.
    pub async fn send(&self, ctx: &ServerContext, stanza: impl Into<Stanza>) {
        ctx.router()
            .route(&self.session, stanza.into())
            .await
            .unwrap();
    }

    pub async fn go_available(&self, ctx: &ServerContext, priority: i8) {
        let mut presence = Presence::new(PresenceType::None);
        presence.priority = priority;
        self.send(ctx, presence).await;
    }
}

/// Connect and bind `address` without sending presence.
pub async fn bound_client(ctx: &ServerContext, address: &str) -> Client {
    let conn = RecordingConnection::new();
    let session = ctx
        .sessions()
        .create_session(SessionKind::Client, conn.clone());
    let jid = full(address);
    ctx.sessions()
        .bind(&session, jid.clone(), false)
        .await
        .unwrap();
    Client { session, conn, jid }
}

/// Connect, bind and send initial presence with priority 0.
pub async fn online_client(ctx: &ServerContext, address: &str) -> Client {
    online_client_with_priority(ctx, address, 0).await
}

pub async fn online_client_with_priority(ctx: &ServerContext, address: &str, priority: i8) -> Client {
    let client = bound_client(ctx, address).await;
    client.go_available(ctx, priority).await;
    client.conn.clear();
    client
}

pub fn message(to: &str, type_: MessageType, body: &str) -> Message {
    let mut msg = Message::new(Some(jid(to)));
    msg.type_ = type_;
    msg.bodies.insert(String::new(), Body(body.to_string()));
    msg
}

pub fn chat(to: &str, body: &str) -> Message {
    message(to, MessageType::Chat, body)
}

/// Whether `stanza` is an error reply carrying `condition`.
pub fn has_condition(stanza: &Stanza, condition: &str) -> bool {
    stanza.is_error() && stanza.to_xml().contains(&format!("<{condition}"))
}

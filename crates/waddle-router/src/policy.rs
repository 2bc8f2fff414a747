//! Collaborators the routers consult: privacy lists, the offline store,
//! the user directory, multicast and the server-to-server dialer.
//!
//! Each one is a narrow trait so hosts can plug in their storage. The
//! in-memory implementations here back the default server and the tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use jid::{BareJid, Jid};
use tracing::debug;
use xmpp_parsers::message::Message;

use crate::address::DomainPair;
use crate::stanza::Stanza;
use crate::RouterError;

/// Privacy lists (XEP-0016) as seen by the routers.
pub trait PrivacyPolicy: Send + Sync {
    /// Whether `owner`'s active list blocks `stanza` from reaching them.
    fn should_block(&self, owner: &BareJid, stanza: &Stanza) -> bool;
}

/// A session's own view of which stanzas it accepts.
///
/// Asked with a reversed stanza before delivery, so a user who blocks a
/// contact cannot send to that contact either.
pub trait StanzaFilter: Send + Sync {
    fn can_process(&self, stanza: &Stanza) -> bool;
}

/// Storage for messages addressed to users without an available session.
pub trait OfflineStore: Send + Sync {
    /// Store a message. Returns `false` when the store refuses it.
    fn store_offline(&self, message: &Message) -> bool;

    /// Number of messages stored for `username`.
    fn get_size(&self, username: &str) -> usize;

    /// Remove and return every message stored for `user`.
    fn take_messages(&self, user: &BareJid) -> Vec<Message>;
}

/// Knows which local accounts exist.
pub trait UserDirectory: Send + Sync {
    fn is_registered(&self, user: &BareJid) -> bool;
}

/// Delivers stanzas carrying XEP-0033 address lists.
#[async_trait]
pub trait MulticastRouter: Send + Sync {
    async fn route(&self, stanza: Stanza) -> Result<(), RouterError>;
}

/// Opens server-to-server connections for domains without a route.
#[async_trait]
pub trait RemoteServerDialer: Send + Sync {
    async fn dial_and_send(&self, pair: &DomainPair, stanza: Stanza) -> Result<(), RouterError>;
}

/// A privacy policy that never blocks.
#[derive(Debug, Default)]
pub struct NoPrivacy;

impl PrivacyPolicy for NoPrivacy {
    fn should_block(&self, _owner: &BareJid, _stanza: &Stanza) -> bool {
        false
    }
}

/// Privacy lists held in memory: per owner, the senders they block.
#[derive(Debug, Default)]
pub struct InMemoryPrivacyPolicy {
    blocked: DashMap<BareJid, HashSet<BareJid>>,
}

impl InMemoryPrivacyPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block every stanza from `sender` to `owner`.
    pub fn block(&self, owner: BareJid, sender: BareJid) {
        self.blocked.entry(owner).or_default().insert(sender);
    }

    pub fn unblock(&self, owner: &BareJid, sender: &BareJid) -> bool {
        self.blocked
            .get_mut(owner)
            .map(|mut senders| senders.remove(sender))
            .unwrap_or(false)
    }
}

impl PrivacyPolicy for InMemoryPrivacyPolicy {
    fn should_block(&self, owner: &BareJid, stanza: &Stanza) -> bool {
        let Some(from) = stanza.from() else {
            return false;
        };
        self.blocked
            .get(owner)
            .map(|senders| senders.contains(&from.to_bare()))
            .unwrap_or(false)
    }
}

/// Stanza filter refusing stanzas from a fixed set of addresses.
#[derive(Debug, Default)]
pub struct BlockList {
    blocked: DashSet<BareJid>,
}

impl BlockList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block(&self, jid: BareJid) {
        self.blocked.insert(jid);
    }
}

impl StanzaFilter for BlockList {
    fn can_process(&self, stanza: &Stanza) -> bool {
        stanza
            .from()
            .map(|from| !self.blocked.contains(&from.to_bare()))
            .unwrap_or(true)
    }
}

/// An offline store that refuses everything.
#[derive(Debug, Default)]
pub struct DisabledOfflineStore;

impl OfflineStore for DisabledOfflineStore {
    fn store_offline(&self, _message: &Message) -> bool {
        false
    }

    fn get_size(&self, _username: &str) -> usize {
        0
    }

    fn take_messages(&self, _user: &BareJid) -> Vec<Message> {
        Vec::new()
    }
}

/// Offline messages kept in memory with a per-user quota.
#[derive(Debug)]
pub struct InMemoryOfflineStore {
    messages: DashMap<BareJid, Vec<Message>>,
    quota: usize,
    stored_total: AtomicUsize,
}

impl InMemoryOfflineStore {
    pub fn new(quota: usize) -> Self {
        Self {
            messages: DashMap::new(),
            quota,
            stored_total: AtomicUsize::new(0),
        }
    }

    /// Messages accepted since creation.
    pub fn stored_total(&self) -> usize {
        self.stored_total.load(Ordering::Relaxed)
    }
}

impl Default for InMemoryOfflineStore {
    fn default() -> Self {
        Self::new(100)
    }
}

impl OfflineStore for InMemoryOfflineStore {
    fn store_offline(&self, message: &Message) -> bool {
        let Some(owner) = message.to.as_ref().map(Jid::to_bare) else {
            return false;
        };
        if owner.node().is_none() {
            return false;
        }

        let mut stored = self.messages.entry(owner.clone()).or_default();
        if stored.len() >= self.quota {
            debug!(user = %owner, quota = self.quota, "Offline quota reached");
            return false;
        }
        stored.push(message.clone());
        self.stored_total.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn get_size(&self, username: &str) -> usize {
        self.messages
            .iter()
            .filter(|entry| entry.key().node().map(|n| n.as_str()) == Some(username))
            .map(|entry| entry.value().len())
            .sum()
    }

    fn take_messages(&self, user: &BareJid) -> Vec<Message> {
        self.messages
            .remove(user)
            .map(|(_, messages)| messages)
            .unwrap_or_default()
    }
}

/// A directory in which every local user exists.
#[derive(Debug, Default)]
pub struct OpenDirectory;

impl UserDirectory for OpenDirectory {
    fn is_registered(&self, _user: &BareJid) -> bool {
        true
    }
}

/// A directory of explicitly registered accounts.
#[derive(Debug, Default)]
pub struct InMemoryUserDirectory {
    users: DashSet<BareJid>,
}

impl InMemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, user: BareJid) {
        self.users.insert(user);
    }
}

impl UserDirectory for InMemoryUserDirectory {
    fn is_registered(&self, user: &BareJid) -> bool {
        self.users.contains(user)
    }
}

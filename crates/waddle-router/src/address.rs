//! Addressing value types shared by every part of the routing core.
//!
//! JIDs come from the `jid` crate, which already normalizes and compares
//! node/domain/resource parts. This module adds the identifiers the routing
//! core needs on top of them: directed domain pairs for server-to-server
//! routes, stream identifiers for sessions and node identifiers for cluster
//! members.

use std::fmt;

use jid::{BareJid, FullJid, Jid};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One directed relationship between a local and a remote domain.
///
/// A server may hold independent inbound and outbound sessions for the
/// same pair of domains, so the direction is part of the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DomainPair {
    /// Domain served by this server
    pub local: String,
    /// Domain of the peer server
    pub remote: String,
}

impl DomainPair {
    /// Create a new domain pair.
    pub fn new(local: impl Into<String>, remote: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            remote: remote.into(),
        }
    }
}

impl fmt::Display for DomainPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.local, self.remote)
    }
}

/// Unique identifier of a protocol stream.
///
/// Generated once per connection and never reused. A resumed session keeps
/// its stream ID; a reconnection after full closure gets a new one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId(String);

impl StreamId {
    /// Generate a fresh stream ID.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Wrap an existing stream ID (e.g. one presented on resumption).
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The stream ID as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    /// Generate a node ID for a freshly started node.
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Wrap a configured node ID.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The node ID as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Shape of an address, which decides how it can be routed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressKind {
    /// `domain` only
    Domain,
    /// `node@domain`
    Bare(BareJid),
    /// `node@domain/resource`
    Full(FullJid),
}

/// Classify a JID as domain-only, bare or full.
///
/// A `domain/resource` JID (used by some components) counts as full.
pub fn classify(jid: &Jid) -> AddressKind {
    match jid.clone().try_into_full() {
        Ok(full) => AddressKind::Full(full),
        Err(bare) if bare.node().is_none() => AddressKind::Domain,
        Err(bare) => AddressKind::Bare(bare),
    }
}

/// Whether `jid` is exactly the bare domain `domain`.
pub fn is_domain_address(jid: &Jid, domain: &str) -> bool {
    jid.node().is_none() && jid.resource().is_none() && jid.domain().as_str() == domain
}

/// Build the domain-only JID for `domain`.
pub fn domain_jid(domain: &str) -> Option<Jid> {
    domain.parse::<BareJid>().ok().map(Jid::from)
}

//! # waddle-router
//!
//! Stanza routing and session topology core for the Waddle XMPP server.
//!
//! This crate decides where every stanza goes. It keeps the cluster-wide
//! routing table (client, server and component routes), tracks sessions
//! through their lifecycle, and applies the RFC 6120/6121 delivery rules
//! for `<iq/>`, `<message/>` and `<presence/>`.
//!
//! ## Architecture
//!
//! - **Routing table**: JID → owning node, backed by pluggable cluster caches
//! - **Session manager**: binding, resource conflicts, detach and resume
//! - **Routers**: per-type policy (IQ handlers, message fan-out, presence)
//! - **Processing channel**: elastic worker pool between I/O and routing
//!
//! Stream parsing, TLS and authentication live elsewhere; sessions reach
//! the core through the [`connection::Connection`] trait.
//!
//! ## XEP Support
//!
//! - XEP-0016 (Privacy Lists, via [`policy::PrivacyPolicy`])
//! - XEP-0033 (Extended Stanza Addressing, via [`policy::MulticastRouter`])
//! - XEP-0160 (Offline Messages)
//! - XEP-0198 (Stream Management detach and resume)
//! - XEP-0199 (XMPP Ping)
//! - XEP-0280 (Message Carbons)

pub mod address;
pub mod carbons;
pub mod channel;
pub mod cluster;
pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod interceptor;
pub mod metrics;
pub mod policy;
pub mod router;
pub mod routing;
pub mod server;
pub mod session;
pub mod stanza;

pub use address::{DomainPair, NodeId, StreamId};
pub use config::RouterConfig;
pub use context::{ClusterCaches, ServerContext, ServerContextBuilder};
pub use error::{RouterError, StanzaErrorCondition, StanzaErrorType};
pub use router::PacketRouter;
pub use routing::{RoutingResult, RoutingTable};
pub use server::RoutingServer;
pub use session::{Session, SessionKind, SessionManager, SessionStatus};
pub use stanza::Stanza;

//! Cluster membership as the routing core sees it.
//!
//! The membership protocol itself is external. The core needs to know its
//! own node ID and whether it is the senior member, to run a task on another
//! node and wait for the answer, and to hear about joins and departures.

mod cache;

pub use cache::{Cache, LocalCache};

use async_trait::async_trait;
use jid::{FullJid, Jid};

use crate::address::NodeId;
use crate::stanza::Stanza;
use crate::RouterError;

/// Work executed on another cluster member.
#[derive(Debug, Clone)]
pub enum ClusterTask {
    /// Deliver a stanza to a route hosted on the target node
    RoutePacket { to: Jid, stanza: Stanza },
    /// Deliver a stanza to every client session of the target node
    BroadcastLocal { stanza: Stanza },
    /// Another node is binding `jid`; apply the conflict rules to the
    /// session holding it on the target node
    ResolveConflict { jid: FullJid },
}

/// Answer to a [`ClusterTask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterTaskResult {
    /// The stanza reached a local session on the target node
    Delivered,
    /// The target node has no such route
    NoRoute,
    /// Number of sessions reached by a broadcast
    Broadcast(usize),
    /// The holder of a resource keeps it
    Refused,
}

/// Membership changes reported by the cluster transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    /// This node joined a cluster
    JoinedCluster,
    /// This node lost the cluster and runs alone
    LeftCluster,
    /// Another node joined
    NodeJoined(NodeId),
    /// Another node left (possibly abruptly)
    NodeLeft(NodeId),
}

/// Runs tasks sent by other cluster members.
#[async_trait]
pub trait ClusterTaskHandler: Send + Sync {
    async fn handle_cluster_task(&self, task: ClusterTask) -> ClusterTaskResult;
}

/// Remote invocation and membership queries.
#[async_trait]
pub trait ClusterTransport: Send + Sync {
    /// ID of this node.
    fn node_id(&self) -> &NodeId;

    /// Whether this node is currently part of a cluster.
    fn is_clustered(&self) -> bool;

    /// Whether this node coordinates cleanup after departures.
    fn is_senior_member(&self) -> bool;

    /// Run `task` on `node` and wait for its answer.
    ///
    /// Timeouts are the transport's business and surface as `Err`.
    async fn do_synchronous_cluster_task(
        &self,
        task: ClusterTask,
        node: &NodeId,
    ) -> Result<ClusterTaskResult, RouterError>;

    /// Run `task` on every other node without waiting for answers.
    async fn do_cluster_task(&self, task: ClusterTask) -> Result<(), RouterError>;
}

/// The transport of a node that is not part of any cluster.
#[derive(Debug, Clone)]
pub struct StandaloneCluster {
    node_id: NodeId,
}

impl StandaloneCluster {
    pub fn new(node_id: NodeId) -> Self {
        Self { node_id }
    }
}

impl Default for StandaloneCluster {
    fn default() -> Self {
        Self::new(NodeId::generate())
    }
}

#[async_trait]
impl ClusterTransport for StandaloneCluster {
    fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    fn is_clustered(&self) -> bool {
        false
    }

    fn is_senior_member(&self) -> bool {
        true
    }

    async fn do_synchronous_cluster_task(
        &self,
        _task: ClusterTask,
        node: &NodeId,
    ) -> Result<ClusterTaskResult, RouterError> {
        Err(RouterError::cluster(format!(
            "node {node} is unreachable: not clustered"
        )))
    }

    async fn do_cluster_task(&self, _task: ClusterTask) -> Result<(), RouterError> {
        Ok(())
    }
}

//! Read-side interface the deployment core consumes, plus a static implementation
//! for single-process clusters.

use super::types::{MembershipEvent, NodeId};

use dashmap::DashSet;
use std::sync::Arc;
use tokio::sync::broadcast;

pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Current node set and topology change notifications.
pub trait Membership: Send + Sync {
    fn local_node_id(&self) -> NodeId;

    /// True while the node is a live member (alive or merely suspected).
    fn is_alive(&self, node_id: &NodeId) -> bool;

    fn alive_nodes(&self) -> Vec<NodeId>;

    fn subscribe(&self) -> broadcast::Receiver<MembershipEvent>;
}

/// Membership view driven by explicit calls instead of gossip.
pub struct StaticMembership {
    local: NodeId,
    members: DashSet<NodeId>,
    events: broadcast::Sender<MembershipEvent>,
}

impl StaticMembership {
    pub fn new(local: NodeId) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let members = DashSet::new();
        members.insert(local.clone());

        Arc::new(Self {
            local,
            members,
            events,
        })
    }

    pub fn with_members(local: NodeId, others: impl IntoIterator<Item = NodeId>) -> Arc<Self> {
        let view = Self::new(local);
        for node in others {
            view.members.insert(node);
        }
        view
    }

    pub fn join(&self, node: NodeId) {
        if self.members.insert(node.clone()) {
            tracing::info!("Node {} joined", node);
            let _ = self.events.send(MembershipEvent::Joined(node));
        }
    }

    pub fn leave(&self, node: &NodeId) {
        if self.members.remove(node).is_some() {
            tracing::info!("Node {} left", node);
            let _ = self.events.send(MembershipEvent::Left(node.clone()));
        }
    }

    pub fn fail(&self, node: &NodeId) {
        if self.members.remove(node).is_some() {
            tracing::warn!("Node {} failed", node);
            let _ = self.events.send(MembershipEvent::Failed(node.clone()));
        }
    }
}

impl Membership for StaticMembership {
    fn local_node_id(&self) -> NodeId {
        self.local.clone()
    }

    fn is_alive(&self, node_id: &NodeId) -> bool {
        self.members.contains(node_id)
    }

    fn alive_nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.members.iter().map(|id| id.key().clone()).collect();
        nodes.sort();
        nodes
    }

    fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }
}

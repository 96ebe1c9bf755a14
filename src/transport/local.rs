//! In-process transport.
//!
//! Every node of a single-process cluster gets a [`LocalTransport`] from a shared
//! [`LocalNetwork`]. Delivery is asynchronous (each message runs its listener on a
//! spawned task). A node can be marked unresponsive: messages addressed to it are
//! counted and then dropped, which is how a hung peer looks from the outside.

use super::{MessageListener, PeerTransport, TransportFuture};
use crate::membership::types::NodeId;

use anyhow::anyhow;
use dashmap::{DashMap, DashSet};
use std::sync::{Arc, Weak};

#[derive(Default)]
pub struct LocalNetwork {
    nodes: DashMap<NodeId, Weak<LocalTransport>>,
    unresponsive: DashSet<NodeId>,
    sent: DashMap<(NodeId, String), usize>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attaches `node` to the network, replacing a previous attachment.
    pub fn transport(self: &Arc<Self>, node: NodeId) -> Arc<LocalTransport> {
        let transport = Arc::new(LocalTransport {
            node: node.clone(),
            network: self.clone(),
            listeners: DashMap::new(),
        });
        self.nodes.insert(node, Arc::downgrade(&transport));
        transport
    }

    pub fn detach(&self, node: &NodeId) {
        self.nodes.remove(node);
    }

    pub fn set_unresponsive(&self, node: &NodeId, unresponsive: bool) {
        if unresponsive {
            self.unresponsive.insert(node.clone());
        } else {
            self.unresponsive.remove(node);
        }
    }

    /// Messages handed to the network for `node` on `topic`, delivered or dropped.
    pub fn sent_count(&self, node: &NodeId, topic: &str) -> usize {
        self.sent
            .get(&(node.clone(), topic.to_string()))
            .map(|count| *count)
            .unwrap_or(0)
    }

    fn deliver(&self, from: &NodeId, to: &NodeId, topic: &str, payload: Vec<u8>) -> anyhow::Result<()> {
        let target = self
            .nodes
            .get(to)
            .and_then(|entry| entry.value().upgrade())
            .ok_or_else(|| anyhow!("Node {} is not attached to the network", to))?;

        *self.sent.entry((to.clone(), topic.to_string())).or_insert(0) += 1;

        if self.unresponsive.contains(to) {
            tracing::trace!("Dropping message on '{}' for unresponsive node {}", topic, to);
            return Ok(());
        }

        let Some(listener) = target.listener(topic) else {
            tracing::debug!("Node {} has no listener for '{}'", to, topic);
            return Ok(());
        };

        let from = from.clone();
        tokio::spawn(async move {
            listener(from, payload);
        });

        Ok(())
    }

    fn peers_of(&self, node: &NodeId) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|entry| entry.key() != node && entry.value().strong_count() > 0)
            .map(|entry| entry.key().clone())
            .collect()
    }
}

pub struct LocalTransport {
    node: NodeId,
    network: Arc<LocalNetwork>,
    listeners: DashMap<String, MessageListener>,
}

impl LocalTransport {
    fn listener(&self, topic: &str) -> Option<MessageListener> {
        self.listeners.get(topic).map(|entry| entry.value().clone())
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

impl PeerTransport for LocalTransport {
    fn local_node_id(&self) -> NodeId {
        self.node.clone()
    }

    fn send<'a>(&'a self, to: &'a NodeId, topic: &'a str, payload: Vec<u8>) -> TransportFuture<'a> {
        Box::pin(async move { self.network.deliver(&self.node, to, topic, payload) })
    }

    fn broadcast<'a>(&'a self, topic: &'a str, payload: Vec<u8>) -> TransportFuture<'a> {
        Box::pin(async move {
            for peer in self.network.peers_of(&self.node) {
                if let Err(e) = self.network.deliver(&self.node, &peer, topic, payload.clone()) {
                    tracing::warn!("Broadcast on '{}' to {} failed: {}", topic, peer, e);
                }
            }
            Ok(())
        })
    }

    fn add_listener(&self, topic: &str, listener: MessageListener) {
        self.listeners.insert(topic.to_string(), listener);
    }

    fn remove_listener(&self, topic: &str) -> bool {
        self.listeners.remove(topic).is_some()
    }
}

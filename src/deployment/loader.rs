//! Peer module loader: resolves code from the nodes participating in a context.
//!
//! Peers are tried most-recently-used first. A definitive "not found" from a peer is
//! remembered in a bounded negative cache so repeated misses stay local; a timeout or
//! departure just moves on to the next peer.

use super::cache::{BoundedSet, RecencyMap};
use super::comm::DeploymentCommunication;
use super::registry::LocalModuleRegistry;
use super::types::{ContextId, Participant, module_resource_name};
use crate::config::DeploymentConfig;
use crate::error::DeployError;
use crate::membership::types::NodeId;
use crate::membership::view::Membership;

use dashmap::DashMap;
use std::sync::{Arc, Mutex, MutexGuard};

pub struct PeerModuleLoader {
    context_id: ContextId,
    local_node: NodeId,
    comm: Arc<DeploymentCommunication>,
    membership: Arc<dyn Membership>,
    registry: Arc<LocalModuleRegistry>,
    config: Arc<DeploymentConfig>,
    participants: Mutex<RecencyMap<NodeId, Participant>>,
    missing: Mutex<BoundedSet<String>>,
    fetched: DashMap<String, Arc<[u8]>>,
}

impl PeerModuleLoader {
    pub fn new(
        context_id: ContextId,
        comm: Arc<DeploymentCommunication>,
        membership: Arc<dyn Membership>,
        registry: Arc<LocalModuleRegistry>,
        config: Arc<DeploymentConfig>,
    ) -> Self {
        Self {
            context_id,
            local_node: membership.local_node_id(),
            missing: Mutex::new(BoundedSet::new(config.missing_resource_cache_size)),
            comm,
            membership,
            registry,
            config,
            participants: Mutex::new(RecencyMap::new()),
            fetched: DashMap::new(),
        }
    }

    fn participants_lock(&self) -> MutexGuard<'_, RecencyMap<NodeId, Participant>> {
        self.participants.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers or replaces `node`'s participation, making it the most recent peer.
    pub fn add_participant(&self, node: NodeId, participant: Participant) -> Option<Participant> {
        self.participants_lock().insert(node, participant)
    }

    pub fn remove_participant(&self, node: &NodeId) -> Option<Participant> {
        self.participants_lock().remove(node)
    }

    pub fn participant(&self, node: &NodeId) -> Option<Participant> {
        self.participants_lock().get(node).copied()
    }

    /// True when `node` participates with exactly `loader_id`; marks it most recent.
    pub fn touch_participant(&self, node: &NodeId, loader_id: ContextId) -> bool {
        let mut participants = self.participants_lock();
        match participants.get(node) {
            Some(p) if p.loader_id == loader_id => participants.touch(node),
            _ => false,
        }
    }

    /// Most recently used first.
    pub fn participants(&self) -> Vec<(NodeId, Participant)> {
        self.participants_lock()
            .iter_recent()
            .map(|(node, p)| (node.clone(), *p))
            .collect()
    }

    pub fn participant_count(&self) -> usize {
        self.participants_lock().len()
    }

    pub fn is_known_missing(&self, resource_name: &str) -> bool {
        self.missing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&resource_name.to_string())
    }

    pub fn cached_resource(&self, resource_name: &str) -> Option<Arc<[u8]>> {
        self.fetched.get(resource_name).map(|bytes| bytes.value().clone())
    }

    /// Code of `module_name`. Excluded names come from the local registry only.
    pub async fn load_module(&self, module_name: &str) -> Result<Arc<[u8]>, DeployError> {
        if self.config.is_excluded(module_name) {
            return self
                .registry
                .lookup(module_name)
                .map(|definition| definition.code.clone())
                .ok_or_else(|| DeployError::not_found(module_name));
        }
        self.load_resource(&module_resource_name(module_name)).await
    }

    pub async fn load_resource(&self, resource_name: &str) -> Result<Arc<[u8]>, DeployError> {
        if let Some(bytes) = self.cached_resource(resource_name) {
            return Ok(bytes);
        }
        if self.is_known_missing(resource_name) {
            tracing::trace!("{} is cached as missing in context {}", resource_name, self.context_id);
            return Err(DeployError::not_found(resource_name));
        }

        let timeout = self.config.peer_fetch_timeout;

        for (node, participant) in self.participants() {
            if node == self.local_node {
                continue;
            }
            if !self.membership.is_alive(&node) {
                tracing::debug!("Skipping departed peer {} for {}", node, resource_name);
                continue;
            }

            match self
                .comm
                .fetch_resource(&node, Some(participant.loader_id), resource_name, timeout)
                .await
            {
                Ok(bytes) => {
                    let bytes = self
                        .fetched
                        .entry(resource_name.to_string())
                        .or_insert(bytes)
                        .value()
                        .clone();
                    self.participants_lock().touch(&node);
                    return Ok(bytes);
                }
                Err(e) if e.is_definitive() => {
                    tracing::debug!("Peer {} has no {}: {}", node, resource_name, e);
                    self.missing
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .insert(resource_name.to_string());
                    return Err(DeployError::not_found(resource_name));
                }
                Err(e) => {
                    tracing::warn!(
                        "Fetch of {} from {} failed ({}): {}",
                        resource_name,
                        node,
                        e.as_label(),
                        e
                    );
                }
            }
        }

        Err(DeployError::not_found(resource_name))
    }
}

/// Everything needed to build loaders for new remote contexts.
#[derive(Clone)]
pub struct LoaderFactory {
    pub comm: Arc<DeploymentCommunication>,
    pub membership: Arc<dyn Membership>,
    pub registry: Arc<LocalModuleRegistry>,
    pub config: Arc<DeploymentConfig>,
}

impl LoaderFactory {
    pub fn create(&self, context_id: ContextId) -> Arc<PeerModuleLoader> {
        Arc::new(PeerModuleLoader::new(
            context_id,
            self.comm.clone(),
            self.membership.clone(),
            self.registry.clone(),
            self.config.clone(),
        ))
    }
}

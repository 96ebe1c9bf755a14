//! Deployment Manager
//!
//! Entry point of the deployment subsystem on one node. It owns the three stores,
//! routes every request to the right one, answers peers' fetch requests and reacts
//! to topology changes.
//!
//! | Request                          | Store              |
//! |----------------------------------|--------------------|
//! | sender is this node              | [`LocalStore`]     |
//! | `Private` / `Isolated`           | [`PerLoaderStore`] |
//! | `Shared` / `Continuous`          | [`PerVersionStore`]|

use super::comm::{DeploymentCommunication, DeploymentRequestHandler};
use super::events::{DeploymentEvent, DeploymentEvents};
use super::loader::LoaderFactory;
use super::local_store::LocalStore;
use super::per_loader_store::PerLoaderStore;
use super::per_version_store::PerVersionStore;
use super::registry::{LocalModuleRegistry, ModuleDefinition};
use super::types::{ContextId, DeployedModule, DeploymentMetadata};
use crate::config::DeploymentConfig;
use crate::error::DeployError;
use crate::membership::types::{MembershipEvent, NodeId};
use crate::membership::view::Membership;
use crate::timeout::TimeoutScheduler;
use crate::transport::PeerTransport;

use anyhow::Result;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

pub struct DeploymentManager {
    me: Weak<Self>,
    config: Arc<DeploymentConfig>,
    local_node: NodeId,
    membership: Arc<dyn Membership>,
    registry: Arc<LocalModuleRegistry>,
    events: DeploymentEvents,
    comm: Arc<DeploymentCommunication>,
    local: Arc<LocalStore>,
    per_loader: Arc<PerLoaderStore>,
    per_version: Arc<PerVersionStore>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeploymentStats {
    pub local_contexts: usize,
    pub per_loader_contexts: usize,
    pub per_version_contexts: usize,
    pub pending_fetches: usize,
}

impl DeploymentManager {
    /// Must be called from within a tokio runtime.
    pub fn new(
        config: DeploymentConfig,
        membership: Arc<dyn Membership>,
        transport: Arc<dyn PeerTransport>,
    ) -> Result<Arc<Self>> {
        Self::with_registry(config, membership, transport, LocalModuleRegistry::new())
    }

    pub fn with_registry(
        config: DeploymentConfig,
        membership: Arc<dyn Membership>,
        transport: Arc<dyn PeerTransport>,
        registry: Arc<LocalModuleRegistry>,
    ) -> Result<Arc<Self>> {
        let config = Arc::new(config);
        let scheduler = TimeoutScheduler::new()?;
        let events = DeploymentEvents::default();
        let comm = DeploymentCommunication::new(transport, membership.clone());

        let loaders = LoaderFactory {
            comm: comm.clone(),
            membership: membership.clone(),
            registry: registry.clone(),
            config: config.clone(),
        };

        let local = LocalStore::new(config.clone(), registry.clone(), events.clone());
        let per_loader = PerLoaderStore::new(loaders.clone(), scheduler.clone(), events.clone());
        let per_version = PerVersionStore::new(loaders, scheduler, events.clone());

        Ok(Arc::new_cyclic(|me| Self {
            me: me.clone(),
            local_node: membership.local_node_id(),
            config,
            membership,
            registry,
            events,
            comm,
            local,
            per_loader,
            per_version,
            watcher: Mutex::new(None),
        }))
    }

    /// Starts serving peers and watching membership.
    pub fn start(&self) {
        let handler: Weak<dyn DeploymentRequestHandler> = self.me.clone();
        self.comm.start(handler);

        let mut events = self.membership.subscribe();
        let manager = self.me.clone();
        let handle = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let Some(manager) = manager.upgrade() else {
                            break;
                        };
                        manager.handle_membership_event(&event);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("Membership watcher lagged, skipped {} event(s)", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            tracing::debug!("Membership watcher stopped");
        });

        if let Some(previous) = self.watcher.lock().unwrap_or_else(|e| e.into_inner()).replace(handle) {
            previous.abort();
        }
        tracing::info!("Deployment manager started on {} (mode: {:?})", self.local_node, self.config.mode);
    }

    pub fn stop(&self) {
        if let Some(handle) = self.watcher.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
        self.comm.stop();
        tracing::info!("Deployment manager stopped on {}", self.local_node);
    }

    pub fn handle_membership_event(&self, event: &MembershipEvent) {
        match event {
            MembershipEvent::Joined(node) => tracing::debug!("Node {} joined", node),
            MembershipEvent::Left(node) | MembershipEvent::Failed(node) => {
                tracing::info!("Node {} departed, releasing its deployments", node);
                self.comm.on_node_left(node);
                self.per_loader.on_node_left(node);
                self.per_version.on_node_left(node);
            }
        }
    }

    pub fn local_node_id(&self) -> &NodeId {
        &self.local_node
    }

    pub fn config(&self) -> &DeploymentConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<LocalModuleRegistry> {
        &self.registry
    }

    pub fn communication(&self) -> &Arc<DeploymentCommunication> {
        &self.comm
    }

    pub fn local_store(&self) -> &Arc<LocalStore> {
        &self.local
    }

    pub fn per_loader_store(&self) -> &Arc<PerLoaderStore> {
        &self.per_loader
    }

    pub fn per_version_store(&self) -> &Arc<PerVersionStore> {
        &self.per_version
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<DeploymentEvent> {
        self.events.subscribe()
    }

    /// Explicitly deploys code from this node.
    pub fn deploy_local(&self, definition: ModuleDefinition) -> Result<Arc<DeployedModule>, DeployError> {
        self.local.deploy(definition)
    }

    /// Undeploys `alias` here and tells every peer to drop it.
    pub async fn undeploy_by_name(&self, alias: &str) -> Result<bool, DeployError> {
        let found = self.local.undeploy(alias);
        self.comm.send_undeploy_request(alias).await?;
        Ok(found)
    }

    pub fn acquire_local(&self, alias: &str) -> Result<Arc<DeployedModule>, DeployError> {
        self.local.acquire(alias)
    }

    /// Module a peer's task refers to; fetched from the cluster when needed.
    pub async fn acquire_remote(&self, meta: &DeploymentMetadata) -> Result<Arc<DeployedModule>, DeployError> {
        if meta.sender == self.local_node {
            return self
                .local
                .acquire(&meta.alias)
                .or_else(|_| self.local.acquire(&meta.module_name));
        }

        if meta.mode.is_per_version() {
            self.per_version.acquire(meta).await
        } else {
            self.per_loader.acquire(meta).await
        }
    }

    /// Gives back a module obtained from either acquire call.
    pub fn release(&self, module: &DeployedModule) -> Result<(), DeployError> {
        let result = if module.is_local {
            self.local.release(module)
        } else if module.mode.is_per_version() {
            self.per_version.release(module)
        } else {
            self.per_loader.release(module)
        };

        if let Err(e) = &result {
            tracing::error!("Release of {} failed ({}): {}", module.alias, e.as_label(), e);
        }
        result
    }

    /// Metadata a task carrying `module` to other nodes must include.
    pub fn metadata_for(&self, module: &DeployedModule) -> DeploymentMetadata {
        DeploymentMetadata {
            user_version: module.user_version.clone(),
            module_name: module.name().to_string(),
            alias: module.alias.clone(),
            sender: self.local_node.clone(),
            loader_id: module.context_id,
            sequence_number: module.sequence_number,
            mode: self.config.mode,
        }
    }

    pub fn stats(&self) -> DeploymentStats {
        DeploymentStats {
            local_contexts: self.local.context_count(),
            per_loader_contexts: self.per_loader.context_count(),
            per_version_contexts: self.per_version.context_count(),
            pending_fetches: self.comm.pending_requests(),
        }
    }
}

impl DeploymentRequestHandler for DeploymentManager {
    fn serve_resource(&self, loader_id: Option<ContextId>, resource_name: &str) -> Result<Arc<[u8]>, DeployError> {
        let bytes = match loader_id {
            None => self.registry.resource(resource_name),
            Some(id) => self
                .local
                .serve_resource(id, resource_name)
                .or_else(|| self.per_version.serve_resource(id, resource_name))
                .or_else(|| self.per_loader.serve_resource(id, resource_name)),
        };
        bytes.ok_or_else(|| DeployError::not_found(resource_name))
    }

    fn on_undeploy_notice(&self, sender: &NodeId, alias: &str) {
        self.per_loader.on_undeploy_notice(sender, alias);
        self.per_version.on_undeploy_notice(sender, alias);
    }
}

impl Drop for DeploymentManager {
    fn drop(&mut self) {
        if let Some(handle) = self.watcher.get_mut().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }
}

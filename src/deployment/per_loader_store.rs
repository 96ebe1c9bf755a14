//! Per-Loader Store
//!
//! Serves `Private` and `Isolated` code: one exclusive context per
//! (origin node, origin loader id).
//!
//! ## Redeploy detection
//! Contexts from the same origin are compared by sequence number:
//! - an older one is superseded and undeployed after the grace window;
//! - a newer one makes the incoming request stale. It is still served until the
//!   newer context's grace window runs out, and rejected afterwards.
//!
//! Network I/O (code resolution) always happens after the store lock is released.

use super::context::{ContextEntry, ResolutionContext};
use super::events::{DeploymentEvent, DeploymentEventKind, DeploymentEvents};
use super::loader::LoaderFactory;
use super::types::{ContextId, DeployedModule, DeploymentMetadata, Participant};
use crate::error::DeployError;
use crate::membership::types::NodeId;
use crate::timeout::TimeoutScheduler;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

#[derive(Default)]
struct PerLoaderState {
    contexts: HashMap<ContextId, ContextEntry>,
    /// (origin, origin loader) -> live context.
    by_loader: HashMap<(NodeId, ContextId), ContextId>,
    by_sender: HashMap<NodeId, HashSet<ContextId>>,
    /// Contexts of departed origins still waiting for their last release.
    cleanup: HashSet<ContextId>,
}

impl PerLoaderState {
    fn unindex(&mut self, id: ContextId) {
        self.by_loader.retain(|_, context| *context != id);
    }

    fn remove(&mut self, id: ContextId) -> Option<ContextEntry> {
        let mut entry = self.contexts.remove(&id)?;
        entry.cancel_timer();
        self.unindex(id);
        self.cleanup.remove(&id);
        if let Some(sender) = &entry.context.sender
            && let Some(ids) = self.by_sender.get_mut(sender)
        {
            ids.remove(&id);
            if ids.is_empty() {
                self.by_sender.remove(sender);
            }
        }
        Some(entry)
    }
}

pub struct PerLoaderStore {
    me: Weak<Self>,
    loaders: LoaderFactory,
    scheduler: Arc<TimeoutScheduler>,
    events: DeploymentEvents,
    state: Mutex<PerLoaderState>,
}

impl PerLoaderStore {
    pub fn new(loaders: LoaderFactory, scheduler: Arc<TimeoutScheduler>, events: DeploymentEvents) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            loaders,
            scheduler,
            events,
            state: Mutex::new(PerLoaderState::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, PerLoaderState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn grace(&self) -> Duration {
        self.loaders.config.undeploy_grace
    }

    fn schedule_undeploy(&self, entry: &mut ContextEntry, delay: Duration) {
        let store = self.me.clone();
        let id = entry.context.id;
        let timer = self.scheduler.schedule(delay, move || {
            if let Some(store) = store.upgrade() {
                store.on_undeploy_timeout(id);
            }
        });
        entry.schedule_undeploy(timer);
        tracing::debug!("Context {} scheduled for undeploy in {:?}", id, delay);
    }

    /// Module described by `meta`, resolved in the context exclusive to its loader.
    pub async fn acquire(&self, meta: &DeploymentMetadata) -> Result<Arc<DeployedModule>, DeployError> {
        let (context, created) = self.find_or_create(meta)?;

        match context.resolve(&meta.module_name, &meta.alias).await {
            Ok((module, fresh)) => {
                if fresh {
                    self.events.record(
                        DeploymentEvent::new(
                            DeploymentEventKind::Deployed,
                            module.alias.clone(),
                            meta.user_version.clone(),
                            meta.mode,
                            context.id,
                        )
                        .with_origin(Some(meta.sender.clone())),
                    );
                }
                Ok(module)
            }
            Err(e) => {
                self.events.record(
                    DeploymentEvent::new(
                        DeploymentEventKind::DeploymentFailed,
                        meta.alias.clone(),
                        meta.user_version.clone(),
                        meta.mode,
                        context.id,
                    )
                    .with_origin(Some(meta.sender.clone()))
                    .with_reason(e.to_string()),
                );
                self.release_after_failure(context.id, created);
                Err(e)
            }
        }
    }

    fn find_or_create(&self, meta: &DeploymentMetadata) -> Result<(Arc<ResolutionContext>, bool), DeployError> {
        let mut state = self.lock();
        let key = (meta.sender.clone(), meta.loader_id);

        if let Some(id) = state.by_loader.get(&key).copied()
            && let Some(entry) = state.contexts.get_mut(&id)
            && !entry.undeployed
        {
            entry.acquire();
            return Ok((entry.context.clone(), false));
        }

        let grace = self.grace();
        let mut stale_window: Option<Duration> = None;
        let mut superseded = Vec::new();

        let related: Vec<ContextId> = state
            .by_sender
            .get(&meta.sender)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();

        for id in related {
            let Some(entry) = state.contexts.get(&id) else {
                continue;
            };
            if !entry.is_live() {
                continue;
            }
            let existing = entry.context.sequence_number;
            if existing < meta.sequence_number {
                superseded.push(id);
            } else if existing > meta.sequence_number {
                let elapsed = entry.context.created_at.elapsed();
                if elapsed >= grace {
                    tracing::warn!(
                        "Rejecting stale request from {} (seq={}, newer seq={})",
                        meta.sender,
                        meta.sequence_number,
                        existing
                    );
                    return Err(DeployError::StaleRequest {
                        sender: meta.sender.clone(),
                        sequence: meta.sequence_number,
                        newer: existing,
                    });
                }
                let remaining = grace - elapsed;
                stale_window = Some(stale_window.map_or(remaining, |w| w.min(remaining)));
            }
        }

        for id in superseded {
            if let Some(entry) = state.contexts.get_mut(&id) {
                tracing::info!(
                    "Context {} (seq={}) superseded by seq={} from {}",
                    id,
                    entry.context.sequence_number,
                    meta.sequence_number,
                    meta.sender
                );
                self.schedule_undeploy(entry, grace);
            }
        }

        let id = ContextId::new();
        let loader = self.loaders.create(id);
        loader.add_participant(
            meta.sender.clone(),
            Participant {
                loader_id: meta.loader_id,
                sequence_number: meta.sequence_number,
            },
        );
        let context = Arc::new(ResolutionContext::remote(id, loader, meta));

        let mut entry = ContextEntry::new(context.clone());
        entry.acquire();
        if let Some(window) = stale_window {
            tracing::info!("Serving stale request from {} for another {:?}", meta.sender, window);
            self.schedule_undeploy(&mut entry, window);
        }

        state.contexts.insert(id, entry);
        state.by_loader.insert(key, id);
        state.by_sender.entry(meta.sender.clone()).or_default().insert(id);

        tracing::debug!("Created {:?} context {} for {}", meta.mode, id, meta.sender);
        Ok((context, true))
    }

    fn release_after_failure(&self, id: ContextId, created: bool) {
        let mut state = self.lock();
        let Some(entry) = state.contexts.get_mut(&id) else {
            return;
        };
        if let Err(e) = entry.release() {
            tracing::error!("{}", e);
        }
        if created && entry.usages == 0 && entry.context.module_count() == 0 {
            entry.undeploy();
            state.remove(id);
            tracing::debug!("Discarded context {} after failed resolution", id);
        } else if entry.is_removable() {
            self.remove_context(&mut state, id);
        }
    }

    fn remove_context(&self, state: &mut PerLoaderState, id: ContextId) {
        if let Some(entry) = state.remove(id) {
            for module in entry.context.modules() {
                self.events.record(
                    DeploymentEvent::new(
                        DeploymentEventKind::Undeployed,
                        module.alias.clone(),
                        entry.context.user_version.clone(),
                        entry.context.mode,
                        id,
                    )
                    .with_origin(entry.context.sender.clone()),
                );
            }
        }
    }

    fn undeploy_context(&self, state: &mut PerLoaderState, id: ContextId) {
        let Some(entry) = state.contexts.get_mut(&id) else {
            return;
        };
        entry.undeploy();
        let removable = entry.is_removable();
        state.unindex(id);

        if removable {
            self.remove_context(state, id);
        } else {
            state.cleanup.insert(id);
        }
    }

    pub fn release(&self, module: &DeployedModule) -> Result<(), DeployError> {
        let mut state = self.lock();
        let id = module.context_id;
        let entry = state
            .contexts
            .get_mut(&id)
            .ok_or_else(|| DeployError::Invariant(format!("release of unknown context {}", id)))?;

        entry.release()?;
        if entry.is_removable() {
            self.remove_context(&mut state, id);
        }
        Ok(())
    }

    fn on_undeploy_timeout(&self, id: ContextId) {
        let mut state = self.lock();
        let Some(entry) = state.contexts.get_mut(&id) else {
            return;
        };
        entry.timer_fired();
        let removable = entry.is_removable();
        state.unindex(id);

        if removable {
            self.remove_context(&mut state, id);
        } else {
            tracing::debug!("Undeploy of context {} deferred until released", id);
            state.cleanup.insert(id);
        }
    }

    /// Undeploys every context that originated on `node`.
    pub fn on_node_left(&self, node: &NodeId) {
        let mut state = self.lock();
        let ids: Vec<ContextId> = state
            .by_sender
            .get(node)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();

        for id in &ids {
            self.undeploy_context(&mut state, *id);
        }
        if !ids.is_empty() {
            tracing::info!("Undeployed {} context(s) of departed node {}", ids.len(), node);
        }
    }

    /// `sender` undeployed `alias`; drop the contexts that resolved it.
    pub fn on_undeploy_notice(&self, sender: &NodeId, alias: &str) {
        let mut state = self.lock();
        let ids: Vec<ContextId> = state
            .by_sender
            .get(sender)
            .map(|ids| {
                ids.iter()
                    .copied()
                    .filter(|id| {
                        state
                            .contexts
                            .get(id)
                            .is_some_and(|entry| entry.context.has_module(alias))
                    })
                    .collect()
            })
            .unwrap_or_default();

        for id in ids {
            self.undeploy_context(&mut state, id);
        }
    }

    pub fn find_context(&self, id: ContextId) -> Option<Arc<ResolutionContext>> {
        self.lock().contexts.get(&id).map(|entry| entry.context.clone())
    }

    /// Live context serving `(sender, loader_id)`.
    pub fn context_for(&self, sender: &NodeId, loader_id: ContextId) -> Option<Arc<ResolutionContext>> {
        let state = self.lock();
        let id = state.by_loader.get(&(sender.clone(), loader_id))?;
        state.contexts.get(id).map(|entry| entry.context.clone())
    }

    pub fn serve_resource(&self, loader_id: ContextId, resource_name: &str) -> Option<Arc<[u8]>> {
        self.find_context(loader_id)?.serve_resource(resource_name)
    }

    pub fn context_count(&self) -> usize {
        self.lock().contexts.len()
    }

    pub fn usages(&self, id: ContextId) -> Option<usize> {
        self.lock().contexts.get(&id).map(|entry| entry.usages)
    }

    pub fn is_pending_undeploy(&self, id: ContextId) -> bool {
        self.lock().contexts.get(&id).is_some_and(|entry| entry.pending_undeploy)
    }

    pub fn is_undeployed(&self, id: ContextId) -> bool {
        self.lock().contexts.get(&id).is_some_and(|entry| entry.undeployed)
    }

    pub fn awaiting_cleanup(&self) -> usize {
        self.lock().cleanup.len()
    }
}

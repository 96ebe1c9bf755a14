//! Per-Version Store
//!
//! Serves `Shared` and `Continuous` code. Nodes deploying the same user version of
//! identical code share one context; each registers as a participant with its own
//! loader id and sequence number.
//!
//! ## Acquire
//! 1. Reject loaders named in an earlier undeploy notice.
//! 2. Reuse the context the (sender, loader) pair already participates in.
//! 3. Detect redeploys and schedule superseded contexts for undeploy.
//! 4. Probe the remaining live contexts of the user version (no lock held) and
//!    join the first one whose code matches what the sender serves.
//! 5. Otherwise re-check under the lock and create a new context, retrying when a
//!    context appeared that was never probed.
//!
//! `Shared` contexts are undeployed when their last participant leaves;
//! `Continuous` contexts outlive their participants.

use super::cache::BoundedSet;
use super::context::{ContextEntry, ResolutionContext};
use super::events::{DeploymentEvent, DeploymentEventKind, DeploymentEvents};
use super::loader::LoaderFactory;
use super::types::{
    ContextId, DeployedModule, DeploymentMetadata, DeploymentMode, Participant, fingerprint, module_resource_name,
};
use crate::error::DeployError;
use crate::membership::types::NodeId;
use crate::timeout::TimeoutScheduler;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

struct PerVersionState {
    contexts: HashMap<ContextId, ContextEntry>,
    /// User version -> contexts, oldest first.
    by_version: HashMap<String, Vec<ContextId>>,
    dead_loaders: BoundedSet<ContextId>,
}

impl PerVersionState {
    fn check_dead(&self, meta: &DeploymentMetadata) -> Result<(), DeployError> {
        if self.dead_loaders.contains(&meta.loader_id) {
            tracing::warn!("Rejecting request for undeployed loader {} from {}", meta.loader_id, meta.sender);
            return Err(DeployError::DeadLoader(meta.loader_id));
        }
        Ok(())
    }

    /// Context the (sender, loader) pair already participates in.
    fn find_participant(&self, meta: &DeploymentMetadata) -> Option<ContextId> {
        let ids = self.by_version.get(&meta.user_version)?;
        ids.iter().copied().find(|id| {
            self.contexts.get(id).is_some_and(|entry| {
                !entry.undeployed
                    && entry
                        .context
                        .loader()
                        .and_then(|loader| loader.participant(&meta.sender))
                        .is_some_and(|p| p.loader_id == meta.loader_id)
            })
        })
    }

    fn live_ids(&self, user_version: &str) -> Vec<ContextId> {
        self.by_version
            .get(user_version)
            .map(|ids| {
                ids.iter()
                    .copied()
                    .filter(|id| self.contexts.get(id).is_some_and(ContextEntry::is_live))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn remove(&mut self, id: ContextId) -> Option<ContextEntry> {
        let mut entry = self.contexts.remove(&id)?;
        entry.cancel_timer();
        if let Some(ids) = self.by_version.get_mut(&entry.context.user_version) {
            ids.retain(|candidate| *candidate != id);
            if ids.is_empty() {
                self.by_version.remove(&entry.context.user_version);
            }
        }
        Some(entry)
    }
}

/// Outcome of the first locked pass.
enum Decision {
    Ready {
        context: Arc<ResolutionContext>,
        created: bool,
    },
    Verify {
        candidates: Vec<Arc<ResolutionContext>>,
        /// Every live context of the user version at decision time.
        seen: HashSet<ContextId>,
    },
}

fn check_mode(context: &ResolutionContext, meta: &DeploymentMetadata) -> Result<(), DeployError> {
    if context.mode != meta.mode {
        tracing::warn!(
            "Mode conflict for {} from {}: deployed as {:?}, requested {:?}",
            meta.alias,
            meta.sender,
            context.mode,
            meta.mode
        );
        return Err(DeployError::ModeConflict {
            name: meta.alias.clone(),
            existing: context.mode,
            requested: meta.mode,
        });
    }
    Ok(())
}

pub struct PerVersionStore {
    me: Weak<Self>,
    loaders: LoaderFactory,
    scheduler: Arc<TimeoutScheduler>,
    events: DeploymentEvents,
    state: Mutex<PerVersionState>,
}

impl PerVersionStore {
    pub fn new(loaders: LoaderFactory, scheduler: Arc<TimeoutScheduler>, events: DeploymentEvents) -> Arc<Self> {
        let dead_loaders = BoundedSet::new(loaders.config.dead_loader_cache_size);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            loaders,
            scheduler,
            events,
            state: Mutex::new(PerVersionState {
                contexts: HashMap::new(),
                by_version: HashMap::new(),
                dead_loaders,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, PerVersionState> {
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

    pub async fn acquire(&self, meta: &DeploymentMetadata) -> Result<Arc<DeployedModule>, DeployError> {
        loop {
            let (context, created) = match self.decide(meta)? {
                Decision::Ready { context, created } => (context, created),
                Decision::Verify { candidates, seen } => match self.verify_candidates(&candidates, meta).await? {
                    Some(context) => (context, false),
                    None => match self.settle(meta, &seen)? {
                        Some(ready) => ready,
                        None => {
                            tracing::debug!("New context appeared for version {}, retrying", meta.user_version);
                            continue;
                        }
                    },
                },
            };
            return self.finish(context, created, meta).await;
        }
    }

    fn decide(&self, meta: &DeploymentMetadata) -> Result<Decision, DeployError> {
        let mut state = self.lock();
        state.check_dead(meta)?;

        if let Some(context) = Self::join_existing(&mut state, meta)? {
            return Ok(Decision::Ready {
                context,
                created: false,
            });
        }

        let stale_window = self.check_redeploy(&mut state, meta)?;

        let live = state.live_ids(&meta.user_version);
        let seen: HashSet<ContextId> = live.iter().copied().collect();
        let candidates: Vec<Arc<ResolutionContext>> = live
            .iter()
            .filter_map(|id| state.contexts.get(id))
            .filter(|entry| {
                entry
                    .context
                    .loader()
                    .is_some_and(|loader| loader.participant(&meta.sender).is_none())
            })
            .map(|entry| entry.context.clone())
            .collect();

        if candidates.is_empty() {
            let context = self.create_context(&mut state, meta, stale_window);
            return Ok(Decision::Ready { context, created: true });
        }
        Ok(Decision::Verify { candidates, seen })
    }

    /// Acquires the context the pair already participates in, if any.
    fn join_existing(
        state: &mut PerVersionState,
        meta: &DeploymentMetadata,
    ) -> Result<Option<Arc<ResolutionContext>>, DeployError> {
        let Some(id) = state.find_participant(meta) else {
            return Ok(None);
        };
        let Some(entry) = state.contexts.get_mut(&id) else {
            return Ok(None);
        };
        check_mode(&entry.context, meta)?;
        if let Some(loader) = entry.context.loader() {
            loader.touch_participant(&meta.sender, meta.loader_id);
        }
        entry.acquire();
        Ok(Some(entry.context.clone()))
    }

    /// Schedules contexts superseded by `meta` for undeploy. Returns the remaining
    /// window when `meta` itself is the stale side.
    fn check_redeploy(
        &self,
        state: &mut PerVersionState,
        meta: &DeploymentMetadata,
    ) -> Result<Option<Duration>, DeployError> {
        let grace = self.grace();
        let mut superseded = Vec::new();
        let mut stale_window: Option<Duration> = None;

        for (id, entry) in state.contexts.iter() {
            if !entry.is_live() {
                continue;
            }
            let Some(loader) = entry.context.loader() else {
                continue;
            };

            if loader.participant_count() == 0 {
                // Orphaned code still cached for the module; a different user
                // version or a fresh shared deployment replaces it.
                if entry.context.has_module(&meta.module_name)
                    && (entry.context.user_version != meta.user_version || meta.mode == DeploymentMode::Shared)
                {
                    superseded.push(*id);
                }
                continue;
            }

            if entry.context.user_version != meta.user_version {
                continue;
            }
            let Some(existing) = loader.participant(&meta.sender) else {
                continue;
            };
            if existing.loader_id == meta.loader_id {
                continue;
            }

            if existing.sequence_number < meta.sequence_number {
                superseded.push(*id);
            } else if existing.sequence_number > meta.sequence_number {
                let elapsed = entry.context.created_at.elapsed();
                if elapsed >= grace {
                    tracing::warn!(
                        "Rejecting stale request from {} (seq={}, newer seq={})",
                        meta.sender,
                        meta.sequence_number,
                        existing.sequence_number
                    );
                    return Err(DeployError::StaleRequest {
                        sender: meta.sender.clone(),
                        sequence: meta.sequence_number,
                        newer: existing.sequence_number,
                    });
                }
                let remaining = grace - elapsed;
                stale_window = Some(stale_window.map_or(remaining, |w| w.min(remaining)));
            } else {
                tracing::error!(
                    "Node {} announced seq={} under loaders {} and {}",
                    meta.sender,
                    meta.sequence_number,
                    existing.loader_id,
                    meta.loader_id
                );
                return Err(DeployError::ConsistencyViolation(format!(
                    "node {} used sequence number {} for loaders {} and {}",
                    meta.sender, meta.sequence_number, existing.loader_id, meta.loader_id
                )));
            }
        }

        for id in superseded {
            if let Some(entry) = state.contexts.get_mut(&id) {
                tracing::info!("Context {} superseded by request from {}", id, meta.sender);
                self.schedule_undeploy(entry, grace);
            }
        }
        Ok(stale_window)
    }

    fn create_context(
        &self,
        state: &mut PerVersionState,
        meta: &DeploymentMetadata,
        stale_window: Option<Duration>,
    ) -> Arc<ResolutionContext> {
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
        state.by_version.entry(meta.user_version.clone()).or_default().push(id);

        tracing::debug!(
            "Created {:?} context {} for version {} (origin: {})",
            meta.mode,
            id,
            meta.user_version,
            meta.sender
        );
        context
    }

    /// Joins the first candidate whose code matches what the sender serves.
    async fn verify_candidates(
        &self,
        candidates: &[Arc<ResolutionContext>],
        meta: &DeploymentMetadata,
    ) -> Result<Option<Arc<ResolutionContext>>, DeployError> {
        for candidate in candidates {
            if !self.same_code(candidate, meta).await {
                continue;
            }

            let mut state = self.lock();
            state.check_dead(meta)?;
            let Some(entry) = state.contexts.get_mut(&candidate.id) else {
                continue;
            };
            if !entry.is_live() {
                continue;
            }
            let Some(loader) = entry.context.loader() else {
                continue;
            };
            if loader
                .participant(&meta.sender)
                .is_some_and(|p| p.loader_id != meta.loader_id)
            {
                continue;
            }
            check_mode(&entry.context, meta)?;
            loader.add_participant(
                meta.sender.clone(),
                Participant {
                    loader_id: meta.loader_id,
                    sequence_number: meta.sequence_number,
                },
            );
            entry.acquire();

            tracing::debug!("Node {} joined context {}", meta.sender, candidate.id);
            return Ok(Some(candidate.clone()));
        }
        Ok(None)
    }

    /// True when `candidate` already resolved the module, or when the sender's
    /// loader serves the same bytes for a module `candidate` resolved.
    async fn same_code(&self, candidate: &ResolutionContext, meta: &DeploymentMetadata) -> bool {
        if candidate.has_module(&meta.module_name) {
            return true;
        }
        let Some(probe) = candidate.any_module() else {
            return self.same_unresolved_code(candidate, meta).await;
        };

        let resource = module_resource_name(probe.name());
        match self
            .loaders
            .comm
            .fetch_resource(&meta.sender, Some(meta.loader_id), &resource, self.loaders.config.peer_fetch_timeout)
            .await
        {
            Ok(bytes) => fingerprint(&bytes) == probe.module.fingerprint,
            Err(e) => {
                tracing::debug!("Probe of {} at {} failed: {}", resource, meta.sender, e);
                false
            }
        }
    }

    /// `candidate` was created by a concurrent request and has not resolved
    /// anything yet. Compares the requested module as served by both sides.
    async fn same_unresolved_code(&self, candidate: &ResolutionContext, meta: &DeploymentMetadata) -> bool {
        let Some(loader) = candidate.loader() else {
            return false;
        };
        if self.loaders.config.is_excluded(&meta.module_name) {
            return true;
        }

        let resource = module_resource_name(&meta.module_name);
        let theirs = match self
            .loaders
            .comm
            .fetch_resource(&meta.sender, Some(meta.loader_id), &resource, self.loaders.config.peer_fetch_timeout)
            .await
        {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::debug!("Probe of {} at {} failed: {}", resource, meta.sender, e);
                return false;
            }
        };

        match loader.load_module(&meta.module_name).await {
            Ok(ours) => fingerprint(&ours) == fingerprint(&theirs),
            Err(e) => {
                tracing::debug!("Context {} cannot load {}: {}", candidate.id, meta.module_name, e);
                false
            }
        }
    }

    /// Second locked pass after probing. `None` asks the caller to start over.
    fn settle(
        &self,
        meta: &DeploymentMetadata,
        seen: &HashSet<ContextId>,
    ) -> Result<Option<(Arc<ResolutionContext>, bool)>, DeployError> {
        let mut state = self.lock();
        state.check_dead(meta)?;

        if let Some(context) = Self::join_existing(&mut state, meta)? {
            return Ok(Some((context, false)));
        }

        let appeared = state
            .live_ids(&meta.user_version)
            .into_iter()
            .any(|id| !seen.contains(&id));
        if appeared {
            return Ok(None);
        }

        let stale_window = self.check_redeploy(&mut state, meta)?;
        let context = self.create_context(&mut state, meta, stale_window);
        Ok(Some((context, true)))
    }

    async fn finish(
        &self,
        context: Arc<ResolutionContext>,
        created: bool,
        meta: &DeploymentMetadata,
    ) -> Result<Arc<DeployedModule>, DeployError> {
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

    fn release_after_failure(&self, id: ContextId, created: bool) {
        let mut state = self.lock();
        let Some(entry) = state.contexts.get_mut(&id) else {
            return;
        };
        if let Err(e) = entry.release() {
            tracing::error!("{}", e);
        }
        if created && entry.usages == 0 && entry.context.module_count() == 0 {
            state.remove(id);
            tracing::debug!("Discarded context {} after failed resolution", id);
        } else if entry.is_removable() {
            self.remove_context(&mut state, id);
        }
    }

    fn remove_context(&self, state: &mut PerVersionState, id: ContextId) {
        if let Some(entry) = state.remove(id) {
            for module in entry.context.modules() {
                self.events.record(DeploymentEvent::new(
                    DeploymentEventKind::Undeployed,
                    module.alias.clone(),
                    entry.context.user_version.clone(),
                    entry.context.mode,
                    id,
                ));
            }
        }
    }

    fn undeploy_context(&self, state: &mut PerVersionState, id: ContextId) {
        let Some(entry) = state.contexts.get_mut(&id) else {
            return;
        };
        entry.undeploy();
        if entry.is_removable() {
            self.remove_context(state, id);
        } else {
            tracing::debug!("Context {} undeployed, removal deferred ({} in use)", id, entry.usages);
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
        if entry.is_removable() {
            self.remove_context(&mut state, id);
        } else {
            tracing::debug!("Undeploy of context {} deferred until released", id);
        }
    }

    /// Drops `node` from every context. Emptied `Shared` contexts are undeployed.
    pub fn on_node_left(&self, node: &NodeId) {
        let mut state = self.lock();
        let mut emptied = Vec::new();

        for (id, entry) in state.contexts.iter() {
            let Some(loader) = entry.context.loader() else {
                continue;
            };
            if loader.remove_participant(node).is_none() {
                continue;
            }
            tracing::debug!("Removed departed node {} from context {}", node, id);
            if !entry.undeployed && loader.participant_count() == 0 && entry.context.mode == DeploymentMode::Shared {
                emptied.push(*id);
            }
        }

        for id in emptied {
            tracing::info!("Shared context {} lost its last participant", id);
            self.undeploy_context(&mut state, id);
        }
    }

    /// `sender` undeployed `alias`: its loader id becomes dead and contexts that
    /// resolved the module through it are undeployed.
    pub fn on_undeploy_notice(&self, sender: &NodeId, alias: &str) {
        let mut state = self.lock();
        let mut matched = Vec::new();

        for (id, entry) in state.contexts.iter() {
            if entry.undeployed || !entry.context.has_module(alias) {
                continue;
            }
            let Some(participant) = entry.context.loader().and_then(|loader| loader.remove_participant(sender)) else {
                continue;
            };
            matched.push((*id, participant.loader_id));
        }

        for (id, loader_id) in matched {
            state.dead_loaders.insert(loader_id);
            tracing::info!("Undeploying context {} on notice from {} (loader {})", id, sender, loader_id);
            self.undeploy_context(&mut state, id);
        }
    }

    pub fn find_context(&self, id: ContextId) -> Option<Arc<ResolutionContext>> {
        self.lock().contexts.get(&id).map(|entry| entry.context.clone())
    }

    pub fn serve_resource(&self, loader_id: ContextId, resource_name: &str) -> Option<Arc<[u8]>> {
        self.find_context(loader_id)?.serve_resource(resource_name)
    }

    /// Contexts registered for `user_version`, oldest first.
    pub fn contexts_for_version(&self, user_version: &str) -> Vec<ContextId> {
        self.lock().by_version.get(user_version).cloned().unwrap_or_default()
    }

    pub fn context_count(&self) -> usize {
        self.lock().contexts.len()
    }

    pub fn usages(&self, id: ContextId) -> Option<usize> {
        self.lock().contexts.get(&id).map(|entry| entry.usages)
    }

    pub fn participants(&self, id: ContextId) -> Vec<NodeId> {
        self.find_context(id)
            .and_then(|context| context.loader().map(|loader| loader.participants()))
            .map(|participants| participants.into_iter().map(|(node, _)| node).collect())
            .unwrap_or_default()
    }

    pub fn is_pending_undeploy(&self, id: ContextId) -> bool {
        self.lock().contexts.get(&id).is_some_and(|entry| entry.pending_undeploy)
    }

    pub fn is_undeployed(&self, id: ContextId) -> bool {
        self.lock().contexts.get(&id).is_some_and(|entry| entry.undeployed)
    }

    pub fn is_dead_loader(&self, loader_id: ContextId) -> bool {
        self.lock().dead_loaders.contains(&loader_id)
    }
}

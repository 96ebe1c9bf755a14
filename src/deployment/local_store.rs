//! Local Store
//!
//! Contexts for code originating on this node, keyed by alias (and module name).
//! Each context pins one module definition and is advertised to peers through its
//! id, which they use as the loader id when fetching code back.

use super::context::{ContextEntry, ResolutionContext};
use super::events::{DeploymentEvent, DeploymentEventKind, DeploymentEvents};
use super::registry::{LocalModuleRegistry, ModuleDefinition};
use super::types::{ContextId, DeployedModule, fingerprint};
use crate::config::DeploymentConfig;
use crate::error::DeployError;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Default)]
struct LocalState {
    contexts: HashMap<ContextId, ContextEntry>,
    /// Alias and module name -> contexts, oldest first.
    by_name: HashMap<String, Vec<ContextId>>,
}

impl LocalState {
    fn live_context(&self, name: &str) -> Option<ContextId> {
        self.by_name.get(name)?.iter().rev().copied().find(|id| {
            self.contexts
                .get(id)
                .map(|entry| !entry.undeployed)
                .unwrap_or(false)
        })
    }

    fn index(&mut self, context: &ResolutionContext) {
        if let Some(definition) = context.definition() {
            let mut keys = vec![definition.name.clone()];
            if definition.alias_or_name() != definition.name {
                keys.push(definition.alias_or_name().to_string());
            }
            for key in keys {
                self.by_name.entry(key).or_default().push(context.id);
            }
        }
    }

    fn remove(&mut self, id: ContextId) -> Option<ContextEntry> {
        let mut entry = self.contexts.remove(&id)?;
        entry.cancel_timer();
        self.by_name.retain(|_, ids| {
            ids.retain(|candidate| *candidate != id);
            !ids.is_empty()
        });
        Some(entry)
    }
}

pub struct LocalStore {
    config: Arc<DeploymentConfig>,
    registry: Arc<LocalModuleRegistry>,
    events: DeploymentEvents,
    sequence: AtomicU64,
    state: Mutex<LocalState>,
}

impl LocalStore {
    pub fn new(config: Arc<DeploymentConfig>, registry: Arc<LocalModuleRegistry>, events: DeploymentEvents) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry,
            events,
            sequence: AtomicU64::new(1),
            state: Mutex::new(LocalState::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, LocalState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }

    fn create_context(&self, state: &mut LocalState, definition: Arc<ModuleDefinition>) -> Result<ContextEntry, DeployError> {
        let context = Arc::new(ResolutionContext::local(
            self.registry.clone(),
            definition,
            self.config.mode,
            self.next_sequence(),
        ));
        let module = context.resolve_primary()?;
        state.index(&context);

        self.events.record(DeploymentEvent::new(
            DeploymentEventKind::Deployed,
            module.alias.clone(),
            context.user_version.clone(),
            context.mode,
            context.id,
        ));
        Ok(ContextEntry::new(context))
    }

    /// Module for `alias` with its usage counted. Creates a context from the local
    /// registry when none is live.
    pub fn acquire(&self, alias: &str) -> Result<Arc<DeployedModule>, DeployError> {
        let mut state = self.lock();

        if let Some(id) = state.live_context(alias)
            && let Some(entry) = state.contexts.get_mut(&id)
        {
            let module = entry
                .context
                .module(alias)
                .ok_or_else(|| DeployError::Invariant(format!("local context {} lost module {}", id, alias)))?;
            entry.acquire();
            return Ok(module);
        }

        let definition = self
            .registry
            .lookup(alias)
            .ok_or_else(|| DeployError::not_found(alias))?;
        let mut entry = self.create_context(&mut state, definition)?;
        let module = entry.context.resolve_primary()?;
        entry.acquire();
        state.contexts.insert(entry.context.id, entry);

        Ok(module)
    }

    /// Explicit deploy. Identical code keeps the current context; different code
    /// undeploys it and starts a new one with a higher sequence number.
    pub fn deploy(&self, definition: ModuleDefinition) -> Result<Arc<DeployedModule>, DeployError> {
        let definition = self.registry.register_explicit(definition);
        let alias = definition.alias_or_name().to_string();
        let mut state = self.lock();

        if let Some(id) = state.live_context(&alias)
            && let Some(entry) = state.contexts.get(&id)
        {
            let current = entry.context.resolve_primary()?;
            if current.name() == definition.name && current.module.fingerprint == fingerprint(&definition.code) {
                tracing::debug!("{} already deployed with identical code", alias);
                return Ok(current);
            }
            tracing::info!("Redeploying {} with new code", alias);
            self.undeploy_context(&mut state, id);
        }

        let entry = self.create_context(&mut state, definition)?;
        let module = entry.context.resolve_primary()?;
        state.contexts.insert(entry.context.id, entry);
        Ok(module)
    }

    fn undeploy_context(&self, state: &mut LocalState, id: ContextId) {
        let Some(entry) = state.contexts.get_mut(&id) else {
            return;
        };
        entry.undeploy();
        if entry.is_removable() {
            self.remove_context(state, id);
        } else {
            tracing::debug!("Local context {} undeployed, removal deferred ({} in use)", id, entry.usages);
        }
    }

    fn remove_context(&self, state: &mut LocalState, id: ContextId) {
        if let Some(entry) = state.remove(id) {
            let alias = entry
                .context
                .definition()
                .map(|definition| definition.alias_or_name().to_string())
                .unwrap_or_default();
            self.events.record(DeploymentEvent::new(
                DeploymentEventKind::Undeployed,
                alias,
                entry.context.user_version.clone(),
                entry.context.mode,
                id,
            ));
        }
    }

    /// Undeploys every live context for `alias`. Returns whether one existed.
    pub fn undeploy(&self, alias: &str) -> bool {
        let mut state = self.lock();
        let ids: Vec<ContextId> = state.by_name.get(alias).cloned().unwrap_or_default();

        let mut found = false;
        for id in ids {
            if state.contexts.get(&id).is_some_and(|entry| !entry.undeployed) {
                found = true;
                self.undeploy_context(&mut state, id);
            }
        }
        drop(state);

        self.registry.unregister_explicit(alias);
        found
    }

    pub fn release(&self, module: &DeployedModule) -> Result<(), DeployError> {
        let mut state = self.lock();
        let id = module.context_id;
        let entry = state
            .contexts
            .get_mut(&id)
            .ok_or_else(|| DeployError::Invariant(format!("release of unknown local context {}", id)))?;

        entry.release()?;
        if entry.is_removable() {
            self.remove_context(&mut state, id);
        }
        Ok(())
    }

    pub fn find_context(&self, id: ContextId) -> Option<Arc<ResolutionContext>> {
        self.lock().contexts.get(&id).map(|entry| entry.context.clone())
    }

    /// Context currently answering for `alias`.
    pub fn live_context(&self, alias: &str) -> Option<Arc<ResolutionContext>> {
        let state = self.lock();
        let id = state.live_context(alias)?;
        state.contexts.get(&id).map(|entry| entry.context.clone())
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployment::types::module_resource_name;

    fn store() -> (Arc<LocalStore>, Arc<LocalModuleRegistry>) {
        let registry = LocalModuleRegistry::new();
        let store = LocalStore::new(
            Arc::new(DeploymentConfig::default()),
            registry.clone(),
            DeploymentEvents::default(),
        );
        (store, registry)
    }

    #[test]
    fn test_acquire_from_registry_and_reuse() {
        let (store, registry) = store();
        registry.register(ModuleDefinition::new("app.WordCount", b"wc".to_vec()).with_alias("wc"));

        let by_alias = store.acquire("wc").unwrap();
        let by_name = store.acquire("app.WordCount").unwrap();

        assert!(Arc::ptr_eq(&by_alias, &by_name));
        assert!(by_alias.is_local);
        assert_eq!(store.context_count(), 1);
        assert_eq!(store.usages(by_alias.context_id), Some(2));
    }

    #[test]
    fn test_acquire_unknown_is_not_found() {
        let (store, _) = store();

        let err = store.acquire("nothing").unwrap_err();

        assert!(err.is_not_found());
        assert_eq!(store.context_count(), 0);
    }

    #[test]
    fn test_redeploy_same_code_keeps_context() {
        let (store, _) = store();

        let first = store.deploy(ModuleDefinition::new("app.Job", b"v1".to_vec())).unwrap();
        let second = store.deploy(ModuleDefinition::new("app.Job", b"v1".to_vec())).unwrap();

        assert_eq!(first.context_id, second.context_id);
        assert_eq!(store.context_count(), 1);
    }

    #[test]
    fn test_redeploy_new_code_supersedes_with_higher_sequence() {
        let (store, _) = store();

        let first = store.deploy(ModuleDefinition::new("app.Job", b"v1".to_vec())).unwrap();
        let second = store.deploy(ModuleDefinition::new("app.Job", b"v2".to_vec())).unwrap();

        assert_ne!(first.context_id, second.context_id);
        assert!(second.sequence_number > first.sequence_number);
        // Unused old context goes away at once.
        assert_eq!(store.context_count(), 1);
        assert!(store.find_context(first.context_id).is_none());
    }

    #[test]
    fn test_undeploy_defers_removal_until_last_release() {
        let (store, registry) = store();
        store.deploy(ModuleDefinition::new("app.Job", b"v1".to_vec())).unwrap();
        let module = store.acquire("app.Job").unwrap();

        assert!(store.undeploy("app.Job"));
        assert_eq!(store.context_count(), 1);
        assert!(store.live_context("app.Job").is_none());
        assert!(!registry.has_module("app.Job"));

        store.release(&module).unwrap();
        assert_eq!(store.context_count(), 0);
    }

    #[test]
    fn test_release_without_acquire_is_invariant_error() {
        let (store, _) = store();
        let module = store.deploy(ModuleDefinition::new("app.Job", b"v1".to_vec())).unwrap();

        let err = store.release(&module).unwrap_err();

        assert!(matches!(err, DeployError::Invariant(_)));
        assert_eq!(store.usages(module.context_id), Some(0));
    }

    #[test]
    fn test_old_context_keeps_serving_its_own_code() {
        let (store, _) = store();
        let old = store.deploy(ModuleDefinition::new("app.Job", b"v1".to_vec())).unwrap();
        let held = store.acquire("app.Job").unwrap();
        let new = store.deploy(ModuleDefinition::new("app.Job", b"v2".to_vec())).unwrap();

        let resource = module_resource_name("app.Job");
        assert_eq!(&*store.serve_resource(old.context_id, &resource).unwrap(), b"v1");
        assert_eq!(&*store.serve_resource(new.context_id, &resource).unwrap(), b"v2");

        store.release(&held).unwrap();
        assert!(store.serve_resource(old.context_id, &resource).is_none());
    }
}

//! Resolution contexts and their store-side lifecycle bookkeeping.
//!
//! A [`ResolutionContext`] owns a namespace of resolved modules. Within one context
//! a module name resolves at most once; every later lookup returns the same
//! `Arc<DeployedModule>`. The module cache is append-only, so readers never lock
//! the owning store.
//!
//! [`ContextEntry`] is the mutable part (usage count, undeploy flags, timer) that
//! lives inside a store's state and is only touched under the store lock.

use super::loader::PeerModuleLoader;
use super::registry::{LocalModuleRegistry, ModuleDefinition};
use super::types::{
    ContextId, DeployedModule, DeploymentMetadata, DeploymentMode, ResolvedModule, module_name_from_resource,
    module_resource_name,
};
use crate::error::DeployError;
use crate::membership::types::NodeId;
use crate::timeout::TimeoutHandle;

use dashmap::DashMap;
use std::sync::Arc;
use tokio::time::Instant;

pub enum ModuleSource {
    /// Code deployed from this node. `definition` is pinned at creation so a later
    /// redeploy under the same name does not leak into this context.
    Local {
        registry: Arc<LocalModuleRegistry>,
        definition: Arc<ModuleDefinition>,
    },
    /// Code fetched from participating peers.
    Peer(Arc<PeerModuleLoader>),
}

pub struct ResolutionContext {
    pub id: ContextId,
    pub mode: DeploymentMode,
    pub user_version: String,
    pub sequence_number: u64,
    /// Originating node of remote code; `None` for local contexts.
    pub sender: Option<NodeId>,
    pub created_at: Instant,
    source: ModuleSource,
    modules: DashMap<String, Arc<DeployedModule>>,
    aliases: DashMap<String, String>,
}

impl ResolutionContext {
    pub fn local(
        registry: Arc<LocalModuleRegistry>,
        definition: Arc<ModuleDefinition>,
        mode: DeploymentMode,
        sequence_number: u64,
    ) -> Self {
        Self {
            id: ContextId::new(),
            mode,
            user_version: definition.user_version.clone(),
            sequence_number,
            sender: None,
            created_at: Instant::now(),
            source: ModuleSource::Local { registry, definition },
            modules: DashMap::new(),
            aliases: DashMap::new(),
        }
    }

    pub fn remote(id: ContextId, loader: Arc<PeerModuleLoader>, meta: &DeploymentMetadata) -> Self {
        Self {
            id,
            mode: meta.mode,
            user_version: meta.user_version.clone(),
            sequence_number: meta.sequence_number,
            sender: Some(meta.sender.clone()),
            created_at: Instant::now(),
            source: ModuleSource::Peer(loader),
            modules: DashMap::new(),
            aliases: DashMap::new(),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self.source, ModuleSource::Local { .. })
    }

    pub fn loader(&self) -> Option<&Arc<PeerModuleLoader>> {
        match &self.source {
            ModuleSource::Peer(loader) => Some(loader),
            ModuleSource::Local { .. } => None,
        }
    }

    /// The module this local context was created for.
    pub fn definition(&self) -> Option<&Arc<ModuleDefinition>> {
        match &self.source {
            ModuleSource::Local { definition, .. } => Some(definition),
            ModuleSource::Peer(_) => None,
        }
    }

    /// Already resolved module, by name or alias.
    pub fn module(&self, name_or_alias: &str) -> Option<Arc<DeployedModule>> {
        if let Some(module) = self.modules.get(name_or_alias) {
            return Some(module.value().clone());
        }
        let name = self.aliases.get(name_or_alias)?.value().clone();
        self.modules.get(&name).map(|module| module.value().clone())
    }

    pub fn has_module(&self, name_or_alias: &str) -> bool {
        self.module(name_or_alias).is_some()
    }

    /// Any resolved module; used to probe whether a peer serves identical code.
    pub fn any_module(&self) -> Option<Arc<DeployedModule>> {
        self.modules.iter().next().map(|module| module.value().clone())
    }

    pub fn modules(&self) -> Vec<Arc<DeployedModule>> {
        self.modules.iter().map(|module| module.value().clone()).collect()
    }

    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    /// Resolves `module_name` once per context. The flag is true for the call whose
    /// result got cached; concurrent callers all receive that same module.
    pub async fn resolve(&self, module_name: &str, alias: &str) -> Result<(Arc<DeployedModule>, bool), DeployError> {
        if let Some(module) = self.module(module_name) {
            return Ok((module, false));
        }

        let code = match &self.source {
            ModuleSource::Local { registry, definition } => {
                if definition.name == module_name || definition.alias_or_name() == module_name {
                    definition.code.clone()
                } else {
                    registry
                        .lookup(module_name)
                        .map(|definition| definition.code.clone())
                        .ok_or_else(|| DeployError::not_found(module_name))?
                }
            }
            ModuleSource::Peer(loader) => loader.load_module(module_name).await?,
        };

        Ok(self.cache_module(module_name, alias, code))
    }

    /// Resolves the primary module of a local context without suspending.
    pub fn resolve_primary(&self) -> Result<Arc<DeployedModule>, DeployError> {
        let ModuleSource::Local { definition, .. } = &self.source else {
            return Err(DeployError::Invariant(format!("context {} is not local", self.id)));
        };
        if let Some(module) = self.module(&definition.name) {
            return Ok(module);
        }
        let (module, _) = self.cache_module(&definition.name, definition.alias_or_name(), definition.code.clone());
        Ok(module)
    }

    fn cache_module(&self, module_name: &str, alias: &str, code: Arc<[u8]>) -> (Arc<DeployedModule>, bool) {
        let candidate = Arc::new(DeployedModule {
            module: Arc::new(ResolvedModule::new(module_name, code)),
            alias: alias.to_string(),
            mode: self.mode,
            context_id: self.id,
            sequence_number: self.sequence_number,
            user_version: self.user_version.clone(),
            sender: self.sender.clone(),
            is_local: self.is_local(),
        });

        let winner = self
            .modules
            .entry(module_name.to_string())
            .or_insert_with(|| candidate.clone())
            .value()
            .clone();
        if alias != module_name {
            self.aliases
                .entry(alias.to_string())
                .or_insert_with(|| module_name.to_string());
        }

        let fresh = Arc::ptr_eq(&winner, &candidate);
        (winner, fresh)
    }

    /// Bytes this context can hand to a peer that names it as loader.
    pub fn serve_resource(&self, resource_name: &str) -> Option<Arc<[u8]>> {
        match &self.source {
            ModuleSource::Local { registry, definition } => {
                if module_resource_name(&definition.name) == resource_name {
                    Some(definition.code.clone())
                } else {
                    registry.resource(resource_name)
                }
            }
            ModuleSource::Peer(loader) => loader.cached_resource(resource_name).or_else(|| {
                let name = module_name_from_resource(resource_name)?;
                self.modules.get(&name).map(|module| module.module.code.clone())
            }),
        }
    }
}

/// Store-side state of one context.
pub struct ContextEntry {
    pub context: Arc<ResolutionContext>,
    pub usages: usize,
    pub undeployed: bool,
    pub pending_undeploy: bool,
    timer: Option<TimeoutHandle>,
}

impl ContextEntry {
    pub fn new(context: Arc<ResolutionContext>) -> Self {
        Self {
            context,
            usages: 0,
            undeployed: false,
            pending_undeploy: false,
            timer: None,
        }
    }

    pub fn acquire(&mut self) {
        self.usages += 1;
    }

    pub fn release(&mut self) -> Result<(), DeployError> {
        if self.usages == 0 {
            return Err(DeployError::Invariant(format!(
                "release of context {} without a matching acquire",
                self.context.id
            )));
        }
        self.usages -= 1;
        Ok(())
    }

    /// Eligible to serve new requests and to be picked as a reuse candidate.
    pub fn is_live(&self) -> bool {
        !self.undeployed && !self.pending_undeploy
    }

    pub fn is_removable(&self) -> bool {
        self.undeployed && self.usages == 0
    }

    pub fn schedule_undeploy(&mut self, timer: TimeoutHandle) {
        if let Some(previous) = self.timer.replace(timer) {
            previous.cancel();
        }
        self.pending_undeploy = true;
    }

    /// Marks the context undeployed. Any pending timer is dropped.
    pub fn undeploy(&mut self) {
        self.cancel_timer();
        self.pending_undeploy = false;
        self.undeployed = true;
    }

    /// Called from the timer callback itself; the timer is already spent.
    pub fn timer_fired(&mut self) {
        self.timer = None;
        self.pending_undeploy = false;
        self.undeployed = true;
    }

    pub fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_context(code: &[u8]) -> ResolutionContext {
        let registry = LocalModuleRegistry::new();
        let definition = registry.register(ModuleDefinition::new("app.Job", code.to_vec()).with_alias("job"));
        ResolutionContext::local(registry, definition, DeploymentMode::Shared, 1)
    }

    #[tokio::test]
    async fn test_resolve_is_idempotent_per_name() {
        let context = local_context(b"job-v1");

        let (first, fresh_first) = context.resolve("app.Job", "job").await.unwrap();
        let (second, fresh_second) = context.resolve("app.Job", "job").await.unwrap();

        assert!(fresh_first);
        assert!(!fresh_second);
        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&context.module("job").unwrap(), &first));
    }

    #[tokio::test]
    async fn test_local_context_pins_its_definition() {
        let context = local_context(b"job-v1");
        if let ModuleSource::Local { registry, .. } = &context.source {
            registry.register(ModuleDefinition::new("app.Job", b"job-v2".to_vec()));
        }

        let module = context.resolve_primary().unwrap();

        assert_eq!(&*module.module.code, b"job-v1");
        assert_eq!(
            &*context.serve_resource("app/Job.module").unwrap(),
            b"job-v1"
        );
    }

    #[tokio::test]
    async fn test_resolve_unknown_module_is_not_found() {
        let context = local_context(b"job");

        let err = context.resolve("app.Missing", "app.Missing").await.unwrap_err();

        assert!(err.is_not_found());
        assert_eq!(context.module_count(), 0);
    }

    #[test]
    fn test_entry_release_below_zero_is_invariant_error() {
        let mut entry = ContextEntry::new(Arc::new(local_context(b"job")));
        entry.acquire();

        assert!(entry.release().is_ok());
        assert!(matches!(entry.release(), Err(DeployError::Invariant(_))));
        assert_eq!(entry.usages, 0);
    }

    #[test]
    fn test_entry_removable_only_when_undeployed_and_unused() {
        let mut entry = ContextEntry::new(Arc::new(local_context(b"job")));
        entry.acquire();
        entry.undeploy();

        assert!(!entry.is_live());
        assert!(!entry.is_removable());

        entry.release().unwrap();
        assert!(entry.is_removable());
    }
}

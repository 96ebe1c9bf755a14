//! Local Module Registry
//!
//! The node's own code path: maps module names (and aliases) to their code, plus
//! auxiliary resources by path. The local store resolves from here, and incoming
//! fetch requests for local loaders are answered from here.

use super::types::{DEFAULT_USER_VERSION, module_name_from_resource};

use dashmap::DashMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleDefinition {
    pub name: String,
    pub alias: Option<String>,
    pub user_version: String,
    pub code: Arc<[u8]>,
}

impl ModuleDefinition {
    pub fn new(name: impl Into<String>, code: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            alias: None,
            user_version: DEFAULT_USER_VERSION.to_string(),
            code: Arc::from(code.into()),
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn with_user_version(mut self, user_version: impl Into<String>) -> Self {
        self.user_version = user_version.into();
        self
    }

    /// Name the module is deployed under.
    pub fn alias_or_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

struct RegistryEntry {
    definition: Arc<ModuleDefinition>,
    /// Registered through an explicit deploy; removed again by explicit undeploy.
    explicit: bool,
}

#[derive(Default)]
pub struct LocalModuleRegistry {
    modules: DashMap<String, RegistryEntry>,
    aliases: DashMap<String, String>,
    resources: DashMap<String, Arc<[u8]>>,
}

impl LocalModuleRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Adds a module that ships with the node.
    pub fn register(&self, definition: ModuleDefinition) -> Arc<ModuleDefinition> {
        self.insert(definition, false)
    }

    /// Adds a module through an explicit deploy.
    pub fn register_explicit(&self, definition: ModuleDefinition) -> Arc<ModuleDefinition> {
        self.insert(definition, true)
    }

    fn insert(&self, definition: ModuleDefinition, explicit: bool) -> Arc<ModuleDefinition> {
        let definition = Arc::new(definition);

        if let Some(alias) = &definition.alias {
            self.aliases.insert(alias.clone(), definition.name.clone());
        }
        self.modules.insert(
            definition.name.clone(),
            RegistryEntry {
                definition: definition.clone(),
                explicit,
            },
        );

        tracing::debug!(
            "Registered module {} (alias: {:?}, version: {})",
            definition.name,
            definition.alias,
            definition.user_version
        );
        definition
    }

    /// Removes an explicitly deployed module; built-in modules stay.
    pub fn unregister_explicit(&self, name_or_alias: &str) -> Option<Arc<ModuleDefinition>> {
        let name = self.canonical_name(name_or_alias);
        let (_, entry) = self.modules.remove_if(&name, |_, entry| entry.explicit)?;

        if let Some(alias) = &entry.definition.alias {
            self.aliases.remove_if(alias, |_, target| *target == name);
        }
        Some(entry.definition)
    }

    fn canonical_name(&self, name_or_alias: &str) -> String {
        if self.modules.contains_key(name_or_alias) {
            return name_or_alias.to_string();
        }
        self.aliases
            .get(name_or_alias)
            .map(|entry| entry.value().clone())
            .unwrap_or_else(|| name_or_alias.to_string())
    }

    /// Finds a module by name, falling back to its alias.
    pub fn lookup(&self, name_or_alias: &str) -> Option<Arc<ModuleDefinition>> {
        let name = self.canonical_name(name_or_alias);
        self.modules.get(&name).map(|entry| entry.definition.clone())
    }

    pub fn add_resource(&self, path: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.resources.insert(path.into(), Arc::from(bytes.into()));
    }

    /// Resolves a resource path: plain resources first, then module code.
    pub fn resource(&self, path: &str) -> Option<Arc<[u8]>> {
        if let Some(bytes) = self.resources.get(path) {
            return Some(bytes.value().clone());
        }
        let module = module_name_from_resource(path)?;
        self.modules
            .get(&module)
            .map(|entry| entry.definition.code.clone())
    }

    pub fn has_module(&self, name_or_alias: &str) -> bool {
        self.lookup(name_or_alias).is_some()
    }

    pub fn list_modules(&self) -> Vec<String> {
        let mut names: Vec<String> = self.modules.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    pub fn module_count(&self) -> usize {
        self.modules.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployment::types::module_resource_name;

    #[test]
    fn test_lookup_by_name_and_alias() {
        let registry = LocalModuleRegistry::new();
        registry.register(ModuleDefinition::new("app.WordCount", b"wc".to_vec()).with_alias("wc"));

        assert_eq!(registry.lookup("app.WordCount").unwrap().name, "app.WordCount");
        assert_eq!(registry.lookup("wc").unwrap().name, "app.WordCount");
        assert!(registry.lookup("missing").is_none());
        assert_eq!(registry.module_count(), 1);
    }

    #[test]
    fn test_resource_serves_module_code_and_plain_resources() {
        let registry = LocalModuleRegistry::new();
        registry.register(ModuleDefinition::new("app.Job", b"job-code".to_vec()));
        registry.add_resource("conf/job.json", b"{}".to_vec());

        let code = registry.resource(&module_resource_name("app.Job")).unwrap();
        assert_eq!(&*code, b"job-code");
        assert_eq!(&*registry.resource("conf/job.json").unwrap(), b"{}");
        assert!(registry.resource("app/Other.module").is_none());
    }

    #[test]
    fn test_unregister_only_removes_explicit_modules() {
        let registry = LocalModuleRegistry::new();
        registry.register(ModuleDefinition::new("builtin.Core", b"core".to_vec()));
        registry.register_explicit(ModuleDefinition::new("app.Job", b"job".to_vec()).with_alias("job"));

        assert!(registry.unregister_explicit("builtin.Core").is_none());
        assert!(registry.unregister_explicit("job").is_some());

        assert!(registry.has_module("builtin.Core"));
        assert!(!registry.has_module("app.Job"));
        assert!(!registry.has_module("job"));
    }

    #[test]
    fn test_reregister_replaces_code() {
        let registry = LocalModuleRegistry::new();
        registry.register_explicit(ModuleDefinition::new("app.Job", b"v1".to_vec()));
        registry.register_explicit(ModuleDefinition::new("app.Job", b"v2".to_vec()));

        assert_eq!(&*registry.lookup("app.Job").unwrap().code, b"v2");
        assert_eq!(registry.list_modules(), vec!["app.Job".to_string()]);
    }
}

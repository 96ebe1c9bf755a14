use crate::membership::types::NodeId;

use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// User version assumed when the code does not declare one.
pub const DEFAULT_USER_VERSION: &str = "0";

/// Suffix of the resource path under which a module's code is served.
pub const MODULE_RESOURCE_SUFFIX: &str = ".module";

/// How remotely deployed code is shared between units of work.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DeploymentMode {
    /// Exclusive context per (origin node, loader); same as `Isolated` on the
    /// receiving side.
    Private,
    /// Exclusive context per (origin node, loader).
    Isolated,
    /// One context per user version, dropped once no participant is left.
    Shared,
    /// Like `Shared`, but the context outlives its participants.
    Continuous,
}

impl DeploymentMode {
    pub fn is_per_version(self) -> bool {
        matches!(self, DeploymentMode::Shared | DeploymentMode::Continuous)
    }
}

/// Identity of a resolution context. Doubles as the "loader id" a node advertises
/// so peers can fetch code from that context.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub uuid::Uuid);

impl ContextId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque resolved code. Two handles denote the same module identity iff they are
/// the same allocation (`Arc::ptr_eq`); `fingerprint` compares code content.
#[derive(Debug)]
pub struct ResolvedModule {
    pub name: String,
    pub code: Arc<[u8]>,
    pub fingerprint: u64,
}

impl ResolvedModule {
    pub fn new(name: impl Into<String>, code: Arc<[u8]>) -> Self {
        let fingerprint = fingerprint(&code);
        Self {
            name: name.into(),
            code,
            fingerprint,
        }
    }
}

pub fn fingerprint(code: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    code.hash(&mut hasher);
    hasher.finish()
}

/// A module resolved under a resolution context. Never mutated after creation.
#[derive(Debug, Clone)]
pub struct DeployedModule {
    pub module: Arc<ResolvedModule>,
    pub alias: String,
    pub mode: DeploymentMode,
    pub context_id: ContextId,
    pub sequence_number: u64,
    pub user_version: String,
    pub sender: Option<NodeId>,
    pub is_local: bool,
}

impl DeployedModule {
    pub fn name(&self) -> &str {
        &self.module.name
    }

    /// Lookups match either the alias or the underlying module name.
    pub fn matches(&self, name: &str) -> bool {
        self.alias == name || self.module.name == name
    }
}

/// What a node sends along with a task so the receiver can find or fetch its code.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeploymentMetadata {
    pub user_version: String,
    pub module_name: String,
    pub alias: String,
    pub sender: NodeId,
    pub loader_id: ContextId,
    pub sequence_number: u64,
    pub mode: DeploymentMode,
}

/// A (loader id, sequence number) registration of one node against a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Participant {
    pub loader_id: ContextId,
    pub sequence_number: u64,
}

/// `a.b.Foo` -> `a/b/Foo.module`.
pub fn module_resource_name(module_name: &str) -> String {
    format!("{}{}", module_name.replace('.', "/"), MODULE_RESOURCE_SUFFIX)
}

/// Inverse of [`module_resource_name`]; `None` for non-module resources.
pub fn module_name_from_resource(resource: &str) -> Option<String> {
    resource
        .strip_suffix(MODULE_RESOURCE_SUFFIX)
        .filter(|stem| !stem.is_empty())
        .map(|stem| stem.replace('/', "."))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_name_mapping() {
        assert_eq!(module_resource_name("app.jobs.WordCount"), "app/jobs/WordCount.module");
        assert_eq!(
            module_name_from_resource("app/jobs/WordCount.module").as_deref(),
            Some("app.jobs.WordCount")
        );
        assert_eq!(module_name_from_resource("conf/settings.json"), None);
        assert_eq!(module_name_from_resource(".module"), None);
    }

    #[test]
    fn test_mode_grouping() {
        assert!(DeploymentMode::Shared.is_per_version());
        assert!(DeploymentMode::Continuous.is_per_version());
        assert!(!DeploymentMode::Private.is_per_version());
        assert!(!DeploymentMode::Isolated.is_per_version());
    }

    #[test]
    fn test_deployed_module_matches_alias_or_name() {
        let module = DeployedModule {
            module: Arc::new(ResolvedModule::new("app.WordCount", Arc::from(&b"code"[..]))),
            alias: "word-count".to_string(),
            mode: DeploymentMode::Shared,
            context_id: ContextId::new(),
            sequence_number: 1,
            user_version: DEFAULT_USER_VERSION.to_string(),
            sender: None,
            is_local: true,
        };

        assert!(module.matches("word-count"));
        assert!(module.matches("app.WordCount"));
        assert!(!module.matches("other"));
    }

    #[test]
    fn test_fingerprint_tracks_content() {
        let a = ResolvedModule::new("m", Arc::from(&b"v1"[..]));
        let b = ResolvedModule::new("m", Arc::from(&b"v1"[..]));
        let c = ResolvedModule::new("m", Arc::from(&b"v2"[..]));

        assert_eq!(a.fingerprint, b.fingerprint);
        assert_ne!(a.fingerprint, c.fingerprint);
    }
}

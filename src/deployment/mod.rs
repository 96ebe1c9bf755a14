//! Peer-to-Peer Code Deployment
//!
//! Lets a node run code that was deployed on another node. Tasks travel with
//! [`DeploymentMetadata`](types::DeploymentMetadata); the receiving node resolves
//! the named module inside a resolution context, fetching code from the origin
//! (and from other participants) on demand.
//!
//! ## Lifecycle
//! 1. **Deploy**: code is registered locally and gets a context whose id peers use
//!    as the loader id.
//! 2. **Acquire**: a node executing a peer's task finds or creates the matching
//!    context and counts a usage.
//! 3. **Release**: the usage is given back. Undeployed contexts disappear with
//!    their last release.
//! 4. **Redeploy / undeploy**: newer sequence numbers supersede older contexts after
//!    a grace window; explicit undeploys are broadcast to every node.
//!
//! ## Submodules
//! - **`manager`**: routing, peer request handling, membership reactions.
//! - **`local_store`**, **`per_loader_store`**, **`per_version_store`**: context
//!   bookkeeping per deployment mode.
//! - **`context`**: resolution contexts and their lifecycle state.
//! - **`loader`**: fetches code from participating peers.
//! - **`comm`** and **`protocol`**: request/response messaging over the transport.

pub mod cache;
pub mod comm;
pub mod context;
pub mod events;
pub mod loader;
pub mod local_store;
pub mod manager;
pub mod per_loader_store;
pub mod per_version_store;
pub mod protocol;
pub mod registry;
pub mod types;

pub use manager::{DeploymentManager, DeploymentStats};
pub use registry::{LocalModuleRegistry, ModuleDefinition};
pub use types::{DeployedModule, DeploymentMetadata, DeploymentMode};

//! Peer-to-Peer Code Deployment Library
//!
//! Nodes of a cluster execute each other's code without a shared artifact store.
//! Code deployed on one node is fetched on demand by every node that runs a task
//! referring to it, cached in resolution contexts, and dropped again when the origin
//! redeploys, undeploys, or leaves the cluster.
//!
//! ## Architecture Modules
//! - **`deployment`**: the core. Resolution contexts, the three per-mode stores, the
//!   peer loader and the fetch protocol, tied together by `DeploymentManager`.
//! - **`membership`**: which nodes are alive. A UDP gossip service (SWIM-like) for real
//!   clusters and a static view for single-process ones.
//! - **`transport`**: topic-based point-to-point and broadcast messaging, over HTTP or
//!   an in-process network.
//! - **`timeout`**: one-shot cancellable timers for redeploy grace periods.
//! - **`config`** and **`error`**: tunables and the error types shared by all of the above.

pub mod config;
pub mod deployment;
pub mod error;
pub mod membership;
pub mod timeout;
pub mod transport;

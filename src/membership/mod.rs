//! Membership & Discovery Module
//!
//! Tells the deployment core which nodes exist and when they come and go.
//!
//! ## Core Mechanisms
//! - **`Membership` trait**: the read-side view consumed by stores, peer loaders and
//!   the communication layer (`is_alive`, `alive_nodes`, `subscribe`).
//! - **Gossip Protocol**: `MembershipService` exchanges status updates via UDP and
//!   detects failures with a "Suspect" -> "Dead" transition model.
//! - **Static view**: `StaticMembership` is driven by explicit join/leave/fail calls,
//!   used for single-process clusters.

pub mod service;
pub mod types;
pub mod view;

pub use types::{MembershipEvent, NodeId};
pub use view::{Membership, StaticMembership};

#[cfg(test)]
mod tests;

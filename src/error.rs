//! Error types produced by the deployment subsystem.
//!
//! - [`DeployError`] is returned by every acquire/deploy/fetch operation.
//! - [`FetchError`] is the outcome of a single peer round trip; the peer loader
//!   reacts differently to a definitive "not found" than to an unreachable peer.
//!
//! Both carry `as_label` for log fields.

use crate::deployment::types::{ContextId, DeploymentMode};
use crate::membership::types::NodeId;

use std::time::Duration;
use thiserror::Error;

#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeployError {
    /// Module or resource is absent locally and on every reachable peer.
    #[error("module or resource not found: {name}")]
    NotFound { name: String },

    /// Request refers to code that a newer deployment from the same node superseded,
    /// and the grace window for serving it has elapsed.
    #[error("stale request from {sender:?} (seq={sequence}): superseded by seq={newer}")]
    StaleRequest {
        sender: NodeId,
        sequence: u64,
        newer: u64,
    },

    /// Nodes disagree about the deployment mode of the same user version.
    #[error("deployment mode conflict for '{name}': deployed as {existing:?}, requested {requested:?}")]
    ModeConflict {
        name: String,
        existing: DeploymentMode,
        requested: DeploymentMode,
    },

    /// Same sender and sequence number announced under two different loader ids.
    #[error("consistency violation: {0}")]
    ConsistencyViolation(String),

    /// Loader was named in an earlier undeploy notice.
    #[error("loader {0:?} was undeployed")]
    DeadLoader(ContextId),

    /// Peer could not be reached, timed out, or left mid-request.
    #[error("peer {node:?} unreachable: {reason}")]
    PeerUnreachable { node: NodeId, reason: String },

    /// Internal bookkeeping invariant broken (negative usage, missing context).
    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("codec error: {0}")]
    Codec(String),
}

impl DeployError {
    /// Short stable label (snake_case) for log fields.
    pub fn as_label(&self) -> &'static str {
        match self {
            DeployError::NotFound { .. } => "deploy_not_found",
            DeployError::StaleRequest { .. } => "deploy_stale_request",
            DeployError::ModeConflict { .. } => "deploy_mode_conflict",
            DeployError::ConsistencyViolation(_) => "deploy_consistency_violation",
            DeployError::DeadLoader(_) => "deploy_dead_loader",
            DeployError::PeerUnreachable { .. } => "deploy_peer_unreachable",
            DeployError::Invariant(_) => "deploy_invariant",
            DeployError::Transport(_) => "deploy_transport",
            DeployError::Codec(_) => "deploy_codec",
        }
    }

    pub fn not_found(name: impl Into<String>) -> Self {
        DeployError::NotFound { name: name.into() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DeployError::NotFound { .. })
    }
}

impl From<bincode::Error> for DeployError {
    fn from(e: bincode::Error) -> Self {
        DeployError::Codec(e.to_string())
    }
}

/// Outcome of one fetch round trip that did not return bytes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// The peer answered and does not have the resource.
    #[error("peer reported missing resource: {0}")]
    NotFound(String),

    /// No answer before the deadline.
    #[error("no response within {0:?}")]
    Timeout(Duration),

    /// Destination left or failed while the request was outstanding.
    #[error("node {0:?} left the cluster")]
    Departed(NodeId),

    /// Message could not be handed to the transport.
    #[error("send failed: {0}")]
    Send(String),
}

impl FetchError {
    pub fn as_label(&self) -> &'static str {
        match self {
            FetchError::NotFound(_) => "fetch_not_found",
            FetchError::Timeout(_) => "fetch_timeout",
            FetchError::Departed(_) => "fetch_departed",
            FetchError::Send(_) => "fetch_send_failed",
        }
    }

    /// A definitive answer; every other variant means "try someone else".
    pub fn is_definitive(&self) -> bool {
        matches!(self, FetchError::NotFound(_))
    }
}

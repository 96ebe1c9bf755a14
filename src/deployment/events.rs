//! Deployment events for the external event log.
//!
//! Every record is logged through `tracing` and published on a broadcast channel.
//! Publishing never blocks; events are dropped when nobody subscribes, and slow
//! receivers observe `RecvError::Lagged`.

use super::types::{ContextId, DeploymentMode};
use crate::membership::types::NodeId;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use tokio::sync::broadcast;

pub const DEPLOYMENT_EVENT_CAPACITY: usize = 1024;

static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentEventKind {
    Deployed,
    DeploymentFailed,
    Undeployed,
}

#[derive(Debug, Clone)]
pub struct DeploymentEvent {
    pub seq: u64,
    pub at: SystemTime,
    pub kind: DeploymentEventKind,
    pub alias: String,
    pub user_version: String,
    pub mode: DeploymentMode,
    pub context_id: ContextId,
    /// Originating node; `None` for code deployed from this node.
    pub origin: Option<NodeId>,
    pub reason: Option<String>,
}

impl DeploymentEvent {
    pub fn new(
        kind: DeploymentEventKind,
        alias: impl Into<String>,
        user_version: impl Into<String>,
        mode: DeploymentMode,
        context_id: ContextId,
    ) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, Ordering::Relaxed),
            at: SystemTime::now(),
            kind,
            alias: alias.into(),
            user_version: user_version.into(),
            mode,
            context_id,
            origin: None,
            reason: None,
        }
    }

    pub fn with_origin(mut self, origin: Option<NodeId>) -> Self {
        self.origin = origin;
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

#[derive(Clone, Debug)]
pub struct DeploymentEvents {
    tx: broadcast::Sender<DeploymentEvent>,
}

impl Default for DeploymentEvents {
    fn default() -> Self {
        Self::new(DEPLOYMENT_EVENT_CAPACITY)
    }
}

impl DeploymentEvents {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn record(&self, event: DeploymentEvent) {
        let origin = event
            .origin
            .as_ref()
            .map(|node| node.to_string())
            .unwrap_or_else(|| "local".to_string());

        match event.kind {
            DeploymentEventKind::Deployed => tracing::info!(
                "Module deployed: {} (version={}, mode={:?}, origin={}, context={})",
                event.alias,
                event.user_version,
                event.mode,
                origin,
                event.context_id
            ),
            DeploymentEventKind::DeploymentFailed => tracing::warn!(
                "Module deployment failed: {} (version={}, origin={}): {}",
                event.alias,
                event.user_version,
                origin,
                event.reason.as_deref().unwrap_or("unknown")
            ),
            DeploymentEventKind::Undeployed => tracing::info!(
                "Module undeployed: {} (version={}, origin={}, context={})",
                event.alias,
                event.user_version,
                origin,
                event.context_id
            ),
        }

        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeploymentEvent> {
        self.tx.subscribe()
    }
}

//! Peer Transport
//!
//! Point-to-point and broadcast messaging with per-topic listener registration.
//! The deployment core only talks to the [`PeerTransport`] trait.
//!
//! ## Implementations
//! - **`local`**: in-process hub connecting several nodes inside one runtime.
//! - **`http`**: bincode envelopes POSTed between nodes, received by an axum handler.

pub mod handlers;
pub mod http;
pub mod local;

use crate::membership::types::NodeId;

use anyhow::Result;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Boxed send future, so the trait stays object safe.
pub type TransportFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// Called with the sender's id and the raw payload of every message on a topic.
pub type MessageListener = Arc<dyn Fn(NodeId, Vec<u8>) + Send + Sync>;

pub trait PeerTransport: Send + Sync {
    fn local_node_id(&self) -> NodeId;

    fn send<'a>(&'a self, to: &'a NodeId, topic: &'a str, payload: Vec<u8>) -> TransportFuture<'a>;

    /// Sends to every known node except the local one.
    fn broadcast<'a>(&'a self, topic: &'a str, payload: Vec<u8>) -> TransportFuture<'a>;

    /// Replaces any listener already registered for `topic`.
    fn add_listener(&self, topic: &str, listener: MessageListener);

    fn remove_listener(&self, topic: &str) -> bool;
}

#[cfg(test)]
mod tests;

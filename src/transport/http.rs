//! HTTP transport.
//!
//! Messages travel as bincode-encoded [`Envelope`]s POSTed to
//! [`ENDPOINT_DEPLOY_MESSAGE`] on the destination's transport address, which the
//! membership view supplies. Incoming envelopes are dispatched to the listener
//! registered for their topic.

use super::handlers::handle_deploy_message;
use super::{MessageListener, PeerTransport, TransportFuture};
use crate::membership::service::MembershipService;
use crate::membership::types::NodeId;

use anyhow::Result;
use axum::{Extension, Router, routing::post};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

pub const ENDPOINT_DEPLOY_MESSAGE: &str = "/internal/deploy/message";

const SEND_TIMEOUT: Duration = Duration::from_millis(1000);
const SEND_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub from: NodeId,
    pub topic: String,
    pub payload: Vec<u8>,
}

pub struct HttpTransport {
    membership: Arc<MembershipService>,
    listeners: DashMap<String, MessageListener>,
    http_client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(membership: Arc<MembershipService>) -> Arc<Self> {
        Arc::new(Self {
            membership,
            listeners: DashMap::new(),
            http_client: reqwest::Client::new(),
        })
    }

    /// Routes this transport serves; merge into the node's axum router.
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route(ENDPOINT_DEPLOY_MESSAGE, post(handle_deploy_message))
            .layer(Extension(self.clone()))
    }

    /// Hands an incoming envelope to its topic listener. Returns false when nobody
    /// listens on the topic.
    pub fn dispatch(&self, envelope: Envelope) -> bool {
        let Some(listener) = self
            .listeners
            .get(&envelope.topic)
            .map(|entry| entry.value().clone())
        else {
            tracing::debug!("No listener for topic '{}'", envelope.topic);
            return false;
        };

        tokio::spawn(async move {
            listener(envelope.from, envelope.payload);
        });
        true
    }

    async fn post_envelope(&self, to: &NodeId, envelope: &Envelope) -> Result<()> {
        let node = self
            .membership
            .get_member(to)
            .ok_or_else(|| anyhow::anyhow!("Target node not found: {}", to))?;

        let body = bincode::serialize(envelope)?;
        let url = format!("http://{}{}", node.transport_addr, ENDPOINT_DEPLOY_MESSAGE);

        let response = self.post_with_retry(url, body, SEND_TIMEOUT, SEND_ATTEMPTS).await?;
        if !response.status().is_success() {
            return Err(anyhow::anyhow!(
                "Deploy message to {} rejected: {}",
                to,
                response.status()
            ));
        }

        Ok(())
    }

    async fn post_with_retry(
        &self,
        url: String,
        body: Vec<u8>,
        timeout: Duration,
        attempts: usize,
    ) -> Result<reqwest::Response> {
        let mut delay_ms = 150u64;

        for attempt in 0..attempts {
            let response = self
                .http_client
                .post(url.clone())
                .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                .body(body.clone())
                .timeout(timeout)
                .send()
                .await;

            match response {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    if attempt + 1 == attempts {
                        return Err(anyhow::anyhow!(e));
                    }
                    let jitter = rand::random::<u64>() % 50;
                    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                    delay_ms = (delay_ms * 2).min(1200);
                }
            }
        }

        Err(anyhow::anyhow!("Retry attempts exhausted"))
    }
}

impl PeerTransport for HttpTransport {
    fn local_node_id(&self) -> NodeId {
        self.membership.local_node.id.clone()
    }

    fn send<'a>(&'a self, to: &'a NodeId, topic: &'a str, payload: Vec<u8>) -> TransportFuture<'a> {
        Box::pin(async move {
            let envelope = Envelope {
                from: self.local_node_id(),
                topic: topic.to_string(),
                payload,
            };
            self.post_envelope(to, &envelope).await
        })
    }

    fn broadcast<'a>(&'a self, topic: &'a str, payload: Vec<u8>) -> TransportFuture<'a> {
        Box::pin(async move {
            let local = self.local_node_id();
            let envelope = Envelope {
                from: local.clone(),
                topic: topic.to_string(),
                payload,
            };

            for node in self.membership.get_alive_members() {
                if node.id == local {
                    continue;
                }
                if let Err(e) = self.post_envelope(&node.id, &envelope).await {
                    tracing::warn!("Broadcast on '{}' to {} failed: {}", topic, node.id, e);
                }
            }
            Ok(())
        })
    }

    fn add_listener(&self, topic: &str, listener: MessageListener) {
        self.listeners.insert(topic.to_string(), listener);
    }

    fn remove_listener(&self, topic: &str) -> bool {
        self.listeners.remove(topic).is_some()
    }
}

//! Deployment Communication
//!
//! Request/response messaging for code fetches on top of [`PeerTransport`].
//!
//! ## Fetch flow
//! 1. A private response topic is registered together with a pending entry.
//! 2. The request goes out on [`TOPIC_MODULE_FETCH`].
//! 3. The caller waits for the response, the deadline, or the destination's
//!    departure, whichever comes first. The deadline starts before the send, so
//!    a slow or hung transport counts against it.
//!
//! The pending entry and its listener are dropped on every exit path, including
//! when the waiting future itself is dropped.

use super::protocol::{ModuleRequest, ModuleResponse, TOPIC_MODULE_FETCH, new_response_topic};
use super::types::ContextId;
use crate::error::{DeployError, FetchError};
use crate::membership::types::NodeId;
use crate::membership::view::Membership;
use crate::transport::PeerTransport;

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use tokio::sync::oneshot;

/// Answers requests arriving from other nodes.
pub trait DeploymentRequestHandler: Send + Sync {
    /// Bytes for `resource_name` as seen by the context `loader_id`, or by the
    /// local code path when no loader is named.
    fn serve_resource(&self, loader_id: Option<ContextId>, resource_name: &str) -> Result<Arc<[u8]>, DeployError>;

    /// `sender` undeployed the module known as `alias`.
    fn on_undeploy_notice(&self, sender: &NodeId, alias: &str);
}

enum FetchReply {
    Response(ModuleResponse),
    Departed,
}

struct PendingFetch {
    node: NodeId,
    reply: oneshot::Sender<FetchReply>,
}

type PendingMap = DashMap<String, PendingFetch>;

/// Removes the pending entry and response listener when the fetch ends.
struct PendingGuard<'a> {
    topic: String,
    pending: &'a PendingMap,
    transport: &'a dyn PeerTransport,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.topic);
        self.transport.remove_listener(&self.topic);
    }
}

pub struct DeploymentCommunication {
    transport: Arc<dyn PeerTransport>,
    membership: Arc<dyn Membership>,
    pending: Arc<PendingMap>,
    handler: RwLock<Option<Weak<dyn DeploymentRequestHandler>>>,
    requests_sent: AtomicU64,
    requests_served: AtomicU64,
}

impl DeploymentCommunication {
    pub fn new(transport: Arc<dyn PeerTransport>, membership: Arc<dyn Membership>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            membership,
            pending: Arc::new(DashMap::new()),
            handler: RwLock::new(None),
            requests_sent: AtomicU64::new(0),
            requests_served: AtomicU64::new(0),
        })
    }

    pub fn local_node_id(&self) -> NodeId {
        self.transport.local_node_id()
    }

    /// Starts answering requests on [`TOPIC_MODULE_FETCH`].
    pub fn start(self: &Arc<Self>, handler: Weak<dyn DeploymentRequestHandler>) {
        *self.handler.write().unwrap_or_else(|e| e.into_inner()) = Some(handler);

        let comm = Arc::downgrade(self);
        self.transport.add_listener(
            TOPIC_MODULE_FETCH,
            Arc::new(move |from, payload| {
                if let Some(comm) = comm.upgrade() {
                    comm.handle_request(from, payload);
                }
            }),
        );
        tracing::info!("Deployment communication started on {}", self.local_node_id());
    }

    /// Stops answering requests. Outstanding fetches fail as abandoned.
    pub fn stop(&self) {
        self.transport.remove_listener(TOPIC_MODULE_FETCH);
        *self.handler.write().unwrap_or_else(|e| e.into_inner()) = None;

        // Dropping the senders wakes every waiter.
        self.pending.clear();
        tracing::info!("Deployment communication stopped on {}", self.local_node_id());
    }

    fn handler(&self) -> Option<Arc<dyn DeploymentRequestHandler>> {
        self.handler
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .and_then(Weak::upgrade)
    }

    fn handle_request(self: Arc<Self>, from: NodeId, payload: Vec<u8>) {
        let request: ModuleRequest = match bincode::deserialize(&payload) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!("Dropping malformed module request from {}: {}", from, e);
                return;
            }
        };

        let Some(handler) = self.handler() else {
            tracing::debug!("No deployment handler, ignoring request from {}", from);
            return;
        };

        if request.is_undeploy {
            tracing::info!("Undeploy notice from {} for {}", from, request.resource_name);
            handler.on_undeploy_notice(&from, &request.resource_name);
            return;
        }

        let Some(topic) = request.response_topic else {
            tracing::warn!("Fetch request from {} without response topic", from);
            return;
        };

        let response = match handler.serve_resource(request.loader_id, &request.resource_name) {
            Ok(bytes) => ModuleResponse::found(bytes.to_vec()),
            Err(e) => {
                tracing::debug!("Cannot serve {} to {}: {}", request.resource_name, from, e);
                ModuleResponse::missing(e.to_string())
            }
        };
        self.requests_served.fetch_add(1, Ordering::Relaxed);

        tokio::spawn(async move {
            let bytes = match bincode::serialize(&response) {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::error!("Failed to encode module response: {}", e);
                    return;
                }
            };
            if let Err(e) = self.transport.send(&from, &topic, bytes).await {
                tracing::warn!("Failed to answer {} on {}: {}", from, topic, e);
            }
        });
    }

    /// One round trip to `node` for `resource_name`.
    pub async fn fetch_resource(
        &self,
        node: &NodeId,
        loader_id: Option<ContextId>,
        resource_name: &str,
        timeout: Duration,
    ) -> Result<Arc<[u8]>, FetchError> {
        let topic = new_response_topic();
        let (tx, rx) = oneshot::channel();

        self.pending.insert(
            topic.clone(),
            PendingFetch {
                node: node.clone(),
                reply: tx,
            },
        );
        let _guard = PendingGuard {
            topic: topic.clone(),
            pending: &self.pending,
            transport: self.transport.as_ref(),
        };

        let pending = self.pending.clone();
        let listener_topic = topic.clone();
        self.transport.add_listener(
            &topic,
            Arc::new(move |from, payload| match bincode::deserialize::<ModuleResponse>(&payload) {
                Ok(response) => {
                    if let Some((_, fetch)) = pending.remove(&listener_topic) {
                        if fetch.node != from {
                            tracing::warn!("Response on {} came from {}, expected {}", listener_topic, from, fetch.node);
                        }
                        let _ = fetch.reply.send(FetchReply::Response(response));
                    }
                }
                Err(e) => tracing::warn!("Dropping malformed module response from {}: {}", from, e),
            }),
        );

        // Checked after registration so a concurrent departure cannot be missed.
        if !self.membership.is_alive(node) {
            return Err(FetchError::Departed(node.clone()));
        }

        let request = ModuleRequest::fetch(loader_id, resource_name, topic.clone());
        let payload = bincode::serialize(&request).map_err(|e| FetchError::Send(e.to_string()))?;

        self.requests_sent.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Fetching {} from {} (loader: {:?})", resource_name, node, loader_id);

        // One deadline covers the send and the wait. A reply or departure that
        // lands while the send is still in flight ends the fetch right away.
        let round_trip = async {
            let mut rx = rx;
            tokio::select! {
                reply = &mut rx => return Ok::<_, FetchError>(reply),
                sent = self.transport.send(node, TOPIC_MODULE_FETCH, payload) => {
                    sent.map_err(|e| FetchError::Send(e.to_string()))?;
                }
            }
            Ok::<_, FetchError>(rx.await)
        };

        match tokio::time::timeout(timeout, round_trip).await {
            Err(_) => Err(FetchError::Timeout(timeout)),
            Ok(Err(e)) => Err(e),
            Ok(Ok(Err(_))) => Err(FetchError::Send("request abandoned".to_string())),
            Ok(Ok(Ok(FetchReply::Departed))) => Err(FetchError::Departed(node.clone())),
            Ok(Ok(Ok(FetchReply::Response(response)))) => match (response.success, response.bytes) {
                (true, Some(bytes)) => Ok(Arc::from(bytes)),
                (_, _) => Err(FetchError::NotFound(
                    response
                        .error_message
                        .unwrap_or_else(|| format!("{} not found", resource_name)),
                )),
            },
        }
    }

    /// Tells every other node that `alias` was undeployed here.
    pub async fn send_undeploy_request(&self, alias: &str) -> Result<(), DeployError> {
        let payload = bincode::serialize(&ModuleRequest::undeploy(alias))?;
        self.transport
            .broadcast(TOPIC_MODULE_FETCH, payload)
            .await
            .map_err(|e| DeployError::Transport(e.to_string()))?;

        tracing::info!("Broadcast undeploy notice for {}", alias);
        Ok(())
    }

    /// Fails every outstanding fetch addressed to `node`. Returns how many.
    pub fn on_node_left(&self, node: &NodeId) -> usize {
        let topics: Vec<String> = self
            .pending
            .iter()
            .filter(|entry| entry.value().node == *node)
            .map(|entry| entry.key().clone())
            .collect();

        let mut abandoned = 0;
        for topic in topics {
            if let Some((_, fetch)) = self.pending.remove(&topic) {
                let _ = fetch.reply.send(FetchReply::Departed);
                abandoned += 1;
            }
        }

        if abandoned > 0 {
            tracing::info!("Abandoned {} pending fetch(es) to departed node {}", abandoned, node);
        }
        abandoned
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    pub fn requests_sent(&self) -> u64 {
        self.requests_sent.load(Ordering::Relaxed)
    }

    pub fn requests_served(&self) -> u64 {
        self.requests_served.load(Ordering::Relaxed)
    }
}

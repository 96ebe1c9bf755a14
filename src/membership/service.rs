use anyhow::Result;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use std::{net::SocketAddr, time::Duration};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::info;

use super::types::{GossipMessage, MembershipEvent, Node, NodeId, NodeState};
use super::view::{EVENT_CHANNEL_CAPACITY, Membership};

const GOSSIP_INTERVAL: Duration = Duration::from_millis(500);
const FAILURE_DETECTION_INTERVAL: Duration = Duration::from_secs(2);
const SUSPECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEAD_TIMEOUT: Duration = Duration::from_secs(10);

/// SWIM-like gossip membership over UDP.
///
/// Besides keeping the member table, the service turns state transitions into
/// [`MembershipEvent`]s: discovery publishes `Joined`, a suspect declared dead
/// publishes `Failed`, and a `Leave` announcement publishes `Left`.
pub struct MembershipService {
    pub local_node: Node,
    pub members: Arc<DashMap<NodeId, Node>>,
    socket: Arc<UdpSocket>,
    incarnation: AtomicU64,
    events: broadcast::Sender<MembershipEvent>,
}

impl MembershipService {
    pub async fn new(
        bind_addr: SocketAddr,
        transport_addr: SocketAddr,
        seed_nodes: Vec<SocketAddr>,
    ) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(bind_addr).await?;
        let gossip_addr = socket.local_addr()?;
        let local_node = Node {
            id: NodeId::new(),
            gossip_addr,
            transport_addr,
            state: NodeState::Alive,
            incarnation: 1,
            last_seen: Some(Instant::now()),
        };
        let members = Arc::new(DashMap::new());
        members.insert(local_node.id.clone(), local_node.clone());

        if !seed_nodes.is_empty() {
            info!("Joining cluster via {} seed node(s)", seed_nodes.len());

            let encoded = bincode::serialize(&GossipMessage::Join {
                node: local_node.clone(),
            })?;
            for seed_node in seed_nodes.iter() {
                socket.send_to(&encoded, seed_node).await?;
                info!("Sent join request to {}", seed_node);
            }
        }

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Arc::new(Self {
            local_node,
            members,
            socket: Arc::new(socket),
            incarnation: AtomicU64::new(1),
            events,
        }))
    }

    pub async fn start(self: Arc<Self>) {
        tracing::info!("Starting membership service...");

        {
            let service = self.clone();
            tokio::spawn(async move {
                service.gossip_loop().await;
            });
        }
        {
            let service = self.clone();
            tokio::spawn(async move {
                service.receive_loop().await;
            });
        }
        {
            let service = self.clone();
            tokio::spawn(async move {
                service.failure_detection_loop().await;
            });
        }

        tracing::info!("All background tasks started");
    }

    /// Announces a graceful departure to every alive member.
    pub async fn leave(&self) {
        info!("Leaving cluster as {}", self.local_node.id);
        self.broadcast_message(GossipMessage::Leave {
            node_id: self.local_node.id.clone(),
        })
        .await;
    }

    pub fn get_member(&self, node_id: &NodeId) -> Option<Node> {
        self.members.get(node_id).map(|entry| entry.value().clone())
    }

    pub fn get_alive_members(&self) -> Vec<Node> {
        self.members
            .iter()
            .filter(|entry| entry.value().state == NodeState::Alive)
            .map(|entry| entry.value().clone())
            .collect()
    }

    fn publish(&self, event: MembershipEvent) {
        // No subscribers is fine; deployment components subscribe on start.
        let _ = self.events.send(event);
    }

    async fn gossip_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(GOSSIP_INTERVAL);

        loop {
            interval.tick().await;

            let alive_members: Vec<Node> = self
                .members
                .iter()
                .filter(|entry| {
                    entry.value().id != self.local_node.id
                        && entry.value().state == NodeState::Alive
                })
                .map(|entry| entry.value().clone())
                .collect();

            if alive_members.is_empty() {
                continue;
            }

            let target = {
                use rand::Rng;
                let idx = rand::thread_rng().gen_range(0..alive_members.len());
                &alive_members[idx]
            };

            let msg = GossipMessage::Ping {
                from: self.local_node.id.clone(),
                incarnation: self.incarnation.load(Ordering::SeqCst),
            };

            match bincode::serialize(&msg) {
                Ok(encoded) => {
                    if let Err(e) = self.socket.send_to(&encoded, target.gossip_addr).await {
                        tracing::warn!("Failed to send ping to {}: {}", target.id, e);
                    } else {
                        tracing::trace!("Sent ping to {}", target.id);
                    }
                }
                Err(e) => tracing::error!("Failed to serialize ping: {}", e),
            }
        }
    }

    async fn receive_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; 65536];

        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((len, src)) => match bincode::deserialize::<GossipMessage>(&buf[..len]) {
                    Ok(msg) => {
                        if let Err(e) = self.handle_message(msg, src).await {
                            tracing::error!("Error handling gossip from {}: {}", src, e);
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Failed to deserialize gossip from {}: {}", src, e);
                    }
                },
                Err(e) => {
                    tracing::error!("Failed to receive UDP packet: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn handle_message(&self, msg: GossipMessage, src: SocketAddr) -> Result<()> {
        match msg {
            GossipMessage::Ping { from, incarnation } => {
                self.handle_ping(from, incarnation, src).await?
            }
            GossipMessage::Ack {
                from,
                incarnation,
                members,
            } => self.handle_ack(from, incarnation, members),
            GossipMessage::Join { node } => self.handle_join(node),
            GossipMessage::Suspect {
                node_id,
                incarnation,
            } => self.handle_suspect(node_id, incarnation).await,
            GossipMessage::Alive {
                node_id,
                incarnation,
            } => self.handle_alive(node_id, incarnation),
            GossipMessage::Leave { node_id } => self.handle_leave(node_id),
        }

        Ok(())
    }

    async fn handle_ping(&self, from: NodeId, from_incarnation: u64, src: SocketAddr) -> Result<()> {
        tracing::trace!("Received ping from {}", from);

        if let Some(mut member) = self.members.get_mut(&from) {
            member.last_seen = Some(Instant::now());
            if from_incarnation > member.incarnation {
                member.incarnation = from_incarnation;
            }
        } else {
            // Pings carry no transport address; the member is fully known once an
            // Ack or Join delivers its Node record.
            tracing::debug!("Ping from unknown member {} at {}", from, src);
        }

        let reply = GossipMessage::Ack {
            from: self.local_node.id.clone(),
            incarnation: self.incarnation.load(Ordering::SeqCst),
            members: self.members.iter().map(|entry| entry.value().clone()).collect(),
        };

        let encoded = bincode::serialize(&reply)?;
        self.socket.send_to(&encoded, src).await?;

        Ok(())
    }

    fn handle_ack(&self, from: NodeId, from_incarnation: u64, members: Vec<Node>) {
        tracing::trace!(
            "Received ack from {} (inc={}) with {} members",
            from,
            from_incarnation,
            members.len()
        );

        if let Some(mut member) = self.members.get_mut(&from) {
            member.last_seen = Some(Instant::now());
            if from_incarnation > member.incarnation {
                member.incarnation = from_incarnation;
            }
        }

        for member in members {
            self.merge_member(member);
        }
    }

    fn merge_member(&self, new_member: Node) {
        let mut joined = None;

        match self.members.get_mut(&new_member.id) {
            Some(mut existing) => {
                if existing.state == NodeState::Dead || existing.state == NodeState::Left {
                    // Departed members only come back through a fresh Join.
                    return;
                }
                if new_member.incarnation > existing.incarnation {
                    existing.state = new_member.state;
                    existing.incarnation = new_member.incarnation;
                    existing.last_seen = Some(Instant::now());
                } else if new_member.incarnation == existing.incarnation
                    && new_member.state == NodeState::Alive
                    && existing.state == NodeState::Suspect
                {
                    tracing::info!("{} refuted suspicion", new_member.id);
                    existing.state = NodeState::Alive;
                    existing.last_seen = Some(Instant::now());
                }
            }
            None => {
                if new_member.state == NodeState::Dead || new_member.state == NodeState::Left {
                    return;
                }
                tracing::info!(
                    "Discovered new member: {} at {}",
                    new_member.id,
                    new_member.gossip_addr
                );

                let mut member = new_member;
                member.last_seen = Some(Instant::now());
                joined = Some(member.id.clone());
                self.members.insert(member.id.clone(), member);
            }
        }

        if let Some(id) = joined {
            self.publish(MembershipEvent::Joined(id));
        }
    }

    async fn handle_suspect(&self, node_id: NodeId, incarnation: u64) {
        if node_id == self.local_node.id {
            // Refute by bumping our incarnation past the accusation.
            let next = self.incarnation.fetch_max(incarnation + 1, Ordering::SeqCst).max(incarnation + 1);
            info!("Refuting suspicion with incarnation {}", next);
            if let Some(mut me) = self.members.get_mut(&node_id) {
                me.incarnation = next;
            }
            self.broadcast_message(GossipMessage::Alive {
                node_id,
                incarnation: next,
            })
            .await;
            return;
        }

        match self.members.get_mut(&node_id) {
            Some(mut existing) if incarnation >= existing.incarnation => {
                if existing.state == NodeState::Alive {
                    tracing::info!("Node {} suspected", existing.id);
                    existing.state = NodeState::Suspect;
                    existing.incarnation = incarnation;
                    existing.last_seen = Some(Instant::now());
                }
            }
            Some(_) => {}
            None => tracing::debug!("Suspected node {} doesn't exist", node_id),
        }
    }

    fn handle_alive(&self, node_id: NodeId, incarnation: u64) {
        match self.members.get_mut(&node_id) {
            Some(mut existing) => {
                let refutes = incarnation > existing.incarnation
                    || (incarnation == existing.incarnation && existing.state == NodeState::Suspect);
                if refutes && existing.state != NodeState::Dead && existing.state != NodeState::Left {
                    tracing::info!("Node {} is Alive (inc={})", existing.id, incarnation);
                    existing.state = NodeState::Alive;
                    existing.incarnation = incarnation;
                    existing.last_seen = Some(Instant::now());
                }
            }
            None => tracing::debug!("Alive message for unknown node {}", node_id),
        }
    }

    fn handle_join(&self, mut node: Node) {
        tracing::info!("Node {} joining cluster at {}", node.id, node.gossip_addr);

        node.state = NodeState::Alive;
        node.last_seen = Some(Instant::now());
        let id = node.id.clone();
        self.members.insert(id.clone(), node);

        tracing::info!("Cluster size now: {}", self.members.len());
        self.publish(MembershipEvent::Joined(id));
    }

    fn handle_leave(&self, node_id: NodeId) {
        let departed = match self.members.get_mut(&node_id) {
            Some(mut member) if member.state != NodeState::Left => {
                member.state = NodeState::Left;
                true
            }
            _ => false,
        };

        if departed {
            tracing::info!("Node {} left the cluster", node_id);
            self.publish(MembershipEvent::Left(node_id));
        }
    }

    async fn failure_detection_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(FAILURE_DETECTION_INTERVAL);

        loop {
            interval.tick().await;
            let now = Instant::now();

            let mut suspects = Vec::new();
            let mut failed = Vec::new();

            for mut entry in self.members.iter_mut() {
                let member = entry.value_mut();

                if member.id == self.local_node.id {
                    continue;
                }

                let Some(last_seen) = member.last_seen else {
                    member.last_seen = Some(now);
                    continue;
                };
                let elapsed = now.duration_since(last_seen);

                match member.state {
                    NodeState::Alive if elapsed > SUSPECT_TIMEOUT => {
                        tracing::warn!("Node {} suspected (no contact for {:?})", member.id, elapsed);
                        member.state = NodeState::Suspect;
                        suspects.push(GossipMessage::Suspect {
                            node_id: member.id.clone(),
                            incarnation: member.incarnation,
                        });
                    }
                    NodeState::Suspect if elapsed > DEAD_TIMEOUT => {
                        tracing::warn!("Node {} declared DEAD (no contact for {:?})", member.id, elapsed);
                        member.state = NodeState::Dead;
                        failed.push(member.id.clone());
                    }
                    _ => {}
                }
            }

            for id in failed {
                self.publish(MembershipEvent::Failed(id));
            }
            for msg in suspects {
                self.broadcast_message(msg).await;
            }
        }
    }

    async fn broadcast_message(&self, msg: GossipMessage) {
        let encoded = match bincode::serialize(&msg) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::error!("Failed to serialize gossip broadcast: {}", e);
                return;
            }
        };

        let targets: Vec<Node> = self
            .members
            .iter()
            .filter(|entry| {
                entry.value().id != self.local_node.id && entry.value().state == NodeState::Alive
            })
            .map(|entry| entry.value().clone())
            .collect();

        for member in targets {
            if let Err(e) = self.socket.send_to(&encoded, member.gossip_addr).await {
                tracing::warn!("Failed to broadcast to {}: {}", member.id, e);
            }
        }
    }
}

impl Membership for MembershipService {
    fn local_node_id(&self) -> NodeId {
        self.local_node.id.clone()
    }

    fn is_alive(&self, node_id: &NodeId) -> bool {
        self.members
            .get(node_id)
            .map(|m| matches!(m.state, NodeState::Alive | NodeState::Suspect))
            .unwrap_or(false)
    }

    fn alive_nodes(&self) -> Vec<NodeId> {
        self.get_alive_members().into_iter().map(|node| node.id).collect()
    }

    fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_membership_creation() {
        let bind_addr = "127.0.0.1:0".parse().unwrap();
        let transport_addr = "127.0.0.1:7000".parse().unwrap();

        let service = MembershipService::new(bind_addr, transport_addr, vec![])
            .await
            .expect("Failed to create service");

        assert_eq!(service.members.len(), 1);
        assert!(service.is_alive(&service.local_node.id));
        assert_eq!(service.alive_nodes(), vec![service.local_node.id.clone()]);
    }

    #[tokio::test]
    async fn test_join_and_leave_publish_events() {
        let service = MembershipService::new(
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:7000".parse().unwrap(),
            vec![],
        )
        .await
        .unwrap();
        let mut events = service.subscribe();

        let peer = Node {
            id: NodeId::from("peer"),
            gossip_addr: "127.0.0.1:9".parse().unwrap(),
            transport_addr: "127.0.0.1:10".parse().unwrap(),
            state: NodeState::Alive,
            incarnation: 1,
            last_seen: None,
        };

        service.handle_join(peer.clone());
        assert_eq!(events.recv().await.unwrap(), MembershipEvent::Joined(peer.id.clone()));
        assert!(service.is_alive(&peer.id));

        service.handle_leave(peer.id.clone());
        assert_eq!(events.recv().await.unwrap(), MembershipEvent::Left(peer.id.clone()));
        assert!(!service.is_alive(&peer.id));

        // A second leave for the same node is not re-published.
        service.handle_leave(peer.id.clone());
        assert!(events.try_recv().is_err());
    }
}

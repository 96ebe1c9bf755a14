//! Membership Module Tests
//!
//! ## Test Scopes
//! - **Data Structures**: node ids, gossip wire messages, membership events.
//! - **Static view**: join/leave/fail bookkeeping and event publication.
//! - **Gossip service**: construction and member lookup.

#[cfg(test)]
mod tests {
    use crate::membership::service::MembershipService;
    use crate::membership::types::{GossipMessage, MembershipEvent, Node, NodeId, NodeState};
    use crate::membership::view::{Membership, StaticMembership};
    use std::net::SocketAddr;

    fn node(id: &str, port: u16) -> Node {
        Node {
            id: NodeId::from(id),
            gossip_addr: SocketAddr::from(([127, 0, 0, 1], port)),
            transport_addr: SocketAddr::from(([127, 0, 0, 1], port + 1000)),
            state: NodeState::Alive,
            incarnation: 1,
            last_seen: None,
        }
    }

    // ============================================================
    // NODE ID / WIRE TESTS
    // ============================================================

    #[test]
    fn test_node_id_is_unique() {
        assert_ne!(NodeId::new(), NodeId::new());
    }

    #[test]
    fn test_node_id_display_matches_inner_value() {
        assert_eq!(NodeId::from("node-7").to_string(), "node-7");
    }

    #[test]
    fn test_node_serialization_skips_last_seen() {
        let mut original = node("n1", 5000);
        original.last_seen = Some(std::time::Instant::now());

        let encoded = bincode::serialize(&original).expect("serialize");
        let restored: Node = bincode::deserialize(&encoded).expect("deserialize");

        assert_eq!(restored.id, original.id);
        assert_eq!(restored.transport_addr, original.transport_addr);
        assert!(restored.last_seen.is_none());
    }

    #[test]
    fn test_gossip_leave_roundtrip() {
        let msg = GossipMessage::Leave {
            node_id: NodeId::from("leaving"),
        };

        let encoded = bincode::serialize(&msg).expect("serialize");
        let decoded: GossipMessage = bincode::deserialize(&encoded).expect("deserialize");

        match decoded {
            GossipMessage::Leave { node_id } => assert_eq!(node_id.0, "leaving"),
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_membership_event_departure() {
        let id = NodeId::from("x");

        assert!(!MembershipEvent::Joined(id.clone()).is_departure());
        assert!(MembershipEvent::Left(id.clone()).is_departure());
        assert!(MembershipEvent::Failed(id.clone()).is_departure());
        assert_eq!(MembershipEvent::Failed(id.clone()).node_id(), &id);
    }

    // ============================================================
    // STATIC VIEW TESTS
    // ============================================================

    #[tokio::test]
    async fn test_static_membership_publishes_changes() {
        // ARRANGE
        let local = NodeId::from("local");
        let view = StaticMembership::new(local.clone());
        let mut events = view.subscribe();
        let peer = NodeId::from("peer");

        // ACT
        view.join(peer.clone());
        view.join(peer.clone()); // duplicate join is silent
        view.fail(&peer);

        // ASSERT
        assert_eq!(events.recv().await.unwrap(), MembershipEvent::Joined(peer.clone()));
        assert_eq!(events.recv().await.unwrap(), MembershipEvent::Failed(peer.clone()));
        assert!(events.try_recv().is_err());
        assert!(!view.is_alive(&peer));
        assert!(view.is_alive(&local));
    }

    #[test]
    fn test_static_membership_alive_nodes_sorted() {
        let view = StaticMembership::with_members(
            NodeId::from("b"),
            vec![NodeId::from("c"), NodeId::from("a")],
        );

        let alive = view.alive_nodes();

        assert_eq!(alive, vec![NodeId::from("a"), NodeId::from("b"), NodeId::from("c")]);
        assert_eq!(view.local_node_id(), NodeId::from("b"));
    }

    #[test]
    fn test_static_membership_leave_unknown_is_noop() {
        let view = StaticMembership::new(NodeId::from("local"));
        let mut events = view.subscribe();

        view.leave(&NodeId::from("ghost"));

        assert!(events.try_recv().is_err());
    }

    // ============================================================
    // GOSSIP SERVICE TESTS
    // ============================================================

    #[tokio::test]
    async fn test_membership_get_member() {
        let service = MembershipService::new(
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:7100".parse().unwrap(),
            vec![],
        )
        .await
        .unwrap();

        let member = service.get_member(&service.local_node.id);
        assert_eq!(member.map(|m| m.transport_addr.port()), Some(7100));

        assert!(service.get_member(&NodeId::from("non-existent")).is_none());
    }

    #[tokio::test]
    async fn test_multiple_services_have_distinct_ids() {
        let first = MembershipService::new(
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:7200".parse().unwrap(),
            vec![],
        )
        .await
        .unwrap();
        let second = MembershipService::new(
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:7201".parse().unwrap(),
            vec![],
        )
        .await
        .unwrap();

        assert_ne!(first.local_node.id, second.local_node.id);
        assert_ne!(first.local_node.gossip_addr, second.local_node.gossip_addr);
    }
}

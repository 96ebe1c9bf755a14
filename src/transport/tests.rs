//! Transport Module Tests
//!
//! ## Test Scopes
//! - **Local network**: delivery, broadcast fan-out, unresponsive nodes.
//! - **HTTP transport**: envelope decoding and topic dispatch through the axum handler.

#[cfg(test)]
mod tests {
    use crate::membership::service::MembershipService;
    use crate::membership::types::NodeId;
    use crate::transport::handlers::handle_deploy_message;
    use crate::transport::http::{Envelope, HttpTransport};
    use crate::transport::local::LocalNetwork;
    use crate::transport::{MessageListener, PeerTransport};

    use axum::{Extension, body::Bytes, http::StatusCode};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn channel_listener() -> (MessageListener, mpsc::UnboundedReceiver<(NodeId, Vec<u8>)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let listener: MessageListener = Arc::new(move |from, payload| {
            let _ = tx.send((from, payload));
        });
        (listener, rx)
    }

    // ============================================================
    // LOCAL NETWORK
    // ============================================================

    #[tokio::test]
    async fn test_local_send_reaches_topic_listener() {
        // ARRANGE
        let network = LocalNetwork::new();
        let a = network.transport(NodeId::from("a"));
        let b = network.transport(NodeId::from("b"));
        let (listener, mut rx) = channel_listener();
        b.add_listener("greetings", listener);

        // ACT
        a.send(&NodeId::from("b"), "greetings", b"hi".to_vec())
            .await
            .expect("send should succeed");

        // ASSERT
        let (from, payload) = rx.recv().await.expect("message delivered");
        assert_eq!(from, NodeId::from("a"));
        assert_eq!(payload, b"hi".to_vec());
        assert_eq!(network.sent_count(&NodeId::from("b"), "greetings"), 1);
    }

    #[tokio::test]
    async fn test_local_send_to_unknown_node_fails() {
        let network = LocalNetwork::new();
        let a = network.transport(NodeId::from("a"));

        let result = a.send(&NodeId::from("nobody"), "topic", vec![]).await;

        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresponsive_node_counts_but_drops() {
        let network = LocalNetwork::new();
        let a = network.transport(NodeId::from("a"));
        let b = network.transport(NodeId::from("b"));
        let (listener, mut rx) = channel_listener();
        b.add_listener("t", listener);
        network.set_unresponsive(&NodeId::from("b"), true);

        a.send(&NodeId::from("b"), "t", vec![1]).await.unwrap();

        let received = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(received.is_err(), "nothing should be delivered");
        assert_eq!(network.sent_count(&NodeId::from("b"), "t"), 1);
    }

    #[tokio::test]
    async fn test_broadcast_skips_sender() {
        let network = LocalNetwork::new();
        let a = network.transport(NodeId::from("a"));
        let b = network.transport(NodeId::from("b"));
        let c = network.transport(NodeId::from("c"));
        let (listener_a, mut rx_a) = channel_listener();
        let (listener_b, mut rx_b) = channel_listener();
        let (listener_c, mut rx_c) = channel_listener();
        a.add_listener("all", listener_a);
        b.add_listener("all", listener_b);
        c.add_listener("all", listener_c);

        a.broadcast("all", vec![9]).await.unwrap();

        assert_eq!(rx_b.recv().await.unwrap().1, vec![9]);
        assert_eq!(rx_c.recv().await.unwrap().1, vec![9]);
        assert!(rx_a.try_recv().is_err());
        assert_eq!(network.sent_count(&NodeId::from("a"), "all"), 0);
    }

    #[tokio::test]
    async fn test_remove_listener() {
        let network = LocalNetwork::new();
        let a = network.transport(NodeId::from("a"));
        let (listener, _rx) = channel_listener();
        a.add_listener("t", listener);

        assert!(a.remove_listener("t"));
        assert!(!a.remove_listener("t"));
        assert_eq!(a.listener_count(), 0);
    }

    // ============================================================
    // HTTP TRANSPORT
    // ============================================================

    async fn http_transport() -> Arc<HttpTransport> {
        let membership = MembershipService::new(
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:7300".parse().unwrap(),
            vec![],
        )
        .await
        .unwrap();
        HttpTransport::new(membership)
    }

    #[tokio::test]
    async fn test_http_handler_dispatches_envelope() {
        let transport = http_transport().await;
        let (listener, mut rx) = channel_listener();
        transport.add_listener("MODULE_FETCH", listener);

        let envelope = Envelope {
            from: NodeId::from("remote"),
            topic: "MODULE_FETCH".to_string(),
            payload: vec![1, 2, 3],
        };
        let body = Bytes::from(bincode::serialize(&envelope).unwrap());

        let status = handle_deploy_message(Extension(transport.clone()), body).await;

        assert_eq!(status, StatusCode::OK);
        let (from, payload) = rx.recv().await.unwrap();
        assert_eq!(from, NodeId::from("remote"));
        assert_eq!(payload, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_http_handler_rejects_garbage_and_unknown_topics() {
        let transport = http_transport().await;

        let status =
            handle_deploy_message(Extension(transport.clone()), Bytes::from_static(&[0xff])).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let envelope = Envelope {
            from: NodeId::from("remote"),
            topic: "nobody-listens".to_string(),
            payload: vec![],
        };
        let body = Bytes::from(bincode::serialize(&envelope).unwrap());
        let status = handle_deploy_message(Extension(transport), body).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_http_send_to_unknown_member_fails_fast() {
        let transport = http_transport().await;

        let result = transport
            .send(&NodeId::from("missing"), "MODULE_FETCH", vec![])
            .await;

        assert!(result.is_err());
    }
}

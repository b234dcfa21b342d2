// This file is part of FakeDLM.

// FakeDLM is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// FakeDLM is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with FakeDLM. If not, see <https://www.gnu.org/licenses/>.

mod transport {
    use fakedlm_membership::NodeId;
    use fakedlm_network::{Message, Transport, TransportEvent, MESSAGE_LEN};
    use fakedlm_testing::network::{loopback_registry, random_port, FakePeer};

    use std::net::SocketAddr;
    use tokio::{
        sync::mpsc,
        time::{timeout, Duration},
    };

    /// One in-process daemon end: a transport plus the event pump the
    /// daemon loop would normally run.
    struct TestNode {
        transport: Transport,
        events: mpsc::UnboundedReceiver<TransportEvent>,
        messages: Vec<(NodeId, Message)>,
        fatal: Option<u16>,
    }

    impl TestNode {
        fn start(count: u32, local: u32, port: u16) -> Self {
            let (events_tx, events) = mpsc::unbounded_channel();
            let mut transport = Transport::new(loopback_registry(count, local), port, events_tx);
            transport.start().unwrap();
            Self {
                transport,
                events,
                messages: Vec::new(),
                fatal: None,
            }
        }

        /// Applies events until the transport stays quiet for a moment.
        async fn settle(&mut self) {
            while let Ok(Some(event)) = timeout(Duration::from_millis(200), self.events.recv()).await
            {
                self.apply(event);
            }
        }

        fn apply(&mut self, event: TransportEvent) {
            match event {
                TransportEvent::Accepted { stream, addr } => {
                    if let Err(error) = self.transport.accept_connection(stream, addr) {
                        panic!("{}", error);
                    }
                }
                TransportEvent::ConnectFinished { node, result } => {
                    self.transport.connect_finished(node, result);
                }
                TransportEvent::MessageReceived {
                    node,
                    conn_id,
                    message: Message::Close,
                } => {
                    self.transport.close_received(node, conn_id);
                }
                TransportEvent::MessageReceived { node, message, .. } => {
                    self.messages.push((node, message));
                }
                TransportEvent::ConnectionFailed { node, conn_id } => {
                    self.transport.connection_failed(node, conn_id);
                }
                TransportEvent::ProtocolError { type_id, .. } => {
                    self.fatal = Some(type_id);
                }
            }
        }
    }

    async fn converge(a: &mut TestNode, b: &mut TestNode) {
        for _ in 0..20 {
            a.settle().await;
            b.settle().await;
            let settled = a.transport.is_connected(NodeId::new(2))
                && b.transport.is_connected(NodeId::new(1))
                && a.transport.connection_count(NodeId::new(2)) == 1
                && b.transport.connection_count(NodeId::new(1)) == 1;
            if settled {
                return;
            }
        }
        panic!("the connection pair did not settle");
    }

    #[tokio::test]
    async fn simultaneous_connects_converge_on_one_socket() {
        let port = random_port().await;
        let mut a = TestNode::start(2, 1, port);
        let mut b = TestNode::start(2, 2, port);

        converge(&mut a, &mut b).await;

        assert!(a.fatal.is_none());
        assert!(b.fatal.is_none());
    }

    #[tokio::test]
    async fn messages_flow_over_the_canonical_connection() {
        let port = random_port().await;
        let mut a = TestNode::start(2, 1, port);
        let mut b = TestNode::start(2, 2, port);
        converge(&mut a, &mut b).await;

        assert!(a
            .transport
            .send(NodeId::new(2), Message::StopLockspace("ls1".into())));
        b.settle().await;
        assert_eq!(
            b.messages,
            vec![(NodeId::new(1), Message::StopLockspace("ls1".into()))],
        );

        assert!(b
            .transport
            .send(NodeId::new(1), Message::LockspaceStopped("ls1".into())));
        a.settle().await;
        assert_eq!(
            a.messages,
            vec![(NodeId::new(1), Message::LockspaceStopped("ls1".into()))],
        );
    }

    #[tokio::test]
    async fn losing_the_peer_clears_the_connection() {
        let port = random_port().await;
        let mut a = TestNode::start(2, 1, port);
        let mut b = TestNode::start(2, 2, port);
        converge(&mut a, &mut b).await;

        a.transport.close_all();
        b.settle().await;
        assert!(!b.transport.is_connected(NodeId::new(1)));
        assert_eq!(b.transport.connection_count(NodeId::new(1)), 0);
    }

    #[tokio::test]
    async fn fake_peer_speaks_the_wire_protocol() {
        let port = random_port().await;
        // The local node is 2 so that a loopback-sourced connection maps to
        // node 1.
        let mut node = TestNode::start(2, 2, port);
        node.settle().await;

        let addr: SocketAddr = format!("127.0.0.2:{}", port).parse().unwrap();
        let mut peer = FakePeer::connect_from("127.0.0.1:0".parse().unwrap(), addr).await;
        peer.write_message(&Message::JoinLockspace("ls1".into())).await;

        node.settle().await;
        assert_eq!(
            node.messages,
            vec![(NodeId::new(1), Message::JoinLockspace("ls1".into()))],
        );
    }

    #[tokio::test]
    async fn unknown_message_type_is_fatal() {
        let port = random_port().await;
        let mut node = TestNode::start(2, 2, port);
        node.settle().await;

        let addr: SocketAddr = format!("127.0.0.2:{}", port).parse().unwrap();
        let mut peer = FakePeer::connect_from("127.0.0.1:0".parse().unwrap(), addr).await;
        let mut raw = [0u8; MESSAGE_LEN];
        raw[1] = 99;
        peer.write_raw(&raw).await;

        node.settle().await;
        assert_eq!(node.fatal, Some(99));
    }
}

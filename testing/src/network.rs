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

use fakedlm_membership::NodeId;
use fakedlm_network::{Message, Node, NodeRegistry, MESSAGE_LEN};

use std::net::SocketAddr;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

/// Returns a random tcp socket address and binds it to a listener.
pub async fn random_bound_address() -> (SocketAddr, TcpListener) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (addr, listener)
}

/// Picks a port that was free a moment ago.
pub async fn random_port() -> u16 {
    let (addr, _listener) = random_bound_address().await;
    addr.port()
}

/// Builds a registry of `count` nodes with distinct loopback addresses
/// (`127.0.0.<id>`), as seen from node `local`.
pub fn loopback_registry(count: u32, local: u32) -> NodeRegistry {
    let nodes = (1..=count)
        .map(|n| Node {
            name: format!("node{}", n),
            id: NodeId::new(n),
            addrs: vec![format!("127.0.0.{}", n).parse().unwrap()],
            weight: 1,
            nodir: false,
        })
        .collect();
    NodeRegistry::from_parts(nodes, NodeId::new(local))
}

/// A bare framed socket speaking the peer wire protocol, standing in for a
/// remote FakeDLM.
pub struct FakePeer {
    stream: TcpStream,
}

impl FakePeer {
    pub async fn connect(addr: SocketAddr) -> Self {
        Self {
            stream: TcpStream::connect(addr).await.unwrap(),
        }
    }

    /// Connects with a bound source address, so the receiving daemon
    /// attributes the connection to the right node.
    pub async fn connect_from(source: SocketAddr, addr: SocketAddr) -> Self {
        let socket = tokio::net::TcpSocket::new_v4().unwrap();
        socket.bind(source).unwrap();
        Self {
            stream: socket.connect(addr).await.unwrap(),
        }
    }

    pub fn from_stream(stream: TcpStream) -> Self {
        Self { stream }
    }

    pub async fn read_message(&mut self) -> Message {
        let mut buffer = [0u8; MESSAGE_LEN];
        self.stream.read_exact(&mut buffer).await.unwrap();
        Message::deserialize(&buffer).unwrap()
    }

    pub async fn write_message(&mut self, message: &Message) {
        let buffer = message.serialize().unwrap();
        self.stream.write_all(&buffer).await.unwrap();
    }

    /// Writes a raw record, e.g. one with an unknown message type.
    pub async fn write_raw(&mut self, buffer: &[u8]) {
        self.stream.write_all(buffer).await.unwrap();
    }
}

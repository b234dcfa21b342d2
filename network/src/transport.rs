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

use crate::{
    inbound::ConnReader,
    message::Message,
    nodes::NodeRegistry,
    outbound::ConnWriter,
};
use fakedlm_errors::{MessageError, NetworkError};
use fakedlm_membership::{NodeId, MAX_NODES};

use socket2::{Domain, Protocol, Socket, Type};
use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
};
use tokio::{
    net::{TcpListener, TcpSocket, TcpStream},
    sync::mpsc,
    task::JoinHandle,
};
use tracing_futures::Instrument;

/// What the transport reports to the daemon loop.
#[derive(Debug)]
pub enum TransportEvent {
    /// A listening socket accepted a connection.
    Accepted { stream: TcpStream, addr: SocketAddr },
    /// An outgoing connection attempt finished.
    ConnectFinished {
        node: NodeId,
        result: io::Result<TcpStream>,
    },
    /// A framed record arrived on a peer connection.
    MessageReceived {
        node: NodeId,
        conn_id: u64,
        message: Message,
    },
    /// A connection hit EOF, a read or write error, or a short transfer.
    ConnectionFailed { node: NodeId, conn_id: u64 },
    /// A record with an unknown message type arrived; the protocol assumes
    /// well-behaved peers, so this is fatal.
    ProtocolError { node: NodeId, type_id: u16 },
}

/// Shorthand for the sending half of the transport event channel.
pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

struct Connection {
    conn_id: u64,
    sender: mpsc::UnboundedSender<Message>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Connection {
    fn close(self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// Maintains at most one canonical TCP connection per peer and moves framed
/// records over them.
///
/// Because both sides of a pair connect to each other, a pair may briefly
/// hold two sockets. The node with the lower id settles the race: it sends
/// `Close` on the previously canonical socket and adopts the new one, and
/// the other side closes the socket the `Close` arrives on.
pub struct Transport {
    registry: NodeRegistry,
    port: u16,
    events: EventSender,
    /// All live connections per peer, canonical or not.
    conns: HashMap<NodeId, Vec<Connection>>,
    /// The canonical connection per peer.
    canonical: HashMap<NodeId, u64>,
    /// Half-open outgoing connection attempts.
    connecting: HashMap<NodeId, JoinHandle<()>>,
    listeners: Vec<JoinHandle<()>>,
    next_conn_id: u64,
}

impl Transport {
    pub fn new(registry: NodeRegistry, port: u16, events: EventSender) -> Self {
        Self {
            registry,
            port,
            events,
            conns: HashMap::new(),
            canonical: HashMap::new(),
            connecting: HashMap::new(),
            listeners: Vec::new(),
            next_conn_id: 0,
        }
    }

    /// Binds the listening sockets on the local node's addresses and starts
    /// connecting to every peer. A single-node cluster needs no sockets.
    pub fn start(&mut self) -> Result<(), NetworkError> {
        if self.registry.nodes().len() <= 1 {
            return Ok(());
        }
        let local_addrs = self.registry.local().addrs.clone();
        for addr in local_addrs {
            let listener = bind_listener(SocketAddr::new(addr, self.port))?;
            self.spawn_accept(listener);
        }
        let peers: Vec<(NodeId, Option<SocketAddr>)> = self
            .registry
            .peers()
            .map(|peer| {
                let addr = peer
                    .addrs
                    .first()
                    .map(|ip| SocketAddr::new(*ip, self.port));
                (peer.id, addr)
            })
            .collect();
        for (node, addr) in peers {
            match addr {
                Some(addr) => self.spawn_connect(node, addr),
                None => warn!("Node {} has no address to connect to", node),
            }
        }
        Ok(())
    }

    /// Routes an accepted connection to the node it belongs to. An address
    /// no node owns is an error; the connection is dropped.
    pub fn accept_connection(
        &mut self,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<NodeId, NetworkError> {
        let node = match self.registry.node_by_ip(addr.ip()) {
            Some(node) => node.id,
            None => return Err(NetworkError::UnknownPeerAddress(addr.ip())),
        };
        // An accepted connection supersedes our own half-open attempt.
        if let Some(pending) = self.connecting.remove(&node) {
            pending.abort();
        }
        self.add_connection(node, stream);
        Ok(node)
    }

    /// Finishes an outgoing connection attempt. Returns `true` if the peer
    /// is now connected. A refused connect is a clean close: the peer is
    /// not up yet and will connect back in.
    pub fn connect_finished(&mut self, node: NodeId, result: io::Result<TcpStream>) -> bool {
        self.connecting.remove(&node);
        match result {
            Ok(stream) => {
                self.add_connection(node, stream);
                true
            }
            Err(error) if error.kind() == io::ErrorKind::ConnectionRefused => {
                debug!("Node {} refused the connection", node);
                false
            }
            Err(error) => {
                warn!("Connecting to node {} failed: {}", node, error);
                false
            }
        }
    }

    /// Removes a failed connection. Returns `true` if it was the canonical
    /// connection, in which case the peer is lost.
    pub fn connection_failed(&mut self, node: NodeId, conn_id: u64) -> bool {
        if !self.remove_connection(node, conn_id) {
            return false;
        }
        if self.canonical.get(&node) == Some(&conn_id) {
            self.canonical.remove(&node);
            return true;
        }
        false
    }

    /// Closes the connection a `Close` message arrived on. Returns `true`
    /// if this lost the peer entirely; if the pair still has the socket the
    /// peer switched to, that one becomes canonical instead.
    pub fn close_received(&mut self, node: NodeId, conn_id: u64) -> bool {
        self.remove_connection(node, conn_id);
        if self.canonical.get(&node) == Some(&conn_id) {
            self.canonical.remove(&node);
            if let Some(other) = self.conns.get(&node).and_then(|conns| conns.first()) {
                self.canonical.insert(node, other.conn_id);
                return false;
            }
            return true;
        }
        false
    }

    /// Sends a message on the canonical connection of a peer. Returns
    /// `false` when there is none.
    pub fn send(&self, node: NodeId, message: Message) -> bool {
        let conn_id = match self.canonical.get(&node) {
            Some(conn_id) => *conn_id,
            None => {
                trace!("No connection to node {}, dropping {}", node, message);
                return false;
            }
        };
        debug!("> {} {}", node, message);
        self.send_on(node, conn_id, message)
    }

    pub fn is_connected(&self, node: NodeId) -> bool {
        self.canonical.contains_key(&node)
    }

    /// The number of live connections to a peer, canonical or not.
    pub fn connection_count(&self, node: NodeId) -> usize {
        self.conns.get(&node).map(Vec::len).unwrap_or(0)
    }

    /// Closes the listeners and every peer connection.
    pub fn close_all(&mut self) {
        for listener in self.listeners.drain(..) {
            listener.abort();
        }
        for (_, pending) in self.connecting.drain() {
            pending.abort();
        }
        for (_, conns) in self.conns.drain() {
            for conn in conns {
                conn.close();
            }
        }
        self.canonical.clear();
    }

    fn add_connection(&mut self, node: NodeId, stream: TcpStream) {
        let conn_id = self.register(node, stream);
        let local = self.registry.local_id();
        match self.canonical.get(&node) {
            None => {
                self.canonical.insert(node, conn_id);
            }
            Some(&old) if local < node => {
                // Tell the peer to drop the old socket, then switch to the
                // new one. The higher-id side keeps waiting for our Close.
                self.send_on(node, old, Message::Close);
                self.canonical.insert(node, conn_id);
            }
            Some(_) => {}
        }
    }

    fn register(&mut self, node: NodeId, stream: TcpStream) -> u64 {
        let conn_id = self.next_conn_id;
        self.next_conn_id += 1;
        let (read_half, write_half) = stream.into_split();

        let events = self.events.clone();
        let mut reader = ConnReader::new(node, conn_id, read_half);
        let reader_task = tokio::spawn(
            async move {
                loop {
                    match reader.read_message().await {
                        Ok(message) => {
                            let event = TransportEvent::MessageReceived {
                                node,
                                conn_id,
                                message,
                            };
                            if events.send(event).is_err() {
                                break;
                            }
                        }
                        Err(NetworkError::Message(MessageError::UnknownType(type_id))) => {
                            let _ = events.send(TransportEvent::ProtocolError { node, type_id });
                            break;
                        }
                        Err(_) => {
                            let _ = events.send(TransportEvent::ConnectionFailed { node, conn_id });
                            break;
                        }
                    }
                }
            }
            .instrument(trace_span!("reader", node = node.get(), conn = conn_id)),
        );

        let (sender, mut outbound) = mpsc::unbounded_channel::<Message>();
        let events = self.events.clone();
        let mut writer = ConnWriter::new(node, conn_id, write_half);
        let writer_task = tokio::spawn(
            async move {
                while let Some(message) = outbound.recv().await {
                    if let Err(error) = writer.write_message(&message).await {
                        warn!("{}: {}", node, error);
                        let _ = events.send(TransportEvent::ConnectionFailed { node, conn_id });
                        break;
                    }
                }
            }
            .instrument(trace_span!("writer", node = node.get(), conn = conn_id)),
        );

        self.conns.entry(node).or_default().push(Connection {
            conn_id,
            sender,
            reader: reader_task,
            writer: writer_task,
        });
        conn_id
    }

    fn remove_connection(&mut self, node: NodeId, conn_id: u64) -> bool {
        if let Some(conns) = self.conns.get_mut(&node) {
            if let Some(pos) = conns.iter().position(|conn| conn.conn_id == conn_id) {
                conns.remove(pos).close();
                return true;
            }
        }
        false
    }

    fn send_on(&self, node: NodeId, conn_id: u64, message: Message) -> bool {
        let conn = self
            .conns
            .get(&node)
            .and_then(|conns| conns.iter().find(|conn| conn.conn_id == conn_id));
        match conn {
            Some(conn) => conn.sender.send(message).is_ok(),
            None => false,
        }
    }

    fn spawn_accept(&mut self, listener: TcpListener) {
        let events = self.events.clone();
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        if events.send(TransportEvent::Accepted { stream, addr }).is_err() {
                            break;
                        }
                    }
                    Err(error) => warn!("Accepting a connection failed: {}", error),
                }
            }
        });
        self.listeners.push(handle);
    }

    fn spawn_connect(&mut self, node: NodeId, addr: SocketAddr) {
        // The peer identifies us by the source address of the connection,
        // so bind the local node's address of the matching family.
        let source = self
            .registry
            .local()
            .addrs
            .iter()
            .copied()
            .find(|ip| ip.is_ipv4() == addr.is_ipv4())
            .map(|ip| SocketAddr::new(ip, 0));
        let events = self.events.clone();
        let handle = tokio::spawn(async move {
            let result = connect_from(source, addr).await;
            let _ = events.send(TransportEvent::ConnectFinished { node, result });
        });
        self.connecting.insert(node, handle);
    }
}

async fn connect_from(source: Option<SocketAddr>, addr: SocketAddr) -> io::Result<TcpStream> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    if let Some(source) = source {
        socket.bind(source)?;
    }
    socket.connect(addr).await
}

/// Binds a listening socket. IPv6 listeners are V6ONLY so both address
/// families can coexist on the same port.
fn bind_listener(addr: SocketAddr) -> Result<TcpListener, NetworkError> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.bind(&addr.into())?;
    socket.listen(MAX_NODES as i32 - 1)?;
    socket.set_nonblocking(true)?;
    Ok(TcpListener::from_std(socket.into())?)
}

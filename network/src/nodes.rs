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

use crate::environment::Environment;
use fakedlm_errors::NetworkError;
use fakedlm_membership::{MemberNode, NodeId, NodeMask};

use std::{
    collections::HashSet,
    net::{IpAddr, SocketAddr},
};
use tokio::net::lookup_host;

/// One configured cluster node with its resolved addresses.
#[derive(Clone, Debug)]
pub struct Node {
    pub name: String,
    pub id: NodeId,
    /// Resolved addresses, loopback and IPv6 link-local excluded.
    pub addrs: Vec<IpAddr>,
    pub weight: u32,
    pub nodir: bool,
}

/// The static list of cluster nodes, with the local node identified by
/// matching resolved addresses against the local network interfaces.
#[derive(Clone, Debug)]
pub struct NodeRegistry {
    nodes: Vec<Node>,
    local: NodeId,
}

impl NodeRegistry {
    /// Builds the registry from the configured node names: resolves each
    /// name, assigns node ids by position, and determines the local node.
    pub async fn resolve(environment: &Environment) -> Result<Self, NetworkError> {
        let mut nodes = Vec::new();
        for (n, name) in environment.node_names().iter().enumerate() {
            if name == "-" {
                continue;
            }
            let id = NodeId::new(n as u32 + 1);
            let addrs = resolve_addrs(name).await?;
            let tuning = environment.node_tuning(name);
            nodes.push(Node {
                name: name.clone(),
                id,
                addrs,
                weight: tuning.weight,
                nodir: tuning.nodir,
            });
        }
        if nodes.is_empty() {
            return Err(NetworkError::NoNodes);
        }

        let interfaces = local_interface_addrs()?;
        let local = find_local_node(&nodes, &interfaces)?;
        Ok(Self { nodes, local })
    }

    /// Builds a registry with known addresses and local node, bypassing
    /// resolution and interface detection.
    pub fn from_parts(nodes: Vec<Node>, local: NodeId) -> Self {
        Self { nodes, local }
    }

    #[inline]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    #[inline]
    pub fn local_id(&self) -> NodeId {
        self.local
    }

    pub fn local(&self) -> &Node {
        self.get(self.local).expect("the local node is always registered")
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.iter().find(|node| node.id == id)
    }

    /// Every node except the local one.
    pub fn peers(&self) -> impl Iterator<Item = &Node> {
        let local = self.local;
        self.nodes.iter().filter(move |node| node.id != local)
    }

    /// The union of all configured node bits.
    pub fn all_nodes(&self) -> NodeMask {
        let mut mask = NodeMask::EMPTY;
        for node in &self.nodes {
            mask.insert(node.id);
        }
        mask
    }

    /// Finds the node an incoming connection belongs to by its address.
    pub fn node_by_ip(&self, ip: IpAddr) -> Option<&Node> {
        self.nodes.iter().find(|node| node.addrs.contains(&ip))
    }

    /// The per-node attributes the membership state machine needs.
    pub fn member_nodes(&self) -> Vec<MemberNode> {
        self.nodes
            .iter()
            .map(|node| MemberNode {
                id: node.id,
                weight: node.weight,
            })
            .collect()
    }
}

/// Resolves a node name to its usable addresses.
async fn resolve_addrs(name: &str) -> Result<Vec<IpAddr>, NetworkError> {
    let resolved = lookup_host((name, 0u16))
        .await
        .map_err(NetworkError::Io)?;

    let mut addrs = Vec::new();
    for addr in resolved.map(|sockaddr: SocketAddr| sockaddr.ip()) {
        if excluded(&addr) || addrs.contains(&addr) {
            continue;
        }
        addrs.push(addr);
    }
    if addrs.is_empty() {
        return Err(NetworkError::NoAddresses(name.to_owned()));
    }
    Ok(addrs)
}

/// Loopback addresses never identify a cluster node, and IPv6 link-local
/// addresses are ambiguous without a scope.
fn excluded(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => v6.is_loopback() || (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}

/// Collects the addresses of the local network interfaces.
fn local_interface_addrs() -> Result<HashSet<IpAddr>, NetworkError> {
    let ifaddrs = nix::ifaddrs::getifaddrs()
        .map_err(|errno| NetworkError::Io(std::io::Error::from_raw_os_error(errno as i32)))?;

    let mut addrs = HashSet::new();
    for ifaddr in ifaddrs {
        if let Some(nix::sys::socket::SockAddr::Inet(inet)) = ifaddr.address {
            addrs.insert(inet.to_std().ip());
        }
    }
    Ok(addrs)
}

/// Exactly one configured node must have a local address.
fn find_local_node(nodes: &[Node], interfaces: &HashSet<IpAddr>) -> Result<NodeId, NetworkError> {
    let mut local = None;
    for node in nodes {
        if node.addrs.iter().any(|addr| interfaces.contains(addr)) {
            if let Some(previous) = local.replace(node) {
                return Err(NetworkError::DuplicateLocalNode(
                    previous.name.clone(),
                    node.name.clone(),
                ));
            }
        }
    }
    local.map(|node| node.id).ok_or(NetworkError::NoLocalNode)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str, id: u32, addr: &str) -> Node {
        Node {
            name: name.to_owned(),
            id: NodeId::new(id),
            addrs: vec![addr.parse().unwrap()],
            weight: 1,
            nodir: false,
        }
    }

    #[test]
    fn exclusion_rules() {
        assert!(excluded(&"127.0.0.1".parse().unwrap()));
        assert!(excluded(&"::1".parse().unwrap()));
        assert!(excluded(&"fe80::1".parse().unwrap()));
        assert!(!excluded(&"192.168.0.1".parse().unwrap()));
        assert!(!excluded(&"2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn local_node_detection() {
        let nodes = vec![
            node("a", 1, "10.0.0.1"),
            node("b", 2, "10.0.0.2"),
            node("c", 3, "10.0.0.3"),
        ];
        let mut interfaces = HashSet::new();
        interfaces.insert("10.0.0.2".parse().unwrap());
        assert_eq!(find_local_node(&nodes, &interfaces).unwrap(), NodeId::new(2));

        interfaces.clear();
        assert!(matches!(
            find_local_node(&nodes, &interfaces),
            Err(NetworkError::NoLocalNode),
        ));

        interfaces.insert("10.0.0.1".parse().unwrap());
        interfaces.insert("10.0.0.3".parse().unwrap());
        assert!(matches!(
            find_local_node(&nodes, &interfaces),
            Err(NetworkError::DuplicateLocalNode(_, _)),
        ));
    }

    #[test]
    fn registry_lookups() {
        let nodes = vec![node("a", 1, "10.0.0.1"), node("b", 2, "10.0.0.2")];
        let registry = NodeRegistry::from_parts(nodes, NodeId::new(1));

        assert_eq!(registry.local().name, "a");
        assert_eq!(registry.all_nodes().to_string(), "[1, 2]");
        assert_eq!(
            registry.node_by_ip("10.0.0.2".parse().unwrap()).unwrap().id,
            NodeId::new(2),
        );
        assert!(registry.node_by_ip("10.9.9.9".parse().unwrap()).is_none());
        let peer_ids: Vec<u32> = registry.peers().map(|n| n.id.get()).collect();
        assert_eq!(peer_ids, vec![2]);
    }
}

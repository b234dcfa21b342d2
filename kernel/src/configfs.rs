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

//! The configfs cluster tree: `<configfs>/cluster/` with its `comms/`
//! entries per node and `spaces/` entries per lockspace.

use crate::{modprobe, write_file, DlmKernel};
use fakedlm_errors::KernelError;

use byteorder::{BigEndian, ByteOrder, NativeEndian};
use std::{fs, net::SocketAddr, path::PathBuf};

const AF_INET: u16 = 2;
const AF_INET6: u16 = 10;

/// The kernel stores node addresses padded to this fixed length.
pub const SOCKADDR_STORAGE_LEN: usize = 128;

/// What the kernel needs to know about one cluster node.
#[derive(Clone, Debug)]
pub struct CommsNode {
    pub nodeid: u32,
    pub local: bool,
    pub addrs: Vec<SocketAddr>,
}

/// Encodes a socket address the way the kernel stores it: a
/// `sockaddr_storage` with native-endian family and big-endian port,
/// zero-padded to the fixed storage length.
pub fn encode_sockaddr(addr: &SocketAddr) -> [u8; SOCKADDR_STORAGE_LEN] {
    let mut buf = [0u8; SOCKADDR_STORAGE_LEN];
    match addr {
        SocketAddr::V4(v4) => {
            NativeEndian::write_u16(&mut buf[0..2], AF_INET);
            BigEndian::write_u16(&mut buf[2..4], v4.port());
            buf[4..8].copy_from_slice(&v4.ip().octets());
        }
        SocketAddr::V6(v6) => {
            NativeEndian::write_u16(&mut buf[0..2], AF_INET6);
            BigEndian::write_u16(&mut buf[2..4], v6.port());
            // flowinfo stays zero
            buf[8..24].copy_from_slice(&v6.ip().octets());
            // scope id stays zero
        }
    }
    buf
}

impl DlmKernel {
    fn comms_dir(&self, nodeid: u32) -> PathBuf {
        self.paths().cluster_dir().join("comms").join(format!("{}", nodeid))
    }

    fn space_dir(&self, name: &str) -> PathBuf {
        self.paths().cluster_dir().join("spaces").join(name)
    }

    fn space_node_dir(&self, name: &str, nodeid: u32) -> PathBuf {
        self.space_dir(name).join("nodes").join(format!("{}", nodeid))
    }

    /// Creates and fills the cluster configuration tree. Creating the
    /// cluster directory implicitly requests the kernel module; if that
    /// fails, the module is loaded explicitly and the creation retried.
    pub async fn configure(
        &self,
        cluster_name: Option<&str>,
        tcp_port: Option<u16>,
        protocol: Option<u8>,
        nodes: &[CommsNode],
    ) -> Result<(), KernelError> {
        let cluster = self.paths().cluster_dir();
        if fs::create_dir_all(&cluster).is_err() {
            modprobe::modprobe("dlm").await?;
            fs::create_dir_all(&cluster).map_err(|error| KernelError::path(&cluster, error))?;
        }
        if let Some(name) = cluster_name {
            write_file(&cluster.join("cluster_name"), name.as_bytes())?;
        }
        if let Some(port) = tcp_port {
            write_file(&cluster.join("tcp_port"), format!("{}", port).as_bytes())?;
        }
        if let Some(protocol) = protocol {
            write_file(&cluster.join("protocol"), format!("{}", protocol).as_bytes())?;
        }
        for node in nodes {
            self.configure_node(node)?;
        }
        Ok(())
    }

    /// Tells the kernel about one node's id, addresses, and whether the
    /// node is local.
    fn configure_node(&self, node: &CommsNode) -> Result<(), KernelError> {
        let dir = self.comms_dir(node.nodeid);
        fs::create_dir_all(&dir).map_err(|error| KernelError::path(&dir, error))?;
        write_file(&dir.join("nodeid"), format!("{}", node.nodeid).as_bytes())?;
        if node.local {
            write_file(&dir.join("local"), b"1")?;
        }
        for addr in &node.addrs {
            write_file(&dir.join("addr"), &encode_sockaddr(addr))?;
        }
        Ok(())
    }

    /// Removes the cluster configuration so that the module can be
    /// unloaded or a different configuration created.
    pub fn remove_config(&self, node_ids: &[u32]) -> Result<(), KernelError> {
        for nodeid in node_ids {
            let dir = self.comms_dir(*nodeid);
            remove_config_dir(&dir, &["nodeid", "local", "addr"])
                .map_err(|error| KernelError::path(&dir, error))?;
        }
        let cluster = self.paths().cluster_dir();
        if let Err(error) = fs::remove_dir(&cluster) {
            warn!("Could not remove {}: {}", cluster.display(), error);
        }
        Ok(())
    }

    /// Creates the configuration directory for a lockspace the local node
    /// is about to join.
    pub fn create_space(&self, name: &str) -> Result<(), KernelError> {
        let dir = self.space_dir(name);
        fs::create_dir_all(&dir).map_err(|error| KernelError::path(&dir, error))
    }

    /// Removes the configuration directory after the local node left.
    pub fn remove_space(&self, name: &str) -> Result<(), KernelError> {
        let dir = self.space_dir(name);
        let _ = fs::remove_dir(dir.join("nodes"));
        remove_config_dir(&dir, &["id", "nodir"]).map_err(|error| KernelError::path(&dir, error))
    }

    /// Adds a node to a lockspace's member configuration.
    pub fn add_space_node(&self, name: &str, nodeid: u32, weight: u32) -> Result<(), KernelError> {
        let dir = self.space_node_dir(name, nodeid);
        fs::create_dir_all(&dir).map_err(|error| KernelError::path(&dir, error))?;
        write_file(&dir.join("nodeid"), format!("{}", nodeid).as_bytes())?;
        if weight != 1 {
            write_file(&dir.join("weight"), format!("{}", weight).as_bytes())?;
        }
        Ok(())
    }

    /// Removes a node from a lockspace's member configuration.
    pub fn remove_space_node(&self, name: &str, nodeid: u32) -> Result<(), KernelError> {
        let dir = self.space_node_dir(name, nodeid);
        remove_config_dir(&dir, &["nodeid", "weight"]).map_err(|error| KernelError::path(&dir, error))
    }
}

/// Removes a configfs directory. On configfs the attribute files vanish
/// with the directory; on a plain filesystem (tests) they have to be
/// unlinked first, so try that and ignore the outcome.
fn remove_config_dir(dir: &std::path::Path, attrs: &[&str]) -> std::io::Result<()> {
    for attr in attrs {
        let _ = fs::remove_file(dir.join(attr));
    }
    fs::remove_dir(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DlmKernel;
    use fakedlm_testing::kernel::TempDlmTree;

    use tokio::sync::mpsc;

    fn kernel(tree: &TempDlmTree) -> DlmKernel {
        let (tx, _rx) = mpsc::unbounded_channel();
        DlmKernel::new(tree.paths(), tx)
    }

    fn read(path: PathBuf) -> String {
        fs::read_to_string(path).unwrap()
    }

    #[test]
    fn encode_v4_sockaddr() {
        let addr: SocketAddr = "192.168.1.7:21064".parse().unwrap();
        let buf = encode_sockaddr(&addr);
        assert_eq!(NativeEndian::read_u16(&buf[0..2]), AF_INET);
        assert_eq!(BigEndian::read_u16(&buf[2..4]), 21064);
        assert_eq!(&buf[4..8], &[192, 168, 1, 7]);
        assert!(buf[8..].iter().all(|&b| b == 0));
    }

    #[test]
    fn encode_v6_sockaddr() {
        let addr: SocketAddr = "[2001:db8::1]:0".parse().unwrap();
        let buf = encode_sockaddr(&addr);
        assert_eq!(NativeEndian::read_u16(&buf[0..2]), AF_INET6);
        assert_eq!(BigEndian::read_u16(&buf[2..4]), 0);
        assert_eq!(buf[8], 0x20);
        assert_eq!(buf[9], 0x01);
        assert_eq!(buf[23], 0x01);
        assert!(buf[24..].iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn configure_builds_the_cluster_tree() {
        let tree = TempDlmTree::new();
        let kernel = kernel(&tree);
        let nodes = vec![
            CommsNode {
                nodeid: 1,
                local: true,
                addrs: vec!["10.0.0.1:0".parse().unwrap()],
            },
            CommsNode {
                nodeid: 2,
                local: false,
                addrs: vec!["10.0.0.2:0".parse().unwrap()],
            },
        ];
        kernel
            .configure(Some("mycluster"), Some(21065), Some(1), &nodes)
            .await
            .unwrap();

        let cluster = tree.paths().configfs.join("cluster");
        assert_eq!(read(cluster.join("cluster_name")), "mycluster");
        assert_eq!(read(cluster.join("tcp_port")), "21065");
        assert_eq!(read(cluster.join("protocol")), "1");
        assert_eq!(read(cluster.join("comms/1/nodeid")), "1");
        assert_eq!(read(cluster.join("comms/1/local")), "1");
        assert_eq!(read(cluster.join("comms/2/nodeid")), "2");
        assert!(!cluster.join("comms/2/local").exists());

        let addr = fs::read(cluster.join("comms/2/addr")).unwrap();
        assert_eq!(addr.len(), SOCKADDR_STORAGE_LEN);
        assert_eq!(&addr[4..8], &[10, 0, 0, 2]);
    }

    #[tokio::test]
    async fn configure_skips_default_port_and_protocol() {
        let tree = TempDlmTree::new();
        let kernel = kernel(&tree);
        kernel.configure(None, None, None, &[]).await.unwrap();

        let cluster = tree.paths().configfs.join("cluster");
        assert!(cluster.is_dir());
        assert!(!cluster.join("cluster_name").exists());
        assert!(!cluster.join("tcp_port").exists());
        assert!(!cluster.join("protocol").exists());
    }

    #[tokio::test]
    async fn space_membership_lifecycle() {
        let tree = TempDlmTree::new();
        let kernel = kernel(&tree);
        kernel.create_space("ls1").unwrap();
        kernel.add_space_node("ls1", 1, 1).unwrap();
        kernel.add_space_node("ls1", 2, 3).unwrap();

        let space = tree.paths().configfs.join("cluster/spaces/ls1");
        assert_eq!(read(space.join("nodes/1/nodeid")), "1");
        assert!(!space.join("nodes/1/weight").exists());
        assert_eq!(read(space.join("nodes/2/weight")), "3");

        kernel.remove_space_node("ls1", 1).unwrap();
        kernel.remove_space_node("ls1", 2).unwrap();
        assert!(!space.join("nodes/1").exists());

        kernel.remove_space("ls1").unwrap();
        assert!(!space.exists());
    }

    #[tokio::test]
    async fn remove_config_drops_comms_entries() {
        let tree = TempDlmTree::new();
        let kernel = kernel(&tree);
        let nodes = vec![CommsNode {
            nodeid: 1,
            local: true,
            addrs: vec![],
        }];
        kernel.configure(None, None, None, &nodes).await.unwrap();
        kernel.remove_config(&[1]).unwrap();
        assert!(!tree.paths().configfs.join("cluster/comms/1").exists());
    }
}

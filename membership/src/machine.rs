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
    lockspace::Lockspace,
    mask::{NodeId, NodeMask},
};
use fakedlm_errors::KernelError;
use fakedlm_kernel::{DlmKernel, Errno};

use std::sync::Arc;
use tokio::sync::mpsc;

/// A protocol message the state machine wants delivered to one peer. The
/// transport maps notices onto wire messages.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Notice {
    /// Request the peer to stop a lockspace on our behalf.
    Stop(String),
    /// Tell the peer the lockspace is stopped locally.
    Stopped(String),
    /// Request to join a lockspace the peer has stopped for us.
    Join(String),
    /// Request to leave a lockspace the peer has stopped for us.
    Leave(String),
}

/// Shorthand for the sending half of the outbound notice channel.
pub type NoticeSender = mpsc::UnboundedSender<(NodeId, Notice)>;

/// The per-node attributes the state machine needs when it materializes
/// lockspace membership in the cluster configuration tree.
#[derive(Clone, Copy, Debug)]
pub struct MemberNode {
    pub id: NodeId,
    pub weight: u32,
}

/// The membership state machine: the table of lockspaces, the connectivity
/// masks, and the handlers for every event that can affect them.
///
/// All handlers run on the daemon task, one event at a time; a commit runs
/// to completion without yielding.
pub struct Membership {
    /// The local node's id.
    local: NodeId,
    /// Whether the local node is configured without a resource directory.
    local_nodir: bool,
    /// Every configured node, in node id order.
    nodes: Vec<MemberNode>,
    /// The union of all configured node bits.
    all_nodes: NodeMask,
    /// The nodes currently reachable over a canonical connection, always
    /// including the local node.
    connected: NodeMask,
    lockspaces: Vec<Lockspace>,
    /// The number of lockspaces the local node is currently a member of.
    joined: usize,
    /// Outstanding asynchronous kernel writes.
    in_flight: usize,
    kernel: Arc<DlmKernel>,
    notices: NoticeSender,
}

impl Membership {
    pub fn new(
        local: NodeId,
        local_nodir: bool,
        nodes: Vec<MemberNode>,
        kernel: Arc<DlmKernel>,
        notices: NoticeSender,
    ) -> Self {
        let mut all_nodes = NodeMask::EMPTY;
        for node in &nodes {
            all_nodes.insert(node.id);
        }

        Self {
            local,
            local_nodir,
            nodes,
            all_nodes,
            connected: local.mask(),
            lockspaces: Vec::new(),
            joined: 0,
            in_flight: 0,
            kernel,
            notices,
        }
    }

    #[inline]
    pub fn local(&self) -> NodeId {
        self.local
    }

    #[inline]
    pub fn all_nodes(&self) -> NodeMask {
        self.all_nodes
    }

    #[inline]
    pub fn connected(&self) -> NodeMask {
        self.connected
    }

    /// Returns the number of lockspaces the local node is a member of.
    #[inline]
    pub fn joined_lockspaces(&self) -> usize {
        self.joined
    }

    /// Returns the number of asynchronous kernel writes not yet completed.
    #[inline]
    pub fn outstanding_requests(&self) -> usize {
        self.in_flight
    }

    pub fn lockspace(&self, name: &str) -> Option<&Lockspace> {
        self.lockspaces.iter().find(|ls| ls.name == name)
    }

    fn find(&self, name: &str) -> Option<usize> {
        self.lockspaces.iter().position(|ls| ls.name == name)
    }

    fn find_or_create(&mut self, name: &str) -> usize {
        match self.find(name) {
            Some(idx) => idx,
            None => {
                let ls = Lockspace::new(name, self.local);
                info!("New lockspace '{}' [{:04x}]", name, ls.global_id);
                self.lockspaces.push(ls);
                self.lockspaces.len() - 1
            }
        }
    }

    fn send(&self, to: NodeId, notice: Notice) {
        // The receiver lives as long as the daemon loop.
        let _ = self.notices.send((to, notice));
    }

    fn status(&self, idx: usize, what: &str) {
        let ls = &self.lockspaces[idx];
        trace!(
            "Lockspace {} {}: stopping={}, stopped={}, joining={}, leaving={}, members={}",
            ls.name, what, ls.stopping, ls.stopped, ls.joining, ls.leaving, ls.members,
        );
    }

    /// The lockspace has stopped on every connected node.
    fn all_stopped(&self, idx: usize) -> bool {
        (self.connected & !self.lockspaces[idx].stopped).is_empty()
    }

    /// A peer became reachable over a canonical connection.
    pub fn peer_connected(&mut self, id: NodeId) {
        self.connected.insert(id);
    }

    /// The canonical connection to a peer was lost. The cluster has
    /// degenerated: every lockspace sheds its remote members, and every
    /// lockspace the local node is in is force-released.
    pub fn peer_lost(&mut self, id: NodeId) -> Result<(), KernelError> {
        self.connected.remove(id);
        for idx in 0..self.lockspaces.len() {
            let leaving = {
                let ls = &mut self.lockspaces[idx];
                ls.joining = NodeMask::EMPTY;
                ls.leaving = ls.members & !self.local.mask();
                ls.leaving
            };
            if !leaving.is_empty() {
                self.commit(idx)?;
            }
            if self.lockspaces[idx].members.contains(self.local) {
                self.release(idx, true)?;
            }
        }
        Ok(())
    }

    /// The kernel asks to join a lockspace: a client created it through the
    /// control device and the online uevent arrived.
    pub fn local_online(&mut self, name: &str) -> Result<(), KernelError> {
        let idx = self.find_or_create(name);
        if self.connected != self.all_nodes {
            // Refuse to create lockspaces when not fully connected.
            error!(
                "Not joining lockspace '{}': not connected to node(s) {}",
                name,
                self.all_nodes & !self.connected,
            );
            self.kernel.write_event_done(name, Errno::EBUSY as i32)?;
            return Ok(());
        }
        if self.lockspaces[idx].members.contains(self.local) {
            error!("Already in lockspace '{}'", name);
            self.kernel.write_event_done(name, 0)?;
            return Ok(());
        }
        info!("Joining lockspace '{}'", name);
        // The lockspace is not started yet.
        self.lockspaces[idx].joining.insert(self.local);
        let mut sent = false;
        for node in self.peers() {
            self.send(node, Notice::Stop(name.to_owned()));
            sent = true;
        }
        if !sent {
            self.commit(idx)?;
        }
        Ok(())
    }

    /// The kernel asks to leave a lockspace: the last local user removed it
    /// and the offline uevent arrived. The lockspace is already stopped
    /// locally at this point.
    pub fn local_offline(&mut self, name: &str) -> Result<(), KernelError> {
        let idx = match self.find(name) {
            Some(idx) => idx,
            None => {
                info!("Lockspace '{}' doesn't exist", name);
                return Ok(());
            }
        };
        if !self.lockspaces[idx].members.contains(self.local) {
            info!("Not in lockspace '{}'", name);
            return Ok(());
        }
        info!("Leaving lockspace '{}'", name);

        // Drop the control file so the kernel can release its reference.
        let local = self.local;
        {
            let ls = &mut self.lockspaces[idx];
            ls.control = None;
            ls.minor = None;
            ls.leaving.insert(local);
            ls.stopped.insert(local);
        }
        let mut sent = false;
        if self.connected == self.all_nodes {
            for node in self.peers() {
                self.send(node, Notice::Stop(name.to_owned()));
                sent = true;
            }
        }
        if !sent {
            self.commit(idx)?;
        }
        Ok(())
    }

    /// The control device for a new lockspace has been created; remember the
    /// minor number the kernel assigned.
    pub fn device_added(&mut self, name: &str, minor: u32) {
        if let Some(idx) = self.find(name) {
            self.lockspaces[idx].minor = Some(minor);
        }
    }

    /// A peer requests that we stop a lockspace on its behalf. This takes a
    /// "lock" on the lockspace that only the peer's join or leave releases.
    pub fn peer_stop(&mut self, from: NodeId, name: &str) -> Result<(), KernelError> {
        let idx = self.find_or_create(name);
        let local = self.local;
        // The lockspace will not be restarted until every stopping bit has
        // been cleared again.
        self.lockspaces[idx].stopping.insert(from);
        if self.lockspaces[idx].stopped.contains(local) {
            self.send(from, Notice::Stopped(name.to_owned()));
        } else if !self.lockspaces[idx].stopping.contains(local) {
            self.submit_stop(idx)?;
        }
        Ok(())
    }

    /// A peer reports that the lockspace is stopped on its side and will
    /// remain stopped until we send a join or leave request.
    pub fn peer_stopped(&mut self, from: NodeId, name: &str) -> Result<(), KernelError> {
        let idx = match self.find(name) {
            Some(idx) => idx,
            None => return Ok(()),
        };
        self.lockspaces[idx].stopped.insert(from);
        if self.all_stopped(idx) {
            self.lockspace_stopped(idx)?;
        }
        Ok(())
    }

    /// A peer requests to join a lockspace it has previously stopped.
    pub fn peer_join(&mut self, from: NodeId, name: &str) -> Result<(), KernelError> {
        let idx = match self.find(name) {
            Some(idx) => idx,
            None => return Ok(()),
        };
        if self.lockspaces[idx].members.contains(from) {
            warn!("Node {} already is a member of lockspace '{}'", from, name);
            return Ok(());
        }
        let ls = &mut self.lockspaces[idx];
        ls.joining.insert(from);
        ls.stopping.remove(from);
        if (self.lockspaces[idx].stopping & self.connected).is_empty() {
            self.commit(idx)?;
        }
        Ok(())
    }

    /// A peer requests to leave a lockspace it has previously stopped.
    pub fn peer_leave(&mut self, from: NodeId, name: &str) -> Result<(), KernelError> {
        let idx = match self.find(name) {
            Some(idx) => idx,
            None => return Ok(()),
        };
        if !self.lockspaces[idx].members.contains(from) {
            warn!("Node {} is not a member of lockspace '{}'", from, name);
            return Ok(());
        }
        let ls = &mut self.lockspaces[idx];
        ls.leaving.insert(from);
        ls.stopping.remove(from);
        if (self.lockspaces[idx].stopping & self.connected).is_empty() {
            self.commit(idx)?;
        }
        Ok(())
    }

    /// The asynchronous local stop finished. Notify every peer that was
    /// waiting for it; once the lockspace has stopped cluster-wide, move on
    /// to the membership update.
    pub fn stop_completed(&mut self, name: &str, result: std::io::Result<()>) -> Result<(), KernelError> {
        self.in_flight -= 1;
        if let Err(error) = result {
            warn!("Stopping lockspace '{}' failed: {}", name, error);
        }
        let idx = match self.find(name) {
            Some(idx) => idx,
            None => return Ok(()),
        };
        let local = self.local;
        let stopping = self.lockspaces[idx].stopping;
        for node in self.peers() {
            if stopping.contains(node) {
                self.send(node, Notice::Stopped(name.to_owned()));
            }
        }
        {
            let ls = &mut self.lockspaces[idx];
            ls.stopping.remove(local);
            ls.stopped.insert(local);
        }
        if self.all_stopped(idx) {
            self.lockspace_stopped(idx)?;
        }
        Ok(())
    }

    /// An asynchronous lockspace removal finished. Lockspaces are reference
    /// counted in the kernel; keep removing until the minor disappears.
    pub fn release_completed(
        &mut self,
        minor: u32,
        force: bool,
        result: std::io::Result<()>,
    ) -> Result<(), KernelError> {
        self.in_flight -= 1;
        if let Err(error) = result {
            warn!("Releasing lockspace minor {} failed: {}", minor, error);
            return Ok(());
        }
        if self.lockspaces.iter().any(|ls| ls.minor == Some(minor)) {
            self.kernel.submit_release(minor, force)?;
            self.in_flight += 1;
        }
        Ok(())
    }

    /// Begins releasing every lockspace with a known control device, as on
    /// shutdown or when cluster connectivity is lost.
    pub fn release_all(&mut self, force: bool) -> Result<(), KernelError> {
        for idx in 0..self.lockspaces.len() {
            if self.lockspaces[idx].minor.is_some() {
                self.release(idx, force)?;
            }
        }
        Ok(())
    }

    /// Node ids of every configured node other than the local one.
    fn peers(&self) -> Vec<NodeId> {
        let local = self.local;
        self.nodes
            .iter()
            .map(|node| node.id)
            .filter(|id| *id != local)
            .collect()
    }

    /// Asks the kernel to stop the lockspace locally. Stopping can take a
    /// while, so the one-byte write runs asynchronously.
    fn submit_stop(&mut self, idx: usize) -> Result<(), KernelError> {
        let local = self.local;
        let ls = &mut self.lockspaces[idx];
        ls.stopping.insert(local);
        let control = ls
            .control
            .as_ref()
            .ok_or_else(|| KernelError::LockspaceControlMissing(ls.name.clone()))?;
        self.kernel.submit_stop(&ls.name, control)?;
        self.in_flight += 1;
        Ok(())
    }

    /// Asks the kernel to release the lockspace. The removal triggers an
    /// offline uevent which in turn drives the cluster-wide leave.
    fn release(&mut self, idx: usize, force: bool) -> Result<(), KernelError> {
        let ls = &self.lockspaces[idx];
        match ls.minor {
            Some(minor) => {
                self.kernel.submit_release(minor, force)?;
                self.in_flight += 1;
            }
            None => warn!(
                "Cannot release lockspace '{}': no control device seen",
                ls.name,
            ),
        }
        Ok(())
    }

    /// The lockspace has stopped cluster-wide: send the pending local join
    /// or leave request to the peers and update the membership.
    fn lockspace_stopped(&mut self, idx: usize) -> Result<(), KernelError> {
        self.status(idx, "stopped");
        let local = self.local;
        let name = self.lockspaces[idx].name.clone();
        if self.lockspaces[idx].joining.contains(local) {
            for node in self.peers() {
                self.send(node, Notice::Join(name.clone()));
                self.lockspaces[idx].stopped.remove(node);
            }
        }
        if self.lockspaces[idx].leaving.contains(local) {
            for node in self.peers() {
                self.send(node, Notice::Leave(name.clone()));
                self.lockspaces[idx].stopped.remove(node);
            }
        }
        self.commit(idx)
    }

    /// Applies the pending joins and leaves to the cluster configuration and
    /// restarts the lockspace locally. Runs once the lockspace has been
    /// stopped cluster-wide, and completes any pending kernel event.
    ///
    /// When the local node is joining, the whole membership is materialized
    /// in the configuration tree, the new members included; when the local
    /// node is leaving, the whole lockspace configuration is removed; when
    /// the local membership does not change, only the joining nodes are
    /// added and the leaving nodes removed.
    fn commit(&mut self, idx: usize) -> Result<(), KernelError> {
        let local = self.local;
        let local_joining = self.lockspaces[idx].joining.contains(local);
        let local_leaving = self.lockspaces[idx].leaving.contains(local);

        let mut joining = NodeMask::EMPTY;
        let mut leaving = NodeMask::EMPTY;
        {
            let ls = &self.lockspaces[idx];
            if local_joining {
                self.kernel.write_lockspace_id(&ls.name, ls.global_id)?;
                if self.local_nodir {
                    self.kernel.write_nodir(&ls.name)?;
                }
                self.kernel.create_space(&ls.name)?;
                joining = ls.members | ls.joining;
            } else if ls.members.contains(local) {
                joining = ls.joining;
            }
            if local_leaving {
                leaving = ls.members | ls.leaving;
            } else if ls.members.contains(local) {
                leaving = ls.leaving;
            }
            for node in &self.nodes {
                if joining.contains(node.id) {
                    self.kernel.add_space_node(&ls.name, node.id.get(), node.weight)?;
                } else if leaving.contains(node.id) {
                    self.kernel.remove_space_node(&ls.name, node.id.get())?;
                }
            }
        }

        if local_joining {
            self.joined += 1;
        }
        if local_leaving {
            self.joined -= 1;
            self.kernel.remove_space(&self.lockspaces[idx].name)?;
        }

        let ls = &mut self.lockspaces[idx];
        let new_members = (ls.members | ls.joining) & !ls.leaving;
        if new_members.contains(local) {
            // (Re)start the kernel recovery daemon.
            if ls.control.is_none() {
                ls.control = Some(self.kernel.open_lockspace_control(&ls.name)?);
            }
            if let Some(control) = ls.control.as_mut() {
                self.kernel.start_lockspace(&ls.name, control)?;
            }
            ls.stopped.remove(local);
        }
        if local_joining || local_leaving {
            // Complete the lockspace online / offline uevent.
            self.kernel.write_event_done(&ls.name, 0)?;
        }
        ls.members = new_members;
        ls.stopping = NodeMask::EMPTY;
        ls.joining = NodeMask::EMPTY;
        ls.leaving = NodeMask::EMPTY;
        self.status(idx, "updated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lockspace::global_id;
    use fakedlm_kernel::{AsyncCompletion, DlmKernel};
    use fakedlm_testing::kernel::TempDlmTree;

    use tokio::sync::mpsc::{self, error::TryRecvError};

    struct Cluster {
        tree: TempDlmTree,
        membership: Membership,
        notices: mpsc::UnboundedReceiver<(NodeId, Notice)>,
        completions: mpsc::UnboundedReceiver<AsyncCompletion>,
    }

    fn cluster(count: u32, local: u32) -> Cluster {
        let tree = TempDlmTree::new();
        let (completion_tx, completions) = mpsc::unbounded_channel();
        let kernel = Arc::new(DlmKernel::new(tree.paths(), completion_tx));
        let (notice_tx, notices) = mpsc::unbounded_channel();
        let nodes = (1..=count)
            .map(|n| MemberNode {
                id: NodeId::new(n),
                weight: 1,
            })
            .collect();
        let membership = Membership::new(NodeId::new(local), false, nodes, kernel, notice_tx);
        Cluster {
            tree,
            membership,
            notices,
            completions,
        }
    }

    fn id(n: u32) -> NodeId {
        NodeId::new(n)
    }

    impl Cluster {
        fn connect_all(&mut self) {
            for node in self.membership.all_nodes().iter() {
                self.membership.peer_connected(node);
            }
        }

        fn drain_notices(&mut self) -> Vec<(NodeId, Notice)> {
            let mut notices = Vec::new();
            while let Ok(notice) = self.notices.try_recv() {
                notices.push(notice);
            }
            notices
        }

        fn no_notices(&mut self) -> bool {
            matches!(self.notices.try_recv(), Err(TryRecvError::Empty))
        }

        async fn completion(&mut self) -> AsyncCompletion {
            self.completions.recv().await.unwrap()
        }

        /// Drives the local node into `name` with every peer already
        /// acknowledged, as after scenario S1.
        async fn join(&mut self, name: &str) {
            self.tree.add_lockspace(name);
            self.membership.local_online(name).unwrap();
            let peers: Vec<NodeId> = {
                let local = self.membership.local();
                self.membership
                    .all_nodes()
                    .iter()
                    .filter(|id| *id != local)
                    .collect()
            };
            for peer in &peers {
                self.membership.peer_stopped(*peer, name).unwrap();
            }
            self.drain_notices();
        }
    }

    fn stop(name: &str) -> Notice {
        Notice::Stop(name.to_owned())
    }

    #[tokio::test]
    async fn online_is_refused_while_not_fully_connected() {
        let mut c = cluster(3, 1);
        c.tree.add_lockspace("ls1");
        c.membership.local_online("ls1").unwrap();

        assert_eq!(c.tree.lockspace_attr("ls1", "event_done"), "16");
        let ls = c.membership.lockspace("ls1").unwrap();
        assert!(ls.joining.is_empty());
        assert!(ls.members.is_empty());
        assert_eq!(ls.stopped, id(1).mask());
        assert!(c.no_notices());
        assert_eq!(c.membership.joined_lockspaces(), 0);
    }

    #[tokio::test]
    async fn single_node_online_commits_immediately() {
        let mut c = cluster(1, 1);
        c.tree.add_lockspace("ls1");
        c.membership.local_online("ls1").unwrap();

        let ls = c.membership.lockspace("ls1").unwrap();
        assert_eq!(ls.members, id(1).mask());
        assert!(ls.stopped.is_empty());
        assert_eq!(c.membership.joined_lockspaces(), 1);
        assert_eq!(c.tree.lockspace_attr("ls1", "event_done"), "0");
        assert!(c.tree.lockspace_attr("ls1", "control").ends_with('1'));
        assert_eq!(
            c.tree.lockspace_attr("ls1", "id"),
            global_id("ls1").to_string(),
        );
        let nodeid = c.tree.cluster_dir().join("spaces/ls1/nodes/1/nodeid");
        assert_eq!(std::fs::read_to_string(nodeid).unwrap(), "1");
        assert!(c.no_notices());
    }

    #[tokio::test]
    async fn three_node_join_round() {
        let mut c = cluster(3, 1);
        c.connect_all();
        c.tree.add_lockspace("ls1");

        c.membership.local_online("ls1").unwrap();
        assert_eq!(
            c.drain_notices(),
            vec![(id(2), stop("ls1")), (id(3), stop("ls1"))],
        );

        c.membership.peer_stopped(id(2), "ls1").unwrap();
        assert!(c.no_notices());

        c.membership.peer_stopped(id(3), "ls1").unwrap();
        assert_eq!(
            c.drain_notices(),
            vec![
                (id(2), Notice::Join("ls1".into())),
                (id(3), Notice::Join("ls1".into())),
            ],
        );

        let ls = c.membership.lockspace("ls1").unwrap();
        assert_eq!(ls.members, id(1).mask());
        assert!(ls.joining.is_empty());
        assert!(ls.leaving.is_empty());
        assert!(ls.stopping.is_empty());
        assert_eq!(c.membership.joined_lockspaces(), 1);
        assert_eq!(c.tree.lockspace_attr("ls1", "event_done"), "0");
    }

    #[tokio::test]
    async fn remote_stop_of_an_unknown_lockspace_replies_immediately() {
        let mut c = cluster(3, 2);
        c.connect_all();

        c.membership.peer_stop(id(1), "ls1").unwrap();
        assert_eq!(
            c.drain_notices(),
            vec![(id(1), Notice::Stopped("ls1".into()))],
        );
        // A fresh lockspace is already stopped locally: no kernel write.
        assert_eq!(c.membership.outstanding_requests(), 0);

        c.membership.peer_join(id(1), "ls1").unwrap();
        let ls = c.membership.lockspace("ls1").unwrap();
        assert_eq!(ls.members, id(1).mask());
        assert_eq!(c.membership.joined_lockspaces(), 0);
    }

    #[tokio::test]
    async fn repeated_online_completes_the_event_and_nothing_else() {
        let mut c = cluster(1, 1);
        c.join("ls1").await;
        let members = c.membership.lockspace("ls1").unwrap().members;

        c.membership.local_online("ls1").unwrap();
        assert_eq!(c.tree.lockspace_attr("ls1", "event_done"), "0");
        assert_eq!(c.membership.lockspace("ls1").unwrap().members, members);
        assert_eq!(c.membership.joined_lockspaces(), 1);
        assert!(c.no_notices());
    }

    #[tokio::test]
    async fn concurrent_stops_issue_one_kernel_write() {
        let mut c = cluster(3, 1);
        c.connect_all();
        c.join("ls1").await;

        c.membership.peer_stop(id(2), "ls1").unwrap();
        assert_eq!(c.membership.outstanding_requests(), 1);
        c.membership.peer_stop(id(3), "ls1").unwrap();
        assert_eq!(c.membership.outstanding_requests(), 1);

        match c.completion().await {
            AsyncCompletion::StopWrite { lockspace, result } => {
                assert_eq!(lockspace, "ls1");
                result.unwrap();
            }
            other => panic!("unexpected completion: {:?}", other),
        }
        assert!(matches!(c.completions.try_recv(), Err(TryRecvError::Empty)));
        assert!(c.tree.lockspace_attr("ls1", "control").ends_with('0'));

        c.membership.stop_completed("ls1", Ok(())).unwrap();
        assert_eq!(c.membership.outstanding_requests(), 0);
        assert_eq!(
            c.drain_notices(),
            vec![
                (id(2), Notice::Stopped("ls1".into())),
                (id(3), Notice::Stopped("ls1".into())),
            ],
        );
        let ls = c.membership.lockspace("ls1").unwrap();
        assert_eq!(ls.stopping, id(2).mask() | id(3).mask());
        assert!(ls.stopped.contains(id(1)));
    }

    #[tokio::test]
    async fn peer_join_into_a_held_lockspace() {
        let mut c = cluster(2, 1);
        c.connect_all();
        c.join("ls1").await;

        c.membership.peer_stop(id(2), "ls1").unwrap();
        c.completion().await;
        c.membership.stop_completed("ls1", Ok(())).unwrap();
        c.drain_notices();

        c.membership.peer_join(id(2), "ls1").unwrap();
        let ls = c.membership.lockspace("ls1").unwrap();
        assert_eq!(ls.members, id(1).mask() | id(2).mask());
        let nodeid = c.tree.cluster_dir().join("spaces/ls1/nodes/2/nodeid");
        assert_eq!(std::fs::read_to_string(nodeid).unwrap(), "2");
        // Restarted locally after the membership change.
        assert!(c.tree.lockspace_attr("ls1", "control").ends_with('1'));
    }

    #[tokio::test]
    async fn duplicate_joins_and_unknown_leaves_are_dropped() {
        let mut c = cluster(2, 1);
        c.connect_all();
        c.join("ls1").await;

        c.membership.peer_stop(id(2), "ls1").unwrap();
        c.completion().await;
        c.membership.stop_completed("ls1", Ok(())).unwrap();
        c.membership.peer_join(id(2), "ls1").unwrap();
        let members = c.membership.lockspace("ls1").unwrap().members;

        // A join from an existing member and a leave from a non-member are
        // protocol noise.
        c.membership.peer_join(id(2), "ls1").unwrap();
        assert_eq!(c.membership.lockspace("ls1").unwrap().members, members);
        c.membership.peer_leave(id(2), "nonexistent").unwrap();
        assert!(c.membership.lockspace("nonexistent").is_none());
    }

    #[tokio::test]
    async fn losing_a_peer_tears_down_held_lockspaces() {
        let mut c = cluster(2, 1);
        c.connect_all();
        c.join("ls1").await;
        c.membership.device_added("ls1", 7);

        // Peer 2 joins.
        c.membership.peer_stop(id(2), "ls1").unwrap();
        c.completion().await;
        c.membership.stop_completed("ls1", Ok(())).unwrap();
        c.membership.peer_join(id(2), "ls1").unwrap();
        c.drain_notices();
        assert_eq!(
            c.membership.lockspace("ls1").unwrap().members,
            id(1).mask() | id(2).mask(),
        );

        // The canonical connection to peer 2 dies.
        c.membership.peer_lost(id(2)).unwrap();

        let ls = c.membership.lockspace("ls1").unwrap();
        assert_eq!(ls.members, id(1).mask());
        assert!(ls.joining.is_empty());
        assert!(ls.leaving.is_empty());
        assert!(!c.tree.cluster_dir().join("spaces/ls1/nodes/2").exists());

        // A forced release goes out and is repeated while the kernel still
        // holds references.
        match c.completion().await {
            AsyncCompletion::Release {
                minor,
                force,
                result,
            } => {
                assert_eq!(minor, 7);
                assert!(force);
                result.unwrap();
            }
            other => panic!("unexpected completion: {:?}", other),
        }
        c.membership.release_completed(7, true, Ok(())).unwrap();
        assert_eq!(c.membership.outstanding_requests(), 1);
        c.completion().await;

        // The removal triggers the offline uevent; the local node leaves.
        c.membership.local_offline("ls1").unwrap();
        assert_eq!(c.membership.joined_lockspaces(), 0);
        assert!(c.membership.lockspace("ls1").unwrap().members.is_empty());
        assert!(!c.tree.cluster_dir().join("spaces/ls1").exists());
        assert_eq!(c.tree.lockspace_attr("ls1", "event_done"), "0");

        // With the minor forgotten, the release is not resubmitted.
        c.membership.release_completed(7, true, Ok(())).unwrap();
        assert_eq!(c.membership.outstanding_requests(), 0);
    }

    #[tokio::test]
    async fn two_nodes_joining_at_once_converge() {
        let mut c = cluster(2, 1);
        c.connect_all();
        c.tree.add_lockspace("ls1");

        // Both sides initiate a join for the same name at the same time.
        c.membership.local_online("ls1").unwrap();
        c.membership.peer_stop(id(2), "ls1").unwrap();
        // We have not started the lockspace yet, so the peer's stop request
        // is acknowledged without a kernel write.
        assert_eq!(
            c.drain_notices(),
            vec![
                (id(2), Notice::Stop("ls1".into())),
                (id(2), Notice::Stopped("ls1".into())),
            ],
        );
        assert_eq!(c.membership.outstanding_requests(), 0);

        // Once the lockspace is stopped everywhere, our join commits even
        // though the peer's own join is still in flight; it lands in a
        // second commit.
        c.membership.peer_stopped(id(2), "ls1").unwrap();
        assert_eq!(c.drain_notices(), vec![(id(2), Notice::Join("ls1".into()))]);
        assert_eq!(c.membership.lockspace("ls1").unwrap().members, id(1).mask());

        c.membership.peer_join(id(2), "ls1").unwrap();
        assert_eq!(
            c.membership.lockspace("ls1").unwrap().members,
            id(1).mask() | id(2).mask(),
        );
        assert_eq!(c.membership.joined_lockspaces(), 1);
    }

    #[tokio::test]
    async fn offline_without_membership_is_a_no_op() {
        let mut c = cluster(2, 1);
        c.connect_all();
        c.membership.local_offline("ls1").unwrap();
        assert!(c.membership.lockspace("ls1").is_none());
        assert!(c.no_notices());
    }

    #[tokio::test]
    async fn masks_stay_disjoint_across_a_full_round() {
        let mut c = cluster(3, 1);
        c.connect_all();
        c.tree.add_lockspace("ls1");
        c.membership.local_online("ls1").unwrap();
        c.membership.peer_stopped(id(2), "ls1").unwrap();
        c.membership.peer_stopped(id(3), "ls1").unwrap();
        c.drain_notices();

        let ls = c.membership.lockspace("ls1").unwrap();
        assert!((ls.joining & ls.leaving).is_empty());
        assert!(c.membership.all_nodes().contains_all(ls.members));
        assert!(ls.stopped.contains(id(1)) || ls.members.contains(id(1)));
    }
}

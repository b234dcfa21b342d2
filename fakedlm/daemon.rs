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

use fakedlm_errors::NetworkError;
use fakedlm_kernel::{
    listen_to_uevents, modprobe, AsyncCompletion, CommsNode, DlmKernel, DlmPaths, Uevent,
    UeventListener,
};
use fakedlm_membership::{Membership, NodeId, NodeMask, Notice};
use fakedlm_network::{
    Environment, Message, NodeRegistry, Transport, TransportEvent, DEFAULT_DLM_PORT,
};

use anyhow::Result;
use std::{net::SocketAddr, sync::Arc};
use tokio::{
    signal::unix::{signal, Signal, SignalKind},
    sync::mpsc,
};

/// What woke the daemon loop up.
enum Wakeup {
    Completion(AsyncCompletion),
    Transport(TransportEvent),
    Uevent(Uevent),
    Shutdown,
}

/// The FakeDLM control daemon: one state-owning loop fed by the peer
/// transport, the kernel uevent listener, asynchronous kernel write
/// completions, and the shutdown signals. Every handler runs to completion
/// before the next event is taken.
pub struct Daemon {
    environment: Environment,
    registry: NodeRegistry,
    kernel: Arc<DlmKernel>,
    membership: Membership,
    transport: Transport,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    uevent_sender: mpsc::UnboundedSender<Uevent>,
    uevents: mpsc::UnboundedReceiver<Uevent>,
    uevent_listener: Option<UeventListener>,
    completions: mpsc::UnboundedReceiver<AsyncCompletion>,
    notices: mpsc::UnboundedReceiver<(NodeId, Notice)>,
    sigint: Signal,
    sigterm: Signal,
    shut_down: u32,
}

impl Daemon {
    /// Resolves the node registry and assembles the daemon. No sockets or
    /// kernel interfaces are touched until [`Daemon::run`].
    pub async fn new(environment: Environment, paths: DlmPaths) -> Result<Self> {
        let registry = NodeRegistry::resolve(&environment).await?;
        let local = registry.local();
        info!("Local node is {} (node id {})", local.name, local.id);

        let (completion_sender, completions) = mpsc::unbounded_channel();
        let kernel = Arc::new(DlmKernel::new(paths, completion_sender));

        let (notice_sender, notices) = mpsc::unbounded_channel();
        let membership = Membership::new(
            local.id,
            local.nodir,
            registry.member_nodes(),
            kernel.clone(),
            notice_sender,
        );

        let (transport_sender, transport_events) = mpsc::unbounded_channel();
        let transport = Transport::new(
            registry.clone(),
            environment.fakedlm_port(),
            transport_sender,
        );

        let (uevent_sender, uevents) = mpsc::unbounded_channel();

        Ok(Self {
            environment,
            registry,
            kernel,
            membership,
            transport,
            transport_events,
            uevent_sender,
            uevents,
            uevent_listener: None,
            completions,
            notices,
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
            shut_down: 0,
        })
    }

    /// Brings up the transport and the kernel interfaces, runs the event
    /// loop until shutdown, and removes the DLM configuration again.
    pub async fn run(&mut self) -> Result<()> {
        self.transport.start()?;
        self.kernel.monitor_kernel().await?;
        self.uevent_listener = Some(listen_to_uevents(self.uevent_sender.clone())?);
        self.configure_dlm().await?;
        let result = self.event_loop().await;
        self.remove_dlm().await?;
        result
    }

    async fn configure_dlm(&self) -> Result<()> {
        let local = self.registry.local_id();
        let nodes: Vec<CommsNode> = self
            .registry
            .nodes()
            .iter()
            .map(|node| CommsNode {
                nodeid: node.id.get(),
                local: node.id == local,
                addrs: node
                    .addrs
                    .iter()
                    .map(|ip| SocketAddr::new(*ip, 0))
                    .collect(),
            })
            .collect();
        let tcp_port =
            Some(self.environment.dlm_port()).filter(|port| *port != DEFAULT_DLM_PORT);
        let protocol =
            Some(self.environment.protocol().config_byte()).filter(|byte| *byte != 0);
        self.kernel
            .configure(self.environment.cluster_name(), tcp_port, protocol, &nodes)
            .await?;
        Ok(())
    }

    async fn remove_dlm(&mut self) -> Result<()> {
        let node_ids: Vec<u32> = self.registry.nodes().iter().map(|node| node.id.get()).collect();
        self.kernel.remove_config(&node_ids)?;
        self.kernel.close_devices();
        if let Some(listener) = self.uevent_listener.take() {
            listener.shutdown();
        }
        modprobe::rmmod("dlm").await;
        Ok(())
    }

    async fn event_loop(&mut self) -> Result<()> {
        let mut old_connected = NodeMask::EMPTY;
        let mut old_shut_down = 0;
        loop {
            let connected = self.membership.connected();
            if connected != old_connected {
                debug!("Connected nodes {}", connected);
                if connected == self.membership.all_nodes() {
                    info!("DLM ready");
                } else if old_connected == self.membership.all_nodes() {
                    info!("DLM not ready");
                }
                old_connected = connected;
            }

            if self.shut_down != old_shut_down {
                match self.shut_down {
                    1 => info!("Shutting down (press ^C to enforce)"),
                    2 => info!("Shutting down"),
                    _ => info!("Aborting"),
                }
                self.transport.close_all();
                if self.membership.joined_lockspaces() > 0 && self.shut_down <= 2 {
                    self.membership.release_all(self.shut_down > 1)?;
                } else {
                    break;
                }
                old_shut_down = self.shut_down;
                continue;
            }

            if old_shut_down > 0
                && self.membership.joined_lockspaces() == 0
                && self.membership.outstanding_requests() == 0
            {
                break;
            }

            // Drain finished asynchronous writes before sleeping again,
            // then re-evaluate the loop conditions.
            let mut drained = false;
            while let Ok(completion) = self.completions.try_recv() {
                self.handle_completion(completion)?;
                drained = true;
            }
            if drained {
                self.flush_notices();
                continue;
            }

            let wakeup = tokio::select! {
                biased;
                Some(completion) = self.completions.recv() => Wakeup::Completion(completion),
                Some(event) = self.transport_events.recv() => Wakeup::Transport(event),
                Some(uevent) = self.uevents.recv() => Wakeup::Uevent(uevent),
                _ = self.sigint.recv() => Wakeup::Shutdown,
                _ = self.sigterm.recv() => Wakeup::Shutdown,
            };
            match wakeup {
                Wakeup::Completion(completion) => self.handle_completion(completion)?,
                Wakeup::Transport(event) => self.handle_transport_event(event)?,
                Wakeup::Uevent(uevent) => self.handle_uevent(uevent)?,
                Wakeup::Shutdown => self.shut_down += 1,
            }
            self.flush_notices();
        }
        Ok(())
    }

    /// Forwards the state machine's outbound notices to the transport.
    fn flush_notices(&mut self) {
        while let Ok((node, notice)) = self.notices.try_recv() {
            self.transport.send(node, notice.into());
        }
    }

    fn handle_completion(&mut self, completion: AsyncCompletion) -> Result<()> {
        match completion {
            AsyncCompletion::StopWrite { lockspace, result } => {
                self.membership.stop_completed(&lockspace, result)?;
            }
            AsyncCompletion::Release {
                minor,
                force,
                result,
            } => {
                self.membership.release_completed(minor, force, result)?;
            }
        }
        Ok(())
    }

    fn handle_transport_event(&mut self, event: TransportEvent) -> Result<()> {
        match event {
            TransportEvent::Accepted { stream, addr } => {
                match self.transport.accept_connection(stream, addr) {
                    Ok(node) => self.membership.peer_connected(node),
                    Err(error) => warn!("{}", error),
                }
            }
            TransportEvent::ConnectFinished { node, result } => {
                if self.transport.connect_finished(node, result) {
                    self.membership.peer_connected(node);
                }
            }
            TransportEvent::MessageReceived {
                node,
                conn_id,
                message,
            } => {
                debug!("< {} {}", node, message);
                match message {
                    Message::Close => {
                        if self.transport.close_received(node, conn_id) {
                            self.membership.peer_lost(node)?;
                        }
                    }
                    Message::StopLockspace(name) => self.membership.peer_stop(node, &name)?,
                    Message::LockspaceStopped(name) => {
                        self.membership.peer_stopped(node, &name)?
                    }
                    Message::JoinLockspace(name) => self.membership.peer_join(node, &name)?,
                    Message::LeaveLockspace(name) => self.membership.peer_leave(node, &name)?,
                }
            }
            TransportEvent::ConnectionFailed { node, conn_id } => {
                if self.transport.connection_failed(node, conn_id) {
                    self.membership.peer_lost(node)?;
                }
            }
            TransportEvent::ProtocolError { node, type_id } => {
                return Err(NetworkError::FatalProtocol(type_id, node.get()).into());
            }
        }
        Ok(())
    }

    fn handle_uevent(&mut self, uevent: Uevent) -> Result<()> {
        match uevent {
            Uevent::Online(name) => self.membership.local_online(&name)?,
            Uevent::Offline(name) => self.membership.local_offline(&name)?,
            Uevent::DeviceAdded { name, minor } => {
                if let Some(minor) = minor {
                    self.membership.device_added(&name, minor);
                }
            }
        }
        Ok(())
    }
}

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
use fakedlm_membership::MAX_NODES;

use std::collections::HashMap;

/// The port peers connect to each other on.
pub const DEFAULT_FAKEDLM_PORT: u16 = 21066;
/// The port the kernel DLM itself uses; only written to the configuration
/// when it differs from this default.
pub const DEFAULT_DLM_PORT: u16 = 21064;

/// The transport the kernel DLM uses between nodes, encoded as a single
/// byte in the cluster configuration.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DlmProtocol {
    Tcp,
    Sctp,
}

impl DlmProtocol {
    pub fn config_byte(self) -> u8 {
        match self {
            DlmProtocol::Tcp => 0,
            DlmProtocol::Sctp => 1,
        }
    }
}

/// Optional per-node attributes settable through the configuration file.
#[derive(Clone, Copy, Debug)]
pub struct NodeTuning {
    pub weight: u32,
    pub nodir: bool,
}

impl Default for NodeTuning {
    fn default() -> Self {
        Self {
            weight: 1,
            nodir: false,
        }
    }
}

/// A core data structure containing the cluster parameters of this daemon.
#[derive(Clone, Debug)]
pub struct Environment {
    /// The node names in startup order; the position assigns the node id.
    /// A literal `-` skips a position while still consuming its id.
    node_names: Vec<String>,
    cluster_name: Option<String>,
    fakedlm_port: u16,
    dlm_port: u16,
    protocol: DlmProtocol,
    tuning: HashMap<String, NodeTuning>,
}

impl Environment {
    pub fn new(
        node_names: Vec<String>,
        cluster_name: Option<String>,
        fakedlm_port: u16,
        dlm_port: u16,
        protocol: DlmProtocol,
        tuning: HashMap<String, NodeTuning>,
    ) -> Result<Self, NetworkError> {
        if node_names.iter().all(|name| name == "-") {
            return Err(NetworkError::NoNodes);
        }
        if node_names.len() > MAX_NODES {
            return Err(NetworkError::TooManyNodes(node_names.len(), MAX_NODES));
        }

        Ok(Self {
            node_names,
            cluster_name,
            fakedlm_port,
            dlm_port,
            protocol,
            tuning,
        })
    }

    #[inline]
    pub fn node_names(&self) -> &[String] {
        &self.node_names
    }

    #[inline]
    pub fn cluster_name(&self) -> Option<&str> {
        self.cluster_name.as_deref()
    }

    #[inline]
    pub fn fakedlm_port(&self) -> u16 {
        self.fakedlm_port
    }

    #[inline]
    pub fn dlm_port(&self) -> u16 {
        self.dlm_port
    }

    #[inline]
    pub fn protocol(&self) -> DlmProtocol {
        self.protocol
    }

    /// Returns the tuning for a node, or the defaults if none was given.
    pub fn node_tuning(&self, name: &str) -> NodeTuning {
        self.tuning.get(name).copied().unwrap_or_default()
    }
}

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

use crate::message::MessageError;

use std::net::IpAddr;
use thiserror::Error;

/// Errors in the node registry and the peer transport.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Message(#[from] MessageError),

    #[error("node {0}: no usable network address")]
    NoAddresses(String),

    #[error("none of the configured nodes has a local network address")]
    NoLocalNode,

    #[error("nodes {0} and {1} are both local")]
    DuplicateLocalNode(String, String),

    #[error("could not determine the node id for a connection from {0}")]
    UnknownPeerAddress(IpAddr),

    #[error("{0} nodes configured, at most {1} supported")]
    TooManyNodes(usize, usize),

    #[error("no nodes configured")]
    NoNodes,

    #[error("unknown message type {0} received from node {1}")]
    FatalProtocol(u16, u32),
}

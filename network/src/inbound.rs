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

use crate::message::{Message, MESSAGE_LEN};
use fakedlm_errors::NetworkError;
use fakedlm_membership::NodeId;

use tokio::{io::AsyncReadExt, net::tcp::OwnedReadHalf};

/// The reading half of one peer connection. Messages are read as whole
/// records; a short read means the connection failed.
pub struct ConnReader {
    pub node: NodeId,
    pub conn_id: u64,
    reader: OwnedReadHalf,
    buffer: [u8; MESSAGE_LEN],
}

impl ConnReader {
    pub fn new(node: NodeId, conn_id: u64, reader: OwnedReadHalf) -> Self {
        Self {
            node,
            conn_id,
            reader,
            buffer: [0u8; MESSAGE_LEN],
        }
    }

    /// Reads one framed record from the connection.
    pub async fn read_message(&mut self) -> Result<Message, NetworkError> {
        self.reader.read_exact(&mut self.buffer).await?;
        Ok(Message::deserialize(&self.buffer)?)
    }
}

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

use crate::message::Message;
use fakedlm_errors::NetworkError;
use fakedlm_membership::NodeId;

use tokio::{io::AsyncWriteExt, net::tcp::OwnedWriteHalf};

/// The writing half of one peer connection. Messages are written as whole
/// records; a failed write means the connection failed.
pub struct ConnWriter {
    pub node: NodeId,
    pub conn_id: u64,
    writer: OwnedWriteHalf,
}

impl ConnWriter {
    pub fn new(node: NodeId, conn_id: u64, writer: OwnedWriteHalf) -> Self {
        Self {
            node,
            conn_id,
            writer,
        }
    }

    /// Writes one framed record to the connection.
    pub async fn write_message(&mut self, message: &Message) -> Result<(), NetworkError> {
        let buffer = message.serialize()?;
        self.writer.write_all(&buffer).await?;
        Ok(())
    }
}

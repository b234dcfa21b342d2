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

use thiserror::Error;

/// Errors in the framing and decoding of peer protocol records.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("lockspace name of {0} bytes exceeds the kernel limit")]
    NameTooLong(usize),

    #[error("lockspace name is not a valid NUL-padded string")]
    InvalidName,

    #[error("unknown message type {0}")]
    UnknownType(u16),
}

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

use fakedlm_errors::MessageError;
use fakedlm_membership::Notice;

use byteorder::{BigEndian, ByteOrder};
use std::fmt;

/// The kernel's fixed lockspace name limit; names on the wire are
/// NUL-padded to this length.
pub const LOCKSPACE_NAME_LEN: usize = 64;

/// Every protocol message is one fixed-size record: a big-endian type
/// followed by the padded lockspace name.
pub const MESSAGE_LEN: usize = 2 + LOCKSPACE_NAME_LEN;

const MSG_CLOSE: u16 = 1;
const MSG_STOP_LOCKSPACE: u16 = 2;
const MSG_LOCKSPACE_STOPPED: u16 = 3;
const MSG_JOIN_LOCKSPACE: u16 = 4;
const MSG_LEAVE_LOCKSPACE: u16 = 5;

/// The node coordination protocol, independent from DLM's internal
/// protocol.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Message {
    /// The recipient closes the connection this arrived on; the sender has
    /// switched the pair to the other socket.
    Close,
    /// Stop the named lockspace on the receiving node on behalf of the
    /// sender. This takes a "lock" on the lockspace that the sender's join
    /// or leave releases.
    StopLockspace(String),
    /// The named lockspace has been stopped on the sending node.
    LockspaceStopped(String),
    /// The sender requests to join the named lockspace.
    JoinLockspace(String),
    /// The sender requests to leave the named lockspace.
    LeaveLockspace(String),
}

impl Message {
    pub fn name(&self) -> &'static str {
        match self {
            Message::Close => "CLOSE",
            Message::StopLockspace(_) => "STOP_LOCKSPACE",
            Message::LockspaceStopped(_) => "LOCKSPACE_STOPPED",
            Message::JoinLockspace(_) => "JOIN_LOCKSPACE",
            Message::LeaveLockspace(_) => "LEAVE_LOCKSPACE",
        }
    }

    pub fn lockspace(&self) -> Option<&str> {
        match self {
            Message::Close => None,
            Message::StopLockspace(name)
            | Message::LockspaceStopped(name)
            | Message::JoinLockspace(name)
            | Message::LeaveLockspace(name) => Some(name),
        }
    }

    fn type_id(&self) -> u16 {
        match self {
            Message::Close => MSG_CLOSE,
            Message::StopLockspace(_) => MSG_STOP_LOCKSPACE,
            Message::LockspaceStopped(_) => MSG_LOCKSPACE_STOPPED,
            Message::JoinLockspace(_) => MSG_JOIN_LOCKSPACE,
            Message::LeaveLockspace(_) => MSG_LEAVE_LOCKSPACE,
        }
    }

    pub fn serialize(&self) -> Result<[u8; MESSAGE_LEN], MessageError> {
        let mut buffer = [0u8; MESSAGE_LEN];
        BigEndian::write_u16(&mut buffer[0..2], self.type_id());
        if let Some(name) = self.lockspace() {
            let bytes = name.as_bytes();
            if bytes.len() > LOCKSPACE_NAME_LEN {
                return Err(MessageError::NameTooLong(bytes.len()));
            }
            if bytes.contains(&0) {
                return Err(MessageError::InvalidName);
            }
            buffer[2..2 + bytes.len()].copy_from_slice(bytes);
        }
        Ok(buffer)
    }

    pub fn deserialize(buffer: &[u8; MESSAGE_LEN]) -> Result<Self, MessageError> {
        let type_id = BigEndian::read_u16(&buffer[0..2]);
        let lockspace_name = || {
            let raw = &buffer[2..];
            let len = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
            std::str::from_utf8(&raw[..len])
                .map(str::to_owned)
                .map_err(|_| MessageError::InvalidName)
        };
        match type_id {
            MSG_CLOSE => Ok(Message::Close),
            MSG_STOP_LOCKSPACE => Ok(Message::StopLockspace(lockspace_name()?)),
            MSG_LOCKSPACE_STOPPED => Ok(Message::LockspaceStopped(lockspace_name()?)),
            MSG_JOIN_LOCKSPACE => Ok(Message::JoinLockspace(lockspace_name()?)),
            MSG_LEAVE_LOCKSPACE => Ok(Message::LeaveLockspace(lockspace_name()?)),
            unknown => Err(MessageError::UnknownType(unknown)),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.lockspace() {
            Some(name) => write!(f, "{} {}", self.name(), name),
            None => write!(f, "{}", self.name()),
        }
    }
}

impl From<Notice> for Message {
    fn from(notice: Notice) -> Self {
        match notice {
            Notice::Stop(name) => Message::StopLockspace(name),
            Notice::Stopped(name) => Message::LockspaceStopped(name),
            Notice::Join(name) => Message::JoinLockspace(name),
            Notice::Leave(name) => Message::LeaveLockspace(name),
        }
    }
}

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

use crate::mask::{NodeId, NodeMask};

use std::fs::File;

/// The CRC variant used by corosync for group names: the reversed polynomial,
/// an initial state of 0, and no final inversion. Every node must derive the
/// same id for the same name, so the variant is fixed.
const fn crc32_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut n = 0;
    while n < 256 {
        let mut crc = n as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xedb8_8320
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[n] = crc;
        n += 1;
    }
    table
}

static CRC32_TABLE: [u32; 256] = crc32_table();

fn group_name_crc(data: &[u8]) -> u32 {
    let mut crc = 0u32;
    for &byte in data {
        crc = CRC32_TABLE[((crc ^ byte as u32) & 0xff) as usize] ^ (crc >> 8);
    }
    crc
}

/// Derives the stable 32-bit global identifier of a lockspace from its name.
/// The hashed byte sequence is `"dlm:ls:" + name` including the trailing NUL.
pub fn global_id(name: &str) -> u32 {
    let mut full_name = Vec::with_capacity(name.len() + 8);
    full_name.extend_from_slice(b"dlm:ls:");
    full_name.extend_from_slice(name.as_bytes());
    full_name.push(0);
    group_name_crc(&full_name)
}

/// One named distributed lock domain and everything the daemon tracks for it.
///
/// The five masks encode the membership protocol:
/// - `members`: currently committed members.
/// - `stopping`: peers that requested a stop and have not been told "stopped"
///   yet; the local bit means a kernel stop is in flight.
/// - `stopped`: peers known to be stopped; the local bit means the lockspace
///   is stopped locally. New lockspaces start out stopped.
/// - `joining` / `leaving`: nodes that will join or leave at the next commit.
#[derive(Debug)]
pub struct Lockspace {
    pub name: String,
    pub global_id: u32,
    /// The minor device number the kernel assigned to the lockspace's
    /// control device, once the add uevent has been seen.
    pub minor: Option<u32>,
    /// The per-lockspace sysfs control file, lazily opened on the first
    /// commit that makes the local node a member and closed on leave.
    pub control: Option<File>,
    pub members: NodeMask,
    pub stopping: NodeMask,
    pub stopped: NodeMask,
    pub joining: NodeMask,
    pub leaving: NodeMask,
}

impl Lockspace {
    /// Creates the record for a newly seen lockspace name. The kernel treats
    /// a freshly created lockspace as not yet started, so the local node
    /// starts out stopped.
    pub fn new(name: &str, local: NodeId) -> Self {
        Self {
            name: name.to_owned(),
            global_id: global_id(name),
            minor: None,
            control: None,
            members: NodeMask::EMPTY,
            stopping: NodeMask::EMPTY,
            stopped: local.mask(),
            joining: NodeMask::EMPTY,
            leaving: NodeMask::EMPTY,
        }
    }
}

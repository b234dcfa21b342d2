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

//! The fixed-layout records written to the DLM control device.

use byteorder::{ByteOrder, NativeEndian};

pub const DLM_DEVICE_VERSION_MAJOR: u32 = 6;
pub const DLM_DEVICE_VERSION_MINOR: u32 = 0;
pub const DLM_DEVICE_VERSION_PATCH: u32 = 2;

const DLM_USER_CREATE_LOCKSPACE: u8 = 4;
const DLM_USER_REMOVE_LOCKSPACE: u8 = 5;

/// Forces the removal of a lockspace that still has active locks.
pub const DLM_USER_LSFLG_FORCEFREE: u32 = 2;

/// The lock parameter member of the request union, modeled only for its
/// size: the kernel rejects writes shorter than the full request record.
#[allow(dead_code)]
#[repr(C)]
struct LockParams {
    mode: u8,
    namelen: u8,
    pad: u16,
    flags: u32,
    lkid: u32,
    parent: u32,
    xid: u64,
    timeout: u64,
    castparam: usize,
    castaddr: usize,
    bastparam: usize,
    bastaddr: usize,
    lksb: usize,
    lvb: [u8; 32],
}

/// version[3], cmd, is64bit, unused[2].
const HEADER_LEN: usize = 16;
const LSPACE_FLAGS_OFFSET: usize = HEADER_LEN;
const LSPACE_MINOR_OFFSET: usize = HEADER_LEN + 4;
const LSPACE_NAME_OFFSET: usize = HEADER_LEN + 8;

/// The full record length, header plus the largest union member.
pub const WRITE_REQUEST_LEN: usize = HEADER_LEN + std::mem::size_of::<LockParams>();

fn request_header(cmd: u8, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    NativeEndian::write_u32(&mut buf[0..4], DLM_DEVICE_VERSION_MAJOR);
    NativeEndian::write_u32(&mut buf[4..8], DLM_DEVICE_VERSION_MINOR);
    NativeEndian::write_u32(&mut buf[8..12], DLM_DEVICE_VERSION_PATCH);
    buf[12] = cmd;
    buf[13] = cfg!(target_pointer_width = "64") as u8;
    buf
}

/// Builds a request asking the kernel to create a lockspace; the name
/// follows the fixed record.
pub fn create_lockspace_request(name: &str) -> Vec<u8> {
    let mut buf = request_header(DLM_USER_CREATE_LOCKSPACE, WRITE_REQUEST_LEN + name.len());
    buf[LSPACE_NAME_OFFSET..LSPACE_NAME_OFFSET + name.len()].copy_from_slice(name.as_bytes());
    buf
}

/// Builds a request asking the kernel to drop one reference to the
/// lockspace behind the given minor device number.
pub fn remove_lockspace_request(minor: u32, flags: u32) -> Vec<u8> {
    let mut buf = request_header(DLM_USER_REMOVE_LOCKSPACE, WRITE_REQUEST_LEN);
    NativeEndian::write_u32(&mut buf[LSPACE_FLAGS_OFFSET..LSPACE_FLAGS_OFFSET + 4], flags);
    NativeEndian::write_u32(&mut buf[LSPACE_MINOR_OFFSET..LSPACE_MINOR_OFFSET + 4], minor);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remove_request_layout() {
        let req = remove_lockspace_request(7, DLM_USER_LSFLG_FORCEFREE);
        assert_eq!(req.len(), WRITE_REQUEST_LEN);
        assert_eq!(NativeEndian::read_u32(&req[0..4]), DLM_DEVICE_VERSION_MAJOR);
        assert_eq!(NativeEndian::read_u32(&req[4..8]), DLM_DEVICE_VERSION_MINOR);
        assert_eq!(NativeEndian::read_u32(&req[8..12]), DLM_DEVICE_VERSION_PATCH);
        assert_eq!(req[12], DLM_USER_REMOVE_LOCKSPACE);
        assert_eq!(req[13], cfg!(target_pointer_width = "64") as u8);
        assert_eq!(NativeEndian::read_u32(&req[16..20]), DLM_USER_LSFLG_FORCEFREE);
        assert_eq!(NativeEndian::read_u32(&req[20..24]), 7);
    }

    #[test]
    fn create_request_carries_name() {
        let req = create_lockspace_request("ls1");
        assert_eq!(req.len(), WRITE_REQUEST_LEN + 3);
        assert_eq!(req[12], DLM_USER_CREATE_LOCKSPACE);
        assert_eq!(&req[24..27], b"ls1");
        // No minor, no flags on create.
        assert_eq!(NativeEndian::read_u32(&req[16..20]), 0);
        assert_eq!(NativeEndian::read_u32(&req[20..24]), 0);
    }

    #[test]
    fn request_is_at_least_as_large_as_the_lock_union() {
        // The union's lock member dominates the record size.
        assert!(WRITE_REQUEST_LEN >= 16 + 32 + 16 + 16);
    }
}

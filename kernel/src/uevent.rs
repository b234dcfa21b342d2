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

//! Kernel notifications about lockspace state, received from the kobject
//! uevent netlink multicast group.

use fakedlm_errors::KernelError;

use nix::sys::socket::{
    bind, recv, setsockopt, socket, sockopt, AddressFamily, MsgFlags, NetlinkAddr, SockAddr,
    SockFlag, SockProtocol, SockType,
};
use nix::sys::time::{TimeVal, TimeValLike};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::{sync::mpsc, task};

const MAX_LINE_UEVENT: usize = 256;

const ONLINE_PREFIX: &str = "online@/kernel/dlm/";
const OFFLINE_PREFIX: &str = "offline@/kernel/dlm/";
const ADD_DEVICE_PREFIX: &str = "add@/devices/virtual/misc/dlm_";

/// A decoded kernel notification the daemon reacts to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Uevent {
    /// A client created the lockspace locally; the kernel asks to join.
    Online(String),
    /// The last local user removed the lockspace; the kernel asks to leave.
    Offline(String),
    /// The lockspace's control device appeared, with its minor number.
    DeviceAdded { name: String, minor: Option<u32> },
}

/// Decodes one uevent datagram: a NUL-delimited sequence of fields, the
/// first of which encodes action and subject path. Returns `None` for
/// notifications the daemon does not react to.
pub fn parse_uevent(buf: &[u8]) -> Option<Uevent> {
    let mut tokens = buf.split(|&b| b == 0).filter(|t| !t.is_empty());
    let subject = std::str::from_utf8(tokens.next()?).ok()?;

    if let Some(name) = subject.strip_prefix(ONLINE_PREFIX) {
        return Some(Uevent::Online(name.to_owned()));
    }
    if let Some(name) = subject.strip_prefix(OFFLINE_PREFIX) {
        return Some(Uevent::Offline(name.to_owned()));
    }
    if let Some(name) = subject.strip_prefix(ADD_DEVICE_PREFIX) {
        let minor = tokens
            .filter_map(|t| std::str::from_utf8(t).ok())
            .find_map(|t| t.strip_prefix("MINOR="))
            .and_then(|v| v.parse().ok());
        return Some(Uevent::DeviceAdded {
            name: name.to_owned(),
            minor,
        });
    }
    None
}

fn log_uevent(buf: &[u8]) {
    let mut tokens = buf
        .split(|&b| b == 0)
        .filter(|t| !t.is_empty())
        .map(String::from_utf8_lossy);
    if let Some(subject) = tokens.next() {
        let params: Vec<_> = tokens.collect();
        debug!("Uevent '{}' ({})", subject, params.join(", "));
    }
}

/// A handle that stops the uevent listener task.
pub struct UeventListener {
    stop: Arc<AtomicBool>,
}

impl UeventListener {
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

/// Binds the kobject uevent multicast group and spawns a task forwarding
/// decoded notifications into the given channel. Receives with a short
/// timeout so the task notices shutdown.
pub fn listen_to_uevents(
    sender: mpsc::UnboundedSender<Uevent>,
) -> Result<UeventListener, KernelError> {
    let fd = socket(
        AddressFamily::Netlink,
        SockType::Datagram,
        SockFlag::empty(),
        SockProtocol::NetlinkKObjectUEvent,
    )
    .map_err(errno_to_io)?;
    let addr = SockAddr::Netlink(NetlinkAddr::new(std::process::id(), 1));
    bind(fd, &addr).map_err(errno_to_io)?;
    setsockopt(fd, sockopt::ReceiveTimeout, &TimeVal::milliseconds(500)).map_err(errno_to_io)?;

    let stop = Arc::new(AtomicBool::new(false));
    let listener = UeventListener { stop: stop.clone() };

    task::spawn_blocking(move || {
        let mut buf = [0u8; MAX_LINE_UEVENT];
        loop {
            if stop.load(Ordering::Relaxed) {
                break;
            }
            match recv(fd, &mut buf, MsgFlags::empty()) {
                Ok(0) => continue,
                Ok(len) => {
                    log_uevent(&buf[..len]);
                    if let Some(uevent) = parse_uevent(&buf[..len]) {
                        if sender.send(uevent).is_err() {
                            break;
                        }
                    }
                }
                Err(nix::errno::Errno::EAGAIN) | Err(nix::errno::Errno::EINTR) => continue,
                Err(error) => {
                    error!("Receiving uevents failed: {}", error);
                    break;
                }
            }
        }
        let _ = nix::unistd::close(fd);
    });

    Ok(listener)
}

fn errno_to_io(errno: nix::errno::Errno) -> KernelError {
    KernelError::Io(std::io::Error::from_raw_os_error(errno as i32))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(fields: &[&str]) -> Vec<u8> {
        let mut buf = Vec::new();
        for field in fields {
            buf.extend_from_slice(field.as_bytes());
            buf.push(0);
        }
        buf
    }

    #[test]
    fn parses_online() {
        let buf = frame(&["online@/kernel/dlm/ls1", "ACTION=online"]);
        assert_eq!(parse_uevent(&buf), Some(Uevent::Online("ls1".into())));
    }

    #[test]
    fn parses_offline() {
        let buf = frame(&["offline@/kernel/dlm/scratch"]);
        assert_eq!(parse_uevent(&buf), Some(Uevent::Offline("scratch".into())));
    }

    #[test]
    fn parses_add_device_with_minor() {
        let buf = frame(&[
            "add@/devices/virtual/misc/dlm_ls1",
            "ACTION=add",
            "MAJOR=10",
            "MINOR=57",
        ]);
        assert_eq!(
            parse_uevent(&buf),
            Some(Uevent::DeviceAdded {
                name: "ls1".into(),
                minor: Some(57),
            }),
        );
    }

    #[test]
    fn add_device_without_minor() {
        let buf = frame(&["add@/devices/virtual/misc/dlm_ls1", "ACTION=add"]);
        assert_eq!(
            parse_uevent(&buf),
            Some(Uevent::DeviceAdded {
                name: "ls1".into(),
                minor: None,
            }),
        );
    }

    #[test]
    fn ignores_unrelated_subjects() {
        assert_eq!(parse_uevent(&frame(&["add@/devices/pci0000:00/whatever"])), None);
        assert_eq!(parse_uevent(&frame(&["remove@/kernel/dlm/ls1"])), None);
        assert_eq!(parse_uevent(b""), None);
    }
}

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

#[macro_use]
extern crate tracing;

pub mod configfs;
pub use configfs::*;

pub mod modprobe;
pub use modprobe::*;

pub mod request;
pub use request::*;

pub mod uevent;
pub use uevent::*;

pub use nix::errno::Errno;

use fakedlm_errors::KernelError;

use parking_lot::Mutex;
use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::{sync::mpsc, task, time::sleep};

/// Where the kernel DLM exposes its interfaces. Tests point these at a
/// temporary directory.
#[derive(Clone, Debug)]
pub struct DlmPaths {
    /// The per-lockspace tree, `/sys/kernel/dlm` on a live system.
    pub sysfs: PathBuf,
    /// The cluster configuration mount, `/sys/kernel/config/dlm`.
    pub configfs: PathBuf,
    /// The misc device directory, `/dev/misc`.
    pub misc: PathBuf,
}

impl Default for DlmPaths {
    fn default() -> Self {
        Self {
            sysfs: PathBuf::from("/sys/kernel/dlm"),
            configfs: PathBuf::from("/sys/kernel/config/dlm"),
            misc: PathBuf::from("/dev/misc"),
        }
    }
}

impl DlmPaths {
    pub fn control_device(&self) -> PathBuf {
        self.misc.join("dlm-control")
    }

    pub fn monitor_device(&self) -> PathBuf {
        self.misc.join("dlm-monitor")
    }

    pub fn lockspace_device(&self, name: &str) -> PathBuf {
        self.misc.join(format!("dlm_{}", name))
    }

    pub(crate) fn cluster_dir(&self) -> PathBuf {
        self.configfs.join("cluster")
    }

    fn lockspace_file(&self, name: &str, file: &str) -> PathBuf {
        self.sysfs.join(name).join(file)
    }
}

/// The completion of an asynchronous write to a kernel interface, delivered
/// to the daemon loop out-of-band.
#[derive(Debug)]
pub enum AsyncCompletion {
    /// The one-byte stop write to a lockspace's control file finished.
    StopWrite {
        lockspace: String,
        result: io::Result<()>,
    },
    /// A lockspace removal request to the control device finished.
    Release {
        minor: u32,
        force: bool,
        result: io::Result<()>,
    },
}

/// The daemon's handle on the kernel DLM: the control and monitor devices,
/// the per-lockspace sysfs files, and the configfs cluster tree.
pub struct DlmKernel {
    paths: DlmPaths,
    /// The request device, lazily opened.
    control: Mutex<Option<File>>,
    /// Held open for the daemon lifetime; the kernel uses its closure to
    /// detect a dead control daemon.
    monitor: Mutex<Option<File>>,
    completions: mpsc::UnboundedSender<AsyncCompletion>,
}

impl DlmKernel {
    pub fn new(paths: DlmPaths, completions: mpsc::UnboundedSender<AsyncCompletion>) -> Self {
        Self {
            paths,
            control: Mutex::new(None),
            monitor: Mutex::new(None),
            completions,
        }
    }

    #[inline]
    pub fn paths(&self) -> &DlmPaths {
        &self.paths
    }

    /// Opens the monitor device and keeps it open. Loads the module first
    /// if the configuration mount is missing, and waits for udev to create
    /// the device node.
    pub async fn monitor_kernel(&self) -> Result<(), KernelError> {
        let path = self.paths.monitor_device();
        if let Ok(file) = open_udev_device(&path, Duration::from_secs(0)).await {
            *self.monitor.lock() = Some(file);
            return Ok(());
        }
        if !self.paths.configfs.is_dir() {
            modprobe::modprobe("dlm").await?;
            if !self.paths.configfs.is_dir() {
                return Err(KernelError::path(
                    &self.paths.configfs,
                    io::Error::from(io::ErrorKind::NotFound),
                ));
            }
        }
        let file = open_udev_device(&path, Duration::from_secs(5))
            .await
            .map_err(|error| KernelError::path(&path, error))?;
        *self.monitor.lock() = Some(file);
        Ok(())
    }

    /// Closes the control and monitor devices at shutdown.
    pub fn close_devices(&self) {
        *self.control.lock() = None;
        *self.monitor.lock() = None;
    }

    /// Returns an independently usable handle on the request device,
    /// opening it on first use.
    fn control_file(&self) -> Result<File, KernelError> {
        let mut guard = self.control.lock();
        let file = match guard.take() {
            Some(file) => file,
            None => {
                let path = self.paths.control_device();
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .open(&path)
                    .map_err(|error| KernelError::path(&path, error))?
            }
        };
        let clone = file.try_clone()?;
        *guard = Some(file);
        Ok(clone)
    }

    /// Asks the kernel to create a lockspace and returns the minor device
    /// number of its new control device.
    pub fn create_lockspace(&self, name: &str) -> Result<u32, KernelError> {
        let mut control = self.control_file()?;
        let request = request::create_lockspace_request(name);
        // The control device consumes whole requests; the write return value
        // is the new minor number, not a byte count.
        let minor = control.write(&request)?;
        Ok(minor as u32)
    }

    /// Asks the kernel to drop one reference to a lockspace, synchronously.
    pub fn remove_lockspace(&self, minor: u32, force: bool) -> Result<(), KernelError> {
        let mut control = self.control_file()?;
        let flags = if force { request::DLM_USER_LSFLG_FORCEFREE } else { 0 };
        let request = request::remove_lockspace_request(minor, flags);
        control.write(&request)?;
        Ok(())
    }

    /// Submits a lockspace removal asynchronously; a plain write would
    /// block until the resulting offline uevent has been completed.
    pub fn submit_release(&self, minor: u32, force: bool) -> Result<(), KernelError> {
        let mut control = self.control_file()?;
        let flags = if force { request::DLM_USER_LSFLG_FORCEFREE } else { 0 };
        let request = request::remove_lockspace_request(minor, flags);
        let sender = self.completions.clone();
        task::spawn_blocking(move || {
            // Whole-request write; the return value is the command status.
            let result = control.write(&request).map(|_| ());
            let _ = sender.send(AsyncCompletion::Release {
                minor,
                force,
                result,
            });
        });
        Ok(())
    }

    /// Submits the one-byte stop write for a lockspace asynchronously;
    /// stopping waits for the kernel recovery daemon and can take a while.
    pub fn submit_stop(&self, name: &str, control: &File) -> Result<(), KernelError> {
        let mut control = control.try_clone()?;
        let lockspace = name.to_owned();
        let sender = self.completions.clone();
        task::spawn_blocking(move || {
            let result = control.write_all(b"0");
            let _ = sender.send(AsyncCompletion::StopWrite { lockspace, result });
        });
        Ok(())
    }

    /// Opens the per-lockspace control file.
    pub fn open_lockspace_control(&self, name: &str) -> Result<File, KernelError> {
        let path = self.paths.lockspace_file(name, "control");
        OpenOptions::new()
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|error| KernelError::path(&path, error))
    }

    /// (Re)starts the kernel recovery daemon for a lockspace.
    pub fn start_lockspace(&self, name: &str, control: &mut File) -> Result<(), KernelError> {
        control
            .write_all(b"1")
            .map_err(|error| KernelError::path(self.paths.lockspace_file(name, "control"), error))
    }

    /// Completes a lockspace online or offline event with the given status.
    pub fn write_event_done(&self, name: &str, status: i32) -> Result<(), KernelError> {
        self.write_lockspace_attr(name, "event_done", format!("{}", status))
    }

    /// Records the cluster-wide lockspace identifier before a join.
    pub fn write_lockspace_id(&self, name: &str, id: u32) -> Result<(), KernelError> {
        self.write_lockspace_attr(name, "id", format!("{}", id))
    }

    /// Marks the lockspace as running without a resource directory.
    pub fn write_nodir(&self, name: &str) -> Result<(), KernelError> {
        self.write_lockspace_attr(name, "nodir", "1".to_owned())
    }

    fn write_lockspace_attr(
        &self,
        name: &str,
        attr: &str,
        value: String,
    ) -> Result<(), KernelError> {
        let path = self.paths.lockspace_file(name, attr);
        write_file(&path, value.as_bytes())
    }

    /// Resolves a lockspace's minor number from its misc device node.
    pub fn lockspace_minor(&self, name: &str) -> Result<u32, KernelError> {
        use std::os::unix::fs::MetadataExt;

        let path = self.paths.lockspace_device(name);
        let metadata =
            std::fs::metadata(&path).map_err(|error| KernelError::path(&path, error))?;
        let rdev = metadata.rdev();
        Ok(((rdev & 0xff) | ((rdev >> 12) & !0xff)) as u32)
    }
}

pub(crate) fn write_file(path: &Path, value: &[u8]) -> Result<(), KernelError> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .open(path)
        .map_err(|error| KernelError::path(path, error))?;
    file.write_all(value)
        .map_err(|error| KernelError::path(path, error))
}

/// Repeatedly tries opening a device node until udev creates it, with
/// exponential backoff up to the given timeout.
async fn open_udev_device(path: &Path, timeout: Duration) -> io::Result<File> {
    let mut remaining = timeout;
    let mut step = Duration::from_millis(10);
    loop {
        match OpenOptions::new().read(true).open(path) {
            Ok(file) => return Ok(file),
            Err(error) if error.kind() == io::ErrorKind::NotFound && remaining >= step => {
                sleep(step).await;
                remaining -= step;
                step *= 2;
            }
            Err(error) => return Err(error),
        }
    }
}

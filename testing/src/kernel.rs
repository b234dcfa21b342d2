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

use fakedlm_kernel::DlmPaths;

use std::{fs, path::PathBuf};

/// A throwaway directory standing in for the kernel's sysfs, configfs, and
/// misc device trees, removed on drop.
pub struct TempDlmTree {
    root: PathBuf,
}

impl TempDlmTree {
    pub fn new() -> Self {
        let root = std::env::temp_dir().join(format!(
            "fakedlm-test-{}-{:016x}",
            std::process::id(),
            rand::random::<u64>(),
        ));
        for dir in &["sysfs", "configfs", "misc"] {
            fs::create_dir_all(root.join(dir)).unwrap();
        }
        // Stand-ins for the control and monitor device nodes.
        fs::write(root.join("misc/dlm-control"), b"").unwrap();
        fs::write(root.join("misc/dlm-monitor"), b"").unwrap();
        Self { root }
    }

    pub fn paths(&self) -> DlmPaths {
        DlmPaths {
            sysfs: self.root.join("sysfs"),
            configfs: self.root.join("configfs"),
            misc: self.root.join("misc"),
        }
    }

    /// Creates the per-lockspace sysfs files the kernel would provide.
    pub fn add_lockspace(&self, name: &str) {
        let dir = self.root.join("sysfs").join(name);
        fs::create_dir_all(&dir).unwrap();
        for attr in &["control", "event_done", "id", "nodir"] {
            fs::write(dir.join(attr), b"").unwrap();
        }
    }

    /// Reads back a per-lockspace sysfs attribute.
    pub fn lockspace_attr(&self, name: &str, attr: &str) -> String {
        fs::read_to_string(self.root.join("sysfs").join(name).join(attr)).unwrap()
    }

    /// The cluster configuration directory.
    pub fn cluster_dir(&self) -> PathBuf {
        self.root.join("configfs/cluster")
    }
}

impl Default for TempDlmTree {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TempDlmTree {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}

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

use std::path::PathBuf;
use thiserror::Error;

/// Errors from the kernel DLM interfaces: the control and monitor devices,
/// the configfs cluster tree, the per-lockspace sysfs files, and uevents.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("{}: {source}", path.display())]
    Path {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to run '{command}': {status}")]
    Command { command: String, status: String },

    #[error("lockspace '{0}' has no open control file")]
    LockspaceControlMissing(String),
}

impl KernelError {
    /// Attaches the offending path to an IO error.
    pub fn path(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        KernelError::Path {
            path: path.into(),
            source,
        }
    }
}

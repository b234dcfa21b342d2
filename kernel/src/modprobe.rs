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

use fakedlm_errors::KernelError;

use tokio::process::Command;

const MODPROBE: &str = "/sbin/modprobe";
const RMMOD: &str = "/sbin/rmmod";

async fn run(program: &str, module: &str) -> Result<(), KernelError> {
    let command = format!("{} {}", program, module);
    let status = Command::new(program)
        .arg(module)
        .status()
        .await
        .map_err(|error| KernelError::Command {
            command: command.clone(),
            status: error.to_string(),
        })?;
    if !status.success() {
        return Err(KernelError::Command {
            command,
            status: status.to_string(),
        });
    }
    Ok(())
}

/// Loads a kernel module.
pub async fn modprobe(module: &str) -> Result<(), KernelError> {
    run(MODPROBE, module).await
}

/// Unloads a kernel module. Best effort; the module may still be in use.
pub async fn rmmod(module: &str) {
    if let Err(error) = run(RMMOD, module).await {
        debug!("{}", error);
    }
}

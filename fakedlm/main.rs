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

use fakedlm::{cli, Daemon};
use fakedlm_kernel::DlmPaths;

use anyhow::Result;
use tokio::runtime::Runtime;

fn main() -> Result<()> {
    let (environment, verbosity) = cli::parse()?;

    tracing_subscriber::fmt()
        .with_env_filter(verbosity.filter())
        .init();

    let runtime = Runtime::new()?;
    let result = runtime.block_on(async {
        let mut daemon = Daemon::new(environment, DlmPaths::default()).await?;
        daemon.run().await
    });
    // The uevent listener may be parked in a blocking receive.
    runtime.shutdown_background();
    result
}

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

//! A trivial client for the DLM control device: creates and removes
//! lockspaces, the way libdlm users would.

use fakedlm_kernel::{DlmKernel, DlmPaths};

use anyhow::{bail, Result};
use clap::{App, Arg};
use tokio::sync::mpsc;

fn main() -> Result<()> {
    let matches = App::new("fakedlm-lockspace")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Create or remove lockspaces through the DLM control device")
        .arg(Arg::with_name("create").long("create").short("c").help("Create the lockspaces"))
        .arg(Arg::with_name("remove").long("remove").short("r").help("Remove the lockspaces"))
        .arg(
            Arg::with_name("force")
                .long("force")
                .short("f")
                .help("Remove even with active locks"),
        )
        .arg(Arg::with_name("lockspaces").required(true).multiple(true))
        .get_matches();

    let create = matches.is_present("create");
    let remove = matches.is_present("remove");
    let force = matches.is_present("force");
    if create == remove {
        bail!("exactly one of --create and --remove is required");
    }
    if create && force {
        bail!("--force only applies to --remove");
    }

    // No asynchronous requests are issued here; the completions go nowhere.
    let (completions, _unused) = mpsc::unbounded_channel();
    let kernel = DlmKernel::new(DlmPaths::default(), completions);

    if let Some(names) = matches.values_of("lockspaces") {
        for name in names {
            if create {
                let minor = kernel.create_lockspace(name)?;
                println!("Minor device number {} created", minor);
            } else {
                let minor = kernel.lockspace_minor(name)?;
                println!("Removing minor device number {}", minor);
                kernel.remove_lockspace(minor, force)?;
            }
        }
    }
    Ok(())
}

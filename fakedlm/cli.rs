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

use fakedlm_network::{
    DlmProtocol, Environment, NodeTuning, DEFAULT_DLM_PORT, DEFAULT_FAKEDLM_PORT,
};

use anyhow::{Context, Result};
use clap::{App, Arg, ArgMatches};
use serde::Deserialize;
use std::collections::HashMap;

/// Where log output should be cut off, from the `--verbose` and `--debug`
/// flags.
#[derive(Clone, Copy, Debug)]
pub struct Verbosity {
    pub verbose: bool,
    pub debug: bool,
}

impl Verbosity {
    /// The filter directive for the log subscriber.
    pub fn filter(self) -> &'static str {
        if self.debug {
            "trace"
        } else if self.verbose {
            "debug"
        } else {
            "info"
        }
    }
}

/// The optional TOML configuration file; command-line options take
/// precedence over it.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
    pub cluster_name: Option<String>,
    pub fakedlm_port: Option<u16>,
    pub dlm_port: Option<u16>,
    pub sctp: Option<bool>,
    /// Per-node attributes, keyed by node name.
    pub nodes: HashMap<String, NodeOptions>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodeOptions {
    pub weight: Option<u32>,
    pub nodir: Option<bool>,
}

fn app() -> App<'static, 'static> {
    App::new("fakedlm")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Control daemon for testing the kernel distributed lock manager")
        .arg(
            Arg::with_name("nodes")
                .help("Node names or addresses, in the same order on all nodes; '-' skips an id")
                .required(true)
                .multiple(true),
        )
        .arg(
            Arg::with_name("cluster-name")
                .long("cluster-name")
                .short("n")
                .takes_value(true)
                .help("The cluster name to configure"),
        )
        .arg(
            Arg::with_name("fakedlm-port")
                .long("fakedlm-port")
                .short("P")
                .takes_value(true)
                .help("The port the daemons connect to each other on"),
        )
        .arg(
            Arg::with_name("dlm-port")
                .long("dlm-port")
                .short("p")
                .takes_value(true)
                .help("The port the kernel DLM uses"),
        )
        .arg(Arg::with_name("sctp").long("sctp").help("Use SCTP between the kernel DLM instances"))
        .arg(Arg::with_name("verbose").long("verbose").short("v").help("Log protocol traffic"))
        .arg(Arg::with_name("debug").long("debug").help("Log lockspace state transitions"))
        .arg(
            Arg::with_name("config")
                .long("config")
                .takes_value(true)
                .help("Read defaults from a TOML configuration file"),
        )
}

/// Parses the process arguments into the daemon parameters.
pub fn parse() -> Result<(Environment, Verbosity)> {
    from_matches(app().get_matches())
}

/// Like [`parse`], for explicit argument lists.
pub fn parse_from<I, T>(args: I) -> Result<(Environment, Verbosity)>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    from_matches(app().get_matches_from(args))
}

fn from_matches(matches: ArgMatches<'_>) -> Result<(Environment, Verbosity)> {
    let config = match matches.value_of("config") {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("cannot read {}", path))?;
            toml::from_str(&raw).with_context(|| format!("cannot parse {}", path))?
        }
        None => ConfigFile::default(),
    };

    let node_names: Vec<String> = matches
        .values_of("nodes")
        .map(|values| values.map(str::to_owned).collect())
        .unwrap_or_default();

    let cluster_name = matches
        .value_of("cluster-name")
        .map(str::to_owned)
        .or(config.cluster_name);
    let fakedlm_port = match matches.value_of("fakedlm-port") {
        Some(port) => port.parse().context("invalid --fakedlm-port")?,
        None => config.fakedlm_port.unwrap_or(DEFAULT_FAKEDLM_PORT),
    };
    let dlm_port = match matches.value_of("dlm-port") {
        Some(port) => port.parse().context("invalid --dlm-port")?,
        None => config.dlm_port.unwrap_or(DEFAULT_DLM_PORT),
    };
    let protocol = if matches.is_present("sctp") || config.sctp.unwrap_or(false) {
        DlmProtocol::Sctp
    } else {
        DlmProtocol::Tcp
    };

    let mut tuning = HashMap::new();
    for (name, options) in config.nodes {
        tuning.insert(
            name,
            NodeTuning {
                weight: options.weight.unwrap_or(1),
                nodir: options.nodir.unwrap_or(false),
            },
        );
    }

    let environment = Environment::new(
        node_names,
        cluster_name,
        fakedlm_port,
        dlm_port,
        protocol,
        tuning,
    )?;
    let verbosity = Verbosity {
        verbose: matches.is_present("verbose"),
        debug: matches.is_present("debug"),
    };
    Ok((environment, verbosity))
}

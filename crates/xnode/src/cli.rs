//! Command-line arguments.

use std::path::PathBuf;

use clap::Parser;

/// Default location of the configuration file.
pub(crate) const DEFAULT_CONFIG: &str = "/etc/xnode/xnode.toml";

/// Control plane for a proxy node provisioned by a management panel.
#[derive(Debug, Parser)]
#[command(name = "xnode", version, about)]
pub(crate) struct Cli {
    /// Read configuration from this file.
    #[arg(short, long, value_name = "FILE", default_value = DEFAULT_CONFIG)]
    pub(crate) config: PathBuf,

    /// Run without a proxy engine, keeping engine state in memory.
    ///
    /// Useful for trying a panel configuration before deploying it.
    #[arg(long)]
    pub(crate) detached: bool,

    /// Override the log filter (for example `debug` or
    /// `xnode_controller=trace,info`).
    #[arg(short, long, value_name = "FILTER")]
    pub(crate) log_level: Option<String>,
}

#![cfg_attr(docsrs, feature(doc_auto_cfg, doc_cfg))]
#![doc = include_str!("../README.md")]

mod cert;
mod cfg;
mod cli;
mod logging;

use std::ffi::OsString;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser as _;
use tor_rtcompat::{PreferredRuntime, Runtime, ToplevelBlockOn as _};
use tracing::info;
use xnode_controller::memory::{MemoryEngine, MemoryRules, MemoryTraffic};
use xnode_controller::{Controller, Externals};
use xnode_limiter::Limiter;
use xnode_panel::{PanelClient, RemoteSource};

pub use cfg::{CertConfig, LoggingConfig, XnodeConfig, XnodeConfigBuilder, ENV_PREFIX};

use cert::CommandRenewer;
use cli::Cli;

/// Serve the node until interrupted.
async fn run<R: Runtime>(runtime: R, config: XnodeConfig, detached: bool) -> anyhow::Result<()> {
    if !detached {
        anyhow::bail!("No proxy engine is built into this program; run with --detached");
    }

    let source: Arc<dyn RemoteSource> =
        Arc::new(PanelClient::new(config.panel()).context("Unable to set up panel client")?);
    let limiter = Arc::new(Limiter::new(runtime.clone()));

    let mut externals = Externals::new(
        Arc::new(MemoryEngine::new()),
        Arc::new(MemoryTraffic::new()),
        Arc::new(MemoryRules::new()),
    );
    if let Some(program) = config.cert().renew_command() {
        externals = externals.with_cert_renewer(Arc::new(CommandRenewer::new(program)));
    }

    let controller = Arc::new(Controller::new(
        runtime,
        config.controller().clone(),
        source,
        limiter,
        externals,
    ));
    controller.start().await.context("Unable to start node")?;

    tokio_crate::signal::ctrl_c()
        .await
        .context("Unable to wait for interrupt")?;
    info!("Interrupted; stopping.");
    controller.stop().await?;
    Ok(())
}

/// Inner function, to handle a set of CLI arguments and return a single
/// `anyhow::Result<()>` for convenient handling.
pub fn main_main<I, T>(cli_args: I) -> anyhow::Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = Cli::parse_from(cli_args);

    let config = XnodeConfig::load(&cli.config)
        .with_context(|| format!("Unable to load configuration from {}", cli.config.display()))?;

    // Dropping this stops the log file writer.
    let _log_guard = logging::setup(config.logging(), cli.log_level.as_deref())?;

    info!("Starting xnode {}", env!("CARGO_PKG_VERSION"));

    let runtime = PreferredRuntime::create().context("Unable to create runtime")?;
    runtime
        .clone()
        .block_on(run(runtime, config, cli.detached))
}

/// Main program, callable directly from a binary crate's `main`.
///
/// Exits with status 1 on failure.
pub fn main() {
    if let Err(e) = main_main(std::env::args_os()) {
        #[allow(clippy::print_stderr)]
        {
            eprintln!("xnode: error: {:?}", e);
        }
        std::process::exit(1);
    }
}

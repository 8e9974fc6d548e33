//! `netcheck`: keeps a Linux host online.
//!
//! Loads the configuration, connects to NetworkManager on the system bus and
//! runs the scheduler until SIGTERM or SIGINT. Runs in the foreground; the
//! service manager handles daemonization.

mod cli;
mod error;
mod logging;
mod notifier;
mod shutdown;
mod startup;

use std::path::Path;

use clap::Parser;
use netcheck_config::Settings;
use netcheck_core::{Scheduler, UdpTransport};
use netcheck_nm::{NmClient, RetryPolicy};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::cli::{Cli, Command};
use crate::error::DaemonError;
use crate::notifier::SpoolNotifier;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    if let Err(err) = run(cli).await {
        let code = err.exit_code();
        eprintln!("{:?}", miette::Report::new(err));
        std::process::exit(code);
    }
}

async fn run(cli: Cli) -> Result<(), DaemonError> {
    match cli.command.unwrap_or_default() {
        Command::CheckConfig => check_config(&cli.config),
        Command::Run => {
            let settings = netcheck_config::load(&cli.config)?;
            let _guard = logging::init(&settings.logging, cli.verbose)?;
            info!(
                version = env!("CARGO_PKG_VERSION"),
                config = %cli.config.display(),
                "netcheck starting"
            );
            serve(settings)
                .await
                .inspect_err(|err| error!(error = %err, "netcheck failed to start"))
        }
    }
}

/// Validate the configuration and print it as loaded, environment
/// overrides included.
fn check_config(path: &Path) -> Result<(), DaemonError> {
    let raw = netcheck_config::load_file_config(path)?;
    let rendered = raw.to_toml()?;
    raw.into_settings()?;
    println!("# {} is valid\n{rendered}", path.display());
    Ok(())
}

async fn serve(settings: Settings) -> Result<(), DaemonError> {
    startup::warn_if_polkit_disabled();

    let notifier = SpoolNotifier::new(settings.gateway_spool_dir)?;
    let client = NmClient::connect(&RetryPolicy::initialization(), RetryPolicy::default()).await?;
    let transport = UdpTransport::new(settings.daemon.dns_timeout);
    let mut scheduler = Scheduler::initialize(settings.daemon, client, transport, notifier).await?;

    let stop = CancellationToken::new();
    tokio::spawn(shutdown::cancel_on_signal(stop.clone()));
    scheduler.run(stop).await;

    info!("netcheck stopped");
    Ok(())
}

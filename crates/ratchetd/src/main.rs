//! ratchetd - runs improvement cycles on a schedule.
//!
//! The daemon bootstraps the runtime (the isolation self-test must pass),
//! then hands over to [`Runtime::serve`]: a cycle every
//! `evolution.cycle_interval_secs`, the escape probes every
//! `sandbox.selftest_interval_secs`, and audit retention once a day.
//! Repeated self-test failures, ctrl-c and SIGTERM all engage the emergency
//! stop before the process exits, including while a cycle is running.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, Level};

use ratchet_core::{init_tracing, BootstrapOptions, RatchetConfig, Runtime};

#[derive(Parser)]
#[command(name = "ratchetd")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Ratchet daemon", long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long, env = "RATCHET_CONFIG", default_value = "ratchet.toml")]
    config: PathBuf,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Run a single cycle and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let args = Args::parse();

    let config = RatchetConfig::load(&args.config)
        .with_context(|| format!("Failed to load config {}", args.config.display()))?;
    let level = if args.verbose {
        Level::DEBUG
    } else {
        config.logging.level()
    };
    init_tracing(config.logging.format, level);

    let rt = Runtime::bootstrap(
        config,
        BootstrapOptions {
            require_selftest: true,
            proposer: None,
        },
    )
    .await
    .context("Failed to start runtime")?;

    if args.once {
        rt.run_cycle().await;
        return Ok(());
    }
    rt.serve(shutdown_signal())
        .await
        .context("Isolation can no longer be trusted")?;
    info!("ratchetd stopped");
    Ok(())
}

/// Resolves on ctrl-c or SIGTERM. A listener that cannot be installed never
/// resolves.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c"),
        _ = terminate => info!("received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_default_to_local_config() {
        let args = Args::try_parse_from(["ratchetd", "--once"]).unwrap();
        assert!(args.once);
        assert!(!args.verbose);
    }
}

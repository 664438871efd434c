use std::fs::OpenOptions;
use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

use snicker::cli::{self, Cli, EXIT_ARGERROR, EXIT_FAILURE};
use snicker::config::Config;

fn init_logging(log_stderr: bool, log_dir: &Path) -> Result<()> {
    let writer = if log_stderr {
        BoxMakeWriter::new(std::io::stderr)
    } else {
        std::fs::create_dir_all(log_dir)
            .with_context(|| format!("Failed to create log directory: {}", log_dir.display()))?;
        let log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_dir.join("snicker.log"))
            .context("Failed to open log file")?;
        BoxMakeWriter::new(log_file)
    };

    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(writer)
        .with_ansi(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set tracing subscriber")?;
    Ok(())
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if let Some(network) = cli.network {
        config.network = network;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ {:#}", e);
            return ExitCode::from(EXIT_ARGERROR);
        }
    };
    if let Err(e) = config.validate() {
        eprintln!("❌ Invalid configuration: {:#}", e);
        return ExitCode::from(EXIT_ARGERROR);
    }

    if let Err(e) = init_logging(cli.log_stderr, &config.network_data_dir().join("logs")) {
        eprintln!("❌ {:#}", e);
        return ExitCode::from(EXIT_FAILURE);
    }
    tracing::info!("🚀 snicker {} on {}", env!("CARGO_PKG_VERSION"), config.network);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("🛑 Interrupt received, shutting down");
                cancel.cancel();
            }
        });
    }

    match cli::run(cli.command, &config, cancel).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("❌ {:#}", e);
            ExitCode::from(e.exit_code())
        }
    }
}

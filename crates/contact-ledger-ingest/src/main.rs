use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use contact_ledger_ingest::{run_cli, Cli, LogFormat, RunStatus};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(&cli.config.log_level, cli.config.log_format);

    match run_cli(cli)? {
        RunStatus::Success => Ok(ExitCode::SUCCESS),
        RunStatus::Failure => Ok(ExitCode::FAILURE),
    }
}

fn init_tracing(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,contact_ledger={level}")));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init(),
    }
}

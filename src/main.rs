// src/main.rs

use anyhow::{anyhow, Result};
use clap::Parser;
use std::sync::Arc;

use ionos_image_builder::cli::{self, Cli, LogFormat, LogLevelCli};
use ionos_image_builder::secrets::{RedactingMakeWriter, SecretFilter};

use tracing_subscriber::filter::EnvFilter;

fn init_tracing(log_level: Option<LogLevelCli>, log_format: LogFormat) -> Result<()> {
    // --log-level wins, then RUST_LOG, then info.
    let env_filter = match log_level {
        Some(level) => EnvFilter::new(level.as_filter()),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    // Everything logged passes through the secret filter filled by Config::prepare.
    let writer = RedactingMakeWriter::stderr(Arc::clone(SecretFilter::global()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(writer);
    let result = match log_format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    result.map_err(|e| anyhow!("Setting default tracing subscriber failed: {}", e))
}

fn main() -> Result<()> {
    let cli_args = Cli::parse();
    init_tracing(cli_args.log_level, cli_args.log_format)?;
    cli::handle_command(cli_args.command)
}

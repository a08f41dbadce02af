//! fastfetch - Fast Fetch ad lifecycle driver
//!
//! Runs the ad lifecycle engine against a real ad server from the command
//! line, with a headless page standing in for the browser.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod commands;
mod headless;
mod http_client;

/// fastfetch - Fast Fetch ad lifecycle driver
#[derive(Parser, Debug)]
#[command(name = "fastfetch")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the engine configuration file
    #[arg(short, long, default_value = "fastfetch.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Append logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Request, validate and render one ad slot
    Fetch(commands::fetch::FetchArgs),

    /// Extract the metadata block from a signed creative
    Metadata(commands::metadata::MetadataArgs),

    /// Verify a creative signature against a keyset file
    Verify(commands::verify::VerifyArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs never go to stdout so JSON output stays parseable.
    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    if let Some(log_file) = &cli.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }

    match cli.command {
        Commands::Fetch(args) => {
            let rt = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("Failed to build tokio runtime")?;
            rt.block_on(commands::fetch::run(&cli.config, &args))
        },
        Commands::Metadata(args) => commands::metadata::run(&args),
        Commands::Verify(args) => {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .context("Failed to build tokio runtime")?;
            rt.block_on(commands::verify::run(&args))
        },
    }
}

//! # ics-cli
//!
//! CLI tool for inspecting ICS state and FastTransfer streams.
//!
//! ## Commands
//!
//! - `globset`: Decode a change set (IDSET or CNSET) from hex
//! - `fxdump`: Decode a FastTransfer stream into elements
//! - `demo`: Run a contents synchronization against an in-memory mailbox
//!
//! ## Example
//!
//! ```bash
//! # Decode a GUID-based change set
//! ics-cli globset 0102030405060708090a0b0c0d0e0f10040000000052002401315000
//!
//! # Decode a bare GLOBSET
//! ics-cli globset --raw 040000000052002401315000
//!
//! # Dump a captured stream as JSON
//! ics-cli fxdump capture.bin --json
//!
//! # Synchronize 10 messages in 512-byte chunks
//! ics-cli demo --messages 10 --buffer-size 512
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ics_server::Config;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

use commands::{demo, fxdump, globset};

/// CLI tool for inspecting ICS state and FastTransfer streams.
#[derive(Parser, Debug)]
#[command(name = "ics-cli")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Server configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Decode a change set from hex
    Globset {
        /// Hex-encoded bytes
        hex: String,

        /// Input is a single GLOBSET without replica GUIDs
        #[arg(long)]
        raw: bool,
    },

    /// Decode a FastTransfer stream
    Fxdump {
        /// File holding the stream, or the stream as hex
        input: String,

        /// Print elements as JSON
        #[arg(long)]
        json: bool,
    },

    /// Synchronize an in-memory mailbox and print statistics
    Demo {
        /// Number of messages in the demo folder
        #[arg(long, default_value = "5")]
        messages: usize,

        /// GetBuffer size in bytes
        #[arg(long, default_value = "256")]
        buffer_size: u16,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::default(),
    };
    init_logging(&config.logging.filter);

    match cli.command {
        Commands::Globset { hex, raw } => {
            globset::run(&hex, raw)?;
        }
        Commands::Fxdump { input, json } => {
            let bytes = fxdump::read_input(&input)?;
            fxdump::run(&bytes, json)?;
        }
        Commands::Demo {
            messages,
            buffer_size,
        } => {
            demo::run(config, messages, buffer_size)?;
        }
    }

    Ok(())
}

/// Install the stderr subscriber. `RUST_LOG` overrides the configured filter.
fn init_logging(filter: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    // A second init (tests) is not an error worth reporting.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init();
}

//! Cadence Relay CLI - re-emits bursty device telemetry at a fixed rate.
//!
//! This is the main binary entry point. See the `cadence_relay` library
//! for the core functionality.

use std::path::PathBuf;

use anyhow::{Context, Result};
use cadence_relay::{commands, Config};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;

/// Global allocator configured per M-MIMALLOC-APPS guideline.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "cadence-relay")]
#[command(version)]
#[command(about = "Fixed-cadence relay for bursty line-oriented telemetry")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Relay a device stream to WebSocket consumers
    Serve {
        /// Device source: tcp://host:port, host:port, or - for stdin
        #[arg(long)]
        source: Option<String>,
        /// Address for the consumer WebSocket listener
        #[arg(long)]
        listen: Option<String>,
        /// JSON file sent to the device as the handshake payload
        #[arg(long)]
        topology: Option<PathBuf>,
        /// Delivery rate in ticks per second
        #[arg(long)]
        tick_hz: Option<u32>,
        /// Relay buffer capacity in samples
        #[arg(long)]
        capacity: Option<usize>,
        /// Send nothing on underrun ticks instead of null
        #[arg(long)]
        skip_underruns: bool,
    },
    /// Print the effective configuration
    Config {
        /// Write the effective configuration to config.json
        #[arg(long)]
        save: bool,
    },
    /// Decode a raw capture file and print samples as JSON lines
    Replay {
        /// Path to the capture
        file: PathBuf,
    },
}

fn init_logging() -> Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format_timestamp_secs();

    if let Ok(path) = std::env::var("CADENCE_LOG_FILE") {
        let log_file = std::fs::File::create(&path)
            .with_context(|| format!("Failed to create log file at {path}"))?;
        builder.target(env_logger::Target::Pipe(Box::new(log_file)));
    }

    builder.init();
    Ok(())
}

fn main() -> Result<()> {
    init_logging()?;

    let cli = Cli::parse();
    let mut config = Config::load()?;

    match cli.command {
        Commands::Serve {
            source,
            listen,
            topology,
            tick_hz,
            capacity,
            skip_underruns,
        } => {
            if source.is_some() {
                config.source = source;
            }
            if let Some(listen) = listen {
                config.listen_addr = listen;
            }
            if let Some(hz) = tick_hz {
                config.tick_hz = hz;
            }
            if let Some(capacity) = capacity {
                config.buffer_capacity = capacity;
            }
            config.skip_underruns |= skip_underruns;
            config.validate()?;

            let topology = topology
                .as_deref()
                .map(commands::serve::load_topology)
                .transpose()?;

            let runtime = tokio::runtime::Runtime::new().context("Failed to start tokio runtime")?;
            runtime.block_on(commands::serve(config, topology))?;
        }
        Commands::Config { save } => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            if save {
                let path = config.save()?;
                eprintln!("Saved to {}", path.display());
            }
        }
        Commands::Replay { file } => {
            let summary = commands::replay_file(&file, &config)?;
            if summary.truncated {
                eprintln!("Capture ended mid-record; trailing fragment ignored");
            }
        }
    }

    Ok(())
}

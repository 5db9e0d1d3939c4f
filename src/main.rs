use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "signalward",
    about = "Streaming metric aggregation and ensemble anomaly detection",
    version,
    long_about = None
)]
struct Cli {
    /// Path to a TOML config file. Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Consume NDJSON events from stdin until EOF
    Serve {
        /// SQLite database path
        #[arg(long, default_value = "data/signalward.db")]
        db: String,
    },

    /// Replay a recorded NDJSON event file
    Replay {
        /// Event file, one JSON event per line
        #[arg(long)]
        file: PathBuf,

        /// SQLite database path; omit for in-memory storage
        #[arg(long)]
        db: Option<String>,
    },

    /// Run synthetic traffic through the engine (in-memory storage)
    Simulate {
        /// Number of events to generate
        #[arg(long, default_value = "1000")]
        events: u64,

        /// Milliseconds between consecutive events per metric key
        #[arg(long, default_value = "1000")]
        step_ms: i64,

        /// Probability of injecting a spike into any one event
        #[arg(long, default_value = "0.005")]
        spike_chance: f64,
    },

    /// Validate a config file and exit
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = signalward::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { db } => {
            tracing::info!(%db, "starting signalward engine");
            signalward::serve(config, &db).await?;
        }
        Commands::Replay { file, db } => {
            tracing::info!(file = %file.display(), "replaying event file");
            signalward::replay(config, db.as_deref(), &file).await?;
        }
        Commands::Simulate {
            events,
            step_ms,
            spike_chance,
        } => {
            tracing::info!(events, step_ms, spike_chance, "simulating traffic");
            signalward::simulate(config, events, step_ms, spike_chance).await?;
        }
        Commands::CheckConfig => {
            // load_config above already validated; report and exit.
            let snapshot = config.snapshot();
            println!(
                "config ok: window_size_ms={} detectors={}",
                snapshot.window_size_ms,
                snapshot.detectors.len()
            );
        }
    }

    Ok(())
}

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pg_relay::config::{ConfigError, StreamConfig};
use pg_relay::{bootstrap, stream};

#[derive(Debug, Parser)]
#[command(name = "pg_relay", version, about, arg_required_else_help = true)]
struct AppArgs {
    /// Path to the YAML configuration file
    #[arg(long, short, default_value = "pg_relay.yaml")]
    config: String,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create the pgrelay schema, publication and replication slot
    Init,
    /// Start the replication pipeline
    Run,
    /// Snapshot existing schema and table contents into the sinks
    Snapshot,
    /// Show the state of the source-side setup
    Status,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pg_relay=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    match main_impl().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn main_impl() -> Result<(), Box<dyn std::error::Error>> {
    let args = AppArgs::parse();
    let config = StreamConfig::from_file(&args.config)?;
    let listener = config
        .listener
        .postgres
        .clone()
        .ok_or(ConfigError::MissingListener)?;

    match args.command {
        Command::Init => {
            bootstrap::init(&listener.url, &listener.publication, &listener.slot_name).await?;
            info!("source initialised");
        }
        Command::Run => {
            let cancel = cancel_on_signal();
            stream::run(config, cancel).await?;
        }
        Command::Snapshot => {
            let cancel = cancel_on_signal();
            stream::snapshot(config, cancel).await?;
            info!("snapshot complete");
        }
        Command::Status => {
            let status =
                bootstrap::status(&listener.url, &listener.publication, &listener.slot_name)
                    .await?;
            println!("schema log ready:    {}", status.schema_log_ready);
            println!("publication exists:  {}", status.publication_exists);
            println!("slot exists:         {}", status.slot_exists);
            if let Some(lsn) = &status.confirmed_flush_lsn {
                println!("confirmed flush lsn: {lsn}");
            }
        }
    }

    Ok(())
}

/// Cancels the returned token on the first SIGINT, so `run` shuts down
/// gracefully: pending batches get a final flush before the process exits.
/// The watcher stays detached; it blocks on the signal for the life of the
/// process and dies with it.
fn cancel_on_signal() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            trigger.cancel();
        }
    });
    cancel
}

use std::error::Error;

use clap::{Args, Parser};
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pg_relay::config::{
    ListenerConfig, PostgresListenerConfig, ProcessorConfig, StreamConfig,
};
use pg_relay::stream;

/// Streams every change of a publication to stdout as canonical JSON.
#[derive(Debug, Parser)]
#[command(name = "stdout", version, about, arg_required_else_help = true)]
struct AppArgs {
    #[clap(flatten)]
    db_args: DbArgs,

    /// Publication to stream from
    #[arg(long)]
    publication: String,

    /// Replication slot to use
    #[arg(long)]
    slot_name: String,
}

#[derive(Debug, Args)]
struct DbArgs {
    /// Postgres connection URL
    #[arg(long)]
    db_url: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    if let Err(e) = main_impl().await {
        error!("{e}");
    }

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stdout=info,pg_relay=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn main_impl() -> Result<(), Box<dyn Error>> {
    init_tracing();
    let args = AppArgs::parse();

    let config = StreamConfig {
        listener: ListenerConfig {
            postgres: Some(PostgresListenerConfig {
                url: args.db_args.db_url,
                publication: args.publication,
                slot_name: args.slot_name,
                snapshot_tables: vec!["*".to_string()],
            }),
        },
        processor: ProcessorConfig {
            stdout: true,
            injector: false,
            ..Default::default()
        },
        ..Default::default()
    };

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });

    stream::run(config, cancel).await?;

    Ok(())
}

//! Replication daemon
//!
//! Usage:
//!   # Run every task in a config file
//!   oxbowd --config config.json
//!
//!   # With verbose logging and a custom checkpoint directory
//!   oxbowd --config config.json --log-level debug \
//!     --checkpoint-dir /var/lib/oxbow/checkpoints
//!
//! The daemon provisions the configured indices, spawns one processor
//! per task, and runs until a task fails fatally or a shutdown signal
//! arrives.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use oxbow::{CheckpointManager, Config, EsSink, FileCheckpointStore, MongoSource, Processor};

#[derive(Debug, Parser)]
#[command(name = "oxbowd", about = "MongoDB to Elasticsearch replication daemon")]
struct Cli {
    /// Path to the JSON task configuration
    #[arg(short, long)]
    config: PathBuf,

    /// Directory for checkpoint files
    #[arg(long, default_value = "./checkpoints")]
    checkpoint_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Delete saved checkpoints before starting, forcing every task
    /// through a fresh scan
    #[arg(long)]
    rescan: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let raw = tokio::fs::read_to_string(&cli.config).await?;
    let config = Config::from_json(&raw)?;
    tracing::info!(
        config = %cli.config.display(),
        tasks = config.tasks.len(),
        "configuration loaded"
    );

    let mongo = MongoSource::connect(&config.mongodb.url).await?;
    let es = EsSink::connect(
        &config.elasticsearch.url,
        config.controls.index_name_suffix.clone(),
    )?;
    let checkpoints = CheckpointManager::new(Arc::new(
        FileCheckpointStore::new(&cli.checkpoint_dir).await?,
    ));

    if cli.rescan {
        for task in &config.tasks {
            tracing::info!(task = %task.name(), "resetting checkpoint");
            checkpoints.reset(&task.name()).await;
        }
    }

    // Create indices and apply mappings before any task writes
    es.provision(&config.elasticsearch, &config.tasks).await?;

    let mut handles = Vec::with_capacity(config.tasks.len());
    for task in config.tasks {
        let task = Arc::new(task);
        let name = task.name();
        let processor = Processor::new(
            task,
            config.controls.clone(),
            mongo.clone(),
            es.clone(),
            checkpoints.clone(),
        );
        handles.push(tokio::spawn(async move {
            if let Err(e) = processor.run().await {
                tracing::error!(task = %name, error = %e, "task stopped");
            }
        }));
    }

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received, stopping tasks");

    for handle in &handles {
        handle.abort();
    }
    for handle in handles {
        // Aborted tasks resolve with a cancellation error; ignore it
        let _ = handle.await;
    }

    tracing::info!("all tasks stopped");
    Ok(())
}

/// Wait for shutdown signals (Ctrl+C or SIGTERM)
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

//! Hybrid worker: supervises one sandbox process per sandbox id.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use hybridworker::config::{Component, Configuration};
use hybridworker::sandbox::ProcessSandboxFactory;
use hybridworker::service::{HttpServiceClient, LogSink};
use hybridworker::trace::{init_subscriber, Tracer};
use hybridworker::worker::Worker;

#[derive(Parser, Debug)]
#[command(name = "worker")]
#[command(about = "Polls the dispatch service and runs sandboxes for this machine")]
#[command(version)]
struct Args {
    /// Worker configuration file (JSON)
    #[arg(env = "HYBRIDWORKER_CONFIG")]
    config: PathBuf,

    /// Write logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

/// Bare names next to this binary win over `PATH`; other relative paths are
/// anchored to the current directory since sandboxes start in their own.
fn resolve_sandbox_executable(configured: &Path) -> PathBuf {
    if configured.is_absolute() {
        return configured.to_path_buf();
    }
    if configured.components().count() == 1 {
        let sibling = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(configured)));
        return match sibling {
            Some(path) if path.is_file() => path,
            _ => configured.to_path_buf(),
        };
    }
    std::env::current_dir()
        .map(|dir| dir.join(configured))
        .unwrap_or_else(|_| configured.to_path_buf())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = Configuration::load(&args.config)
        .with_context(|| format!("failed to load configuration from {}", args.config.display()))?;
    config.component = Component::Worker;
    config.sandbox_executable = resolve_sandbox_executable(&config.sandbox_executable);

    init_subscriber(config.debug_traces, args.json_logs);
    tracing::info!(
        account_id = %config.account_id,
        worker_group = %config.hybrid_worker_group_name,
        working_directory = %config.working_directory.display(),
        "starting worker"
    );

    let client = Arc::new(HttpServiceClient::new(&config).context("failed to build dispatch client")?);
    let tracer = Tracer::new(&config, Some(client.clone() as Arc<dyn LogSink>));
    let factory = ProcessSandboxFactory::new(config.clone(), tracer.clone());
    let mut worker = Worker::new(client, Box::new(factory), tracer, config.polling_interval());

    tokio::select! {
        _ = worker.start() => {}
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for shutdown signal")?;
            tracing::info!("shutdown requested");
        }
    }
    Ok(())
}

//! Sandbox process: runs the jobs of one sandbox id until the service closes it.
//!
//! Started by the worker as `sandbox <sandboxId>` with its configuration in
//! `WORKERCONF`. Exits 0 when the sandbox was closed and 1 when polling failed.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use hybridworker::config::Configuration;
use hybridworker::dispatcher::{Dispatcher, Shutdown};
use hybridworker::service::{HttpServiceClient, LogSink};
use hybridworker::trace::{init_subscriber, Tracer};

#[derive(Parser, Debug)]
#[command(name = "sandbox")]
#[command(about = "Runs dispatched jobs for a single sandbox")]
#[command(version)]
struct Args {
    /// Sandbox id assigned by the dispatch service
    sandbox_id: String,

    /// Write logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();

    let config = Configuration::from_env().context("sandbox started without configuration")?;
    init_subscriber(config.debug_traces, args.json_logs);

    let client = Arc::new(HttpServiceClient::new(&config).context("failed to build dispatch client")?);
    let tracer = Tracer::new(&config, Some(client.clone() as Arc<dyn LogSink>));

    match Dispatcher::new(&args.sandbox_id, &config, client, tracer).start().await {
        Shutdown::Closed => Ok(ExitCode::SUCCESS),
        Shutdown::Faulted(err) => {
            tracing::error!(sandbox_id = %args.sandbox_id, error = %err, "sandbox poll loop failed");
            Ok(ExitCode::FAILURE)
        }
    }
}

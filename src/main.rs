// ABOUTME: Entry point for the agentry operator CLI.
// ABOUTME: Initializes logging and metrics, builds the runtime from config and dispatches a command.

mod cli;

use agentry_core::{
    ChunkBody, CompareRequest, EnvCredentials, ExecuteRequest, Runtime, RuntimeConfig,
};
use anyhow::{bail, Context, Result};
use clap::Parser;
use cli::{Cli, Command, CompareArgs, RunArgs};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;
use std::io::Write;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();
    init_logging(cli.log_json);

    let metrics_handle = if cli.metrics {
        Some(
            PrometheusBuilder::new()
                .install_recorder()
                .context("Failed to initialize Prometheus metrics")?,
        )
    } else {
        None
    };

    let config = match &cli.config {
        Some(path) => RuntimeConfig::load_from(path)?,
        None => RuntimeConfig::load()?,
    };
    tracing::debug!(
        backends = config.backends.len(),
        max_pool_size = config.runtime.max_pool_size,
        "Configuration loaded"
    );

    let runtime = Runtime::from_config(&config, &EnvCredentials::new()).await?;
    let outcome = dispatch(&runtime, cli.command).await;
    runtime.shutdown().await;

    if let Some(handle) = metrics_handle {
        print_metrics(&handle);
    }
    outcome
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn dispatch(runtime: &Runtime, command: Command) -> Result<()> {
    let orchestrator = &runtime.orchestrator;
    match command {
        Command::Backends => {
            print_backends(runtime);
            Ok(())
        }
        Command::Capabilities { id } => print_json(&orchestrator.capabilities(&id)?),
        Command::Health { id: Some(id) } => print_json(&orchestrator.health(&id).await?),
        Command::Health { id: None } => print_json(&runtime.health_overview().await),
        Command::Run(args) => run(runtime, args).await,
        Command::Stream(args) => stream(runtime, args).await,
        Command::Compare(args) => compare(runtime, args).await,
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("Failed to render JSON")?;
    println!("{}", rendered);
    Ok(())
}

fn print_backends(runtime: &Runtime) {
    let backends = runtime.orchestrator.list_backends();
    if backends.is_empty() {
        println!("No backends configured");
        return;
    }
    println!(
        "{:<20} {:<10} {:<8} {:<8} {:>5} {:>5} {:>5}  CAPABILITIES",
        "ID", "TYPE", "VERSION", "ENABLED", "IDLE", "BUSY", "MAX"
    );
    for backend in backends {
        let (idle, busy, max) = match &backend.pool {
            Some(pool) => (pool.idle, pool.in_use, pool.max_size),
            None => (0, 0, 0),
        };
        let caps: Vec<_> = backend
            .capabilities
            .capability_set()
            .iter()
            .map(|c| c.as_str())
            .collect();
        println!(
            "{:<20} {:<10} {:<8} {:<8} {:>5} {:>5} {:>5}  {}",
            backend.id,
            backend.kind,
            backend.version,
            if backend.enabled { "yes" } else { "no" },
            idle,
            busy,
            max,
            caps.join(",")
        );
    }
}

/// Cancel the token on Ctrl-C
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, cancelling");
            token.cancel();
        }
    });
}

async fn run(runtime: &Runtime, args: RunArgs) -> Result<()> {
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let request = ExecuteRequest::new(args.selection(), args.query.clone(), args.caller.context())
        .with_fallback(args.fallback())
        .with_cancel(cancel);
    let response = runtime.orchestrator.execute(request).await?;
    print_json(&response)
}

async fn stream(runtime: &Runtime, args: RunArgs) -> Result<()> {
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let request = ExecuteRequest::new(args.selection(), args.query.clone(), args.caller.context())
        .with_fallback(args.fallback())
        .with_cancel(cancel.clone());
    let mut chunks = runtime.orchestrator.stream(request).await?;

    let mut stdout = std::io::stdout();
    while let Some(chunk) = chunks.recv().await {
        match chunk.body {
            ChunkBody::Text { text } => {
                write!(stdout, "{}", text)?;
                stdout.flush()?;
            }
            ChunkBody::Thought { text } => eprintln!("[thinking] {}", text),
            ChunkBody::ToolCall { name, input, .. } => eprintln!("[tool] {} {}", name, input),
            ChunkBody::Completion { .. } => {
                writeln!(stdout)?;
                tracing::debug!(backend = %chunk.backend_id, chunks = chunk.sequence + 1, "Stream complete");
            }
            ChunkBody::Error { code, message, .. } => {
                writeln!(stdout)?;
                bail!("{} ({:?})", message, code);
            }
        }
    }
    if cancel.is_cancelled() {
        bail!("Stream cancelled");
    }
    Ok(())
}

async fn compare(runtime: &Runtime, args: CompareArgs) -> Result<()> {
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let request = CompareRequest::new(args.backends.clone(), args.query.clone(), args.caller.context())
        .with_cancel(cancel);
    let comparison = runtime.orchestrator.compare(request).await?;
    let merged = comparison.merge(args.merge);

    #[derive(Serialize)]
    struct Report<'a> {
        comparison: &'a agentry_core::Comparison,
        merged: Option<agentry_core::AgentResponse>,
    }
    print_json(&Report {
        comparison: &comparison,
        merged,
    })?;

    if comparison.success_count() == 0 {
        bail!("No backend produced an answer");
    }
    Ok(())
}

fn print_metrics(handle: &PrometheusHandle) {
    eprintln!("{}", handle.render());
}

//! expression-resolver CLI: run the controller, or evaluate a single expression.

use anyhow::Context;
use clap::{Parser, Subcommand};
use expression_resolver::api::{MemoryStore, ResourceApi};
use expression_resolver::cache::InformerConfig;
use expression_resolver::config::Config;
use expression_resolver::controller::{Controller, ControllerConfig};
use expression_resolver::expr;
use expression_resolver::model::Manifest;
use expression_resolver::reconcile::ExpressionReconciler;
use expression_resolver::telemetry::{TelemetryConfig, init_telemetry};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(
    name = "expression-resolver",
    about = "Resolve Expression resources into computed results"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the controller over resources loaded from manifests
    Serve {
        /// Directory containing expression TOML manifests
        #[arg(long, default_value = "manifests")]
        manifests: PathBuf,
        /// Concurrent workers (overrides WORKERS)
        #[arg(long)]
        workers: Option<usize>,
        /// Full resync period in seconds (overrides RESYNC_INTERVAL_SECS)
        #[arg(long)]
        resync_secs: Option<u64>,
    },
    /// Evaluate one expression and print the result
    Eval {
        /// JSON object providing the variables
        #[arg(long, default_value = "{}")]
        data: String,
        /// The expression, e.g. "x + y"
        #[arg(long)]
        body: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            manifests,
            workers,
            resync_secs,
        } => cmd_serve(manifests, workers, resync_secs).await,
        Command::Eval { data, body } => cmd_eval(&data, &body),
    }
}

async fn cmd_serve(
    manifests: PathBuf,
    workers: Option<usize>,
    resync_secs: Option<u64>,
) -> anyhow::Result<()> {
    let mut config = Config::from_env()?;
    if let Some(workers) = workers {
        config.workers = workers;
    }
    if let Some(secs) = resync_secs {
        config.resync_interval = Duration::from_secs(secs);
    }
    config.validate()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "expression-resolver".to_string(),
        log_level: config.log_level.clone(),
    })?;

    if let Some(ref endpoint) = config.api_endpoint {
        warn!(
            endpoint,
            token_set = config.api_token.is_some(),
            "remote resource APIs are not supported, using the in-memory store"
        );
    }

    let store = Arc::new(MemoryStore::new());
    let loaded = load_manifests(&store, &manifests)?;
    info!(loaded, dir = %manifests.display(), "manifests loaded");

    let api: Arc<dyn ResourceApi> = store.clone();
    let controller = Controller::new(
        Arc::clone(&api),
        Arc::new(ExpressionReconciler::new(api)),
        ControllerConfig {
            max_retries: config.max_retries,
            informer: InformerConfig {
                resync_interval: config.resync_interval,
                ..InformerConfig::default()
            },
        },
    );

    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        token.cancel();
    });

    controller.run(cancel, config.workers).await?;
    print_statuses(&store);
    Ok(())
}

fn cmd_eval(data: &str, body: &str) -> anyhow::Result<()> {
    let data: serde_json::Value = serde_json::from_str(data).context("--data is not valid JSON")?;
    let value = expr::evaluate(body, &data)?;
    println!("{value}");
    Ok(())
}

/// Create every `[[expression]]` from the `.toml` files in `dir`.
fn load_manifests(store: &MemoryStore, dir: &Path) -> anyhow::Result<usize> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("cannot read manifest dir {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "toml"))
        .collect();
    paths.sort();

    let mut loaded = 0;
    for path in paths {
        let content = std::fs::read_to_string(&path)?;
        let manifest: Manifest = toml::from_str(&content)
            .with_context(|| format!("bad manifest {}", path.display()))?;
        for new in manifest.expressions {
            store
                .create(new)
                .with_context(|| format!("loading {}", path.display()))?;
            loaded += 1;
        }
    }
    Ok(loaded)
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("cannot listen for SIGTERM: {e}");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
    info!("shutdown signal received");
}

fn print_statuses(store: &MemoryStore) {
    let items = store.snapshot();
    if items.is_empty() {
        println!("No expressions found.");
        return;
    }

    println!("{:<30}  {:<30}  {:<4}  RESULT", "NAME", "BODY", "GEN");
    println!("{}", "-".repeat(80));
    for item in &items {
        let body: String = item.spec.body.chars().take(30).collect();
        println!(
            "{:<30}  {:<30}  {:<4}  {}",
            item.key().to_string(),
            body,
            item.metadata.generation,
            item.status.result.as_deref().unwrap_or("-")
        );
    }
    println!("\n{} expression(s)", items.len());
}

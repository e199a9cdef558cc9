use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use ripple_server::config::loader::{DEFAULT_CONFIG_FILE, load_config};
use ripple_server::demo::register_demo_functions;
use ripple_server::{FunctionRegistry, MemoryStore, ReactiveRuntime, ServerBuilder, observability};

const CONFIG_ENV: &str = "RIPPLE_CONFIG";

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = dotenvy::dotenv()
        && !e.not_found()
    {
        eprintln!("Warning: failed to load .env: {e}");
    }

    observability::init_tracing();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "ripple exited");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<()> {
    let (config_path, origin) = config_path();
    let cfg = load_config(Some(&config_path))
        .map_err(anyhow::Error::msg)
        .with_context(|| format!("loading {config_path}"))?;
    tracing::info!(path = %config_path, origin, "Configuration loaded");

    observability::apply_logging_config(&cfg.logging);
    ripple_server::metrics::init_metrics();

    let registry = FunctionRegistry::new();
    register_demo_functions(&registry).context("registering functions")?;
    tracing::info!(functions = registry.len(), "Functions registered");

    let runtime = ReactiveRuntime::new(cfg.clone(), MemoryStore::new(), registry)
        .context("starting reactive runtime")?;

    ServerBuilder::new()
        .with_config(cfg)
        .with_runtime(Arc::new(runtime))
        .build()?
        .run()
        .await
}

/// `--config <path>`, then `RIPPLE_CONFIG`, then [`DEFAULT_CONFIG_FILE`].
fn config_path() -> (String, &'static str) {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if let Some(path) = arg.strip_prefix("--config=") {
            return (path.to_string(), "argument");
        }
        if arg == "--config"
            && let Some(path) = args.next()
        {
            return (path, "argument");
        }
    }

    match std::env::var(CONFIG_ENV) {
        Ok(path) if !path.is_empty() => (path, "environment"),
        _ => (DEFAULT_CONFIG_FILE.to_string(), "default"),
    }
}

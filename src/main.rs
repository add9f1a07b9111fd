use std::future::IntoFuture;
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use neona::api::{self, AppState};
use neona::clock::SystemClock;
use neona::config::DaemonConfig;
use neona::connector::LocalExecConnector;
use neona::policy::PolicyEngine;
use neona::store::Store;
use neona::tasks::TaskManager;
use neona::tasks::reaper;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = DaemonConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    });

    // Initialize tracing: stderr plus a daily-rotated file under the log dir
    std::fs::create_dir_all(&config.log_dir)
        .with_context(|| format!("creating log directory {}", config.log_dir.display()))?;
    let file_appender = tracing_appender::rolling::daily(&config.log_dir, "neona.log");
    let (file_writer, _log_guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();

    eprintln!("🛰  neonad v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   API: http://{}", config.listen);
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Logs: {}", config.log_dir.display());

    // ── Database ─────────────────────────────────────────────────────────
    let store = Arc::new(
        Store::new_local(&config.db_path)
            .await
            .with_context(|| format!("opening database at {}", config.db_path.display()))?,
    );

    // ── Policy ───────────────────────────────────────────────────────────
    let policy = match &config.policy_path {
        Some(path) => {
            eprintln!("   Policy: {}", path.display());
            PolicyEngine::load(path)
                .with_context(|| format!("loading policy from {}", path.display()))?
        }
        None => {
            eprintln!("   Policy: built-in defaults");
            PolicyEngine::default()
        }
    };

    let manager = Arc::new(TaskManager::from_config(
        &config,
        store,
        Arc::new(policy),
        Arc::new(SystemClock),
    ));
    let fatal = manager.subscribe_fatal();

    // ── Background loops ─────────────────────────────────────────────────
    let reaper_handle = reaper::spawn_lease_reaper(Arc::clone(&manager), config.reaper_interval);
    let recheck_handle = config
        .recheck_interval
        .map(|interval| reaper::spawn_recheck_loop(Arc::clone(&manager), interval));
    match config.recheck_interval {
        Some(interval) => eprintln!("   Re-check: every {}s", interval.as_secs()),
        None => eprintln!("   Re-check: disabled"),
    }
    eprintln!(
        "   Connector: local ({} commands allowed)\n",
        config.connector.allowed_commands.len()
    );

    // ── HTTP API ─────────────────────────────────────────────────────────
    let state = AppState {
        manager: Arc::clone(&manager),
        connector: Arc::new(LocalExecConnector::new(&config.connector)),
        global_max_workers: config.global_max_workers,
        worker_offline_after: config.worker_offline_after,
    };
    let app = api::routes(state);
    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("binding {}", config.listen))?;
    tracing::info!(addr = %config.listen, "API server started");

    let recheck = async move {
        match recheck_handle {
            Some(handle) => handle.await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        result = axum::serve(listener, app).into_future() => {
            result.context("API server stopped")?;
        }
        result = reaper_handle => {
            let err = match result {
                Ok(Ok(())) => anyhow::anyhow!("lease reaper exited"),
                Ok(Err(e)) => anyhow::Error::new(e).context("lease reaper failed"),
                Err(e) => anyhow::Error::new(e).context("lease reaper panicked"),
            };
            return Err(err);
        }
        // The re-check never returns on its own; only a panic lands here.
        result = recheck => {
            let err = match result {
                Ok(()) => anyhow::anyhow!("running re-check exited"),
                Err(e) => anyhow::Error::new(e).context("running re-check panicked"),
            };
            return Err(err);
        }
        reason = reaper::wait_for_fatal(fatal) => {
            anyhow::bail!("decision ledger unavailable: {reason}");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown requested");
        }
    }

    Ok(())
}

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::{info, warn};

use tracewatch::{
    config::{ConfigWatcher, DaemonConfig, HotConfig},
    identity,
    monitors::{MonitorStore, RunEngine, Scheduler},
    rest,
    search::{HttpTransport, SpanStore},
    storage::Storage,
    traces::TraceService,
    AppContext,
};

#[derive(Parser)]
#[command(
    name = "tracewatch",
    about = "Tracewatch — agent trace observation and monitor evaluation daemon",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// REST API port
    #[arg(long, env = "TRACEWATCH_PORT")]
    port: Option<u16>,

    /// Data directory for config and the SQLite database
    #[arg(long, env = "TRACEWATCH_DATA_DIR")]
    data_dir: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "TRACEWATCH_LOG")]
    log: Option<String>,

    /// Span search backend base URL
    #[arg(long, env = "TRACEWATCH_BACKEND_URL")]
    backend_url: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "TRACEWATCH_LOG_FILE")]
    log_file: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the daemon (default when no subcommand given).
    ///
    /// Serves the trace read API and runs the monitor scheduler in the
    /// foreground until SIGINT/SIGTERM.
    ///
    /// Examples:
    ///   tracewatch serve
    ///   tracewatch
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = DaemonConfig::new(args.port, args.data_dir, args.log, args.backend_url);

    let _log_guard = init_tracing(&config.log, args.log_file.as_deref())?;

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
    }
}

fn init_tracing(
    filter: &str,
    log_file: Option<&std::path::Path>,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));

    match log_file {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let file = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("tracewatch.log");
            let appender = tracing_appender::rolling::daily(dir, file);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            fmt()
                .with_env_filter(env_filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Ok(Some(guard))
        }
        None => {
            fmt().with_env_filter(env_filter).init();
            Ok(None)
        }
    }
}

async fn serve(config: DaemonConfig) -> Result<()> {
    let config = Arc::new(config);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        backend = %config.backend_url,
        data_dir = %config.data_dir.display(),
        "tracewatch starting"
    );

    let storage = Arc::new(
        Storage::new(&config.data_dir)
            .await
            .context("open database")?,
    );

    let transport = HttpTransport::new(&config).context("build search transport")?;
    let span_store = SpanStore::new(Arc::new(transport));
    let trace_service = TraceService::new(span_store);
    let monitor_store = MonitorStore::new(storage.pool());

    // Ownership token: runs launched by this process carry it; anything
    // non-terminal with a different token belonged to a dead process.
    let owner = identity::ownership_token();
    match monitor_store.reconcile_orphans(&owner).await {
        Ok(orphans) if !orphans.is_empty() => {
            warn!(count = orphans.len(), "reconciled orphaned runs from a previous process");
        }
        Ok(_) => {}
        Err(e) => warn!(err = %e, "startup run reconciliation failed"),
    }

    let run_engine = RunEngine::new(
        monitor_store.clone(),
        trace_service.clone(),
        Arc::clone(&config),
    );

    // Hot-reload watcher is best-effort; fall back to startup values.
    let hot = match ConfigWatcher::start(&config.data_dir) {
        Some(watcher) => Arc::clone(&watcher.hot),
        None => Arc::new(RwLock::new(HotConfig {
            log_level: config.log.clone(),
            span_query_limit: config.span_query_limit,
        })),
    };

    let ctx = Arc::new(AppContext {
        config: Arc::clone(&config),
        hot,
        storage,
        trace_service: trace_service.clone(),
        monitor_store: monitor_store.clone(),
        run_engine: Arc::clone(&run_engine),
        started_at: std::time::Instant::now(),
        owner: owner.clone(),
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler = Scheduler::new(
        monitor_store,
        Arc::clone(&run_engine),
        config.scheduler_tick_secs,
        owner,
    );
    let scheduler_task = tokio::spawn(scheduler.run(shutdown_rx.clone()));

    let rest_task = tokio::spawn(rest::start_rest_server(Arc::clone(&ctx), shutdown_rx));

    shutdown_signal().await;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = scheduler_task.await;
    match rest_task.await {
        Ok(result) => result?,
        Err(e) => warn!(err = %e, "REST server task panicked"),
    }

    info!("tracewatch stopped");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                warn!(err = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

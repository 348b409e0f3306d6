use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

const DEFAULT_PORT: u16 = 4600;
const DEFAULT_BACKEND_URL: &str = "https://localhost:9200";
const DEFAULT_SPAN_QUERY_LIMIT: usize = 1000;
const DEFAULT_TICK_SECS: u64 = 30;
const DEFAULT_RUN_TIMEOUT_SECS: u64 = 900;
const DEFAULT_MAX_CONCURRENT_RUNS: usize = 4;
const DEFAULT_EVALUATOR_BIN: &str = "tracewatch-evaluator";

// ─── TOML config file ─────────────────────────────────────────────────────────

/// `{data_dir}/config.toml` — all fields are optional overrides.
/// Priority: CLI / env var  >  TOML  >  built-in default.
#[derive(Deserialize, Default)]
struct TomlConfig {
    /// REST API port (default: 4600).
    port: Option<u16>,
    /// Log level filter string, e.g. "debug", "info,tracewatch=trace" (default: "info").
    log: Option<String>,
    /// Span search backend base URL (default: https://localhost:9200).
    backend_url: Option<String>,
    /// Basic-auth username for the search backend.
    backend_username: Option<String>,
    /// Basic-auth password for the search backend.
    backend_password: Option<String>,
    /// Skip TLS certificate verification for the search backend (default: false).
    backend_insecure_skip_verify: Option<bool>,
    /// Default `size` for span-by-trace-id queries (default: 1000).
    span_query_limit: Option<usize>,
    /// Monitor scheduler tick interval in seconds (default: 30).
    scheduler_tick_secs: Option<u64>,
    /// Wall-clock timeout for one evaluator run in seconds (default: 900).
    run_timeout_secs: Option<u64>,
    /// Maximum evaluator runs in flight at once (default: 4).
    max_concurrent_runs: Option<usize>,
    /// Evaluator worker binary (default: "tracewatch-evaluator" from PATH).
    evaluator_bin: Option<String>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

// ─── DaemonConfig ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub log: String,
    /// Span search backend base URL (TRACEWATCH_BACKEND_URL env var).
    pub backend_url: String,
    /// Basic-auth credentials for the backend, if any.
    pub backend_username: Option<String>,
    pub backend_password: Option<String>,
    /// Skip TLS verification (self-signed dev clusters only).
    pub backend_insecure_skip_verify: bool,
    /// Default `size` for span-by-trace-id queries.
    pub span_query_limit: usize,
    /// Monitor scheduler tick interval.
    pub scheduler_tick_secs: u64,
    /// Wall-clock timeout for one evaluator run.
    pub run_timeout_secs: u64,
    /// Maximum evaluator runs in flight at once.
    pub max_concurrent_runs: usize,
    /// Evaluator worker binary path or name.
    pub evaluator_bin: String,
}

impl DaemonConfig {
    /// Build config from CLI/env args + optional TOML file.
    ///
    /// Priority (highest to lowest):
    ///   1. CLI / env — passed as `Some(value)` from clap
    ///   2. TOML file at `{data_dir}/config.toml`
    ///   3. Built-in defaults
    pub fn new(
        port: Option<u16>,
        data_dir: Option<PathBuf>,
        log: Option<String>,
        backend_url: Option<String>,
    ) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);

        // Load TOML as the lowest-priority override layer
        let toml = load_toml(&data_dir).unwrap_or_default();

        let port = port.or(toml.port).unwrap_or(DEFAULT_PORT);
        let log = log.or(toml.log).unwrap_or_else(|| "info".to_string());

        let backend_url = backend_url
            .or(toml.backend_url)
            .unwrap_or_else(|| DEFAULT_BACKEND_URL.to_string());

        let backend_username = std::env::var("TRACEWATCH_BACKEND_USERNAME")
            .ok()
            .filter(|v| !v.is_empty())
            .or(toml.backend_username);
        let backend_password = std::env::var("TRACEWATCH_BACKEND_PASSWORD")
            .ok()
            .filter(|v| !v.is_empty())
            .or(toml.backend_password);

        let backend_insecure_skip_verify = std::env::var("TRACEWATCH_BACKEND_INSECURE")
            .ok()
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .or(toml.backend_insecure_skip_verify)
            .unwrap_or(false);

        let span_query_limit = toml.span_query_limit.unwrap_or(DEFAULT_SPAN_QUERY_LIMIT);
        let scheduler_tick_secs = toml.scheduler_tick_secs.unwrap_or(DEFAULT_TICK_SECS);
        let run_timeout_secs = toml.run_timeout_secs.unwrap_or(DEFAULT_RUN_TIMEOUT_SECS);
        let max_concurrent_runs = toml
            .max_concurrent_runs
            .unwrap_or(DEFAULT_MAX_CONCURRENT_RUNS);

        let evaluator_bin = std::env::var("TRACEWATCH_EVALUATOR_BIN")
            .ok()
            .filter(|v| !v.is_empty())
            .or(toml.evaluator_bin)
            .unwrap_or_else(|| DEFAULT_EVALUATOR_BIN.to_string());

        Self {
            port,
            data_dir,
            log,
            backend_url,
            backend_username,
            backend_password,
            backend_insecure_skip_verify,
            span_query_limit,
            scheduler_tick_secs,
            run_timeout_secs,
            max_concurrent_runs,
            evaluator_bin,
        }
    }
}

// ─── Hot-reloadable config subset ─────────────────────────────────────────────

/// Non-critical config fields that can be changed without restarting the daemon.
#[derive(Debug, Clone)]
pub struct HotConfig {
    pub log_level: String,
    pub span_query_limit: usize,
}

/// Watches `config.toml` for changes and reloads non-critical fields.
///
/// The watcher uses the `notify` crate (kqueue on macOS, inotify on Linux)
/// to detect file modifications. Only `log` and `span_query_limit` are
/// reloaded; port, backend address, and other startup-only fields require a
/// full restart.
pub struct ConfigWatcher {
    pub hot: Arc<RwLock<HotConfig>>,
    // Hold the watcher alive; dropping it stops the file watch.
    _watcher: notify_debouncer_full::Debouncer<
        notify_debouncer_full::notify::RecommendedWatcher,
        notify_debouncer_full::FileIdMap,
    >,
}

impl ConfigWatcher {
    /// Start watching `{data_dir}/config.toml` for changes.
    ///
    /// Returns `None` if the watcher could not be created (non-fatal; the
    /// daemon runs fine without hot-reload).
    pub fn start(data_dir: &Path) -> Option<Self> {
        let config_path = data_dir.join("config.toml");
        let initial = load_hot_config(&config_path);
        let hot = Arc::new(RwLock::new(initial));

        let hot_clone = hot.clone();
        let config_path_clone = config_path.clone();
        let rt_handle = tokio::runtime::Handle::current();

        let watcher = notify_debouncer_full::new_debouncer(
            std::time::Duration::from_secs(2),
            None,
            move |result: notify_debouncer_full::DebounceEventResult| {
                if let Ok(events) = result {
                    // Only act on modify/create events
                    let relevant = events.iter().any(|e| {
                        use notify_debouncer_full::notify::EventKind;
                        matches!(e.event.kind, EventKind::Modify(_) | EventKind::Create(_))
                    });
                    if relevant {
                        let hot = hot_clone.clone();
                        let path = config_path_clone.clone();
                        rt_handle.spawn(async move {
                            let new_config = load_hot_config(&path);
                            let mut guard = hot.write().await;
                            if guard.log_level != new_config.log_level
                                || guard.span_query_limit != new_config.span_query_limit
                            {
                                info!(
                                    log_level = %new_config.log_level,
                                    span_query_limit = new_config.span_query_limit,
                                    "config.toml reloaded"
                                );
                                *guard = new_config;
                            }
                        });
                    }
                }
            },
        );

        match watcher {
            Ok(mut debouncer) => {
                use notify_debouncer_full::notify::Watcher as _;
                // Watch the data_dir (parent of config.toml) since watching a
                // non-existent file fails on some platforms.
                let watch_path = config_path.parent().unwrap_or_else(|| Path::new("."));
                if let Err(e) = debouncer.watcher().watch(
                    watch_path,
                    notify_debouncer_full::notify::RecursiveMode::NonRecursive,
                ) {
                    warn!("config watcher failed to start: {e} — hot-reload disabled");
                    return None;
                }
                info!(path = %config_path.display(), "config hot-reload watcher started");
                Some(Self {
                    hot,
                    _watcher: debouncer,
                })
            }
            Err(e) => {
                warn!("config watcher creation failed: {e} — hot-reload disabled");
                None
            }
        }
    }
}

/// Load only the hot-reloadable fields from config.toml.
fn load_hot_config(path: &Path) -> HotConfig {
    let toml = std::fs::read_to_string(path)
        .ok()
        .and_then(|s| toml::from_str::<TomlConfig>(&s).ok())
        .unwrap_or_default();
    HotConfig {
        log_level: toml.log.unwrap_or_else(|| "info".to_string()),
        span_query_limit: toml.span_query_limit.unwrap_or(DEFAULT_SPAN_QUERY_LIMIT),
    }
}

fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        // ~/Library/Application Support/tracewatch
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("tracewatch");
        }
    }
    #[cfg(target_os = "linux")]
    {
        // $XDG_DATA_HOME/tracewatch or ~/.local/share/tracewatch
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("tracewatch");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join(".local")
                .join("share")
                .join("tracewatch");
        }
    }
    #[cfg(target_os = "windows")]
    {
        // %APPDATA%\tracewatch
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("tracewatch");
        }
    }
    // Fallback
    PathBuf::from(".tracewatch")
}

pub mod config;
pub mod error;
pub mod identity;
pub mod monitors;
pub mod rest;
pub mod search;
pub mod storage;
pub mod traces;

use std::sync::Arc;

use tokio::sync::RwLock;

use config::{DaemonConfig, HotConfig};
use monitors::{MonitorStore, RunEngine};
use storage::Storage;
use traces::TraceService;

/// Shared application state passed to every route handler and background task.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<DaemonConfig>,
    /// Hot-reloadable config subset (log filter, default span query limit).
    pub hot: Arc<RwLock<HotConfig>>,
    pub storage: Arc<Storage>,
    /// Trace read path (overviews, by-id, export).
    pub trace_service: TraceService,
    /// Monitor & run repository.
    pub monitor_store: MonitorStore,
    /// Evaluator subprocess engine.
    pub run_engine: Arc<RunEngine>,
    pub started_at: std::time::Instant,
    /// Run ownership token of this process (see `identity`).
    pub owner: String,
}

//! Periodic monitor scheduler.
//!
//! A single background task per process. Each tick selects due monitors and
//! creates their next run inside the store's per-monitor transaction, then
//! hands the run to the engine without waiting for it. Missed windows are not
//! replayed: after downtime, one run per monitor fires covering the whole gap.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::monitors::runner::RunEngine;
use crate::monitors::store::MonitorStore;

pub struct Scheduler {
    store: MonitorStore,
    engine: Arc<RunEngine>,
    tick: Duration,
    owner: String,
}

impl Scheduler {
    pub fn new(store: MonitorStore, engine: Arc<RunEngine>, tick_secs: u64, owner: String) -> Self {
        Self {
            store,
            engine,
            tick: Duration::from_secs(tick_secs.max(1)),
            owner,
        }
    }

    /// Tick loop. Returns when `shutdown` flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(tick_secs = self.tick.as_secs(), "monitor scheduler started");
        let mut ticker = interval(self.tick);
        ticker.tick().await; // skip the immediate first tick

        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                _ = shutdown.changed() => {
                    info!("monitor scheduler shutting down");
                    break;
                }
            }
        }
    }

    async fn tick(&self) {
        let now = Utc::now();
        let due = match self.store.due_monitors(now).await {
            Ok(due) => due,
            Err(e) => {
                warn!(err = %e, "scheduler tick failed to select due monitors");
                return;
            }
        };
        if due.is_empty() {
            return;
        }
        debug!(count = due.len(), "due monitors selected");

        for monitor in due {
            match self.store.schedule_run(&monitor.id, now, &self.owner).await {
                Ok(Some(run)) => {
                    info!(
                        monitor_id = %monitor.id,
                        run_id = %run.id,
                        window_start = %run.window_start,
                        window_end = %run.window_end,
                        "run scheduled"
                    );
                    self.engine.launch(monitor, run);
                }
                // The monitor lost its due state between selection and the
                // transaction (stopped, or another replica claimed it).
                Ok(None) => {}
                Err(e) => {
                    warn!(monitor_id = %monitor.id, err = %e, "failed to schedule run");
                }
            }
        }
    }
}

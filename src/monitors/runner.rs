//! Run engine — owns the evaluator subprocess lifecycle.
//!
//! The evaluator is a separate worker process: configuration and the sampled
//! trace batch go in as a JSON manifest on stdin, per-trace scores come back
//! as a JSON result manifest on the final stdout line, and stderr streams into
//! a bounded ring buffer persisted with the run. Keeping evaluators
//! out-of-process keeps their dependency stacks out of this binary.

use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex, Semaphore};
use tracing::{info, warn};

use crate::config::DaemonConfig;
use crate::error::Result;
use crate::monitors::model::{Monitor, MonitorRun, RunStatus, TraceScore};
use crate::monitors::store::{MonitorStore, RunOutcome, ScoreRecord};
use crate::search::query::{ResourceFilter, SortOrder};
use crate::traces::service::{TraceQuery, TraceService, MAX_TRACES_PER_REQUEST};

/// stderr/stdout lines kept per run.
const MAX_LOG_LINES: usize = 500;
/// Grace period between SIGTERM and SIGKILL.
const TERM_GRACE: Duration = Duration::from_secs(5);

// ─── Log ring buffer ──────────────────────────────────────────────────────────

/// Bounded circular buffer of subprocess output lines.
pub struct LogBuffer {
    lines: VecDeque<String>,
    capacity: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, line: String) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn render(&self) -> String {
        self.lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

// ─── Sampling ─────────────────────────────────────────────────────────────────

/// Deterministic per-trace sampling decision.
///
/// Buckets the first 8 hex chars of the trace id into 0..100. Deterministic
/// so a rerun evaluates the same trace set as the original run.
pub fn is_sampled(trace_id: &str, rate: u8) -> bool {
    if rate >= 100 {
        return true;
    }
    if rate == 0 {
        return false;
    }
    let prefix: String = trace_id.chars().take(8).collect();
    let bucket = u64::from_str_radix(&prefix, 16)
        .unwrap_or_else(|_| trace_id.bytes().map(u64::from).sum());
    bucket % 100 < u64::from(rate)
}

// ─── Result manifest ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ResultManifest {
    scores: Vec<TraceScore>,
}

// ─── Engine ───────────────────────────────────────────────────────────────────

struct LiveRun {
    monitor_id: String,
    cancel: watch::Sender<bool>,
    logs: Arc<Mutex<LogBuffer>>,
}

pub struct RunEngine {
    store: MonitorStore,
    traces: TraceService,
    config: Arc<DaemonConfig>,
    /// Bounds evaluator subprocesses in flight.
    limiter: Arc<Semaphore>,
    live: Mutex<HashMap<String, LiveRun>>,
}

impl RunEngine {
    pub fn new(store: MonitorStore, traces: TraceService, config: Arc<DaemonConfig>) -> Arc<Self> {
        let permits = config.max_concurrent_runs.max(1);
        Arc::new(Self {
            store,
            traces,
            config,
            limiter: Arc::new(Semaphore::new(permits)),
            live: Mutex::new(HashMap::new()),
        })
    }

    /// Fire-and-forget: the run executes on its own task.
    pub fn launch(self: &Arc<Self>, monitor: Monitor, run: MonitorRun) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.execute(monitor, run).await;
        });
    }

    /// Request cancellation of every in-flight run of a monitor. The runs'
    /// reapers transition them to `cancelled` once the subprocess is down.
    pub async fn cancel_runs_for_monitor(&self, monitor_id: &str) {
        let live = self.live.lock().await;
        for (run_id, handle) in live.iter() {
            if handle.monitor_id == monitor_id {
                info!(run_id = %run_id, "cancelling in-flight run");
                let _ = handle.cancel.send(true);
            }
        }
    }

    /// Live stderr tail of a run still in flight, if any.
    pub async fn live_logs(&self, run_id: &str) -> Option<String> {
        let live = self.live.lock().await;
        let handle = live.get(run_id)?;
        let logs = handle.logs.lock().await;
        if logs.is_empty() {
            None
        } else {
            Some(logs.render())
        }
    }

    async fn execute(self: Arc<Self>, monitor: Monitor, run: MonitorRun) {
        let Ok(permit) = Arc::clone(&self.limiter).acquire_owned().await else {
            return; // engine shutting down
        };

        let run = match self.store.mark_running(&run.id).await {
            Ok(run) => run,
            Err(e) => {
                warn!(run_id = %run.id, err = %e, "failed to mark run running");
                return;
            }
        };
        if run.status != RunStatus::Running {
            // A concurrent stop cancelled the row before we picked it up.
            return;
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let logs = Arc::new(Mutex::new(LogBuffer::new(MAX_LOG_LINES)));
        self.live.lock().await.insert(
            run.id.clone(),
            LiveRun {
                monitor_id: monitor.id.clone(),
                cancel: cancel_tx,
                logs: Arc::clone(&logs),
            },
        );

        let outcome = self
            .run_evaluator(&monitor, &run, cancel_rx, Arc::clone(&logs))
            .await;

        self.live.lock().await.remove(&run.id);

        let rendered = {
            let logs = logs.lock().await;
            if logs.is_empty() {
                None
            } else {
                Some(logs.render())
            }
        };
        match self
            .store
            .finish_run(&run.id, outcome, rendered.as_deref())
            .await
        {
            Ok(finished) => info!(
                run_id = %run.id,
                status = finished.status.as_str(),
                scores = finished.score_count,
                "run finished"
            ),
            Err(e) => warn!(run_id = %run.id, err = %e, "failed to persist run outcome"),
        }

        drop(permit);
    }

    /// Collect the sampled batch, drive the subprocess, produce the outcome.
    /// Every failure path folds into `RunOutcome::Failed` with its own prefix.
    async fn run_evaluator(
        &self,
        monitor: &Monitor,
        run: &MonitorRun,
        mut cancel: watch::Receiver<bool>,
        logs: Arc<Mutex<LogBuffer>>,
    ) -> RunOutcome {
        // 1. Sampled trace batch for the run window.
        let page = match self.collect_traces(monitor, run).await {
            Ok(page) => page,
            Err(e) => {
                return RunOutcome::Failed {
                    message: format!("traces: {e}"),
                }
            }
        };
        let batch: Vec<_> = page
            .into_iter()
            .filter(|t| is_sampled(&t.trace_id, monitor.sampling_rate))
            .collect();

        if batch.is_empty() {
            // Nothing in the window — a successful no-op, not a failure.
            return RunOutcome::Succeeded {
                evaluated_count: 0,
                scores: Vec::new(),
            };
        }
        let trace_starts: HashMap<String, DateTime<Utc>> = batch
            .iter()
            .map(|t| (t.trace_id.clone(), t.start_time))
            .collect();

        let manifest = json!({
            "runId": run.id,
            "monitor": {
                "id": monitor.id,
                "name": monitor.name,
                "evaluators": monitor.evaluators,
                "samplingRate": monitor.sampling_rate,
            },
            "window": { "start": run.window_start, "end": run.window_end },
            "traces": batch,
        });

        // 2. Subprocess.
        let mut cmd = Command::new(&self.config.evaluator_bin);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &monitor.credentials {
            cmd.env(key, value);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return RunOutcome::Failed {
                    message: format!("spawn: {}: {e}", self.config.evaluator_bin),
                }
            }
        };

        if let Some(mut stdin) = child.stdin.take() {
            let payload = manifest.to_string();
            if let Err(e) = stdin.write_all(payload.as_bytes()).await {
                warn!(run_id = %run.id, err = %e, "failed to write evaluator manifest");
            }
            // Close stdin so the worker sees EOF.
            drop(stdin);
        }

        // stderr → ring buffer.
        let stderr_task = child.stderr.take().map(|stderr| {
            let logs = Arc::clone(&logs);
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    logs.lock().await.push(line);
                }
            })
        });

        // stdout → ring buffer, remembering the last non-empty line (the
        // result manifest).
        let stdout_task = child.stdout.take().map(|stdout| {
            let logs = Arc::clone(&logs);
            tokio::spawn(async move {
                let mut last = None;
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.trim().is_empty() {
                        last = Some(line.clone());
                    }
                    logs.lock().await.push(line);
                }
                last
            })
        });

        // 3. Wait, bounded by the wall clock and the cancel signal. The wait
        // future is pinned in an inner scope so the child handle is free for
        // termination afterwards.
        enum WaitOutcome {
            Exited(std::io::Result<std::process::ExitStatus>),
            TimedOut,
            Cancelled,
        }
        let timeout = Duration::from_secs(self.config.run_timeout_secs);
        let waited = {
            let wait = child.wait();
            tokio::pin!(wait);
            tokio::select! {
                status = &mut wait => WaitOutcome::Exited(status),
                _ = tokio::time::sleep(timeout) => WaitOutcome::TimedOut,
                _ = cancel.changed() => WaitOutcome::Cancelled,
            }
        };
        let status = match waited {
            WaitOutcome::Exited(status) => status,
            WaitOutcome::TimedOut => {
                terminate(&mut child).await;
                return RunOutcome::Failed {
                    message: format!("timeout: evaluator exceeded {}s", timeout.as_secs()),
                };
            }
            WaitOutcome::Cancelled => {
                terminate(&mut child).await;
                return RunOutcome::Cancelled;
            }
        };

        let final_stdout = match stdout_task {
            Some(task) => task.await.ok().flatten(),
            None => None,
        };
        if let Some(task) = stderr_task {
            let _ = task.await;
        }

        let status = match status {
            Ok(status) => status,
            Err(e) => {
                return RunOutcome::Failed {
                    message: format!("wait: {e}"),
                }
            }
        };
        if !status.success() {
            return RunOutcome::Failed {
                message: format!("exit: evaluator exited with {status}"),
            };
        }

        // 4. Result manifest from the final stdout record.
        let Some(line) = final_stdout else {
            return RunOutcome::Failed {
                message: "result: evaluator produced no result manifest".to_string(),
            };
        };
        let manifest: ResultManifest = match serde_json::from_str(&line) {
            Ok(manifest) => manifest,
            Err(e) => {
                return RunOutcome::Failed {
                    message: format!("result: malformed result manifest: {e}"),
                }
            }
        };

        let mut scores = Vec::with_capacity(manifest.scores.len());
        for score in manifest.scores {
            let Some(trace_start) = trace_starts.get(&score.trace_id).copied() else {
                warn!(run_id = %run.id, trace_id = %score.trace_id,
                      "evaluator scored a trace outside the batch — dropped");
                continue;
            };
            scores.push(ScoreRecord {
                trace_id: score.trace_id,
                evaluator: score.evaluator,
                score: score.score,
                reasoning: score.reasoning,
                trace_start,
            });
        }

        RunOutcome::Succeeded {
            evaluated_count: batch.len() as i64,
            scores,
        }
    }

    /// One export page over the run window (ascending, full traces). Windows
    /// holding more traces than one page are clipped to the first page, with
    /// a warning.
    async fn collect_traces(
        &self,
        monitor: &Monitor,
        run: &MonitorRun,
    ) -> Result<Vec<crate::traces::service::FullTrace>> {
        let query = TraceQuery {
            filter: ResourceFilter {
                component_uid: monitor.component_uid.clone(),
                environment_uid: monitor.environment_uid.clone(),
            },
            range: Some((run.window_start, run.window_end)),
            limit: MAX_TRACES_PER_REQUEST,
            order: SortOrder::Asc,
            after: None,
        };
        let page = self.traces.export_traces(&query).await?;
        if page.next_cursor.is_some() || page.truncated {
            warn!(
                run_id = %run.id,
                fetched = page.traces.len(),
                total = page.total_count,
                "run window holds more traces than one evaluation batch — clipped"
            );
        }
        Ok(page.traces)
    }
}

/// SIGTERM, a grace period, then SIGKILL.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // Safety: plain signal send to a pid we own.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        if tokio::time::timeout(TERM_GRACE, child.wait()).await.is_ok() {
            return;
        }
    }
    if let Err(e) = child.kill().await {
        warn!(err = %e, "failed to kill evaluator subprocess");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_buffer_evicts_oldest() {
        let mut buffer = LogBuffer::new(3);
        for i in 0..5 {
            buffer.push(format!("line-{i}"));
        }
        assert_eq!(buffer.render(), "line-2\nline-3\nline-4");
    }

    #[test]
    fn sampling_is_deterministic() {
        let id = "a3f8b2c4d5e6f708";
        let first = is_sampled(id, 37);
        for _ in 0..10 {
            assert_eq!(is_sampled(id, 37), first);
        }
    }

    #[test]
    fn sampling_boundaries() {
        assert!(is_sampled("deadbeef", 100));
        assert!(!is_sampled("deadbeef", 0));
        // 0xdeadbeef = 3735928559, bucket 59 — sampled only at rates above 59.
        assert!(!is_sampled("deadbeef", 59));
        assert!(is_sampled("deadbeef", 60));
    }

    #[test]
    fn sampling_tolerates_non_hex_ids() {
        // Falls back to a byte-sum bucket instead of panicking.
        let _ = is_sampled("not-hex-at-all", 50);
        assert!(is_sampled("not-hex-at-all", 100));
    }
}

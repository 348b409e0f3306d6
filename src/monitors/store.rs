//! Monitor & run repository over SQLite.
//!
//! All state mutations run inside transactions scoped to a single method and
//! roll back on any error. Run creation is serialized per monitor through the
//! `next_run_time` advance; terminal run rows are never mutated.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::monitors::model::{
    EvaluatorSpec, Monitor, MonitorRun, MonitorScope, MonitorStatus, MonitorType, NewMonitor,
    RunStatus,
};
use crate::storage::{db_ts, with_timeout};

/// Prefix carried by runs failed at startup reconciliation.
pub const ORPHANED_PREFIX: &str = "orphaned:";

// ─── Row types ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, sqlx::FromRow)]
struct MonitorRow {
    id: String,
    org_name: String,
    project_name: String,
    agent_name: String,
    name: String,
    monitor_type: String,
    interval_minutes: Option<i64>,
    next_run_time: Option<String>,
    sampling_rate: i64,
    trace_start: Option<String>,
    trace_end: Option<String>,
    component_uid: String,
    environment_uid: String,
    evaluators: String,
    credentials: String,
    status: String,
    created_at: String,
    updated_at: String,
}

impl MonitorRow {
    fn into_monitor(self) -> Result<Monitor> {
        let evaluators: Vec<EvaluatorSpec> = serde_json::from_str(&self.evaluators)?;
        let credentials: HashMap<String, String> = serde_json::from_str(&self.credentials)?;
        Ok(Monitor {
            id: self.id,
            scope: MonitorScope {
                org_name: self.org_name,
                project_name: self.project_name,
                agent_name: self.agent_name,
            },
            name: self.name,
            monitor_type: MonitorType::parse(&self.monitor_type)?,
            interval_minutes: self.interval_minutes,
            next_run_time: self.next_run_time.as_deref().map(parse_ts).transpose()?,
            sampling_rate: self.sampling_rate.clamp(0, 100) as u8,
            trace_start: self.trace_start.as_deref().map(parse_ts).transpose()?,
            trace_end: self.trace_end.as_deref().map(parse_ts).transpose()?,
            component_uid: self.component_uid,
            environment_uid: self.environment_uid,
            evaluators,
            credentials,
            status: MonitorStatus::parse(&self.status)?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct RunRow {
    id: String,
    monitor_id: String,
    created_at: String,
    window_start: String,
    window_end: String,
    status: String,
    started_at: Option<String>,
    finished_at: Option<String>,
    error_message: Option<String>,
    owner: String,
    evaluated_count: i64,
    score_count: i64,
}

impl RunRow {
    fn into_run(self) -> Result<MonitorRun> {
        Ok(MonitorRun {
            id: self.id,
            monitor_id: self.monitor_id,
            created_at: parse_ts(&self.created_at)?,
            window_start: parse_ts(&self.window_start)?,
            window_end: parse_ts(&self.window_end)?,
            status: RunStatus::parse(&self.status)?,
            started_at: self.started_at.as_deref().map(parse_ts).transpose()?,
            finished_at: self.finished_at.as_deref().map(parse_ts).transpose()?,
            error_message: self.error_message,
            owner: self.owner,
            evaluated_count: self.evaluated_count,
            score_count: self.score_count,
        })
    }
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::internal(format!("stored timestamp '{s}' is invalid: {e}")))
}

// ─── Score records ────────────────────────────────────────────────────────────

/// One per-trace score row ready for persistence.
#[derive(Debug, Clone)]
pub struct ScoreRecord {
    pub trace_id: String,
    pub evaluator: String,
    pub score: f64,
    pub reasoning: Option<String>,
    /// Trace start time — the x-axis of score time-series.
    pub trace_start: DateTime<Utc>,
}

/// Stored score row as returned by queries.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ScoreRow {
    pub run_id: String,
    pub trace_id: String,
    pub evaluator: String,
    pub score: f64,
    pub reasoning: Option<String>,
    pub trace_start: String,
}

/// Per-evaluator aggregate for the scores summary endpoint.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EvaluatorSummary {
    pub evaluator: String,
    pub avg_score: f64,
    pub score_count: i64,
    pub trace_count: i64,
}

/// Terminal outcome handed to [`MonitorStore::finish_run`].
#[derive(Debug)]
pub enum RunOutcome {
    Succeeded {
        evaluated_count: i64,
        scores: Vec<ScoreRecord>,
    },
    Failed {
        message: String,
    },
    Cancelled,
}

// ─── MonitorStore ─────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct MonitorStore {
    pool: SqlitePool,
}

impl MonitorStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // ─── Monitor CRUD ─────────────────────────────────────────────────────────

    pub async fn create_monitor(&self, scope: &MonitorScope, new: &NewMonitor) -> Result<Monitor> {
        let now = Utc::now();
        new.validate(now)?;

        let id = Uuid::new_v4().to_string();
        let evaluators = serde_json::to_string(&new.evaluators)?;
        let credentials = serde_json::to_string(&new.credentials)?;

        let result = sqlx::query(
            "INSERT INTO monitors (id, org_name, project_name, agent_name, name, monitor_type,
                 interval_minutes, next_run_time, sampling_rate, trace_start, trace_end,
                 component_uid, environment_uid, evaluators, credentials, status,
                 created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, NULL, ?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?)",
        )
        .bind(&id)
        .bind(&scope.org_name)
        .bind(&scope.project_name)
        .bind(&scope.agent_name)
        .bind(&new.name)
        .bind(new.monitor_type.as_str())
        .bind(new.interval_minutes)
        .bind(new.sampling_rate as i64)
        .bind(new.trace_start.map(db_ts))
        .bind(new.trace_end.map(db_ts))
        .bind(&new.component_uid)
        .bind(&new.environment_uid)
        .bind(&evaluators)
        .bind(&credentials)
        .bind(db_ts(now))
        .bind(db_ts(now))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => self.monitor_by_id(&id).await,
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(Error::conflict(
                format!("monitor '{}' already exists in this scope", new.name),
            )),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn list_monitors(&self, scope: &MonitorScope) -> Result<Vec<Monitor>> {
        let rows: Vec<MonitorRow> = with_timeout(async {
            Ok(sqlx::query_as(
                "SELECT * FROM monitors
                 WHERE org_name = ? AND project_name = ? AND agent_name = ?
                 ORDER BY created_at DESC",
            )
            .bind(&scope.org_name)
            .bind(&scope.project_name)
            .bind(&scope.agent_name)
            .fetch_all(&self.pool)
            .await?)
        })
        .await?;

        rows.into_iter().map(MonitorRow::into_monitor).collect()
    }

    pub async fn monitor_by_id(&self, id: &str) -> Result<Monitor> {
        let row: Option<MonitorRow> = sqlx::query_as("SELECT * FROM monitors WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.ok_or_else(|| Error::not_found(format!("monitor {id} does not exist")))?
            .into_monitor()
    }

    /// Scoped fetch for the REST layer — an id outside the caller's scope is
    /// indistinguishable from a missing one.
    pub async fn monitor_in_scope(&self, scope: &MonitorScope, id: &str) -> Result<Monitor> {
        let monitor = self.monitor_by_id(id).await?;
        if &monitor.scope != scope {
            return Err(Error::not_found(format!("monitor {id} does not exist")));
        }
        Ok(monitor)
    }

    /// Replace the mutable configuration of a monitor. Allowed only while the
    /// monitor is not actively scheduled (`pending` or `stopped`).
    pub async fn update_monitor(&self, id: &str, new: &NewMonitor) -> Result<Monitor> {
        let now = Utc::now();
        new.validate(now)?;

        let monitor = self.monitor_by_id(id).await?;
        if !matches!(monitor.status, MonitorStatus::Pending | MonitorStatus::Stopped) {
            return Err(Error::conflict(format!(
                "monitor {id} is {} — stop it before updating",
                monitor.status.as_str()
            )));
        }
        if monitor.monitor_type != new.monitor_type {
            return Err(Error::conflict("monitor type cannot change after creation"));
        }
        // The target deployment is part of the monitor's identity: its run
        // history and scores are only meaningful against one component.
        if monitor.component_uid != new.component_uid
            || monitor.environment_uid != new.environment_uid
        {
            return Err(Error::conflict(
                "componentUid and environmentUid cannot change after creation",
            ));
        }

        sqlx::query(
            "UPDATE monitors SET name = ?, interval_minutes = ?, sampling_rate = ?,
                 trace_start = ?, trace_end = ?, evaluators = ?, credentials = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(&new.name)
        .bind(new.interval_minutes)
        .bind(new.sampling_rate as i64)
        .bind(new.trace_start.map(db_ts))
        .bind(new.trace_end.map(db_ts))
        .bind(serde_json::to_string(&new.evaluators)?)
        .bind(serde_json::to_string(&new.credentials)?)
        .bind(db_ts(now))
        .bind(id)
        .execute(&self.pool)
        .await?;

        self.monitor_by_id(id).await
    }

    /// Delete a monitor along with its runs and scores. Refused while a run
    /// is in flight.
    pub async fn delete_monitor(&self, id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let live: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM monitor_runs
             WHERE monitor_id = ? AND status IN ('pending', 'running')",
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;
        if live > 0 {
            return Err(Error::conflict(format!(
                "monitor {id} has {live} unfinished run(s) — stop it first"
            )));
        }

        sqlx::query("DELETE FROM run_scores WHERE monitor_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM monitor_runs WHERE monitor_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query("DELETE FROM monitors WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(Error::not_found(format!("monitor {id} does not exist")));
        }

        tx.commit().await?;
        Ok(())
    }

    // ─── Start / stop ─────────────────────────────────────────────────────────

    /// Activate a monitor and arm its schedule.
    ///
    /// `future`: first fire at `now + interval`, covering `[now, fire)` — so a
    /// freshly started monitor never evaluates traces from before its start.
    /// `past`: fires on the next tick (`next_run_time = now`).
    pub async fn start_monitor(&self, id: &str) -> Result<Monitor> {
        let now = Utc::now();
        let monitor = self.monitor_by_id(id).await?;

        match monitor.status {
            MonitorStatus::Active => return Ok(monitor),
            MonitorStatus::Completed => {
                return Err(Error::conflict(format!(
                    "monitor {id} has completed and cannot be restarted"
                )))
            }
            MonitorStatus::Pending | MonitorStatus::Stopped => {}
        }

        let next_run_time = match monitor.monitor_type {
            MonitorType::Future => {
                let interval = monitor.interval_minutes.unwrap_or(0);
                now + Duration::minutes(interval)
            }
            MonitorType::Past => now,
        };

        sqlx::query(
            "UPDATE monitors SET status = 'active', next_run_time = ?, updated_at = ? WHERE id = ?",
        )
        .bind(db_ts(next_run_time))
        .bind(db_ts(now))
        .bind(id)
        .execute(&self.pool)
        .await?;

        info!(monitor_id = %id, next_run = %next_run_time, "monitor started");
        self.monitor_by_id(id).await
    }

    /// Halt scheduling. Queued (pending) runs flip to cancelled here; in-flight
    /// runs are terminated by the run engine.
    pub async fn stop_monitor(&self, id: &str) -> Result<Monitor> {
        let now = Utc::now();
        let monitor = self.monitor_by_id(id).await?;

        match monitor.status {
            MonitorStatus::Stopped => return Ok(monitor),
            MonitorStatus::Completed => {
                return Err(Error::conflict(format!("monitor {id} has already completed")))
            }
            MonitorStatus::Pending | MonitorStatus::Active => {}
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE monitors SET status = 'stopped', next_run_time = NULL, updated_at = ?
             WHERE id = ?",
        )
        .bind(db_ts(now))
        .bind(id)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "UPDATE monitor_runs SET status = 'cancelled', finished_at = ?
             WHERE monitor_id = ? AND status = 'pending'",
        )
        .bind(db_ts(now))
        .bind(id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        info!(monitor_id = %id, "monitor stopped");
        self.monitor_by_id(id).await
    }

    // ─── Scheduling ───────────────────────────────────────────────────────────

    /// Active monitors whose `next_run_time` has passed, soonest first.
    pub async fn due_monitors(&self, now: DateTime<Utc>) -> Result<Vec<Monitor>> {
        let rows: Vec<MonitorRow> = with_timeout(async {
            Ok(sqlx::query_as(
                "SELECT * FROM monitors
                 WHERE status = 'active' AND next_run_time IS NOT NULL AND next_run_time <= ?
                 ORDER BY next_run_time ASC",
            )
            .bind(db_ts(now))
            .fetch_all(&self.pool)
            .await?)
        })
        .await?;

        rows.into_iter().map(MonitorRow::into_monitor).collect()
    }

    /// Create the next run for a due monitor, in one transaction:
    /// insert the `pending` run row, then advance `next_run_time`
    /// (future) or complete the monitor (past).
    ///
    /// Returns `None` when the monitor lost its due state between the
    /// scheduler's selection and this transaction.
    pub async fn schedule_run(
        &self,
        monitor_id: &str,
        now: DateTime<Utc>,
        owner: &str,
    ) -> Result<Option<MonitorRun>> {
        let mut tx = self.pool.begin().await?;

        // Re-read inside the transaction — the selection snapshot may be stale.
        let row: Option<MonitorRow> = sqlx::query_as("SELECT * FROM monitors WHERE id = ?")
            .bind(monitor_id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(monitor) = row.map(MonitorRow::into_monitor).transpose()? else {
            return Ok(None);
        };
        let due = monitor.status == MonitorStatus::Active
            && monitor.next_run_time.is_some_and(|t| t <= now);
        if !due {
            return Ok(None);
        }

        let (window_start, window_end) = match monitor.monitor_type {
            MonitorType::Past => {
                let (Some(start), Some(end)) = (monitor.trace_start, monitor.trace_end) else {
                    return Err(Error::internal(format!(
                        "past monitor {monitor_id} has no trace window"
                    )));
                };
                (start, end)
            }
            MonitorType::Future => {
                // Continuous coverage: pick up exactly where the last run's
                // window ended; the first run reaches back one interval.
                let last_end: Option<String> = sqlx::query_scalar(
                    "SELECT window_end FROM monitor_runs
                     WHERE monitor_id = ? ORDER BY created_at DESC, id DESC LIMIT 1",
                )
                .bind(monitor_id)
                .fetch_optional(&mut *tx)
                .await?;
                let interval = Duration::minutes(monitor.interval_minutes.unwrap_or(0));
                let start = match last_end {
                    Some(s) => parse_ts(&s)?,
                    None => monitor.next_run_time.unwrap_or(now) - interval,
                };
                (start, now)
            }
        };

        let run_id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO monitor_runs (id, monitor_id, created_at, window_start, window_end,
                 status, owner)
             VALUES (?, ?, ?, ?, ?, 'pending', ?)",
        )
        .bind(&run_id)
        .bind(monitor_id)
        .bind(db_ts(now))
        .bind(db_ts(window_start))
        .bind(db_ts(window_end))
        .bind(owner)
        .execute(&mut *tx)
        .await?;

        match monitor.monitor_type {
            MonitorType::Future => {
                let interval = monitor.interval_minutes.unwrap_or(0);
                let next = monitor.next_run_time.unwrap_or(now) + Duration::minutes(interval);
                sqlx::query(
                    "UPDATE monitors SET next_run_time = ?, updated_at = ? WHERE id = ?",
                )
                .bind(db_ts(next))
                .bind(db_ts(now))
                .bind(monitor_id)
                .execute(&mut *tx)
                .await?;
            }
            MonitorType::Past => {
                // A past monitor fires exactly once.
                sqlx::query(
                    "UPDATE monitors SET status = 'completed', next_run_time = NULL, updated_at = ?
                     WHERE id = ?",
                )
                .bind(db_ts(now))
                .bind(monitor_id)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        self.run_by_id(&run_id).await.map(Some)
    }

    // ─── Run lifecycle ────────────────────────────────────────────────────────

    pub async fn run_by_id(&self, run_id: &str) -> Result<MonitorRun> {
        let row: Option<RunRow> = sqlx::query_as("SELECT * FROM monitor_runs WHERE id = ?")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        row.ok_or_else(|| Error::not_found(format!("run {run_id} does not exist")))?
            .into_run()
    }

    pub async fn list_runs(&self, monitor_id: &str) -> Result<Vec<MonitorRun>> {
        let rows: Vec<RunRow> = sqlx::query_as(
            "SELECT * FROM monitor_runs WHERE monitor_id = ?
             ORDER BY created_at DESC, id DESC",
        )
        .bind(monitor_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(RunRow::into_run).collect()
    }

    /// `pending → running`. Returns the post-transition row; callers must
    /// check the status — a concurrent stop may have cancelled the run first.
    pub async fn mark_running(&self, run_id: &str) -> Result<MonitorRun> {
        sqlx::query(
            "UPDATE monitor_runs SET status = 'running', started_at = ?
             WHERE id = ? AND status = 'pending'",
        )
        .bind(db_ts(Utc::now()))
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        self.run_by_id(run_id).await
    }

    /// Commit a run's terminal state. Scores are persisted in the same
    /// transaction as the status flip, so an observer reading `succeeded` is
    /// guaranteed the scores are queryable. Terminal rows are left untouched.
    pub async fn finish_run(
        &self,
        run_id: &str,
        outcome: RunOutcome,
        logs: Option<&str>,
    ) -> Result<MonitorRun> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let row: Option<RunRow> = sqlx::query_as("SELECT * FROM monitor_runs WHERE id = ?")
            .bind(run_id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Err(Error::not_found(format!("run {run_id} does not exist")));
        };
        let current = RunStatus::parse(&row.status)?;
        if current.is_terminal() {
            // Terminal states are immutable; a late finisher loses quietly.
            warn!(run_id = %run_id, status = current.as_str(), "finish ignored — run already terminal");
            return row.into_run();
        }

        let (status, error_message, evaluated_count, score_count) = match &outcome {
            RunOutcome::Succeeded {
                evaluated_count,
                scores,
            } => {
                for score in scores {
                    sqlx::query(
                        "INSERT INTO run_scores (run_id, monitor_id, trace_id, evaluator, score,
                             reasoning, trace_start, created_at)
                         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                    )
                    .bind(run_id)
                    .bind(&row.monitor_id)
                    .bind(&score.trace_id)
                    .bind(&score.evaluator)
                    .bind(score.score)
                    .bind(&score.reasoning)
                    .bind(db_ts(score.trace_start))
                    .bind(db_ts(now))
                    .execute(&mut *tx)
                    .await?;
                }
                (
                    RunStatus::Succeeded,
                    None,
                    *evaluated_count,
                    scores.len() as i64,
                )
            }
            RunOutcome::Failed { message } => (RunStatus::Failed, Some(message.clone()), 0, 0),
            RunOutcome::Cancelled => (RunStatus::Cancelled, None, 0, 0),
        };

        sqlx::query(
            "UPDATE monitor_runs SET status = ?, finished_at = ?, error_message = ?,
                 evaluated_count = ?, score_count = ?, logs = COALESCE(?, logs)
             WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(db_ts(now))
        .bind(error_message)
        .bind(evaluated_count)
        .bind(score_count)
        .bind(logs)
        .bind(run_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        self.run_by_id(run_id).await
    }

    /// Rerun: a fresh `pending` row copying the source run's window and
    /// monitor. The source must be terminal and is never touched.
    pub async fn rerun(&self, run_id: &str, owner: &str) -> Result<MonitorRun> {
        let source = self.run_by_id(run_id).await?;
        if !source.status.is_terminal() {
            return Err(Error::conflict(format!(
                "run {run_id} is {} — only finished runs can be rerun",
                source.status.as_str()
            )));
        }
        // The parent monitor must still exist.
        self.monitor_by_id(&source.monitor_id).await?;

        let new_id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO monitor_runs (id, monitor_id, created_at, window_start, window_end,
                 status, owner)
             VALUES (?, ?, ?, ?, ?, 'pending', ?)",
        )
        .bind(&new_id)
        .bind(&source.monitor_id)
        .bind(db_ts(Utc::now()))
        .bind(db_ts(source.window_start))
        .bind(db_ts(source.window_end))
        .bind(owner)
        .execute(&self.pool)
        .await?;

        self.run_by_id(&new_id).await
    }

    /// Startup reconciliation: fail every non-terminal run owned by a process
    /// that is no longer this one. Returns the reconciled run ids.
    pub async fn reconcile_orphans(&self, current_owner: &str) -> Result<Vec<String>> {
        let ids: Vec<(String,)> = sqlx::query_as(
            "SELECT id FROM monitor_runs
             WHERE status IN ('pending', 'running') AND owner != ?",
        )
        .bind(current_owner)
        .fetch_all(&self.pool)
        .await?;

        let now = db_ts(Utc::now());
        for (id,) in &ids {
            sqlx::query(
                "UPDATE monitor_runs SET status = 'failed', finished_at = ?, error_message = ?
                 WHERE id = ? AND status IN ('pending', 'running')",
            )
            .bind(&now)
            .bind(format!("{ORPHANED_PREFIX} owning process is no longer running"))
            .bind(id)
            .execute(&self.pool)
            .await?;
        }

        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    // ─── Logs & scores ────────────────────────────────────────────────────────

    /// Persisted stderr tail of a finished run.
    pub async fn run_logs(&self, run_id: &str) -> Result<Option<String>> {
        let row: Option<(Option<String>,)> =
            sqlx::query_as("SELECT logs FROM monitor_runs WHERE id = ?")
                .bind(run_id)
                .fetch_optional(&self.pool)
                .await?;
        match row {
            Some((logs,)) => Ok(logs),
            None => Err(Error::not_found(format!("run {run_id} does not exist"))),
        }
    }

    /// Per-evaluator aggregates across the monitor's whole history.
    pub async fn scores_summary(&self, monitor_id: &str) -> Result<Vec<EvaluatorSummary>> {
        let rows: Vec<EvaluatorSummary> = sqlx::query_as(
            "SELECT evaluator, AVG(score) AS avg_score, COUNT(*) AS score_count,
                    COUNT(DISTINCT trace_id) AS trace_count
             FROM run_scores WHERE monitor_id = ?
             GROUP BY evaluator ORDER BY evaluator",
        )
        .bind(monitor_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Score rows inside `[start, end]`, ordered by trace start — input to
    /// the time-series bucketing.
    pub async fn scores_in_range(
        &self,
        monitor_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ScoreRow>> {
        let rows: Vec<ScoreRow> = with_timeout(async {
            Ok(sqlx::query_as(
                "SELECT run_id, trace_id, evaluator, score, reasoning, trace_start
                 FROM run_scores
                 WHERE monitor_id = ? AND trace_start >= ? AND trace_start <= ?
                 ORDER BY trace_start ASC",
            )
            .bind(monitor_id)
            .bind(db_ts(start))
            .bind(db_ts(end))
            .fetch_all(&self.pool)
            .await?)
        })
        .await?;
        Ok(rows)
    }

    /// All scores of one trace under a monitor.
    pub async fn trace_scores(&self, monitor_id: &str, trace_id: &str) -> Result<Vec<ScoreRow>> {
        let rows: Vec<ScoreRow> = sqlx::query_as(
            "SELECT run_id, trace_id, evaluator, score, reasoning, trace_start
             FROM run_scores
             WHERE monitor_id = ? AND trace_id = ?
             ORDER BY trace_start ASC",
        )
        .bind(monitor_id)
        .bind(trace_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

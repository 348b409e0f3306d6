// rest/routes/monitors.rs — Monitor API, scoped per org/project/agent.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::monitors::model::{Monitor, MonitorRun, MonitorScope, NewMonitor};
use crate::monitors::scores::{adaptive_granularity, bucket_scores};
use crate::monitors::store::ScoreRow;
use crate::search::indices::parse_rfc3339;
use crate::AppContext;

const DEFAULT_SERIES_POINTS: usize = 100;

fn scope(org: String, project: String, agent: String) -> MonitorScope {
    MonitorScope {
        org_name: org,
        project_name: project,
        agent_name: agent,
    }
}

// ─── JSON shapes ──────────────────────────────────────────────────────────────

/// Credentials are write-only: the response carries the configured keys so the
/// UI can display assignments, never the values.
fn monitor_json(m: &Monitor) -> Value {
    let mut credential_keys: Vec<&String> = m.credentials.keys().collect();
    credential_keys.sort();
    json!({
        "id": m.id,
        "orgName": m.scope.org_name,
        "projectName": m.scope.project_name,
        "agentName": m.scope.agent_name,
        "name": m.name,
        "type": m.monitor_type.as_str(),
        "intervalMinutes": m.interval_minutes,
        "nextRunTime": m.next_run_time,
        "samplingRate": m.sampling_rate,
        "traceStart": m.trace_start,
        "traceEnd": m.trace_end,
        "componentUid": m.component_uid,
        "environmentUid": m.environment_uid,
        "evaluators": m.evaluators,
        "credentialKeys": credential_keys,
        "status": m.status.as_str(),
        "createdAt": m.created_at,
        "updatedAt": m.updated_at,
    })
}

fn run_json(r: &MonitorRun) -> Value {
    json!({
        "id": r.id,
        "monitorId": r.monitor_id,
        "createdAt": r.created_at,
        "windowStart": r.window_start,
        "windowEnd": r.window_end,
        "status": r.status.as_str(),
        "startedAt": r.started_at,
        "finishedAt": r.finished_at,
        "errorMessage": r.error_message,
        "evaluatedCount": r.evaluated_count,
        "scoreCount": r.score_count,
    })
}

fn score_json(s: &ScoreRow) -> Value {
    json!({
        "runId": s.run_id,
        "traceId": s.trace_id,
        "evaluator": s.evaluator,
        "score": s.score,
        "reasoning": s.reasoning,
        "traceStart": s.trace_start,
    })
}

// ─── CRUD ─────────────────────────────────────────────────────────────────────

pub async fn create_monitor(
    State(ctx): State<Arc<AppContext>>,
    Path((org, project, agent)): Path<(String, String, String)>,
    Json(body): Json<NewMonitor>,
) -> Result<Json<Value>> {
    let monitor = ctx
        .monitor_store
        .create_monitor(&scope(org, project, agent), &body)
        .await?;
    Ok(Json(monitor_json(&monitor)))
}

pub async fn list_monitors(
    State(ctx): State<Arc<AppContext>>,
    Path((org, project, agent)): Path<(String, String, String)>,
) -> Result<Json<Value>> {
    let monitors = ctx
        .monitor_store
        .list_monitors(&scope(org, project, agent))
        .await?;
    let list: Vec<Value> = monitors.iter().map(monitor_json).collect();
    Ok(Json(json!({ "monitors": list })))
}

pub async fn get_monitor(
    State(ctx): State<Arc<AppContext>>,
    Path((org, project, agent, id)): Path<(String, String, String, String)>,
) -> Result<Json<Value>> {
    let monitor = ctx
        .monitor_store
        .monitor_in_scope(&scope(org, project, agent), &id)
        .await?;
    Ok(Json(monitor_json(&monitor)))
}

pub async fn update_monitor(
    State(ctx): State<Arc<AppContext>>,
    Path((org, project, agent, id)): Path<(String, String, String, String)>,
    Json(body): Json<NewMonitor>,
) -> Result<Json<Value>> {
    ctx.monitor_store
        .monitor_in_scope(&scope(org, project, agent), &id)
        .await?;
    let monitor = ctx.monitor_store.update_monitor(&id, &body).await?;
    Ok(Json(monitor_json(&monitor)))
}

pub async fn delete_monitor(
    State(ctx): State<Arc<AppContext>>,
    Path((org, project, agent, id)): Path<(String, String, String, String)>,
) -> Result<Json<Value>> {
    ctx.monitor_store
        .monitor_in_scope(&scope(org, project, agent), &id)
        .await?;
    ctx.monitor_store.delete_monitor(&id).await?;
    Ok(Json(json!({ "deleted": id })))
}

// ─── Start / stop ─────────────────────────────────────────────────────────────

pub async fn start_monitor(
    State(ctx): State<Arc<AppContext>>,
    Path((org, project, agent, id)): Path<(String, String, String, String)>,
) -> Result<Json<Value>> {
    ctx.monitor_store
        .monitor_in_scope(&scope(org, project, agent), &id)
        .await?;
    let monitor = ctx.monitor_store.start_monitor(&id).await?;
    Ok(Json(monitor_json(&monitor)))
}

pub async fn stop_monitor(
    State(ctx): State<Arc<AppContext>>,
    Path((org, project, agent, id)): Path<(String, String, String, String)>,
) -> Result<Json<Value>> {
    ctx.monitor_store
        .monitor_in_scope(&scope(org, project, agent), &id)
        .await?;
    let monitor = ctx.monitor_store.stop_monitor(&id).await?;
    // Queued runs were cancelled by the store; tear down in-flight ones too.
    ctx.run_engine.cancel_runs_for_monitor(&id).await;
    Ok(Json(monitor_json(&monitor)))
}

// ─── Runs ─────────────────────────────────────────────────────────────────────

pub async fn list_runs(
    State(ctx): State<Arc<AppContext>>,
    Path((org, project, agent, id)): Path<(String, String, String, String)>,
) -> Result<Json<Value>> {
    ctx.monitor_store
        .monitor_in_scope(&scope(org, project, agent), &id)
        .await?;
    let runs = ctx.monitor_store.list_runs(&id).await?;
    let list: Vec<Value> = runs.iter().map(run_json).collect();
    Ok(Json(json!({ "runs": list })))
}

pub async fn rerun_run(
    State(ctx): State<Arc<AppContext>>,
    Path((org, project, agent, id, run_id)): Path<(String, String, String, String, String)>,
) -> Result<Json<Value>> {
    let monitor = ctx
        .monitor_store
        .monitor_in_scope(&scope(org, project, agent), &id)
        .await?;
    let source = ctx.monitor_store.run_by_id(&run_id).await?;
    if source.monitor_id != id {
        return Err(Error::not_found(format!("run {run_id} does not exist")));
    }

    let run = ctx.monitor_store.rerun(&run_id, &ctx.owner).await?;
    ctx.run_engine.launch(monitor, run.clone());
    Ok(Json(run_json(&run)))
}

pub async fn run_logs(
    State(ctx): State<Arc<AppContext>>,
    Path((org, project, agent, id, run_id)): Path<(String, String, String, String, String)>,
) -> Result<Json<Value>> {
    ctx.monitor_store
        .monitor_in_scope(&scope(org, project, agent), &id)
        .await?;
    let run = ctx.monitor_store.run_by_id(&run_id).await?;
    if run.monitor_id != id {
        return Err(Error::not_found(format!("run {run_id} does not exist")));
    }

    // In-flight runs stream from the live ring buffer; finished ones read the
    // persisted tail.
    let logs = match ctx.run_engine.live_logs(&run_id).await {
        Some(live) => Some(live),
        None => ctx.monitor_store.run_logs(&run_id).await?,
    };
    Ok(Json(json!({
        "runId": run_id,
        "status": run.status.as_str(),
        "logs": logs.unwrap_or_default(),
    })))
}

// ─── Scores ───────────────────────────────────────────────────────────────────

pub async fn scores_summary(
    State(ctx): State<Arc<AppContext>>,
    Path((org, project, agent, id)): Path<(String, String, String, String)>,
) -> Result<Json<Value>> {
    ctx.monitor_store
        .monitor_in_scope(&scope(org, project, agent), &id)
        .await?;
    let summaries = ctx.monitor_store.scores_summary(&id).await?;
    let list: Vec<Value> = summaries
        .iter()
        .map(|s| {
            json!({
                "evaluator": s.evaluator,
                "avgScore": s.avg_score,
                "scoreCount": s.score_count,
                "traceCount": s.trace_count,
            })
        })
        .collect();
    Ok(Json(json!({ "evaluators": list })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesParams {
    start_time: Option<String>,
    end_time: Option<String>,
    points: Option<usize>,
}

pub async fn scores_series(
    State(ctx): State<Arc<AppContext>>,
    Path((org, project, agent, id)): Path<(String, String, String, String)>,
    Query(params): Query<SeriesParams>,
) -> Result<Json<Value>> {
    ctx.monitor_store
        .monitor_in_scope(&scope(org, project, agent), &id)
        .await?;

    let start = parse_rfc3339(
        "startTime",
        params
            .start_time
            .as_deref()
            .ok_or_else(|| Error::invalid_input("startTime is required"))?,
    )?;
    let end = parse_rfc3339(
        "endTime",
        params
            .end_time
            .as_deref()
            .ok_or_else(|| Error::invalid_input("endTime is required"))?,
    )?;
    if start > end {
        return Err(Error::invalid_input("startTime must not be after endTime"));
    }

    let points = params.points.unwrap_or(DEFAULT_SERIES_POINTS);
    let granularity = adaptive_granularity(end - start, points);
    let rows = ctx.monitor_store.scores_in_range(&id, start, end).await?;
    let series = bucket_scores(&rows, granularity);

    Ok(Json(json!({
        "granularity": granularity.as_str(),
        "points": series,
    })))
}

pub async fn trace_scores(
    State(ctx): State<Arc<AppContext>>,
    Path((org, project, agent, id, trace_id)): Path<(String, String, String, String, String)>,
) -> Result<Json<Value>> {
    ctx.monitor_store
        .monitor_in_scope(&scope(org, project, agent), &id)
        .await?;
    let rows = ctx.monitor_store.trace_scores(&id, &trace_id).await?;
    let list: Vec<Value> = rows.iter().map(score_json).collect();
    Ok(Json(json!({ "traceId": trace_id, "scores": list })))
}

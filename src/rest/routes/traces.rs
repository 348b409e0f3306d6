// rest/routes/traces.rs — Trace read API.

use axum::extract::{Query, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::search::indices::parse_rfc3339;
use crate::search::query::{ResourceFilter, SortOrder};
use crate::traces::cursor::PaginationCursor;
use crate::traces::service::{TraceByIdQuery, TraceQuery, MAX_TRACES_PER_REQUEST};
use crate::AppContext;

const DEFAULT_OVERVIEW_LIMIT: i64 = 10;
const DEFAULT_EXPORT_LIMIT: i64 = 100;

// ─── Shared param plumbing ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceListParams {
    component_uid: Option<String>,
    environment_uid: Option<String>,
    start_time: Option<String>,
    end_time: Option<String>,
    limit: Option<i64>,
    sort_order: Option<String>,
    /// Opaque cursor token, or the structured pair below.
    after_cursor: Option<String>,
    #[serde(rename = "afterCursor.startTime")]
    after_cursor_start_time: Option<String>,
    #[serde(rename = "afterCursor.traceId")]
    after_cursor_trace_id: Option<String>,
}

fn required(field: &str, value: Option<String>) -> Result<String> {
    value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::invalid_input(format!("{field} is required")))
}

fn resource_filter(component_uid: Option<String>, environment_uid: Option<String>) -> Result<ResourceFilter> {
    Ok(ResourceFilter {
        component_uid: required("componentUid", component_uid)?,
        environment_uid: required("environmentUid", environment_uid)?,
    })
}

/// Both bounds or neither; a lone bound is a client mistake, not a default.
fn parse_range(
    start: Option<&str>,
    end: Option<&str>,
) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>> {
    match (start, end) {
        (Some(s), Some(e)) => {
            let start = parse_rfc3339("startTime", s)?;
            let end = parse_rfc3339("endTime", e)?;
            if start > end {
                return Err(Error::invalid_input(
                    "startTime must not be after endTime",
                ));
            }
            Ok(Some((start, end)))
        }
        (None, None) => Ok(None),
        _ => Err(Error::invalid_input(
            "startTime and endTime must be provided together",
        )),
    }
}

fn parse_limit(limit: Option<i64>, default: i64, clamp: bool) -> Result<usize> {
    let limit = limit.unwrap_or(default);
    if limit <= 0 {
        return Err(Error::invalid_input("limit must be a positive integer"));
    }
    let max = MAX_TRACES_PER_REQUEST as i64;
    if limit > max {
        if clamp {
            return Ok(MAX_TRACES_PER_REQUEST);
        }
        return Err(Error::invalid_input(format!("limit must not exceed {max}")));
    }
    Ok(limit as usize)
}

fn parse_cursor(params: &TraceListParams) -> Result<Option<PaginationCursor>> {
    if let Some(token) = params.after_cursor.as_deref() {
        return PaginationCursor::decode(token).map(Some);
    }
    match (
        params.after_cursor_start_time.as_deref(),
        params.after_cursor_trace_id.as_deref(),
    ) {
        (Some(start), Some(trace_id)) => Ok(Some(PaginationCursor::new(start, trace_id))),
        (None, None) => Ok(None),
        _ => Err(Error::invalid_input(
            "afterCursor.startTime and afterCursor.traceId must be provided together",
        )),
    }
}

fn trace_query(params: &TraceListParams, default_limit: i64, clamp: bool) -> Result<TraceQuery> {
    Ok(TraceQuery {
        filter: resource_filter(
            params.component_uid.clone(),
            params.environment_uid.clone(),
        )?,
        range: parse_range(params.start_time.as_deref(), params.end_time.as_deref())?,
        limit: parse_limit(params.limit, default_limit, clamp)?,
        order: SortOrder::from_param(params.sort_order.as_deref())?,
        after: parse_cursor(params)?,
    })
}

fn cursor_json(cursor: &PaginationCursor) -> Value {
    json!({
        "startTime": cursor.start_time,
        "traceId": cursor.trace_id,
        "token": cursor.encode(),
    })
}

// ─── GET /api/traces ──────────────────────────────────────────────────────────

pub async fn trace_overviews(
    State(ctx): State<Arc<AppContext>>,
    Query(params): Query<TraceListParams>,
) -> Result<Json<Value>> {
    let query = trace_query(&params, DEFAULT_OVERVIEW_LIMIT, false)?;
    let page = ctx.trace_service.trace_overviews(&query).await?;

    let mut body = json!({
        "traces": page.traces,
        "totalCount": page.total_count,
    });
    if let Some(cursor) = &page.next_cursor {
        body["nextCursor"] = cursor_json(cursor);
    }
    Ok(Json(body))
}

// ─── GET /api/trace ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceByIdParams {
    trace_id: Option<String>,
    component_uid: Option<String>,
    environment_uid: Option<String>,
    start_time: Option<String>,
    end_time: Option<String>,
    limit: Option<i64>,
    /// `true` restricts the lookup to the root span.
    parent_span: Option<String>,
}

pub async fn trace_by_id(
    State(ctx): State<Arc<AppContext>>,
    Query(params): Query<TraceByIdParams>,
) -> Result<Json<Value>> {
    let default_limit = ctx.hot.read().await.span_query_limit as i64;
    let root_only = match params.parent_span.as_deref() {
        None | Some("false") => false,
        Some("true") => true,
        Some(other) => {
            return Err(Error::invalid_input(format!(
                "parentSpan must be 'true' or 'false', got '{other}'"
            )))
        }
    };

    let query = TraceByIdQuery {
        trace_id: required("traceId", params.trace_id)?,
        filter: resource_filter(params.component_uid, params.environment_uid)?,
        range: parse_range(params.start_time.as_deref(), params.end_time.as_deref())?,
        limit: parse_limit(params.limit, default_limit, true)?,
        root_only,
    };

    let detail = ctx.trace_service.trace_by_id(&query).await?;
    Ok(Json(json!({
        "spans": detail.spans,
        "totalCount": detail.spans.len(),
        "tokenUsage": detail.token_usage,
        "status": detail.status,
    })))
}

// ─── GET /api/traces/export ───────────────────────────────────────────────────

pub async fn export_traces(
    State(ctx): State<Arc<AppContext>>,
    Query(params): Query<TraceListParams>,
) -> Result<impl IntoResponse> {
    let query = trace_query(&params, DEFAULT_EXPORT_LIMIT, true)?;
    if query.range.is_none() {
        return Err(Error::invalid_input(
            "startTime and endTime are required for export",
        ));
    }

    let page = ctx.trace_service.export_traces(&query).await?;

    let mut body = json!({
        "traces": page.traces,
        "totalCount": page.total_count,
        "truncated": page.truncated,
    });
    if let Some(cursor) = &page.next_cursor {
        body["nextCursor"] = cursor_json(cursor);
    }

    let filename = format!(
        "traces-export-{}.json",
        Utc::now().format("%Y%m%dT%H%M%SZ")
    );
    Ok((
        [(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{filename}\""),
        )],
        Json(body),
    ))
}

//! Trace Query Service — the public read path.
//!
//! `trace_overviews` and `export_traces` share the two-phase shape: a
//! cursor-paginated root-span page first, then bounded per-page enrichment
//! (span counts, full span fetch). This is what lets the API paginate deeply
//! over millions of spans without `offset` arithmetic: the cursor rides the
//! root-span sort key and every enrichment query is sized by the page, not
//! the corpus.

use std::collections::HashMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::error::{Error, Result};
use crate::search::indices::{self, ALL_INDICES};
use crate::search::query::{self, ResourceFilter, RootSpanQuery, SortOrder, TRACE_CARDINALITY_AGG};
use crate::search::store::{SearchResponse, SpanStore};
use crate::traces::assemble::{self, TokenUsage};
use crate::traces::cursor::PaginationCursor;
use crate::traces::extract;
use crate::traces::span::{Span, StatusCode};

/// Hard page-size ceiling for overview and export requests.
pub const MAX_TRACES_PER_REQUEST: usize = 1000;
/// Span budget for one export response; pages needing more are truncated.
pub const MAX_SPANS_PER_EXPORT: usize = 10_000;

// ─── Parameters ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TraceQuery {
    pub filter: ResourceFilter,
    pub range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    pub limit: usize,
    pub order: SortOrder,
    pub after: Option<PaginationCursor>,
}

#[derive(Debug, Clone)]
pub struct TraceByIdQuery {
    pub trace_id: String,
    pub filter: ResourceFilter,
    /// When absent, the lookup runs against the all-indices wildcard so stale
    /// trace ids referenced by old evaluations still resolve.
    pub range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    pub limit: usize,
    /// Restrict to the root span only.
    pub root_only: bool,
}

// ─── Results ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceOverview {
    pub trace_id: String,
    pub name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_in_nanos: i64,
    pub span_count: u64,
    pub span_type: String,
    pub status: StatusCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

#[derive(Debug)]
pub struct OverviewPage {
    pub traces: Vec<TraceOverview>,
    pub total_count: u64,
    pub next_cursor: Option<PaginationCursor>,
}

/// One fully hydrated trace in an export response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FullTrace {
    pub trace_id: String,
    pub name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub span_count: u64,
    pub status: StatusCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    pub task_id: String,
    pub trial_id: String,
    /// Spans in ascending `startTime` order, canonical document shape.
    pub spans: Vec<Value>,
}

#[derive(Debug)]
pub struct ExportPage {
    pub traces: Vec<FullTrace>,
    pub total_count: u64,
    pub truncated: bool,
    pub next_cursor: Option<PaginationCursor>,
}

#[derive(Debug)]
pub struct TraceDetail {
    pub spans: Vec<Value>,
    pub token_usage: Option<TokenUsage>,
    pub status: StatusCode,
}

// ─── Service ──────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct TraceService {
    store: SpanStore,
}

impl TraceService {
    pub fn new(store: SpanStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &SpanStore {
        &self.store
    }

    fn index_expr(range: Option<(DateTime<Utc>, DateTime<Utc>)>) -> Result<String> {
        match range {
            Some((start, end)) => Ok(indices::index_expr(&indices::indices_for_range(start, end)?)),
            None => Ok(ALL_INDICES.to_string()),
        }
    }

    /// Phase 1 of overviews/export: one root-span page plus the parsed roots.
    async fn root_span_page(
        &self,
        index_expr: &str,
        q: &TraceQuery,
    ) -> Result<(SearchResponse, Vec<Span>)> {
        let root_query = RootSpanQuery {
            filter: q.filter.clone(),
            range: q.range,
            limit: q.limit,
            order: q.order,
            search_after: q
                .after
                .as_ref()
                .map(|c| (c.start_time.clone(), c.trace_id.clone())),
        };
        let resp = self.store.search_root_spans(index_expr, &root_query).await?;

        let mut roots = Vec::with_capacity(resp.hits.hits.len());
        for hit in &resp.hits.hits {
            match Span::from_document(&hit.source) {
                Ok(span) => roots.push(span),
                Err(e) => warn!(err = %e, "skipping unparseable root span document"),
            }
        }
        Ok((resp, roots))
    }

    /// Cursor emission rule: a full page means more may follow.
    fn next_cursor(resp: &SearchResponse, roots: &[Span], limit: usize) -> Option<PaginationCursor> {
        if resp.hits.hits.len() < limit {
            return None;
        }
        resp.hits
            .hits
            .last()
            .and_then(|hit| PaginationCursor::from_sort_values(&hit.sort))
            .or_else(|| {
                // Backends that omit sort values: rebuild from the last root.
                roots.last().map(|span| {
                    PaginationCursor::new(
                        span.start_time.to_rfc3339_opts(SecondsFormat::Nanos, true),
                        span.trace_id.clone(),
                    )
                })
            })
    }

    // ─── Overviews ────────────────────────────────────────────────────────────

    pub async fn trace_overviews(&self, q: &TraceQuery) -> Result<OverviewPage> {
        let index_expr = Self::index_expr(q.range)?;
        let (resp, roots) = self.root_span_page(&index_expr, q).await?;
        let total_count = resp.cardinality(TRACE_CARDINALITY_AGG);

        if roots.is_empty() {
            if q.after.is_none() && total_count > 0 {
                warn!(
                    total = total_count,
                    "traces without a root span omitted from overviews"
                );
            }
            return Ok(OverviewPage {
                traces: Vec::new(),
                total_count,
                next_cursor: None,
            });
        }

        let trace_ids: Vec<String> = roots.iter().map(|s| s.trace_id.clone()).collect();

        // Span-count failure degrades this page, not the response: every hit
        // is itself a root span, so counts floor at 1.
        let span_counts = match self
            .store
            .search_span_counts(&index_expr, &q.filter, &trace_ids)
            .await
        {
            Ok(counts) => counts,
            Err(e) => {
                warn!(err = %e, "span-count aggregation failed — overview span counts degraded to 1");
                HashMap::new()
            }
        };

        let traces: Vec<TraceOverview> = roots
            .iter()
            .map(|root| {
                // A missing bucket still means the root span itself exists.
                let span_count = span_counts.get(&root.trace_id).copied().unwrap_or(1);
                Self::overview_from_root(root, span_count)
            })
            .collect();

        let next_cursor = Self::next_cursor(&resp, &roots, q.limit);

        // With the whole result set on this page, a cardinality total above
        // the hit count exposes traces that have no root span (or whose root
        // document would not parse) — they are omitted, not errors.
        if q.after.is_none() && next_cursor.is_none() && (roots.len() as u64) < total_count {
            warn!(
                total = total_count,
                with_root = roots.len(),
                omitted = total_count - roots.len() as u64,
                "traces without a root span omitted from overviews"
            );
        }

        Ok(OverviewPage {
            traces,
            total_count,
            next_cursor,
        })
    }

    fn overview_from_root(root: &Span, span_count: u64) -> TraceOverview {
        // Root-only aggregation fallback here: a full-trace scan would cost
        // one query per trace on the hot listing path.
        let token_usage = assemble::trace_usage(Some(root), [root]);
        let single = std::slice::from_ref(root);
        let (status, error_message) = assemble::trace_status(Some(root), single);
        let (input, output) = extract::extract_io(root);

        TraceOverview {
            trace_id: root.trace_id.clone(),
            name: root.name.clone(),
            start_time: root.start_time,
            end_time: root.end_time,
            duration_in_nanos: root.duration_nanos,
            span_count,
            span_type: assemble::classify_span(root).as_str().to_string(),
            status,
            error_message,
            token_usage,
            input,
            output,
        }
    }

    // ─── Trace by id ──────────────────────────────────────────────────────────

    pub async fn trace_by_id(&self, q: &TraceByIdQuery) -> Result<TraceDetail> {
        let index_expr = Self::index_expr(q.range)?;
        let body = query::spans_by_trace_ids(
            &q.filter,
            std::slice::from_ref(&q.trace_id),
            q.root_only,
            q.limit,
        );
        let resp = self.store.search(&index_expr, &body).await?;

        let mut spans = Vec::with_capacity(resp.hits.hits.len());
        for hit in &resp.hits.hits {
            match Span::from_document(&hit.source) {
                Ok(span) => spans.push(span),
                Err(e) => warn!(trace_id = %q.trace_id, err = %e, "skipping unparseable span document"),
            }
        }

        if spans.is_empty() {
            return Err(Error::not_found(format!(
                "trace {} has no spans",
                q.trace_id
            )));
        }

        spans.sort_by(|a, b| {
            a.start_time
                .cmp(&b.start_time)
                .then_with(|| a.span_id.cmp(&b.span_id))
        });

        let root = assemble::find_root(&spans);
        let token_usage = assemble::trace_usage(root, spans.iter());
        let (status, _) = assemble::trace_status(root, &spans);

        Ok(TraceDetail {
            spans: spans.iter().map(Span::to_document).collect(),
            token_usage,
            status,
        })
    }

    // ─── Export ───────────────────────────────────────────────────────────────

    pub async fn export_traces(&self, q: &TraceQuery) -> Result<ExportPage> {
        let index_expr = Self::index_expr(q.range)?;
        let (resp, roots) = self.root_span_page(&index_expr, q).await?;
        let total_count = resp.cardinality(TRACE_CARDINALITY_AGG);
        let next_cursor = Self::next_cursor(&resp, &roots, q.limit);

        if roots.is_empty() {
            return Ok(ExportPage {
                traces: Vec::new(),
                total_count,
                truncated: false,
                next_cursor: None,
            });
        }

        let trace_ids: Vec<String> = roots.iter().map(|s| s.trace_id.clone()).collect();
        let span_counts = self
            .store
            .search_span_counts(&index_expr, &q.filter, &trace_ids)
            .await?;

        // Keep whole traces, in sort order, until the span budget is spent.
        let mut kept_roots: Vec<&Span> = Vec::new();
        let mut kept_ids: Vec<String> = Vec::new();
        let mut span_budget = 0usize;
        let mut truncated = false;
        for root in &roots {
            let count = span_counts.get(&root.trace_id).copied().unwrap_or(1) as usize;
            if span_budget + count > MAX_SPANS_PER_EXPORT {
                truncated = true;
                break;
            }
            span_budget += count;
            kept_ids.push(root.trace_id.clone());
            kept_roots.push(root);
        }

        if truncated {
            warn!(
                requested = roots.len(),
                exported = kept_roots.len(),
                "export truncated at {MAX_SPANS_PER_EXPORT} spans"
            );
        }

        let mut grouped: HashMap<String, Vec<Span>> = HashMap::new();
        if !kept_ids.is_empty() {
            let body = query::spans_by_trace_ids(&q.filter, &kept_ids, false, span_budget.max(1));
            let spans_resp = self.store.search(&index_expr, &body).await?;
            for hit in &spans_resp.hits.hits {
                match Span::from_document(&hit.source) {
                    Ok(span) => grouped.entry(span.trace_id.clone()).or_default().push(span),
                    Err(e) => warn!(err = %e, "skipping unparseable span document in export"),
                }
            }
        }

        let mut traces = Vec::with_capacity(kept_roots.len());
        for root in kept_roots {
            let Some(mut spans) = grouped.remove(&root.trace_id) else {
                // Rare race with an expiring daily index.
                warn!(trace_id = %root.trace_id, "trace returned no spans — skipped from export");
                continue;
            };

            spans.sort_by(|a, b| {
                a.start_time
                    .cmp(&b.start_time)
                    .then_with(|| a.span_id.cmp(&b.span_id))
            });

            // Re-identify the root from the full span set rather than
            // trusting the phase-1 hit.
            let trace_root = assemble::find_root(&spans);
            if trace_root.is_none() {
                warn!(trace_id = %root.trace_id, "trace has no root span — skipped from export");
                continue;
            }

            let token_usage = assemble::trace_usage(trace_root, spans.iter());
            let (status, error_message) = assemble::trace_status(trace_root, &spans);
            let (task_id, trial_id) = assemble::baggage(trace_root);
            let (input, output) = trace_root
                .map(extract::extract_io)
                .unwrap_or((None, None));

            let anchor = trace_root.unwrap_or(root);
            traces.push(FullTrace {
                trace_id: anchor.trace_id.clone(),
                name: anchor.name.clone(),
                start_time: anchor.start_time,
                end_time: anchor.end_time,
                span_count: spans.len() as u64,
                status,
                error_message,
                token_usage,
                input,
                output,
                task_id,
                trial_id,
                spans: spans.iter().map(Span::to_document).collect(),
            });
        }

        Ok(ExportPage {
            traces,
            total_count,
            truncated,
            next_cursor,
        })
    }
}

//! Query Builder — the four search-body shapes the read path issues.
//!
//! All bodies are plain JSON documents for the backend's `_search` endpoint.
//! Common rules: component/environment filters are term-equal on the resource
//! keys, and `startTime` ranges are inclusive on both ends.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};

use crate::error::{Error, Result};

/// Resource attribute key identifying the component a span belongs to.
pub const COMPONENT_UID_FIELD: &str = "resource.openchoreo.dev/component-uid";
/// Resource attribute key identifying the environment a span belongs to.
pub const ENVIRONMENT_UID_FIELD: &str = "resource.openchoreo.dev/environment-uid";

/// Aggregation name carrying the unique-trace cardinality on root-span pages.
pub const TRACE_CARDINALITY_AGG: &str = "unique_traces";
/// Aggregation name carrying per-trace span counts.
pub const SPAN_COUNT_AGG: &str = "span_counts";
/// Aggregation name of the legacy trace-discovery terms aggregation.
pub const TRACE_IDS_AGG: &str = "trace_ids";

// ─── Sort order ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    /// Parse the `sortOrder` query parameter. Absent defaults to `desc`;
    /// anything other than `asc`/`desc` is rejected.
    pub fn from_param(value: Option<&str>) -> Result<Self> {
        match value {
            None => Ok(Self::Desc),
            Some("asc") => Ok(Self::Asc),
            Some("desc") => Ok(Self::Desc),
            Some(other) => Err(Error::invalid_input(format!(
                "sortOrder must be 'asc' or 'desc', got '{other}'"
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Asc => "asc",
            Self::Desc => "desc",
        }
    }
}

// ─── Common filter ────────────────────────────────────────────────────────────

/// Term filters shared by every query shape.
#[derive(Debug, Clone)]
pub struct ResourceFilter {
    pub component_uid: String,
    pub environment_uid: String,
}

impl ResourceFilter {
    fn terms(&self) -> Vec<Value> {
        vec![
            json!({ "term": { COMPONENT_UID_FIELD: self.component_uid } }),
            json!({ "term": { ENVIRONMENT_UID_FIELD: self.environment_uid } }),
        ]
    }
}

fn range_clause(range: Option<(DateTime<Utc>, DateTime<Utc>)>) -> Option<Value> {
    range.map(|(start, end)| {
        json!({
            "range": {
                "startTime": {
                    "gte": fmt_ts(start),
                    "lte": fmt_ts(end),
                }
            }
        })
    })
}

fn fmt_ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

// ─── Root-span cursor search ──────────────────────────────────────────────────

/// Parameters for the paginated root-span search (phase 1 of overviews/export).
#[derive(Debug, Clone)]
pub struct RootSpanQuery {
    pub filter: ResourceFilter,
    pub range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    pub limit: usize,
    pub order: SortOrder,
    /// `(startTime, traceId)` sort values of the last hit of the prior page.
    pub search_after: Option<(String, String)>,
}

/// Root spans only (`parentSpanId == ""`), total order `(startTime, traceId)`,
/// with a `cardinality(traceId)` aggregation for the display-only total count.
///
/// The root-span restriction lives in `post_filter`: aggregations run before
/// post-filtering, so the cardinality counts every trace matching the
/// resource/time filter — including anomalous traces that have no root span
/// and therefore never surface as hits.
pub fn root_span_search(q: &RootSpanQuery) -> Value {
    let mut filters = q.filter.terms();
    if let Some(range) = range_clause(q.range) {
        filters.push(range);
    }

    let mut body = json!({
        "size": q.limit,
        "query": { "bool": { "filter": filters } },
        "post_filter": { "term": { "parentSpanId": "" } },
        "sort": [
            { "startTime": { "order": q.order.as_str() } },
            { "traceId": { "order": q.order.as_str() } },
        ],
        "aggs": {
            TRACE_CARDINALITY_AGG: { "cardinality": { "field": "traceId" } }
        },
    });

    if let Some((start_time, trace_id)) = &q.search_after {
        body["search_after"] = json!([start_time, trace_id]);
    }
    body
}

// ─── Span-count aggregation ───────────────────────────────────────────────────

/// Per-trace span counts for one page of trace ids. No document hits.
pub fn span_count_aggregation(filter: &ResourceFilter, trace_ids: &[String]) -> Value {
    let mut filters = vec![json!({ "terms": { "traceId": trace_ids } })];
    filters.extend(filter.terms());

    json!({
        "size": 0,
        "query": { "bool": { "filter": filters } },
        "aggs": {
            SPAN_COUNT_AGG: {
                "terms": { "field": "traceId", "size": trace_ids.len().max(1) }
            }
        },
    })
}

// ─── Span-by-trace-ids lookup ─────────────────────────────────────────────────

/// All spans of the given traces, optionally restricted to root spans.
/// `size` is capped by the caller.
pub fn spans_by_trace_ids(
    filter: &ResourceFilter,
    trace_ids: &[String],
    root_only: bool,
    size: usize,
) -> Value {
    let mut filters = vec![json!({ "terms": { "traceId": trace_ids } })];
    filters.extend(filter.terms());
    if root_only {
        filters.push(json!({ "term": { "parentSpanId": "" } }));
    }

    json!({
        "size": size,
        "query": { "bool": { "filter": filters } },
    })
}

// ─── Legacy trace aggregation ─────────────────────────────────────────────────

/// Trace discovery without a cursor: a `terms` aggregation on `traceId`
/// ordered by earliest span start. Page size is `offset + limit` — the caller
/// slices off the leading `offset` buckets. Kept for random-access offset
/// paging where `search_after` is not applicable.
pub fn trace_aggregation(
    filter: &ResourceFilter,
    range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    offset: usize,
    limit: usize,
    order: SortOrder,
) -> Value {
    let mut filters = filter.terms();
    if let Some(range) = range_clause(range) {
        filters.push(range);
    }

    json!({
        "size": 0,
        "query": { "bool": { "filter": filters } },
        "aggs": {
            TRACE_IDS_AGG: {
                "terms": {
                    "field": "traceId",
                    "size": offset + limit,
                    "order": { "earliest_start": order.as_str() }
                },
                "aggs": {
                    "earliest_start": { "min": { "field": "startTime" } }
                }
            }
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn filter() -> ResourceFilter {
        ResourceFilter {
            component_uid: "comp-1".into(),
            environment_uid: "env-1".into(),
        }
    }

    #[test]
    fn sort_order_defaults_to_desc() {
        assert_eq!(SortOrder::from_param(None).unwrap(), SortOrder::Desc);
        assert_eq!(SortOrder::from_param(Some("asc")).unwrap(), SortOrder::Asc);
        assert!(SortOrder::from_param(Some("upward")).is_err());
    }

    #[test]
    fn root_span_search_filters_and_sorts() {
        let body = root_span_search(&RootSpanQuery {
            filter: filter(),
            range: None,
            limit: 10,
            order: SortOrder::Desc,
            search_after: None,
        });

        assert_eq!(body["size"], 10);
        assert_eq!(
            body["post_filter"],
            json!({ "term": { "parentSpanId": "" } })
        );
        let filters = body["query"]["bool"]["filter"].as_array().unwrap();
        assert_eq!(filters.len(), 2);
        assert_eq!(body["sort"][0]["startTime"]["order"], "desc");
        assert_eq!(body["sort"][1]["traceId"]["order"], "desc");
        assert!(body["aggs"][TRACE_CARDINALITY_AGG]["cardinality"].is_object());
        assert!(body.get("search_after").is_none());
    }

    #[test]
    fn root_span_search_attaches_cursor() {
        let body = root_span_search(&RootSpanQuery {
            filter: filter(),
            range: None,
            limit: 10,
            order: SortOrder::Desc,
            search_after: Some(("2024-01-01T00:00:21Z".into(), "T21".into())),
        });
        assert_eq!(body["search_after"], json!(["2024-01-01T00:00:21Z", "T21"]));
    }

    #[test]
    fn root_span_search_range_is_inclusive() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let body = root_span_search(&RootSpanQuery {
            filter: filter(),
            range: Some((start, end)),
            limit: 5,
            order: SortOrder::Asc,
            search_after: None,
        });
        let range = &body["query"]["bool"]["filter"][2]["range"]["startTime"];
        assert!(range.get("gte").is_some());
        assert!(range.get("lte").is_some());
    }

    #[test]
    fn span_count_aggregation_has_no_hits() {
        let body = span_count_aggregation(&filter(), &["t1".into(), "t2".into()]);
        assert_eq!(body["size"], 0);
        assert_eq!(body["aggs"][SPAN_COUNT_AGG]["terms"]["size"], 2);
    }

    #[test]
    fn spans_by_trace_ids_root_only_adds_parent_filter() {
        let body = spans_by_trace_ids(&filter(), &["t1".into()], true, 100);
        let filters = body["query"]["bool"]["filter"].as_array().unwrap();
        assert!(filters
            .iter()
            .any(|f| f == &json!({ "term": { "parentSpanId": "" } })));
        assert_eq!(body["size"], 100);
    }

    #[test]
    fn trace_aggregation_sizes_offset_plus_limit() {
        let body = trace_aggregation(&filter(), None, 40, 20, SortOrder::Asc);
        assert_eq!(body["aggs"][TRACE_IDS_AGG]["terms"]["size"], 60);
        assert_eq!(
            body["aggs"][TRACE_IDS_AGG]["terms"]["order"]["earliest_start"],
            "asc"
        );
    }
}

//! Integration tests for the trace read path, driven through a fake search
//! transport that evaluates query bodies against an in-memory span corpus.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracewatch::error::{Error, Result};
use tracewatch::search::query::{ResourceFilter, SortOrder};
use tracewatch::search::{SearchTransport, SpanStore};
use tracewatch::traces::cursor::PaginationCursor;
use tracewatch::traces::service::{TraceByIdQuery, TraceQuery, TraceService};
use tracewatch::traces::StatusCode;

// ─── Fake backend ─────────────────────────────────────────────────────────────

/// Evaluates the subset of the query DSL the store emits: bool filters
/// (term/terms/range), post_filter, sort on (startTime, traceId),
/// search_after, cardinality and terms aggregations.
struct FakeBackend {
    docs: Vec<Value>,
}

impl FakeBackend {
    fn new(docs: Vec<Value>) -> Arc<Self> {
        Arc::new(Self { docs })
    }

    fn matches_clause(doc: &Value, clause: &Value) -> bool {
        if let Some(term) = clause.get("term").and_then(Value::as_object) {
            return term
                .iter()
                .all(|(field, expected)| &doc[field.as_str()] == expected);
        }
        if let Some(terms) = clause.get("terms").and_then(Value::as_object) {
            return terms.iter().all(|(field, allowed)| {
                allowed
                    .as_array()
                    .is_some_and(|list| list.contains(&doc[field.as_str()]))
            });
        }
        if let Some(range) = clause.get("range").and_then(Value::as_object) {
            return range.iter().all(|(field, bounds)| {
                let value = doc[field.as_str()].as_str().unwrap_or_default();
                let gte = bounds["gte"].as_str().map_or(true, |b| value >= b);
                let lte = bounds["lte"].as_str().map_or(true, |b| value <= b);
                gte && lte
            });
        }
        true
    }

    fn matches_query(doc: &Value, query: &Value) -> bool {
        query["bool"]["filter"]
            .as_array()
            .map(|clauses| clauses.iter().all(|c| Self::matches_clause(doc, c)))
            .unwrap_or(true)
    }

    fn sort_key(doc: &Value) -> (String, String) {
        (
            doc["startTime"].as_str().unwrap_or_default().to_string(),
            doc["traceId"].as_str().unwrap_or_default().to_string(),
        )
    }
}

#[async_trait]
impl SearchTransport for FakeBackend {
    async fn execute(&self, _index: &str, body: &Value, _timeout: Duration) -> Result<Value> {
        let query_matched: Vec<&Value> = self
            .docs
            .iter()
            .filter(|doc| Self::matches_query(doc, &body["query"]))
            .collect();

        // Aggregations run before post_filter, like the real backend.
        let mut aggregations = json!({});
        if let Some(aggs) = body.get("aggs").and_then(Value::as_object) {
            for (name, spec) in aggs {
                if spec.get("cardinality").is_some() {
                    let mut ids: Vec<&str> = query_matched
                        .iter()
                        .filter_map(|d| d["traceId"].as_str())
                        .collect();
                    ids.sort_unstable();
                    ids.dedup();
                    aggregations[name.as_str()] = json!({ "value": ids.len() });
                } else if spec.get("terms").is_some() {
                    let mut counts: std::collections::BTreeMap<&str, u64> = Default::default();
                    for doc in &query_matched {
                        if let Some(id) = doc["traceId"].as_str() {
                            *counts.entry(id).or_default() += 1;
                        }
                    }
                    let buckets: Vec<Value> = counts
                        .into_iter()
                        .map(|(key, count)| json!({ "key": key, "doc_count": count }))
                        .collect();
                    aggregations[name.as_str()] = json!({ "buckets": buckets });
                }
            }
        }

        let mut hits: Vec<&Value> = match body.get("post_filter") {
            Some(post) => query_matched
                .into_iter()
                .filter(|doc| Self::matches_clause(doc, post))
                .collect(),
            None => query_matched,
        };

        if body.get("sort").is_some() {
            let descending = body["sort"][0]["startTime"]["order"] == "desc";
            hits.sort_by_key(|d| Self::sort_key(d));
            if descending {
                hits.reverse();
            }

            if let Some(after) = body["search_after"].as_array() {
                let cursor = (
                    after[0].as_str().unwrap_or_default().to_string(),
                    after[1].as_str().unwrap_or_default().to_string(),
                );
                hits.retain(|d| {
                    let key = Self::sort_key(d);
                    if descending {
                        key < cursor
                    } else {
                        key > cursor
                    }
                });
            }
        }

        let size = body["size"].as_u64().unwrap_or(10) as usize;
        hits.truncate(size);

        let hit_objects: Vec<Value> = hits
            .into_iter()
            .map(|doc| {
                let (start, trace) = Self::sort_key(doc);
                json!({ "_source": doc, "sort": [start, trace] })
            })
            .collect();

        Ok(json!({
            "hits": { "hits": hit_objects },
            "aggregations": aggregations,
        }))
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

// ─── Fixtures ─────────────────────────────────────────────────────────────────

fn span_doc(trace_id: &str, span_id: &str, parent: &str, second: u32, attrs: Value) -> Value {
    json!({
        "traceId": trace_id,
        "spanId": span_id,
        "parentSpanId": parent,
        "name": format!("op-{span_id}"),
        "kind": "SPAN_KIND_INTERNAL",
        "startTime": format!("2024-01-01T00:{:02}:{:02}.000000000Z", second / 60, second % 60),
        "endTime": format!("2024-01-01T00:{:02}:{:02}.500000000Z", second / 60, second % 60),
        "durationInNanos": 500_000_000u64,
        "status": { "code": 0, "message": "" },
        "attributes": attrs,
        "resource.openchoreo.dev/component-uid": "comp-1",
        "resource.openchoreo.dev/environment-uid": "env-1",
    })
}

fn filter() -> ResourceFilter {
    ResourceFilter {
        component_uid: "comp-1".into(),
        environment_uid: "env-1".into(),
    }
}

fn service(docs: Vec<Value>) -> TraceService {
    TraceService::new(SpanStore::new(FakeBackend::new(docs)))
}

fn overview_query(limit: usize, after: Option<PaginationCursor>) -> TraceQuery {
    TraceQuery {
        filter: filter(),
        range: None,
        limit,
        order: SortOrder::Desc,
        after,
    }
}

/// 30 single-span traces T01..T30 starting one second apart.
fn thirty_traces() -> Vec<Value> {
    (1..=30)
        .map(|k| span_doc(&format!("T{k:02}"), &format!("s{k:02}"), "", k, json!({})))
        .collect()
}

// ─── Overview pagination ──────────────────────────────────────────────────────

#[tokio::test]
async fn overview_pagination_walks_pages_without_overlap_or_gaps() {
    let service = service(thirty_traces());

    // Page 1: newest ten.
    let page1 = service
        .trace_overviews(&overview_query(10, None))
        .await
        .unwrap();
    assert_eq!(page1.total_count, 30);
    let ids: Vec<&str> = page1.traces.iter().map(|t| t.trace_id.as_str()).collect();
    assert_eq!(ids.first(), Some(&"T30"));
    assert_eq!(ids.last(), Some(&"T21"));
    let cursor1 = page1.next_cursor.expect("full page emits a cursor");
    assert_eq!(cursor1.trace_id, "T21");

    // Page 2 resumes exactly after T21.
    let page2 = service
        .trace_overviews(&overview_query(10, Some(cursor1)))
        .await
        .unwrap();
    let ids2: Vec<&str> = page2.traces.iter().map(|t| t.trace_id.as_str()).collect();
    assert_eq!(ids2.first(), Some(&"T20"));
    assert_eq!(ids2.last(), Some(&"T11"));
    let cursor2 = page2.next_cursor.expect("full page emits a cursor");

    // Page 3: the final ten. The page is full so a cursor is still emitted;
    // following it yields the empty terminal page.
    let page3 = service
        .trace_overviews(&overview_query(10, Some(cursor2)))
        .await
        .unwrap();
    let ids3: Vec<&str> = page3.traces.iter().map(|t| t.trace_id.as_str()).collect();
    assert_eq!(ids3.first(), Some(&"T10"));
    assert_eq!(ids3.last(), Some(&"T01"));

    if let Some(cursor3) = page3.next_cursor {
        let page4 = service
            .trace_overviews(&overview_query(10, Some(cursor3)))
            .await
            .unwrap();
        assert!(page4.traces.is_empty());
        assert!(page4.next_cursor.is_none());
    }

    // No trace appears twice across pages.
    let mut all: Vec<&str> = ids.into_iter().chain(ids2).chain(ids3).collect();
    let total = all.len();
    all.sort_unstable();
    all.dedup();
    assert_eq!(all.len(), total);
    assert_eq!(total, 30);
}

#[tokio::test]
async fn short_page_ends_pagination() {
    let service = service(thirty_traces());
    let page = service
        .trace_overviews(&overview_query(40, None))
        .await
        .unwrap();
    assert_eq!(page.traces.len(), 30);
    assert!(page.next_cursor.is_none());
}

#[tokio::test]
async fn empty_result_is_success_with_no_cursor() {
    let service = service(Vec::new());
    let page = service
        .trace_overviews(&overview_query(10, None))
        .await
        .unwrap();
    assert!(page.traces.is_empty());
    assert_eq!(page.total_count, 0);
    assert!(page.next_cursor.is_none());
}

// ─── Rootless traces ──────────────────────────────────────────────────────────

#[tokio::test]
async fn rootless_trace_is_omitted_but_counted() {
    let mut docs = thirty_traces();
    // Trace X: a parent cycle, no root span.
    docs.push(span_doc("X", "x1", "x2", 40, json!({})));
    docs.push(span_doc("X", "x2", "x1", 41, json!({})));

    let service = service(docs);
    let page = service
        .trace_overviews(&overview_query(50, None))
        .await
        .unwrap();

    assert!(page.traces.iter().all(|t| t.trace_id != "X"));
    // The cardinality aggregation still counts X.
    assert_eq!(page.total_count, 31);
    assert_eq!(page.traces.len(), 30);
}

// ─── Token usage ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn entity_output_usage_wins_over_span_counters() {
    let docs = vec![
        span_doc(
            "T1",
            "root",
            "",
            1,
            json!({
                "traceloop.entity.output":
                    "{\"usage\":{\"prompt_tokens\":10,\"completion_tokens\":20,\"total_tokens\":30}}"
            }),
        ),
        span_doc(
            "T1",
            "child",
            "root",
            2,
            json!({ "gen_ai.usage.prompt_tokens": 999 }),
        ),
    ];

    let service = service(docs);
    let page = service
        .trace_overviews(&overview_query(10, None))
        .await
        .unwrap();
    let usage = page.traces[0].token_usage.expect("usage present");
    assert_eq!(usage.prompt_tokens, 10);
    assert_eq!(usage.completion_tokens, 20);
    assert_eq!(usage.total_tokens, 30);
    assert_eq!(page.traces[0].span_count, 2);
}

// ─── Trace by id ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn trace_by_id_returns_all_spans_with_aggregated_usage() {
    let docs = vec![
        span_doc(
            "T1",
            "root",
            "",
            1,
            json!({ "gen_ai.usage.prompt_tokens": 5, "gen_ai.usage.completion_tokens": 7 }),
        ),
        span_doc(
            "T1",
            "child",
            "root",
            2,
            json!({ "gen_ai.usage.prompt_tokens": 3 }),
        ),
        span_doc("T2", "other", "", 3, json!({})),
    ];

    let service = service(docs);
    let detail = service
        .trace_by_id(&TraceByIdQuery {
            trace_id: "T1".into(),
            filter: filter(),
            range: None,
            limit: 100,
            root_only: false,
        })
        .await
        .unwrap();

    assert_eq!(detail.spans.len(), 2);
    let usage = detail.token_usage.expect("usage present");
    assert_eq!(usage.prompt_tokens, 8);
    assert_eq!(usage.total_tokens, 15);
    assert_eq!(detail.status, StatusCode::Unset);
}

#[tokio::test]
async fn trace_by_id_root_only_returns_single_span() {
    let docs = vec![
        span_doc("T1", "root", "", 1, json!({})),
        span_doc("T1", "child", "root", 2, json!({})),
    ];
    let service = service(docs);
    let detail = service
        .trace_by_id(&TraceByIdQuery {
            trace_id: "T1".into(),
            filter: filter(),
            range: None,
            limit: 100,
            root_only: true,
        })
        .await
        .unwrap();
    assert_eq!(detail.spans.len(), 1);
    assert_eq!(detail.spans[0]["spanId"], "root");
}

#[tokio::test]
async fn unknown_trace_is_not_found() {
    let service = service(thirty_traces());
    let err = service
        .trace_by_id(&TraceByIdQuery {
            trace_id: "nope".into(),
            filter: filter(),
            range: None,
            limit: 100,
            root_only: false,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

// ─── Export ───────────────────────────────────────────────────────────────────

/// 500 traces with 30 spans each: only the 333 earliest-sorted traces fit the
/// 10,000-span budget completely.
#[tokio::test]
async fn export_truncates_at_span_budget_keeping_whole_traces() {
    let mut docs = Vec::new();
    for t in 0..500u32 {
        let trace_id = format!("T{t:03}");
        docs.push(span_doc(
            &trace_id,
            &format!("{trace_id}-root"),
            "",
            t,
            json!({}),
        ));
        for s in 1..30u32 {
            docs.push(span_doc(
                &trace_id,
                &format!("{trace_id}-s{s:02}"),
                &format!("{trace_id}-root"),
                t,
                json!({}),
            ));
        }
    }

    let service = service(docs);
    let page = service
        .export_traces(&TraceQuery {
            filter: filter(),
            range: None,
            limit: 500,
            order: SortOrder::Desc,
            after: None,
        })
        .await
        .unwrap();

    assert!(page.truncated);
    assert_eq!(page.traces.len(), 333);
    assert!(page.traces.iter().all(|t| t.spans.len() == 30));
    assert_eq!(page.total_count, 500);
}

#[tokio::test]
async fn export_hydrates_spans_in_ascending_order_with_baggage() {
    let docs = vec![
        span_doc(
            "T1",
            "root",
            "",
            5,
            json!({ "task.id": "task-7", "trial.id": "trial-3" }),
        ),
        span_doc("T1", "late", "root", 9, json!({})),
        span_doc("T1", "early", "root", 7, json!({})),
    ];

    let service = service(docs);
    let page = service
        .export_traces(&TraceQuery {
            filter: filter(),
            range: None,
            limit: 10,
            order: SortOrder::Desc,
            after: None,
        })
        .await
        .unwrap();

    assert_eq!(page.traces.len(), 1);
    let trace = &page.traces[0];
    assert_eq!(trace.task_id, "task-7");
    assert_eq!(trace.trial_id, "trial-3");
    assert_eq!(trace.span_count, 3);

    let starts: Vec<&str> = trace
        .spans
        .iter()
        .map(|s| s["startTime"].as_str().unwrap())
        .collect();
    let mut sorted = starts.clone();
    sorted.sort_unstable();
    assert_eq!(starts, sorted);
    assert!(!page.truncated);
}

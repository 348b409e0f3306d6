//! Span Store Adapter — thin, typed facade over the document search backend.
//!
//! The HTTP transport is a seam (`SearchTransport`) so the read path can be
//! exercised against canned responses in tests. The real transport is one
//! shared reqwest client (connection pool, optional basic auth, configurable
//! TLS verification). Missing daily shards are non-errors: every request sets
//! `ignore_unavailable=true`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::config::DaemonConfig;
use crate::error::{Error, Result};
use crate::search::query::{self, ResourceFilter, RootSpanQuery};

/// Timeout for plain document fetches.
const SEARCH_TIMEOUT: Duration = Duration::from_secs(30);
/// Timeout for aggregation-bearing queries, which fan out across shards.
const AGGREGATION_TIMEOUT: Duration = Duration::from_secs(60);

// ─── Typed response ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct SearchResponse {
    pub hits: HitsEnvelope,
    #[serde(default)]
    pub aggregations: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HitsEnvelope {
    #[serde(default)]
    pub hits: Vec<Hit>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Hit {
    #[serde(rename = "_source")]
    pub source: Value,
    /// Sort values of this hit — `[startTime, traceId]` on root-span pages.
    /// Fed back verbatim as `search_after` for the next page.
    #[serde(default)]
    pub sort: Vec<Value>,
}

impl SearchResponse {
    /// Read a `cardinality` aggregation value by name. Zero when absent.
    pub fn cardinality(&self, agg: &str) -> u64 {
        self.aggregations
            .as_ref()
            .and_then(|a| a[agg]["value"].as_u64())
            .unwrap_or(0)
    }

    /// Decode a `terms` aggregation into `key → doc_count`.
    pub fn term_counts(&self, agg: &str) -> HashMap<String, u64> {
        let mut counts = HashMap::new();
        let buckets = self
            .aggregations
            .as_ref()
            .and_then(|a| a[agg]["buckets"].as_array())
            .cloned()
            .unwrap_or_default();
        for bucket in buckets {
            if let (Some(key), Some(count)) = (bucket["key"].as_str(), bucket["doc_count"].as_u64())
            {
                counts.insert(key.to_string(), count);
            }
        }
        counts
    }
}

// ─── Transport seam ───────────────────────────────────────────────────────────

/// One `_search` round trip. Implementations must be cancellation-safe: the
/// caller may drop the future when its own request is cancelled.
#[async_trait]
pub trait SearchTransport: Send + Sync {
    async fn execute(&self, index_expr: &str, body: &Value, timeout: Duration) -> Result<Value>;

    /// Cheap backend liveness probe for the health endpoint.
    async fn ping(&self) -> Result<()>;
}

/// reqwest-backed transport. The client is built once and shared process-wide.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
}

impl HttpTransport {
    pub fn new(config: &DaemonConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.backend_insecure_skip_verify)
            .build()
            .map_err(|e| Error::Internal(format!("build http client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.backend_url.trim_end_matches('/').to_string(),
            username: config.backend_username.clone(),
            password: config.backend_password.clone(),
        })
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.username {
            Some(user) => req.basic_auth(user, self.password.as_deref()),
            None => req,
        }
    }
}

#[async_trait]
impl SearchTransport for HttpTransport {
    async fn execute(&self, index_expr: &str, body: &Value, timeout: Duration) -> Result<Value> {
        let url = format!(
            "{}/{}/_search?ignore_unavailable=true",
            self.base_url, index_expr
        );
        debug!(url = %url, "span search request");

        let req = self.client.post(&url).timeout(timeout).json(body);
        let resp = self
            .authorize(req)
            .send()
            .await
            .map_err(|e| Error::BackendUnavailable(e.to_string()))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| Error::BackendUnavailable(e.to_string()))?;

        if !status.is_success() {
            return Err(Error::Backend {
                status: status.as_u16(),
                message: text,
            });
        }

        serde_json::from_str(&text)
            .map_err(|e| Error::Internal(format!("decode search response: {e}")))
    }

    async fn ping(&self) -> Result<()> {
        let req = self.client.get(&self.base_url).timeout(Duration::from_secs(5));
        let resp = self
            .authorize(req)
            .send()
            .await
            .map_err(|e| Error::BackendUnavailable(e.to_string()))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(Error::Backend {
                status: resp.status().as_u16(),
                message: String::new(),
            })
        }
    }
}

// ─── SpanStore ────────────────────────────────────────────────────────────────

/// Typed query methods over a [`SearchTransport`].
#[derive(Clone)]
pub struct SpanStore {
    transport: Arc<dyn SearchTransport>,
}

impl SpanStore {
    pub fn new(transport: Arc<dyn SearchTransport>) -> Self {
        Self { transport }
    }

    pub async fn ping(&self) -> Result<()> {
        self.transport.ping().await
    }

    /// Plain document search (no aggregations).
    pub async fn search(&self, index_expr: &str, body: &Value) -> Result<SearchResponse> {
        self.decode(self.transport.execute(index_expr, body, SEARCH_TIMEOUT).await?)
    }

    /// Search with attached aggregations (longer timeout).
    pub async fn search_with_aggregation(
        &self,
        index_expr: &str,
        body: &Value,
    ) -> Result<SearchResponse> {
        self.decode(
            self.transport
                .execute(index_expr, body, AGGREGATION_TIMEOUT)
                .await?,
        )
    }

    /// Root-span page with cursor support and the unique-trace cardinality
    /// aggregation.
    pub async fn search_root_spans(
        &self,
        index_expr: &str,
        q: &RootSpanQuery,
    ) -> Result<SearchResponse> {
        let body = query::root_span_search(q);
        self.search_with_aggregation(index_expr, &body).await
    }

    /// Per-trace span counts for one page of trace ids.
    pub async fn search_span_counts(
        &self,
        index_expr: &str,
        filter: &ResourceFilter,
        trace_ids: &[String],
    ) -> Result<HashMap<String, u64>> {
        let body = query::span_count_aggregation(filter, trace_ids);
        let resp = self.search_with_aggregation(index_expr, &body).await?;
        Ok(resp.term_counts(query::SPAN_COUNT_AGG))
    }

    fn decode(&self, raw: Value) -> Result<SearchResponse> {
        serde_json::from_value(raw)
            .map_err(|e| Error::Internal(format!("malformed search response: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_hits_with_sort_values() {
        let raw = json!({
            "hits": { "hits": [
                { "_source": { "traceId": "t1" }, "sort": ["2024-01-01T00:00:01Z", "t1"] }
            ]},
            "aggregations": { "unique_traces": { "value": 7 } }
        });
        let resp: SearchResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(resp.hits.hits.len(), 1);
        assert_eq!(resp.hits.hits[0].sort[1], "t1");
        assert_eq!(resp.cardinality("unique_traces"), 7);
    }

    #[test]
    fn term_counts_decode_buckets() {
        let raw = json!({
            "hits": { "hits": [] },
            "aggregations": { "span_counts": { "buckets": [
                { "key": "t1", "doc_count": 3 },
                { "key": "t2", "doc_count": 12 }
            ]}}
        });
        let resp: SearchResponse = serde_json::from_value(raw).unwrap();
        let counts = resp.term_counts("span_counts");
        assert_eq!(counts.get("t1"), Some(&3));
        assert_eq!(counts.get("t2"), Some(&12));
    }

    #[test]
    fn missing_aggregations_degrade_to_empty() {
        let resp: SearchResponse =
            serde_json::from_value(json!({ "hits": { "hits": [] } })).unwrap();
        assert_eq!(resp.cardinality("unique_traces"), 0);
        assert!(resp.term_counts("span_counts").is_empty());
    }
}

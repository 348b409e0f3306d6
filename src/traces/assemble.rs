//! Derived trace fields: span classification, token usage, status, baggage.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::traces::span::{Span, StatusCode};

// ─── Span-type classification ─────────────────────────────────────────────────

/// Display-only span kind derived from attribute signatures. Also drives
/// content-extractor dispatch for CrewAI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpanType {
    /// Carries `gen_ai.*` attributes — a model invocation.
    Llm,
    /// Carries CrewAI-signature attributes.
    CrewAi,
    /// Explicit `openinference.span.kind` label.
    OpenInference(String),
    Generic,
}

impl SpanType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Llm => "llm",
            Self::CrewAi => "crewai",
            Self::OpenInference(kind) => kind,
            Self::Generic => "generic",
        }
    }
}

pub fn classify_span(span: &Span) -> SpanType {
    if span.attributes.has_key_with_prefix("gen_ai.") {
        return SpanType::Llm;
    }
    if span.attributes.has_key_with_prefix("crewai.") {
        return SpanType::CrewAi;
    }
    if let Some(kind) = span.attributes.get_str("openinference.span.kind") {
        return SpanType::OpenInference(kind.to_lowercase());
    }
    SpanType::Generic
}

// ─── Token usage ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    fn non_zero(self) -> Option<Self> {
        if self.prompt_tokens == 0 && self.completion_tokens == 0 && self.total_tokens == 0 {
            None
        } else {
            Some(self)
        }
    }
}

/// Entity-output strategy: decode `traceloop.entity.output` on the root span
/// and read the nested usage counts. Single-span scan — preferred on the
/// overview read path.
pub fn entity_output_usage(root: &Span) -> Option<TokenUsage> {
    let raw = root.attributes.get_str("traceloop.entity.output")?;
    let parsed: Value = serde_json::from_str(raw).ok()?;
    let usage = parsed.get("usage")?;

    let count = |key: &str| -> u64 {
        match usage.get(key) {
            Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
            Some(Value::String(s)) => s.parse().unwrap_or(0),
            _ => 0,
        }
    };

    let prompt = count("prompt_tokens");
    let completion = count("completion_tokens");
    let mut total = count("total_tokens");
    if total == 0 {
        total = prompt + completion;
    }

    TokenUsage {
        prompt_tokens: prompt,
        completion_tokens: completion,
        total_tokens: total,
    }
    .non_zero()
}

/// Aggregation strategy: sum `gen_ai.usage.*` counters across spans.
/// `total_tokens` falls back to `prompt + completion` when producers omit it.
pub fn aggregate_usage<'a>(spans: impl IntoIterator<Item = &'a Span>) -> Option<TokenUsage> {
    let mut prompt = 0u64;
    let mut completion = 0u64;
    let mut total = 0u64;

    for span in spans {
        prompt += span
            .attributes
            .get_u64("gen_ai.usage.prompt_tokens")
            .unwrap_or(0);
        completion += span
            .attributes
            .get_u64("gen_ai.usage.completion_tokens")
            .unwrap_or(0);
        total += span
            .attributes
            .get_u64("gen_ai.usage.total_tokens")
            .unwrap_or(0);
    }

    if total == 0 {
        total = prompt + completion;
    }

    TokenUsage {
        prompt_tokens: prompt,
        completion_tokens: completion,
        total_tokens: total,
    }
    .non_zero()
}

/// Per-trace usage: entity-output first, aggregation over `spans` otherwise.
pub fn trace_usage<'a>(
    root: Option<&Span>,
    spans: impl IntoIterator<Item = &'a Span>,
) -> Option<TokenUsage> {
    if let Some(usage) = root.and_then(entity_output_usage) {
        return Some(usage);
    }
    aggregate_usage(spans)
}

// ─── Status aggregation ───────────────────────────────────────────────────────

/// A trace is ERROR if any span errored (first error's message wins);
/// otherwise the root span's status code carries.
pub fn trace_status(root: Option<&Span>, spans: &[Span]) -> (StatusCode, Option<String>) {
    for span in spans {
        if span.status_code == StatusCode::Error {
            let message = if span.status_message.is_empty() {
                None
            } else {
                Some(span.status_message.clone())
            };
            return (StatusCode::Error, message);
        }
    }
    (
        root.map(|r| r.status_code).unwrap_or(StatusCode::Unset),
        None,
    )
}

// ─── Root identification & baggage ────────────────────────────────────────────

/// The unique span with an empty `parentSpanId`. Traces violating the
/// single-root invariant are observable anomalies, handled by callers.
pub fn find_root(spans: &[Span]) -> Option<&Span> {
    spans.iter().find(|s| s.is_root())
}

/// `task.id` / `trial.id` baggage carried for evaluation correlation.
/// Empty strings when absent.
pub fn baggage(root: Option<&Span>) -> (String, String) {
    let get = |key: &str| {
        root.and_then(|r| r.attributes.get_str(key))
            .unwrap_or_default()
            .to_string()
    };
    (get("task.id"), get("trial.id"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn span_with_attrs(trace: &str, id: &str, parent: &str, attrs: Value) -> Span {
        Span::from_document(&json!({
            "traceId": trace,
            "spanId": id,
            "parentSpanId": parent,
            "startTime": "2024-01-01T00:00:00Z",
            "endTime": "2024-01-01T00:00:01Z",
            "attributes": attrs,
        }))
        .unwrap()
    }

    #[test]
    fn classification_dispatches_on_signatures() {
        let llm = span_with_attrs("t", "a", "", json!({ "gen_ai.request.model": "m" }));
        let crew = span_with_attrs("t", "b", "", json!({ "crewai.crew.inputs": "{}" }));
        let oi = span_with_attrs("t", "c", "", json!({ "openinference.span.kind": "AGENT" }));
        let plain = span_with_attrs("t", "d", "", json!({}));

        assert_eq!(classify_span(&llm), SpanType::Llm);
        assert_eq!(classify_span(&crew), SpanType::CrewAi);
        assert_eq!(classify_span(&oi), SpanType::OpenInference("agent".into()));
        assert_eq!(classify_span(&plain), SpanType::Generic);
    }

    #[test]
    fn entity_output_wins_over_aggregation() {
        let root = span_with_attrs(
            "t",
            "root",
            "",
            json!({
                "traceloop.entity.output":
                    "{\"usage\":{\"prompt_tokens\":10,\"completion_tokens\":20,\"total_tokens\":30}}"
            }),
        );
        let noisy = span_with_attrs("t", "child", "root", json!({ "gen_ai.usage.prompt_tokens": 999 }));

        let usage = trace_usage(Some(&root), [&root, &noisy]).unwrap();
        assert_eq!(usage.prompt_tokens, 10);
        assert_eq!(usage.completion_tokens, 20);
        assert_eq!(usage.total_tokens, 30);
    }

    #[test]
    fn aggregation_sums_and_falls_back_on_total() {
        let a = span_with_attrs(
            "t", "a", "",
            json!({ "gen_ai.usage.prompt_tokens": 5, "gen_ai.usage.completion_tokens": 7 }),
        );
        let b = span_with_attrs(
            "t", "b", "a",
            json!({ "gen_ai.usage.prompt_tokens": 3, "gen_ai.usage.completion_tokens": 2 }),
        );
        let usage = aggregate_usage([&a, &b]).unwrap();
        assert_eq!(usage.prompt_tokens, 8);
        assert_eq!(usage.completion_tokens, 9);
        assert_eq!(usage.total_tokens, 17);
    }

    #[test]
    fn zero_usage_is_null_not_zero_record() {
        let plain = span_with_attrs("t", "a", "", json!({}));
        assert!(aggregate_usage([&plain]).is_none());
        assert!(trace_usage(Some(&plain), [&plain]).is_none());
    }

    #[test]
    fn malformed_entity_output_degrades_to_aggregation() {
        let root = span_with_attrs(
            "t", "root", "",
            json!({ "traceloop.entity.output": "not json",
                    "gen_ai.usage.total_tokens": 12 }),
        );
        let usage = trace_usage(Some(&root), [&root]).unwrap();
        assert_eq!(usage.total_tokens, 12);
    }

    #[test]
    fn first_error_span_message_wins() {
        let root = span_with_attrs("t", "root", "", json!({}));
        let mut failing = span_with_attrs("t", "child", "root", json!({}));
        failing.status_code = StatusCode::Error;
        failing.status_message = "rate limited".into();

        let spans = vec![root.clone(), failing];
        let (status, message) = trace_status(Some(&root), &spans);
        assert_eq!(status, StatusCode::Error);
        assert_eq!(message.as_deref(), Some("rate limited"));
    }

    #[test]
    fn root_status_carries_when_no_errors() {
        let mut root = span_with_attrs("t", "root", "", json!({}));
        root.status_code = StatusCode::Ok;
        let spans = vec![root.clone()];
        let (status, message) = trace_status(Some(&root), &spans);
        assert_eq!(status, StatusCode::Ok);
        assert!(message.is_none());
    }

    #[test]
    fn baggage_defaults_to_empty() {
        let root = span_with_attrs(
            "t", "root", "",
            json!({ "task.id": "task-1", "trial.id": "trial-2" }),
        );
        assert_eq!(baggage(Some(&root)), ("task-1".into(), "trial-2".into()));
        assert_eq!(baggage(None), (String::new(), String::new()));
    }
}

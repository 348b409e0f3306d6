//! Typed span model and parsing of the backend's flat span documents.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Map, Value};

use crate::error::{Error, Result};
use crate::search::query::{COMPONENT_UID_FIELD, ENVIRONMENT_UID_FIELD};

// ─── Status ───────────────────────────────────────────────────────────────────

/// OTel span status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StatusCode {
    Unset,
    Ok,
    Error,
}

impl StatusCode {
    /// Accepts both numeric (0/1/2) and string ("UNSET"/"OK"/"ERROR",
    /// optionally with the `STATUS_CODE_` prefix) encodings.
    pub fn from_value(v: &Value) -> Self {
        match v {
            Value::Number(n) => match n.as_i64() {
                Some(1) => Self::Ok,
                Some(2) => Self::Error,
                _ => Self::Unset,
            },
            Value::String(s) => {
                let s = s.trim_start_matches("STATUS_CODE_");
                if s.eq_ignore_ascii_case("ok") {
                    Self::Ok
                } else if s.eq_ignore_ascii_case("error") {
                    Self::Error
                } else {
                    Self::Unset
                }
            }
            _ => Self::Unset,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unset => "UNSET",
            Self::Ok => "OK",
            Self::Error => "ERROR",
        }
    }
}

// ─── Attributes ───────────────────────────────────────────────────────────────

/// Heterogeneous span attribute map.
///
/// Accessors return `Option` on missing keys *and* on type mismatches —
/// malformed producer data degrades to empty derived fields, never a panic.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct Attributes(pub Map<String, Value>);

impl Attributes {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Numeric accessor tolerant of producers that stringify counters.
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        match self.0.get(key)? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn has_key_with_prefix(&self, prefix: &str) -> bool {
        self.0.keys().any(|k| k.starts_with(prefix))
    }
}

// ─── Span ─────────────────────────────────────────────────────────────────────

/// One OTel span record, parsed from a stored document.
#[derive(Debug, Clone, PartialEq)]
pub struct Span {
    pub trace_id: String,
    pub span_id: String,
    /// Empty string for the trace root.
    pub parent_span_id: String,
    pub name: String,
    pub kind: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_nanos: i64,
    pub status_code: StatusCode,
    pub status_message: String,
    pub attributes: Attributes,
    pub component_uid: String,
    pub environment_uid: String,
}

impl Span {
    pub fn is_root(&self) -> bool {
        self.parent_span_id.is_empty()
    }

    /// Parse the backend's flat document shape into a typed span.
    ///
    /// `traceId`, `spanId`, and `startTime` are required; everything else
    /// degrades to an empty/unset value.
    pub fn from_document(doc: &Value) -> Result<Self> {
        let str_field = |key: &str| doc[key].as_str().map(str::to_string);

        let trace_id = str_field("traceId")
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::internal("span document missing traceId"))?;
        let span_id = str_field("spanId")
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::internal(format!("span in trace {trace_id} missing spanId")))?;

        let start_time = parse_time(doc, "startTime")
            .ok_or_else(|| Error::internal(format!("span {span_id} missing startTime")))?;
        let end_time = parse_time(doc, "endTime").unwrap_or(start_time);

        let (status_code, status_message) = match &doc["status"] {
            Value::Object(status) => (
                StatusCode::from_value(status.get("code").unwrap_or(&Value::Null)),
                status
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            ),
            // Some producers flatten the status object into dotted keys.
            _ => (
                StatusCode::from_value(&doc["status.code"]),
                doc["status.message"].as_str().unwrap_or_default().to_string(),
            ),
        };

        let attributes = match &doc["attributes"] {
            Value::Object(map) => Attributes(map.clone()),
            _ => Attributes::default(),
        };

        Ok(Self {
            trace_id,
            span_id,
            parent_span_id: str_field("parentSpanId").unwrap_or_default(),
            name: str_field("name").unwrap_or_default(),
            kind: str_field("kind").unwrap_or_default(),
            start_time,
            end_time,
            duration_nanos: doc["durationInNanos"]
                .as_i64()
                .unwrap_or_else(|| (end_time - start_time).num_nanoseconds().unwrap_or(0)),
            status_code,
            status_message,
            attributes,
            component_uid: str_field(COMPONENT_UID_FIELD).unwrap_or_default(),
            environment_uid: str_field(ENVIRONMENT_UID_FIELD).unwrap_or_default(),
        })
    }

    /// Serialize back to the canonical document shape.
    pub fn to_document(&self) -> Value {
        json!({
            "traceId": self.trace_id,
            "spanId": self.span_id,
            "parentSpanId": self.parent_span_id,
            "name": self.name,
            "kind": self.kind,
            "startTime": fmt_time(self.start_time),
            "endTime": fmt_time(self.end_time),
            "durationInNanos": self.duration_nanos,
            "status": {
                "code": self.status_code.as_str(),
                "message": self.status_message,
            },
            "attributes": self.attributes,
            COMPONENT_UID_FIELD: self.component_uid,
            ENVIRONMENT_UID_FIELD: self.environment_uid,
        })
    }
}

fn parse_time(doc: &Value, key: &str) -> Option<DateTime<Utc>> {
    doc[key]
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

fn fmt_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc() -> Value {
        json!({
            "traceId": "abc123",
            "spanId": "def456",
            "parentSpanId": "",
            "name": "agent.invoke",
            "kind": "SPAN_KIND_INTERNAL",
            "startTime": "2024-01-01T00:00:01.000000000Z",
            "endTime": "2024-01-01T00:00:02.500000000Z",
            "durationInNanos": 1_500_000_000i64,
            "status": { "code": 2, "message": "boom" },
            "attributes": {
                "task.id": "task-9",
                "gen_ai.usage.prompt_tokens": 11,
            },
            "resource.openchoreo.dev/component-uid": "comp-1",
            "resource.openchoreo.dev/environment-uid": "env-1",
        })
    }

    #[test]
    fn parses_flat_document() {
        let span = Span::from_document(&doc()).unwrap();
        assert!(span.is_root());
        assert_eq!(span.status_code, StatusCode::Error);
        assert_eq!(span.status_message, "boom");
        assert_eq!(span.attributes.get_str("task.id"), Some("task-9"));
        assert_eq!(span.attributes.get_u64("gen_ai.usage.prompt_tokens"), Some(11));
        assert_eq!(span.duration_nanos, 1_500_000_000);
        assert_eq!(span.component_uid, "comp-1");
    }

    #[test]
    fn round_trip_preserves_span() {
        let span = Span::from_document(&doc()).unwrap();
        let reparsed = Span::from_document(&span.to_document()).unwrap();
        assert_eq!(span, reparsed);
    }

    #[test]
    fn missing_trace_id_is_an_error() {
        let mut d = doc();
        d["traceId"] = Value::Null;
        assert!(Span::from_document(&d).is_err());
    }

    #[test]
    fn status_code_accepts_string_and_numeric_forms() {
        assert_eq!(StatusCode::from_value(&json!(2)), StatusCode::Error);
        assert_eq!(StatusCode::from_value(&json!("STATUS_CODE_OK")), StatusCode::Ok);
        assert_eq!(StatusCode::from_value(&json!("Error")), StatusCode::Error);
        assert_eq!(StatusCode::from_value(&json!(null)), StatusCode::Unset);
    }

    #[test]
    fn stringified_counters_still_parse() {
        let attrs = Attributes(
            json!({ "gen_ai.usage.total_tokens": "42" })
                .as_object()
                .unwrap()
                .clone(),
        );
        assert_eq!(attrs.get_u64("gen_ai.usage.total_tokens"), Some(42));
        assert_eq!(attrs.get_u64("missing"), None);
    }

    #[test]
    fn end_time_defaults_to_start_time() {
        let mut d = doc();
        d["endTime"] = Value::Null;
        d["durationInNanos"] = Value::Null;
        let span = Span::from_document(&d).unwrap();
        assert_eq!(span.end_time, span.start_time);
        assert_eq!(span.duration_nanos, 0);
    }
}

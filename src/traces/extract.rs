//! Provider-specific input/output extraction from root spans.
//!
//! Vendors encode the agent's input and result differently; extraction is a
//! strategy table dispatched on attribute signatures. The generic
//! OTel/OpenInference extractor matches everything and sits last, so
//! classification always resolves.

use once_cell::sync::Lazy;
use serde_json::Value;

use crate::traces::span::Span;

/// One vendor convention. `extract` returns structured JSON — the core never
/// flattens or stringifies content.
pub trait ContentExtractor: Send + Sync {
    fn name(&self) -> &'static str;
    fn matches(&self, root: &Span) -> bool;
    fn extract(&self, root: &Span) -> (Option<Value>, Option<Value>);
}

static EXTRACTORS: Lazy<Vec<Box<dyn ContentExtractor>>> =
    Lazy::new(|| vec![Box::new(CrewAiExtractor), Box::new(GenericExtractor)]);

/// First-match dispatch over the registration table.
pub fn extract_io(root: &Span) -> (Option<Value>, Option<Value>) {
    for extractor in EXTRACTORS.iter() {
        if extractor.matches(root) {
            return extractor.extract(root);
        }
    }
    (None, None)
}

/// Attribute values are often JSON serialized into a string; surface the
/// structured form when it parses, the raw string otherwise.
fn structured(raw: &Value) -> Option<Value> {
    match raw {
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.starts_with('{') || trimmed.starts_with('[') {
                if let Ok(parsed) = serde_json::from_str::<Value>(trimmed) {
                    return Some(parsed);
                }
            }
            Some(raw.clone())
        }
        Value::Null => None,
        other => Some(other.clone()),
    }
}

// ─── CrewAI ───────────────────────────────────────────────────────────────────

struct CrewAiExtractor;

impl ContentExtractor for CrewAiExtractor {
    fn name(&self) -> &'static str {
        "crewai"
    }

    fn matches(&self, root: &Span) -> bool {
        root.attributes.has_key_with_prefix("crewai.")
    }

    fn extract(&self, root: &Span) -> (Option<Value>, Option<Value>) {
        let input = root
            .attributes
            .get("crewai.crew.inputs")
            .and_then(structured);
        let output = root
            .attributes
            .get("crewai.crew.result")
            .and_then(structured);
        (input, output)
    }
}

// ─── Generic OTel / OpenInference ─────────────────────────────────────────────

struct GenericExtractor;

impl ContentExtractor for GenericExtractor {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn matches(&self, _root: &Span) -> bool {
        true
    }

    fn extract(&self, root: &Span) -> (Option<Value>, Option<Value>) {
        let first = |keys: &[&str]| -> Option<Value> {
            keys.iter()
                .find_map(|k| root.attributes.get(k).and_then(structured))
        };

        let input = first(&["input.value", "traceloop.entity.input"]);
        let output = first(&["output.value", "traceloop.entity.output"]);
        (input, output)
    }
}

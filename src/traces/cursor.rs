//! Stateless deep-pagination cursor.
//!
//! A cursor is the `(startTime, traceId)` sort key of the last root span the
//! previous page returned. Internally it is structured; on the wire it is an
//! opaque base64 token. The token carries a version so a sort-key schema
//! change invalidates old cursors with a clean 400 instead of misreading.

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

const CURSOR_VERSION: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginationCursor {
    pub start_time: String,
    pub trace_id: String,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireCursor {
    v: u8,
    start_time: String,
    trace_id: String,
}

impl PaginationCursor {
    pub fn new(start_time: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self {
            start_time: start_time.into(),
            trace_id: trace_id.into(),
        }
    }

    /// Build from a hit's `sort` values (`[startTime, traceId]`). Numeric
    /// sort values (epoch-format date fields) are carried as their decimal
    /// string form — `search_after` accepts them verbatim either way.
    pub fn from_sort_values(sort: &[Value]) -> Option<Self> {
        if sort.len() < 2 {
            return None;
        }
        let as_string = |v: &Value| -> Option<String> {
            match v {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            }
        };
        Some(Self {
            start_time: as_string(&sort[0])?,
            trace_id: as_string(&sort[1])?,
        })
    }

    /// Opaque wire form: base64 of canonical JSON.
    pub fn encode(&self) -> String {
        let wire = WireCursor {
            v: CURSOR_VERSION,
            start_time: self.start_time.clone(),
            trace_id: self.trace_id.clone(),
        };
        let json = serde_json::to_vec(&wire).unwrap_or_default();
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(json)
    }

    pub fn decode(token: &str) -> Result<Self> {
        let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|_| Error::invalid_input("afterCursor is not a valid cursor token"))?;
        let wire: WireCursor = serde_json::from_slice(&bytes)
            .map_err(|_| Error::invalid_input("afterCursor is not a valid cursor token"))?;
        if wire.v != CURSOR_VERSION {
            return Err(Error::invalid_input(format!(
                "unsupported cursor version {}",
                wire.v
            )));
        }
        Ok(Self {
            start_time: wire.start_time,
            trace_id: wire.trace_id,
        })
    }
}

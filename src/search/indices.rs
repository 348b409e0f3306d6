//! Index Resolver — maps time windows to daily span index shards.
//!
//! Span documents land in one index per UTC day, `otel-traces-YYYY-MM-DD`.
//! Queries hit only the shards their window touches; missing shards for quiet
//! days are tolerated by the store adapter (`ignore_unavailable`).

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};

const INDEX_PREFIX: &str = "otel-traces-";

/// Wildcard pattern covering every daily shard. Used when the caller opts out
/// of a time range (e.g. trace-by-id lookups for stale trace references).
pub const ALL_INDICES: &str = "otel-traces-*";

/// Parse an RFC 3339 timestamp query parameter into UTC.
pub fn parse_rfc3339(field: &str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| Error::invalid_input(format!("{field} is not a valid RFC 3339 timestamp: {value}")))
}

/// Returns the deduplicated, ascending list of daily indices covering
/// `[start, end]` inclusive.
///
/// Deterministic and pure: equal inputs always produce the equal index set.
pub fn indices_for_range(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<String>> {
    if start > end {
        return Err(Error::invalid_input(format!(
            "invalid time range: start {start} is after end {end}"
        )));
    }

    let mut indices = Vec::new();
    let mut day = start.date_naive();
    let last = end.date_naive();
    while day <= last {
        indices.push(format!("{INDEX_PREFIX}{}", day.format("%Y-%m-%d")));
        day = match day.succ_opt() {
            Some(next) => next,
            None => break,
        };
    }
    Ok(indices)
}

/// Comma-joined index expression for the search URL path.
pub fn index_expr(indices: &[String]) -> String {
    indices.join(",")
}

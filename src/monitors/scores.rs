//! Score time-series: adaptive granularity and in-process bucketing.

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use serde::Serialize;
use tracing::warn;

use crate::monitors::store::ScoreRow;

// ─── Adaptive granularity ─────────────────────────────────────────────────────

/// Requested point counts at or below this resolve to raw per-trace points.
pub const PER_TRACE_POINT_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    /// No bucketing — one point per scored trace.
    Trace,
    Minute,
    Hour,
    Day,
    Week,
}

impl Granularity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Week => "week",
        }
    }
}

/// Pure granularity selection for a query window and requested point count.
pub fn adaptive_granularity(window: Duration, points: usize) -> Granularity {
    if points <= PER_TRACE_POINT_LIMIT {
        return Granularity::Trace;
    }
    if window <= Duration::hours(6) {
        Granularity::Minute
    } else if window <= Duration::days(7) {
        Granularity::Hour
    } else if window <= Duration::days(28) {
        Granularity::Day
    } else {
        Granularity::Week
    }
}

// ─── Bucketing ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesPoint {
    pub bucket: DateTime<Utc>,
    pub evaluator: String,
    pub avg_score: f64,
    pub score_count: u64,
}

fn floor_to(granularity: Granularity, t: DateTime<Utc>) -> DateTime<Utc> {
    let day = t
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|d| d.and_utc())
        .unwrap_or(t);
    match granularity {
        Granularity::Trace => t,
        Granularity::Minute => t
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(t),
        Granularity::Hour => t
            .with_minute(0)
            .and_then(|t| t.with_second(0))
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(t),
        Granularity::Day => day,
        Granularity::Week => day - Duration::days(t.weekday().num_days_from_monday() as i64),
    }
}

/// Fold score rows into series points at the given granularity.
///
/// `Trace` granularity emits one point per row; otherwise rows group by
/// `(bucket, evaluator)` with an average score. Output is ordered by bucket,
/// then evaluator. Rows with unreadable timestamps are dropped with a warning.
pub fn bucket_scores(rows: &[ScoreRow], granularity: Granularity) -> Vec<SeriesPoint> {
    let mut parsed: Vec<(DateTime<Utc>, &ScoreRow)> = Vec::with_capacity(rows.len());
    for row in rows {
        match DateTime::parse_from_rfc3339(&row.trace_start) {
            Ok(t) => parsed.push((t.with_timezone(&Utc), row)),
            Err(e) => warn!(trace_id = %row.trace_id, err = %e, "score row has unreadable trace_start — dropped"),
        }
    }

    if granularity == Granularity::Trace {
        let mut points: Vec<SeriesPoint> = parsed
            .into_iter()
            .map(|(t, row)| SeriesPoint {
                bucket: t,
                evaluator: row.evaluator.clone(),
                avg_score: row.score,
                score_count: 1,
            })
            .collect();
        points.sort_by(|a, b| a.bucket.cmp(&b.bucket).then_with(|| a.evaluator.cmp(&b.evaluator)));
        return points;
    }

    let mut buckets: std::collections::BTreeMap<(DateTime<Utc>, String), (f64, u64)> =
        std::collections::BTreeMap::new();
    for (t, row) in parsed {
        let key = (floor_to(granularity, t), row.evaluator.clone());
        let entry = buckets.entry(key).or_insert((0.0, 0));
        entry.0 += row.score;
        entry.1 += 1;
    }

    buckets
        .into_iter()
        .map(|((bucket, evaluator), (sum, count))| SeriesPoint {
            bucket,
            evaluator,
            avg_score: sum / count as f64,
            score_count: count,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(trace_start: &str, evaluator: &str, score: f64) -> ScoreRow {
        ScoreRow {
            run_id: "r1".into(),
            trace_id: format!("trace-{score}"),
            evaluator: evaluator.into(),
            score,
            reasoning: None,
            trace_start: trace_start.into(),
        }
    }

    #[test]
    fn fifty_points_is_per_trace_fifty_one_is_not() {
        let window = Duration::hours(3);
        assert_eq!(adaptive_granularity(window, 50), Granularity::Trace);
        assert_ne!(adaptive_granularity(window, 51), Granularity::Trace);
    }

    #[test]
    fn granularity_scales_with_window() {
        assert_eq!(
            adaptive_granularity(Duration::hours(6), 100),
            Granularity::Minute
        );
        assert_eq!(
            adaptive_granularity(Duration::hours(7), 100),
            Granularity::Hour
        );
        assert_eq!(
            adaptive_granularity(Duration::days(8), 100),
            Granularity::Day
        );
        assert_eq!(
            adaptive_granularity(Duration::days(29), 100),
            Granularity::Week
        );
    }

    #[test]
    fn hour_buckets_average_per_evaluator() {
        let rows = vec![
            row("2024-03-01T10:05:00Z", "faithfulness", 0.8),
            row("2024-03-01T10:40:00Z", "faithfulness", 0.4),
            row("2024-03-01T11:10:00Z", "faithfulness", 1.0),
            row("2024-03-01T10:20:00Z", "toxicity", 0.1),
        ];
        let points = bucket_scores(&rows, Granularity::Hour);
        assert_eq!(points.len(), 3);

        assert_eq!(points[0].evaluator, "faithfulness");
        assert!((points[0].avg_score - 0.6).abs() < 1e-9);
        assert_eq!(points[0].score_count, 2);
        assert_eq!(points[1].evaluator, "toxicity");
        assert_eq!(points[2].score_count, 1);
    }

    #[test]
    fn trace_granularity_is_one_point_per_row() {
        let rows = vec![
            row("2024-03-01T10:05:00Z", "faithfulness", 0.8),
            row("2024-03-01T10:05:30Z", "faithfulness", 0.4),
        ];
        let points = bucket_scores(&rows, Granularity::Trace);
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].score_count, 1);
    }

    #[test]
    fn week_floor_lands_on_monday() {
        // 2024-03-07 is a Thursday; its week starts Monday 2024-03-04.
        let t = DateTime::parse_from_rfc3339("2024-03-07T15:30:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let floored = floor_to(Granularity::Week, t);
        assert_eq!(floored.to_rfc3339(), "2024-03-04T00:00:00+00:00");
    }

    #[test]
    fn unreadable_rows_are_dropped() {
        let rows = vec![
            row("garbage", "faithfulness", 0.8),
            row("2024-03-01T10:05:00Z", "faithfulness", 0.4),
        ];
        assert_eq!(bucket_scores(&rows, Granularity::Hour).len(), 1);
    }
}

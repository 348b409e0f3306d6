//! Monitor and run domain types.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Minimum periodic interval. Anything tighter turns the evaluator into a
/// hot loop against the search backend.
pub const MIN_INTERVAL_MINUTES: i64 = 5;

// ─── Monitor ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorType {
    /// Evaluates a fixed historical window exactly once.
    Past,
    /// Fires periodically over fresh windows.
    Future,
}

impl MonitorType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Past => "past",
            Self::Future => "future",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "past" => Ok(Self::Past),
            "future" => Ok(Self::Future),
            other => Err(Error::invalid_input(format!(
                "monitor type must be 'past' or 'future', got '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorStatus {
    Pending,
    Active,
    Stopped,
    Completed,
}

impl MonitorStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Stopped => "stopped",
            Self::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "stopped" => Ok(Self::Stopped),
            "completed" => Ok(Self::Completed),
            other => Err(Error::internal(format!("unknown monitor status '{other}'"))),
        }
    }
}

/// One user-selected evaluator with its configuration blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluatorSpec {
    pub identifier: String,
    pub display_name: String,
    #[serde(default)]
    pub config: Value,
}

/// Org/project/agent scope a monitor lives under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorScope {
    pub org_name: String,
    pub project_name: String,
    pub agent_name: String,
}

#[derive(Debug, Clone)]
pub struct Monitor {
    pub id: String,
    pub scope: MonitorScope,
    pub name: String,
    pub monitor_type: MonitorType,
    /// `future` monitors only; `None` for `past`.
    pub interval_minutes: Option<i64>,
    /// Next scheduled fire time. Advances monotonically by `interval_minutes`.
    pub next_run_time: Option<DateTime<Utc>>,
    /// Percentage of traces in the window handed to the evaluator (0–100).
    pub sampling_rate: u8,
    /// Fixed window, `past` monitors only.
    pub trace_start: Option<DateTime<Utc>>,
    pub trace_end: Option<DateTime<Utc>>,
    /// Deployment whose traces this monitor evaluates.
    pub component_uid: String,
    pub environment_uid: String,
    pub evaluators: Vec<EvaluatorSpec>,
    /// Provider env-var assignments for LLM-as-judge evaluators.
    pub credentials: HashMap<String, String>,
    pub status: MonitorStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Creation parameters, validated before the insert.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMonitor {
    pub name: String,
    #[serde(rename = "type")]
    pub monitor_type: MonitorType,
    pub interval_minutes: Option<i64>,
    pub sampling_rate: u8,
    pub trace_start: Option<DateTime<Utc>>,
    pub trace_end: Option<DateTime<Utc>>,
    pub component_uid: String,
    pub environment_uid: String,
    pub evaluators: Vec<EvaluatorSpec>,
    #[serde(default)]
    pub credentials: HashMap<String, String>,
}

impl NewMonitor {
    pub fn validate(&self, now: DateTime<Utc>) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::invalid_input("monitor name must not be empty"));
        }
        if self.component_uid.is_empty() || self.environment_uid.is_empty() {
            return Err(Error::invalid_input(
                "componentUid and environmentUid are required",
            ));
        }
        if self.evaluators.is_empty() {
            return Err(Error::invalid_input(
                "a monitor needs at least one evaluator",
            ));
        }
        if self.sampling_rate > 100 {
            return Err(Error::invalid_input("samplingRate must be between 0 and 100"));
        }

        match self.monitor_type {
            MonitorType::Future => {
                let interval = self.interval_minutes.ok_or_else(|| {
                    Error::invalid_input("intervalMinutes is required for future monitors")
                })?;
                if interval < MIN_INTERVAL_MINUTES {
                    return Err(Error::invalid_input(format!(
                        "intervalMinutes must be at least {MIN_INTERVAL_MINUTES}"
                    )));
                }
            }
            MonitorType::Past => {
                let (start, end) = match (self.trace_start, self.trace_end) {
                    (Some(s), Some(e)) => (s, e),
                    _ => {
                        return Err(Error::invalid_input(
                            "traceStart and traceEnd are required for past monitors",
                        ))
                    }
                };
                if start >= end {
                    return Err(Error::invalid_input("traceStart must be before traceEnd"));
                }
                if end > now {
                    return Err(Error::invalid_input("traceEnd must not be in the future"));
                }
            }
        }
        Ok(())
    }
}

// ─── Runs ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(Error::internal(format!("unknown run status '{other}'"))),
        }
    }

    /// Terminal runs are immutable.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

/// One execution instance of a monitor.
#[derive(Debug, Clone)]
pub struct MonitorRun {
    pub id: String,
    pub monitor_id: String,
    pub created_at: DateTime<Utc>,
    /// Trace time slice this run evaluates.
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    /// Ownership token of the process that launched this run.
    pub owner: String,
    pub evaluated_count: i64,
    pub score_count: i64,
}

/// One per-trace score produced by an evaluator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceScore {
    pub trace_id: String,
    pub evaluator: String,
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn base(monitor_type: MonitorType) -> NewMonitor {
        NewMonitor {
            name: "quality".into(),
            monitor_type,
            interval_minutes: Some(10),
            sampling_rate: 50,
            trace_start: None,
            trace_end: None,
            component_uid: "comp-1".into(),
            environment_uid: "env-1".into(),
            evaluators: vec![EvaluatorSpec {
                identifier: "faithfulness".into(),
                display_name: "Faithfulness".into(),
                config: json!({}),
            }],
            credentials: HashMap::new(),
        }
    }

    #[test]
    fn future_monitor_requires_minimum_interval() {
        let now = Utc::now();
        let mut m = base(MonitorType::Future);
        assert!(m.validate(now).is_ok());
        m.interval_minutes = Some(4);
        assert!(m.validate(now).is_err());
        m.interval_minutes = None;
        assert!(m.validate(now).is_err());
    }

    #[test]
    fn past_monitor_window_must_be_historical() {
        let now = Utc::now();
        let mut m = base(MonitorType::Past);
        m.trace_start = Some(now - Duration::hours(2));
        m.trace_end = Some(now - Duration::hours(1));
        assert!(m.validate(now).is_ok());

        m.trace_end = Some(now + Duration::hours(1));
        assert!(m.validate(now).is_err());

        m.trace_start = Some(now - Duration::hours(1));
        m.trace_end = Some(now - Duration::hours(2));
        assert!(m.validate(now).is_err());
    }

    #[test]
    fn evaluators_must_be_non_empty() {
        let mut m = base(MonitorType::Future);
        m.evaluators.clear();
        assert!(m.validate(Utc::now()).is_err());
    }

    #[test]
    fn sampling_rate_is_bounded() {
        let mut m = base(MonitorType::Future);
        m.sampling_rate = 100;
        assert!(m.validate(Utc::now()).is_ok());
        m.sampling_rate = 101;
        assert!(m.validate(Utc::now()).is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Succeeded.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
    }
}

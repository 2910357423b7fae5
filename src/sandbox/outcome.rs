//! The envelope returned for every request.

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use serde_json::Value;

use crate::error::ErrorKind;

/// Wall-clock and monotonic start of a request.
#[derive(Debug, Clone, Copy)]
pub struct StatsClock {
    start_time: DateTime<Utc>,
    started: Instant,
}

impl StatsClock {
    /// Start timing now.
    pub fn start() -> Self {
        Self {
            start_time: Utc::now(),
            started: Instant::now(),
        }
    }

    /// Close the clock and produce stats.
    pub fn finish(&self, memory_delta_bytes: i64, timed_out: bool, aborted: bool) -> ExecutionStats {
        let elapsed = self.started.elapsed();
        ExecutionStats {
            start_time: self.start_time,
            end_time: Utc::now(),
            duration_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            memory_delta_bytes,
            timed_out,
            aborted,
        }
    }
}

/// Timing and resource figures for one request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStats {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_ms: u64,
    /// Heap growth of the isolate across the run; may be negative after a GC.
    pub memory_delta_bytes: i64,
    pub timed_out: bool,
    pub aborted: bool,
}

/// Result of a request, successful or not. Exactly one of value and error
/// is meaningful; the log travels with both.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Success {
        value: Value,
        logs: Vec<String>,
        stats: ExecutionStats,
    },
    Failure {
        error_kind: ErrorKind,
        message: String,
        stack: Option<String>,
        logs: Vec<String>,
        stats: ExecutionStats,
    },
}

impl ExecutionOutcome {
    /// Check if the request succeeded.
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Success { .. })
    }

    /// The normalized value, if the request succeeded.
    pub fn value(&self) -> Option<&Value> {
        match self {
            ExecutionOutcome::Success { value, .. } => Some(value),
            ExecutionOutcome::Failure { .. } => None,
        }
    }

    /// The failure message, if the request failed.
    pub fn error_message(&self) -> Option<&str> {
        match self {
            ExecutionOutcome::Failure { message, .. } => Some(message),
            ExecutionOutcome::Success { .. } => None,
        }
    }

    /// The failure classification, if the request failed.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            ExecutionOutcome::Failure { error_kind, .. } => Some(*error_kind),
            ExecutionOutcome::Success { .. } => None,
        }
    }

    /// The failure stack trace, if one was captured.
    pub fn stack(&self) -> Option<&str> {
        match self {
            ExecutionOutcome::Failure { stack, .. } => stack.as_deref(),
            ExecutionOutcome::Success { .. } => None,
        }
    }

    /// Captured log lines in order.
    pub fn logs(&self) -> &[String] {
        match self {
            ExecutionOutcome::Success { logs, .. } | ExecutionOutcome::Failure { logs, .. } => logs,
        }
    }

    pub fn stats(&self) -> &ExecutionStats {
        match self {
            ExecutionOutcome::Success { stats, .. } | ExecutionOutcome::Failure { stats, .. } => {
                stats
            }
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Envelope<'a> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stack: Option<&'a str>,
    logs: &'a [String],
    stats: &'a ExecutionStats,
}

impl Serialize for ExecutionOutcome {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        Envelope {
            success: self.is_success(),
            value: self.value(),
            error: self.error_message(),
            error_kind: self.error_kind(),
            stack: self.stack(),
            logs: self.logs(),
            stats: self.stats(),
        }
        .serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_success_envelope_shape() {
        let outcome = ExecutionOutcome::Success {
            value: json!({"a": 1}),
            logs: vec!["line".to_string()],
            stats: StatsClock::start().finish(128, false, false),
        };

        let wire = serde_json::to_value(&outcome).unwrap();
        assert_eq!(wire["success"], json!(true));
        assert_eq!(wire["value"], json!({"a": 1}));
        assert!(wire.get("error").is_none());
        assert_eq!(wire["stats"]["memoryDeltaBytes"], json!(128));
        assert_eq!(wire["logs"], json!(["line"]));
    }

    #[test]
    fn test_failure_envelope_shape() {
        let outcome = ExecutionOutcome::Failure {
            error_kind: ErrorKind::Timeout,
            message: "too slow".to_string(),
            stack: None,
            logs: Vec::new(),
            stats: StatsClock::start().finish(0, true, true),
        };

        assert!(!outcome.is_success());
        assert!(outcome.value().is_none());
        let wire = serde_json::to_value(&outcome).unwrap();
        assert_eq!(wire["errorKind"], json!("TimeoutError"));
        assert_eq!(wire["error"], json!("too slow"));
        assert_eq!(wire["stats"]["timedOut"], json!(true));
    }

    #[test]
    fn test_stats_clock_orders_times() {
        let clock = StatsClock::start();
        let stats = clock.finish(0, false, false);
        assert!(stats.end_time >= stats.start_time);
    }
}

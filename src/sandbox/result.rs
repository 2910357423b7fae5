//! Turning a raw engine outcome into an [`ExecutionOutcome`].
//!
//! The harness encodes values the JSON data model cannot carry as tagged
//! objects (`{"$sandbox": "<tag>", ...}`); this module maps those tags to
//! their normalized forms and applies the resolution order for failures,
//! pending results and empty values.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{json, Map, Value};

use crate::error::{JsException, SandboxError};
use crate::sandbox::io::LogEntry;
use crate::sandbox::outcome::{ExecutionOutcome, ExecutionStats};

/// Key marking a harness-encoded value.
pub const TAG: &str = "$sandbox";

/// Value reported when a promise result never settled.
pub const PENDING_PLACEHOLDER: &str = "[Promise <pending>]";

static COMPLETION_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(done|complete|completed|finished|result)\b").expect("valid marker pattern")
});

/// Settings the processor needs from [`SandboxConfig`].
///
/// [`SandboxConfig`]: crate::sandbox::config::SandboxConfig
#[derive(Debug, Clone)]
pub struct ResultOptions {
    pub buffer_preview_bytes: usize,
    pub expected_failure_heuristic: bool,
    pub log_value_fallback: bool,
    pub log_fallback_window: usize,
}

impl Default for ResultOptions {
    fn default() -> Self {
        crate::sandbox::config::SandboxConfig::default().result_options()
    }
}

/// What the executor observed, before normalization.
#[derive(Debug)]
pub enum RawOutcome {
    /// The completion value was not a promise.
    Value { value: Value, explicit: Option<Value> },
    /// The completion value was a promise; `None` if it never settled.
    Future { settled: Option<Settlement> },
    /// Execution failed before producing a value.
    Thrown(SandboxError),
}

/// How a pending result settled.
#[derive(Debug, Clone, PartialEq)]
pub enum Settlement {
    Fulfilled { value: Value, explicit: Option<Value> },
    Rejected(JsException),
}

/// Maps raw outcomes to envelopes. Never fails.
#[derive(Debug, Clone, Default)]
pub struct ResultProcessor {
    options: ResultOptions,
}

impl ResultProcessor {
    pub fn new(options: ResultOptions) -> Self {
        Self { options }
    }

    /// Build the envelope for one request.
    pub fn process(
        &self,
        raw: RawOutcome,
        logs: &[LogEntry],
        stats: ExecutionStats,
        expect_failure: bool,
    ) -> ExecutionOutcome {
        let lines: Vec<String> = logs.iter().map(LogEntry::line).collect();

        match self.resolve(raw, logs) {
            Ok(value) => ExecutionOutcome::Success {
                value,
                logs: lines,
                stats,
            },
            Err(error) if self.is_expected_failure(&error, logs, expect_failure) => {
                ExecutionOutcome::Success {
                    value: Value::String(error.message()),
                    logs: lines,
                    stats,
                }
            }
            Err(error) => ExecutionOutcome::Failure {
                error_kind: error.kind(),
                message: error.to_string(),
                stack: error.exception().and_then(|e| e.stack.clone()),
                logs: lines,
                stats,
            },
        }
    }

    fn resolve(&self, raw: RawOutcome, logs: &[LogEntry]) -> Result<Value, SandboxError> {
        match raw {
            RawOutcome::Thrown(error) => Err(error),
            RawOutcome::Future { settled: None } => {
                Ok(Value::String(PENDING_PLACEHOLDER.to_string()))
            }
            RawOutcome::Future {
                settled: Some(Settlement::Rejected(exception)),
            } => Err(SandboxError::Runtime(exception)),
            RawOutcome::Value { value, explicit }
            | RawOutcome::Future {
                settled: Some(Settlement::Fulfilled { value, explicit }),
            } => Ok(self.resolve_value(&value, explicit.as_ref(), logs)),
        }
    }

    fn resolve_value(&self, value: &Value, explicit: Option<&Value>, logs: &[LogEntry]) -> Value {
        if !is_nullish(value) {
            return self.normalize(value);
        }
        if let Some(explicit) = explicit {
            return self.normalize(explicit);
        }
        if tag_of(value) == Some("void") {
            return Value::Null;
        }
        if self.options.log_value_fallback {
            if let Some(found) = self.scrape_logs(logs) {
                return found;
            }
        }
        Value::Null
    }

    fn is_expected_failure(
        &self,
        error: &SandboxError,
        logs: &[LogEntry],
        expect_failure: bool,
    ) -> bool {
        if expect_failure {
            return matches!(error, SandboxError::Runtime(_) | SandboxError::Compile(_));
        }
        if !self.options.expected_failure_heuristic || !matches!(error, SandboxError::Runtime(_)) {
            return false;
        }
        logs.iter().filter(|entry| !entry.is_diagnostic()).any(|entry| {
            let message = entry.message.to_lowercase();
            message.contains("expected")
                && ["fail", "reject", "error"]
                    .iter()
                    .any(|word| message.contains(word))
        })
    }

    /// Map harness tags to their normalized JSON forms, recursively.
    pub fn normalize(&self, value: &Value) -> Value {
        match value {
            Value::Array(items) => Value::Array(items.iter().map(|v| self.normalize(v)).collect()),
            Value::Object(map) => match map.get(TAG).and_then(Value::as_str) {
                Some(tag) => self.normalize_tagged(tag, map),
                None => self.normalize_fields(map),
            },
            other => other.clone(),
        }
    }

    fn normalize_fields(&self, map: &Map<String, Value>) -> Value {
        Value::Object(
            map.iter()
                .map(|(key, value)| (key.clone(), self.normalize(value)))
                .collect(),
        )
    }

    fn normalize_tagged(&self, tag: &str, map: &Map<String, Value>) -> Value {
        let field = |name: &str| map.get(name).cloned().unwrap_or(Value::Null);
        let text = |name: &str| {
            map.get(name)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };

        match tag {
            "undefined" | "void" => Value::Null,
            "number" | "bigint" | "symbol" => Value::String(text("repr")),
            "function" => json!({
                "type": "function",
                "name": text("name"),
                "arity": field("arity"),
            }),
            "circular" => json!("[Circular]"),
            "truncated" if text("kind") == "array" => json!("[Array]"),
            "truncated" => json!("[Object]"),
            "promise" => json!("[Promise]"),
            "date" => field("iso"),
            "regexp" => Value::String(format!("/{}/{}", text("source"), text("flags"))),
            "error" => json!({
                "name": text("name"),
                "message": text("message"),
                "stack": field("stack"),
            }),
            "url" => Value::String(text("href")),
            "buffer" => self.buffer_preview(map),
            "map" => {
                let entries = map.get("entries").and_then(Value::as_array);
                let object = entries
                    .into_iter()
                    .flatten()
                    .filter_map(Value::as_array)
                    .filter(|pair| pair.len() == 2)
                    .map(|pair| (map_key(self.normalize(&pair[0])), self.normalize(&pair[1])))
                    .collect();
                Value::Object(object)
            }
            "set" => match map.get("values") {
                Some(values) => self.normalize(values),
                None => Value::Array(Vec::new()),
            },
            "object" => match map.get("fields").and_then(Value::as_object) {
                Some(fields) => self.normalize_fields(fields),
                None => Value::Object(Map::new()),
            },
            _ => self.normalize_fields(map),
        }
    }

    fn buffer_preview(&self, map: &Map<String, Value>) -> Value {
        let length = map.get("length").and_then(Value::as_u64).unwrap_or(0);
        let bytes: Vec<u64> = map
            .get("bytes")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(Value::as_u64)
            .take(self.options.buffer_preview_bytes)
            .collect();

        let mut preview = bytes
            .iter()
            .map(|b| format!("{:02x}", b & 0xff))
            .collect::<Vec<_>>()
            .join(" ");
        let truncated = (bytes.len() as u64) < length;
        if truncated {
            preview.push_str(" ...");
        }

        json!({
            "type": map.get("kind").cloned().unwrap_or_else(|| json!("Buffer")),
            "length": length,
            "preview": preview,
            "truncated": truncated,
        })
    }

    /// Last-resort recovery of a result from the tail of the user log.
    fn scrape_logs(&self, logs: &[LogEntry]) -> Option<Value> {
        let user: Vec<&LogEntry> = logs.iter().filter(|e| !e.is_diagnostic()).collect();
        let start = user.len().saturating_sub(self.options.log_fallback_window);
        let window = &user[start..];

        let before_marker = window.windows(2).rev().find_map(|pair| {
            if COMPLETION_MARKER.is_match(&pair[1].message) {
                structured_value(&pair[0].message)
            } else {
                None
            }
        });
        before_marker.or_else(|| window.iter().rev().find_map(|e| structured_value(&e.message)))
    }
}

fn tag_of(value: &Value) -> Option<&str> {
    value.as_object()?.get(TAG)?.as_str()
}

fn is_nullish(value: &Value) -> bool {
    value.is_null() || matches!(tag_of(value), Some("undefined") | Some("void"))
}

fn map_key(key: Value) -> String {
    match key {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

/// A JSON object or array embedded in a log message, if there is one.
fn structured_value(message: &str) -> Option<Value> {
    let start = message.find(['{', '['])?;
    serde_json::from_str::<Value>(message[start..].trim_end())
        .ok()
        .filter(|v| v.is_object() || v.is_array())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::sandbox::io::{CapturedLog, LogLevel};
    use crate::sandbox::outcome::StatsClock;

    fn stats() -> ExecutionStats {
        StatsClock::start().finish(0, false, false)
    }

    fn processor() -> ResultProcessor {
        ResultProcessor::default()
    }

    fn value(value: Value) -> RawOutcome {
        RawOutcome::Value {
            value,
            explicit: None,
        }
    }

    #[test]
    fn test_primitive_passthrough() {
        let outcome = processor().process(value(json!(2)), &[], stats(), false);
        assert_eq!(outcome.value(), Some(&json!(2)));

        let outcome = processor().process(value(json!("hi")), &[], stats(), false);
        assert_eq!(outcome.value(), Some(&json!("hi")));
    }

    #[test]
    fn test_thrown_error_is_failure() {
        let raw = RawOutcome::Thrown(SandboxError::Runtime(JsException {
            name: "Error".into(),
            message: "boom".into(),
            stack: Some("Error: boom\n    at <eval>:1:7".into()),
        }));
        let outcome = processor().process(raw, &[], stats(), false);
        assert_eq!(outcome.error_kind(), Some(ErrorKind::Runtime));
        assert_eq!(outcome.error_message(), Some("Error: boom"));
        assert!(outcome.stack().unwrap().contains("at <eval>"));
    }

    #[test]
    fn test_pending_without_settlement_uses_placeholder() {
        let outcome = processor().process(RawOutcome::Future { settled: None }, &[], stats(), false);
        assert_eq!(outcome.value(), Some(&json!(PENDING_PLACEHOLDER)));
    }

    #[test]
    fn test_rejected_settlement_is_runtime_failure() {
        let raw = RawOutcome::Future {
            settled: Some(Settlement::Rejected(JsException::new("Error", "nope"))),
        };
        let outcome = processor().process(raw, &[], stats(), false);
        assert_eq!(outcome.error_kind(), Some(ErrorKind::Runtime));
    }

    #[test]
    fn test_expected_failure_heuristic() {
        let log = CapturedLog::new();
        log.append(LogLevel::Log, "This is expected to fail");
        let raw = || RawOutcome::Thrown(SandboxError::Runtime(JsException::new("Error", "bad input")));

        let outcome = processor().process(raw(), &log.snapshot(), stats(), false);
        assert_eq!(outcome.value(), Some(&json!("bad input")));

        let strict = ResultProcessor::new(ResultOptions {
            expected_failure_heuristic: false,
            ..ResultOptions::default()
        });
        assert!(!strict.process(raw(), &log.snapshot(), stats(), false).is_success());
    }

    #[test]
    fn test_heuristic_ignores_timeouts_and_diagnostics() {
        let log = CapturedLog::new();
        log.diagnostic("expected failure");
        let raw = RawOutcome::Thrown(SandboxError::Runtime(JsException::new("Error", "x")));
        assert!(!processor().process(raw, &log.snapshot(), stats(), false).is_success());

        log.append(LogLevel::Log, "expected error");
        let raw = RawOutcome::Thrown(SandboxError::Timeout(std::time::Duration::from_millis(5)));
        assert!(!processor().process(raw, &log.snapshot(), stats(), false).is_success());
    }

    #[test]
    fn test_expect_failure_flag() {
        let raw = RawOutcome::Thrown(SandboxError::Runtime(JsException::new("TypeError", "bad")));
        let outcome = processor().process(raw, &[], stats(), true);
        assert_eq!(outcome.value(), Some(&json!("bad")));
    }

    #[test]
    fn test_normalizes_tagged_values() {
        let encoded = json!({
            "when": {"$sandbox": "date", "iso": "2024-01-02T03:04:05.000Z"},
            "re": {"$sandbox": "regexp", "source": "a+b", "flags": "gi"},
            "tags": {"$sandbox": "set", "values": [1, 2]},
            "lookup": {"$sandbox": "map", "entries": [["a", 1], [2, {"$sandbox": "undefined"}]]},
            "site": {"$sandbox": "url", "href": "https://example.com/"},
            "fn": {"$sandbox": "function", "name": "add", "arity": 2},
            "self": {"$sandbox": "circular"},
            "deep": {"$sandbox": "truncated", "kind": "array"},
            "big": {"$sandbox": "bigint", "repr": "10n"},
            "nan": {"$sandbox": "number", "repr": "NaN"},
        });

        let normalized = processor().normalize(&encoded);
        assert_eq!(
            normalized,
            json!({
                "when": "2024-01-02T03:04:05.000Z",
                "re": "/a+b/gi",
                "tags": [1, 2],
                "lookup": {"a": 1, "2": null},
                "site": "https://example.com/",
                "fn": {"type": "function", "name": "add", "arity": 2},
                "self": "[Circular]",
                "deep": "[Array]",
                "big": "10n",
                "nan": "NaN",
            })
        );
    }

    #[test]
    fn test_buffer_preview_is_bounded() {
        let processor = ResultProcessor::new(ResultOptions {
            buffer_preview_bytes: 3,
            ..ResultOptions::default()
        });
        let encoded = json!({"$sandbox": "buffer", "kind": "Uint8Array", "length": 5, "bytes": [1, 2, 255, 4, 5]});
        assert_eq!(
            processor.normalize(&encoded),
            json!({"type": "Uint8Array", "length": 5, "preview": "01 02 ff ...", "truncated": true})
        );
    }

    #[test]
    fn test_colliding_object_key_unwrapped() {
        let encoded = json!({"$sandbox": "object", "fields": {"$sandbox": "user data"}});
        assert_eq!(processor().normalize(&encoded), json!({"$sandbox": "user data"}));
    }

    #[test]
    fn test_explicit_result_wins_over_undefined() {
        let raw = RawOutcome::Value {
            value: json!({"$sandbox": "undefined"}),
            explicit: Some(json!({"rows": 3})),
        };
        let outcome = processor().process(raw, &[], stats(), false);
        assert_eq!(outcome.value(), Some(&json!({"rows": 3})));
    }

    #[test]
    fn test_void_return_skips_log_fallback() {
        let log = CapturedLog::new();
        log.append(LogLevel::Log, r#"{"a":1}"#);
        let outcome = processor().process(
            value(json!({"$sandbox": "void"})),
            &log.snapshot(),
            stats(),
            false,
        );
        assert_eq!(outcome.value(), Some(&Value::Null));
    }

    #[test]
    fn test_log_fallback_prefers_value_before_marker() {
        let log = CapturedLog::new();
        log.append(LogLevel::Log, r#"{"stale":true}"#);
        log.append(LogLevel::Log, r#"result: {"count":3}"#);
        log.append(LogLevel::Log, "Done");
        log.append(LogLevel::Log, "[1,2]");

        let outcome = processor().process(
            value(json!({"$sandbox": "undefined"})),
            &log.snapshot(),
            stats(),
            false,
        );
        assert_eq!(outcome.value(), Some(&json!({"count": 3})));
    }

    #[test]
    fn test_log_fallback_disabled_and_windowed() {
        let log = CapturedLog::new();
        log.append(LogLevel::Log, r#"{"a":1}"#);
        log.append(LogLevel::Log, "plain");

        let off = ResultProcessor::new(ResultOptions {
            log_value_fallback: false,
            ..ResultOptions::default()
        });
        let outcome = off.process(value(Value::Null), &log.snapshot(), stats(), false);
        assert_eq!(outcome.value(), Some(&Value::Null));

        let narrow = ResultProcessor::new(ResultOptions {
            log_fallback_window: 1,
            ..ResultOptions::default()
        });
        let outcome = narrow.process(value(Value::Null), &log.snapshot(), stats(), false);
        assert_eq!(outcome.value(), Some(&Value::Null));

        let outcome = processor().process(value(Value::Null), &log.snapshot(), stats(), false);
        assert_eq!(outcome.value(), Some(&json!({"a": 1})));
    }
}

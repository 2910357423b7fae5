//! Error types for the JavaScript sandbox.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A JavaScript exception as observed by the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsException {
    /// The constructor name of the thrown value (e.g. "TypeError").
    pub name: String,
    /// The exception message.
    pub message: String,
    /// The JavaScript stack trace, if the engine produced one.
    #[serde(default)]
    pub stack: Option<String>,
}

impl JsException {
    /// Create an exception without a stack trace.
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }
}

impl fmt::Display for JsException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}: {}", self.name, self.message)
        }
    }
}

/// Errors that can occur while preparing or running a request.
#[derive(Error, Debug)]
pub enum SandboxError {
    /// The source failed to parse, even after wrapping.
    #[error("compile error: {0}")]
    Compile(JsException),

    /// An exception was thrown (or a promise rejected) during execution.
    #[error("{0}")]
    Runtime(JsException),

    /// The deadline passed before the result settled.
    #[error("timeout: execution exceeded the {}ms deadline", .0.as_millis())]
    Timeout(Duration),

    /// The caller cancelled the request before it settled.
    #[error("execution aborted: cancellation requested")]
    Aborted,

    /// The module-import bridge failed to write, import or release a module.
    #[error("module bridge error: {0}")]
    Bridge(JsException),

    /// The isolate approached its heap limit and was terminated.
    #[error("memory limit exceeded: {0}")]
    MemoryLimitExceeded(String),

    /// The request itself is malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error on the host side.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The engine or its host thread could not be brought up.
    #[error("failed to initialize runtime: {0}")]
    RuntimeInit(#[source] anyhow::Error),
}

/// Coarse classification carried by every failure envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    #[serde(rename = "CompileError")]
    Compile,
    #[serde(rename = "RuntimeError")]
    Runtime,
    #[serde(rename = "TimeoutError")]
    Timeout,
    #[serde(rename = "AbortError")]
    Aborted,
    #[serde(rename = "BridgeError")]
    Bridge,
    #[serde(rename = "MemoryLimitError")]
    MemoryLimit,
    #[serde(rename = "InternalError")]
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Compile => "CompileError",
            ErrorKind::Runtime => "RuntimeError",
            ErrorKind::Timeout => "TimeoutError",
            ErrorKind::Aborted => "AbortError",
            ErrorKind::Bridge => "BridgeError",
            ErrorKind::MemoryLimit => "MemoryLimitError",
            ErrorKind::Internal => "InternalError",
        };
        f.write_str(name)
    }
}

impl SandboxError {
    /// Build a bridge error from a host-side message.
    pub fn bridge(message: impl Into<String>) -> Self {
        SandboxError::Bridge(JsException::new("BridgeError", message))
    }

    /// The envelope classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SandboxError::Compile(_) => ErrorKind::Compile,
            SandboxError::Runtime(_) => ErrorKind::Runtime,
            SandboxError::Timeout(_) => ErrorKind::Timeout,
            SandboxError::Aborted => ErrorKind::Aborted,
            SandboxError::Bridge(_) => ErrorKind::Bridge,
            SandboxError::MemoryLimitExceeded(_) => ErrorKind::MemoryLimit,
            SandboxError::InvalidRequest(_)
            | SandboxError::Config(_)
            | SandboxError::Io(_)
            | SandboxError::RuntimeInit(_) => ErrorKind::Internal,
        }
    }

    /// The JavaScript exception behind this error, if there is one.
    pub fn exception(&self) -> Option<&JsException> {
        match self {
            SandboxError::Compile(e) | SandboxError::Runtime(e) | SandboxError::Bridge(e) => {
                Some(e)
            }
            _ => None,
        }
    }

    /// The bare message, without the kind prefix the `Display` impl adds.
    pub fn message(&self) -> String {
        match self.exception() {
            Some(e) => e.message.clone(),
            None => self.to_string(),
        }
    }

    /// Check if this error represents a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, SandboxError::Timeout(_))
    }

    /// Check if this error represents a memory limit exceeded.
    pub fn is_memory_limit(&self) -> bool {
        matches!(self, SandboxError::MemoryLimitExceeded(_))
    }

    /// Check if this error came from JavaScript code.
    pub fn is_js_exception(&self) -> bool {
        self.exception().is_some()
    }
}

/// Result type alias for sandbox operations.
pub type Result<T> = std::result::Result<T, SandboxError>;

/// Parse an engine error report into a [`JsException`].
///
/// The engine formats uncaught errors as `Uncaught TypeError: message`
/// followed by `    at ...` frames. Anything that does not look like that is
/// kept whole as the message of a generic `Error`.
pub fn parse_js_error(text: &str) -> JsException {
    let text = text.trim();
    let mut lines = text.lines();
    let first = lines.next().unwrap_or_default();

    let head = strip_uncaught(first);
    let frames: Vec<&str> = lines
        .clone()
        .filter(|line| line.trim_start().starts_with("at "))
        .collect();
    let message_tail: Vec<&str> = lines
        .filter(|line| !line.trim_start().starts_with("at "))
        .collect();

    let (name, mut message) = match head.find(':') {
        Some(idx) if looks_like_error_name(head[..idx].trim()) => (
            head[..idx].trim().to_string(),
            head[idx + 1..].trim().to_string(),
        ),
        _ if looks_like_error_name(head.trim()) => (head.trim().to_string(), String::new()),
        _ => ("Error".to_string(), head.trim().to_string()),
    };
    if !message_tail.is_empty() {
        message.push('\n');
        message.push_str(&message_tail.join("\n"));
    }

    let stack = if frames.is_empty() {
        None
    } else {
        Some(format!("{}\n{}", head.trim(), frames.join("\n")))
    };

    JsException {
        name,
        message,
        stack,
    }
}

fn strip_uncaught(line: &str) -> &str {
    let line = line.trim();
    let line = line.strip_prefix("Uncaught").map(str::trim_start).unwrap_or(line);
    line.strip_prefix("(in promise)")
        .map(str::trim_start)
        .unwrap_or(line)
}

/// Check if a token looks like a JavaScript error constructor name.
fn looks_like_error_name(token: &str) -> bool {
    let standalone = ["AggregateError", "InternalError", "DOMException"];

    let starts_upper = token
        .chars()
        .next()
        .map(|c| c.is_ascii_uppercase())
        .unwrap_or(false);
    if !starts_upper || !token.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$') {
        return false;
    }

    token.ends_with("Error") || token.ends_with("Exception") || standalone.contains(&token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_uncaught_error() {
        let parsed = parse_js_error("Uncaught TypeError: x is not a function");
        assert_eq!(parsed.name, "TypeError");
        assert_eq!(parsed.message, "x is not a function");
        assert!(parsed.stack.is_none());
    }

    #[test]
    fn test_parse_error_with_stack() {
        let text = "Uncaught (in promise) RangeError: bad length\n    at foo ([sandbox:run]:1:7)\n    at [sandbox:run]:2:1";

        let parsed = parse_js_error(text);
        assert_eq!(parsed.name, "RangeError");
        assert_eq!(parsed.message, "bad length");
        let stack = parsed.stack.unwrap();
        assert!(stack.starts_with("RangeError: bad length"));
        assert!(stack.contains("at foo"));
    }

    #[test]
    fn test_parse_unstructured_text() {
        let parsed = parse_js_error("something went sideways");
        assert_eq!(parsed.name, "Error");
        assert_eq!(parsed.message, "something went sideways");
    }

    #[test]
    fn test_parse_name_only() {
        let parsed = parse_js_error("Uncaught SyntaxError");
        assert_eq!(parsed.name, "SyntaxError");
        assert!(parsed.message.is_empty());
    }

    #[test]
    fn test_error_helpers() {
        let timeout = SandboxError::Timeout(Duration::from_millis(50));
        assert!(timeout.is_timeout());
        assert_eq!(timeout.kind(), ErrorKind::Timeout);
        assert!(timeout.to_string().contains("timeout"));
        assert!(timeout.to_string().contains("50ms"));

        let runtime = SandboxError::Runtime(JsException::new("Error", "x"));
        assert!(runtime.is_js_exception());
        assert_eq!(runtime.to_string(), "Error: x");
        assert_eq!(runtime.message(), "x");

        let bridge = SandboxError::bridge("disk full");
        assert_eq!(bridge.kind(), ErrorKind::Bridge);
        assert!(bridge.to_string().contains("disk full"));

        assert_eq!(
            SandboxError::InvalidRequest("x".into()).kind(),
            ErrorKind::Internal
        );
    }

    #[test]
    fn test_error_kind_wire_names() {
        let json = serde_json::to_string(&ErrorKind::Timeout).unwrap();
        assert_eq!(json, "\"TimeoutError\"");
        assert_eq!(ErrorKind::Compile.to_string(), "CompileError");
    }
}

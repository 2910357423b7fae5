//! The unit of work submitted to the sandbox.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SandboxError};

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_working_directory() -> PathBuf {
    PathBuf::from(".")
}

/// Source text plus everything needed to run it once.
///
/// Deserializes from the camelCase form the tool layer sends:
/// `{sourceText, timeoutMs, workingDirectory, invocationArgs}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    /// The JavaScript to evaluate.
    pub source_text: String,
    /// Deadline in milliseconds; must be positive.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Directory exposed as `process.cwd()`. The caller validates it exists.
    #[serde(default = "default_working_directory")]
    pub working_directory: PathBuf,
    /// Exposed as `sandbox.args` and the tail of `process.argv`.
    #[serde(default)]
    pub invocation_args: Vec<String>,
    /// Variables layered over the environment snapshot for this request only.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Report a thrown error as a successful value (negative tests).
    #[serde(default)]
    pub expect_failure: bool,
}

impl ExecutionRequest {
    /// Create a request with a 30 second deadline in the current directory.
    pub fn new(source_text: impl Into<String>) -> Self {
        Self {
            source_text: source_text.into(),
            timeout_ms: default_timeout_ms(),
            working_directory: default_working_directory(),
            invocation_args: Vec::new(),
            env: BTreeMap::new(),
            expect_failure: false,
        }
    }

    /// Set the deadline in milliseconds.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Set the deadline.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        let millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self.with_timeout_ms(millis)
    }

    /// Set the working directory.
    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = dir.into();
        self
    }

    /// Set the invocation arguments.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.invocation_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Add an environment variable to the overlay.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Mark the request as a negative test whose error is the expected value.
    pub fn expecting_failure(mut self) -> Self {
        self.expect_failure = true;
        self
    }

    /// The deadline as a duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Check the request before any work is done for it.
    pub fn validate(&self) -> Result<()> {
        if self.timeout_ms == 0 {
            return Err(SandboxError::InvalidRequest(
                "timeoutMs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

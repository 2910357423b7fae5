//! Sandbox configuration with builder pattern.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, SandboxError};
use crate::sandbox::result::ResultOptions;

/// Configuration for the JavaScript sandbox.
///
/// The deadline itself belongs to each [`ExecutionRequest`]; this holds the
/// policy shared by every request a [`JsSandbox`] runs.
///
/// [`ExecutionRequest`]: crate::sandbox::request::ExecutionRequest
/// [`JsSandbox`]: crate::sandbox::executor::JsSandbox
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Fraction of the deadline at which the "still running" note is logged.
    pub soft_deadline_ratio: f64,
    /// How often the watchdog wakes to check deadlines and caller aborts.
    pub watchdog_tick_interval: Duration,
    /// V8 heap limit in bytes.
    pub max_heap_size: usize,
    /// Terminate V8 execution at the deadline, reclaiming CPU-bound code.
    pub hard_terminate: bool,
    /// Maximum number of isolates alive at once.
    pub max_concurrent: usize,
    /// Bytes of a binary buffer kept in its textual preview.
    pub buffer_preview_bytes: usize,
    /// Nesting depth beyond which composite values are elided.
    pub max_depth: usize,
    /// Where bridged modules are written. `None` uses the request's working
    /// directory so relative imports resolve.
    pub bridge_dir: Option<PathBuf>,
    /// Seed each request's environment overlay from the process environment.
    pub inherit_env: bool,
    /// Reframe a thrown error as success when the log announces it was expected.
    pub expected_failure_heuristic: bool,
    /// Recover an undefined result from structured values in the log.
    pub log_value_fallback: bool,
    /// Number of trailing user log entries the fallback inspects.
    pub log_fallback_window: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            soft_deadline_ratio: 0.75,
            watchdog_tick_interval: Duration::from_millis(10),
            max_heap_size: 64 * 1024 * 1024, // 64MB
            hard_terminate: true,
            max_concurrent: 8,
            buffer_preview_bytes: 50,
            max_depth: 20,
            bridge_dir: None,
            inherit_env: true,
            expected_failure_heuristic: true,
            log_value_fallback: true,
            log_fallback_window: 50,
        }
    }
}

impl SandboxConfig {
    /// Create a new builder for SandboxConfig.
    pub fn builder() -> SandboxConfigBuilder {
        SandboxConfigBuilder::default()
    }

    /// Reject settings the executor cannot honor.
    pub fn validate(&self) -> Result<()> {
        if !(self.soft_deadline_ratio > 0.0 && self.soft_deadline_ratio < 1.0) {
            return Err(SandboxError::Config(format!(
                "soft_deadline_ratio must be in (0, 1), got {}",
                self.soft_deadline_ratio
            )));
        }
        if self.watchdog_tick_interval.is_zero() {
            return Err(SandboxError::Config(
                "watchdog_tick_interval must be non-zero".to_string(),
            ));
        }
        if self.max_concurrent == 0 {
            return Err(SandboxError::Config(
                "max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.max_depth == 0 {
            return Err(SandboxError::Config("max_depth must be at least 1".to_string()));
        }
        Ok(())
    }

    /// The subset of settings the result processor needs.
    pub fn result_options(&self) -> ResultOptions {
        ResultOptions {
            buffer_preview_bytes: self.buffer_preview_bytes,
            expected_failure_heuristic: self.expected_failure_heuristic,
            log_value_fallback: self.log_value_fallback,
            log_fallback_window: self.log_fallback_window,
        }
    }
}

/// Builder for creating SandboxConfig instances.
#[derive(Debug, Clone, Default)]
pub struct SandboxConfigBuilder {
    config: SandboxConfig,
}

impl SandboxConfigBuilder {
    /// Set the soft deadline as a fraction of each request's timeout.
    pub fn soft_deadline_ratio(mut self, ratio: f64) -> Self {
        self.config.soft_deadline_ratio = ratio;
        self
    }

    /// Set the watchdog polling interval.
    pub fn watchdog_tick_interval(mut self, interval: Duration) -> Self {
        self.config.watchdog_tick_interval = interval;
        self
    }

    /// Set the V8 heap limit in bytes.
    pub fn max_heap_size(mut self, bytes: usize) -> Self {
        self.config.max_heap_size = bytes;
        self
    }

    /// Enable or disable forced termination at the deadline.
    pub fn hard_terminate(mut self, enabled: bool) -> Self {
        self.config.hard_terminate = enabled;
        self
    }

    /// Set the maximum number of concurrent isolates.
    pub fn max_concurrent(mut self, max: usize) -> Self {
        self.config.max_concurrent = max;
        self
    }

    /// Set the byte count kept in buffer previews.
    pub fn buffer_preview_bytes(mut self, bytes: usize) -> Self {
        self.config.buffer_preview_bytes = bytes;
        self
    }

    /// Set the maximum nesting depth of normalized values.
    pub fn max_depth(mut self, depth: usize) -> Self {
        self.config.max_depth = depth;
        self
    }

    /// Write bridged modules to a fixed directory.
    pub fn bridge_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.bridge_dir = Some(dir.into());
        self
    }

    /// Seed environment overlays from the process environment.
    pub fn inherit_env(mut self, inherit: bool) -> Self {
        self.config.inherit_env = inherit;
        self
    }

    /// Enable or disable the log-based expected-failure reframing.
    pub fn expected_failure_heuristic(mut self, enabled: bool) -> Self {
        self.config.expected_failure_heuristic = enabled;
        self
    }

    /// Enable or disable recovering results from the log.
    pub fn log_value_fallback(mut self, enabled: bool) -> Self {
        self.config.log_value_fallback = enabled;
        self
    }

    /// Set how many trailing log entries the fallback inspects.
    pub fn log_fallback_window(mut self, entries: usize) -> Self {
        self.config.log_fallback_window = entries;
        self
    }

    /// Build the SandboxConfig.
    pub fn build(self) -> SandboxConfig {
        self.config
    }
}

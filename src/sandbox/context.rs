//! Per-request execution context.
//!
//! Everything the sandboxed globals reach into lives here: the captured log,
//! the cancellation token, the environment overlay and the module bridge.
//! A context is built fresh for each request and shared (by cloning its
//! handles) between the isolate's op state, the watchdog and the executor.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::error::JsException;
use crate::sandbox::bridge::ModuleBridge;
use crate::sandbox::config::SandboxConfig;
use crate::sandbox::io::CapturedLog;
use crate::sandbox::request::ExecutionRequest;

/// A value passed to `sandbox.setResult`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Explicit {
    pub value: Value,
}

/// Reports posted by the in-isolate harness.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HarnessEvent {
    /// The wrapped source failed to parse.
    CompileError { error: JsException },
    /// Evaluation threw synchronously.
    Thrown { error: JsException },
    /// Evaluation completed with a non-promise value.
    Value {
        value: Value,
        #[serde(default)]
        explicit: Option<Explicit>,
    },
    /// Evaluation produced a promise; a settlement follows.
    Pending,
    Fulfilled {
        value: Value,
        #[serde(default)]
        explicit: Option<Explicit>,
    },
    Rejected { error: JsException },
    /// Writing or importing a bridged module failed.
    BridgeError { error: JsException },
}

#[derive(Debug, Default)]
struct SlotState {
    pending: bool,
    settled: Option<HarnessEvent>,
}

/// Holds the first terminal report for a request.
#[derive(Clone, Debug, Default)]
pub struct OutcomeSlot {
    state: Arc<Mutex<SlotState>>,
}

impl OutcomeSlot {
    fn mark_pending(&self) {
        self.state.lock().pending = true;
    }

    /// Store a terminal event unless one is already stored.
    fn settle(&self, event: HarnessEvent) -> bool {
        let mut state = self.state.lock();
        if state.settled.is_some() {
            return false;
        }
        state.settled = Some(event);
        true
    }

    /// Whether the result was reported as a promise.
    pub fn is_pending(&self) -> bool {
        self.state.lock().pending
    }

    pub fn is_settled(&self) -> bool {
        self.state.lock().settled.is_some()
    }

    /// Take the stored terminal event.
    pub fn take(&self) -> Option<HarnessEvent> {
        self.state.lock().settled.take()
    }
}

/// Per-request view of the environment. Writes never reach the process
/// environment.
#[derive(Clone, Debug, Default)]
pub struct EnvOverlay {
    vars: Arc<Mutex<BTreeMap<String, String>>>,
}

impl EnvOverlay {
    /// Snapshot the process environment (if `inherit`) and layer `overrides`
    /// on top.
    pub fn snapshot(inherit: bool, overrides: &BTreeMap<String, String>) -> Self {
        let mut vars: BTreeMap<String, String> = if inherit {
            std::env::vars().collect()
        } else {
            BTreeMap::new()
        };
        vars.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        Self {
            vars: Arc::new(Mutex::new(vars)),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.vars.lock().get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.lock().insert(key.into(), value.into());
    }

    pub fn remove(&self, key: &str) -> bool {
        self.vars.lock().remove(key).is_some()
    }

    pub fn keys(&self) -> Vec<String> {
        self.vars.lock().keys().cloned().collect()
    }
}

/// The global environment of one request.
#[derive(Clone, Debug)]
pub struct ExecutionContext {
    /// Fired by the watchdog at the deadline or by the caller.
    pub cancellation: CancellationToken,
    /// Fired once a terminal harness event is stored.
    pub completion: CancellationToken,
    pub log: CapturedLog,
    pub outcome: OutcomeSlot,
    pub env: EnvOverlay,
    pub bridge: ModuleBridge,
    pub cwd: PathBuf,
    pub args: Vec<String>,
    settings: Value,
}

impl ExecutionContext {
    /// Handle a report from the harness.
    ///
    /// Settlements are logged as they arrive. The first terminal event is
    /// stored and fires the completion token; anything arriving after
    /// cancellation is discarded.
    pub fn record(&self, event: HarnessEvent) {
        match &event {
            HarnessEvent::Pending => {
                self.outcome.mark_pending();
                self.log.diagnostic("result is a promise; awaiting settlement");
                return;
            }
            HarnessEvent::Fulfilled { .. } => self.log.diagnostic("promise resolved"),
            HarnessEvent::Rejected { .. } => self.log.diagnostic("promise rejected"),
            _ => {}
        }

        if self.cancellation.is_cancelled() {
            self.log
                .diagnostic("result arrived after cancellation and was discarded");
            return;
        }
        if self.outcome.settle(event) {
            self.completion.cancel();
        }
    }

    /// Static values the bootstrap script reads once.
    pub fn settings_json(&self) -> String {
        self.settings.to_string()
    }
}

/// Builds an [`ExecutionContext`] from a request and the sandbox policy.
pub struct ContextBuilder<'a> {
    request: &'a ExecutionRequest,
    config: &'a SandboxConfig,
    parent: Option<CancellationToken>,
}

impl<'a> ContextBuilder<'a> {
    pub fn new(request: &'a ExecutionRequest, config: &'a SandboxConfig) -> Self {
        Self {
            request,
            config,
            parent: None,
        }
    }

    /// Tie the context's token to a caller-owned one.
    pub fn cancellation(mut self, parent: CancellationToken) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Assemble the context. Performs no I/O and starts no timers.
    pub fn build(self) -> ExecutionContext {
        let cancellation = self
            .parent
            .map(|parent| parent.child_token())
            .unwrap_or_default();
        let bridge_dir = self
            .config
            .bridge_dir
            .clone()
            .unwrap_or_else(|| self.request.working_directory.clone());

        let settings = json!({
            "cwd": self.request.working_directory.to_string_lossy(),
            "args": self.request.invocation_args,
            "previewBytes": self.config.buffer_preview_bytes,
            "maxDepth": self.config.max_depth,
        });

        ExecutionContext {
            cancellation,
            completion: CancellationToken::new(),
            log: CapturedLog::new(),
            outcome: OutcomeSlot::default(),
            env: EnvOverlay::snapshot(self.config.inherit_env, &self.request.env),
            bridge: ModuleBridge::new(bridge_dir),
            cwd: self.request.working_directory.clone(),
            args: self.request.invocation_args.clone(),
            settings,
        }
    }
}

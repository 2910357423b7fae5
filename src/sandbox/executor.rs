//! Core execution engine for the JavaScript sandbox.
//!
//! V8 isolates are `!Send`, so every request runs on its own OS thread with a
//! single-threaded tokio runtime and a fresh `JsRuntime`. The public API is
//! async and `Send`; results come back over a oneshot channel.

use std::rc::Rc;
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use deno_core::{JsRuntime, PollEventLoopOptions, RuntimeOptions, v8};
use tokio::sync::{oneshot, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{parse_js_error, JsException, Result, SandboxError};
use crate::sandbox::config::SandboxConfig;
use crate::sandbox::context::{ContextBuilder, ExecutionContext, HarnessEvent};
use crate::sandbox::deadline::{DeadlineTiming, Terminate, Watchdog};
use crate::sandbox::limits::{heap_delta, used_heap_bytes, HeapGuard};
use crate::sandbox::loader::BridgeLoader;
use crate::sandbox::ops::sandbox_host;
use crate::sandbox::outcome::{ExecutionOutcome, StatsClock};
use crate::sandbox::request::ExecutionRequest;
use crate::sandbox::result::{RawOutcome, ResultProcessor, Settlement};
use crate::sandbox::wrapper::{has_module_syntax, wrap, WrappedSource};

const BOOTSTRAP: &str = include_str!("js/bootstrap.js");

/// Event-loop polls spent flushing rejections once a result has settled.
const DRAIN_POLLS: usize = 4;

/// Lifecycle of a single request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionPhase {
    Idle,
    Compiling,
    Running,
    Completed,
    TimedOut,
    Aborted,
    Errored,
    Finalizing,
    Done,
}

impl ExecutionPhase {
    fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionPhase::Completed
                | ExecutionPhase::TimedOut
                | ExecutionPhase::Aborted
                | ExecutionPhase::Errored
        )
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_advance_to(self, next: ExecutionPhase) -> bool {
        use ExecutionPhase::*;
        match (self, next) {
            (Idle, Compiling) | (Idle, Errored) => true,
            (Compiling, Running) => true,
            (Compiling | Running, TimedOut | Aborted | Errored) => true,
            (Running, Completed) => true,
            (from, Finalizing) => from.is_terminal(),
            (Finalizing, Done) => true,
            _ => false,
        }
    }
}

/// Tracks the phase of one request and rejects illegal transitions.
#[derive(Debug)]
pub struct PhaseTracker {
    phase: ExecutionPhase,
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self {
            phase: ExecutionPhase::Idle,
        }
    }
}

impl PhaseTracker {
    pub fn phase(&self) -> ExecutionPhase {
        self.phase
    }

    /// Move to `next`. Returns false (and stays put) if the move is illegal.
    pub fn advance(&mut self, next: ExecutionPhase) -> bool {
        if !self.phase.can_advance_to(next) {
            tracing::warn!(from = ?self.phase, to = ?next, "rejected invalid phase transition");
            return false;
        }
        tracing::debug!(from = ?self.phase, to = ?next, "phase transition");
        self.phase = next;
        true
    }
}

/// A JavaScript sandbox. Cheap to share; each request gets its own isolate.
///
/// A semaphore bounds the number of isolates alive at once; further requests
/// wait for a slot.
#[derive(Debug, Clone)]
pub struct JsSandbox {
    config: Arc<SandboxConfig>,
    permits: Arc<Semaphore>,
}

impl JsSandbox {
    /// Create a sandbox with the given configuration.
    pub fn new(config: SandboxConfig) -> Result<Self> {
        config.validate()?;
        let permits = Arc::new(Semaphore::new(config.max_concurrent));
        Ok(Self {
            config: Arc::new(config),
            permits,
        })
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Run one request to completion.
    pub async fn execute(&self, request: ExecutionRequest) -> ExecutionOutcome {
        self.execute_with_cancellation(request, CancellationToken::new())
            .await
    }

    /// Run one request, aborting early if `cancel` fires.
    ///
    /// Never fails: every error, including infrastructure failures, comes
    /// back as [`ExecutionOutcome::Failure`].
    pub async fn execute_with_cancellation(
        &self,
        request: ExecutionRequest,
        cancel: CancellationToken,
    ) -> ExecutionOutcome {
        let clock = StatsClock::start();
        let request_id = Uuid::new_v4();
        tracing::info!(
            %request_id,
            source_len = request.source_text.len(),
            timeout_ms = request.timeout_ms,
            "execute: starting"
        );

        if let Err(e) = request.validate() {
            return self.early_failure(e, clock, false);
        }

        let permit = tokio::select! {
            permit = self.permits.clone().acquire_owned() => permit,
            _ = cancel.cancelled() => return self.early_failure(SandboxError::Aborted, clock, true),
        };
        let permit = match permit {
            Ok(permit) => permit,
            Err(_) => {
                let e = SandboxError::RuntimeInit(anyhow::anyhow!("sandbox semaphore closed"));
                return self.early_failure(e, clock, false);
            }
        };

        let config = self.config.clone();
        let (tx, rx) = oneshot::channel();
        let spawned = std::thread::Builder::new()
            .name("sandbox-isolate".to_string())
            .spawn(move || {
                let _permit = permit;
                let outcome = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt.block_on(run_request(&config, request, cancel, clock)),
                    Err(e) => failure_outcome(&config, SandboxError::RuntimeInit(e.into()), clock, false),
                };
                if tx.send(outcome).is_err() {
                    tracing::warn!("sandbox result receiver dropped before result was sent");
                }
            });
        if let Err(e) = spawned {
            let e = SandboxError::RuntimeInit(anyhow::Error::new(e).context("failed to spawn isolate thread"));
            return self.early_failure(e, clock, false);
        }

        let outcome = match rx.await {
            Ok(outcome) => outcome,
            Err(_) => {
                let e = SandboxError::RuntimeInit(anyhow::anyhow!("sandbox thread panicked"));
                self.early_failure(e, clock, false)
            }
        };

        match &outcome {
            ExecutionOutcome::Success { stats, .. } => {
                tracing::info!(%request_id, duration_ms = stats.duration_ms, "execute: complete")
            }
            ExecutionOutcome::Failure {
                error_kind, stats, ..
            } => tracing::warn!(
                %request_id,
                %error_kind,
                duration_ms = stats.duration_ms,
                "execute: failed"
            ),
        }
        outcome
    }

    fn early_failure(&self, error: SandboxError, clock: StatsClock, aborted: bool) -> ExecutionOutcome {
        failure_outcome(&self.config, error, clock, aborted)
    }
}

fn failure_outcome(
    config: &SandboxConfig,
    error: SandboxError,
    clock: StatsClock,
    aborted: bool,
) -> ExecutionOutcome {
    ResultProcessor::new(config.result_options()).process(
        RawOutcome::Thrown(error),
        &[],
        clock.finish(0, false, aborted),
        false,
    )
}

/// What gets evaluated: a wrapped script or a raw module.
enum Payload {
    Script(WrappedSource),
    Module(String),
}

impl Payload {
    fn prepare(source: &str) -> Self {
        if has_module_syntax(source) {
            Payload::Module(source.to_string())
        } else {
            Payload::Script(wrap(source))
        }
    }

    /// The one-shot script that hands the payload to the harness.
    fn invocation(&self) -> Result<String> {
        let (source, mode) = match self {
            Payload::Script(wrapped) => (wrapped.text.as_str(), "script"),
            Payload::Module(source) => (source.as_str(), "module"),
        };
        let literal = serde_json::to_string(source).map_err(|e| SandboxError::RuntimeInit(e.into()))?;
        Ok(format!(
            "((harness) => {{ delete globalThis.__sandboxHarness; return harness.run({literal}, \"{mode}\"); }})(globalThis.__sandboxHarness);"
        ))
    }
}

async fn run_request(
    config: &SandboxConfig,
    request: ExecutionRequest,
    cancel: CancellationToken,
    clock: StatsClock,
) -> ExecutionOutcome {
    let mut phases = PhaseTracker::default();
    let ctx = ContextBuilder::new(&request, config)
        .cancellation(cancel)
        .build();
    let processor = ResultProcessor::new(config.result_options());

    let mut session = match Session::open(config, &request, ctx.clone()) {
        Ok(session) => session,
        Err(e) => {
            abandon(&mut phases, &ctx);
            let stats = clock.finish(0, false, false);
            return processor.process(RawOutcome::Thrown(e), &ctx.log.snapshot(), stats, request.expect_failure);
        }
    };

    phases.advance(ExecutionPhase::Compiling);
    let payload = Payload::prepare(&request.source_text);
    let (raw, terminal) = session.drive(&payload, &mut phases).await;
    phases.advance(terminal);

    phases.advance(ExecutionPhase::Finalizing);
    let memory_delta_bytes = session.finalize();
    phases.advance(ExecutionPhase::Done);

    let (timed_out, aborted) = decided_by(terminal);
    let stats = clock.finish(memory_delta_bytes, timed_out, aborted);
    processor.process(raw, &ctx.log.snapshot(), stats, request.expect_failure)
}

/// Close out a request whose isolate never came up. It still passes
/// through finalization.
fn abandon(phases: &mut PhaseTracker, ctx: &ExecutionContext) {
    phases.advance(ExecutionPhase::Errored);
    phases.advance(ExecutionPhase::Finalizing);
    let swept = ctx.bridge.release_all();
    if swept > 0 {
        tracing::warn!(swept, "removed bridged modules left behind by execution");
    }
    phases.advance(ExecutionPhase::Done);
}

/// The `(timed_out, aborted)` stats flags for a terminal phase. Only the
/// phase that decided the outcome counts; a deadline that fires after the
/// result settled does not.
fn decided_by(terminal: ExecutionPhase) -> (bool, bool) {
    match terminal {
        ExecutionPhase::TimedOut => (true, true),
        ExecutionPhase::Aborted => (false, true),
        _ => (false, false),
    }
}

/// One isolate plus everything attached to it. Field order is drop order:
/// the watchdog stops before the runtime goes, and the heap callback's state
/// outlives the isolate.
struct Session {
    watchdog: Watchdog,
    runtime: JsRuntime,
    heap: HeapGuard,
    ctx: ExecutionContext,
    timeout: Duration,
    baseline_heap: usize,
}

impl Session {
    fn open(config: &SandboxConfig, request: &ExecutionRequest, ctx: ExecutionContext) -> Result<Self> {
        let create_params = v8::CreateParams::default().heap_limits(0, config.max_heap_size);
        let mut runtime = JsRuntime::new(RuntimeOptions {
            module_loader: Some(Rc::new(BridgeLoader::new(ctx.cwd.clone(), ctx.bridge.clone()))),
            extensions: vec![sandbox_host::init_ops(ctx.clone())],
            create_params: Some(create_params),
            ..Default::default()
        });

        let mut heap = HeapGuard::install(runtime.v8_isolate(), config.max_heap_size);
        let terminator = config.hard_terminate.then(|| {
            Box::new(runtime.v8_isolate().thread_safe_handle()) as Box<dyn Terminate>
        });
        let timing = DeadlineTiming::new(
            request.timeout(),
            config.soft_deadline_ratio,
            config.watchdog_tick_interval,
        );

        let watchdog = match Watchdog::arm(timing, ctx.cancellation.clone(), ctx.log.clone(), terminator) {
            Ok(watchdog) => watchdog,
            Err(e) => {
                heap.uninstall(runtime.v8_isolate());
                return Err(e);
            }
        };

        Ok(Self {
            watchdog,
            runtime,
            heap,
            ctx,
            timeout: request.timeout(),
            baseline_heap: 0,
        })
    }

    async fn drive(
        &mut self,
        payload: &Payload,
        phases: &mut PhaseTracker,
    ) -> (RawOutcome, ExecutionPhase) {
        if let Err(e) = self.runtime.execute_script("[sandbox:bootstrap]", BOOTSTRAP) {
            if self.watchdog.timed_out() || self.ctx.cancellation.is_cancelled() {
                return self.classify(None);
            }
            let e = SandboxError::RuntimeInit(anyhow::anyhow!("bootstrap failed: {}", e));
            return (RawOutcome::Thrown(e), ExecutionPhase::Errored);
        }
        self.baseline_heap = used_heap_bytes(self.runtime.v8_isolate());

        let invocation = match payload.invocation() {
            Ok(invocation) => invocation,
            Err(e) => return (RawOutcome::Thrown(e), ExecutionPhase::Errored),
        };

        phases.advance(ExecutionPhase::Running);
        let loop_error = match self.runtime.execute_script("[sandbox:run]", invocation) {
            Ok(_) => self.settle().await,
            Err(e) => Some(e.to_string()),
        };
        self.classify(loop_error)
    }

    /// Drive the event loop until the harness reports, the token fires or
    /// the loop fails. Returns the loop error, if one decides the outcome.
    async fn settle(&mut self) -> Option<String> {
        let completion = self.ctx.completion.clone();
        let cancellation = self.ctx.cancellation.clone();

        let finished = tokio::select! {
            biased;
            _ = completion.cancelled() => None,
            _ = cancellation.cancelled() => None,
            result = self.runtime.run_event_loop(PollEventLoopOptions::default()) => Some(result),
        };

        match finished {
            None => {
                if completion.is_cancelled() {
                    // The result is in; nothing after this may time it out.
                    self.watchdog.disarm();
                    self.drain().await;
                }
                None
            }
            // Nothing left that could settle the result; only the deadline
            // or the caller can end the request now.
            Some(Ok(())) => {
                tokio::select! {
                    biased;
                    _ = completion.cancelled() => {}
                    _ = cancellation.cancelled() => {}
                }
                None
            }
            Some(Err(e)) if self.ctx.outcome.is_settled() => {
                self.ctx
                    .log
                    .diagnostic(format!("event loop error after settlement: {}", e));
                None
            }
            Some(Err(e)) => Some(e.to_string()),
        }
    }

    /// Give the loop a few non-blocking turns so rejections from detached
    /// work reach the log.
    async fn drain(&mut self) {
        for _ in 0..DRAIN_POLLS {
            let poll = std::future::poll_fn(|cx| {
                Poll::Ready(self.runtime.poll_event_loop(cx, PollEventLoopOptions::default()))
            })
            .await;
            match poll {
                Poll::Ready(Ok(())) => return,
                Poll::Ready(Err(e)) => {
                    self.ctx
                        .log
                        .diagnostic(format!("unhandled error after settlement: {}", e));
                    return;
                }
                Poll::Pending => tokio::task::yield_now().await,
            }
        }
    }

    fn classify(&mut self, loop_error: Option<String>) -> (RawOutcome, ExecutionPhase) {
        use ExecutionPhase::*;

        if self.heap.limit_exceeded() {
            let e = SandboxError::MemoryLimitExceeded(format!(
                "heap limit of {} bytes reached",
                self.heap.limiter().max_heap_size()
            ));
            return (RawOutcome::Thrown(e), Errored);
        }

        if let Some(event) = self.ctx.outcome.take() {
            return match event {
                HarnessEvent::CompileError { error } => {
                    (RawOutcome::Thrown(SandboxError::Compile(error)), Errored)
                }
                HarnessEvent::BridgeError { error } => {
                    (RawOutcome::Thrown(SandboxError::Bridge(error)), Errored)
                }
                HarnessEvent::Thrown { error } => (RawOutcome::Thrown(thrown(error)), Errored),
                HarnessEvent::Rejected { error } if error.name == "BridgeError" => {
                    (RawOutcome::Thrown(SandboxError::Bridge(error)), Errored)
                }
                HarnessEvent::Rejected { error } => (
                    RawOutcome::Future {
                        settled: Some(Settlement::Rejected(error)),
                    },
                    Errored,
                ),
                HarnessEvent::Value { value, explicit } => (
                    RawOutcome::Value {
                        value,
                        explicit: explicit.map(|e| e.value),
                    },
                    Completed,
                ),
                HarnessEvent::Fulfilled { value, explicit } => (
                    RawOutcome::Future {
                        settled: Some(Settlement::Fulfilled {
                            value,
                            explicit: explicit.map(|e| e.value),
                        }),
                    },
                    Completed,
                ),
                HarnessEvent::Pending => (RawOutcome::Future { settled: None }, Completed),
            };
        }

        if self.watchdog.timed_out() {
            return (RawOutcome::Thrown(SandboxError::Timeout(self.timeout)), TimedOut);
        }
        if self.ctx.cancellation.is_cancelled() {
            return (RawOutcome::Thrown(SandboxError::Aborted), Aborted);
        }
        if let Some(e) = loop_error {
            return (RawOutcome::Thrown(SandboxError::Runtime(parse_js_error(&e))), Errored);
        }
        if self.ctx.outcome.is_pending() {
            return (RawOutcome::Future { settled: None }, Completed);
        }
        let e = JsException::new("Error", "execution finished without producing a result");
        (RawOutcome::Thrown(SandboxError::Runtime(e)), Errored)
    }

    /// Tear down exactly once: stop the watchdog, measure, detach the heap
    /// callback, sweep bridge files and drop the isolate. Returns the heap
    /// delta over the run.
    fn finalize(mut self) -> i64 {
        self.watchdog.disarm();
        let used = used_heap_bytes(self.runtime.v8_isolate());
        self.heap.uninstall(self.runtime.v8_isolate());

        let swept = self.ctx.bridge.release_all();
        if swept > 0 {
            tracing::warn!(swept, "removed bridged modules left behind by execution");
            self.ctx
                .log
                .diagnostic(format!("removed {} bridged module file(s) after execution", swept));
        }

        heap_delta(self.baseline_heap, used)
    }
}

fn thrown(error: JsException) -> SandboxError {
    if error.name == "BridgeError" {
        SandboxError::Bridge(error)
    } else {
        SandboxError::Runtime(error)
    }
}

//! Deadline enforcement.
//!
//! A watchdog thread owns the only authoritative deadline. At the soft
//! deadline it appends a note to the log; at the hard deadline it cancels the
//! request's token and, when given a [`Terminate`] handle, stops V8 so that
//! CPU-bound code is reclaimed too. It also forwards caller aborts to the
//! terminator.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use deno_core::v8;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SandboxError};
use crate::sandbox::io::CapturedLog;

/// Something that can interrupt a running isolate from another thread.
pub trait Terminate: Send + 'static {
    fn terminate(&self);
}

impl Terminate for v8::IsolateHandle {
    fn terminate(&self) {
        self.terminate_execution();
    }
}

/// Deadlines for one request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeadlineTiming {
    pub timeout: Duration,
    pub soft: Duration,
    pub tick: Duration,
}

impl DeadlineTiming {
    /// Derive the soft deadline as `ratio` of `timeout`.
    pub fn new(timeout: Duration, ratio: f64, tick: Duration) -> Self {
        Self {
            timeout,
            soft: timeout.mul_f64(ratio.clamp(0.0, 1.0)),
            tick,
        }
    }
}

/// Handle to a running watchdog thread.
pub struct Watchdog {
    stop: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
    timed_out: Arc<AtomicBool>,
}

impl Watchdog {
    /// Start watching. The clock starts now.
    pub fn arm(
        timing: DeadlineTiming,
        token: CancellationToken,
        log: CapturedLog,
        terminator: Option<Box<dyn Terminate>>,
    ) -> Result<Self> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let timed_out = Arc::new(AtomicBool::new(false));
        let flag = timed_out.clone();

        let handle = std::thread::Builder::new()
            .name("sandbox-watchdog".to_string())
            .spawn(move || {
                watch(timing, &stop_rx, &token, &log, terminator.as_deref(), &flag);
            })
            .map_err(|e| {
                SandboxError::RuntimeInit(anyhow::Error::new(e).context("failed to spawn watchdog"))
            })?;

        Ok(Self {
            stop: Some(stop_tx),
            handle: Some(handle),
            timed_out,
        })
    }

    /// Whether the hard deadline fired.
    pub fn timed_out(&self) -> bool {
        self.timed_out.load(Ordering::SeqCst)
    }

    /// Stop the watchdog and wait for its thread. Safe to call repeatedly.
    pub fn disarm(&mut self) {
        if let Some(stop) = self.stop.take() {
            // The thread may already have exited after firing.
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("watchdog thread panicked");
            }
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.disarm();
    }
}

fn watch(
    timing: DeadlineTiming,
    stop: &mpsc::Receiver<()>,
    token: &CancellationToken,
    log: &CapturedLog,
    terminator: Option<&dyn Terminate>,
    timed_out: &AtomicBool,
) {
    let started = Instant::now();
    let mut soft_noted = false;

    loop {
        let elapsed = started.elapsed();
        let next = if soft_noted { timing.timeout } else { timing.soft };
        let wait = timing.tick.min(next.saturating_sub(elapsed));

        match stop.recv_timeout(wait) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
            Err(RecvTimeoutError::Timeout) => {}
        }

        if token.is_cancelled() {
            if let Some(terminator) = terminator {
                terminator.terminate();
            }
            return;
        }

        let elapsed = started.elapsed();
        if elapsed >= timing.timeout {
            timed_out.store(true, Ordering::SeqCst);
            log.diagnostic(format!(
                "deadline of {}ms reached; cancelling execution",
                timing.timeout.as_millis()
            ));
            token.cancel();
            if let Some(terminator) = terminator {
                terminator.terminate();
            }
            tracing::debug!(timeout_ms = timing.timeout.as_millis() as u64, "watchdog fired");
            return;
        }

        if !soft_noted && elapsed >= timing.soft {
            soft_noted = true;
            log.diagnostic(format!(
                "soft deadline: still running after {}ms of {}ms",
                elapsed.as_millis(),
                timing.timeout.as_millis()
            ));
        }
    }
}

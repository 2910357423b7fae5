//! # JavaScript Eval Sandbox
//!
//! Runs dynamically supplied JavaScript in a fresh V8 isolate (via
//! `deno_core`) under a hard deadline and reduces whatever happens to one
//! transport-safe envelope.
//!
//! Each request goes through four stages:
//!
//! - **Wrapping**: the source is rewritten so top-level `return`, `await`
//!   and lone object literals evaluate as a script
//! - **Context**: console capture, cancellation token, environment overlay
//!   and a module-import bridge are installed as globals
//! - **Execution**: a watchdog enforces the deadline; promise results are
//!   awaited and raced against cancellation
//! - **Result processing**: values are normalized structurally (dates,
//!   maps, sets, buffers, functions, cycles) and failures are classified
//!
//! ## Example
//!
//! ```rust,ignore
//! use js_eval_sandbox_rs::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let sandbox = JsSandbox::new(SandboxConfig::default())?;
//!
//!     let outcome = sandbox
//!         .execute(ExecutionRequest::new("const o = {a: 1}; o").with_timeout_ms(5_000))
//!         .await;
//!
//!     assert!(outcome.is_success());
//!     println!("{}", serde_json::to_string(&outcome).unwrap());
//!     Ok(())
//! }
//! ```
//!
//! ## What it is not
//!
//! This is not a security boundary. Sandboxed code shares the process with
//! its host and can read files relative to the working directory; the
//! deadline bounds time, not capability.

pub mod error;
pub mod prelude;
pub mod sandbox;

// Re-export main types at crate root for convenience
pub use error::{ErrorKind, JsException, Result, SandboxError};
pub use sandbox::config::{SandboxConfig, SandboxConfigBuilder};
pub use sandbox::executor::{ExecutionPhase, JsSandbox};
pub use sandbox::io::{LogEntry, LogLevel};
pub use sandbox::outcome::{ExecutionOutcome, ExecutionStats};
pub use sandbox::request::ExecutionRequest;
pub use sandbox::wrapper::{wrap, WrapStrategy, WrappedSource};
pub use tokio_util::sync::CancellationToken;

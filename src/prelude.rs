//! Prelude module for convenient imports.

pub use crate::error::{ErrorKind, Result, SandboxError};
pub use crate::sandbox::{
    config::SandboxConfig,
    executor::JsSandbox,
    outcome::ExecutionOutcome,
    request::ExecutionRequest,
};
pub use tokio_util::sync::CancellationToken;

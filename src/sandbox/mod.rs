//! Sandbox module containing all execution-related components.

pub mod bridge;
pub mod config;
pub mod context;
pub mod deadline;
pub mod executor;
pub mod io;
pub mod limits;
pub mod loader;
pub mod ops;
pub mod outcome;
pub mod request;
pub mod result;
pub mod wrapper;

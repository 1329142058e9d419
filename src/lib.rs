//! Chimera - Decision and execution core
//! Feature snapshot in, risk-bounded orders and their lifecycle out

// Public modules
pub mod audit;
pub mod core;
pub mod exchange;
pub mod execution;
pub mod features;
pub mod intent;
pub mod pipeline;
pub mod strategy;
pub mod supervisor;

// Re-exports
pub use core::{Config, Error, ErrorKind, Result};
pub use pipeline::{DecideRequest, DecideResponse, Pipeline};

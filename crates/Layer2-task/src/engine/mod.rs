//! Task Engine
//!
//! - `engine`: construction, submission, approval, cancellation, queries
//! - `execution`: container acquisition, the agent loop, guaranteed cleanup

#[allow(clippy::module_inception)]
mod engine;
mod execution;

pub use engine::{EngineBuilder, EngineStatus, LogTail, TaskEngine, AUTO_APPROVE_ACTOR};

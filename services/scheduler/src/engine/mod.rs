//! Execution engine boundary.
//!
//! The scheduler never runs a check itself. It asks an [`ExecutionEngine`] for
//! a [`Runnable`] per check and runs that.

mod http;

pub use http::{EngineError, HttpEngine};

use async_trait::async_trait;

use crate::store::Check;

/// Performs one check.
#[async_trait]
pub trait Runnable: Send {
    /// Run to completion. Failures are the engine's to record.
    async fn run(self: Box<Self>);
}

/// Turns checks into runnables.
pub trait ExecutionEngine: Send + Sync {
    fn new_check(&self, check: Check) -> Box<dyn Runnable>;
}

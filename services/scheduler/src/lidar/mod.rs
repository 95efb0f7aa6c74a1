//! Check scheduling loops.
//!
//! The [`Scanner`] decides which checkables are due and creates their checks;
//! the [`Checker`] dispatches started checks to the execution engine. The
//! [`Orchestrator`] runs both on their own intervals until shutdown.

mod checker;
mod orchestrator;
mod scanner;

pub use checker::{CheckError, Checker, CheckerConfig};
pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use scanner::{ScanError, Scanner, ScannerConfig};

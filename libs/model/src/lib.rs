//! # lookout-model
//!
//! Types describing what the scheduler checks and the work it hands off.
//!
//! - A *checkable* is a pipeline resource or a custom resource type. Its
//!   configured `check_every` decides how often it is probed.
//! - A *check* is one scheduled probe of a checkable, carrying a [`CheckPlan`]
//!   that snapshots everything the execution engine needs.
//!
//! Everything here is plain data and serializes to the JSON stored alongside
//! checks and sent to the execution engine.

mod error;
mod plan;
mod types;

pub use error::ModelError;
pub use plan::*;
pub use types::*;

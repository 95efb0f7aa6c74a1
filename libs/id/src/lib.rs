//! # lookout-id
//!
//! Stable ID types, parsing, and validation for lookout.
//!
//! ## ID Format
//!
//! All IDs use a prefixed format: `{prefix}_{ulid}`
//!
//! Examples:
//! - `pipe_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `res_01HV4Z3MXNKPQR9HSTZ7WCLD4E`
//! - `chk_01HV4Z4NYPLTRS0JTUA8XDME5F`
//!
//! The prefix keeps resource and resource-type IDs from being mixed up when
//! both flow through the same scheduling code, and ULIDs sort by creation time.

mod error;
#[doc(hidden)]
pub mod macros;
mod types;

pub use error::IdError;
pub use types::*;

pub use ulid::Ulid;

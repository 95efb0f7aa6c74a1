//! lookout check scheduler library.
//!
//! This crate primarily ships a `lookout-scheduler` binary, but we expose the
//! scheduling loops and stores as a library to enable integration testing and
//! embedding.

pub mod config;
pub mod db;
pub mod engine;
pub mod lidar;
pub mod store;

//! Bulldogo Shared Types and Utilities
//!
//! This crate contains types, errors, and utilities shared across the Bulldogo services.

pub mod db;
pub mod error;
pub mod telemetry;
pub mod timestamp;
pub mod types;

pub use db::*;
pub use error::*;
pub use telemetry::init_tracing;
pub use timestamp::{days_until_ceil, normalize_timestamp};
pub use types::*;

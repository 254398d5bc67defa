//! Loam Common Library
//!
//! Shared error handling, environment parsing and logging setup for the Loam
//! workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`LoamError`] and the [`Result`] alias
//! - **Environment**: typed readers for `KEY=value` configuration
//! - **Logging**: tracing subscriber bootstrap shared by every binary
//!
//! # Example
//!
//! ```no_run
//! use loam_common::env;
//!
//! fn budget() -> loam_common::Result<u32> {
//!     env::parse_or("CATALOG_SYNC_REQUEST_BUDGET", 95)
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod env;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{LoamError, Result};

//! LoamBase catalog sync
//!
//! Incrementally seeds the local plant reference catalog from the Perenual
//! species API under a fixed daily request budget. One invocation:
//!
//! 1. claims the pipeline's run state row (or skips when another invocation
//!    holds it, or the catalog is already complete)
//! 2. re-fetches detail for records stored incomplete
//! 3. walks new list pages, fetching detail for every item on a page before
//!    committing it
//! 4. decides whether the catalog is now fully seeded
//!
//! Every trigger (daily cron, quota retry, CLI, HTTP) goes through
//! [`sync::CatalogSync::run`].

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod catalog;
pub mod config;
pub mod error;
pub mod notify;
pub mod provider;
pub mod routes;
pub mod scheduler;
pub mod sync;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::{ProviderError, Result, SyncError};

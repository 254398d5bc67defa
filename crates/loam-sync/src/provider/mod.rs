//! Upstream catalog providers
//!
//! A provider performs exactly one network call per method and reports
//! upstream quota rejection as [`ProviderError::QuotaExceeded`]. Budget
//! accounting happens one level up, in [`budget::BudgetedClient`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::catalog::CatalogRecord;
use crate::error::ProviderError;

pub mod budget;
pub mod perenual;

pub use budget::{Budget, BudgetedClient};
pub use perenual::PerenualClient;

/// Item stub returned by a list call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListItem {
    pub provenance_id: String,
    pub common_name: Option<String>,
    pub scientific_name: Option<String>,
    pub image_url: Option<String>,
}

/// One page of a list call
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ListPage {
    pub items: Vec<ListItem>,
    pub is_last_page: bool,
    /// Upper bound on pages, when the provider reports one
    pub total_pages: Option<u32>,
}

#[async_trait]
pub trait CatalogProvider: Send + Sync {
    /// Provenance source written on every record this provider returns
    fn source(&self) -> &str;

    /// Fetch list page `page` (1-based)
    async fn list_page(&self, page: u32) -> Result<ListPage, ProviderError>;

    async fn fetch_detail(&self, provenance_id: &str) -> Result<CatalogRecord, ProviderError>;
}

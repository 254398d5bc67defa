//! Per-invocation request budget

use std::sync::Arc;
use tracing::debug;

use super::{CatalogProvider, ListPage};
use crate::catalog::CatalogRecord;
use crate::error::ProviderError;

/// Calls allowed in one invocation; list and detail calls cost the same
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budget {
    cap: u32,
    used: u32,
}

impl Budget {
    pub fn new(cap: u32) -> Self {
        Self { cap, used: 0 }
    }

    pub fn cap(&self) -> u32 {
        self.cap
    }

    pub fn used(&self) -> u32 {
        self.used
    }

    pub fn remaining(&self) -> u32 {
        self.cap.saturating_sub(self.used)
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }

    pub fn can_afford(&self, calls: u32) -> bool {
        self.remaining() >= calls
    }

    /// Record one call; returns false without recording when none is left
    pub fn try_spend(&mut self) -> bool {
        if self.is_exhausted() {
            return false;
        }
        self.used += 1;
        true
    }
}

/// Provider wrapper that refuses calls once the budget is spent
///
/// A call counts as soon as it is issued, including calls the upstream
/// rejects or that fail in transport.
pub struct BudgetedClient {
    provider: Arc<dyn CatalogProvider>,
    budget: Budget,
}

impl BudgetedClient {
    pub fn new(provider: Arc<dyn CatalogProvider>, cap: u32) -> Self {
        Self {
            provider,
            budget: Budget::new(cap),
        }
    }

    pub fn source(&self) -> &str {
        self.provider.source()
    }

    pub fn budget(&self) -> Budget {
        self.budget
    }

    pub fn used(&self) -> u32 {
        self.budget.used()
    }

    pub fn remaining(&self) -> u32 {
        self.budget.remaining()
    }

    pub fn can_afford(&self, calls: u32) -> bool {
        self.budget.can_afford(calls)
    }

    fn spend(&mut self) -> Result<(), ProviderError> {
        if self.budget.try_spend() {
            Ok(())
        } else {
            Err(ProviderError::BudgetExhausted {
                cap: self.budget.cap(),
            })
        }
    }

    pub async fn list_page(&mut self, page: u32) -> Result<ListPage, ProviderError> {
        self.spend()?;
        debug!(page, requests_used = self.used(), "List call");
        self.provider.list_page(page).await
    }

    pub async fn fetch_detail(&mut self, provenance_id: &str) -> Result<CatalogRecord, ProviderError> {
        self.spend()?;
        debug!(provenance_id, requests_used = self.used(), "Detail call");
        self.provider.fetch_detail(provenance_id).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::testing::ScriptedProvider;

    #[test]
    fn test_budget_accounting() {
        let mut budget = Budget::new(2);
        assert!(budget.can_afford(2));
        assert!(budget.try_spend());
        assert!(!budget.can_afford(2));
        assert!(budget.try_spend());
        assert!(budget.is_exhausted());
        assert!(!budget.try_spend());
        assert_eq!(budget.used(), 2);
    }

    #[tokio::test]
    async fn test_client_refuses_calls_past_cap() {
        let provider = Arc::new(ScriptedProvider::with_catalog(2, 3));
        let mut client = BudgetedClient::new(provider.clone(), 2);

        client.list_page(1).await.unwrap();
        client.fetch_detail("1").await.unwrap();
        let err = client.fetch_detail("2").await.unwrap_err();

        assert!(matches!(err, ProviderError::BudgetExhausted { cap: 2 }));
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_rejected_calls_still_count() {
        let provider = Arc::new(ScriptedProvider::with_catalog(1, 3));
        provider.reject_next_calls(1);
        let mut client = BudgetedClient::new(provider, 5);

        assert!(client.list_page(1).await.unwrap_err().is_quota_exceeded());
        assert_eq!(client.used(), 1);
        assert_eq!(client.remaining(), 4);
    }
}

//! Pagination driver
//!
//! List-then-detail: list page `current_page + 1`, fetch detail for every
//! item on it, then commit the page by advancing `current_page` and saving
//! the run state. Items upserted from a page that is cut short stay in the
//! catalog, but the page is listed again next invocation.
//!
//! Only the provider's last-page flag ends the walk. An empty page that is
//! not flagged last fails the invocation instead of completing the catalog.

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

use super::state::{RunState, RunStateStore};
use super::{halt_on, Halt};
use crate::catalog::CatalogStore;
use crate::error::{ProviderError, Result};
use crate::provider::{BudgetedClient, ListItem};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PaginationReport {
    pub pages_committed: u32,
    pub records_written: u64,
    pub reached_last_page: bool,
    pub halt: Option<Halt>,
}

impl PaginationReport {
    /// Report for an invocation whose budget ran out before pagination began
    pub fn not_started(state: &RunState) -> Self {
        Self {
            reached_last_page: state.at_last_page(),
            ..Self::default()
        }
    }
}

pub struct PaginationDriver {
    store: Arc<dyn CatalogStore>,
    runs: Arc<dyn RunStateStore>,
    page_size: u32,
}

impl PaginationDriver {
    pub fn new(store: Arc<dyn CatalogStore>, runs: Arc<dyn RunStateStore>, page_size: u32) -> Self {
        Self {
            store,
            runs,
            page_size,
        }
    }

    /// Calls needed to list and fully detail one page
    pub fn page_cost(&self) -> u32 {
        self.page_size.saturating_add(1)
    }

    /// Walk pages until the last one or until the budget cannot cover a page
    pub async fn run(
        &self,
        client: &mut BudgetedClient,
        state: &mut RunState,
    ) -> Result<PaginationReport> {
        let mut report = PaginationReport::default();

        loop {
            if state.at_last_page() {
                report.reached_last_page = true;
                break;
            }

            // Unspent remainder is left unused rather than starting a page
            // that cannot be finished
            if !client.can_afford(self.page_cost()) {
                info!(
                    remaining_budget = client.remaining(),
                    page_cost = self.page_cost(),
                    "Budget cannot cover another page"
                );
                report.halt = Some(Halt::BudgetExhausted);
                break;
            }

            let page = state.current_page + 1;
            let list = match client.list_page(page).await {
                Ok(list) => list,
                Err(e) => {
                    report.halt = Some(halt_on(e)?);
                    break;
                },
            };

            if let Some(total) = list.total_pages {
                state.total_pages = Some(total);
            }

            if list.items.is_empty() {
                if !list.is_last_page {
                    return Err(ProviderError::Decode(format!(
                        "page {} has no usable items but is not the last page (total pages {:?})",
                        page, list.total_pages
                    ))
                    .into());
                }

                // A page within the reported total is committed empty below
                if !list.total_pages.is_some_and(|total| total >= page) {
                    debug!(page, "Empty page past the end, previous page was the last");
                    state.total_pages = Some(state.current_page);
                    report.reached_last_page = true;
                    break;
                }
            }

            if let Some(halt) = self.detail_page(client, page, &list.items).await? {
                info!(page, ?halt, "Page left uncommitted");
                report.halt = Some(halt);
                break;
            }

            let written = list.items.len() as u64;
            state.current_page = page;
            state.records_synced += written;
            state.requests_used = client.used();
            if list.is_last_page {
                state.total_pages = Some(page);
            }
            self.runs.save(state).await?;

            report.pages_committed += 1;
            report.records_written += written;

            info!(
                page,
                total_pages = ?state.total_pages,
                records_synced = state.records_synced,
                requests_used = client.used(),
                "Page committed"
            );

            if list.is_last_page {
                report.reached_last_page = true;
                break;
            }
        }

        Ok(report)
    }

    /// Fetch and upsert detail for every item; `Some` when cut short
    async fn detail_page(
        &self,
        client: &mut BudgetedClient,
        page: u32,
        items: &[ListItem],
    ) -> Result<Option<Halt>> {
        for item in items {
            let mut record = match client.fetch_detail(&item.provenance_id).await {
                Ok(record) => record,
                Err(e) => return halt_on(e).map(Some),
            };
            record.fill_from(item);
            record.name_or_unknown();
            self.store.upsert(&record).await?;

            if !record.is_complete() {
                debug!(
                    page,
                    provenance_id = %item.provenance_id,
                    missing = ?record.missing_core_fields(),
                    "Stored incomplete record"
                );
            }
        }

        Ok(None)
    }
}

//! Test doubles for the pipeline's collaborators
//!
//! [`ScriptedProvider`] serves a synthetic catalog of sequential ids and can
//! be told to reject, fail or panic on specific calls. [`RecordingNotifier`]
//! keeps every event it receives and can be told to panic on one.
//!
//! Built for unit tests and, through the `testing` feature, for the
//! integration tests; never part of a release binary.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};

use crate::catalog::{CatalogRecord, PlantType, SunRequirement, WaterNeeds};
use crate::error::ProviderError;
use crate::notify::{Notifier, SyncEvent};
use crate::provider::{CatalogProvider, ListItem, ListPage};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderCall {
    List(u32),
    Detail(String),
}

#[derive(Debug, Default)]
struct Script {
    calls: Vec<ProviderCall>,
    reject_next: u32,
    reject_from_call: Option<usize>,
    incomplete: HashSet<String>,
    failing: HashSet<String>,
    panicking: HashSet<String>,
    unnamed: HashSet<String>,
    blank_pages: HashSet<u32>,
}

/// Provider over `pages` pages of `page_size` items, ids `1..=pages*page_size`
#[derive(Debug)]
pub struct ScriptedProvider {
    source: String,
    pages: u32,
    page_size: u32,
    script: Mutex<Script>,
}

impl ScriptedProvider {
    pub fn with_catalog(pages: u32, page_size: u32) -> Self {
        Self {
            source: "perenual".to_string(),
            pages,
            page_size,
            script: Mutex::new(Script::default()),
        }
    }

    /// Reject the next `n` calls with a quota error
    pub fn reject_next_calls(&self, n: u32) {
        lock(&self.script).reject_next = n;
    }

    /// Reject every call from the `n`-th (1-based, counted over the
    /// provider's lifetime) onwards
    pub fn reject_from_call(&self, n: usize) {
        lock(&self.script).reject_from_call = Some(n);
    }

    /// Stop rejecting calls
    pub fn reset_quota(&self) {
        let mut script = lock(&self.script);
        script.reject_next = 0;
        script.reject_from_call = None;
    }

    /// Serve a detail missing its sun requirement for `id`
    pub fn set_incomplete(&self, id: &str) {
        lock(&self.script).incomplete.insert(id.to_string());
    }

    /// Serve complete detail for `id` again
    pub fn set_complete(&self, id: &str) {
        lock(&self.script).incomplete.remove(id);
    }

    /// Serve detail for `id` without a common name
    pub fn unnamed_detail(&self, id: &str) {
        lock(&self.script).unnamed.insert(id.to_string());
    }

    /// List `page` with no usable items, as when every stub lacks an id
    pub fn blank_page(&self, page: u32) {
        lock(&self.script).blank_pages.insert(page);
    }

    /// Answer detail calls for `id` with HTTP 500
    pub fn fail_detail(&self, id: &str) {
        lock(&self.script).failing.insert(id.to_string());
    }

    /// Panic inside detail calls for `id`
    pub fn panic_on_detail(&self, id: &str) {
        lock(&self.script).panicking.insert(id.to_string());
    }

    /// Undo [`Self::fail_detail`] and [`Self::panic_on_detail`]
    pub fn clear_failures(&self) {
        let mut script = lock(&self.script);
        script.failing.clear();
        script.panicking.clear();
    }

    pub fn calls(&self) -> usize {
        lock(&self.script).calls.len()
    }

    pub fn call_log(&self) -> Vec<ProviderCall> {
        lock(&self.script).calls.clone()
    }

    pub fn list_calls(&self) -> Vec<u32> {
        lock(&self.script)
            .calls
            .iter()
            .filter_map(|call| match call {
                ProviderCall::List(page) => Some(*page),
                ProviderCall::Detail(_) => None,
            })
            .collect()
    }

    pub fn detail_calls(&self) -> Vec<String> {
        lock(&self.script)
            .calls
            .iter()
            .filter_map(|call| match call {
                ProviderCall::Detail(id) => Some(id.clone()),
                ProviderCall::List(_) => None,
            })
            .collect()
    }

    /// Record the call and decide whether the quota rejects it
    fn record(&self, call: ProviderCall) -> Result<(), ProviderError> {
        let mut script = lock(&self.script);
        script.calls.push(call);

        if script.reject_next > 0 {
            script.reject_next -= 1;
            return Err(ProviderError::QuotaExceeded("HTTP 429 from provider".into()));
        }
        if script
            .reject_from_call
            .is_some_and(|n| script.calls.len() >= n)
        {
            return Err(ProviderError::QuotaExceeded(
                "Upgrade Plan To Premium Access".into(),
            ));
        }
        Ok(())
    }

    fn detail(&self, id: &str, incomplete: bool, unnamed: bool) -> CatalogRecord {
        CatalogRecord {
            common_name: (!unnamed).then(|| format!("Plant {}", id)),
            scientific_name: Some(format!("Genus species-{}", id)),
            plant_type: Some(PlantType::Perennial),
            water_needs: Some(WaterNeeds::Medium),
            sun_requirement: (!incomplete).then_some(SunRequirement::FullSun),
            hardiness_zones: vec!["5".into(), "6".into()],
            ..CatalogRecord::new(self.source.clone(), id)
        }
    }
}

#[async_trait]
impl CatalogProvider for ScriptedProvider {
    fn source(&self) -> &str {
        &self.source
    }

    async fn list_page(&self, page: u32) -> Result<ListPage, ProviderError> {
        self.record(ProviderCall::List(page))?;

        if page == 0 || page > self.pages {
            return Ok(ListPage {
                items: Vec::new(),
                is_last_page: true,
                total_pages: Some(self.pages),
            });
        }

        if lock(&self.script).blank_pages.contains(&page) {
            return Ok(ListPage {
                items: Vec::new(),
                is_last_page: page == self.pages,
                total_pages: Some(self.pages),
            });
        }

        let first = (page - 1) * self.page_size + 1;
        let items = (first..first + self.page_size)
            .map(|id| ListItem {
                provenance_id: id.to_string(),
                common_name: Some(format!("Listed plant {}", id)),
                scientific_name: None,
                image_url: Some(format!("https://images.test/{}.jpg", id)),
            })
            .collect();

        Ok(ListPage {
            items,
            is_last_page: page == self.pages,
            total_pages: Some(self.pages),
        })
    }

    async fn fetch_detail(&self, provenance_id: &str) -> Result<CatalogRecord, ProviderError> {
        self.record(ProviderCall::Detail(provenance_id.to_string()))?;

        let (failing, panicking, incomplete, unnamed) = {
            let script = lock(&self.script);
            (
                script.failing.contains(provenance_id),
                script.panicking.contains(provenance_id),
                script.incomplete.contains(provenance_id),
                script.unnamed.contains(provenance_id),
            )
        };

        if panicking {
            panic!("scripted panic for {}", provenance_id);
        }
        if failing {
            return Err(ProviderError::Status {
                status: 500,
                body: "Internal Server Error".into(),
            });
        }

        Ok(self.detail(provenance_id, incomplete, unnamed))
    }
}

/// Notifier that keeps every event
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<(SyncEvent, String)>>,
    panic_on: Mutex<HashSet<SyncEvent>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Panic when asked to deliver `event`, after recording it
    pub fn panic_on(&self, event: SyncEvent) {
        lock(&self.panic_on).insert(event);
    }

    pub fn events(&self) -> Vec<SyncEvent> {
        lock(&self.events).iter().map(|(event, _)| *event).collect()
    }

    pub fn details(&self, event: SyncEvent) -> Vec<String> {
        lock(&self.events)
            .iter()
            .filter(|(e, _)| *e == event)
            .map(|(_, details)| details.clone())
            .collect()
    }

    pub fn clear(&self) {
        lock(&self.events).clear();
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, event: SyncEvent, details: &str) {
        lock(&self.events).push((event, details.to_string()));

        if lock(&self.panic_on).contains(&event) {
            panic!("scripted notifier panic on {:?}", event);
        }
    }
}

//! Notification collaborator
//!
//! The pipeline reports four terminal events through [`Notifier`]. Delivery
//! is best effort: a notifier logs its own failures and never fails the
//! invocation that raised the event.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::NotifyConfig;

/// Terminal and near-terminal pipeline events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncEvent {
    /// Invocation stopped on its request budget, catalog not yet complete
    BudgetReached,
    /// First provider call of the invocation hit the upstream quota
    QuotaNotReset,
    UnexpectedError,
    /// Run state moved to `complete`
    CatalogSeeded,
}

impl SyncEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncEvent::BudgetReached => "budget_reached",
            SyncEvent::QuotaNotReset => "quota_not_reset",
            SyncEvent::UnexpectedError => "unexpected_error",
            SyncEvent::CatalogSeeded => "catalog_seeded",
        }
    }

    /// Subject line under the configured prefix
    pub fn subject(&self, prefix: &str) -> String {
        match self {
            SyncEvent::BudgetReached => format!("{} — Daily Run Complete", prefix),
            SyncEvent::QuotaNotReset => format!("{} — Quota Not Reset", prefix),
            SyncEvent::UnexpectedError => format!("{} — Error", prefix),
            SyncEvent::CatalogSeeded => format!("{} Complete", prefix),
        }
    }
}

impl fmt::Display for SyncEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: SyncEvent, details: &str);
}

/// Writes events to the log
#[derive(Debug, Clone)]
pub struct TracingNotifier {
    subject_prefix: String,
}

impl TracingNotifier {
    pub fn new(subject_prefix: impl Into<String>) -> Self {
        Self {
            subject_prefix: subject_prefix.into(),
        }
    }
}

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, event: SyncEvent, details: &str) {
        let subject = event.subject(&self.subject_prefix);
        match event {
            SyncEvent::UnexpectedError => error!(%event, %subject, details, "Sync notification"),
            SyncEvent::QuotaNotReset => warn!(%event, %subject, details, "Sync notification"),
            SyncEvent::BudgetReached | SyncEvent::CatalogSeeded => {
                info!(%event, %subject, details, "Sync notification")
            },
        }
    }
}

/// POSTs `{subject, event, details}` as JSON to a webhook
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    http: reqwest::Client,
    url: String,
    subject_prefix: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, subject_prefix: impl Into<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            http,
            url: url.into(),
            subject_prefix: subject_prefix.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, event: SyncEvent, details: &str) {
        let subject = event.subject(&self.subject_prefix);
        let body = json!({
            "subject": subject,
            "event": event,
            "details": details,
        });

        match self.http.post(&self.url).json(&body).send().await {
            Ok(response) if response.status().is_success() => {
                info!(%event, "Notification delivered");
            },
            Ok(response) => {
                warn!(%event, status = %response.status(), "Notification webhook rejected event");
            },
            Err(e) => {
                warn!(%event, "Failed to deliver notification: {}", e.without_url());
            },
        }
    }
}

/// Pick the notifier for this configuration
pub fn from_config(config: &NotifyConfig) -> anyhow::Result<Arc<dyn Notifier>> {
    Ok(match &config.webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone(), &config.subject_prefix)?),
        None => Arc::new(TracingNotifier::new(&config.subject_prefix)),
    })
}

/// Catalog progress figures included in notification details
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressSummary {
    pub current_page: u32,
    pub total_pages: Option<u32>,
    pub records_synced: u64,
    pub requests_used: u32,
    pub budget: u32,
    pub page_size: u32,
    pub total_records: u64,
}

impl ProgressSummary {
    pub fn pages_remaining(&self) -> Option<u32> {
        self.total_pages
            .map(|total| total.saturating_sub(self.current_page))
    }

    /// Days left at one list call plus one detail call per item each page
    pub fn estimated_days(&self) -> Option<u64> {
        let remaining = u64::from(self.pages_remaining()?);
        if self.budget == 0 {
            return None;
        }
        let calls = remaining * (u64::from(self.page_size) + 1);
        Some(calls.div_ceil(u64::from(self.budget)))
    }
}

impl fmt::Display for ProgressSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let unknown = || "Unknown".to_string();
        writeln!(
            f,
            "Current page: {} / {}",
            self.current_page,
            self.total_pages.map_or_else(unknown, |t| t.to_string())
        )?;
        writeln!(f, "Records synced: {}", self.records_synced)?;
        writeln!(f, "Requests used: {} / {}", self.requests_used, self.budget)?;
        writeln!(f, "Total records stored: {}", self.total_records)?;
        writeln!(
            f,
            "Pages remaining: {}",
            self.pages_remaining().map_or_else(unknown, |p| p.to_string())
        )?;
        write!(
            f,
            "Estimated days remaining: {}",
            self.estimated_days().map_or_else(unknown, |d| d.to_string())
        )
    }
}

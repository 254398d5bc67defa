//! Perenual species API client
//!
//! - `GET {base}/species-list?key=..&page=N&per_page=M`
//! - `GET {base}/species/details/{id}?key=..`
//!
//! Perenual signals an exhausted daily quota either with HTTP 429 or with a
//! 200 response whose `error` field asks the caller to upgrade.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use super::{CatalogProvider, ListItem, ListPage};
use crate::catalog::{CatalogRecord, PlantType, SunRequirement, WaterNeeds};
use crate::config::ProviderConfig;
use crate::error::ProviderError;

/// Provenance source of records fetched from Perenual
pub const PERENUAL_SOURCE: &str = "perenual";

const UPGRADE_MARKER: &str = "Upgrade Plan To Premium Access";

const USDA_ZONES: std::ops::RangeInclusive<u32> = 1..=13;

#[derive(Debug, Deserialize)]
struct SpeciesListResponse {
    #[serde(default)]
    data: Vec<SpeciesStub>,
    current_page: Option<u32>,
    last_page: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct SpeciesStub {
    id: Value,
    common_name: Option<String>,
    scientific_name: Option<Value>,
    default_image: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct SpeciesDetail {
    id: Value,
    common_name: Option<String>,
    scientific_name: Option<Value>,
    cycle: Option<Value>,
    watering: Option<Value>,
    sunlight: Option<Value>,
    hardiness: Option<Value>,
    description: Option<Value>,
    default_image: Option<Value>,
    pest_susceptibility: Option<Value>,
}

/// HTTP client for the Perenual API
#[derive(Debug, Clone)]
pub struct PerenualClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    page_size: u32,
}

impl PerenualClient {
    pub fn new(config: &ProviderConfig, page_size: u32) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("loam-sync/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            page_size,
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ProviderError> {
        let url = format!("{}{}", self.base_url, path);
        debug!("GET {}", url);

        // Strip the URL from transport errors, it carries the API key
        let response = self
            .http
            .get(&url)
            .query(&[("key", self.api_key.as_str())])
            .query(query)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.without_url()))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ProviderError::QuotaExceeded(format!(
                "HTTP 429 from Perenual for {}",
                path
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::Transport(e.without_url()))?;

        if !status.is_success() {
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body: truncate(&body, 500),
            });
        }

        let value: Value = serde_json::from_str(&body)
            .map_err(|e| ProviderError::Decode(format!("{}: {}", path, e)))?;

        if let Some(error) = value.get("error") {
            let message = error.as_str().map_or_else(|| error.to_string(), str::to_string);
            if message.contains(UPGRADE_MARKER) {
                return Err(ProviderError::QuotaExceeded(message));
            }
            warn!(path, error = %message, "Perenual returned an error body");
        }

        serde_json::from_value(value).map_err(|e| ProviderError::Decode(format!("{}: {}", path, e)))
    }
}

#[async_trait]
impl CatalogProvider for PerenualClient {
    fn source(&self) -> &str {
        PERENUAL_SOURCE
    }

    async fn list_page(&self, page: u32) -> Result<ListPage, ProviderError> {
        let response: SpeciesListResponse = self
            .get_json(
                "/species-list",
                &[
                    ("page", page.to_string()),
                    ("per_page", self.page_size.to_string()),
                ],
            )
            .await?;

        let is_last_page = response.data.is_empty()
            || matches!(
                (response.current_page, response.last_page),
                (Some(current), Some(last)) if current >= last
            );

        let items = response
            .data
            .into_iter()
            .filter_map(|stub| {
                let Some(provenance_id) = id_string(&stub.id) else {
                    warn!(page, "Skipping species stub without an id");
                    return None;
                };
                Some(ListItem {
                    provenance_id,
                    common_name: non_empty(stub.common_name),
                    scientific_name: stub.scientific_name.as_ref().and_then(scientific_name),
                    image_url: stub.default_image.as_ref().and_then(image_url),
                })
            })
            .collect();

        Ok(ListPage {
            items,
            is_last_page,
            total_pages: response.last_page,
        })
    }

    async fn fetch_detail(&self, provenance_id: &str) -> Result<CatalogRecord, ProviderError> {
        let detail: SpeciesDetail = self
            .get_json(&format!("/species/details/{}", provenance_id), &[])
            .await?;

        if id_string(&detail.id).as_deref() != Some(provenance_id) {
            return Err(ProviderError::Decode(format!(
                "detail for {} returned id {}",
                provenance_id, detail.id
            )));
        }

        Ok(map_detail(PERENUAL_SOURCE, provenance_id, detail))
    }
}

fn map_detail(source: &str, provenance_id: &str, detail: SpeciesDetail) -> CatalogRecord {
    CatalogRecord {
        common_name: non_empty(detail.common_name),
        scientific_name: detail.scientific_name.as_ref().and_then(scientific_name),
        plant_type: detail.cycle.as_ref().and_then(Value::as_str).and_then(map_cycle),
        water_needs: detail.watering.as_ref().and_then(Value::as_str).and_then(map_watering),
        sun_requirement: detail.sunlight.as_ref().and_then(map_sunlight),
        hardiness_zones: detail.hardiness.as_ref().map(hardiness_zones).unwrap_or_default(),
        description: detail
            .description
            .as_ref()
            .and_then(Value::as_str)
            .map(str::to_string)
            .and_then(|d| non_empty(Some(d))),
        image_url: detail.default_image.as_ref().and_then(image_url),
        common_pests: detail.pest_susceptibility.as_ref().map(string_list).unwrap_or_default(),
        ..CatalogRecord::new(source, provenance_id)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn id_string(id: &Value) -> Option<String> {
    match id {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    }
}

/// First entry when the provider sends a list of synonyms
fn scientific_name(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => non_empty(Some(s.clone())),
        Value::Array(names) => names
            .iter()
            .filter_map(Value::as_str)
            .find_map(|s| non_empty(Some(s.to_string()))),
        _ => None,
    }
}

fn image_url(value: &Value) -> Option<String> {
    ["original_url", "regular_url"]
        .iter()
        .filter_map(|key| value.get(key).and_then(Value::as_str))
        .find_map(|url| non_empty(Some(url.to_string())))
}

fn map_cycle(cycle: &str) -> Option<PlantType> {
    match cycle.trim().to_lowercase().as_str() {
        "annual" | "biennial" | "biannual" => Some(PlantType::Annual),
        "perennial" => Some(PlantType::Perennial),
        "shrub" => Some(PlantType::Shrub),
        "tree" => Some(PlantType::Tree),
        _ => None,
    }
}

fn map_watering(watering: &str) -> Option<WaterNeeds> {
    match watering.trim().to_lowercase().as_str() {
        "none" | "minimum" => Some(WaterNeeds::Low),
        "average" => Some(WaterNeeds::Medium),
        "frequent" => Some(WaterNeeds::High),
        _ => None,
    }
}

/// First recognised entry of the `sunlight` list
fn map_sunlight(value: &Value) -> Option<SunRequirement> {
    let entries = value.as_array()?;
    entries.iter().filter_map(Value::as_str).find_map(|entry| {
        match entry.trim().to_lowercase().as_str() {
            "full_sun" | "full sun" => Some(SunRequirement::FullSun),
            "part_shade" | "part shade" | "partial shade" | "part sun/part shade" => {
                Some(SunRequirement::PartialShade)
            },
            "full_shade" | "full shade" | "filtered shade" => Some(SunRequirement::FullShade),
            _ => None,
        }
    })
}

/// Expand `{min, max}` into every USDA zone in between
fn hardiness_zones(value: &Value) -> Vec<String> {
    let bound = |key: &str| -> Option<u32> {
        match value.get(key)? {
            Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    };

    match (bound("min"), bound("max")) {
        (Some(lo), Some(hi)) if lo <= hi => {
            let (lo, hi) = (lo.max(*USDA_ZONES.start()), hi.min(*USDA_ZONES.end()));
            (lo..=hi).map(|z| z.to_string()).collect()
        },
        _ => Vec::new(),
    }
}

fn string_list(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .filter_map(|s| non_empty(Some(s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

fn truncate(body: &str, max: usize) -> String {
    match body.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn detail(value: Value) -> SpeciesDetail {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_map_full_detail() {
        let record = map_detail(
            PERENUAL_SOURCE,
            "1",
            detail(json!({
                "id": 1,
                "common_name": "European Silver Fir",
                "scientific_name": ["Abies alba"],
                "cycle": "Perennial",
                "watering": "Frequent",
                "sunlight": ["filtered shade", "full sun"],
                "hardiness": {"min": "7", "max": "9"},
                "description": "Tall conifer.",
                "default_image": {"original_url": null, "regular_url": "https://img/regular.jpg"},
                "pest_susceptibility": ["aphids", ""]
            })),
        );

        assert_eq!(record.scientific_name.as_deref(), Some("Abies alba"));
        assert_eq!(record.plant_type, Some(PlantType::Perennial));
        assert_eq!(record.water_needs, Some(WaterNeeds::High));
        assert_eq!(record.sun_requirement, Some(SunRequirement::FullShade));
        assert_eq!(record.hardiness_zones, vec!["7", "8", "9"]);
        assert_eq!(record.image_url.as_deref(), Some("https://img/regular.jpg"));
        assert_eq!(record.common_pests, vec!["aphids"]);
        assert!(record.is_complete());
    }

    #[test]
    fn test_free_tier_placeholders_leave_record_incomplete() {
        let record = map_detail(
            PERENUAL_SOURCE,
            "4000",
            detail(json!({
                "id": 4000,
                "common_name": "",
                "scientific_name": "Rosa",
                "cycle": "Upgrade Plans To Premium/Supreme - https://perenual.com/subscription-api-pricing",
                "watering": "Average",
                "sunlight": "Upgrade Plans To Premium/Supreme - https://perenual.com/subscription-api-pricing",
                "hardiness": {"min": "", "max": ""}
            })),
        );

        assert_eq!(record.common_name, None);
        assert_eq!(record.plant_type, None);
        assert_eq!(record.sun_requirement, None);
        assert!(record.hardiness_zones.is_empty());
        assert_eq!(
            record.missing_core_fields(),
            vec!["common_name", "plant_type", "sun_requirement"]
        );
    }

    #[test]
    fn test_cycle_and_watering_maps() {
        assert_eq!(map_cycle("Biannual"), Some(PlantType::Annual));
        assert_eq!(map_cycle("herbaceous perennial"), None);
        assert_eq!(map_watering("minimum"), Some(WaterNeeds::Low));
        assert_eq!(map_watering("None"), Some(WaterNeeds::Low));
    }

    #[test]
    fn test_inverted_hardiness_range_is_ignored() {
        assert!(hardiness_zones(&json!({"min": 9, "max": 4})).is_empty());
        assert_eq!(hardiness_zones(&json!({"min": 4, "max": 5})), vec!["4", "5"]);
    }

    #[test]
    fn test_hardiness_range_is_clamped_to_usda_zones() {
        assert_eq!(
            hardiness_zones(&json!({"min": 1, "max": 4000000000u64})),
            (1..=13).map(|z| z.to_string()).collect::<Vec<_>>()
        );
        assert_eq!(hardiness_zones(&json!({"min": "0", "max": "2"})), vec!["1", "2"]);
        assert!(hardiness_zones(&json!({"min": 20, "max": 30})).is_empty());
    }

    #[test]
    fn test_id_string_accepts_numbers_and_strings() {
        assert_eq!(id_string(&json!(42)).as_deref(), Some("42"));
        assert_eq!(id_string(&json!("42")).as_deref(), Some("42"));
        assert_eq!(id_string(&json!(null)), None);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("ábc", 2), "áb...");
        assert_eq!(truncate("ok", 10), "ok");
    }
}

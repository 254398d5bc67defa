//! Catalog records and their stores
//!
//! A [`CatalogRecord`] is identified by its provenance key
//! `(provenance_source, provenance_id)`. Only the fields on this struct are
//! owned by the pipeline; anything else a store keeps on the same row (user
//! notes, companion data, user-defined entries) is never written here.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod memory;
pub mod postgres;
pub mod store;

pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use store::{CatalogStore, UpsertOutcome};

/// Common name stored when neither detail nor list gave one
pub const UNKNOWN_COMMON_NAME: &str = "Unknown";

/// Growth habit of a plant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlantType {
    Annual,
    Perennial,
    Shrub,
    Tree,
}

impl PlantType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlantType::Annual => "annual",
            PlantType::Perennial => "perennial",
            PlantType::Shrub => "shrub",
            PlantType::Tree => "tree",
        }
    }
}

impl fmt::Display for PlantType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlantType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "annual" => Ok(PlantType::Annual),
            "perennial" => Ok(PlantType::Perennial),
            "shrub" => Ok(PlantType::Shrub),
            "tree" => Ok(PlantType::Tree),
            _ => Err(format!("Invalid plant type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaterNeeds {
    Low,
    Medium,
    High,
}

impl WaterNeeds {
    pub fn as_str(&self) -> &'static str {
        match self {
            WaterNeeds::Low => "low",
            WaterNeeds::Medium => "medium",
            WaterNeeds::High => "high",
        }
    }
}

impl fmt::Display for WaterNeeds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WaterNeeds {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(WaterNeeds::Low),
            "medium" => Ok(WaterNeeds::Medium),
            "high" => Ok(WaterNeeds::High),
            _ => Err(format!("Invalid water needs: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SunRequirement {
    FullSun,
    PartialShade,
    FullShade,
}

impl SunRequirement {
    pub fn as_str(&self) -> &'static str {
        match self {
            SunRequirement::FullSun => "full_sun",
            SunRequirement::PartialShade => "partial_shade",
            SunRequirement::FullShade => "full_shade",
        }
    }
}

impl fmt::Display for SunRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SunRequirement {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full_sun" => Ok(SunRequirement::FullSun),
            "partial_shade" => Ok(SunRequirement::PartialShade),
            "full_shade" => Ok(SunRequirement::FullShade),
            _ => Err(format!("Invalid sun requirement: {}", s)),
        }
    }
}

/// One species entry in the reference catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogRecord {
    pub provenance_source: String,
    pub provenance_id: String,
    pub common_name: Option<String>,
    pub scientific_name: Option<String>,
    pub plant_type: Option<PlantType>,
    pub water_needs: Option<WaterNeeds>,
    pub sun_requirement: Option<SunRequirement>,
    pub hardiness_zones: Vec<String>,
    pub description: Option<String>,
    pub image_url: Option<String>,
    pub common_pests: Vec<String>,
}

impl CatalogRecord {
    /// An empty record carrying only its provenance key
    pub fn new(source: impl Into<String>, provenance_id: impl Into<String>) -> Self {
        Self {
            provenance_source: source.into(),
            provenance_id: provenance_id.into(),
            common_name: None,
            scientific_name: None,
            plant_type: None,
            water_needs: None,
            sun_requirement: None,
            hardiness_zones: Vec::new(),
            description: None,
            image_url: None,
            common_pests: Vec::new(),
        }
    }

    /// Core fields that are still unset
    pub fn missing_core_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.common_name.is_none() {
            missing.push("common_name");
        }
        if self.scientific_name.is_none() {
            missing.push("scientific_name");
        }
        if self.plant_type.is_none() {
            missing.push("plant_type");
        }
        if self.water_needs.is_none() {
            missing.push("water_needs");
        }
        if self.sun_requirement.is_none() {
            missing.push("sun_requirement");
        }
        missing
    }

    /// A record is complete once every core field is set
    pub fn is_complete(&self) -> bool {
        self.common_name.is_some()
            && self.scientific_name.is_some()
            && self.plant_type.is_some()
            && self.water_needs.is_some()
            && self.sun_requirement.is_some()
    }

    /// Give a record nobody named the placeholder name
    ///
    /// Applied after [`Self::fill_from`] so a list stub's name wins.
    pub fn name_or_unknown(&mut self) {
        if self.common_name.is_none() {
            self.common_name = Some(UNKNOWN_COMMON_NAME.to_string());
        }
    }

    /// Fill fields the detail response left empty from the list stub
    pub fn fill_from(&mut self, stub: &crate::provider::ListItem) {
        if self.common_name.is_none() {
            self.common_name = stub.common_name.clone();
        }
        if self.scientific_name.is_none() {
            self.scientific_name = stub.scientific_name.clone();
        }
        if self.image_url.is_none() {
            self.image_url = stub.image_url.clone();
        }
    }
}

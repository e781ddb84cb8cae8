//! Core domain model, search contracts and error taxonomy for the estate workspace.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod normalize;

pub use normalize::{extract_postcode, normalize, normalize_with, parse_price, RecordDefaults};

pub const CRATE_NAME: &str = "estate-core";

/// Default number of listings per result page.
pub const DEFAULT_PAGE_SIZE: usize = 24;

pub const UNKNOWN_AGENT: &str = "Unknown Agent";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logo_url: Option<String>,
}

impl Default for Agent {
    fn default() -> Self {
        Self {
            name: UNKNOWN_AGENT.to_string(),
            phone: None,
            logo_url: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FloorArea {
    pub size: f64,
    pub unit: String,
}

/// Canonical listing record exchanged between every component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Property {
    pub id: String,
    pub address: String,
    pub postcode: String,
    pub price: u64,
    pub property_type: String,
    pub bedrooms: u32,
    pub bathrooms: u32,
    pub description: String,
    pub features: Vec<String>,
    pub main_image_url: Option<String>,
    pub image_urls: Vec<String>,
    pub agent: Agent,
    pub is_active: bool,
    pub source_url: String,
    pub floor_area: Option<FloorArea>,
    #[serde(default)]
    pub is_synthetic: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub added_on: Option<String>,
}

impl Property {
    pub fn detail_cache_key(&self) -> String {
        detail_cache_key(&self.id)
    }
}

pub fn detail_cache_key(id: &str) -> String {
    format!("{DETAIL_KEY_PREFIX}{}", id.trim())
}

pub const DETAIL_KEY_PREFIX: &str = "property:";
pub const SEARCH_KEY_PREFIX: &str = "search:";

/// Immutable description of one search request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SearchFilters {
    pub location: String,
    pub min_price: Option<u64>,
    pub max_price: Option<u64>,
    pub min_beds: Option<u32>,
    pub max_beds: Option<u32>,
    pub property_type: Option<String>,
    pub page: Option<u32>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CacheKeyShape {
    location: String,
    min_price: Option<u64>,
    max_price: Option<u64>,
    min_beds: Option<u32>,
    max_beds: Option<u32>,
    property_type: Option<String>,
    page: u32,
}

impl SearchFilters {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            ..Default::default()
        }
    }

    pub fn with_page(mut self, page: u32) -> Self {
        self.page = Some(page);
        self
    }

    pub fn with_price_range(mut self, min: Option<u64>, max: Option<u64>) -> Self {
        self.min_price = min;
        self.max_price = max;
        self
    }

    pub fn with_beds_range(mut self, min: Option<u32>, max: Option<u32>) -> Self {
        self.min_beds = min;
        self.max_beds = max;
        self
    }

    pub fn with_property_type(mut self, property_type: impl Into<String>) -> Self {
        self.property_type = Some(property_type.into());
        self
    }

    /// Requested page, clamped to 1-based numbering.
    pub fn page(&self) -> u32 {
        self.page.unwrap_or(1).max(1)
    }

    pub fn validate(&self) -> Result<(), IngestError> {
        if self.location.trim().is_empty() {
            return Err(IngestError::InvalidQuery(
                "a search location is required".to_string(),
            ));
        }
        if let (Some(min), Some(max)) = (self.min_price, self.max_price) {
            if min > max {
                return Err(IngestError::InvalidQuery(format!(
                    "minimum price {min} exceeds maximum price {max}"
                )));
            }
        }
        if let (Some(min), Some(max)) = (self.min_beds, self.max_beds) {
            if min > max {
                return Err(IngestError::InvalidQuery(format!(
                    "minimum bedrooms {min} exceeds maximum bedrooms {max}"
                )));
            }
        }
        Ok(())
    }

    /// Deterministic cache key: equal filters always serialize identically.
    pub fn cache_key(&self) -> String {
        let shape = CacheKeyShape {
            location: self.location.trim().to_lowercase(),
            min_price: self.min_price,
            max_price: self.max_price,
            min_beds: self.min_beds,
            max_beds: self.max_beds,
            property_type: self
                .property_type
                .as_ref()
                .map(|t| t.trim().to_lowercase())
                .filter(|t| !t.is_empty()),
            page: self.page(),
        };
        let body = serde_json::to_string(&shape).unwrap_or_default();
        format!("{SEARCH_KEY_PREFIX}{body}")
    }

    /// Local filter used when results come from a dataset rather than a remote search.
    pub fn matches(&self, property: &Property) -> bool {
        let needle = self.location.trim().to_lowercase();
        if !needle.is_empty()
            && !property.address.to_lowercase().contains(&needle)
            && !property.postcode.to_lowercase().contains(&needle)
        {
            return false;
        }
        if self.min_price.is_some_and(|min| property.price < min) {
            return false;
        }
        if self.max_price.is_some_and(|max| property.price > max) {
            return false;
        }
        if self.min_beds.is_some_and(|min| property.bedrooms < min) {
            return false;
        }
        if self.max_beds.is_some_and(|max| property.bedrooms > max) {
            return false;
        }
        if let Some(wanted) = self.property_type.as_deref().map(str::trim) {
            if !wanted.is_empty()
                && !property
                    .property_type
                    .to_lowercase()
                    .contains(&wanted.to_lowercase())
            {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchPage {
    pub properties: Vec<Property>,
    pub total_results: u64,
    pub current_page: u32,
    pub total_pages: u32,
}

impl SearchPage {
    pub fn empty(page: u32) -> Self {
        Self {
            properties: Vec::new(),
            total_results: 0,
            current_page: page.max(1),
            total_pages: 0,
        }
    }

    /// Wraps one already-paged slice of results.
    pub fn from_page(
        properties: Vec<Property>,
        total_results: u64,
        page: u32,
        page_size: usize,
    ) -> Self {
        Self {
            total_pages: total_pages(total_results, page_size),
            total_results,
            current_page: page.max(1),
            properties,
        }
    }

    /// Slices a complete result set down to the requested page.
    pub fn paginate(all: Vec<Property>, page: u32, page_size: usize) -> Self {
        let total = all.len() as u64;
        let page = page.max(1);
        let start = (page as usize - 1).saturating_mul(page_size.max(1));
        let properties = all.into_iter().skip(start).take(page_size.max(1)).collect();
        Self::from_page(properties, total, page, page_size)
    }
}

pub fn total_pages(total_results: u64, page_size: usize) -> u32 {
    let size = page_size.max(1) as u64;
    total_results.div_ceil(size) as u32
}

/// Property persisted by an explicit import, tagged with its owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportedProperty {
    pub owner_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub property: Property,
}

impl ImportedProperty {
    pub fn tag(property: Property, owner_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            owner_id: owner_id.to_string(),
            created_at: now,
            updated_at: now,
            property,
        }
    }
}

/// Errors surfaced to callers of the ingestion facade.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IngestError {
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("listing provider rejected our credentials: {0}")]
    AdapterAuth(String),
    #[error("listing provider temporarily unavailable: {0}")]
    AdapterTransient(String),
    #[error("could not persist listings: {0}")]
    Persistence(String),
}

impl IngestError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidQuery(_) => "invalid_query",
            Self::AdapterAuth(_) => "adapter_auth",
            Self::AdapterTransient(_) => "adapter_transient",
            Self::Persistence(_) => "persistence",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(address: &str, price: u64, beds: u32, kind: &str) -> Property {
        let mut p = normalize(&serde_json::json!({}));
        p.address = address.to_string();
        p.price = price;
        p.bedrooms = beds;
        p.property_type = kind.to_string();
        p
    }

    #[test]
    fn pagination_arithmetic() {
        assert_eq!(total_pages(50, 24), 3);
        assert_eq!(total_pages(48, 24), 2);
        assert_eq!(total_pages(1, 24), 1);
        assert_eq!(total_pages(0, 24), 0);
    }

    #[test]
    fn paginate_slices_requested_page() {
        let all = (0..50)
            .map(|i| listing(&format!("{i} High Street"), 100, 2, "Flat"))
            .collect::<Vec<_>>();
        let page = SearchPage::paginate(all, 3, 24);
        assert_eq!(page.properties.len(), 2);
        assert_eq!(page.total_results, 50);
        assert_eq!(page.total_pages, 3);
        assert_eq!(page.current_page, 3);
        assert_eq!(page.properties[0].address, "48 High Street");
    }

    #[test]
    fn empty_location_is_invalid() {
        let err = SearchFilters::new("   ").validate().unwrap_err();
        assert!(matches!(err, IngestError::InvalidQuery(_)));
        assert!(SearchFilters::new("Leeds").validate().is_ok());
    }

    #[test]
    fn inverted_ranges_are_invalid() {
        let filters = SearchFilters::new("Leeds").with_price_range(Some(500), Some(100));
        assert!(filters.validate().is_err());
    }

    #[test]
    fn cache_key_is_stable_and_case_insensitive_on_location() {
        let a = SearchFilters::new("Leeds").with_page(1);
        let b = SearchFilters::new("  leeds ");
        assert_eq!(a.cache_key(), b.cache_key());
        assert!(a.cache_key().starts_with(SEARCH_KEY_PREFIX));

        let c = SearchFilters::new("Leeds").with_page(2);
        assert_ne!(a.cache_key(), c.cache_key());
    }

    #[test]
    fn filters_match_on_location_and_ranges() {
        let p = listing("12 Park Row, Leeds LS1 5HD", 250_000, 3, "Terraced house");
        assert!(SearchFilters::new("leeds").matches(&p));
        assert!(!SearchFilters::new("Bristol").matches(&p));
        assert!(SearchFilters::new("Leeds")
            .with_price_range(Some(200_000), Some(300_000))
            .matches(&p));
        assert!(!SearchFilters::new("Leeds")
            .with_beds_range(Some(4), None)
            .matches(&p));
        assert!(SearchFilters::new("Leeds").with_property_type("house").matches(&p));
        assert!(!SearchFilters::new("Leeds").with_property_type("flat").matches(&p));
    }
}

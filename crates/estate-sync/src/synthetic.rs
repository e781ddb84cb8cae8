//! Deterministic sample listings served when every real source is unavailable.
//!
//! Output depends only on the location slug: the same location always yields the
//! same records, and any record can be rebuilt from its id alone.

use estate_adapters::slugify;
use estate_core::{Agent, Property, SearchFilters, SearchPage, UNKNOWN_AGENT};
use sha2::{Digest, Sha256};

pub const SYNTHETIC_ID_PREFIX: &str = "synthetic-";

const LARGE_CITIES: &[&str] = &[
    "london",
    "birmingham",
    "manchester",
    "leeds",
    "glasgow",
    "liverpool",
    "bristol",
    "sheffield",
    "edinburgh",
    "newcastle",
    "cardiff",
    "nottingham",
    "leicester",
    "belfast",
];
const SMALL_PLACE_MARKERS: &[&str] = &["village", "rural", "hamlet"];

const STREETS: &[&str] = &[
    "High Street",
    "Station Road",
    "Church Lane",
    "Victoria Road",
    "Mill Lane",
    "Park Avenue",
    "Queen Street",
    "The Crescent",
    "Orchard Close",
    "Manor Way",
];
const PROPERTY_TYPES: &[&str] = &[
    "Flat",
    "Terraced house",
    "Semi-detached house",
    "Detached house",
    "Bungalow",
    "Maisonette",
];
const FEATURES: &[&str] = &[
    "Off-street parking",
    "Private garden",
    "Recently refurbished",
    "Close to transport links",
    "Double glazing",
    "Gas central heating",
    "Chain free",
    "Open-plan kitchen",
];

/// SplitMix64: small, fast and stable across platforms and releases.
struct SeededRng(u64);

impl SeededRng {
    fn next_u64(&mut self) -> u64 {
        self.0 = self.0.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.0;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }

    /// Uniform in `low..=high`.
    fn range(&mut self, low: u64, high: u64) -> u64 {
        low + self.next_u64() % (high - low + 1)
    }

    fn pick<'a>(&mut self, items: &[&'a str]) -> &'a str {
        items[self.range(0, items.len() as u64 - 1) as usize]
    }
}

fn location_seed(slug: &str) -> u64 {
    let digest = Sha256::digest(slug.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

fn is_large_city(slug: &str) -> bool {
    LARGE_CITIES
        .iter()
        .any(|city| slug == *city || slug.starts_with(&format!("{city}-")))
}

/// Number of listings a location produces before filters are applied.
pub fn listing_count(slug: &str) -> u64 {
    let mut rng = SeededRng(location_seed(slug));
    if SMALL_PLACE_MARKERS.iter().any(|m| slug.contains(m)) {
        rng.range(3, 8)
    } else if is_large_city(slug) {
        rng.range(60, 120)
    } else {
        rng.range(12, 36)
    }
}

fn display_name(slug: &str) -> String {
    slug.split('-')
        .filter(|w| !w.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn synthetic_property(slug: &str, index: u64) -> Property {
    let base = location_seed(slug);
    let mut rng = SeededRng(base ^ index.wrapping_mul(0xA24B_AED4_963E_E407));
    let place = display_name(slug);

    let property_type = rng.pick(PROPERTY_TYPES);
    let bedrooms = if property_type == "Flat" || property_type == "Maisonette" {
        rng.range(1, 3)
    } else {
        rng.range(2, 5)
    } as u32;
    let bathrooms = rng.range(1, u64::from(bedrooms.min(3))) as u32;

    let tier = if is_large_city(slug) { 310_000 } else { 210_000 };
    let raw_price = tier + u64::from(bedrooms) * 45_000 + rng.range(0, 90_000);
    let price = raw_price / 5_000 * 5_000;

    let mut features = Vec::with_capacity(3);
    while features.len() < 3 {
        let feature = rng.pick(FEATURES).to_string();
        if !features.contains(&feature) {
            features.push(feature);
        }
    }

    let address = format!("{} {}, {}", rng.range(1, 180), rng.pick(STREETS), place);
    Property {
        id: format!("{SYNTHETIC_ID_PREFIX}{slug}-{index}"),
        description: format!(
            "{bedrooms} bedroom {} in {place}. Sample listing shown while live listings are unavailable.",
            property_type.to_lowercase()
        ),
        address,
        postcode: String::new(),
        price,
        property_type: property_type.to_string(),
        bedrooms,
        bathrooms,
        features,
        main_image_url: None,
        image_urls: Vec::new(),
        agent: Agent {
            name: UNKNOWN_AGENT.to_string(),
            phone: None,
            logo_url: None,
        },
        is_active: true,
        source_url: String::new(),
        floor_area: None,
        is_synthetic: true,
        latitude: None,
        longitude: None,
        added_on: None,
    }
}

/// All synthetic listings for a location, before pagination.
pub fn listings_for(filters: &SearchFilters) -> Vec<Property> {
    let slug = slugify(&filters.location);
    if slug.is_empty() {
        return Vec::new();
    }
    // generated addresses always carry the location, so only ranges filter here
    let ranges = SearchFilters {
        location: String::new(),
        ..filters.clone()
    };
    (1..=listing_count(&slug))
        .map(|i| synthetic_property(&slug, i))
        .filter(|p| ranges.matches(p))
        .collect()
}

pub fn search_page(filters: &SearchFilters, page_size: usize) -> SearchPage {
    SearchPage::paginate(listings_for(filters), filters.page(), page_size)
}

/// Rebuilds the listing behind a `synthetic-<slug>-<n>` id.
pub fn property_for_id(id: &str) -> Option<Property> {
    let rest = id.trim().strip_prefix(SYNTHETIC_ID_PREFIX)?;
    let (slug, index) = rest.rsplit_once('-')?;
    let index = index.parse::<u64>().ok()?;
    if slug.is_empty() || index == 0 || index > listing_count(slug) {
        return None;
    }
    Some(synthetic_property(slug, index))
}

pub fn is_synthetic_id(id: &str) -> bool {
    id.trim().starts_with(SYNTHETIC_ID_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_location_same_output() {
        let a = search_page(&SearchFilters::new("Harrogate"), 24);
        let b = search_page(&SearchFilters::new("  harrogate "), 24);
        assert_eq!(a, b);
        assert!(a.properties.iter().all(|p| p.is_synthetic));
    }

    #[test]
    fn city_size_drives_result_count() {
        let city = listing_count("manchester");
        let village = listing_count("little-snoring-village");
        let town = listing_count("harrogate");
        assert!((60..=120).contains(&city));
        assert!((3..=8).contains(&village));
        assert!((12..=36).contains(&town));
    }

    #[test]
    fn ids_resolve_back_to_the_same_record() {
        let page = search_page(&SearchFilters::new("Kings Cross"), 24);
        let first = &page.properties[0];
        assert!(first.id.starts_with("synthetic-kings-cross-"));
        assert_eq!(property_for_id(&first.id).as_ref(), Some(first));
        assert!(property_for_id("synthetic-kings-cross-100000").is_none());
        assert!(property_for_id("12345").is_none());
    }

    #[test]
    fn range_filters_apply() {
        let filters = SearchFilters::new("London").with_beds_range(Some(4), None);
        let all = listings_for(&filters);
        assert!(!all.is_empty());
        assert!(all.iter().all(|p| p.bedrooms >= 4));
    }

    #[test]
    fn records_are_plausible() {
        for p in listings_for(&SearchFilters::new("Bristol")) {
            assert!(p.price > 0 && p.price % 5_000 == 0);
            assert!(p.bathrooms >= 1 && p.bathrooms <= p.bedrooms.max(1));
            assert!(p.address.ends_with("Bristol"));
            assert!(p.image_urls.is_empty() && p.main_image_url.is_none());
            assert_eq!(p.features.len(), 3);
        }
    }
}

//! Converts heterogeneous listing payloads into the canonical [`Property`] shape.
//!
//! Every attribute is probed under several plausible field names and every field
//! has a fallback, so `normalize` is total over arbitrary JSON input.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::{Agent, FloorArea, Property};

static UK_POSTCODE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b([A-Z]{1,2}[0-9][A-Z0-9]?)\s*([0-9][A-Z]{2})\b")
        .expect("postcode pattern compiles")
});

static LISTING_ID_IN_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:/properties/|property-)(\d+)").expect("listing id pattern compiles")
});

static HTML_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").expect("tag pattern compiles"));

const PRICE_PATHS: &[&[&str]] = &[
    &["price"],
    &["prices", "primaryPrice"],
    &["priceAmount"],
    &["displayPrice"],
    &["propertyInfo", "price"],
];

const PRICE_OBJECT_PATHS: &[&[&str]] = &[
    &["amount"],
    &["value"],
    &["primaryPrice"],
    &["displayPrice"],
    &["displayPrices", "0", "displayPrice"],
];

const MAIN_IMAGE_PATHS: &[&[&str]] = &[
    &["mainImageUrl"],
    &["mainImage"],
    &["propertyImages", "mainImageSrc"],
    &["image"],
];

const IMAGE_LIST_PATHS: &[&[&str]] = &[
    &["propertyImages", "images"],
    &["images"],
    &["imageUrls"],
    &["photos"],
    &["propertyInfo", "images"],
];

const FEATURE_PATHS: &[&[&str]] = &[&["features"], &["keyFeatures"], &["propertyInfo", "features"]];

const AGENT_PATHS: &[&[&str]] = &[&["agent"], &["customer"], &["branch"]];

const FLOOR_AREA_PATHS: &[&[&str]] = &[
    &["floorArea"],
    &["size"],
    &["sizings", "0"],
    &["displaySize"],
];

/// Per-source fallbacks applied when a payload omits a field.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordDefaults {
    pub bedrooms: u32,
    pub bathrooms: u32,
    pub property_type: String,
    /// Prefix for relative listing links such as `/properties/123`.
    pub base_url: Option<String>,
}

impl Default for RecordDefaults {
    fn default() -> Self {
        Self {
            bedrooms: 0,
            bathrooms: 0,
            property_type: "Unknown".to_string(),
            base_url: None,
        }
    }
}

pub fn normalize(raw: &JsonValue) -> Property {
    normalize_with(raw, &RecordDefaults::default())
}

pub fn normalize_with(raw: &JsonValue, defaults: &RecordDefaults) -> Property {
    let address = first_text(
        raw,
        &[
            &["displayAddress"],
            &["address", "displayAddress"],
            &["address", "fullAddress"],
            &["address"],
            &["location", "address"],
            &["propertyInfo", "address"],
        ],
    )
    .map(|a| collapse_whitespace(&a))
    .unwrap_or_default();

    let postcode = first_text(
        raw,
        &[
            &["postcode"],
            &["postalCode"],
            &["address", "postcode"],
            &["location", "postcode"],
        ],
    )
    .map(|p| p.to_uppercase())
    .or_else(|| extract_postcode(&address))
    .unwrap_or_default();

    let source_url = first_text(
        raw,
        &[
            &["propertyUrl"],
            &["url"],
            &["sourceUrl"],
            &["detailUrl"],
            &["link"],
        ],
    )
    .map(|u| absolutize(&u, defaults.base_url.as_deref()))
    .unwrap_or_default();

    let id = first_text(
        raw,
        &[&["id"], &["propertyId"], &["listingId"], &["identifier"]],
    )
    .or_else(|| {
        LISTING_ID_IN_URL
            .captures(&source_url)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
    })
    .unwrap_or_else(|| synthesized_id(raw));

    let (main_image_url, image_urls) = collect_images(raw, defaults.base_url.as_deref());

    Property {
        id,
        address,
        postcode,
        price: probe_price(raw),
        property_type: first_text(
            raw,
            &[
                &["propertyType"],
                &["propertySubType"],
                &["propertyTypeFullDescription"],
                &["type"],
                &["propertyInfo", "propertyType"],
            ],
        )
        .unwrap_or_else(|| defaults.property_type.clone()),
        bedrooms: first_count(
            raw,
            &[
                &["bedrooms"],
                &["beds"],
                &["numberOfBedrooms"],
                &["propertyInfo", "bedrooms"],
            ],
        )
        .unwrap_or(defaults.bedrooms),
        bathrooms: first_count(
            raw,
            &[
                &["bathrooms"],
                &["baths"],
                &["numberOfBathrooms"],
                &["propertyInfo", "bathrooms"],
            ],
        )
        .unwrap_or(defaults.bathrooms),
        description: first_text(
            raw,
            &[
                &["description"],
                &["summary"],
                &["propertyDescription"],
                &["text", "description"],
                &["propertyInfo", "description"],
            ],
        )
        .map(|d| strip_markup(&d))
        .unwrap_or_default(),
        features: collect_features(raw),
        main_image_url,
        image_urls,
        agent: probe_agent(raw, defaults.base_url.as_deref()),
        is_active: first_bool(raw, &[&["isActive"], &["active"]]).unwrap_or(true),
        source_url,
        floor_area: probe_floor_area(raw),
        is_synthetic: first_bool(raw, &[&["isSynthetic"]]).unwrap_or(false),
        latitude: first_f64(raw, &[&["location", "latitude"], &["latitude"], &["lat"]]),
        longitude: first_f64(
            raw,
            &[&["location", "longitude"], &["longitude"], &["lng"], &["lon"]],
        ),
        added_on: first_text(
            raw,
            &[
                &["addedOn"],
                &["dateAdded"],
                &["firstVisibleDate"],
                &["listingUpdate", "listingUpdateDate"],
            ],
        ),
    }
}

/// Coerces numeric, textual (`"£350,000"`) and object price shapes; 0 means unknown.
pub fn parse_price(value: &JsonValue) -> u64 {
    match value {
        JsonValue::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite() && *f >= 0.0).map(|f| f.round() as u64))
            .unwrap_or(0),
        JsonValue::String(s) => parse_price_text(s),
        JsonValue::Object(_) => PRICE_OBJECT_PATHS
            .iter()
            .filter_map(|path| json_at(value, path))
            .map(parse_price)
            .find(|p| *p > 0)
            .unwrap_or(0),
        JsonValue::Array(items) => items.first().map(parse_price).unwrap_or(0),
        _ => 0,
    }
}

fn parse_price_text(text: &str) -> u64 {
    let mut digits = String::new();
    let mut started = false;
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            started = true;
        } else if started && ch == ',' {
            continue;
        } else if started {
            break;
        }
    }
    digits.parse().unwrap_or(0)
}

/// Finds the first UK postcode in free text, formatted as `OUTWARD INWARD`.
pub fn extract_postcode(text: &str) -> Option<String> {
    UK_POSTCODE.captures(text).map(|c| {
        format!(
            "{} {}",
            c[1].to_uppercase(),
            c[2].to_uppercase()
        )
    })
}

fn probe_price(raw: &JsonValue) -> u64 {
    PRICE_PATHS
        .iter()
        .filter_map(|path| json_at(raw, path))
        .map(parse_price)
        .find(|p| *p > 0)
        .unwrap_or(0)
}

fn collect_images(raw: &JsonValue, base_url: Option<&str>) -> (Option<String>, Vec<String>) {
    let explicit_main = MAIN_IMAGE_PATHS
        .iter()
        .filter_map(|path| json_at(raw, path))
        .find_map(image_url_of);

    let mut seen = HashSet::new();
    let mut urls = Vec::new();
    for path in IMAGE_LIST_PATHS {
        let Some(JsonValue::Array(items)) = json_at(raw, path) else {
            continue;
        };
        for url in items.iter().filter_map(image_url_of) {
            let url = absolutize(&url, base_url);
            if seen.insert(url.clone()) {
                urls.push(url);
            }
        }
    }

    let main = match explicit_main.map(|m| absolutize(&m, base_url)) {
        Some(main) => {
            if !seen.contains(&main) {
                urls.insert(0, main.clone());
            }
            Some(main)
        }
        None => urls.first().cloned(),
    };
    (main, urls)
}

fn image_url_of(value: &JsonValue) -> Option<String> {
    let candidate = match value {
        JsonValue::String(s) => Some(s.as_str()),
        JsonValue::Object(map) => ["srcUrl", "url", "src", "href"]
            .iter()
            .find_map(|k| map.get(*k).and_then(JsonValue::as_str)),
        _ => None,
    }?;
    let trimmed = candidate.trim();
    // lazy-load placeholders are not real images
    if trimmed.is_empty() || trimmed.starts_with("data:") {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn collect_features(raw: &JsonValue) -> Vec<String> {
    for path in FEATURE_PATHS {
        let Some(JsonValue::Array(items)) = json_at(raw, path) else {
            continue;
        };
        let features = items
            .iter()
            .filter_map(|item| match item {
                JsonValue::String(s) => Some(s.clone()),
                JsonValue::Object(map) => ["text", "description", "name"]
                    .iter()
                    .find_map(|k| map.get(*k).and_then(JsonValue::as_str))
                    .map(ToString::to_string),
                _ => None,
            })
            .map(|s| collapse_whitespace(&s))
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();
        if !features.is_empty() {
            return features;
        }
    }
    Vec::new()
}

fn probe_agent(raw: &JsonValue, base_url: Option<&str>) -> Agent {
    let nested = AGENT_PATHS
        .iter()
        .find_map(|path| json_at(raw, path).filter(|v| v.is_object() || v.is_string()));

    let mut agent = Agent::default();
    match nested {
        Some(JsonValue::String(name)) if !name.trim().is_empty() => {
            agent.name = name.trim().to_string();
        }
        Some(obj @ JsonValue::Object(_)) => {
            if let Some(name) = first_text(
                obj,
                &[
                    &["name"],
                    &["branchDisplayName"],
                    &["displayName"],
                    &["branchName"],
                    &["brandTradingName"],
                ],
            ) {
                agent.name = name;
            }
            agent.phone = first_text(
                obj,
                &[
                    &["phone"],
                    &["telephone"],
                    &["contactTelephone"],
                    &["phoneNumber"],
                    &["contactInfo", "telephoneNumbers", "localNumber"],
                ],
            );
            agent.logo_url = first_text(
                obj,
                &[&["logoUrl"], &["logo"], &["branchLogo"], &["brandPlainLogoUrl"]],
            )
            .map(|u| absolutize(&u, base_url));
        }
        _ => {}
    }

    if agent.name == crate::UNKNOWN_AGENT {
        if let Some(name) = first_text(raw, &[&["agentName"], &["branchName"]]) {
            agent.name = name;
        }
    }
    if agent.phone.is_none() {
        agent.phone = first_text(raw, &[&["agentPhone"]]);
    }
    if agent.logo_url.is_none() {
        agent.logo_url = first_text(raw, &[&["agentLogo"]]).map(|u| absolutize(&u, base_url));
    }
    agent
}

fn probe_floor_area(raw: &JsonValue) -> Option<FloorArea> {
    FLOOR_AREA_PATHS
        .iter()
        .filter_map(|path| json_at(raw, path))
        .find_map(floor_area_of)
}

fn floor_area_of(value: &JsonValue) -> Option<FloorArea> {
    let (size, unit) = match value {
        JsonValue::Number(n) => (n.as_f64()?, None),
        JsonValue::String(s) => (first_decimal(s)?, Some(unit_from_text(s))),
        JsonValue::Object(map) => {
            let size = ["size", "value", "area", "minimumSize", "maximumSize"]
                .iter()
                .filter_map(|k| map.get(*k))
                .find_map(|v| match v {
                    JsonValue::Number(n) => n.as_f64(),
                    JsonValue::String(s) => first_decimal(s),
                    _ => None,
                })?;
            let unit = ["unit", "units", "displayUnit"]
                .iter()
                .find_map(|k| map.get(*k).and_then(JsonValue::as_str))
                .map(unit_from_text);
            (size, unit)
        }
        _ => return None,
    };
    if !size.is_finite() || size <= 0.0 {
        return None;
    }
    Some(FloorArea {
        size,
        unit: unit.unwrap_or_else(|| "sq ft".to_string()),
    })
}

/// Picks whichever unit is mentioned first, so "1,076 sq. ft. (100 sq. m.)" stays in feet.
fn unit_from_text(text: &str) -> String {
    let lower = text.to_ascii_lowercase();
    if lower.trim() == "m" || lower.trim() == "sqm" {
        return "sq m".to_string();
    }
    let first = |needles: &[&str]| needles.iter().filter_map(|n| lower.find(n)).min();
    let candidates = [
        (first(&["ft", "feet"]), "sq ft"),
        (first(&["sq m", "sq. m", "sqm", "m²", "metre", "meter"]), "sq m"),
        (first(&["acre"]), "acres"),
    ];
    candidates
        .iter()
        .filter_map(|(pos, unit)| pos.map(|p| (p, *unit)))
        .min_by_key(|(p, _)| *p)
        .map(|(_, unit)| unit.to_string())
        .unwrap_or_else(|| "sq ft".to_string())
}

fn first_decimal(text: &str) -> Option<f64> {
    let mut current = String::new();
    for ch in text.chars() {
        if ch.is_ascii_digit() || (ch == '.' && !current.is_empty() && !current.contains('.')) {
            current.push(ch);
        } else if ch == ',' && !current.is_empty() {
            continue;
        } else if !current.is_empty() {
            break;
        }
    }
    current.trim_end_matches('.').parse().ok()
}

fn synthesized_id(raw: &JsonValue) -> String {
    // serde_json maps are ordered, so equal payloads serialize identically
    let fingerprint = raw.to_string();
    format!(
        "gen-{}",
        Uuid::new_v5(&Uuid::NAMESPACE_OID, fingerprint.as_bytes()).simple()
    )
}

fn absolutize(url: &str, base_url: Option<&str>) -> String {
    let url = url.trim();
    match base_url {
        Some(base) if url.starts_with('/') && !url.starts_with("//") => {
            format!("{}{}", base.trim_end_matches('/'), url)
        }
        _ if url.starts_with("//") => format!("https:{url}"),
        _ => url.to_string(),
    }
}

fn strip_markup(text: &str) -> String {
    collapse_whitespace(&HTML_TAG.replace_all(text, " "))
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = match cur {
            JsonValue::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => cur.get(*segment)?,
        };
    }
    if cur.is_null() {
        None
    } else {
        Some(cur)
    }
}

fn first_text(value: &JsonValue, paths: &[&[&str]]) -> Option<String> {
    paths.iter().find_map(|path| match json_at(value, path)? {
        JsonValue::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn first_count(value: &JsonValue, paths: &[&[&str]]) -> Option<u32> {
    paths.iter().find_map(|path| match json_at(value, path)? {
        JsonValue::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
            .and_then(|v| u32::try_from(v).ok()),
        JsonValue::String(s) => first_decimal(s).map(|f| f as u32),
        _ => None,
    })
}

fn first_f64(value: &JsonValue, paths: &[&[&str]]) -> Option<f64> {
    paths.iter().find_map(|path| match json_at(value, path)? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

fn first_bool(value: &JsonValue, paths: &[&[&str]]) -> Option<bool> {
    paths.iter().find_map(|path| match json_at(value, path)? {
        JsonValue::Bool(b) => Some(*b),
        JsonValue::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Some(true),
            "false" | "no" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    })
}

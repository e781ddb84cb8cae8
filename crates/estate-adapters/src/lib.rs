//! External listing providers and the raw payloads they hand to the normalizer.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use estate_core::{RecordDefaults, SearchFilters};
use estate_storage::{FetchError, HttpFetcher};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

pub mod actor;
pub mod proxy_html;

pub use actor::{ActorConfig, ActorRunnerAdapter};
pub use proxy_html::{ProxyHtmlAdapter, ProxyHtmlConfig};

pub const CRATE_NAME: &str = "estate-adapters";

pub const DEFAULT_SITE_BASE_URL: &str = "https://www.rightmove.co.uk";

/// One logical request against a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchQuery {
    Search {
        filters: SearchFilters,
        page_size: usize,
    },
    Detail {
        id: String,
        url: Option<String>,
    },
}

impl FetchQuery {
    pub fn search(filters: SearchFilters, page_size: usize) -> Self {
        Self::Search { filters, page_size }
    }

    pub fn detail(id: impl Into<String>) -> Self {
        Self::Detail {
            id: id.into(),
            url: None,
        }
    }
}

/// Unnormalized records exactly as a provider returned them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawBatch {
    pub items: Vec<JsonValue>,
    /// Provider-reported total across all pages, when known.
    pub total_hint: Option<u64>,
}

impl RawBatch {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialCheck {
    pub success: bool,
    pub message: String,
}

impl CredentialCheck {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("credentials rejected: {0}")]
    Auth(String),
    #[error("provider unavailable: {0}")]
    Transient(String),
    #[error("no listings found for {0}")]
    NoResults(String),
    #[error("listing {0} no longer exists")]
    NotFound(String),
    #[error("run did not finish after {attempts} polls")]
    Timeout { attempts: u32 },
    #[error("run {run_id} ended with status {status}")]
    JobFailed { status: String, run_id: String },
    #[error("{0}")]
    Message(String),
}

impl AdapterError {
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }

    /// The listing is gone rather than temporarily unreachable.
    pub fn is_gone(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::NoResults(_))
    }
}

impl From<FetchError> for AdapterError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Unauthorized { status, url } => {
                AdapterError::Auth(format!("status {status} from {url}"))
            }
            FetchError::HttpStatus { status, url, .. } if status == 404 || status == 410 => {
                AdapterError::NotFound(url)
            }
            other => AdapterError::Transient(other.to_string()),
        }
    }
}

/// Common contract for listing providers.
#[async_trait]
pub trait FetchAdapter: Send + Sync {
    fn adapter_id(&self) -> &'static str;

    /// Fallbacks the normalizer applies to this provider's payloads.
    fn record_defaults(&self) -> RecordDefaults;

    async fn fetch_raw(
        &self,
        http: &HttpFetcher,
        query: &FetchQuery,
    ) -> Result<RawBatch, AdapterError>;

    /// Cheapest authenticated call the provider offers.
    async fn verify_credentials(&self, http: &HttpFetcher) -> CredentialCheck;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdapterKind {
    ProxyHtml,
    Actor,
}

impl std::str::FromStr for AdapterKind {
    type Err = AdapterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "proxy-html" | "proxy" | "scraperapi" | "html" => Ok(Self::ProxyHtml),
            "actor" | "apify" => Ok(Self::Actor),
            other => Err(AdapterError::Message(format!("unknown adapter `{other}`"))),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AdapterSettings {
    pub proxy: ProxyHtmlConfig,
    pub actor: ActorConfig,
}

pub fn adapter_for_kind(kind: AdapterKind, settings: &AdapterSettings) -> Box<dyn FetchAdapter> {
    match kind {
        AdapterKind::ProxyHtml => Box::new(ProxyHtmlAdapter::new(settings.proxy.clone())),
        AdapterKind::Actor => Box::new(ActorRunnerAdapter::new(settings.actor.clone())),
    }
}

pub fn adapter_for_source(
    source_id: &str,
    settings: &AdapterSettings,
) -> Option<Box<dyn FetchAdapter>> {
    source_id
        .parse::<AdapterKind>()
        .ok()
        .map(|kind| adapter_for_kind(kind, settings))
}

/// Site search URLs for one query, in the order they should be tried.
///
/// Providers index results by offset, so `page` is translated to `index`.
pub fn search_url_variants(base: &str, filters: &SearchFilters, page_size: usize) -> Vec<String> {
    let location = filters.location.trim();
    let offset = (filters.page() as usize - 1) * page_size.max(1);
    let slug = slugify(location);
    let outcode = location.to_uppercase().replace(char::is_whitespace, "");

    let mut variants = Vec::with_capacity(3);
    for (path, pairs) in [
        (
            "/property-for-sale/find.html".to_string(),
            vec![("searchLocation", location.to_string())],
        ),
        (format!("/property-for-sale/{slug}.html"), Vec::new()),
        (
            "/property-for-sale/find.html".to_string(),
            vec![("locationIdentifier", format!("OUTCODE^{outcode}"))],
        ),
    ] {
        let Ok(mut url) = url::Url::parse(base).and_then(|b| b.join(&path)) else {
            continue;
        };
        {
            let mut query = url.query_pairs_mut();
            for (k, v) in &pairs {
                query.append_pair(k, v);
            }
            append_filter_pairs(&mut query, filters);
            if offset > 0 {
                query.append_pair("index", &offset.to_string());
            }
        }
        let rendered = url.to_string();
        variants.push(rendered.trim_end_matches('?').to_string());
    }
    variants
}

fn append_filter_pairs(
    query: &mut url::form_urlencoded::Serializer<'_, url::UrlQuery<'_>>,
    filters: &SearchFilters,
) {
    if let Some(v) = filters.min_price {
        query.append_pair("minPrice", &v.to_string());
    }
    if let Some(v) = filters.max_price {
        query.append_pair("maxPrice", &v.to_string());
    }
    if let Some(v) = filters.min_beds {
        query.append_pair("minBedrooms", &v.to_string());
    }
    if let Some(v) = filters.max_beds {
        query.append_pair("maxBedrooms", &v.to_string());
    }
    if let Some(kind) = filters.property_type.as_deref().filter(|t| !t.trim().is_empty()) {
        query.append_pair("propertyTypes", &kind.trim().to_lowercase());
    }
}

/// Detail page URLs for one listing id; an explicit URL always goes first.
pub fn detail_url_variants(base: &str, id: &str, url: Option<&str>) -> Vec<String> {
    let base = base.trim_end_matches('/');
    let id = id.trim();
    let mut variants = Vec::with_capacity(3);
    if let Some(explicit) = url.filter(|u| !u.trim().is_empty()) {
        variants.push(explicit.trim().to_string());
    }
    for candidate in [
        format!("{base}/properties/{id}"),
        format!("{base}/properties/{id}#/"),
        format!("{base}/property-for-sale/property-{id}.html"),
    ] {
        if !variants.contains(&candidate) {
            variants.push(candidate);
        }
    }
    variants
}

pub fn slugify(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last_dash = true;
    for ch in input.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

/// Reads the first candidate file that parses as a listing dataset.
///
/// Accepts a bare JSON array or an object with a `properties` array.
pub async fn load_local_dataset(candidates: &[PathBuf]) -> Option<(PathBuf, Vec<JsonValue>)> {
    for path in candidates {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            continue;
        }
        match read_dataset_file(path).await {
            Ok(items) => {
                debug!(path = %path.display(), count = items.len(), "loaded local dataset");
                return Some((path.clone(), items));
            }
            Err(err) => warn!(path = %path.display(), error = %err, "skipping unreadable dataset"),
        }
    }
    None
}

async fn read_dataset_file(path: &Path) -> Result<Vec<JsonValue>> {
    let data = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let value: JsonValue =
        serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
    match value {
        JsonValue::Array(items) => Ok(items),
        JsonValue::Object(mut map) => match map.remove("properties") {
            Some(JsonValue::Array(items)) => Ok(items),
            _ => anyhow::bail!("{} has no `properties` array", path.display()),
        },
        _ => anyhow::bail!("{} is not a listing dataset", path.display()),
    }
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn parse_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Message(e.to_string()))
}

fn select_first_text(
    scope: ElementRef<'_>,
    selectors: &[&str],
) -> Result<Option<String>, AdapterError> {
    for selector in selectors {
        let sel = parse_selector(selector)?;
        if let Some(text) = scope
            .select(&sel)
            .find_map(|n| text_or_none(n.text().collect::<String>()))
        {
            return Ok(Some(text));
        }
    }
    Ok(None)
}

fn select_all_texts(scope: ElementRef<'_>, selector: &str) -> Result<Vec<String>, AdapterError> {
    let sel = parse_selector(selector)?;
    Ok(scope
        .select(&sel)
        .filter_map(|n| text_or_none(n.text().collect::<String>()))
        .collect())
}

fn select_first_attr(
    scope: ElementRef<'_>,
    selectors: &[&str],
    attr: &str,
) -> Result<Option<String>, AdapterError> {
    for selector in selectors {
        let sel = parse_selector(selector)?;
        if let Some(value) = scope
            .select(&sel)
            .find_map(|n| n.value().attr(attr).and_then(|s| text_or_none(s.to_string())))
        {
            return Ok(Some(value));
        }
    }
    Ok(None)
}

fn select_all_attrs(
    scope: ElementRef<'_>,
    selector: &str,
    attr: &str,
) -> Result<Vec<String>, AdapterError> {
    let sel = parse_selector(selector)?;
    Ok(scope
        .select(&sel)
        .filter_map(|n| n.value().attr(attr).and_then(|s| text_or_none(s.to_string())))
        .collect())
}

/// First whole number in `text`, ignoring thousands separators.
fn first_number(text: &str) -> Option<u64> {
    let mut digits = String::new();
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
        } else if ch == ',' && !digits.is_empty() {
            continue;
        } else if !digits.is_empty() {
            break;
        }
    }
    digits.parse().ok()
}

fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = match segment.parse::<usize>() {
            Ok(idx) => cur.get(idx)?,
            Err(_) => cur.get(*segment)?,
        };
    }
    Some(cur)
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    json_at(value, path)?.as_str()
}

fn json_array<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a Vec<JsonValue>> {
    json_at(value, path)?.as_array()
}

fn document_root(document: &Html) -> ElementRef<'_> {
    document.root_element()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn search_urls_offer_three_variants_with_offset() {
        let filters = SearchFilters::new("Kings Cross")
            .with_page(2)
            .with_price_range(Some(100_000), None);
        let urls = search_url_variants(DEFAULT_SITE_BASE_URL, &filters, 24);
        assert_eq!(urls.len(), 3);
        assert!(urls[0].contains("searchLocation=Kings+Cross"));
        assert!(urls[0].contains("minPrice=100000"));
        assert!(urls[0].contains("index=24"));
        assert!(urls[1].contains("/property-for-sale/kings-cross.html"));
        assert!(urls[2].contains("locationIdentifier=OUTCODE%5EKINGSCROSS"));
    }

    #[test]
    fn first_page_has_no_index() {
        let urls = search_url_variants(DEFAULT_SITE_BASE_URL, &SearchFilters::new("Leeds"), 24);
        assert!(urls.iter().all(|u| !u.contains("index=")));
    }

    #[test]
    fn detail_urls_prefer_explicit_link() {
        let urls = detail_url_variants(
            "https://example.test/",
            "123",
            Some("https://example.test/properties/123?channel=RES_BUY"),
        );
        assert_eq!(urls[0], "https://example.test/properties/123?channel=RES_BUY");
        assert!(urls.contains(&"https://example.test/properties/123".to_string()));
        assert_eq!(urls.len(), 4);
    }

    #[test]
    fn auth_statuses_map_to_auth_errors() {
        let err = AdapterError::from(FetchError::Unauthorized {
            status: 403,
            url: "https://api.example.test/".into(),
        });
        assert!(err.is_auth());

        let gone = AdapterError::from(FetchError::HttpStatus {
            status: 410,
            url: "https://example.test/properties/1".into(),
            snippet: String::new(),
        });
        assert!(gone.is_gone());
    }

    #[test]
    fn adapter_kinds_parse_aliases() {
        assert_eq!("apify".parse::<AdapterKind>().unwrap(), AdapterKind::Actor);
        assert_eq!("proxy-html".parse::<AdapterKind>().unwrap(), AdapterKind::ProxyHtml);
        assert!("carrier-pigeon".parse::<AdapterKind>().is_err());
        let settings = AdapterSettings::default();
        assert_eq!(
            adapter_for_source("actor", &settings).unwrap().adapter_id(),
            "actor"
        );
    }

    #[tokio::test]
    async fn local_dataset_skips_missing_and_unwraps_properties() {
        let dir = tempfile::tempdir().expect("tempdir");
        let broken = dir.path().join("broken.json");
        std::fs::write(&broken, "{not json").expect("write broken");
        let good = dir.path().join("listings.json");
        let mut file = std::fs::File::create(&good).expect("create");
        write!(file, r#"{{"properties": [{{"id": "1"}}, {{"id": "2"}}]}}"#).expect("write");

        let candidates = vec![dir.path().join("missing.json"), broken, good.clone()];
        let (path, items) = load_local_dataset(&candidates).await.expect("dataset found");
        assert_eq!(path, good);
        assert_eq!(items.len(), 2);

        assert!(load_local_dataset(&[dir.path().join("nope.json")]).await.is_none());
    }

    #[test]
    fn numbers_ignore_separators() {
        assert_eq!(first_number("1,234 results"), Some(1234));
        assert_eq!(first_number("3 bedroom semi-detached house"), Some(3));
        assert_eq!(first_number("no digits"), None);
    }
}

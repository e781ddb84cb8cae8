//! Listing pages fetched through a JS-rendering scraping proxy and parsed from HTML.

use async_trait::async_trait;
use estate_core::RecordDefaults;
use estate_storage::{HttpFetcher, HttpRequest};
use scraper::{ElementRef, Html};
use serde_json::{json, Map, Value as JsonValue};
use tracing::{debug, info, warn};

use crate::{
    detail_url_variants, document_root, first_number, json_array, json_at, parse_selector,
    search_url_variants, select_all_attrs, select_all_texts, select_first_attr, select_first_text,
    AdapterError, CredentialCheck, FetchAdapter, FetchQuery, RawBatch, DEFAULT_SITE_BASE_URL,
};

pub const DEFAULT_PROXY_URL: &str = "https://api.scraperapi.com/";

const PAGE_MODEL_MARKERS: &[&str] = &[
    "window.jsonModel",
    "window.PAGE_MODEL",
    "window.__PRELOADED_STATE__",
];

const MODEL_LIST_PATHS: &[&[&str]] = &[
    &["properties"],
    &["searchResults", "properties"],
    &["results"],
];
const MODEL_TOTAL_PATHS: &[&[&str]] = &[
    &["resultCount"],
    &["pagination", "total"],
    &["totalResults"],
];

const CARD_SELECTORS: &[&str] = &[
    "[data-test=\"propertyCard\"]",
    "div.l-searchResult",
    "div.propertyCard",
    "article.property-card",
];
const CARD_ADDRESS: &[&str] = &[
    "address.propertyCard-address",
    "[data-test=\"address-label\"]",
    "address",
];
const CARD_PRICE: &[&str] = &[
    ".propertyCard-priceValue",
    "[data-test=\"property-price\"]",
    ".propertyCard-price",
    ".price",
];
const CARD_LINK: &[&str] = &[
    "a.propertyCard-link",
    "a[data-test=\"property-details\"]",
    "a[href*=\"/properties/\"]",
];
const CARD_TYPE: &[&str] = &[
    ".property-information span.text",
    "[data-test=\"property-type\"]",
    ".propertyCard-details h2",
    "h2.propertyCard-title",
];
const CARD_BEDROOMS: &[&str] = &[
    ".property-information .bed-icon + span",
    "[data-test=\"property-bedrooms\"]",
    ".propertyCard-details h2",
    "h2.propertyCard-title",
];
const CARD_DESCRIPTION: &[&str] = &[
    "[data-test=\"property-description\"]",
    ".propertyCard-description",
    "p",
];
const CARD_AGENT: &[&str] = &[".propertyCard-branchLogo-image", "[data-test=\"agent-logo\"] img"];

const DETAIL_ADDRESS: &[&str] = &["h1[itemprop=\"streetAddress\"]", "[data-test=\"address-label\"]"];
const DETAIL_PRICE: &[&str] = &[
    "[data-test=\"property-price\"]",
    "article p span",
    ".property-header-price",
];
const DETAIL_DESCRIPTION: &[&str] = &[
    "[data-test=\"property-description\"]",
    "#description",
    ".description",
];
const DETAIL_AGENT: &[&str] = &["[data-test=\"agent-name\"]", ".agent-details h3", ".agent-name"];

#[derive(Debug, Clone)]
pub struct ProxyHtmlConfig {
    pub api_key: Option<String>,
    pub proxy_url: String,
    pub site_base_url: String,
    pub render: bool,
}

impl Default for ProxyHtmlConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            proxy_url: DEFAULT_PROXY_URL.to_string(),
            site_base_url: DEFAULT_SITE_BASE_URL.to_string(),
            render: true,
        }
    }
}

pub struct ProxyHtmlAdapter {
    config: ProxyHtmlConfig,
}

impl ProxyHtmlAdapter {
    pub fn new(config: ProxyHtmlConfig) -> Self {
        Self { config }
    }

    fn api_key(&self) -> Result<&str, AdapterError> {
        self.config
            .api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| {
                AdapterError::Auth("scraping proxy API key is not configured".to_string())
            })
    }

    fn proxied(&self, api_key: &str, target: &str) -> Result<String, AdapterError> {
        let render = if self.config.render { "true" } else { "false" };
        url::Url::parse_with_params(
            &self.config.proxy_url,
            &[("api_key", api_key), ("url", target), ("render", render)],
        )
        .map(|u| u.to_string())
        .map_err(|e| AdapterError::Message(format!("invalid proxy url: {e}")))
    }

    async fn fetch_html(
        &self,
        http: &HttpFetcher,
        api_key: &str,
        target: &str,
    ) -> Result<String, AdapterError> {
        let proxied = self.proxied(api_key, target)?;
        let response = http.fetch_bytes(self.adapter_id(), &proxied).await?;
        Ok(response.text())
    }
}

#[async_trait]
impl FetchAdapter for ProxyHtmlAdapter {
    fn adapter_id(&self) -> &'static str {
        "proxy-html"
    }

    fn record_defaults(&self) -> RecordDefaults {
        RecordDefaults {
            bedrooms: 1,
            base_url: Some(self.config.site_base_url.clone()),
            ..RecordDefaults::default()
        }
    }

    async fn fetch_raw(
        &self,
        http: &HttpFetcher,
        query: &FetchQuery,
    ) -> Result<RawBatch, AdapterError> {
        let api_key = self.api_key()?;
        let (targets, label, is_detail) = match query {
            FetchQuery::Search { filters, page_size } => (
                search_url_variants(&self.config.site_base_url, filters, *page_size),
                filters.location.clone(),
                false,
            ),
            FetchQuery::Detail { id, url } => (
                detail_url_variants(&self.config.site_base_url, id, url.as_deref()),
                id.clone(),
                true,
            ),
        };

        let mut last_error: Option<AdapterError> = None;
        let mut saw_gone = false;
        for (attempt, target) in targets.iter().enumerate() {
            let html = match self.fetch_html(http, api_key, target).await {
                Ok(html) => html,
                Err(err) if err.is_auth() => return Err(err),
                Err(err) => {
                    warn!(attempt, error = %err, "proxy fetch variant failed");
                    saw_gone |= matches!(err, AdapterError::NotFound(_));
                    last_error = Some(err);
                    continue;
                }
            };

            let batch = if is_detail {
                parse_detail_page(&html)?
            } else {
                parse_search_page(&html)?
            };
            if !batch.is_empty() {
                info!(attempt, count = batch.items.len(), "proxy fetch produced listings");
                return Ok(batch);
            }
            debug!(attempt, "variant returned zero listings");
        }

        if is_detail && (saw_gone || last_error.is_none()) {
            return Err(AdapterError::NotFound(label));
        }
        match last_error {
            Some(err) => Err(AdapterError::Transient(err.to_string())),
            None => Err(AdapterError::NoResults(label)),
        }
    }

    async fn verify_credentials(&self, http: &HttpFetcher) -> CredentialCheck {
        let api_key = match self.api_key() {
            Ok(key) => key,
            Err(err) => return CredentialCheck::failed(err.to_string()),
        };
        let account = match url::Url::parse(&self.config.proxy_url)
            .and_then(|base| base.join("account"))
        {
            Ok(mut url) => {
                url.query_pairs_mut().append_pair("api_key", api_key);
                url.to_string()
            }
            Err(err) => return CredentialCheck::failed(format!("invalid proxy url: {err}")),
        };
        match http.fetch_json(self.adapter_id(), &HttpRequest::get(account)).await {
            Ok(body) => {
                let used = body.get("requestCount").and_then(JsonValue::as_u64).unwrap_or(0);
                let limit = body.get("requestLimit").and_then(JsonValue::as_u64);
                match limit {
                    Some(limit) => CredentialCheck::ok(format!(
                        "proxy key valid ({used}/{limit} requests used)"
                    )),
                    None => CredentialCheck::ok("proxy key valid"),
                }
            }
            Err(err) => CredentialCheck::failed(AdapterError::from(err).to_string()),
        }
    }
}

/// Extracts the JSON object assigned to a known page-model variable.
pub fn extract_page_model(html: &str) -> Option<JsonValue> {
    for marker in PAGE_MODEL_MARKERS {
        let Some(pos) = html.find(marker) else {
            continue;
        };
        let rest = &html[pos + marker.len()..];
        let Some(start) = rest.find('{') else {
            continue;
        };
        let mut stream =
            serde_json::Deserializer::from_str(&rest[start..]).into_iter::<JsonValue>();
        if let Some(Ok(value)) = stream.next() {
            return Some(value);
        }
    }
    None
}

pub fn parse_search_page(html: &str) -> Result<RawBatch, AdapterError> {
    if let Some(model) = extract_page_model(html) {
        let items = MODEL_LIST_PATHS
            .iter()
            .find_map(|path| json_array(&model, path))
            .cloned()
            .unwrap_or_default();
        if !items.is_empty() {
            let total_hint = MODEL_TOTAL_PATHS
                .iter()
                .find_map(|path| json_at(&model, path))
                .and_then(|v| match v {
                    JsonValue::Number(n) => n.as_u64(),
                    JsonValue::String(s) => first_number(s),
                    _ => None,
                });
            return Ok(RawBatch { items, total_hint });
        }
    }

    let document = Html::parse_document(html);
    let root = document_root(&document);
    for card_selector in CARD_SELECTORS {
        let sel = parse_selector(card_selector)?;
        let mut items = Vec::new();
        for card in root.select(&sel) {
            if let Some(item) = card_to_raw(card)? {
                items.push(item);
            }
        }
        if !items.is_empty() {
            let total_hint = select_first_text(
                root,
                &[".searchHeader-resultCount", "[data-test=\"result-count\"]"],
            )?
            .and_then(|t| first_number(&t));
            return Ok(RawBatch { items, total_hint });
        }
    }
    Ok(RawBatch::default())
}

fn card_to_raw(card: ElementRef<'_>) -> Result<Option<JsonValue>, AdapterError> {
    let address = select_first_text(card, CARD_ADDRESS)?;
    let link = select_first_attr(card, CARD_LINK, "href")?;
    if address.is_none() && link.is_none() {
        return Ok(None);
    }

    let mut raw = Map::new();
    if let Some(id) = card.value().attr("id").and_then(|id| id.strip_prefix("property-")) {
        raw.insert("id".into(), json!(id));
    }
    insert_opt(&mut raw, "address", address);
    insert_opt(&mut raw, "propertyUrl", link);
    insert_opt(&mut raw, "price", select_first_text(card, CARD_PRICE)?);
    insert_opt(&mut raw, "propertyType", select_first_text(card, CARD_TYPE)?);
    insert_opt(&mut raw, "description", select_first_text(card, CARD_DESCRIPTION)?);
    if let Some(beds) =
        select_first_text(card, CARD_BEDROOMS)?.and_then(|t| bedrooms_from_text(&t))
    {
        raw.insert("bedrooms".into(), json!(beds));
    }
    let images = select_all_attrs(card, "img[src]", "src")?
        .into_iter()
        .filter(|src| !src.contains("branchLogo") && !src.starts_with("data:"))
        .collect::<Vec<_>>();
    if !images.is_empty() {
        raw.insert("images".into(), json!(images));
    }
    if let Some(agent) = select_first_attr(card, CARD_AGENT, "alt")? {
        let logo = select_first_attr(card, CARD_AGENT, "src")?;
        raw.insert("agent".into(), json!({ "name": agent, "logoUrl": logo }));
    }
    Ok(Some(JsonValue::Object(raw)))
}

pub fn parse_detail_page(html: &str) -> Result<RawBatch, AdapterError> {
    if let Some(model) = extract_page_model(html) {
        let detail = json_at(&model, &["propertyData"])
            .or_else(|| json_at(&model, &["property"]))
            .filter(|v| v.is_object());
        if let Some(detail) = detail {
            return Ok(RawBatch {
                items: vec![detail.clone()],
                total_hint: Some(1),
            });
        }
    }

    let document = Html::parse_document(html);
    let root = document_root(&document);
    let Some(address) = select_first_text(root, DETAIL_ADDRESS)? else {
        return Ok(RawBatch::default());
    };
    // Withdrawn listings keep the address banner but drop price and canonical link.
    let price = select_first_text(root, DETAIL_PRICE)?;
    let canonical = select_first_attr(root, &["link[rel=\"canonical\"]"], "href")?;
    if price.is_none() && canonical.is_none() {
        return Ok(RawBatch::default());
    }

    let mut raw = Map::new();
    raw.insert("address".into(), json!(address));
    insert_opt(&mut raw, "price", price);
    insert_opt(&mut raw, "description", select_first_text(root, DETAIL_DESCRIPTION)?);
    insert_opt(&mut raw, "propertyUrl", canonical);
    let features = select_all_texts(root, "ul.key-features li, [data-test=\"key-features\"] li")?;
    if !features.is_empty() {
        raw.insert("features".into(), json!(features));
    }
    let images = select_all_attrs(root, "meta[property=\"og:image\"]", "content")?;
    if !images.is_empty() {
        raw.insert("images".into(), json!(images));
    }
    if let Some(agent) = select_first_text(root, DETAIL_AGENT)? {
        raw.insert("agent".into(), json!({ "name": agent }));
    }
    if let Some(summary) =
        select_first_text(root, &["[data-test=\"infoReel\"]", ".property-summary"])?
    {
        if let Some(beds) = bedrooms_from_text(&summary) {
            raw.insert("bedrooms".into(), json!(beds));
        }
    }

    Ok(RawBatch {
        items: vec![JsonValue::Object(raw)],
        total_hint: Some(1),
    })
}

fn insert_opt(raw: &mut Map<String, JsonValue>, key: &str, value: Option<String>) {
    if let Some(value) = value {
        raw.insert(key.to_string(), JsonValue::String(value));
    }
}

fn bedrooms_from_text(text: &str) -> Option<u64> {
    let lower = text.to_lowercase();
    if lower.contains("studio") {
        return Some(0);
    }
    let tokens = lower.split_whitespace().collect::<Vec<_>>();
    match tokens.iter().position(|t| t.contains("bed")) {
        Some(idx) => first_number(tokens[idx])
            .or_else(|| idx.checked_sub(1).and_then(|prev| first_number(tokens[prev]))),
        None if tokens.len() == 1 => first_number(tokens[0]),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CARD_PAGE: &str = r#"
        <html><body>
          <span class="searchHeader-resultCount">1,203</span>
          <div class="l-searchResult" id="property-148512345">
            <a class="propertyCard-link" href="/properties/148512345#/?channel=RES_BUY"></a>
            <img src="https://media.example.test/148512345/img_00.jpeg">
            <img src="data:image/gif;base64,R0lGOD">
            <address class="propertyCard-address">12 Park Row, Leeds LS1 5HD</address>
            <div class="propertyCard-priceValue">£250,000</div>
            <h2 class="propertyCard-title">3 bedroom terraced house for sale</h2>
            <img class="propertyCard-branchLogo-image" alt="Acme Lettings" src="https://media.example.test/branchLogo.png">
          </div>
          <div class="l-searchResult">
            <a class="propertyCard-link" href="/properties/148599999"></a>
            <address class="propertyCard-address">Flat 4, Wharf Street, Leeds</address>
          </div>
        </body></html>"#;

    #[test]
    fn page_model_wins_over_cards() {
        let html = r#"<script>window.jsonModel = {"properties":[{"id":1},{"id":2}],"resultCount":"1,234"};
            var other = 1;</script><div class="l-searchResult"><address>ignored</address></div>"#;
        let batch = parse_search_page(html).unwrap();
        assert_eq!(batch.items.len(), 2);
        assert_eq!(batch.total_hint, Some(1234));
    }

    #[test]
    fn cards_are_scraped_when_no_page_model() {
        let batch = parse_search_page(CARD_PAGE).unwrap();
        assert_eq!(batch.items.len(), 2);
        assert_eq!(batch.total_hint, Some(1203));

        let first = &batch.items[0];
        assert_eq!(first["id"], "148512345");
        assert_eq!(first["price"], "£250,000");
        assert_eq!(first["bedrooms"], 3);
        assert_eq!(first["images"].as_array().unwrap().len(), 1);
        assert_eq!(first["agent"]["name"], "Acme Lettings");

        let adapter = ProxyHtmlAdapter::new(ProxyHtmlConfig::default());
        let record = estate_core::normalize_with(first, &adapter.record_defaults());
        assert_eq!(record.price, 250_000);
        assert_eq!(record.postcode, "LS1 5HD");
        assert_eq!(
            record.source_url,
            "https://www.rightmove.co.uk/properties/148512345#/?channel=RES_BUY"
        );

        let sparse = estate_core::normalize_with(&batch.items[1], &adapter.record_defaults());
        assert_eq!(sparse.bedrooms, 1);
        assert_eq!(sparse.id, "148599999");
    }

    #[test]
    fn empty_page_yields_empty_batch() {
        assert!(parse_search_page("<html><body><p>No results</p></body></html>")
            .unwrap()
            .is_empty());
    }

    #[test]
    fn detail_page_falls_back_to_selectors() {
        let html = r#"<html><head><link rel="canonical" href="https://example.test/properties/77">
            <meta property="og:image" content="https://media.example.test/77/a.jpg"></head>
            <body><h1 itemprop="streetAddress">7 Mill Lane, York YO1 7HH</h1>
            <div data-test="property-price">£410,000</div>
            <div data-test="infoReel">Detached 4 bedrooms 2 bathrooms</div>
            <ul class="key-features"><li>Garden</li><li>Garage</li></ul></body></html>"#;
        let batch = parse_detail_page(html).unwrap();
        assert_eq!(batch.items.len(), 1);
        let item = &batch.items[0];
        assert_eq!(item["address"], "7 Mill Lane, York YO1 7HH");
        assert_eq!(item["bedrooms"], 4);
        assert_eq!(item["features"], serde_json::json!(["Garden", "Garage"]));
        assert_eq!(item["propertyUrl"], "https://example.test/properties/77");
    }

    #[test]
    fn removed_listing_page_yields_no_record() {
        let notice = r#"<html><body><h1>This property has been removed by the agent.</h1>
            <p>Similar homes nearby</p></body></html>"#;
        assert!(parse_detail_page(notice).unwrap().items.is_empty());

        let banner_only = r#"<html><body>
            <h1 itemprop="streetAddress">7 Mill Lane, York YO1 7HH</h1>
            <div class="banner">No longer on the market</div></body></html>"#;
        assert!(parse_detail_page(banner_only).unwrap().items.is_empty());
    }

    #[test]
    fn detail_page_model_is_used_directly() {
        let html = r#"<script>window.PAGE_MODEL = {"propertyData":{"id":"55","bedrooms":2}}</script>"#;
        let batch = parse_detail_page(html).unwrap();
        assert_eq!(batch.items[0]["id"], "55");
    }

    #[test]
    fn bedroom_text_variants() {
        assert_eq!(bedrooms_from_text("3 bedroom terraced house"), Some(3));
        assert_eq!(bedrooms_from_text("Studio flat"), Some(0));
        assert_eq!(bedrooms_from_text("2"), Some(2));
        assert_eq!(bedrooms_from_text("Land for sale"), None);
    }

    #[test]
    fn proxied_url_carries_key_and_target() {
        let adapter = ProxyHtmlAdapter::new(ProxyHtmlConfig {
            api_key: Some("k".into()),
            ..ProxyHtmlConfig::default()
        });
        let url = adapter.proxied("k", "https://example.test/a?b=c").unwrap();
        assert!(url.starts_with(
            "https://api.scraperapi.com/?api_key=k&url=https%3A%2F%2Fexample.test%2Fa%3Fb%3Dc"
        ));
        assert!(url.ends_with("render=true"));
    }
}

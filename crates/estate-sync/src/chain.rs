//! Ordered fetch strategies: cache, local dataset, live provider, synthetic fallback.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use estate_adapters::{load_local_dataset, AdapterError, FetchAdapter, FetchQuery};
use estate_core::{
    detail_cache_key, normalize_with, IngestError, Property, SearchFilters, SearchPage,
};
use estate_storage::{CacheStore, HttpFetcher};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::synthetic;
use crate::IngestConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    CacheHit,
    LocalDataset,
    LiveFetch,
    Synthetic,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CacheHit => "cache",
            Self::LocalDataset => "local-dataset",
            Self::LiveFetch => "live",
            Self::Synthetic => "synthetic",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolved<T> {
    pub value: T,
    pub strategy: Strategy,
}

impl<T> Resolved<T> {
    fn new(value: T, strategy: Strategy) -> Self {
        Self { value, strategy }
    }
}

pub struct FetchChain {
    config: Arc<IngestConfig>,
    cache: Arc<dyn CacheStore>,
    adapter: Arc<dyn FetchAdapter>,
    http: Arc<HttpFetcher>,
    cache_ready: AtomicBool,
    local: OnceCell<Option<Vec<Property>>>,
}

impl FetchChain {
    pub fn new(
        config: Arc<IngestConfig>,
        cache: Arc<dyn CacheStore>,
        adapter: Arc<dyn FetchAdapter>,
        http: Arc<HttpFetcher>,
    ) -> Self {
        Self {
            config,
            cache,
            adapter,
            http,
            cache_ready: AtomicBool::new(false),
            local: OnceCell::new(),
        }
    }

    pub fn adapter(&self) -> &dyn FetchAdapter {
        self.adapter.as_ref()
    }

    pub fn http(&self) -> &HttpFetcher {
        &self.http
    }

    pub fn cache(&self) -> &Arc<dyn CacheStore> {
        &self.cache
    }

    pub async fn prepare_cache(&self) -> bool {
        let ready = self.cache.ensure_ready().await;
        self.cache_ready.store(ready, Ordering::SeqCst);
        ready
    }

    pub fn cache_ready(&self) -> bool {
        self.cache_ready.load(Ordering::SeqCst)
    }

    pub async fn search(
        &self,
        filters: &SearchFilters,
    ) -> Result<Resolved<SearchPage>, IngestError> {
        filters.validate()?;
        let key = filters.cache_key();
        let page_size = self.config.page_size;

        if let Some(page) = self.cached::<SearchPage>(&key).await {
            debug!(%key, "search served from cache");
            return Ok(Resolved::new(page, Strategy::CacheHit));
        }

        if let Some(all) = self.local_records().await {
            let matching = all
                .iter()
                .filter(|p| filters.matches(p))
                .cloned()
                .collect::<Vec<_>>();
            if !matching.is_empty() {
                info!(count = matching.len(), "search served from local dataset");
                return Ok(Resolved::new(
                    SearchPage::paginate(matching, filters.page(), page_size),
                    Strategy::LocalDataset,
                ));
            }
        }

        if !self.config.mock_mode {
            let query = FetchQuery::search(filters.clone(), page_size);
            match self.live(&query).await {
                Ok((mut properties, total_hint)) if !properties.is_empty() => {
                    properties.truncate(page_size);
                    let offset = (filters.page() as u64 - 1) * page_size as u64;
                    let total = total_hint
                        .unwrap_or(0)
                        .max(offset + properties.len() as u64);
                    let page = SearchPage::from_page(properties, total, filters.page(), page_size);
                    self.store(&key, &page).await;
                    info!(count = page.properties.len(), total, "search served live");
                    return Ok(Resolved::new(page, Strategy::LiveFetch));
                }
                Ok(_) => debug!("live fetch returned no listings"),
                Err(err) if err.is_auth() => return Err(IngestError::AdapterAuth(err.to_string())),
                Err(err) => warn!(
                    error = %err,
                    adapter = self.adapter.adapter_id(),
                    "live fetch failed; falling back"
                ),
            }
        }

        warn!(location = %filters.location, "serving synthetic listings");
        Ok(Resolved::new(
            synthetic::search_page(filters, page_size),
            Strategy::Synthetic,
        ))
    }

    pub async fn details(&self, id: &str) -> Result<Resolved<Option<Property>>, IngestError> {
        let id = id.trim();
        if id.is_empty() {
            return Err(IngestError::InvalidQuery("a property id is required".to_string()));
        }
        let key = detail_cache_key(id);

        if let Some(property) = self.cached::<Property>(&key).await {
            return Ok(Resolved::new(Some(property), Strategy::CacheHit));
        }

        if synthetic::is_synthetic_id(id) {
            return Ok(Resolved::new(synthetic::property_for_id(id), Strategy::Synthetic));
        }

        if let Some(found) = self
            .local_records()
            .await
            .and_then(|all| all.iter().find(|p| p.id == id).cloned())
        {
            return Ok(Resolved::new(Some(found), Strategy::LocalDataset));
        }

        if self.config.mock_mode {
            return Ok(Resolved::new(None, Strategy::Synthetic));
        }

        match self.live_detail(id, None).await {
            Ok(Some(property)) => {
                self.store(&key, &property).await;
                Ok(Resolved::new(Some(property), Strategy::LiveFetch))
            }
            Ok(None) => Ok(Resolved::new(None, Strategy::LiveFetch)),
            Err(err) if err.is_auth() => Err(IngestError::AdapterAuth(err.to_string())),
            Err(err) => {
                warn!(id, error = %err, "detail fetch failed");
                Ok(Resolved::new(None, Strategy::LiveFetch))
            }
        }
    }

    /// Re-fetches one listing from the provider only; `Ok(None)` means it is gone.
    pub async fn live_detail(
        &self,
        id: &str,
        url: Option<&str>,
    ) -> Result<Option<Property>, AdapterError> {
        let query = FetchQuery::Detail {
            id: id.to_string(),
            url: url.filter(|u| !u.is_empty()).map(ToString::to_string),
        };
        match self.live(&query).await {
            Ok((properties, _)) => Ok(properties.into_iter().next().map(|mut p| {
                if p.id.starts_with("gen-") {
                    p.id = id.to_string();
                }
                p
            })),
            Err(err) if err.is_gone() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Normalized provider records plus the provider's total, deduplicated by id.
    async fn live(
        &self,
        query: &FetchQuery,
    ) -> Result<(Vec<Property>, Option<u64>), AdapterError> {
        let batch = self.adapter.fetch_raw(&self.http, query).await?;
        let defaults = self.adapter.record_defaults();
        let mut seen = HashSet::new();
        let properties = batch
            .items
            .iter()
            .map(|raw| normalize_with(raw, &defaults))
            .filter(|p| seen.insert(p.id.clone()))
            .collect::<Vec<_>>();
        Ok((properties, batch.total_hint))
    }

    /// Local dataset records, read and normalized on first use.
    async fn local_records(&self) -> Option<&[Property]> {
        if self.config.environment.is_production() || self.config.dataset_paths.is_empty() {
            return None;
        }
        self.local
            .get_or_init(|| async {
                let (path, items) = load_local_dataset(&self.config.dataset_paths).await?;
                let defaults = self.adapter.record_defaults();
                debug!(path = %path.display(), count = items.len(), "using local dataset");
                Some(items.iter().map(|raw| normalize_with(raw, &defaults)).collect())
            })
            .await
            .as_deref()
    }

    async fn cached<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        if !self.cache_ready() {
            return None;
        }
        let entry = match self.cache.get(key).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return None,
            Err(err) => {
                warn!(key, error = %err, "cache read failed; treating as miss");
                return None;
            }
        };
        if !entry.is_fresh(chrono::Utc::now(), self.config.cache_ttl()) {
            debug!(key, "cache entry expired");
            return None;
        }
        match serde_json::from_value(entry.data) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(key, error = %err, "cache entry undecodable; treating as miss");
                None
            }
        }
    }

    async fn store<T: Serialize>(&self, key: &str, value: &T) {
        if !self.cache_ready() {
            return;
        }
        let data = match serde_json::to_value(value) {
            Ok(data) => data,
            Err(err) => {
                warn!(key, error = %err, "could not serialize cache entry");
                return;
            }
        };
        if let Err(err) = self.cache.put(key, &data).await {
            warn!(key, error = %err, "cache write failed");
        }
    }
}

//! Ingestion facade: configuration, fetch strategy chain and background reconciliation.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use estate_adapters::{
    adapter_for_kind, ActorConfig, AdapterKind, AdapterSettings, CredentialCheck, FetchAdapter,
    ProxyHtmlConfig,
};
use estate_core::{
    ImportedProperty, IngestError, Property, SearchFilters, SearchPage, DEFAULT_PAGE_SIZE,
};
use estate_storage::{
    CacheStore, HttpClientConfig, HttpFetcher, MemoryCacheStore, MemoryPropertyRepository,
    PgCacheStore, PgPropertyRepository, PropertyRepository,
};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

pub mod chain;
pub mod reconcile;
pub mod synthetic;

pub use chain::{FetchChain, Resolved, Strategy};
pub use reconcile::{ReconcileReport, ReconcileSettings, Reconciler};

pub const CRATE_NAME: &str = "estate-sync";

pub const DEFAULT_CACHE_TTL_HOURS: u64 = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Test,
    Production,
}

impl Environment {
    pub fn is_production(self) -> bool {
        self == Self::Production
    }
}

impl FromStr for Environment {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Self::Production,
            "test" => Self::Test,
            _ => Self::Development,
        })
    }
}

/// Optional YAML file overriding numeric thresholds.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TuningFile {
    pub cache_ttl_hours: Option<u64>,
    pub page_size: Option<usize>,
    pub actor_max_polls: Option<u32>,
    pub actor_poll_interval_secs: Option<u64>,
    pub reconcile_enabled: Option<bool>,
    pub reconcile_batch_size: Option<usize>,
    pub reconcile_interval_hours: Option<u64>,
    pub reconcile_startup_delay_secs: Option<u64>,
    pub reconcile_request_delay_ms: Option<u64>,
    pub http_timeout_secs: Option<u64>,
}

impl TuningFile {
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading tuning file {}", path.display()))?;
        serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing tuning file {}", path.display()))
    }
}

/// Process-wide settings, built once and shared by every component.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub database_url: Option<String>,
    pub environment: Environment,
    pub mock_mode: bool,
    pub cache_ttl_hours: u64,
    pub page_size: usize,
    pub adapter: AdapterKind,
    pub proxy: ProxyHtmlConfig,
    pub actor: ActorConfig,
    pub dataset_paths: Vec<PathBuf>,
    pub reconcile: ReconcileSettings,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            environment: Environment::Development,
            mock_mode: false,
            cache_ttl_hours: DEFAULT_CACHE_TTL_HOURS,
            page_size: DEFAULT_PAGE_SIZE,
            adapter: AdapterKind::ProxyHtml,
            proxy: ProxyHtmlConfig::default(),
            actor: ActorConfig::default(),
            dataset_paths: default_dataset_paths(),
            reconcile: ReconcileSettings::default(),
            user_agent: "estate-ingest/0.1".to_string(),
            http_timeout_secs: 30,
        }
    }
}

fn default_dataset_paths() -> Vec<PathBuf> {
    ["data/properties.json", "data/sample-properties.json", "properties.json"]
        .into_iter()
        .map(PathBuf::from)
        .collect()
}

fn truthy(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "TRUE" | "True" | "yes")
}

impl IngestConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_map(vars: &HashMap<String, String>) -> Result<Self> {
        Self::from_lookup(|key| vars.get(key).cloned())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let parsed = |key: &str| get(key).and_then(|v| v.trim().parse::<u64>().ok());
        let non_empty = |key: &str| get(key).filter(|v| !v.trim().is_empty());

        let adapter = match non_empty("ESTATE_ADAPTER") {
            Some(name) => name
                .parse::<AdapterKind>()
                .with_context(|| format!("ESTATE_ADAPTER={name}"))?,
            None => defaults.adapter,
        };

        let mut config = Self {
            database_url: non_empty("DATABASE_URL"),
            environment: get("ESTATE_ENV")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.environment),
            mock_mode: get("ESTATE_MOCK_MODE").map(|v| truthy(&v)).unwrap_or(false),
            cache_ttl_hours: parsed("ESTATE_CACHE_TTL_HOURS").unwrap_or(defaults.cache_ttl_hours),
            page_size: parsed("ESTATE_PAGE_SIZE")
                .map(|v| v as usize)
                .unwrap_or(defaults.page_size),
            adapter,
            proxy: ProxyHtmlConfig {
                api_key: non_empty("SCRAPER_API_KEY"),
                proxy_url: non_empty("SCRAPER_PROXY_URL").unwrap_or(defaults.proxy.proxy_url),
                ..defaults.proxy
            },
            actor: ActorConfig {
                token: non_empty("APIFY_TOKEN"),
                actor_id: non_empty("APIFY_ACTOR_ID").unwrap_or(defaults.actor.actor_id),
                ..defaults.actor
            },
            dataset_paths: non_empty("ESTATE_DATASET_PATHS")
                .map(|v| std::env::split_paths(&v).collect())
                .unwrap_or(defaults.dataset_paths),
            reconcile: ReconcileSettings {
                enabled: get("ESTATE_RECONCILE_ENABLED")
                    .map(|v| truthy(&v))
                    .unwrap_or(defaults.reconcile.enabled),
                ..defaults.reconcile
            },
            user_agent: non_empty("ESTATE_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: parsed("ESTATE_HTTP_TIMEOUT_SECS")
                .unwrap_or(defaults.http_timeout_secs),
        };

        if let Some(path) = non_empty("ESTATE_TUNING_FILE") {
            let tuning = TuningFile::load(std::path::Path::new(&path))?;
            config.apply_tuning(&tuning);
        }
        config.page_size = config.page_size.max(1);
        Ok(config)
    }

    pub fn apply_tuning(&mut self, tuning: &TuningFile) {
        if let Some(v) = tuning.cache_ttl_hours {
            self.cache_ttl_hours = v;
        }
        if let Some(v) = tuning.page_size {
            self.page_size = v.max(1);
        }
        if let Some(v) = tuning.actor_max_polls {
            self.actor.max_polls = v.max(1);
        }
        if let Some(v) = tuning.actor_poll_interval_secs {
            self.actor.poll_interval = Duration::from_secs(v);
        }
        if let Some(v) = tuning.reconcile_enabled {
            self.reconcile.enabled = v;
        }
        if let Some(v) = tuning.reconcile_batch_size {
            self.reconcile.batch_size = v;
        }
        if let Some(v) = tuning.reconcile_interval_hours {
            self.reconcile.interval = Duration::from_secs(v.max(1) * 60 * 60);
        }
        if let Some(v) = tuning.reconcile_startup_delay_secs {
            self.reconcile.startup_delay = Duration::from_secs(v);
        }
        if let Some(v) = tuning.reconcile_request_delay_ms {
            self.reconcile.request_delay = Duration::from_millis(v);
        }
        if let Some(v) = tuning.http_timeout_secs {
            self.http_timeout_secs = v;
        }
    }

    pub fn cache_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.cache_ttl_hours as i64)
    }

    pub fn adapter_settings(&self) -> AdapterSettings {
        AdapterSettings {
            proxy: self.proxy.clone(),
            actor: self.actor.clone(),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitReport {
    pub cache_ready: bool,
    pub credentials: CredentialCheck,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: &'static str,
    pub environment: Environment,
    pub mock_mode: bool,
    pub adapter: &'static str,
    pub cache_ready: bool,
    pub credentials: CredentialCheck,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub owner_id: String,
    pub imported: usize,
}

/// Entry point for search, detail and import operations.
pub struct PropertyService {
    config: Arc<IngestConfig>,
    chain: Arc<FetchChain>,
    repository: Arc<dyn PropertyRepository>,
}

impl PropertyService {
    pub fn new(
        config: Arc<IngestConfig>,
        cache: Arc<dyn CacheStore>,
        repository: Arc<dyn PropertyRepository>,
        adapter: Arc<dyn FetchAdapter>,
        http: Arc<HttpFetcher>,
    ) -> Self {
        let chain = Arc::new(FetchChain::new(config.clone(), cache, adapter, http));
        Self {
            config,
            chain,
            repository,
        }
    }

    /// Wires Postgres-backed stores when a database is configured, in-memory ones otherwise.
    pub fn from_config(config: IngestConfig) -> Result<Self> {
        let http = Arc::new(HttpFetcher::new(config.http_client_config())?);
        let adapter: Arc<dyn FetchAdapter> =
            Arc::from(adapter_for_kind(config.adapter, &config.adapter_settings()));

        let (cache, repository): (Arc<dyn CacheStore>, Arc<dyn PropertyRepository>) =
            match &config.database_url {
                Some(url) => {
                    let pool = PgPoolOptions::new()
                        .max_connections(5)
                        .acquire_timeout(Duration::from_secs(5))
                        .connect_lazy(url)
                        .context("parsing DATABASE_URL")?;
                    (
                        Arc::new(PgCacheStore::new(pool.clone())),
                        Arc::new(PgPropertyRepository::new(pool)),
                    )
                }
                None => {
                    warn!("DATABASE_URL not set; using in-memory cache and import store");
                    (
                        Arc::new(MemoryCacheStore::new()),
                        Arc::new(MemoryPropertyRepository::new()),
                    )
                }
            };

        Ok(Self::new(Arc::new(config), cache, repository, adapter, http))
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub fn chain(&self) -> Arc<FetchChain> {
        self.chain.clone()
    }

    pub fn reconciler(&self) -> Arc<Reconciler> {
        Arc::new(Reconciler::new(self.config.clone(), self.chain.clone()))
    }

    /// Prepares the cache and checks provider credentials. Never fails: problems
    /// are reported and the service degrades instead.
    pub async fn initialize(&self) -> InitReport {
        let cache_ready = self.chain.prepare_cache().await;
        let credentials = self.check_credentials().await;
        if !credentials.success && !self.config.mock_mode {
            warn!(message = %credentials.message, "provider credentials not usable");
        }
        info!(
            cache_ready,
            adapter = self.chain.adapter().adapter_id(),
            "property service initialized"
        );
        InitReport {
            cache_ready,
            credentials,
        }
    }

    async fn check_credentials(&self) -> CredentialCheck {
        if self.config.mock_mode {
            return CredentialCheck::ok("mock mode: provider not contacted");
        }
        self.chain
            .adapter()
            .verify_credentials(self.chain.http())
            .await
    }

    pub async fn search_properties(
        &self,
        location: &str,
        page: Option<u32>,
    ) -> Result<SearchPage, IngestError> {
        let mut filters = SearchFilters::new(location);
        filters.page = page;
        self.search(&filters).await
    }

    pub async fn search(&self, filters: &SearchFilters) -> Result<SearchPage, IngestError> {
        let resolved = self.chain.search(filters).await?;
        info!(
            location = %filters.location,
            page = filters.page(),
            strategy = %resolved.strategy,
            results = resolved.value.properties.len(),
            "search resolved"
        );
        Ok(resolved.value)
    }

    pub async fn get_property_details(&self, id: &str) -> Result<Option<Property>, IngestError> {
        let resolved = self.chain.details(id).await?;
        info!(
            id,
            strategy = %resolved.strategy,
            found = resolved.value.is_some(),
            "details resolved"
        );
        Ok(resolved.value)
    }

    /// Persists a batch for one owner in a single transaction: all rows or none.
    pub async fn import_properties(
        &self,
        properties: Vec<Property>,
        owner_id: &str,
    ) -> Result<ImportSummary, IngestError> {
        let owner_id = owner_id.trim();
        if owner_id.is_empty() {
            return Err(IngestError::InvalidQuery("an owner id is required".to_string()));
        }
        if properties.is_empty() {
            return Ok(ImportSummary {
                owner_id: owner_id.to_string(),
                imported: 0,
            });
        }

        // last occurrence of an id wins, first-seen order kept
        let mut order: Vec<String> = Vec::new();
        let mut latest: HashMap<String, Property> = HashMap::new();
        for property in properties {
            if !latest.contains_key(&property.id) {
                order.push(property.id.clone());
            }
            latest.insert(property.id.clone(), property);
        }

        let now = Utc::now();
        let records = order
            .iter()
            .filter_map(|id| latest.remove(id))
            .map(|p| ImportedProperty::tag(p, owner_id, now))
            .collect::<Vec<_>>();

        let imported = self.repository.insert_batch(&records).await.map_err(|err| {
            warn!(owner_id, error = %err, "import failed");
            IngestError::from(err)
        })?;
        info!(owner_id, imported, "properties imported");
        Ok(ImportSummary {
            owner_id: owner_id.to_string(),
            imported,
        })
    }

    pub async fn list_imported(
        &self,
        owner_id: &str,
    ) -> Result<Vec<ImportedProperty>, IngestError> {
        Ok(self.repository.list_by_owner(owner_id.trim()).await?)
    }

    pub async fn health_check(&self) -> HealthReport {
        let cache_ready = self.chain.prepare_cache().await;
        let credentials = self.check_credentials().await;
        let status = if cache_ready && credentials.success {
            "ok"
        } else {
            "degraded"
        };
        HealthReport {
            status,
            environment: self.config.environment,
            mock_mode: self.config.mock_mode,
            adapter: self.chain.adapter().adapter_id(),
            cache_ready,
            credentials,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_apply_when_env_is_empty() {
        let config = IngestConfig::from_map(&HashMap::new()).unwrap();
        assert_eq!(config.cache_ttl_hours, 12);
        assert_eq!(config.page_size, 24);
        assert_eq!(config.actor.max_polls, 60);
        assert_eq!(config.reconcile.batch_size, 50);
        assert_eq!(config.reconcile.interval, Duration::from_secs(86_400));
        assert_eq!(config.environment, Environment::Development);
        assert_eq!(config.adapter, AdapterKind::ProxyHtml);
        assert!(config.database_url.is_none());
        assert!(!config.mock_mode);
    }

    #[test]
    fn env_values_override_defaults() {
        let config = IngestConfig::from_map(&vars(&[
            ("ESTATE_ENV", "production"),
            ("ESTATE_MOCK_MODE", "true"),
            ("ESTATE_CACHE_TTL_HOURS", "6"),
            ("ESTATE_ADAPTER", "apify"),
            ("APIFY_TOKEN", "tok"),
            ("SCRAPER_API_KEY", "   "),
            ("DATABASE_URL", "postgres://estate@localhost/estate"),
        ]))
        .unwrap();
        assert!(config.environment.is_production());
        assert!(config.mock_mode);
        assert_eq!(config.cache_ttl(), chrono::Duration::hours(6));
        assert_eq!(config.adapter, AdapterKind::Actor);
        assert_eq!(config.actor.token.as_deref(), Some("tok"));
        assert!(config.proxy.api_key.is_none());
        assert!(config.database_url.is_some());
    }

    #[test]
    fn unknown_adapter_is_rejected() {
        assert!(IngestConfig::from_map(&vars(&[("ESTATE_ADAPTER", "fax")])).is_err());
    }

    #[test]
    fn tuning_file_overrides_thresholds() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(
            file,
            "cache_ttl_hours: 2\npage_size: 10\nactor_max_polls: 5\nreconcile_batch_size: 7\nreconcile_interval_hours: 6"
        )
        .expect("write");
        let path = file.path().display().to_string();
        let config = IngestConfig::from_map(&vars(&[("ESTATE_TUNING_FILE", &path)])).unwrap();
        assert_eq!(config.cache_ttl_hours, 2);
        assert_eq!(config.page_size, 10);
        assert_eq!(config.actor.max_polls, 5);
        assert_eq!(config.reconcile.batch_size, 7);
        assert_eq!(config.reconcile.interval, Duration::from_secs(6 * 3600));
    }

    #[test]
    fn malformed_tuning_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, "page_sise: 10").expect("write");
        let path = file.path().display().to_string();
        assert!(IngestConfig::from_map(&vars(&[("ESTATE_TUNING_FILE", &path)])).is_err());
    }
}

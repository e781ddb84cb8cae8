//! Managed scraping actor: start a run, poll it to completion, read its dataset.

use std::time::Duration;

use async_trait::async_trait;
use estate_core::RecordDefaults;
use estate_storage::{HttpFetcher, HttpRequest};
use serde_json::{json, Value as JsonValue};
use tracing::{debug, error, info, info_span, Instrument};

use crate::{
    detail_url_variants, json_str, search_url_variants, AdapterError, CredentialCheck, FetchAdapter,
    FetchQuery, RawBatch, DEFAULT_SITE_BASE_URL,
};

pub const DEFAULT_ACTOR_API_URL: &str = "https://api.apify.com/v2";
pub const DEFAULT_ACTOR_ID: &str = "dhrumil~rightmove-scraper";

#[derive(Debug, Clone)]
pub struct ActorConfig {
    pub token: Option<String>,
    pub actor_id: String,
    pub api_base_url: String,
    pub site_base_url: String,
    pub poll_interval: Duration,
    pub max_polls: u32,
}

impl Default for ActorConfig {
    fn default() -> Self {
        Self {
            token: None,
            actor_id: DEFAULT_ACTOR_ID.to_string(),
            api_base_url: DEFAULT_ACTOR_API_URL.to_string(),
            site_base_url: DEFAULT_SITE_BASE_URL.to_string(),
            poll_interval: Duration::from_secs(5),
            max_polls: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Pending(String),
    Succeeded,
    Failed(String),
}

impl RunStatus {
    pub fn parse(status: &str) -> Self {
        match status {
            "SUCCEEDED" => Self::Succeeded,
            "FAILED" | "ABORTED" | "TIMED-OUT" | "TIMED_OUT" => Self::Failed(status.to_string()),
            other => Self::Pending(other.to_string()),
        }
    }
}

pub struct ActorRunnerAdapter {
    config: ActorConfig,
}

impl ActorRunnerAdapter {
    pub fn new(config: ActorConfig) -> Self {
        Self { config }
    }

    fn token(&self) -> Result<&str, AdapterError> {
        self.config
            .token
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| AdapterError::Auth("actor API token is not configured".to_string()))
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.api_base_url.trim_end_matches('/'), path)
    }

    /// Actor ids are written `user/name` but addressed as `user~name`.
    fn actor_path(&self) -> String {
        self.config.actor_id.trim().replace('/', "~")
    }

    fn run_input(&self, query: &FetchQuery) -> JsonValue {
        match query {
            FetchQuery::Search { filters, page_size } => {
                let urls = search_url_variants(&self.config.site_base_url, filters, *page_size);
                let start = urls.into_iter().next().unwrap_or_default();
                json!({
                    "startUrls": [{ "url": start }],
                    "maxItems": page_size,
                    "fullPropertyDetails": false,
                })
            }
            FetchQuery::Detail { id, url } => {
                let urls = detail_url_variants(&self.config.site_base_url, id, url.as_deref());
                let start = urls.into_iter().next().unwrap_or_default();
                json!({
                    "propertyUrls": [{ "url": start }],
                    "fullPropertyDetails": true,
                })
            }
        }
    }

    async fn start_run(
        &self,
        http: &HttpFetcher,
        token: &str,
        input: JsonValue,
    ) -> Result<(String, String), AdapterError> {
        let url = self.endpoint(&format!("acts/{}/runs", self.actor_path()));
        let body = http
            .fetch_json(self.adapter_id(), &HttpRequest::post_json(url, input).bearer(token))
            .await?;
        let run_id = json_str(&body, &["data", "id"])
            .ok_or_else(|| AdapterError::Message("run response carried no id".to_string()))?;
        let dataset_id = json_str(&body, &["data", "defaultDatasetId"]).unwrap_or_default();
        Ok((run_id.to_string(), dataset_id.to_string()))
    }

    /// Polls until the run settles, returning the dataset id to read.
    async fn wait_for_run(
        &self,
        http: &HttpFetcher,
        token: &str,
        run_id: &str,
        dataset_id: String,
    ) -> Result<String, AdapterError> {
        let url = self.endpoint(&format!("actor-runs/{run_id}"));
        for attempt in 1..=self.config.max_polls {
            let body = http
                .fetch_json(self.adapter_id(), &HttpRequest::get(url.clone()).bearer(token))
                .await?;
            let status = json_str(&body, &["data", "status"]).unwrap_or("UNKNOWN");
            match RunStatus::parse(status) {
                RunStatus::Succeeded => {
                    let dataset = json_str(&body, &["data", "defaultDatasetId"])
                        .map(ToString::to_string)
                        .unwrap_or(dataset_id);
                    debug!(attempt, "actor run succeeded");
                    return Ok(dataset);
                }
                RunStatus::Failed(status) => {
                    error!(run_id, %status, "actor run failed");
                    return Err(AdapterError::JobFailed {
                        status,
                        run_id: run_id.to_string(),
                    });
                }
                RunStatus::Pending(status) => {
                    debug!(attempt, %status, "actor run still in progress");
                    if attempt < self.config.max_polls {
                        tokio::time::sleep(self.config.poll_interval).await;
                    }
                }
            }
        }
        Err(AdapterError::Timeout {
            attempts: self.config.max_polls,
        })
    }

    async fn read_dataset(
        &self,
        http: &HttpFetcher,
        token: &str,
        dataset_id: &str,
    ) -> Result<Vec<JsonValue>, AdapterError> {
        let url = self.endpoint(&format!("datasets/{dataset_id}/items?clean=true&format=json"));
        let body = http
            .fetch_json(self.adapter_id(), &HttpRequest::get(url).bearer(token))
            .await?;
        match body {
            JsonValue::Array(items) => Ok(items),
            other => Ok(other
                .get("items")
                .and_then(JsonValue::as_array)
                .cloned()
                .unwrap_or_default()),
        }
    }
}

#[async_trait]
impl FetchAdapter for ActorRunnerAdapter {
    fn adapter_id(&self) -> &'static str {
        "actor"
    }

    fn record_defaults(&self) -> RecordDefaults {
        RecordDefaults {
            bedrooms: 0,
            base_url: Some(self.config.site_base_url.clone()),
            ..RecordDefaults::default()
        }
    }

    async fn fetch_raw(
        &self,
        http: &HttpFetcher,
        query: &FetchQuery,
    ) -> Result<RawBatch, AdapterError> {
        let token = self.token()?;
        let label = match query {
            FetchQuery::Search { filters, .. } => filters.location.clone(),
            FetchQuery::Detail { id, .. } => id.clone(),
        };

        let span = info_span!("actor_run", actor = %self.actor_path(), query = %label);
        async {
            let (run_id, dataset_id) = self.start_run(http, token, self.run_input(query)).await?;
            info!(%run_id, "actor run started");
            let dataset_id = self.wait_for_run(http, token, &run_id, dataset_id).await?;
            let items = self.read_dataset(http, token, &dataset_id).await?;
            if items.is_empty() {
                return Err(match query {
                    FetchQuery::Detail { .. } => AdapterError::NotFound(label.clone()),
                    FetchQuery::Search { .. } => AdapterError::NoResults(label.clone()),
                });
            }
            info!(count = items.len(), "actor dataset read");
            Ok(RawBatch {
                items,
                total_hint: None,
            })
        }
        .instrument(span)
        .await
    }

    async fn verify_credentials(&self, http: &HttpFetcher) -> CredentialCheck {
        let token = match self.token() {
            Ok(token) => token,
            Err(err) => return CredentialCheck::failed(err.to_string()),
        };
        let request = HttpRequest::get(self.endpoint("users/me")).bearer(token);
        match http.fetch_json(self.adapter_id(), &request).await {
            Ok(body) => {
                let user = json_str(&body, &["data", "username"]).unwrap_or("unknown user");
                CredentialCheck::ok(format!("actor token valid for {user}"))
            }
            Err(err) => CredentialCheck::failed(AdapterError::from(err).to_string()),
        }
    }
}

//! HTTP surface over the property ingestion facade.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::extract::{ConnectInfo, Path, Query, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use estate_core::{IngestError, Property, SearchFilters};
use estate_storage::{KeyedRateLimiter, TokenBucketConfig};
use estate_sync::{IngestConfig, PropertyService};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "estate-web";

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub port: u16,
    pub allowed_origins: Vec<String>,
    pub rate_limit_requests: u32,
    pub rate_limit_window: Duration,
    /// Key the rate limit on `x-forwarded-for`. Only safe behind a proxy that
    /// overwrites the header.
    pub trust_forwarded_for: bool,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            port: 3001,
            allowed_origins: vec!["http://localhost:3000".to_string()],
            rate_limit_requests: 100,
            rate_limit_window: Duration::from_secs(15 * 60),
            trust_forwarded_for: false,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<PropertyService>,
    limiter: Arc<KeyedRateLimiter>,
    trust_forwarded_for: bool,
}

impl AppState {
    pub fn new(service: Arc<PropertyService>, web: &WebConfig) -> Self {
        Self {
            service,
            limiter: Arc::new(KeyedRateLimiter::new(TokenBucketConfig::per_window(
                web.rate_limit_requests,
                web.rate_limit_window,
            ))),
            trust_forwarded_for: web.trust_forwarded_for,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct ScrapeRequest {
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub page: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportRequest {
    pub properties: Vec<Property>,
    #[serde(default)]
    pub owner_id: String,
}

/// Facade errors rendered as `{message}` (client errors) or `{message, error}`.
pub struct ApiError(IngestError);

impl From<IngestError> for ApiError {
    fn from(err: IngestError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match &self.0 {
            IngestError::InvalidQuery(message) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "message": message }))).into_response()
            }
            other => {
                let message = match other {
                    IngestError::AdapterAuth(_) => "Listing provider rejected our credentials",
                    IngestError::AdapterTransient(_) => {
                        "Listing provider is temporarily unavailable"
                    }
                    _ => "Failed to process properties",
                };
                warn!(kind = other.kind(), error = %other, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "message": message, "error": other.kind() })),
                )
                    .into_response()
            }
        }
    }
}

pub fn app(state: AppState, web: &WebConfig) -> Router {
    let state = Arc::new(state);

    let scrape = Router::new()
        .route("/api/scrape-properties", post(scrape_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), rate_limit));

    Router::new()
        .merge(scrape)
        .route("/api/properties", get(search_handler))
        .route("/api/properties/import", post(import_handler))
        .route("/api/properties/{id}", get(details_handler))
        .route("/health", get(health_handler))
        .layer(cors_layer(&web.allowed_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allowed = origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect::<Vec<_>>();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_credentials(true)
}

/// Caller identity for rate limiting: the peer address, or the first
/// forwarded address when the deployment sits behind a trusted proxy.
fn caller_key(headers: &HeaderMap, peer: Option<SocketAddr>, trust_forwarded: bool) -> String {
    let forwarded = trust_forwarded
        .then(|| headers.get("x-forwarded-for"))
        .flatten()
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());
    forwarded
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

async fn rate_limit(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Response {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let key = caller_key(req.headers(), peer, state.trust_forwarded_for);
    if !state.limiter.check(&key).await {
        warn!(caller = %key, "rate limit exceeded");
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({ "message": "Too many requests, please try again later." })),
        )
            .into_response();
    }
    next.run(req).await
}

async fn scrape_handler(
    State(state): State<Arc<AppState>>,
    body: Option<Json<ScrapeRequest>>,
) -> Result<Response, ApiError> {
    let request = body.map(|Json(request)| request).unwrap_or_default();
    let location = request.location.unwrap_or_default();
    if location.trim().is_empty() {
        return Ok((
            StatusCode::BAD_REQUEST,
            Json(json!({ "message": "Location is required" })),
        )
            .into_response());
    }
    let page = state
        .service
        .search_properties(&location, request.page)
        .await?;
    Ok(Json(page).into_response())
}

async fn search_handler(
    State(state): State<Arc<AppState>>,
    Query(filters): Query<SearchFilters>,
) -> Result<Response, ApiError> {
    let page = state.service.search(&filters).await?;
    Ok(Json(page).into_response())
}

async fn details_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    match state.service.get_property_details(&id).await? {
        Some(property) => Ok(Json(property).into_response()),
        None => Ok((
            StatusCode::NOT_FOUND,
            Json(json!({ "message": "Property not found" })),
        )
            .into_response()),
    }
}

async fn import_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ImportRequest>,
) -> Result<Response, ApiError> {
    let summary = state
        .service
        .import_properties(request.properties, &request.owner_id)
        .await?;
    Ok(Json(summary).into_response())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    let report = state.service.health_check().await;
    let status = if report.status == "ok" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report)).into_response()
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "could not listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

/// Builds the service, starts reconciliation and serves until interrupted.
pub async fn serve(config: IngestConfig, web: WebConfig) -> anyhow::Result<()> {
    let reconcile_enabled = config.reconcile.enabled;
    let service = Arc::new(PropertyService::from_config(config)?);
    let init = service.initialize().await;
    info!(cache_ready = init.cache_ready, credentials = init.credentials.success, "service ready");

    let scheduler = if reconcile_enabled {
        let sched = service.reconciler().build_scheduler().await?;
        sched.start().await.context("starting reconciliation scheduler")?;
        Some(sched)
    } else {
        None
    };

    let router = app(AppState::new(service, &web), &web);
    let listener = TcpListener::bind(("0.0.0.0", web.port))
        .await
        .with_context(|| format!("binding port {}", web.port))?;
    info!(port = web.port, "listening");
    axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving http")?;

    if let Some(mut sched) = scheduler {
        if let Err(err) = sched.shutdown().await {
            warn!(error = %err, "scheduler shutdown failed");
        }
    }
    Ok(())
}

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse};
use axum::routing::{get, post};
use axum::{Json, Router};
use estate_adapters::{
    ActorConfig, ActorRunnerAdapter, FetchAdapter, FetchQuery, ProxyHtmlAdapter, ProxyHtmlConfig,
};
use estate_core::SearchFilters;
use estate_storage::{BackoffPolicy, HttpClientConfig, HttpFetcher};
use serde_json::{json, Value as JsonValue};

#[derive(Default)]
struct FakeState {
    polls: AtomicU32,
    polls_until_done: u32,
    final_status: &'static str,
}

fn fetcher() -> HttpFetcher {
    HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(5),
        backoff: BackoffPolicy {
            max_retries: 0,
            ..BackoffPolicy::default()
        },
        ..HttpClientConfig::default()
    })
    .expect("fetcher")
}

async fn spawn(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("fake server");
    });
    addr
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == "Bearer good-token")
}

async fn start_run(headers: HeaderMap, Path(actor): Path<String>) -> impl IntoResponse {
    if !authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, Json(json!({"error": "bad token"})));
    }
    assert_eq!(actor, "someone~rightmove");
    (
        StatusCode::CREATED,
        Json(json!({"data": {"id": "run-1", "status": "READY", "defaultDatasetId": "ds-1"}})),
    )
}

async fn run_status(
    State(state): State<Arc<FakeState>>,
    Path(run_id): Path<String>,
) -> Json<JsonValue> {
    assert_eq!(run_id, "run-1");
    let polls = state.polls.fetch_add(1, Ordering::SeqCst) + 1;
    let status = if polls >= state.polls_until_done {
        state.final_status
    } else {
        "RUNNING"
    };
    Json(json!({"data": {"id": "run-1", "status": status, "defaultDatasetId": "ds-1"}}))
}

async fn dataset_items(Path(dataset): Path<String>) -> Json<JsonValue> {
    assert_eq!(dataset, "ds-1");
    Json(json!([
        {"id": "9001", "displayAddress": "3 Quay Street, Bristol BS1 4DB", "price": {"amount": 325000}},
        {"id": "9002", "displayAddress": "Flat 1, Harbourside, Bristol", "price": "£210,000", "bedrooms": 2}
    ]))
}

async fn users_me(headers: HeaderMap) -> impl IntoResponse {
    if authorized(&headers) {
        (StatusCode::OK, Json(json!({"data": {"username": "tester"}})))
    } else {
        (StatusCode::UNAUTHORIZED, Json(json!({})))
    }
}

async fn actor_server(
    polls_until_done: u32,
    final_status: &'static str,
) -> (SocketAddr, Arc<FakeState>) {
    let state = Arc::new(FakeState {
        polls: AtomicU32::new(0),
        polls_until_done,
        final_status,
    });
    let app = Router::new()
        .route("/v2/acts/{actor}/runs", post(start_run))
        .route("/v2/actor-runs/{run_id}", get(run_status))
        .route("/v2/datasets/{dataset}/items", get(dataset_items))
        .route("/v2/users/me", get(users_me))
        .with_state(state.clone());
    (spawn(app).await, state)
}

fn actor_adapter(addr: SocketAddr, token: &str, max_polls: u32) -> ActorRunnerAdapter {
    ActorRunnerAdapter::new(ActorConfig {
        token: Some(token.to_string()),
        actor_id: "someone/rightmove".to_string(),
        api_base_url: format!("http://{addr}/v2"),
        poll_interval: Duration::from_millis(5),
        max_polls,
        ..ActorConfig::default()
    })
}

#[tokio::test]
async fn actor_run_is_polled_until_success() {
    let (addr, state) = actor_server(3, "SUCCEEDED").await;
    let adapter = actor_adapter(addr, "good-token", 60);
    let batch = adapter
        .fetch_raw(&fetcher(), &FetchQuery::search(SearchFilters::new("Bristol"), 24))
        .await
        .expect("batch");

    assert_eq!(state.polls.load(Ordering::SeqCst), 3);
    assert_eq!(batch.items.len(), 2);

    let first = estate_core::normalize_with(&batch.items[0], &adapter.record_defaults());
    assert_eq!(first.price, 325_000);
    assert_eq!(first.postcode, "BS1 4DB");
    assert_eq!(first.bedrooms, 0);
}

#[tokio::test]
async fn failed_run_is_a_hard_failure() {
    let (addr, _) = actor_server(1, "ABORTED").await;
    let err = actor_adapter(addr, "good-token", 60)
        .fetch_raw(&fetcher(), &FetchQuery::detail("9001"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        estate_adapters::AdapterError::JobFailed { ref status, .. } if status == "ABORTED"
    ));
}

#[tokio::test]
async fn polling_is_bounded() {
    let (addr, state) = actor_server(u32::MAX, "SUCCEEDED").await;
    let err = actor_adapter(addr, "good-token", 4)
        .fetch_raw(&fetcher(), &FetchQuery::detail("9001"))
        .await
        .unwrap_err();
    assert!(matches!(err, estate_adapters::AdapterError::Timeout { attempts: 4 }));
    assert_eq!(state.polls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn rejected_token_surfaces_as_auth_error() {
    let (addr, _) = actor_server(1, "SUCCEEDED").await;
    let adapter = actor_adapter(addr, "stale-token", 60);
    let http = fetcher();
    let err = adapter
        .fetch_raw(&http, &FetchQuery::detail("9001"))
        .await
        .unwrap_err();
    assert!(err.is_auth());

    let check = adapter.verify_credentials(&http).await;
    assert!(!check.success);
    let good = actor_adapter(addr, "good-token", 60).verify_credentials(&http).await;
    assert!(good.success);
    assert!(good.message.contains("tester"));
}

async fn proxy(Query(params): Query<HashMap<String, String>>) -> impl IntoResponse {
    if params.get("api_key").map(String::as_str) != Some("proxy-key") {
        return (StatusCode::FORBIDDEN, Html(String::new()));
    }
    let target = params.get("url").cloned().unwrap_or_default();
    if target.contains("searchLocation=") {
        // first variant renders an empty shell
        return (StatusCode::OK, Html("<html><body></body></html>".to_string()));
    }
    if target.contains("/property-for-sale/leeds.html") {
        let page = r#"<script>window.jsonModel = {"properties":[{"id":"1","displayAddress":"1 Briggate, Leeds LS1 6HD"}],"resultCount":"51"}</script>"#;
        return (StatusCode::OK, Html(page.to_string()));
    }
    if target.contains("/properties/777") {
        let notice = r#"<html><body><h1>This property has been removed by the agent.</h1></body></html>"#;
        return (StatusCode::OK, Html(notice.to_string()));
    }
    (StatusCode::NOT_FOUND, Html(String::new()))
}

async fn proxy_server() -> SocketAddr {
    spawn(Router::new().route("/proxy", get(proxy))).await
}

fn proxy_adapter(addr: SocketAddr, key: &str) -> ProxyHtmlAdapter {
    ProxyHtmlAdapter::new(ProxyHtmlConfig {
        api_key: Some(key.to_string()),
        proxy_url: format!("http://{addr}/proxy"),
        ..ProxyHtmlConfig::default()
    })
}

#[tokio::test]
async fn proxy_adapter_falls_through_url_variants() {
    let addr = proxy_server().await;
    let batch = proxy_adapter(addr, "proxy-key")
        .fetch_raw(&fetcher(), &FetchQuery::search(SearchFilters::new("Leeds"), 24))
        .await
        .expect("second variant succeeds");
    assert_eq!(batch.items.len(), 1);
    assert_eq!(batch.total_hint, Some(51));
}

#[tokio::test]
async fn proxy_adapter_reports_vanished_listing() {
    let addr = proxy_server().await;
    let err = proxy_adapter(addr, "proxy-key")
        .fetch_raw(&fetcher(), &FetchQuery::detail("404404"))
        .await
        .unwrap_err();
    assert!(err.is_gone());
}

#[tokio::test]
async fn proxy_adapter_treats_removal_notice_as_gone() {
    let addr = proxy_server().await;
    let err = proxy_adapter(addr, "proxy-key")
        .fetch_raw(&fetcher(), &FetchQuery::detail("777"))
        .await
        .unwrap_err();
    assert!(err.is_gone());
}

#[tokio::test]
async fn proxy_adapter_rejects_bad_key_immediately() {
    let addr = proxy_server().await;
    let err = proxy_adapter(addr, "wrong")
        .fetch_raw(&fetcher(), &FetchQuery::search(SearchFilters::new("Leeds"), 24))
        .await
        .unwrap_err();
    assert!(err.is_auth());
}

//! Drives the ZAP adapter against a fake ZAP API served by axum.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use scanwarden_core::engine::{
    EngineError, ScannerEngine, TargetSubmission, ZapEngine, ZapEngineConfig,
};
use scanwarden_model::{ExternalJobRef, ScanJobId, ScanScope, Severity};
use serde_json::{Value, json};
use url::Url;

type Params = Query<HashMap<String, String>>;

#[derive(Clone, Default)]
struct FakeZap {
    requests: Arc<Mutex<Vec<(String, HashMap<String, String>)>>>,
    context_exists: bool,
    audit_down: bool,
}

impl FakeZap {
    fn log(&self, path: &str, params: &HashMap<String, String>) {
        self.requests
            .lock()
            .expect("log lock")
            .push((path.to_string(), params.clone()));
    }

    fn seen(&self, path: &str) -> Vec<HashMap<String, String>> {
        self.requests
            .lock()
            .expect("log lock")
            .iter()
            .filter(|(seen, _)| seen == path)
            .map(|(_, params)| params.clone())
            .collect()
    }
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("X-ZAP-API-Key")
        .and_then(|value| value.to_str().ok())
        == Some("secret")
}

fn denied() -> Response {
    (
        StatusCode::FORBIDDEN,
        axum::Json(json!({"code": "bad_api_key", "message": "Invalid API key"})),
    )
        .into_response()
}

fn alerts_fixture() -> Vec<Value> {
    vec![
        json!({
            "id": "11", "pluginId": "40018", "alert": "SQL Injection",
            "name": "SQL Injection", "risk": "High", "confidence": "Medium",
            "url": "https://shop.test/search?q=1", "description": "SQLi",
            "solution": "Use prepared statements", "param": "q",
            "evidence": "", "cweid": "89"
        }),
        json!({
            "id": "12", "pluginId": "10020", "alert": "Missing Anti-clickjacking Header",
            "risk": "Medium", "confidence": "Medium", "url": "https://shop.test/",
            "description": "", "solution": "", "param": "x-frame-options",
            "evidence": "", "cweid": "1021"
        }),
        json!({
            "id": "13", "pluginId": "10037", "alert": "Server Leaks Information",
            "risk": "Low", "confidence": "High", "url": "https://shop.test/",
            "description": "", "solution": "", "param": "", "evidence": "nginx",
            "cweid": "-1"
        }),
    ]
}

async fn new_context(State(zap): State<FakeZap>, headers: HeaderMap, params: Params) -> Response {
    if !authorized(&headers) {
        return denied();
    }
    zap.log("newContext", &params);
    if zap.context_exists {
        return (
            StatusCode::BAD_REQUEST,
            axum::Json(json!({"code": "already_exists", "message": "Already exists"})),
        )
            .into_response();
    }
    axum::Json(json!({"contextId": "1"})).into_response()
}

async fn ok_action(path: &'static str, zap: FakeZap, params: Params) -> Response {
    zap.log(path, &params);
    axum::Json(json!({"Result": "OK"})).into_response()
}

async fn spider_scan(State(zap): State<FakeZap>, params: Params) -> Response {
    zap.log("spiderScan", &params);
    axum::Json(json!({"scan": "3"})).into_response()
}

async fn spider_status(params: Params) -> Response {
    let status = if params.get("scanId").map(String::as_str) == Some("3") {
        "55"
    } else {
        "0"
    };
    axum::Json(json!({"status": status})).into_response()
}

async fn ascan_scan(State(zap): State<FakeZap>, params: Params) -> Response {
    if zap.audit_down {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            axum::Json(json!({"code": "internal_error", "message": "scanner crashed"})),
        )
            .into_response();
    }
    zap.log("ascanScan", &params);
    axum::Json(json!({"scan": "5"})).into_response()
}

async fn context_view(State(zap): State<FakeZap>, params: Params) -> Response {
    zap.log("contextView", &params);
    axum::Json(json!({"context": {"id": "9", "name": params.get("contextName")}}))
        .into_response()
}

async fn spider_pause() -> Response {
    (
        StatusCode::BAD_REQUEST,
        axum::Json(json!({"code": "does_not_exist", "message": "Does Not Exist"})),
    )
        .into_response()
}

async fn alerts(params: Params) -> Response {
    let start: usize = params.get("start").and_then(|v| v.parse().ok()).unwrap_or(0);
    let count: usize = params.get("count").and_then(|v| v.parse().ok()).unwrap_or(0);
    let page: Vec<Value> = alerts_fixture().into_iter().skip(start).take(count).collect();
    axum::Json(json!({"alerts": page})).into_response()
}

async fn serve(zap: FakeZap) -> SocketAddr {
    let app = Router::new()
        .route("/JSON/context/action/newContext/", get(new_context))
        .route(
            "/JSON/context/action/includeInContext/",
            get(|State(zap): State<FakeZap>, params: Params| {
                ok_action("includeInContext", zap, params)
            }),
        )
        .route(
            "/JSON/spider/action/setOptionMaxDepth/",
            get(|State(zap): State<FakeZap>, params: Params| {
                ok_action("setOptionMaxDepth", zap, params)
            }),
        )
        .route("/JSON/spider/action/scan/", get(spider_scan))
        .route("/JSON/spider/view/status/", get(spider_status))
        .route("/JSON/spider/action/pause/", get(spider_pause))
        .route(
            "/JSON/spider/action/stop/",
            get(|State(zap): State<FakeZap>, params: Params| {
                ok_action("spiderStop", zap, params)
            }),
        )
        .route("/JSON/ascan/action/scan/", get(ascan_scan))
        .route(
            "/JSON/pscan/view/recordsToScan/",
            get(|| async { axum::Json(json!({"recordsToScan": "12"})) }),
        )
        .route("/JSON/context/view/context/", get(context_view))
        .route("/JSON/core/view/alerts/", get(alerts))
        .route(
            "/JSON/core/view/numberOfAlerts/",
            get(|State(zap): State<FakeZap>, params: Params| async move {
                zap.log("numberOfAlerts", &params);
                axum::Json(json!({"numberOfAlerts": "3"}))
            }),
        )
        .with_state(zap);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind fake zap");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("fake zap");
    });
    addr
}

fn engine(addr: SocketAddr, page_size: u32) -> ZapEngine {
    ZapEngine::new(ZapEngineConfig {
        base_url: format!("http://{addr}"),
        api_key: Some("secret".into()),
        alert_page_size: page_size,
        ..ZapEngineConfig::default()
    })
    .expect("client")
}

fn submission(scope: ScanScope) -> TargetSubmission {
    TargetSubmission {
        scan_job_id: ScanJobId::new(),
        target_url: Url::parse("https://shop.test/app/").expect("url"),
        scope,
    }
}

#[tokio::test]
async fn submit_creates_context_and_scopes_it() {
    let zap = FakeZap::default();
    let engine = engine(serve(zap.clone()).await, 500);
    let submission = submission(ScanScope::Subdomain);

    let submitted = engine.submit_target(&submission).await.expect("submit");
    assert!(submitted.target_ref.starts_with("scanwarden-"));
    assert_eq!(submitted.context_id.as_deref(), Some("1"));
    assert!(!submitted.has_running_task());

    let includes = zap.seen("includeInContext");
    assert_eq!(includes.len(), 1);
    assert_eq!(includes[0].get("contextName"), Some(&submitted.target_ref));
    assert!(includes[0]["regex"].contains(r"shop\.test"));
}

#[tokio::test]
async fn existing_context_is_reused() {
    let zap = FakeZap {
        context_exists: true,
        ..FakeZap::default()
    };
    let engine = engine(serve(zap.clone()).await, 500);
    let submitted = engine
        .submit_target(&submission(ScanScope::Domain))
        .await
        .expect("context reused");
    assert_eq!(zap.seen("includeInContext").len(), 1);
    assert_eq!(submitted.context_id.as_deref(), Some("9"));
    assert_eq!(
        zap.seen("contextView")[0].get("contextName"),
        Some(&submitted.target_ref)
    );
}

#[tokio::test]
async fn wrong_api_key_is_a_rejection() {
    let addr = serve(FakeZap::default()).await;
    let engine = ZapEngine::new(ZapEngineConfig {
        base_url: format!("http://{addr}"),
        api_key: Some("wrong".into()),
        ..ZapEngineConfig::default()
    })
    .expect("client");
    let err = engine
        .submit_target(&submission(ScanScope::Domain))
        .await
        .expect_err("forbidden");
    assert!(matches!(err, EngineError::Rejected(msg) if msg.contains("Invalid API key")));
}

#[tokio::test]
async fn crawl_start_status_and_failures_map_to_engine_errors() {
    let zap = FakeZap {
        audit_down: true,
        ..FakeZap::default()
    };
    let engine = engine(serve(zap.clone()).await, 500);
    let target = Url::parse("https://shop.test/app/").expect("url");
    let context = ExternalJobRef::new("ctx").with_context_id("1");

    let crawl_ref = engine
        .start_crawl(&context, &target, 4, ScanScope::Path)
        .await
        .expect("crawl");
    assert_eq!(crawl_ref, "3");
    let depth = zap.seen("setOptionMaxDepth");
    assert_eq!(depth[0].get("Integer").map(String::as_str), Some("4"));
    let scans = zap.seen("spiderScan");
    assert_eq!(scans[0].get("subtreeOnly").map(String::as_str), Some("true"));
    assert_eq!(scans[0].get("contextName").map(String::as_str), Some("ctx"));

    let job = ExternalJobRef {
        crawl_ref: Some(crawl_ref),
        ..context.clone()
    };
    let status = engine.status(&job).await.expect("status");
    assert_eq!(status.crawl_percent, Some(55));
    assert_eq!(status.audit_percent, None);
    assert_eq!(status.passive_backlog, Some(12));

    assert!(matches!(
        engine.start_audit(&context, &target).await,
        Err(EngineError::Unavailable(msg)) if msg.contains("scanner crashed")
    ));
    assert!(matches!(engine.pause(&job).await, Err(EngineError::Rejected(_))));
    engine.stop(&job).await.expect("stop");
    assert_eq!(zap.seen("spiderStop").len(), 1);
}

#[tokio::test]
async fn audit_is_limited_to_the_job_context() {
    let zap = FakeZap::default();
    let engine = engine(serve(zap.clone()).await, 500);
    let target = Url::parse("https://shop.test/app/").expect("url");

    let audit_ref = engine
        .start_audit(&ExternalJobRef::new("ctx").with_context_id("1"), &target)
        .await
        .expect("audit");
    assert_eq!(audit_ref, "5");
    let scans = zap.seen("ascanScan");
    assert_eq!(scans[0].get("contextId").map(String::as_str), Some("1"));
    assert_eq!(scans[0].get("inScopeOnly").map(String::as_str), Some("true"));
    assert!(zap.seen("contextView").is_empty());

    engine
        .start_audit(&ExternalJobRef::new("ctx"), &target)
        .await
        .expect("audit with looked up context");
    let scans = zap.seen("ascanScan");
    assert_eq!(scans[1].get("contextId").map(String::as_str), Some("9"));
    assert_eq!(zap.seen("contextView").len(), 1);
}

#[tokio::test]
async fn alert_count_reads_the_target_total() {
    let zap = FakeZap::default();
    let engine = engine(serve(zap.clone()).await, 500);
    let target = Url::parse("https://shop.test/").expect("url");

    assert_eq!(engine.alert_count(&target).await.expect("count"), 3);
    assert_eq!(
        zap.seen("numberOfAlerts")[0].get("baseurl").map(String::as_str),
        Some("https://shop.test/")
    );
}

#[tokio::test]
async fn alerts_page_through_the_listing() {
    let engine = engine(serve(FakeZap::default()).await, 2);
    let job = ExternalJobRef::new("ctx");
    let target = Url::parse("https://shop.test/").expect("url");

    let first = engine.alerts(&job, &target, None).await.expect("page one");
    assert_eq!(first.alerts.len(), 2);
    assert!(first.has_more);
    assert_eq!(first.next_cursor, Some(2));
    assert_eq!(first.alerts[0].severity, Severity::High);
    assert_eq!(first.alerts[0].parameter.as_deref(), Some("q"));
    assert_eq!(first.alerts[0].cwe_id, Some(89));
    assert_eq!(first.alerts[1].name, "Missing Anti-clickjacking Header");
    assert_eq!(first.alerts[1].remediation, "No remediation provided");

    let second = engine
        .alerts(&job, &target, first.next_cursor)
        .await
        .expect("page two");
    assert_eq!(second.alerts.len(), 1);
    assert!(!second.has_more);
    assert_eq!(second.next_cursor, Some(3));
    assert_eq!(second.alerts[0].evidence.as_deref(), Some("nginx"));
    assert_eq!(second.alerts[0].cwe_id, None);
}

#[tokio::test]
async fn unreachable_engine_is_unavailable() {
    let engine = ZapEngine::new(ZapEngineConfig {
        base_url: "http://127.0.0.1:9".into(),
        connect_timeout_ms: 500,
        request_timeout_ms: 1_000,
        ..ZapEngineConfig::default()
    })
    .expect("client");
    let err = engine
        .submit_target(&submission(ScanScope::Domain))
        .await
        .expect_err("nothing listens on the discard port");
    assert!(matches!(err, EngineError::Unavailable(_)));
}

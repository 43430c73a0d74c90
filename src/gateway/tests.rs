use super::*;
use crate::agent::AgentLoop;
use crate::approval::ApprovalBroker;
use crate::bus::EventBus;
use crate::config::{AgentConfig, ProvidersConfig, ToolsConfig};
use crate::cost::CostTracker;
use crate::keychain::MemoryKeychain;
use crate::policy::PolicyEngine;
use crate::providers::mock::MockProvider;
use crate::skills::SkillsLoader;
use crate::store::Store;
use crate::tools::ToolRegistry;
use crate::tools::mcp::McpManager;
use crate::vault::AuditLog;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use std::time::Duration;
use tower::ServiceExt;

fn make_state() -> (tempfile::TempDir, GatewayState) {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open(dir.path().join("pryx.db")).unwrap());
    let bus = Arc::new(EventBus::new());
    let audit = AuditLog::start(store.clone()).unwrap();
    let vault = Arc::new(Vault::new(Arc::new(MemoryKeychain::new()), audit.clone()));
    let policy = Arc::new(PolicyEngine::new(vec![]));
    let approvals = Arc::new(ApprovalBroker::new(
        store.clone(),
        bus.clone(),
        audit.clone(),
        Duration::from_secs(5),
    ));
    let cost = Arc::new(CostTracker::new(
        store.clone(),
        bus.clone(),
        BudgetConfig::default(),
    ));
    let skills = Arc::new(SkillsLoader::new(dir.path(), Default::default()));
    let mcp = Arc::new(McpManager::from_config(&Default::default()));
    let registry = Arc::new(ToolRegistry::new(
        dir.path().to_path_buf(),
        ToolsConfig::default(),
        skills,
        mcp,
    ));
    let agent = Arc::new(AgentLoop::new(
        store,
        bus,
        policy,
        approvals,
        cost.clone(),
        registry,
        Arc::new(MockProvider::new(vec![])),
        audit,
        AgentConfig::default(),
        ProvidersConfig::default(),
    ));
    let state = GatewayState {
        agent,
        vault,
        cost,
        started_at: Instant::now(),
    };
    (dir, state)
}

async fn body_json(resp: axum::http::Response<Body>) -> serde_json::Value {
    let bytes = axum::body::to_bytes(resp.into_body(), 1 << 20).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn health_reports_version_and_uptime() {
    let (_dir, state) = make_state();
    let app = build_router(state);
    let resp = app.oneshot(get("/health")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let json = body_json(resp).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["version"], crate::VERSION);
    assert!(json["uptime"].is_number());
}

#[tokio::test]
async fn session_crud_flow() {
    let (_dir, state) = make_state();
    let app = build_router(state);

    let resp = app
        .clone()
        .oneshot(post_json("/sessions", serde_json::json!({"title": "notes"})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let created = body_json(resp).await;
    let id = created["id"].as_str().unwrap().to_string();
    assert_eq!(created["title"], "notes");

    let resp = app.clone().oneshot(get("/sessions")).await.unwrap();
    let listed = body_json(resp).await;
    assert_eq!(listed["sessions"].as_array().unwrap().len(), 1);

    let resp = app
        .clone()
        .oneshot(get(&format!("/sessions/{id}")))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let got = body_json(resp).await;
    assert_eq!(got["session"]["id"], id.as_str());
    assert!(got["messages"].as_array().unwrap().is_empty());

    let resp = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/sessions/{id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    let resp = app
        .oneshot(get(&format!("/sessions/{id}")))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let err = body_json(resp).await;
    assert_eq!(err["code"], "store.session_not_found");
    assert!(err["message"].is_string());
}

#[tokio::test]
async fn fork_creates_linked_session() {
    let (_dir, state) = make_state();
    let store = state.agent.store().clone();
    let app = build_router(state);

    let session = store.create_session("test", "origin").unwrap();
    let resp = app
        .oneshot(post_json(
            &format!("/sessions/{}/fork", session.id),
            serde_json::json!({"title": "branch"}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let fork = body_json(resp).await;
    assert_eq!(fork["parent_id"], session.id.as_str());
    assert_eq!(fork["title"], "branch");
}

#[tokio::test]
async fn provider_key_lifecycle() {
    let (_dir, state) = make_state();
    let vault = state.vault.clone();
    let app = build_router(state);

    let resp = app
        .clone()
        .oneshot(post_json(
            "/api/providers/anthropic/key",
            serde_json::json!({"key": "sk-test"}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    let stored = vault
        .read(SecretScope::ProviderKey, "anthropic")
        .await
        .unwrap();
    assert_eq!(stored, b"sk-test");

    let resp = app
        .clone()
        .oneshot(post_json(
            "/api/providers/nonsense/key",
            serde_json::json!({"key": "x"}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = app
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/api/providers/anthropic/key")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn budget_get_and_set() {
    let (_dir, state) = make_state();
    let app = build_router(state);

    let resp = app.clone().oneshot(get("/api/cost/budget")).await.unwrap();
    let budget = body_json(resp).await;
    assert!(budget["per_day"].is_null());

    let resp = app
        .clone()
        .oneshot(post_json(
            "/api/cost/budget",
            serde_json::json!({"per_day": 5.0}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = app.oneshot(get("/api/cost/budget")).await.unwrap();
    let budget = body_json(resp).await;
    assert_eq!(budget["per_day"], 5.0);
}

#[tokio::test]
async fn audit_verify_reports_ok() {
    let (_dir, state) = make_state();
    let app = build_router(state);
    let resp = app.oneshot(get("/api/audit/verify")).await.unwrap();
    let json = body_json(resp).await;
    assert_eq!(json["status"], "ok");
}

#[tokio::test]
async fn unknown_approval_is_404() {
    let (_dir, state) = make_state();
    let app = build_router(state);
    let resp = app
        .oneshot(post_json(
            "/api/approvals/missing/approve",
            serde_json::json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn skills_and_providers_listings() {
    let (_dir, state) = make_state();
    let app = build_router(state);

    let resp = app.clone().oneshot(get("/api/skills")).await.unwrap();
    let json = body_json(resp).await;
    assert!(json["skills"].as_array().unwrap().is_empty());

    let resp = app.oneshot(get("/api/providers")).await.unwrap();
    let json = body_json(resp).await;
    let providers = json["providers"].as_array().unwrap();
    assert!(providers.iter().any(|p| p["id"] == "anthropic"));
}

#[tokio::test]
async fn mcp_server_registration_roundtrip() {
    let (_dir, state) = make_state();
    let app = build_router(state);

    let resp = app
        .clone()
        .oneshot(post_json(
            "/api/mcp/servers",
            serde_json::json!({
                "name": "files",
                "transport": "stdio",
                "command": "mcp-files",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);

    let resp = app.clone().oneshot(get("/api/mcp/servers")).await.unwrap();
    let json = body_json(resp).await;
    assert_eq!(json["servers"][0]["name"], "files");
    assert_eq!(json["servers"][0]["trust"], "untrusted");

    let resp = app
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/api/mcp/servers/files")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
}

//! HTTP + WebSocket front end.
//!
//! REST routes cover sessions, skills, MCP servers, provider keys, cost,
//! approvals, and the audit log; `/ws` carries chat traffic and mirrors the
//! event bus. Every error returned to a client is `{code, message}` with a
//! stable code; stack traces stay in the logs.

mod ws;

use crate::agent::AgentLoop;
use crate::config::{BudgetConfig, McpServerConfig};
use crate::cost::CostTracker;
use crate::errors::PryxError;
use crate::store::CostGroupBy;
use crate::vault::{ChainStatus, SecretScope, Vault, verify_chain};
use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

#[derive(Clone)]
pub struct GatewayState {
    pub agent: Arc<AgentLoop>,
    pub vault: Arc<Vault>,
    pub cost: Arc<CostTracker>,
    pub started_at: Instant,
}

/// Wire shape for errors: stable machine code + human message.
pub struct ApiError {
    status: StatusCode,
    code: String,
    message: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "not_found".into(),
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "bad_request".into(),
            message: message.into(),
        }
    }
}

impl From<PryxError> for ApiError {
    fn from(e: PryxError) -> Self {
        let status = match &e {
            PryxError::Store(s) if s.code() == "store.session_not_found" => StatusCode::NOT_FOUND,
            PryxError::Auth(_) => StatusCode::UNAUTHORIZED,
            PryxError::Config(_) => StatusCode::BAD_REQUEST,
            PryxError::Budget(_) => StatusCode::PAYMENT_REQUIRED,
            PryxError::RateLimit { .. } => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("gateway internal error: {}", e);
        }
        Self {
            status,
            code: e.code().to_string(),
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (
            self.status,
            Json(json!({"code": self.code, "message": self.message})),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn build_router(state: GatewayState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/sessions", post(create_session).get(list_sessions))
        .route("/sessions/{id}", get(get_session).delete(delete_session))
        .route("/sessions/{id}/fork", post(fork_session))
        .route("/api/skills", get(list_skills))
        .route("/api/skills/{name}/{action}", post(toggle_skill))
        .route("/api/mcp/servers", get(list_mcp).post(add_mcp))
        .route("/api/mcp/servers/{name}", delete(remove_mcp))
        .route("/api/mcp/servers/{name}/test", post(test_mcp))
        .route("/api/providers", get(list_providers))
        .route(
            "/api/providers/{id}/key",
            post(set_provider_key).delete(delete_provider_key),
        )
        .route("/api/providers/{id}/models", get(provider_models))
        .route("/api/cost/summary", get(cost_summary))
        .route("/api/cost/daily", get(cost_daily))
        .route("/api/cost/monthly", get(cost_monthly))
        .route("/api/cost/session/{id}", get(cost_session))
        .route("/api/cost/budget", get(get_budget).post(set_budget))
        .route("/api/approvals/pending", get(pending_approvals))
        .route("/api/approvals/{id}/{action}", post(resolve_approval))
        .route("/api/audit", get(list_audit))
        .route("/api/audit/verify", get(verify_audit))
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}

/// Bind the listener, write the bound port to `runtime.port` in the data
/// directory, and serve until the process shuts down.
pub async fn start(
    addr: &str,
    data_dir: PathBuf,
    state: GatewayState,
) -> Result<(tokio::task::JoinHandle<()>, SocketAddr), PryxError> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| PryxError::Fatal(format!("cannot bind {addr}: {e}")))?;
    let bound = listener
        .local_addr()
        .map_err(|e| PryxError::Fatal(e.to_string()))?;

    let port_file = data_dir.join("runtime.port");
    if let Err(e) = std::fs::write(&port_file, bound.port().to_string()) {
        return Err(PryxError::Fatal(format!(
            "cannot write {}: {e}",
            port_file.display()
        )));
    }
    info!("gateway listening on {bound}");

    let app = build_router(state);
    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("gateway server error: {e}");
        }
    });
    Ok((handle, bound))
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

async fn health(State(state): State<GatewayState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": crate::VERSION,
        "uptime": state.started_at.elapsed().as_secs(),
    }))
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct CreateSessionBody {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    owner: Option<String>,
}

async fn create_session(
    State(state): State<GatewayState>,
    Json(body): Json<CreateSessionBody>,
) -> ApiResult<impl IntoResponse> {
    let session = state
        .agent
        .store()
        .create_session(
            body.owner.as_deref().unwrap_or("local"),
            body.title.as_deref().unwrap_or("untitled"),
        )
        .map_err(PryxError::from)?;
    Ok((StatusCode::CREATED, Json(session)))
}

#[derive(Deserialize)]
struct PageQuery {
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    offset: Option<usize>,
    #[serde(default)]
    before: Option<i64>,
}

async fn list_sessions(
    State(state): State<GatewayState>,
    Query(page): Query<PageQuery>,
) -> ApiResult<impl IntoResponse> {
    let sessions = state
        .agent
        .store()
        .list_sessions(page.limit.unwrap_or(50), page.offset.unwrap_or(0))
        .map_err(PryxError::from)?;
    Ok(Json(json!({"sessions": sessions})))
}

async fn get_session(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
    Query(page): Query<PageQuery>,
) -> ApiResult<impl IntoResponse> {
    let session = state.agent.store().get_session(&id).map_err(PryxError::from)?;
    let messages = state
        .agent
        .store()
        .load_session(&id, page.limit, page.before)
        .map_err(PryxError::from)?;
    Ok(Json(json!({"session": session, "messages": messages})))
}

async fn delete_session(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.agent.store().delete_session(&id).map_err(PryxError::from)?;
    state.agent.bus().forget_session(&id);
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize, Default)]
struct ForkBody {
    #[serde(default)]
    title: Option<String>,
}

async fn fork_session(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
    body: axum::body::Bytes,
) -> ApiResult<impl IntoResponse> {
    let title = serde_json::from_slice::<ForkBody>(&body)
        .ok()
        .and_then(|b| b.title);
    let fork = state
        .agent
        .store()
        .fork_session(&id, title.as_deref())
        .await
        .map_err(PryxError::from)?;
    Ok((StatusCode::CREATED, Json(fork)))
}

// ---------------------------------------------------------------------------
// Skills
// ---------------------------------------------------------------------------

async fn list_skills(State(state): State<GatewayState>) -> impl IntoResponse {
    let skills: Vec<_> = state
        .agent
        .registry()
        .skills()
        .list()
        .into_iter()
        .map(|s| {
            json!({
                "name": s.meta.name,
                "version": s.meta.version,
                "author": s.meta.author,
                "description": s.meta.description,
                "enabled": s.enabled,
                "eligible": s.eligible,
                "tools": s.meta.tools.iter().map(|t| &t.name).collect::<Vec<_>>(),
            })
        })
        .collect();
    Json(json!({"skills": skills}))
}

async fn toggle_skill(
    State(state): State<GatewayState>,
    Path((name, action)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let enabled = match action.as_str() {
        "enable" => true,
        "disable" => false,
        other => return Err(ApiError::bad_request(format!("unknown action '{other}'"))),
    };
    if !state.agent.registry().skills().set_enabled(&name, enabled) {
        return Err(ApiError::not_found(format!("unknown skill '{name}'")));
    }
    state.agent.registry().rebuild();
    Ok(Json(json!({"name": name, "enabled": enabled})))
}

// ---------------------------------------------------------------------------
// MCP servers
// ---------------------------------------------------------------------------

async fn list_mcp(State(state): State<GatewayState>) -> impl IntoResponse {
    let servers: Vec<_> = state
        .agent
        .registry()
        .mcp()
        .list()
        .into_iter()
        .map(|s| {
            json!({
                "name": s.name,
                "transport": s.config.transport,
                "enabled": s.config.enabled,
                "trust": s.config.trust,
                "tools": s.known_tools().iter().map(|t| t.name.clone()).collect::<Vec<_>>(),
            })
        })
        .collect();
    Json(json!({"servers": servers}))
}

#[derive(Deserialize)]
struct AddMcpBody {
    name: String,
    #[serde(flatten)]
    config: McpServerConfig,
}

async fn add_mcp(
    State(state): State<GatewayState>,
    Json(body): Json<AddMcpBody>,
) -> ApiResult<impl IntoResponse> {
    if body.name.is_empty() {
        return Err(ApiError::bad_request("server name must not be empty"));
    }
    state.agent.registry().mcp().add(body.name.clone(), body.config);
    Ok((StatusCode::CREATED, Json(json!({"name": body.name}))))
}

async fn remove_mcp(
    State(state): State<GatewayState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    if !state.agent.registry().mcp().remove(&name).await {
        return Err(ApiError::not_found(format!("unknown MCP server '{name}'")));
    }
    state.agent.registry().rebuild();
    Ok(StatusCode::NO_CONTENT)
}

async fn test_mcp(
    State(state): State<GatewayState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    match state.agent.registry().refresh_mcp(&name).await {
        Ok(count) => Ok(Json(json!({"name": name, "status": "ok", "tools": count}))),
        Err(e) => Ok(Json(
            json!({"name": name, "status": "error", "message": e.to_string()}),
        )),
    }
}

// ---------------------------------------------------------------------------
// Providers
// ---------------------------------------------------------------------------

async fn list_providers(State(state): State<GatewayState>) -> impl IntoResponse {
    let active = state.agent.provider().name().to_string();
    let providers: Vec<_> = crate::providers::known_providers()
        .iter()
        .map(|p| json!({"id": p, "active": *p == active}))
        .collect();
    Json(json!({"providers": providers}))
}

#[derive(Deserialize)]
struct SetKeyBody {
    key: String,
}

async fn set_provider_key(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
    Json(body): Json<SetKeyBody>,
) -> ApiResult<impl IntoResponse> {
    if !crate::providers::known_providers().contains(&id.as_str()) {
        return Err(ApiError::not_found(format!("unknown provider '{id}'")));
    }
    state
        .vault
        .write(SecretScope::ProviderKey, &id, body.key.as_bytes())
        .await
        .map_err(ApiError::from)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_provider_key(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state
        .vault
        .delete(SecretScope::ProviderKey, &id)
        .await
        .map_err(ApiError::from)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn provider_models(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    if id == state.agent.provider().name() {
        let models = state
            .agent
            .provider()
            .list_models()
            .await
            .map_err(ApiError::from)?;
        return Ok(Json(json!({"provider": id, "models": models})));
    }
    if crate::providers::known_providers().contains(&id.as_str()) {
        return Ok(Json(json!({"provider": id, "models": []})));
    }
    Err(ApiError::not_found(format!("unknown provider '{id}'")))
}

// ---------------------------------------------------------------------------
// Cost
// ---------------------------------------------------------------------------

async fn cost_summary(State(state): State<GatewayState>) -> ApiResult<impl IntoResponse> {
    let by_provider = state
        .agent
        .store()
        .query_cost(None, None, CostGroupBy::Provider)
        .map_err(PryxError::from)?;
    let total = state.agent.store().cost_total().map_err(PryxError::from)?;
    Ok(Json(json!({"total": total, "by_provider": by_provider})))
}

async fn cost_daily(State(state): State<GatewayState>) -> ApiResult<impl IntoResponse> {
    let rows = state
        .agent
        .store()
        .query_cost(None, None, CostGroupBy::Day)
        .map_err(PryxError::from)?;
    Ok(Json(json!({"daily": rows})))
}

async fn cost_monthly(State(state): State<GatewayState>) -> ApiResult<impl IntoResponse> {
    let rows = state
        .agent
        .store()
        .query_cost(None, None, CostGroupBy::Month)
        .map_err(PryxError::from)?;
    Ok(Json(json!({"monthly": rows})))
}

async fn cost_session(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let total = state
        .agent
        .store()
        .cost_sum("", Some(&id))
        .map_err(PryxError::from)?;
    Ok(Json(json!({"session_id": id, "total": total})))
}

async fn get_budget(State(state): State<GatewayState>) -> impl IntoResponse {
    Json(state.cost.budget())
}

async fn set_budget(
    State(state): State<GatewayState>,
    Json(body): Json<BudgetConfig>,
) -> impl IntoResponse {
    state.cost.set_budget(body);
    Json(state.cost.budget())
}

// ---------------------------------------------------------------------------
// Approvals
// ---------------------------------------------------------------------------

async fn pending_approvals(State(state): State<GatewayState>) -> ApiResult<impl IntoResponse> {
    let pending = state.agent.approvals().pending().map_err(ApiError::from)?;
    Ok(Json(json!({"approvals": pending})))
}

async fn resolve_approval(
    State(state): State<GatewayState>,
    Path((id, action)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let approved = match action.as_str() {
        "approve" => true,
        "deny" => false,
        other => return Err(ApiError::bad_request(format!("unknown action '{other}'"))),
    };
    match state.agent.approvals().resolve(&id, approved).await {
        Ok(resolution) => Ok(Json(json!({"id": id, "resolution": resolution}))),
        Err(e) if e.to_string().contains("unknown approval") => {
            Err(ApiError::not_found(e.to_string()))
        }
        Err(e) => Err(ApiError::from(e)),
    }
}

// ---------------------------------------------------------------------------
// Audit
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct AuditQuery {
    #[serde(default)]
    actor: Option<String>,
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    since: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    limit: Option<usize>,
}

async fn list_audit(
    State(state): State<GatewayState>,
    Query(query): Query<AuditQuery>,
) -> ApiResult<impl IntoResponse> {
    let rows = state
        .agent
        .store()
        .load_audit(
            query.actor.as_deref(),
            query.action.as_deref(),
            query.since,
            query.limit.unwrap_or(200),
        )
        .map_err(PryxError::from)?;
    Ok(Json(json!({"entries": rows})))
}

async fn verify_audit(State(state): State<GatewayState>) -> ApiResult<impl IntoResponse> {
    let status = verify_chain(state.agent.store()).map_err(PryxError::from)?;
    let body = match status {
        ChainStatus::Ok { entries } => json!({"status": "ok", "entries": entries}),
        ChainStatus::Broken {
            first_bad_seq,
            detail,
        } => json!({"status": "broken", "first_bad_seq": first_bad_seq, "detail": detail}),
    };
    Ok(Json(body))
}

#[cfg(test)]
mod tests;

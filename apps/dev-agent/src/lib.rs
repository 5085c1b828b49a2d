//! A single-node, in-memory agent speaking the v1 HTTP API subset the client uses.
//!
//! Meant for local development and the system tests; nothing is persisted.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path, Query, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use bytes::Bytes;
use common::wire::{AclCreate, AclCreated, AclEntry, CheckRegistration, CheckUpdate, ServiceRegistration};
use common::{AclTokenType, CheckStatus};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

mod store;

pub use store::{AgentStore, EVENT_BUFFER_SIZE, StoreError};

const TOKEN_HEADER: &str = "X-Consul-Token";

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub bind: SocketAddr,
    pub datacenter: String,
    pub node_name: String,
    /// Enables ACL enforcement when set.
    pub master_token: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8500)),
            datacenter: "dc1".to_string(),
            node_name: "dev-agent".to_string(),
            master_token: None,
        }
    }
}

impl AgentConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let bind = match std::env::var("CONSUL_DEV_BIND") {
            Ok(raw) => raw
                .parse::<SocketAddr>()
                .with_context(|| format!("invalid CONSUL_DEV_BIND: {raw}"))?,
            Err(_) => defaults.bind,
        };

        Ok(Self {
            bind,
            datacenter: std::env::var("CONSUL_DEV_DC").unwrap_or(defaults.datacenter),
            node_name: std::env::var("CONSUL_DEV_NODE").unwrap_or(defaults.node_name),
            master_token: std::env::var("CONSUL_DEV_MASTER_TOKEN")
                .ok()
                .filter(|token| !token.is_empty()),
        })
    }

    pub fn with_datacenter(mut self, datacenter: impl Into<String>) -> Self {
        self.datacenter = datacenter.into();
        self
    }

    pub fn with_master_token(mut self, token: impl Into<String>) -> Self {
        self.master_token = Some(token.into());
        self
    }
}

#[derive(Clone)]
struct AgentState {
    config: Arc<AgentConfig>,
    store: Arc<Mutex<AgentStore>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentHealth {
    pub node: String,
    pub datacenter: String,
    pub acl_enabled: bool,
    pub online: bool,
}

/// A dev agent serving in the background.
pub struct RunningAgent {
    pub addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl RunningAgent {
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn stop(self) {
        self.handle.abort();
    }
}

/// Binds `config.bind` (port 0 picks a free port) and serves in a background task.
pub async fn start(config: AgentConfig) -> Result<RunningAgent> {
    let listener = TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind dev agent on {}", config.bind))?;
    let addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(err) = serve(listener, config).await {
            tracing::error!(error = %err, "dev agent stopped");
        }
    });

    Ok(RunningAgent { addr, handle })
}

pub async fn serve(listener: TcpListener, config: AgentConfig) -> Result<()> {
    let addr = listener.local_addr()?;
    info!(
        %addr,
        datacenter = %config.datacenter,
        acl_enabled = config.master_token.is_some(),
        "dev agent listening"
    );
    axum::serve(listener, router(config)).await?;
    Ok(())
}

pub fn router(config: AgentConfig) -> Router {
    let mut store = AgentStore::new(config.node_name.clone(), config.bind.ip().to_string());
    if let Some(master) = &config.master_token {
        let seeded = store.acl_create(AclCreate {
            id: Some(master.clone()),
            name: "Master Token".to_string(),
            token_type: AclTokenType::Management,
            rules: String::new(),
        });
        if let Err(err) = seeded {
            warn!(error = %err, "failed to seed master token");
        }
    }

    let state = AgentState {
        config: Arc::new(config),
        store: Arc::new(Mutex::new(store)),
    };

    Router::new()
        .route("/health", get(health))
        .route("/v1/kv/", get(kv_get_root).delete(kv_delete_root))
        .route(
            "/v1/kv/{*key}",
            put(kv_put).get(kv_get).delete(kv_delete),
        )
        .route("/v1/event/fire/{name}", put(fire_event))
        .route("/v1/event/list", get(list_events))
        .route("/v1/agent/services", get(local_services))
        .route("/v1/agent/service/register", put(register_service))
        .route("/v1/agent/service/deregister/{id}", put(deregister_service))
        .route("/v1/catalog/service/{name}", get(catalog_service))
        .route("/v1/agent/checks", get(local_checks))
        .route("/v1/agent/check/register", put(register_check))
        .route("/v1/agent/check/deregister/{id}", put(deregister_check))
        .route("/v1/agent/check/pass/{id}", put(pass_check))
        .route("/v1/agent/check/warn/{id}", put(warn_check))
        .route("/v1/agent/check/fail/{id}", put(fail_check))
        .route("/v1/agent/check/update/{id}", put(update_check))
        .route("/v1/acl/create", put(acl_create))
        .route("/v1/acl/info/{id}", get(acl_info))
        .route("/v1/acl/list", get(acl_list))
        .route("/v1/acl/destroy/{id}", put(acl_destroy))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            enforce_request_policy,
        ))
        .with_state(state)
}

#[derive(Debug)]
enum ApiError {
    Store(StoreError),
    PermissionDenied,
    NoPathToDatacenter(String),
    BadRequest(String),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::Store(StoreError::NotFound(msg)) => (StatusCode::NOT_FOUND, msg).into_response(),
            Self::Store(StoreError::Invalid(msg)) | Self::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, msg).into_response()
            }
            Self::PermissionDenied => (StatusCode::FORBIDDEN, "Permission denied").into_response(),
            Self::NoPathToDatacenter(dc) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("No path to datacenter {dc:?}"),
            )
                .into_response(),
        }
    }
}

/// Rejects requests for another datacenter and, with ACLs enabled, requests
/// without a known token. ACL management endpoints need a management token.
async fn enforce_request_policy(
    State(state): State<AgentState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Response {
    if let Some(dc) = params.get("dc")
        && dc != &state.config.datacenter
    {
        return ApiError::NoPathToDatacenter(dc.clone()).into_response();
    }

    let path = request.uri().path().to_string();
    let Some(master) = state.config.master_token.as_deref() else {
        return next.run(request).await;
    };
    if path == "/health" {
        return next.run(request).await;
    }

    let token = headers
        .get(TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .or_else(|| params.get("token").map(String::as_str));

    let token_type = match token {
        Some(token) if token == master => Some(AclTokenType::Management),
        Some(token) => state.store.lock().await.token_type(token),
        None => None,
    };

    let allowed = match token_type {
        Some(AclTokenType::Management) => true,
        Some(AclTokenType::Client) => {
            !path.starts_with("/v1/acl/") || path.starts_with("/v1/acl/info/")
        }
        None => false,
    };

    if !allowed {
        warn!(path = %path, "request denied by acl policy");
        return ApiError::PermissionDenied.into_response();
    }
    next.run(request).await
}

async fn health(State(state): State<AgentState>) -> Json<AgentHealth> {
    let node = state.store.lock().await.node_name().to_string();
    Json(AgentHealth {
        node,
        datacenter: state.config.datacenter.clone(),
        acl_enabled: state.config.master_token.is_some(),
        online: true,
    })
}

async fn kv_put(
    State(state): State<AgentState>,
    Path(key): Path<String>,
    payload: Bytes,
) -> Json<bool> {
    state.store.lock().await.kv_put(&key, &payload);
    info!(key = %key, size_bytes = payload.len(), "stored kv entry");
    Json(true)
}

async fn kv_get(
    State(state): State<AgentState>,
    Path(key): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    kv_read(&state, &key, params.contains_key("recurse")).await
}

async fn kv_get_root(
    State(state): State<AgentState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    kv_read(&state, "", params.contains_key("recurse")).await
}

async fn kv_read(state: &AgentState, key: &str, recurse: bool) -> Response {
    let store = state.store.lock().await;
    let entries = if recurse {
        store.kv_list(key)
    } else {
        store.kv_get(key).into_iter().collect()
    };

    if entries.is_empty() {
        StatusCode::NOT_FOUND.into_response()
    } else {
        (StatusCode::OK, Json(entries)).into_response()
    }
}

async fn kv_delete(
    State(state): State<AgentState>,
    Path(key): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<bool> {
    let mut store = state.store.lock().await;
    if params.contains_key("recurse") {
        let removed = store.kv_delete_prefix(&key);
        info!(prefix = %key, removed, "deleted kv subtree");
    } else {
        store.kv_delete(&key);
    }
    Json(true)
}

async fn kv_delete_root(
    State(state): State<AgentState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<bool>, ApiError> {
    if !params.contains_key("recurse") {
        return Err(ApiError::BadRequest("Missing key name".to_string()));
    }
    let removed = state.store.lock().await.kv_delete_prefix("");
    info!(removed, "deleted every kv entry");
    Ok(Json(true))
}

#[derive(Debug, Default, Deserialize)]
struct EventFireQuery {
    #[serde(default)]
    node: String,
    #[serde(default)]
    service: String,
    #[serde(default)]
    tag: String,
}

async fn fire_event(
    State(state): State<AgentState>,
    Path(name): Path<String>,
    Query(query): Query<EventFireQuery>,
    payload: Bytes,
) -> impl IntoResponse {
    let event = state.store.lock().await.fire_event(
        &name,
        &payload,
        &query.node,
        &query.service,
        &query.tag,
    );
    info!(name = %name, id = %event.id, "fired user event");
    Json(event)
}

#[derive(Debug, Default, Deserialize)]
struct EventListQuery {
    name: Option<String>,
}

async fn list_events(
    State(state): State<AgentState>,
    Query(query): Query<EventListQuery>,
) -> impl IntoResponse {
    Json(state.store.lock().await.list_events(query.name.as_deref()))
}

async fn local_services(State(state): State<AgentState>) -> impl IntoResponse {
    Json(state.store.lock().await.local_services())
}

async fn register_service(
    State(state): State<AgentState>,
    Json(registration): Json<ServiceRegistration>,
) -> Result<StatusCode, ApiError> {
    let name = registration.name.clone();
    state.store.lock().await.register_service(registration)?;
    info!(service = %name, "registered service");
    Ok(StatusCode::OK)
}

async fn deregister_service(
    State(state): State<AgentState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.store.lock().await.deregister_service(&id)?;
    info!(service_id = %id, "deregistered service");
    Ok(StatusCode::OK)
}

async fn catalog_service(
    State(state): State<AgentState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    Json(state.store.lock().await.catalog_service(&name))
}

async fn local_checks(State(state): State<AgentState>) -> impl IntoResponse {
    Json(state.store.lock().await.local_checks())
}

async fn register_check(
    State(state): State<AgentState>,
    Json(registration): Json<CheckRegistration>,
) -> Result<StatusCode, ApiError> {
    state.store.lock().await.register_check(registration)?;
    Ok(StatusCode::OK)
}

async fn deregister_check(
    State(state): State<AgentState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.store.lock().await.deregister_check(&id)?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Default, Deserialize)]
struct CheckNoteQuery {
    #[serde(default)]
    note: String,
}

async fn pass_check(
    State(state): State<AgentState>,
    Path(id): Path<String>,
    Query(query): Query<CheckNoteQuery>,
) -> Result<StatusCode, ApiError> {
    transition_check(&state, &id, CheckStatus::Passing, &query.note).await
}

async fn warn_check(
    State(state): State<AgentState>,
    Path(id): Path<String>,
    Query(query): Query<CheckNoteQuery>,
) -> Result<StatusCode, ApiError> {
    transition_check(&state, &id, CheckStatus::Warning, &query.note).await
}

async fn fail_check(
    State(state): State<AgentState>,
    Path(id): Path<String>,
    Query(query): Query<CheckNoteQuery>,
) -> Result<StatusCode, ApiError> {
    transition_check(&state, &id, CheckStatus::Critical, &query.note).await
}

async fn update_check(
    State(state): State<AgentState>,
    Path(id): Path<String>,
    Json(update): Json<CheckUpdate>,
) -> Result<StatusCode, ApiError> {
    transition_check(&state, &id, update.status, &update.output).await
}

async fn transition_check(
    state: &AgentState,
    id: &str,
    status: CheckStatus,
    output: &str,
) -> Result<StatusCode, ApiError> {
    state
        .store
        .lock()
        .await
        .update_ttl_check(id, status, output)?;
    info!(check_id = %id, status = %status, "updated ttl check");
    Ok(StatusCode::OK)
}

async fn acl_create(
    State(state): State<AgentState>,
    Json(request): Json<AclCreate>,
) -> Result<Json<AclCreated>, ApiError> {
    let id = state.store.lock().await.acl_create(request)?;
    Ok(Json(AclCreated { id }))
}

async fn acl_info(
    State(state): State<AgentState>,
    Path(id): Path<String>,
) -> Json<Vec<AclEntry>> {
    Json(state.store.lock().await.acl_info(&id).into_iter().collect())
}

async fn acl_list(State(state): State<AgentState>) -> Json<Vec<AclEntry>> {
    Json(state.store.lock().await.acl_list())
}

async fn acl_destroy(
    State(state): State<AgentState>,
    Path(id): Path<String>,
) -> Result<Json<bool>, ApiError> {
    state.store.lock().await.acl_destroy(&id)?;
    Ok(Json(true))
}

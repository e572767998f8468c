//! HTTP + WebSocket surface.
//!
//! Thin axum layer over the executor, module registry, state store and
//! trigger daemon. Every mutating route requires the configured bearer
//! token. Errors leave the daemon only as structured JSON
//! (`{"error": {kind, message, recommendations}}`) - never as a stack
//! trace.
//!
//! `POST /plans` reads the raw body and runs it through the protocol
//! repair layer before strict parsing, so near-valid model output
//! (trailing commas, fences, Python literals) still executes. When parsing
//! or validation fails anyway, the error body carries a `correction` field:
//! a plain-text report the caller appends to the model's prompt so it can
//! fix the exact problem instead of regenerating the plan.

pub mod ws;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;

use crate::context::build_context_prompt;
use crate::errors::{BridgeError, BridgeResult};
use crate::events::InProcessBus;
use crate::modules::ModuleRegistry;
use crate::orchestration::approval::ApprovalDecision;
use crate::orchestration::executor::PlanExecutor;
use crate::orchestration::group::PlanGroupExecutor;
use crate::protocol::parser::parse_plan;
use crate::protocol::repair;
use crate::protocol::validator;
use crate::store::PlanStateStore;
use crate::triggers::daemon::TriggerDaemon;
use crate::triggers::models::TriggerDefinition;

pub struct AppState {
    pub executor: Arc<PlanExecutor>,
    pub groups: Arc<PlanGroupExecutor>,
    pub registry: Arc<ModuleRegistry>,
    pub store: Arc<PlanStateStore>,
    pub bus: Arc<InProcessBus>,
    pub triggers: Option<Arc<TriggerDaemon>>,
    pub auth_token: String,
}

/// Structured error response: kind + message + recommendations.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: Value,
}

impl ApiError {
    fn new(status: StatusCode, kind: &str, message: String, recommendations: Vec<String>) -> Self {
        Self {
            status,
            body: json!({"error": {
                "kind": kind,
                "message": message,
                "recommendations": recommendations,
            }}),
        }
    }

    fn not_found(what: &str) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("{} not found", what),
            Vec::new(),
        )
    }

    fn unauthorized() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "missing or invalid bearer token".to_string(),
            Vec::new(),
        )
    }

    fn triggers_disabled() -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "triggers_disabled",
            "the trigger subsystem is disabled by configuration".to_string(),
            Vec::new(),
        )
    }

    /// Attach a correction report the caller can feed back to the model.
    fn with_correction(mut self, correction: String) -> Self {
        self.body["correction"] = json!(correction);
        self
    }
}

impl From<BridgeError> for ApiError {
    fn from(err: BridgeError) -> Self {
        let status = match &err {
            BridgeError::Schema(_) | BridgeError::Validation(_) => StatusCode::BAD_REQUEST,
            BridgeError::PermissionDenied { .. } => StatusCode::FORBIDDEN,
            BridgeError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            BridgeError::UnknownAction(_, _) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let recommendations = err.recommendations();
        ApiError::new(status, err.kind(), err.to_string(), recommendations)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

fn require_auth(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    if state.auth_token.is_empty() {
        return Ok(());
    }
    let presented = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if presented == Some(state.auth_token.as_str()) {
        Ok(())
    } else {
        Err(ApiError::unauthorized())
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/context", get(context))
        .route("/plans", post(submit_plan))
        .route("/plans/:plan_id", get(get_plan).delete(cancel_plan))
        .route(
            "/plans/:plan_id/actions/:action_id/approve",
            post(approve_action),
        )
        .route("/plan-groups", post(submit_plan_group))
        .route("/modules", get(list_modules))
        .route("/modules/:module_id", get(get_module))
        .route(
            "/modules/:module_id/actions/:action/schema",
            get(get_action_schema),
        )
        .route("/triggers", get(list_triggers).post(register_trigger))
        .route(
            "/triggers/:trigger_id",
            get(get_trigger).delete(delete_trigger),
        )
        .route("/triggers/:trigger_id/activate", post(activate_trigger))
        .route("/triggers/:trigger_id/deactivate", post(deactivate_trigger))
        .route("/ws", get(ws_upgrade))
        .with_state(state)
}

/// Bind and serve until the process exits.
pub async fn serve(state: Arc<AppState>, bind_addr: &str) -> BridgeResult<()> {
    let listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| BridgeError::Internal(format!("bind {}: {}", bind_addr, e)))?;
    log::info!("[Api] listening on {}", bind_addr);
    axum::serve(listener, router(state).into_make_service())
        .await
        .map_err(|e| BridgeError::Internal(format!("server error: {}", e)))
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

async fn context(State(state): State<Arc<AppState>>) -> String {
    build_context_prompt(&state.registry).await
}

#[derive(Debug, Deserialize)]
struct SubmitQuery {
    /// `false` = fire-and-forget; poll `GET /plans/:id` for progress.
    #[serde(default = "default_wait")]
    wait: bool,
}

fn default_wait() -> bool {
    true
}

async fn submit_plan(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SubmitQuery>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<Value>, ApiError> {
    require_auth(&state, &headers)?;

    // Best-effort repair of near-valid model output before strict parsing.
    let repaired = repair::repair(&body).map_err(|failure| {
        let correction = repair::format_parse_correction(&body, &failure, None);
        ApiError::from(failure.to_error()).with_correction(correction)
    })?;
    if repaired.was_modified {
        log::info!(
            "[Api] plan body repaired via {}",
            repaired.transformations.join(", ")
        );
    }

    let plan = parse_plan(&repaired.value).map_err(|e| {
        let correction = repair::format_validation_correction(&e, None);
        ApiError::from(e).with_correction(correction)
    })?;
    validator::validate(&plan).map_err(|e| {
        let correction = repair::format_validation_correction(&e, None);
        ApiError::from(e).with_correction(correction)
    })?;

    if query.wait {
        let final_state = state.executor.run(plan).await?;
        Ok(Json(serde_json::to_value(final_state).map_err(to_internal)?))
    } else {
        let plan_id = state.executor.submit(plan);
        Ok(Json(json!({"plan_id": plan_id, "status": "queued"})))
    }
}

async fn get_plan(
    State(state): State<Arc<AppState>>,
    Path(plan_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    match state.store.get(&plan_id)? {
        Some(record) => Ok(Json(serde_json::to_value(record).map_err(to_internal)?)),
        None => Err(ApiError::not_found("plan")),
    }
}

async fn cancel_plan(
    State(state): State<Arc<AppState>>,
    Path(plan_id): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    require_auth(&state, &headers)?;
    if state.executor.cancel(&plan_id) {
        Ok(StatusCode::NO_CONTENT)
    } else if state.store.get(&plan_id)?.is_some() {
        // Already terminal: cancellation is a no-op.
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found("plan"))
    }
}

async fn approve_action(
    State(state): State<Arc<AppState>>,
    Path((plan_id, action_id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(decision): Json<ApprovalDecision>,
) -> Result<Json<Value>, ApiError> {
    require_auth(&state, &headers)?;
    let accepted = state
        .executor
        .approvals()
        .submit_decision(&plan_id, &action_id, decision);
    if accepted {
        Ok(Json(json!({"accepted": true})))
    } else {
        Err(ApiError::not_found("pending approval"))
    }
}

#[derive(Debug, Deserialize)]
struct PlanGroupRequest {
    plans: Vec<Value>,
    #[serde(default = "default_group_concurrency")]
    max_concurrent: usize,
    #[serde(default = "default_group_timeout")]
    timeout_seconds: u64,
    #[serde(default)]
    group_id: Option<String>,
}

fn default_group_concurrency() -> usize {
    10
}

fn default_group_timeout() -> u64 {
    300
}

async fn submit_plan_group(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<PlanGroupRequest>,
) -> Result<Json<Value>, ApiError> {
    require_auth(&state, &headers)?;
    // Group envelopes come from the SDK, not raw model text, so the nested
    // plans are parsed strictly.
    let mut plans = Vec::with_capacity(request.plans.len());
    for raw in &request.plans {
        let plan = parse_plan(raw)?;
        validator::validate(&plan)?;
        plans.push(plan);
    }
    let result = state
        .groups
        .execute(
            plans,
            request.group_id,
            request.max_concurrent,
            Duration::from_secs(request.timeout_seconds),
        )
        .await;
    Ok(Json(serde_json::to_value(result).map_err(to_internal)?))
}

async fn list_modules(State(state): State<Arc<AppState>>) -> Json<Value> {
    let manifests = state.registry.list().await;
    Json(json!({"modules": manifests}))
}

async fn get_module(
    State(state): State<Arc<AppState>>,
    Path(module_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    match state.registry.manifest(&module_id).await {
        Some(manifest) => Ok(Json(serde_json::to_value(manifest).map_err(to_internal)?)),
        None => Err(ApiError::not_found("module")),
    }
}

async fn get_action_schema(
    State(state): State<Arc<AppState>>,
    Path((module_id, action)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    match state.registry.action_spec(&module_id, &action).await {
        Some(spec) => Ok(Json(serde_json::to_value(spec).map_err(to_internal)?)),
        None => Err(ApiError::not_found("action")),
    }
}

// ---------------------------------------------------------------------------
// Triggers
// ---------------------------------------------------------------------------

fn trigger_daemon(state: &AppState) -> Result<Arc<TriggerDaemon>, ApiError> {
    state.triggers.clone().ok_or_else(ApiError::triggers_disabled)
}

async fn list_triggers(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let daemon = trigger_daemon(&state)?;
    let triggers = daemon.list()?;
    Ok(Json(json!({"triggers": triggers})))
}

#[derive(Debug, Deserialize)]
struct RegisterTriggerRequest {
    #[serde(flatten)]
    trigger: TriggerDefinition,
    /// Present when a running plan registers the trigger; chains depth.
    #[serde(default)]
    origin_plan_id: Option<String>,
}

async fn register_trigger(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<RegisterTriggerRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    require_auth(&state, &headers)?;
    let daemon = trigger_daemon(&state)?;
    let registered = match request.origin_plan_id {
        Some(plan_id) => daemon.register_from_plan(request.trigger, &plan_id).await?,
        None => daemon.register(request.trigger).await?,
    };
    Ok((
        StatusCode::CREATED,
        Json(serde_json::to_value(registered).map_err(to_internal)?),
    ))
}

async fn get_trigger(
    State(state): State<Arc<AppState>>,
    Path(trigger_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let daemon = trigger_daemon(&state)?;
    match daemon.get(&trigger_id)? {
        Some(trigger) => Ok(Json(serde_json::to_value(trigger).map_err(to_internal)?)),
        None => Err(ApiError::not_found("trigger")),
    }
}

async fn delete_trigger(
    State(state): State<Arc<AppState>>,
    Path(trigger_id): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    require_auth(&state, &headers)?;
    let daemon = trigger_daemon(&state)?;
    if daemon.delete(&trigger_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found("trigger"))
    }
}

async fn activate_trigger(
    State(state): State<Arc<AppState>>,
    Path(trigger_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    require_auth(&state, &headers)?;
    let daemon = trigger_daemon(&state)?;
    daemon.activate(&trigger_id).await?;
    Ok(Json(json!({"trigger_id": trigger_id, "state": "active"})))
}

async fn deactivate_trigger(
    State(state): State<Arc<AppState>>,
    Path(trigger_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    require_auth(&state, &headers)?;
    let daemon = trigger_daemon(&state)?;
    daemon.deactivate(&trigger_id).await?;
    Ok(Json(json!({"trigger_id": trigger_id, "state": "inactive"})))
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct WsQuery {
    /// Comma-separated topic patterns; defaults to everything.
    #[serde(default)]
    topics: Option<String>,
}

async fn ws_upgrade(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
    upgrade: WebSocketUpgrade,
) -> Response {
    let patterns: Vec<String> = query
        .topics
        .as_deref()
        .unwrap_or("#")
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    let bus = state.bus.clone();
    upgrade.on_upgrade(move |socket| ws::stream_events(socket, bus, patterns))
}

fn to_internal(e: serde_json::Error) -> ApiError {
    ApiError::new(
        StatusCode::INTERNAL_SERVER_ERROR,
        "internal_error",
        e.to_string(),
        Vec::new(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::SessionContextPropagator;
    use crate::memory::KeyValueStore;
    use crate::modules::register_builtin;
    use crate::orchestration::approval::{ApprovalGate, TimeoutBehavior};
    use crate::orchestration::executor::{ExecutorParts, ExecutorSettings};
    use crate::orchestration::resources::ResourceManager;
    use crate::security::guard::PermissionGuard;
    use crate::security::profiles::{profile_config, PermissionProfile};
    use crate::security::rate_limiter::{ActionRateLimiter, RateLimits};
    use crate::security::sanitizer::OutputSanitizer;

    async fn app_state(auth_token: &str) -> Arc<AppState> {
        let registry = Arc::new(ModuleRegistry::new());
        register_builtin(&registry).await.unwrap();
        let store = Arc::new(PlanStateStore::open_in_memory().unwrap());
        let bus = Arc::new(InProcessBus::new());
        let executor = PlanExecutor::new(
            ExecutorParts {
                registry: registry.clone(),
                guard: Arc::new(PermissionGuard::new(
                    profile_config(PermissionProfile::Unrestricted),
                    Vec::new(),
                    Vec::new(),
                )),
                store: store.clone(),
                pipeline: None,
                verifier: None,
                sanitizer: Arc::new(OutputSanitizer::default()),
                approvals: Arc::new(ApprovalGate::new(
                    Duration::from_secs(1),
                    TimeoutBehavior::Reject,
                )),
                memory: Arc::new(KeyValueStore::new()),
                resources: Arc::new(ResourceManager::new(HashMap::new(), 8)),
                limiter: Arc::new(ActionRateLimiter::new(RateLimits::default())),
                bus: bus.clone(),
                propagator: Arc::new(SessionContextPropagator::new()),
            },
            ExecutorSettings::default(),
        );
        Arc::new(AppState {
            groups: Arc::new(PlanGroupExecutor::new(executor.clone())),
            executor,
            registry,
            store,
            bus,
            triggers: None,
            auth_token: auth_token.to_string(),
        })
    }

    #[tokio::test]
    async fn router_builds_with_all_routes() {
        let state = app_state("").await;
        let _router = router(state);
    }

    #[tokio::test]
    async fn auth_helper_enforces_bearer_token() {
        let state = app_state("secret").await;
        let mut headers = HeaderMap::new();
        assert!(require_auth(&state, &headers).is_err());

        headers.insert("authorization", "Bearer wrong".parse().unwrap());
        assert!(require_auth(&state, &headers).is_err());

        headers.insert("authorization", "Bearer secret".parse().unwrap());
        assert!(require_auth(&state, &headers).is_ok());
    }

    #[tokio::test]
    async fn empty_token_disables_auth() {
        let state = app_state("").await;
        assert!(require_auth(&state, &HeaderMap::new()).is_ok());
    }

    #[tokio::test]
    async fn trigger_routes_report_disabled_subsystem() {
        let state = app_state("").await;
        let err = trigger_daemon(&state).unwrap_err();
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn submit_and_fetch_plan_through_handlers() {
        let state = app_state("").await;
        let raw = json!({
            "description": "echo once",
            "actions": [{"id": "a1", "module": "iml", "action": "echo",
                         "params": {"k": "v"}}]
        });
        let response = submit_plan(
            State(state.clone()),
            Query(SubmitQuery { wait: true }),
            HeaderMap::new(),
            raw.to_string(),
        )
        .await
        .unwrap();
        let plan_id = response.0["plan_id"].as_str().unwrap().to_string();
        assert_eq!(response.0["status"], json!("succeeded"));

        let fetched = get_plan(State(state), Path(plan_id)).await.unwrap();
        assert_eq!(fetched.0["status"], json!("succeeded"));
    }

    #[tokio::test]
    async fn near_valid_model_output_is_repaired_and_runs() {
        let state = app_state("").await;
        // Fenced, trailing comma, Python literal: typical model slop.
        let body = "```json\n{\"description\": \"echo once\",\n \"actions\": [\n  {\"id\": \"a1\", \"module\": \"iml\", \"action\": \"echo\",\n   \"params\": {\"ready\": True},},\n ]\n}\n```";
        let response = submit_plan(
            State(state),
            Query(SubmitQuery { wait: true }),
            HeaderMap::new(),
            body.to_string(),
        )
        .await
        .unwrap();
        assert_eq!(response.0["status"], json!("succeeded"));
        let result = &response.0["actions"]["a1"]["result"];
        assert_eq!(result["ready"], json!(true));
    }

    #[tokio::test]
    async fn unrepairable_body_returns_a_correction_report() {
        let state = app_state("").await;
        let err = submit_plan(
            State(state),
            Query(SubmitQuery { wait: true }),
            HeaderMap::new(),
            "definitely not a plan".to_string(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.body["error"]["kind"], json!("schema_error"));
        let correction = err.body["correction"].as_str().unwrap();
        assert!(correction.contains("CORRECTION REQUEST"));
        assert!(correction.contains("JSON syntax error"));
    }

    #[tokio::test]
    async fn invalid_plan_maps_to_bad_request_with_correction() {
        let state = app_state("").await;
        let err = submit_plan(
            State(state),
            Query(SubmitQuery { wait: true }),
            HeaderMap::new(),
            json!({"description": "no actions", "actions": []}).to_string(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.body["error"]["kind"], json!("schema_error"));
        assert!(err.body["correction"]
            .as_str()
            .unwrap()
            .contains("validation error"));
    }
}

//! HTTP surface mirroring the CLI (§6 `[ADDED]`). Built the way the
//! teacher's `api/mod.rs` lays out its router: typed JSON request/response
//! structs, a shared `AppState`, and `auth_middleware`/`rate_limit_middleware`
//! layered over every route except `/health`.

use crate::accountability::AccountabilityEngine;
use crate::agent::RemoteAgent;
use crate::config::ApiConfig;
use crate::event_bus::EventBus;
use crate::models::Task;
use crate::quality::QualityGate;
use crate::queue::TaskQueue;
use crate::rate_limit::RateLimitConfig;
use crate::registry::AgentRegistry;
use crate::store::Store;
use crate::validation::TaskContentValidator;
use crate::vcs::pr_integrator::PRIntegrator;
use crate::{FleetError, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use validator::Validate;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub queue: Arc<TaskQueue>,
    pub registry: Arc<AgentRegistry>,
    pub bus: Arc<EventBus>,
    pub gate: Arc<QualityGate>,
    pub pr_integrator: Option<Arc<PRIntegrator>>,
    pub accountability: Arc<AccountabilityEngine>,
    pub api_config: Arc<ApiConfig>,
    pub rate_limit: RateLimitConfig,
}

pub struct ApiError(FleetError);

impl From<FleetError> for ApiError {
    fn from(e: FleetError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            FleetError::NotFound(_) => StatusCode::NOT_FOUND,
            FleetError::Validation(_) | FleetError::InvariantViolation(_) => StatusCode::BAD_REQUEST,
            FleetError::QueueFull => StatusCode::SERVICE_UNAVAILABLE,
            FleetError::Unauthorized => StatusCode::UNAUTHORIZED,
            FleetError::GateBlocked(_) => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

fn cors_layer(config: &ApiConfig) -> CorsLayer {
    CorsLayer::new()
        .allow_origin(
            config
                .allowed_origins
                .iter()
                .filter_map(|origin| origin.parse().ok())
                .collect::<Vec<_>>(),
        )
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::DELETE,
        ])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::AUTHORIZATION,
        ])
}

pub fn router(state: AppState) -> Router {
    let cors = cors_layer(&state.api_config);
    let protected = Router::new()
        .route("/tasks", post(create_task).get(list_tasks))
        .route("/tasks/{id}", get(get_task).delete(cancel_task))
        .route("/agents", post(register_agent).get(list_agents))
        .route("/agents/{id}/heartbeat", post(agent_heartbeat))
        .route("/agents/{id}/sleep", post(agent_sleep))
        .route("/agents/{id}/wake", post(agent_wake))
        .route("/status", get(status))
        .route("/gate/check", post(gate_check))
        .route("/pr/{id}/integrate", post(pr_integrate))
        .route("/events/tail", get(events_tail))
        .route("/system/metrics", get(system_metrics))
        .route_layer(
            ServiceBuilder::new()
                .layer(axum::middleware::from_fn_with_state(
                    state.rate_limit.clone(),
                    crate::rate_limit::rate_limit_middleware,
                ))
                .layer(axum::middleware::from_fn_with_state(
                    state.api_config.clone(),
                    crate::auth::auth_middleware,
                )),
        );

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Deserialize, Validate)]
struct CreateTaskRequest {
    #[validate(length(min = 1, max = 128))]
    id: String,
    #[validate(length(min = 1, max = 64))]
    task_type: String,
    #[validate(length(max = 10_000))]
    description: Option<String>,
    priority: i64,
    #[serde(default)]
    dependencies: HashSet<String>,
    #[serde(default)]
    data: HashMap<String, String>,
    deadline: Option<chrono::DateTime<chrono::Utc>>,
    timeout_seconds: Option<i64>,
    max_attempts: Option<u32>,
}

async fn create_task(
    State(state): State<AppState>,
    Json(req): Json<CreateTaskRequest>,
) -> std::result::Result<Json<Task>, ApiError> {
    req.validate()
        .map_err(|e| FleetError::Validation(e.to_string()))?;

    let validator = TaskContentValidator::new();
    let mut task = Task::new(req.id, req.task_type, req.priority).with_dependencies(req.dependencies);
    if let Some(description) = req.description {
        task.description = validator.sanitize_description(&description)?;
    }
    for (key, value) in req.data {
        let (key, value) = validator.sanitize_data_entry(&key, &value)?;
        task.data.insert(key, value);
    }
    if let Some(deadline) = req.deadline {
        task = task.with_deadline(deadline);
    }
    task.timeout_seconds = req.timeout_seconds;
    if let Some(max_attempts) = req.max_attempts {
        task.max_attempts = max_attempts;
    }

    match state.queue.add(task.clone()).await? {
        crate::queue::AddOutcome::Added => Ok(Json(task)),
        crate::queue::AddOutcome::Duplicate => Err(FleetError::Validation(format!(
            "task {} already exists",
            task.id
        ))
        .into()),
        crate::queue::AddOutcome::QueueFull => Err(FleetError::QueueFull.into()),
    }
}

#[derive(Deserialize)]
struct ListTasksQuery {
    status: Option<crate::models::TaskStatus>,
}

async fn list_tasks(
    State(state): State<AppState>,
    axum::extract::Query(query): axum::extract::Query<ListTasksQuery>,
) -> std::result::Result<Json<Vec<Task>>, ApiError> {
    let tasks = match query.status {
        Some(status) => state.store.list_tasks_by_status(status)?,
        None => state.store.list_all_tasks()?,
    };
    Ok(Json(tasks))
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> std::result::Result<Json<Task>, ApiError> {
    state
        .store
        .get_task(&id)?
        .map(Json)
        .ok_or_else(|| FleetError::NotFound(format!("task {id}")).into())
}

async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> std::result::Result<StatusCode, ApiError> {
    state.queue.cancel(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize, Validate)]
struct RegisterAgentRequest {
    #[validate(length(min = 1, max = 128))]
    id: String,
    capabilities: HashSet<String>,
    base_url: String,
}

async fn register_agent(
    State(state): State<AppState>,
    Json(req): Json<RegisterAgentRequest>,
) -> std::result::Result<StatusCode, ApiError> {
    req.validate()
        .map_err(|e| FleetError::Validation(e.to_string()))?;
    if req.capabilities.is_empty() {
        return Err(FleetError::Validation("capabilities must not be empty".to_string()).into());
    }
    let parsed = url::Url::parse(&req.base_url)
        .map_err(|e| FleetError::Validation(format!("invalid base_url: {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(FleetError::Validation("base_url must be http or https".to_string()).into());
    }

    let transport = Arc::new(RemoteAgent::new(req.id, req.base_url.trim_end_matches('/').to_string()));
    state.registry.register(req.capabilities, transport).await?;
    Ok(StatusCode::CREATED)
}

async fn list_agents(
    State(state): State<AppState>,
) -> std::result::Result<Json<Vec<crate::models::AgentRecord>>, ApiError> {
    Ok(Json(state.registry.list()?))
}

#[derive(Deserialize)]
struct HeartbeatRequest {
    working_memory: Option<Vec<u8>>,
}

async fn agent_heartbeat(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<HeartbeatRequest>,
) -> std::result::Result<StatusCode, ApiError> {
    state.registry.heartbeat(&id, req.working_memory)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct SleepRequest {
    #[serde(default)]
    payload: Vec<u8>,
}

async fn agent_sleep(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<SleepRequest>,
) -> std::result::Result<StatusCode, ApiError> {
    state.registry.sleep(&id, req.payload).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Serialize)]
struct WakeResponse {
    payload: Option<Vec<u8>>,
}

async fn agent_wake(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> std::result::Result<Json<WakeResponse>, ApiError> {
    let payload = state.registry.wake(&id).await?;
    Ok(Json(WakeResponse { payload }))
}

#[derive(Serialize)]
struct StatusResponse {
    pending_tasks: usize,
    agents: usize,
    event_bus: crate::event_bus::EventBusStats,
}

async fn status(State(state): State<AppState>) -> std::result::Result<Json<StatusResponse>, ApiError> {
    Ok(Json(StatusResponse {
        pending_tasks: state.queue.len().await,
        agents: state.registry.list()?.len(),
        event_bus: state.bus.stats(),
    }))
}

async fn gate_check(
    State(state): State<AppState>,
    Json(artifact): Json<crate::models::Artifact>,
) -> Json<crate::quality::GateResult> {
    Json(state.gate.evaluate(&artifact).await)
}

#[derive(Deserialize)]
struct PrIntegrateQuery {
    #[serde(default)]
    batch: bool,
}

async fn pr_integrate(
    State(state): State<AppState>,
    Path(id): Path<String>,
    axum::extract::Query(query): axum::extract::Query<PrIntegrateQuery>,
) -> std::result::Result<Json<serde_json::Value>, ApiError> {
    let integrator = state
        .pr_integrator
        .as_ref()
        .ok_or_else(|| FleetError::Configuration("no VCS gateway configured".to_string()))?;

    if query.batch {
        let prefix = if id.is_empty() { None } else { Some(id) };
        let outcomes = integrator
            .integrate_ready(&crate::vcs::PrFilter {
                branch_prefix: prefix,
            })
            .await?;
        Ok(Json(serde_json::json!(outcomes)))
    } else {
        Ok(Json(serde_json::json!(integrator.integrate(&id).await?)))
    }
}

#[derive(Deserialize)]
struct EventsTailQuery {
    limit: Option<usize>,
    event_type: Option<String>,
}

async fn events_tail(
    State(state): State<AppState>,
    axum::extract::Query(query): axum::extract::Query<EventsTailQuery>,
) -> std::result::Result<Json<Vec<crate::models::StreamEvent>>, ApiError> {
    let events = state.store.tail_events(query.limit.unwrap_or(100))?;
    let events = match query.event_type {
        Some(t) => events.into_iter().filter(|e| e.event_type == t).collect(),
        None => events,
    };
    Ok(Json(events))
}

async fn system_metrics(State(state): State<AppState>) -> Json<crate::event_bus::EventBusStats> {
    Json(state.bus.stats())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EventBusConfig, OrchestratorConfig, QualityGateConfig};
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let queue = Arc::new(TaskQueue::new(Arc::clone(&store), 100));
        let orchestrator_config = OrchestratorConfig {
            max_agents: 5,
            heartbeat_interval: Duration::from_secs(30),
            timeout_threshold: Duration::from_secs(900),
            max_consecutive_failures: 3,
            max_recovery_attempts: 2,
            task_timeout: Duration::from_secs(300),
            queue_max_size: 100,
        };
        let registry = Arc::new(AgentRegistry::new(Arc::clone(&store), orchestrator_config));
        let bus = EventBus::new(
            "api-test",
            EventBusConfig {
                buffer_size: 64,
                flush_interval: Duration::from_secs(60),
                batch_size: 16,
                max_retries: 1,
                retry_delay: Duration::from_millis(1),
            },
            Arc::clone(&store),
        );
        let gate = Arc::new(QualityGate::with_defaults(&QualityGateConfig {
            max_pr_size: 500,
            min_coverage: 0.8,
        }));
        let accountability = Arc::new(AccountabilityEngine::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            Arc::clone(&registry),
            Arc::clone(&bus),
        ));
        AppState {
            store,
            queue,
            registry,
            bus,
            gate,
            pr_integrator: None,
            accountability,
            api_config: Arc::new(ApiConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
                api_key: None,
                allowed_origins: vec![],
            }),
            rate_limit: RateLimitConfig::new(),
        }
    }

    #[tokio::test]
    async fn health_endpoint_is_unauthenticated() {
        let app = router(test_state());
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/health")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn create_task_without_api_key_configured_is_allowed() {
        let app = router(test_state());
        let body = serde_json::json!({
            "id": "t1",
            "task_type": "code_generation",
            "priority": 5
        });
        let mut request = axum::http::Request::builder()
            .method("POST")
            .uri("/tasks")
            .header("content-type", "application/json")
            .body(axum::body::Body::from(body.to_string()))
            .unwrap();
        request.extensions_mut().insert(axum::extract::ConnectInfo(
            std::net::SocketAddr::from(([127, 0, 0, 1], 0)),
        ));
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}

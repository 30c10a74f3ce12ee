//! HTTP API for managing instances.
//!
//! ## Endpoints
//!
//! - `GET /health` - Health check
//! - `GET /instances` - Caller's instances
//! - `POST /instances` - Provision an instance
//! - `GET /instances/:id` - One instance with its runtime status
//! - `DELETE /instances/:id` - Decommission an instance
//! - `POST /instances/:id/power` - Start, restart or shut down
//! - `GET /instances/:id/terminal` - WebSocket terminal session

use crate::auth::Caller;
use crate::terminal::terminal_handler;
use crate::types::{
    CreateInstanceRequest, ErrorResponse, InstanceView, ListInstancesResponse, PowerRequest,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use burrow_core::{
    AuthError, ControllerConfig, CoreError, IdentityProvider, InstanceId, InstanceLocks,
    InstanceRegistry, InstanceStore, LifecycleController, SessionBridge, SessionConfig,
};
use burrow_engine::{ContainerEngine, EngineError};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<LifecycleController>,
    pub bridge: Arc<SessionBridge>,
    pub identity: Arc<dyn IdentityProvider>,
}

impl AppState {
    /// Wire the controller and bridge over one engine and one registry.
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        store: Arc<dyn InstanceStore>,
        controller_config: ControllerConfig,
        session_config: SessionConfig,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        let registry = Arc::new(InstanceRegistry::new(store));
        let locks = Arc::new(InstanceLocks::new());
        Self {
            controller: Arc::new(LifecycleController::new(
                engine.clone(),
                registry.clone(),
                locks.clone(),
                controller_config,
            )),
            bridge: Arc::new(SessionBridge::new(engine, registry, locks, session_config)),
            identity,
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Error returned by handlers.
#[derive(Debug)]
pub enum ApiError {
    Core(CoreError),
    Auth(AuthError),
    BadRequest(String),
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        Self::Core(err)
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        Self::Auth(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Auth(AuthError::Provider(_)) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::Core(err) => core_status(err),
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::Core(err) => err.is_retryable(),
            Self::Auth(AuthError::Provider(_)) => true,
            _ => false,
        }
    }
}

pub(crate) fn core_status(err: &CoreError) -> StatusCode {
    match err {
        CoreError::NotOwner { .. } => StatusCode::FORBIDDEN,
        CoreError::InstanceNotFound(_) | CoreError::ContainerNotFound(_) => StatusCode::NOT_FOUND,
        CoreError::UnsupportedOs(_) | CoreError::EngineRejected(_) | CoreError::InvalidInput(_) => {
            StatusCode::BAD_REQUEST
        }
        CoreError::SessionBusy(_)
        | CoreError::ContainerNotRunning { .. }
        | CoreError::NotProvisioned(_)
        | CoreError::TeardownPending(_)
        | CoreError::InputUnavailable => StatusCode::CONFLICT,
        CoreError::EngineUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        CoreError::ProvisionFailed(cause) => match cause {
            EngineError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::Rejected { .. } => StatusCode::BAD_REQUEST,
            _ => StatusCode::BAD_GATEWAY,
        },
        CoreError::StreamUnavailable(_) => StatusCode::BAD_GATEWAY,
        CoreError::PartialTeardown { .. } | CoreError::InvalidConfig(_) | CoreError::Store(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            Self::Core(e) => e.to_string(),
            Self::Auth(e) => e.to_string(),
            Self::BadRequest(m) => m.clone(),
        };
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %message, "Request failed");
        } else {
            tracing::debug!(status = status.as_u16(), error = %message, "Request rejected");
        }
        let body = ErrorResponse {
            error: message,
            retryable: self.retryable(),
        };
        (status, Json(body)).into_response()
    }
}

pub(crate) fn parse_instance_id(raw: &str) -> Result<InstanceId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid instance id: {raw}")))
}

// ============================================================================
// Router
// ============================================================================

/// Build the HTTP router.
///
/// The returned router can be served directly with axum or composed
/// into a larger application.
pub fn build_router(state: AppState) -> Router {
    tracing::debug!("Building HTTP router");

    Router::new()
        .route("/health", get(health_handler))
        .route("/instances", get(list_handler).post(create_handler))
        .route("/instances/:id", get(get_handler).delete(delete_handler))
        .route("/instances/:id/power", post(power_handler))
        .route("/instances/:id/terminal", get(terminal_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    tracing::trace!("Health check request");
    Json(serde_json::json!({
        "status": "healthy",
        "service": "burrow-server",
        "sessions": state.bridge.active_sessions(),
    }))
}

async fn list_handler(
    State(state): State<AppState>,
    caller: Caller,
) -> Result<Json<ListInstancesResponse>, ApiError> {
    let instances = state.controller.list_instances(caller.owner()).await?;
    Ok(Json(ListInstancesResponse {
        instances: instances.into_iter().map(InstanceView::from).collect(),
    }))
}

async fn create_handler(
    State(state): State<AppState>,
    caller: Caller,
    Json(req): Json<CreateInstanceRequest>,
) -> Result<(StatusCode, Json<InstanceView>), ApiError> {
    let instance = state
        .controller
        .provision(caller.owner(), &req.name, &req.os)
        .await?;
    Ok((StatusCode::CREATED, Json(InstanceView::from(instance))))
}

async fn get_handler(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
) -> Result<Json<InstanceView>, ApiError> {
    let id = parse_instance_id(&id)?;
    let instance = state.controller.get(id, caller.owner()).await?;
    let status = state.controller.query_status(id, caller.owner()).await?;
    Ok(Json(InstanceView::from(instance).with_status(status)))
}

async fn delete_handler(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = parse_instance_id(&id)?;
    state.controller.decommission(id, caller.owner()).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn power_handler(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
    Json(req): Json<PowerRequest>,
) -> Result<StatusCode, ApiError> {
    let id = parse_instance_id(&id)?;
    state
        .controller
        .set_power(id, caller.owner(), req.action)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Start the HTTP server.
///
/// This function runs until the server is shut down via the provided
/// shutdown signal.
pub async fn serve(
    state: AppState,
    addr: std::net::SocketAddr,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), std::io::Error> {
    let router = build_router(state);

    tracing::info!(%addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::debug!(%addr, "TCP listener bound");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TokenIdentity;
    use axum::body::Body;
    use axum::http::Request;
    use burrow_core::{Identity, MemoryStore};
    use burrow_engine::fake::{FakeEngine, FakeFailure, FakeOp};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn test_app() -> (FakeEngine, Router) {
        let engine = FakeEngine::new();
        let identity = TokenIdentity::default()
            .with_token("t1", Identity::new("u1", "alice"))
            .with_token("t2", Identity::new("u2", "bob"));
        let state = AppState::new(
            Arc::new(engine.clone()),
            Arc::new(MemoryStore::new()),
            ControllerConfig::default(),
            SessionConfig::default(),
            Arc::new(identity),
        );
        (engine, build_router(state))
    }

    async fn call(
        app: &Router,
        method: &str,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            req = req.header("authorization", format!("Bearer {token}"));
        }
        let body = match body {
            Some(json) => {
                req = req.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let response = app.clone().oneshot(req.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    async fn create(app: &Router, token: &str, name: &str) -> String {
        let (status, body) = call(
            app,
            "POST",
            "/instances",
            Some(token),
            Some(json!({"name": name, "os": "alpine"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        body["id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (_, app) = test_app();
        let (status, body) = call(&app, "GET", "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["sessions"], 0);
    }

    #[tokio::test]
    async fn test_requires_credentials() {
        let (_, app) = test_app();
        let (status, body) = call(&app, "GET", "/instances", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["retryable"], false);

        let (status, _) = call(&app, "GET", "/instances", Some("bogus"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = call(&app, "GET", "/instances?token=t1", None, None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_instance_crud() {
        let (engine, app) = test_app();
        let id = create(&app, "t1", "box1").await;
        assert_eq!(engine.container_count(), 1);

        let (status, body) = call(&app, "GET", "/instances", Some("t1"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["instances"].as_array().unwrap().len(), 1);
        assert_eq!(body["instances"][0]["name"], "box1");

        let (status, body) = call(&app, "GET", &format!("/instances/{id}"), Some("t1"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "running");
        assert_eq!(body["image"], "alpine:latest");

        let uri = format!("/instances/{id}");
        let (status, _) = call(&app, "DELETE", &uri, Some("t1"), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = call(&app, "DELETE", &uri, Some("t1"), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(engine.container_count(), 0);

        let (status, _) = call(&app, "GET", &uri, Some("t1"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_other_owner_is_forbidden() {
        let (_, app) = test_app();
        let id = create(&app, "t1", "box1").await;
        let uri = format!("/instances/{id}");

        let (status, _) = call(&app, "GET", &uri, Some("t2"), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) = call(&app, "DELETE", &uri, Some("t2"), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) = call(
            &app,
            "POST",
            &format!("{uri}/power"),
            Some("t2"),
            Some(json!({"action": "shutdown"})),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (_, body) = call(&app, "GET", "/instances", Some("t2"), None).await;
        assert!(body["instances"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unsupported_os_is_bad_request() {
        let (engine, app) = test_app();
        let (status, body) = call(
            &app,
            "POST",
            "/instances",
            Some("t1"),
            Some(json!({"name": "box", "os": "templeos"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("templeos"));
        assert_eq!(engine.container_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_id_is_bad_request() {
        let (_, app) = test_app();
        let (status, _) = call(&app, "GET", "/instances/not-a-uuid", Some("t1"), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_power_actions() {
        let (_, app) = test_app();
        let id = create(&app, "t1", "box1").await;
        let power = format!("/instances/{id}/power");

        let (status, _) = call(&app, "POST", &power, Some("t1"), Some(json!({"action": "shutdown"}))).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (_, body) = call(&app, "GET", &format!("/instances/{id}"), Some("t1"), None).await;
        assert_eq!(body["status"], "stopped");

        let (status, _) = call(&app, "POST", &power, Some("t1"), Some(json!({"action": "start"}))).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = call(&app, "POST", &power, Some("t1"), Some(json!({"action": "restart"}))).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_engine_outage_is_retryable() {
        let (engine, app) = test_app();
        engine.fail_next(FakeOp::Create, FakeFailure::Unavailable);
        let (status, body) = call(
            &app,
            "POST",
            "/instances",
            Some("t1"),
            Some(json!({"name": "box", "os": "alpine"})),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["retryable"], true);
    }

    #[tokio::test]
    async fn test_partial_teardown_response() {
        let (engine, app) = test_app();
        let id = create(&app, "t1", "box1").await;
        engine.fail_next(FakeOp::Remove, FakeFailure::Rejected(500));

        let uri = format!("/instances/{id}");
        let (status, body) = call(&app, "DELETE", &uri, Some("t1"), None).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["retryable"], true);

        let (_, body) = call(&app, "GET", "/instances", Some("t1"), None).await;
        assert_eq!(body["instances"][0]["phase"], "teardown_pending");

        let (status, _) = call(&app, "DELETE", &uri, Some("t1"), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[test]
    fn test_status_mapping() {
        let id = InstanceId::new();
        let cases = [
            (CoreError::SessionBusy(id), StatusCode::CONFLICT),
            (
                CoreError::ContainerNotRunning {
                    instance: id,
                    state: "exited".into(),
                },
                StatusCode::CONFLICT,
            ),
            (CoreError::ContainerNotFound("c".into()), StatusCode::NOT_FOUND),
            (CoreError::EngineRejected("bad".into()), StatusCode::BAD_REQUEST),
            (
                CoreError::ProvisionFailed(EngineError::Rejected {
                    status: 404,
                    message: "no such image".into(),
                }),
                StatusCode::BAD_REQUEST,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError::Core(err).status(), expected);
        }
    }
}

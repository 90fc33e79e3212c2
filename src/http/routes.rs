//! HTTP route definitions

use axum::{
    extract::State,
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};

use crate::app::AppState;
use crate::util::time::uptime_secs;
use crate::ws::handler::ws_handler;

/// Build the application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws_handler))
        .route("/rpc/validate_token", post(validate_token_handler))
        .route("/rpc/notify_game_start", post(notify_game_start_handler))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&state.config.client_origin))
        .with_state(state)
}

/// `*` allows any origin, otherwise a comma-separated allow list
fn cors_layer(client_origin: &str) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::ORIGIN, header::CONTENT_TYPE, header::ACCEPT, header::AUTHORIZATION]);

    if client_origin.trim() == "*" {
        return cors.allow_origin(Any);
    }

    let allowed_origins: Vec<HeaderValue> = client_origin
        .split(',')
        .filter_map(|s| s.trim().parse::<HeaderValue>().ok())
        .collect();
    cors.allow_origin(allowed_origins)
}

// ============================================================================
// Health endpoint
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    active_rooms: usize,
    active_players: usize,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: uptime_secs(),
        active_rooms: state.registry.active_rooms(),
        active_players: state.registry.total_players(),
    })
}

// ============================================================================
// Control RPCs
// ============================================================================

#[derive(Deserialize)]
struct ValidateTokenRequest {
    room_id: String,
    token: String,
}

#[derive(Serialize)]
struct ValidateTokenResponse {
    valid: bool,
}

async fn validate_token_handler(
    State(state): State<AppState>,
    Json(req): Json<ValidateTokenRequest>,
) -> Result<Json<ValidateTokenResponse>, AppError> {
    info!(room_id = %req.room_id, "Validating room token");

    if state.registry.get(&req.room_id).is_none() {
        return Ok(Json(ValidateTokenResponse { valid: false }));
    }

    let valid = state
        .tokens
        .validate(&req.room_id, &req.token)
        .await
        .map_err(|e| {
            error!(room_id = %req.room_id, error = %e, "Token store lookup failed");
            AppError::Internal("internal error".to_string())
        })?;

    Ok(Json(ValidateTokenResponse { valid }))
}

#[derive(Deserialize)]
struct NotifyGameStartRequest {
    room_id: String,
}

#[derive(Serialize)]
struct NotifyGameStartResponse {
    success: bool,
}

async fn notify_game_start_handler(
    State(state): State<AppState>,
    Json(req): Json<NotifyGameStartRequest>,
) -> Json<NotifyGameStartResponse> {
    info!(room_id = %req.room_id, "Game start notified");
    let success = state.registry.start(&req.room_id).await;
    Json(NotifyGameStartResponse { success })
}

// ============================================================================
// Error handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Upgrade required")]
    UpgradeRequired,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match &self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg.clone()),
            AppError::UpgradeRequired => (
                StatusCode::UPGRADE_REQUIRED,
                "websocket upgrade required".to_string(),
            ),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let body = serde_json::json!({
            "error": message
        });

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::config::{Config, GameConfig, StoreBackend};
    use crate::game::{RegistrySettings, RoomRegistry};
    use crate::store::{MemoryTokenStore, ResultPublisher};

    fn test_state() -> AppState {
        let config = Config {
            server_addr: "127.0.0.1:0".parse().unwrap(),
            log_level: "debug".to_string(),
            store: StoreBackend::Memory {
                room_tokens: Vec::new(),
            },
            client_origin: "*".to_string(),
            game: GameConfig::default(),
        };
        let (publisher, _results) = ResultPublisher::channel();
        let registry = RoomRegistry::new(RegistrySettings::default(), publisher);
        let tokens = MemoryTokenStore::with_tokens([("lobby".to_string(), "abc".to_string())]);
        AppState::new(config, registry, Arc::new(tokens))
    }

    async fn post_json(app: Router, uri: &str, body: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(
                Request::post(uri)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or_default())
    }

    #[tokio::test]
    async fn health_reports_rooms() {
        let state = test_state();
        state.registry.create("lobby");
        let (status, body) = get(build_router(state.clone()), "/health").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["active_rooms"], 1);
        state.registry.clear();
    }

    #[tokio::test]
    async fn validate_token_requires_a_live_room() {
        let state = test_state();
        let body = r#"{"room_id":"lobby","token":"abc"}"#;

        let (_, missing) = post_json(build_router(state.clone()), "/rpc/validate_token", body).await;
        assert_eq!(missing["valid"], false);

        state.registry.create("lobby");
        let (status, found) = post_json(build_router(state.clone()), "/rpc/validate_token", body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(found["valid"], true);

        let wrong = r#"{"room_id":"lobby","token":"nope"}"#;
        let (_, rejected) = post_json(build_router(state.clone()), "/rpc/validate_token", wrong).await;
        assert_eq!(rejected["valid"], false);
        state.registry.clear();
    }

    #[tokio::test]
    async fn notify_game_start_reports_missing_rooms() {
        let state = test_state();
        let body = r#"{"room_id":"lobby"}"#;

        let (_, missing) = post_json(build_router(state.clone()), "/rpc/notify_game_start", body).await;
        assert_eq!(missing["success"], false);

        state.registry.create("lobby");
        let (_, started) = post_json(build_router(state.clone()), "/rpc/notify_game_start", body).await;
        assert_eq!(started["success"], true);
        state.registry.clear();
    }

    #[tokio::test]
    async fn ws_rejects_bad_params_before_upgrade() {
        let state = test_state();

        let (status, body) = get(build_router(state.clone()), "/ws?room_id=lobby").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());

        let (status, _) = get(build_router(state.clone()), "/ws?room_id=lobby&token=abc&uid=x").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = get(build_router(state.clone()), "/ws?room_id=lobby&token=bad&uid=1").await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        // Valid credentials but a plain GET
        let (status, _) = get(build_router(state), "/ws?room_id=lobby&token=abc&uid=1").await;
        assert_eq!(status, StatusCode::UPGRADE_REQUIRED);
    }
}

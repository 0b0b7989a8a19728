//! HTTP gateway for ChatMinds.
//!
//! Exposes the chat and document API under `/api` plus a health check.
//! Callers are identified by the `X-Session-Id` header; a request without
//! one gets a freshly minted session id back in the same header.
//!
//! Built on Axum.

pub mod api;
pub mod error;

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::{
    Router,
    http::{HeaderName, HeaderValue},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::get,
};
use chatminds_config::AppConfig;
use chatminds_core::message::MAX_KEY_LEN;
use chatminds_core::store::Store;
use chatminds_engine::Orchestrator;
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::error::ApiError;

/// Request and response header carrying the caller's session.
pub const SESSION_HEADER: HeaderName = HeaderName::from_static("x-session-id");

/// Uploaded documents carry their full text in the body.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Shared application state for the gateway.
pub struct GatewayState {
    pub orchestrator: Arc<Orchestrator>,
    pub store: Arc<dyn Store>,
    /// Allow any origin.
    pub permissive_cors: bool,
    /// Root for document storage paths.
    pub uploads_dir: PathBuf,
}

impl GatewayState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        let store = Arc::clone(orchestrator.store());
        Self {
            orchestrator,
            store,
            permissive_cors: false,
            uploads_dir: PathBuf::from("uploads"),
        }
    }

    pub fn with_permissive_cors(mut self, enabled: bool) -> Self {
        self.permissive_cors = enabled;
        self
    }

    pub fn with_uploads_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.uploads_dir = dir.into();
        self
    }
}

pub type SharedState = Arc<GatewayState>;

/// The caller's session id, placed in request extensions by the session layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionId(String);

impl SessionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Build the router with all gateway routes.
///
/// Layers applied:
/// - Session resolution on all /api routes
/// - Request body size limit (16 MiB)
/// - Permissive CORS when enabled in config
/// - HTTP trace logging
pub fn build_router(state: SharedState) -> Router {
    let permissive_cors = state.permissive_cors;
    let api = api::api_router(state).layer(middleware::from_fn(session_middleware));

    let router = Router::new()
        .route("/health", get(health_handler))
        .nest("/api", api)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES));

    let router = if permissive_cors {
        router.layer(CorsLayer::permissive())
    } else {
        router
    };
    router.layer(tower_http::trace::TraceLayer::new_for_http())
}

/// Start the gateway HTTP server.
///
/// Opens the store, builds the configured provider once, and shares both
/// with every request through the orchestrator.
pub async fn start(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);

    let store = Arc::new(chatminds_store::SqliteStore::new(&config.store.path).await?);
    let provider = chatminds_providers::build_from_config(&config)?;
    let orchestrator = Arc::new(Orchestrator::from_config(&config, store, provider));

    let state = Arc::new(
        GatewayState::new(orchestrator)
            .with_permissive_cors(config.gateway.permissive_cors)
            .with_uploads_dir(&config.store.uploads_dir),
    );
    let app = build_router(state);

    info!(addr = %addr, provider = %config.provider, model = %config.model, "Gateway starting");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// --- Session ---

/// Read `X-Session-Id`, minting one when absent.
///
/// A minted id is echoed back in the response header so the client can
/// reuse it.
async fn session_middleware(mut req: axum::extract::Request, next: Next) -> Result<Response, ApiError> {
    let provided = match req.headers().get(&SESSION_HEADER) {
        Some(value) => {
            let id = value
                .to_str()
                .map_err(|_| ApiError::BadRequest("X-Session-Id must be visible ASCII".into()))?
                .trim();
            if id.is_empty() || id.len() > MAX_KEY_LEN {
                return Err(ApiError::BadRequest(format!(
                    "X-Session-Id must be 1 to {MAX_KEY_LEN} characters"
                )));
            }
            Some(id.to_string())
        }
        None => None,
    };

    let minted = provided.is_none();
    let session = provided.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    req.extensions_mut().insert(SessionId(session.clone()));

    let mut response = next.run(req).await;
    if minted && let Ok(value) = HeaderValue::from_str(&session) {
        response.headers_mut().insert(SESSION_HEADER, value);
    }
    Ok(response)
}

// --- Handlers ---

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

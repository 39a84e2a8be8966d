//! Server-Sent Events (SSE) infrastructure for streaming executions
//!
//! This crate exposes the execution engine's chunk stream over HTTP. The
//! design choice of SSE over WebSockets prioritizes simplicity and HTTP/2
//! compatibility while maintaining real-time responsiveness: each chunk
//! travels as one event, consumers recognize execution boundaries by the
//! chunks' own start/end flags, and a dropped connection cancels the
//! underlying execution so a runaway process never outlives the client
//! that asked for it.

pub mod error;
pub mod sse;

pub use error::{Result, ServerError};
pub use sse::{SseEvent, SseStream};

// Re-export commonly used types from the engine
pub use runlet_chunks::{Chunk, ChunkType, Role};
pub use runlet_core::{ExecutionController, SessionRegistry};

use axum::extract::{Json as AxumJson, Path, State};
use axum::http::StatusCode;
use axum::response::{Json, Response};
use axum::routing::{get, post};
use axum::{middleware, Router};
use futures_util::Stream;
use pin_project_lite::pin_project;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::{CancellationToken, DropGuard};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use runlet_core::EngineError;

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub version: String,
}

/// Body of a `POST /run` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub language: String,
    pub code: String,
}

/// Configuration for the runlet server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Server bind address
    pub bind_addr: SocketAddr,
    /// Enable CORS
    pub enable_cors: bool,
    /// CORS allowed origins (if None, allows any origin)
    pub cors_origins: Option<Vec<String>>,
    /// Enable request logging
    pub enable_logging: bool,
    /// Keep-alive interval for SSE connections
    pub sse_keepalive_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3000".parse().unwrap(),
            enable_cors: true,
            cors_origins: None, // Allow any origin
            enable_logging: true,
            sse_keepalive_interval: Duration::from_secs(30),
        }
    }
}

impl ServerConfig {
    /// Create a new server configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the bind address.
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Parse and set the bind address from a string.
    pub fn with_bind_addr_str(mut self, addr: &str) -> Result<Self> {
        self.bind_addr = addr
            .parse()
            .map_err(|e| ServerError::config_error(format!("Invalid bind address: {}", e)))?;
        Ok(self)
    }

    /// Enable or disable CORS.
    pub fn with_cors(mut self, enable: bool) -> Self {
        self.enable_cors = enable;
        self
    }

    /// Set allowed CORS origins.
    pub fn with_cors_origins(mut self, origins: Vec<String>) -> Self {
        self.cors_origins = Some(origins);
        self
    }

    /// Enable or disable request logging.
    pub fn with_logging(mut self, enable: bool) -> Self {
        self.enable_logging = enable;
        self
    }

    /// Set SSE keep-alive interval.
    pub fn with_sse_keepalive(mut self, interval: Duration) -> Self {
        self.sse_keepalive_interval = interval;
        self
    }
}

/// Shared application state containing the controller and configuration.
#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<ExecutionController>,
    pub config: ServerConfig,
}

pin_project! {
    /// A chunk stream that cancels its execution when dropped, tying the
    /// process's lifetime to the client connection.
    struct GuardedStream<S> {
        #[pin]
        inner: S,
        _guard: DropGuard,
    }
}

impl<S> Stream for GuardedStream<S>
where
    S: Stream<Item = Chunk>,
{
    type Item = Chunk;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.project().inner.poll_next(cx)
    }
}

fn error_response(status: StatusCode, error: &ServerError) -> (StatusCode, Json<serde_json::Value>) {
    (
        status,
        Json(json!({
            "error": error.error_type(),
            "details": error.to_string(),
            "timestamp": chrono::Utc::now()
        })),
    )
}

/// Handler for the /run POST endpoint.
async fn run_handler(
    State(app_state): State<AppState>,
    AxumJson(request): AxumJson<RunRequest>,
) -> std::result::Result<Response, (StatusCode, Json<serde_json::Value>)> {
    log::info!("Received run request for language: {}", request.language);

    if request.code.trim().is_empty() {
        let err = ServerError::invalid_request("code must not be empty");
        return Err(error_response(StatusCode::BAD_REQUEST, &err));
    }

    let cancel = CancellationToken::new();
    let chunks = match app_state
        .controller
        .run(&request.language, &request.code, cancel.clone())
        .await
    {
        Ok(chunks) => chunks,
        Err(err @ EngineError::ProcessSpawnFailed { .. }) => {
            log::error!("Failed to start runtime: {}", err);
            let err = ServerError::Engine(err);
            let status = StatusCode::from_u16(err.status_code())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            return Err(error_response(status, &err));
        }
        Err(err) => {
            log::error!("Run failed before execution: {}", err);
            let err = ServerError::Engine(err);
            return Err(error_response(StatusCode::INTERNAL_SERVER_ERROR, &err));
        }
    };

    // Dropping the SSE body (client disconnect) drops the guard, which
    // cancels the execution and kills the runtime.
    let guarded = GuardedStream {
        inner: chunks,
        _guard: cancel.drop_guard(),
    };

    Ok(sse::create_sse_response(
        guarded,
        app_state.config.sse_keepalive_interval,
    ))
}

/// Handler for the /languages GET endpoint.
async fn languages_handler(State(app_state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "languages": app_state.controller.registry().languages(),
        "timestamp": chrono::Utc::now()
    }))
}

/// Handler for the /reset POST endpoint.
async fn reset_all_handler(State(app_state): State<AppState>) -> Json<serde_json::Value> {
    log::info!("Received reset request for all sessions");
    app_state.controller.registry().reset_all().await;
    Json(json!({
        "status": "success",
        "message": "All sessions reset",
        "timestamp": chrono::Utc::now()
    }))
}

/// Handler for the /reset/{language} POST endpoint.
async fn reset_language_handler(
    State(app_state): State<AppState>,
    Path(language): Path<String>,
) -> Json<serde_json::Value> {
    log::info!("Received reset request for {}", language);
    app_state.controller.registry().reset(&language).await;
    Json(json!({
        "status": "success",
        "message": format!("Session for '{}' reset", language),
        "timestamp": chrono::Utc::now()
    }))
}

/// The main runlet SSE server.
pub struct RunletServer {
    controller: Arc<ExecutionController>,
    config: ServerConfig,
}

impl RunletServer {
    /// Create a new server with the given controller and default
    /// configuration.
    pub fn new(controller: Arc<ExecutionController>) -> Self {
        Self {
            controller,
            config: ServerConfig::default(),
        }
    }

    /// Create a new server with custom configuration.
    pub fn with_config(controller: Arc<ExecutionController>, config: ServerConfig) -> Self {
        Self { controller, config }
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Build the Axum router with all routes and middleware.
    pub fn build_router(&self) -> Router {
        let state = AppState {
            controller: Arc::clone(&self.controller),
            config: self.config.clone(),
        };

        let mut router = Router::new()
            .route(
                "/health",
                get(|| async {
                    Json(HealthResponse {
                        status: "healthy".to_string(),
                        timestamp: chrono::Utc::now(),
                        version: env!("CARGO_PKG_VERSION").to_string(),
                    })
                }),
            )
            .route("/languages", get(languages_handler))
            .route("/run", post(run_handler))
            .route("/reset", post(reset_all_handler))
            .route("/reset/{language}", post(reset_language_handler))
            .with_state(state);

        if self.config.enable_logging {
            router = router.layer(middleware::from_fn(
                |request: axum::http::Request<axum::body::Body>,
                 next: axum::middleware::Next| async {
                    let method = request.method().clone();
                    let uri = request.uri().clone();
                    log::info!("Request {} {}", method, uri);

                    let start = std::time::Instant::now();
                    let response = next.run(request).await;
                    log::info!("Response {} {} completed in {:?}", method, uri, start.elapsed());

                    response
                },
            ));
        }

        router = router.layer(TraceLayer::new_for_http());

        if self.config.enable_cors {
            let cors_layer = if let Some(ref origins) = self.config.cors_origins {
                let origins: std::result::Result<Vec<_>, _> =
                    origins.iter().map(|s| s.parse()).collect();
                match origins {
                    Ok(origins) => CorsLayer::new()
                        .allow_origin(origins)
                        .allow_methods(Any)
                        .allow_headers(Any),
                    Err(_) => CorsLayer::permissive(),
                }
            } else {
                CorsLayer::permissive()
            };
            router = router.layer(cors_layer);
        }

        router
    }

    /// Start the server and listen for connections.
    ///
    /// This method will block until the server is shut down.
    pub async fn serve(self) -> Result<()> {
        let router = self.build_router();
        let listener = TcpListener::bind(self.config.bind_addr).await.map_err(|e| {
            ServerError::config_error(format!(
                "Failed to bind to {}: {}",
                self.config.bind_addr, e
            ))
        })?;

        log::info!("runlet server starting on {}", self.config.bind_addr);
        log::info!("Health check: http://{}/health", self.config.bind_addr);
        log::info!("Run endpoint: http://{}/run", self.config.bind_addr);
        log::info!("Languages: http://{}/languages", self.config.bind_addr);
        log::info!("Reset: http://{}/reset", self.config.bind_addr);

        axum::serve(listener, router)
            .await
            .map_err(|e| ServerError::internal(format!("Server error: {}", e)))?;

        Ok(())
    }

    /// Start the server with graceful shutdown support.
    pub async fn serve_with_shutdown<F>(self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let router = self.build_router();
        let listener = TcpListener::bind(self.config.bind_addr).await.map_err(|e| {
            ServerError::config_error(format!(
                "Failed to bind to {}: {}",
                self.config.bind_addr, e
            ))
        })?;

        log::info!("runlet server starting on {}", self.config.bind_addr);

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| ServerError::internal(format!("Server error: {}", e)))?;

        log::info!("runlet server stopped");
        Ok(())
    }
}

/// Wait for a Ctrl-C shutdown signal.
pub async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        log::warn!("failed to listen for shutdown signal: {}", err);
    }
    log::info!("shutdown signal received");
}

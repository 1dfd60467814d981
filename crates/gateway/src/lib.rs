//! HTTP front door for RouteCodex.
//!
//! Terminates OpenAI- and Anthropic-shaped client traffic, authenticates,
//! routes each request through `Router → Pipeline`, and bridges responses
//! (including SSE) back to the client. The engine — config, router, health
//! tracker, pipeline set — sits behind an atomic pointer so reload swaps it
//! without disturbing in-flight requests.

pub mod bridge;
pub mod clock;
pub mod handlers;

use arc_swap::ArcSwap;
use axum::{
    Router as AxumRouter,
    extract::DefaultBodyLimit,
    http::StatusCode,
    middleware::{self, Next},
    routing::{get, post},
};
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use tokio::sync::watch;

use routecodex_config::ResolvedConfig;
use routecodex_core::error::ProxyError;
use routecodex_core::event::EventBus;
use routecodex_credentials::CredentialStore;
use routecodex_health::{HealthPolicy, HealthTracker};
use routecodex_pipeline::PipelineSet;
use routecodex_router::Router;
use routecodex_snapshot::SnapshotSink;

/// Request body cap. Large enough for base64 vision payloads.
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// One immutable generation of the serving machinery. Requests pin the
/// generation they started with; reload installs a new one.
pub struct Engine {
    pub config: ResolvedConfig,
    pub router: Router,
    pub pipelines: PipelineSet,
    pub health: Arc<HealthTracker>,
}

impl Engine {
    /// Build a fresh engine from resolved config. The health tracker is
    /// carried across generations so bans survive reload; pass a new one at
    /// startup.
    pub fn build(
        config: ResolvedConfig,
        health: Arc<HealthTracker>,
        generation: u64,
    ) -> Result<Self, ProxyError> {
        let pipelines = routecodex_pipeline::build(&config, generation)?;
        let router = Router::new(
            config.routing.clone(),
            config.classifier.clone(),
            health.clone(),
        );
        Ok(Self {
            config,
            router,
            pipelines,
            health,
        })
    }

    pub fn health_policy_from_config(config: &ResolvedConfig) -> HealthPolicy {
        let h = &config.health;
        HealthPolicy::from_millis(
            h.fatal_status_codes.clone(),
            h.consecutive_error_threshold,
            h.fatal_ms,
            h.default_ms,
            &h.rate_limit_schedule_ms,
            h.reset_window_ms,
            h.blacklist_window_ms,
            h.blacklist_threshold,
            h.blacklist_duration_ms,
        )
    }
}

/// Shared state behind every handler.
pub struct AppState {
    pub engine: ArcSwap<Engine>,
    pub credentials: Arc<CredentialStore>,
    pub snapshot: SnapshotSink,
    pub events: Arc<EventBus>,
    pub clock: clock::ClockRegistry,
    pub started_at: chrono::DateTime<chrono::Utc>,
    generation: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(
        engine: Engine,
        credentials: Arc<CredentialStore>,
        snapshot: SnapshotSink,
        events: Arc<EventBus>,
    ) -> (SharedState, watch::Receiver<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let state = Arc::new(Self {
            engine: ArcSwap::from_pointee(engine),
            credentials,
            snapshot,
            events,
            clock: clock::ClockRegistry::default(),
            started_at: chrono::Utc::now(),
            generation: AtomicU64::new(1),
            shutdown_tx,
        });
        (state, shutdown_rx)
    }

    /// Atomically install a new engine. In-flight requests keep the old
    /// generation; everything that starts afterwards sees the new one.
    pub fn install_engine(&self, config: ResolvedConfig) -> Result<u64, ProxyError> {
        let generation = self
            .generation
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
            + 1;
        let health = self.engine.load().health.clone();
        self.credentials.load_profiles(&config.providers);
        let engine = Engine::build(config, health, generation)?;
        self.engine.store(Arc::new(engine));
        self.events.publish(routecodex_core::event::ProxyEvent::ConfigReloaded {
            generation,
            timestamp: chrono::Utc::now(),
        });
        tracing::info!(generation, "engine reloaded");
        Ok(generation)
    }

    /// Trigger graceful shutdown. Idempotent.
    pub fn request_shutdown(&self) {
        self.events
            .publish(routecodex_core::event::ProxyEvent::ShutdownRequested {
                timestamp: chrono::Utc::now(),
            });
        let _ = self.shutdown_tx.send(true);
    }
}

/// Build the full axum application.
pub fn build_app(state: SharedState) -> AxumRouter {
    AxumRouter::new()
        // OpenAI surface
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/v1/completions", post(handlers::completions))
        .route("/v1/models", get(handlers::list_models))
        // Anthropic surface
        .route("/v1/messages", post(handlers::messages))
        // Operational surface
        .route("/health", get(handlers::health))
        .route("/ready", get(handlers::ready))
        .route("/shutdown", post(handlers::shutdown))
        .route("/daemon/clock/{action}", post(clock::clock_action))
        .route("/daemon/clock-client/register", post(clock::client_register))
        .route(
            "/daemon/clock-client/unregister",
            post(clock::client_unregister),
        )
        .route("/daemon/clock-client/list", get(clock::client_list))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until the shutdown signal fires.
pub async fn serve(
    state: SharedState,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), std::io::Error> {
    let (host, port) = {
        let engine = state.engine.load();
        (engine.config.http.host.clone(), engine.config.http.port)
    };
    let listener = tokio::net::TcpListener::bind((host.as_str(), port)).await?;
    tracing::info!(%host, port, "front door listening");

    state.snapshot.record(routecodex_snapshot::SnapshotEvent::Lifecycle {
        kind: "server-start".into(),
        detail: serde_json::json!({"host": host, "port": port}),
    });

    let app = build_app(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.wait_for(|stopped| *stopped).await;
        })
        .await
}

/// API-key auth: when the config lists keys, require `X-API-Key` or
/// `Authorization: Bearer`. Liveness endpoints stay open.
async fn auth_middleware(
    axum::extract::State(state): axum::extract::State<SharedState>,
    req: axum::extract::Request,
    next: Next,
) -> Result<axum::response::Response, StatusCode> {
    let path = req.uri().path();
    if path == "/health" || path == "/ready" {
        return Ok(next.run(req).await);
    }

    let keys = {
        let engine = state.engine.load();
        engine.config.http.api_keys.clone()
    };
    if keys.is_empty() {
        return Ok(next.run(req).await);
    }

    let presented = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .or_else(|| {
            req.headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(String::from)
        });

    match presented {
        Some(key) if keys.contains(&key) => Ok(next.run(req).await),
        _ => {
            tracing::warn!(path, "request rejected: missing or invalid API key");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

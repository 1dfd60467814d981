//! The RouteCodex guardian daemon.
//!
//! A process-local HTTP server on an ephemeral localhost port that acts as
//! the single-host registry and lifecycle gate for sibling proxy processes.
//! Every endpoint authenticates via `X-Rcc-Guardian-Token`; `/stop`
//! additionally requires the separate stop token. `SIGINT`/`SIGTERM` are
//! deliberately not wired to shutdown — only the stop endpoint terminates
//! the daemon, which then deletes its state file if still owned.

pub mod state;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    routing::{get, post},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

pub use state::{GuardianState, LifecycleRecord, Registration};

/// Auth header carrying the session token.
pub const TOKEN_HEADER: &str = "x-rcc-guardian-token";
/// Second factor required by `/stop`.
pub const STOP_TOKEN_HEADER: &str = "x-rcc-guardian-stop-token";

/// Request body cap: registrations and lifecycle payloads are tiny.
const MAX_BODY_BYTES: usize = 256 * 1024;
/// Periodic persistence interval.
const PERSIST_INTERVAL_SECS: u64 = 10;

#[derive(Debug, thiserror::Error)]
pub enum GuardianError {
    #[error("failed to bind guardian listener: {0}")]
    Bind(String),

    #[error("failed to persist guardian state: {0}")]
    Persist(String),
}

struct Shared {
    state: Mutex<GuardianState>,
    state_path: PathBuf,
    stop_tx: watch::Sender<bool>,
}

impl Shared {
    fn persist(&self) {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(err) = state.persist(&self.state_path) {
            tracing::error!(error = %err, "guardian state persist failed");
        }
    }
}

/// A running guardian. Dropping the handle does not stop the daemon; use
/// [`GuardianHandle::port`] + the stop endpoint, or abort the join handle.
pub struct GuardianHandle {
    pub port: u16,
    pub token: String,
    pub stop_token: String,
    shared: Arc<Shared>,
    server: tokio::task::JoinHandle<()>,
    persister: tokio::task::JoinHandle<()>,
}

impl GuardianHandle {
    /// Wait for the daemon to terminate (stop endpoint hit).
    pub async fn join(self) {
        let _ = self.server.await;
        self.persister.abort();

        // Final persist happened before shutdown; now clean up ownership.
        let pid = std::process::id();
        match GuardianState::delete_if_owned(&self.shared.state_path, pid) {
            Ok(true) => tracing::info!("guardian state file removed"),
            Ok(false) => tracing::debug!("guardian state file not owned by this pid, kept"),
            Err(err) => tracing::warn!(error = %err, "guardian state cleanup failed"),
        }
    }

    /// Abort without the stop handshake (tests, supervisor teardown).
    pub fn abort(&self) {
        self.server.abort();
        self.persister.abort();
    }
}

/// Start the guardian on an ephemeral localhost port.
pub async fn start(state_dir: PathBuf) -> Result<GuardianHandle, GuardianError> {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0))
        .await
        .map_err(|e| GuardianError::Bind(e.to_string()))?;
    let port = listener
        .local_addr()
        .map_err(|e| GuardianError::Bind(e.to_string()))?
        .port();

    let state = GuardianState::new(std::process::id(), port);
    let token = state.token.clone();
    let stop_token = state.stop_token.clone();
    let state_path = state_dir.join("guardian.state.json");
    state
        .persist(&state_path)
        .map_err(|e| GuardianError::Persist(e.to_string()))?;

    let (stop_tx, mut stop_rx) = watch::channel(false);
    let shared = Arc::new(Shared {
        state: Mutex::new(state),
        state_path,
        stop_tx,
    });

    let app = router(shared.clone());
    let server_shared = shared.clone();
    let server = tokio::spawn(async move {
        let shutdown = async move {
            let _ = stop_rx.wait_for(|stopped| *stopped).await;
        };
        if let Err(err) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            tracing::error!(error = %err, "guardian server error");
        }
        server_shared.persist();
    });

    let persist_shared = shared.clone();
    let persister = tokio::spawn(async move {
        let mut tick =
            tokio::time::interval(tokio::time::Duration::from_secs(PERSIST_INTERVAL_SECS));
        tick.tick().await;
        loop {
            tick.tick().await;
            persist_shared.persist();
        }
    });

    tracing::info!(port, "guardian daemon listening");

    Ok(GuardianHandle {
        port,
        token,
        stop_token,
        shared,
        server,
        persister,
    })
}

fn router(shared: Arc<Shared>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/register", post(register_handler))
        .route("/lifecycle", post(lifecycle_handler))
        .route("/stop", post(stop_handler))
        .layer(middleware::from_fn_with_state(shared.clone(), auth_middleware))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(shared)
}

/// Every route requires the session token; `/stop` checks its second factor
/// in the handler so a missing stop token yields 403 (not 401).
async fn auth_middleware(
    State(shared): State<Arc<Shared>>,
    req: axum::extract::Request,
    next: Next,
) -> Result<axum::response::Response, StatusCode> {
    let presented = req
        .headers()
        .get(TOKEN_HEADER)
        .and_then(|v| v.to_str().ok());
    let expected = {
        let state = shared.state.lock().unwrap_or_else(|e| e.into_inner());
        state.token.clone()
    };
    match presented {
        Some(t) if t == expected => Ok(next.run(req).await),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    pid: u32,
    registrations: usize,
    uptime_secs: i64,
}

async fn health_handler(State(shared): State<Arc<Shared>>) -> Json<HealthResponse> {
    let state = shared.state.lock().unwrap_or_else(|e| e.into_inner());
    Json(HealthResponse {
        status: "ok",
        pid: state.pid,
        registrations: state.registrations.len(),
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
    })
}

#[derive(Deserialize)]
struct RegisterRequest {
    source: String,
    pid: u32,
    ppid: u32,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default, rename = "tmuxSessionId")]
    tmux_session_id: Option<String>,
    #[serde(default, rename = "tmuxTarget")]
    tmux_target: Option<String>,
    #[serde(default)]
    metadata: Option<Value>,
}

#[derive(Serialize)]
struct RegisterResponse {
    registered: String,
    count: usize,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

async fn register_handler(
    State(shared): State<Arc<Shared>>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, (StatusCode, Json<ErrorResponse>)> {
    if req.pid <= 1 || req.ppid == 0 {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: format!("implausible pid {} / ppid {}", req.pid, req.ppid),
            }),
        ));
    }
    if req.source.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "source is required".into(),
            }),
        ));
    }

    let key = format!("{}:{}", req.source, req.pid);
    let count = {
        let mut state = shared.state.lock().unwrap_or_else(|e| e.into_inner());
        let now = Utc::now();
        state.register(Registration {
            source: req.source,
            pid: req.pid,
            ppid: req.ppid,
            port: req.port,
            tmux_session_id: req.tmux_session_id,
            tmux_target: req.tmux_target,
            metadata: req.metadata,
            registered_at: now,
            updated_at: now,
        });
        state.registrations.len()
    };
    shared.persist();

    Ok(Json(RegisterResponse {
        registered: key,
        count,
    }))
}

#[derive(Deserialize)]
struct LifecycleRequest {
    action: String,
    source: String,
    #[serde(rename = "actorPid")]
    actor_pid: u32,
    #[serde(default, rename = "targetPid")]
    target_pid: Option<u32>,
    #[serde(default)]
    signal: Option<String>,
    #[serde(default)]
    metadata: Option<Value>,
}

#[derive(Serialize)]
struct LifecycleResponse {
    recorded: bool,
    records: usize,
}

async fn lifecycle_handler(
    State(shared): State<Arc<Shared>>,
    Json(req): Json<LifecycleRequest>,
) -> Json<LifecycleResponse> {
    let records = {
        let mut state = shared.state.lock().unwrap_or_else(|e| e.into_inner());
        state.record_lifecycle(LifecycleRecord {
            action: req.action,
            source: req.source,
            actor_pid: req.actor_pid,
            target_pid: req.target_pid,
            signal: req.signal,
            metadata: req.metadata,
            timestamp: Utc::now(),
        });
        state.lifecycle_records.len()
    };
    shared.persist();

    Json(LifecycleResponse {
        recorded: true,
        records,
    })
}

async fn stop_handler(
    State(shared): State<Arc<Shared>>,
    headers: HeaderMap,
) -> Result<Json<Value>, StatusCode> {
    let presented = headers
        .get(STOP_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok());
    let expected = {
        let state = shared.state.lock().unwrap_or_else(|e| e.into_inner());
        state.stop_token.clone()
    };
    match presented {
        Some(t) if t == expected => {
            tracing::info!("guardian stop requested, shutting down");
            shared.persist();
            let _ = shared.stop_tx.send(true);
            Ok(Json(serde_json::json!({ "stopping": true })))
        }
        _ => Err(StatusCode::FORBIDDEN),
    }
}

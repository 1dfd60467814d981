//! The `/daemon/clock*` operational surface.
//!
//! Sibling CLI processes use these endpoints to coordinate a shared wake-up
//! clock: one clock daemon per proxy, plus a registry of clock clients.
//! State is in-memory; it exists to give the CLI commands something to talk
//! to, not to survive restarts.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::SharedState;

#[derive(Debug, Clone, Serialize)]
pub struct ClockClient {
    pub id: String,
    pub pid: u32,
    pub interval_ms: u64,
    pub registered_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct ClockRegistry {
    running_since: Mutex<Option<DateTime<Utc>>>,
    clients: Mutex<BTreeMap<String, ClockClient>>,
}

impl ClockRegistry {
    fn status(&self) -> serde_json::Value {
        let running = self.running_since.lock().unwrap_or_else(|e| e.into_inner());
        let clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        serde_json::json!({
            "running": running.is_some(),
            "since": running.map(|t| t.to_rfc3339()),
            "clients": clients.len(),
        })
    }
}

/// `POST /daemon/clock/{start|stop|status}`.
pub async fn clock_action(
    State(state): State<SharedState>,
    Path(action): Path<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let registry = &state.clock;
    match action.as_str() {
        "start" => {
            let mut running = registry
                .running_since
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if running.is_none() {
                *running = Some(Utc::now());
            }
            drop(running);
            Ok(Json(registry.status()))
        }
        "stop" => {
            *registry
                .running_since
                .lock()
                .unwrap_or_else(|e| e.into_inner()) = None;
            Ok(Json(registry.status()))
        }
        "status" => Ok(Json(registry.status())),
        _ => Err(StatusCode::NOT_FOUND),
    }
}

#[derive(Deserialize)]
pub struct RegisterClientRequest {
    #[serde(default)]
    id: Option<String>,
    pid: u32,
    #[serde(default = "default_interval_ms", rename = "intervalMs")]
    interval_ms: u64,
}

fn default_interval_ms() -> u64 {
    60_000
}

/// `POST /daemon/clock-client/register`.
pub async fn client_register(
    State(state): State<SharedState>,
    Json(req): Json<RegisterClientRequest>,
) -> Json<serde_json::Value> {
    let id = req.id.unwrap_or_else(|| format!("client-{}", req.pid));
    let client = ClockClient {
        id: id.clone(),
        pid: req.pid,
        interval_ms: req.interval_ms,
        registered_at: Utc::now(),
    };
    let count = {
        let mut clients = state
            .clock
            .clients
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        clients.insert(id.clone(), client);
        clients.len()
    };
    Json(serde_json::json!({"registered": id, "clients": count}))
}

#[derive(Deserialize)]
pub struct UnregisterClientRequest {
    id: String,
}

/// `POST /daemon/clock-client/unregister`.
pub async fn client_unregister(
    State(state): State<SharedState>,
    Json(req): Json<UnregisterClientRequest>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let mut clients = state
        .clock
        .clients
        .lock()
        .unwrap_or_else(|e| e.into_inner());
    if clients.remove(&req.id).is_none() {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(Json(
        serde_json::json!({"unregistered": req.id, "clients": clients.len()}),
    ))
}

/// `GET /daemon/clock-client/list`.
pub async fn client_list(State(state): State<SharedState>) -> Json<serde_json::Value> {
    let clients = state
        .clock
        .clients
        .lock()
        .unwrap_or_else(|e| e.into_inner());
    let list: Vec<&ClockClient> = clients.values().collect();
    Json(serde_json::json!({"clients": list, "count": list.len()}))
}

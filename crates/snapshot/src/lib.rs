//! Opt-in snapshot capture for RouteCodex.
//!
//! When enabled (`ROUTECODEX_SNAPSHOT=1` or `--mode analysis`), each request
//! leaves a trail under `~/.routecodex/codex-samples/<session>/`: the client
//! envelope, the canonical form, the upstream request and response, the SSE
//! transcript (separately gated), and the final response. Lifecycle events
//! append to `events.jsonl`. Writes are fire-and-forget through an mpsc
//! channel so the hot path never blocks on disk.

pub mod rotate;

use chrono::Utc;
use serde_json::Value;
use std::path::PathBuf;
use tokio::sync::mpsc;

pub use rotate::RotatingLog;

/// Capture configuration, typically read from the environment.
#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    pub enabled: bool,
    /// SSE transcripts are large; they get their own gate.
    pub capture_stream: bool,
    /// Root directory for session dirs.
    pub root: PathBuf,
}

impl SnapshotConfig {
    pub fn from_env(home: &std::path::Path) -> Self {
        let flag = |name: &str| {
            std::env::var(name)
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false)
        };
        Self {
            enabled: flag("ROUTECODEX_SNAPSHOT"),
            capture_stream: flag("ROUTECODEX_CAPTURE_STREAM_SNAPSHOTS"),
            root: home.join("codex-samples"),
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            capture_stream: false,
            root: PathBuf::new(),
        }
    }
}

/// One capture event.
#[derive(Debug)]
pub enum SnapshotEvent {
    /// The request exactly as the client sent it.
    RequestEnvelope { request_id: String, payload: Value },
    /// After the LLMSwitch normalized it.
    Canonical { request_id: String, payload: Value },
    /// What went out to the provider.
    UpstreamRequest { request_id: String, payload: Value },
    /// Non-streaming upstream response body.
    UpstreamResponse { request_id: String, payload: Value },
    /// One raw SSE frame from the upstream.
    SseChunk { request_id: String, data: String },
    /// What went back to the client.
    FinalResponse { request_id: String, payload: Value },
    /// Server lifecycle (start, reload, shutdown, routing failures).
    Lifecycle { kind: String, detail: Value },
}

/// The capture sink. Cheap to clone; a disabled sink drops everything
/// without allocating.
#[derive(Clone)]
pub struct SnapshotSink {
    tx: Option<mpsc::Sender<SnapshotEvent>>,
    capture_stream: bool,
    session_dir: Option<PathBuf>,
}

impl SnapshotSink {
    /// A sink that records nothing.
    pub fn disabled() -> Self {
        Self {
            tx: None,
            capture_stream: false,
            session_dir: None,
        }
    }

    /// Start a session writer. Creates the per-session directory eagerly so
    /// misconfigured paths surface at startup, not mid-request.
    pub fn start(config: &SnapshotConfig) -> std::io::Result<Self> {
        if !config.enabled {
            return Ok(Self::disabled());
        }

        let session_id = format!(
            "{}-{}",
            Utc::now().format("%Y%m%d-%H%M%S"),
            &uuid::Uuid::new_v4().to_string()[..8]
        );
        let session_dir = config.root.join(session_id);
        std::fs::create_dir_all(&session_dir)?;

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(writer_task(session_dir.clone(), rx));

        tracing::info!(dir = %session_dir.display(), "snapshot capture enabled");
        Ok(Self {
            tx: Some(tx),
            capture_stream: config.capture_stream,
            session_dir: Some(session_dir),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    pub fn capture_stream(&self) -> bool {
        self.capture_stream
    }

    pub fn session_dir(&self) -> Option<&PathBuf> {
        self.session_dir.as_ref()
    }

    /// Queue an event. A full queue drops the snapshot rather than stalling
    /// the request path.
    pub fn record(&self, event: SnapshotEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        if matches!(&event, SnapshotEvent::SseChunk { .. }) && !self.capture_stream {
            return;
        }
        if let Err(err) = tx.try_send(event) {
            tracing::debug!(error = %err, "snapshot queue full, event dropped");
        }
    }
}

async fn writer_task(session_dir: PathBuf, mut rx: mpsc::Receiver<SnapshotEvent>) {
    let mut events_log = RotatingLog::standard(session_dir.join("events.jsonl"));

    while let Some(event) = rx.recv().await {
        let result = match event {
            SnapshotEvent::RequestEnvelope { request_id, payload } => {
                write_json(&session_dir, &request_id, "request", &payload)
            }
            SnapshotEvent::Canonical { request_id, payload } => {
                write_json(&session_dir, &request_id, "canonical", &payload)
            }
            SnapshotEvent::UpstreamRequest { request_id, payload } => {
                write_json(&session_dir, &request_id, "upstream", &payload)
            }
            SnapshotEvent::UpstreamResponse { request_id, payload } => {
                write_json(&session_dir, &request_id, "upstream-response", &payload)
            }
            SnapshotEvent::FinalResponse { request_id, payload } => {
                write_json(&session_dir, &request_id, "response", &payload)
            }
            SnapshotEvent::SseChunk { request_id, data } => {
                append_line(&session_dir, &request_id, &data)
            }
            SnapshotEvent::Lifecycle { kind, detail } => {
                let line = serde_json::json!({
                    "ts": Utc::now().to_rfc3339(),
                    "kind": kind,
                    "detail": detail,
                });
                events_log.write_line(&line.to_string())
            }
        };
        if let Err(err) = result {
            tracing::warn!(error = %err, "snapshot write failed");
        }
    }
}

fn write_json(
    dir: &std::path::Path,
    request_id: &str,
    stage: &str,
    payload: &Value,
) -> std::io::Result<()> {
    let path = dir.join(format!("{request_id}.{stage}.json"));
    let pretty = serde_json::to_string_pretty(payload)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    std::fs::write(path, pretty)
}

fn append_line(dir: &std::path::Path, request_id: &str, data: &str) -> std::io::Result<()> {
    use std::io::Write;
    let path = dir.join(format!("{request_id}.sse.log"));
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    file.write_all(data.as_bytes())?;
    file.write_all(b"\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &std::path::Path, stream: bool) -> SnapshotConfig {
        SnapshotConfig {
            enabled: true,
            capture_stream: stream,
            root: dir.to_path_buf(),
        }
    }

    #[tokio::test]
    async fn disabled_sink_records_nothing() {
        let sink = SnapshotSink::disabled();
        assert!(!sink.is_enabled());
        sink.record(SnapshotEvent::Lifecycle {
            kind: "start".into(),
            detail: Value::Null,
        });
    }

    #[tokio::test]
    async fn request_stages_land_in_session_dir() {
        let dir = tempfile::tempdir().unwrap();
        let sink = SnapshotSink::start(&config(dir.path(), false)).unwrap();
        let session = sink.session_dir().unwrap().clone();

        sink.record(SnapshotEvent::RequestEnvelope {
            request_id: "req-1".into(),
            payload: serde_json::json!({"model": "gpt-4o-mini"}),
        });
        sink.record(SnapshotEvent::FinalResponse {
            request_id: "req-1".into(),
            payload: serde_json::json!({"ok": true}),
        });

        // Let the writer task drain.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let envelope = std::fs::read_to_string(session.join("req-1.request.json")).unwrap();
        assert!(envelope.contains("gpt-4o-mini"));
        assert!(session.join("req-1.response.json").exists());
    }

    #[tokio::test]
    async fn sse_chunks_respect_stream_gate() {
        let dir = tempfile::tempdir().unwrap();

        let gated = SnapshotSink::start(&config(dir.path(), false)).unwrap();
        let gated_dir = gated.session_dir().unwrap().clone();
        gated.record(SnapshotEvent::SseChunk {
            request_id: "req-1".into(),
            data: "data: {}".into(),
        });

        let open = SnapshotSink::start(&config(dir.path(), true)).unwrap();
        let open_dir = open.session_dir().unwrap().clone();
        open.record(SnapshotEvent::SseChunk {
            request_id: "req-1".into(),
            data: "data: {\"delta\":\"hi\"}".into(),
        });

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        assert!(!gated_dir.join("req-1.sse.log").exists());
        let transcript = std::fs::read_to_string(open_dir.join("req-1.sse.log")).unwrap();
        assert!(transcript.contains("delta"));
    }

    #[tokio::test]
    async fn lifecycle_events_append_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let sink = SnapshotSink::start(&config(dir.path(), false)).unwrap();
        let session = sink.session_dir().unwrap().clone();

        sink.record(SnapshotEvent::Lifecycle {
            kind: "server-start".into(),
            detail: serde_json::json!({"port": 5555}),
        });
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let events = std::fs::read_to_string(session.join("events.jsonl")).unwrap();
        let line: Value = serde_json::from_str(events.lines().next().unwrap()).unwrap();
        assert_eq!(line["kind"], "server-start");
        assert_eq!(line["detail"]["port"], 5555);
    }

    #[test]
    fn env_config_parses_flags() {
        unsafe {
            std::env::set_var("ROUTECODEX_SNAPSHOT", "1");
            std::env::remove_var("ROUTECODEX_CAPTURE_STREAM_SNAPSHOTS");
        }
        let cfg = SnapshotConfig::from_env(std::path::Path::new("/tmp/rcx-home"));
        assert!(cfg.enabled);
        assert!(!cfg.capture_stream);
        assert!(cfg.root.ends_with("codex-samples"));
        unsafe { std::env::remove_var("ROUTECODEX_SNAPSHOT") };
    }
}

//! Guardian persisted state.
//!
//! A single JSON file under `~/.routecodex/` holds the daemon's identity
//! (pid, port, tokens) and its registry. Writes go through temp+rename so a
//! crashed writer never leaves a torn file behind.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

/// Lifecycle records kept in the ring buffer.
pub const MAX_LIFECYCLE_RECORDS: usize = 200;

/// A sibling process registration, keyed `source:pid`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registration {
    pub source: String,
    pub pid: u32,
    pub ppid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tmux_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tmux_target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One lifecycle action observed across the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleRecord {
    pub action: String,
    pub source: String,
    pub actor_pid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

/// The full persisted state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardianState {
    pub pid: u32,
    pub port: u16,
    pub token: String,
    pub stop_token: String,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub registrations: BTreeMap<String, Registration>,
    #[serde(default)]
    pub lifecycle_records: Vec<LifecycleRecord>,
}

impl GuardianState {
    pub fn new(pid: u32, port: u16) -> Self {
        let now = Utc::now();
        Self {
            pid,
            port,
            token: uuid::Uuid::new_v4().to_string(),
            stop_token: uuid::Uuid::new_v4().to_string(),
            started_at: now,
            updated_at: now,
            registrations: BTreeMap::new(),
            lifecycle_records: Vec::new(),
        }
    }

    /// Upsert a registration under `source:pid`.
    pub fn register(&mut self, mut registration: Registration) {
        let key = format!("{}:{}", registration.source, registration.pid);
        let now = Utc::now();
        registration.updated_at = now;
        if let Some(existing) = self.registrations.get(&key) {
            registration.registered_at = existing.registered_at;
        }
        self.registrations.insert(key, registration);
        self.updated_at = now;
    }

    /// Append to the lifecycle ring buffer, dropping the oldest entries.
    pub fn record_lifecycle(&mut self, record: LifecycleRecord) {
        self.lifecycle_records.push(record);
        if self.lifecycle_records.len() > MAX_LIFECYCLE_RECORDS {
            let excess = self.lifecycle_records.len() - MAX_LIFECYCLE_RECORDS;
            self.lifecycle_records.drain(..excess);
        }
        self.updated_at = Utc::now();
    }

    pub fn load(path: &Path) -> std::io::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Atomic persist: temp file in the same directory, then rename.
    pub fn persist(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, contents)?;
        std::fs::rename(&tmp, path)
    }

    /// Delete the state file, but only when it still records this pid — a
    /// newer guardian instance owns the file otherwise.
    pub fn delete_if_owned(path: &Path, own_pid: u32) -> std::io::Result<bool> {
        match Self::load(path) {
            Ok(state) if state.pid == own_pid => {
                std::fs::remove_file(path)?;
                Ok(true)
            }
            Ok(_) => Ok(false),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration(source: &str, pid: u32) -> Registration {
        let now = Utc::now();
        Registration {
            source: source.into(),
            pid,
            ppid: 1,
            port: None,
            tmux_session_id: None,
            tmux_target: None,
            metadata: None,
            registered_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn register_upserts_by_source_pid() {
        let mut state = GuardianState::new(100, 9000);
        state.register(registration("rcc", 42));
        state.register(registration("rcc", 42));
        state.register(registration("rcc", 43));
        assert_eq!(state.registrations.len(), 2);
        assert!(state.registrations.contains_key("rcc:42"));
    }

    #[test]
    fn reregistration_keeps_original_registered_at() {
        let mut state = GuardianState::new(100, 9000);
        let mut first = registration("rcc", 42);
        first.registered_at = Utc::now() - chrono::Duration::hours(1);
        let original = first.registered_at;
        state.register(first);
        state.register(registration("rcc", 42));
        assert_eq!(state.registrations["rcc:42"].registered_at, original);
    }

    #[test]
    fn lifecycle_ring_buffer_caps_at_200() {
        let mut state = GuardianState::new(100, 9000);
        for i in 0..250u32 {
            state.record_lifecycle(LifecycleRecord {
                action: "start".into(),
                source: "rcc".into(),
                actor_pid: i,
                target_pid: None,
                signal: None,
                metadata: None,
                timestamp: Utc::now(),
            });
        }
        assert_eq!(state.lifecycle_records.len(), MAX_LIFECYCLE_RECORDS);
        // Oldest entries were dropped.
        assert_eq!(state.lifecycle_records[0].actor_pid, 50);
    }

    #[test]
    fn persist_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("guardian.state.json");
        let mut state = GuardianState::new(100, 9000);
        state.register(registration("rcc", 42));
        state.persist(&path).unwrap();
        assert!(!path.with_extension("tmp").exists());

        let loaded = GuardianState::load(&path).unwrap();
        assert_eq!(loaded.pid, 100);
        assert_eq!(loaded.token, state.token);
        assert_eq!(loaded.registrations.len(), 1);
    }

    #[test]
    fn delete_only_when_owned() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("guardian.state.json");
        GuardianState::new(4242, 9000).persist(&path).unwrap();

        assert!(!GuardianState::delete_if_owned(&path, 9999).unwrap());
        assert!(path.exists());
        assert!(GuardianState::delete_if_owned(&path, 4242).unwrap());
        assert!(!path.exists());
        // Idempotent on a missing file.
        assert!(!GuardianState::delete_if_owned(&path, 4242).unwrap());
    }
}

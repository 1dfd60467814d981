//! Credential resolution for RouteCodex.
//!
//! The store maps `(providerId, alias)` to in-memory [`CredentialRecord`]s
//! with copy-on-refresh semantics: a refresh installs a new `Arc`d record and
//! bumps the version; readers holding the old `Arc` keep a consistent view.
//! Secrets never leave process memory and are redacted from `Debug` output.

pub mod oauth;

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use routecodex_core::event::{EventBus, ProxyEvent};
use routecodex_core::profile::{AuthMode, CredentialSpec, ProviderProfile};

pub use oauth::{TokenFile, TokenFileError};

/// Where a record's secret came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSource {
    Inline,
    Env { var: String },
    File { path: PathBuf },
    OAuth { token_file: PathBuf },
}

/// One resolved credential. Immutable once published; refreshes install a
/// replacement with a higher version.
#[derive(Clone)]
pub struct CredentialRecord {
    pub provider: String,
    pub alias: String,
    pub auth_mode: AuthMode,
    pub secret: String,
    pub source: CredentialSource,
    pub expires_at: Option<DateTime<Utc>>,
    pub refresh_token: Option<String>,
    /// Strictly increasing per `(provider, alias)`.
    pub version: u64,
    pub healthy: bool,
}

impl std::fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("provider", &self.provider)
            .field("alias", &self.alias)
            .field("auth_mode", &self.auth_mode)
            .field("secret", &"[REDACTED]")
            .field("source", &self.source)
            .field("expires_at", &self.expires_at)
            .field("version", &self.version)
            .field("healthy", &self.healthy)
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("no credential '{alias}' declared for provider '{provider}'")]
    NotFound { provider: String, alias: String },

    #[error("credential '{provider}.{alias}' unavailable: {reason}")]
    Unavailable {
        provider: String,
        alias: String,
        reason: String,
    },
}

type Key = (String, String);

struct Entry {
    spec: CredentialSpec,
    auth_mode: AuthMode,
    record: Option<Arc<CredentialRecord>>,
    /// Highest version ever issued for this key. Survives cache
    /// invalidation and reloads so versions stay strictly increasing.
    last_version: u64,
}

/// The credential store. One per process; shared by pipelines and daemons.
pub struct CredentialStore {
    entries: RwLock<HashMap<Key, Entry>>,
    events: Arc<EventBus>,
}

impl CredentialStore {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Install credential specs from resolved provider profiles. Called at
    /// startup and on reload; existing records keep their versions when the
    /// spec is unchanged.
    pub fn load_profiles(&self, providers: &BTreeMap<String, ProviderProfile>) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let mut live: Vec<Key> = Vec::new();

        for profile in providers.values() {
            for (alias, spec) in &profile.credentials {
                let key = (profile.id.clone(), alias.clone());
                live.push(key.clone());
                match entries.get_mut(&key) {
                    Some(entry) if entry.spec == *spec => {
                        entry.auth_mode = profile.auth_mode;
                    }
                    Some(entry) => {
                        entry.spec = spec.clone();
                        entry.auth_mode = profile.auth_mode;
                        entry.record = None;
                    }
                    None => {
                        entries.insert(
                            key,
                            Entry {
                                spec: spec.clone(),
                                auth_mode: profile.auth_mode,
                                record: None,
                                last_version: 0,
                            },
                        );
                    }
                }
            }
        }

        entries.retain(|key, _| live.contains(key));
    }

    /// Resolve a credential. Env-backed entries re-read the variable on
    /// every call; file-backed entries cache until invalidated; OAuth
    /// entries read the token file lazily until the daemon installs fresher
    /// material.
    pub fn resolve(
        &self,
        provider: &str,
        alias: &str,
    ) -> Result<Arc<CredentialRecord>, CredentialError> {
        let key = (provider.to_string(), alias.to_string());

        // Fast path under the read lock: cached healthy record for sources
        // that do not require a re-read.
        {
            let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
            let entry = entries.get(&key).ok_or_else(|| CredentialError::NotFound {
                provider: provider.into(),
                alias: alias.into(),
            })?;
            if let Some(record) = &entry.record {
                let fresh = match &entry.spec {
                    CredentialSpec::Env { var } => std::env::var(var)
                        .map(|v| v == record.secret)
                        .unwrap_or(false),
                    _ => true,
                };
                if fresh && record.healthy {
                    return Ok(record.clone());
                }
            }
        }

        self.rebuild(&key)
    }

    /// Build (or rebuild) the record for `key` from its spec and publish it.
    fn rebuild(&self, key: &Key) -> Result<Arc<CredentialRecord>, CredentialError> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let entry = entries.get_mut(key).ok_or_else(|| CredentialError::NotFound {
            provider: key.0.clone(),
            alias: key.1.clone(),
        })?;

        let next_version = entry.last_version + 1;
        let (provider, alias) = (key.0.clone(), key.1.clone());

        let built = match &entry.spec {
            CredentialSpec::Inline { value } => Ok(CredentialRecord {
                provider,
                alias,
                auth_mode: entry.auth_mode,
                secret: value.clone(),
                source: CredentialSource::Inline,
                expires_at: None,
                refresh_token: None,
                version: next_version,
                healthy: !value.is_empty(),
            }),
            CredentialSpec::Env { var } => match std::env::var(var) {
                Ok(value) if !value.is_empty() => Ok(CredentialRecord {
                    provider,
                    alias,
                    auth_mode: entry.auth_mode,
                    secret: value,
                    source: CredentialSource::Env { var: var.clone() },
                    expires_at: None,
                    refresh_token: None,
                    version: next_version,
                    healthy: true,
                }),
                _ => Err(format!("environment variable '{var}' is not set")),
            },
            CredentialSpec::File { path } => {
                let path = PathBuf::from(path);
                read_key_file(&path).map(|secret| CredentialRecord {
                    provider,
                    alias,
                    auth_mode: entry.auth_mode,
                    secret,
                    source: CredentialSource::File { path },
                    expires_at: None,
                    refresh_token: None,
                    version: next_version,
                    healthy: true,
                })
            }
            CredentialSpec::OAuth { token_file } => {
                let path = PathBuf::from(token_file);
                TokenFile::read(&path)
                    .map_err(|e| e.to_string())
                    .map(|token| CredentialRecord {
                        provider,
                        alias,
                        auth_mode: entry.auth_mode,
                        secret: token.access_token.clone(),
                        source: CredentialSource::OAuth { token_file: path },
                        expires_at: token.expires_at(),
                        refresh_token: token.refresh_token.clone(),
                        version: next_version,
                        healthy: true,
                    })
            }
        };

        match built {
            Ok(record) => {
                let record = Arc::new(record);
                entry.record = Some(record.clone());
                entry.last_version = next_version;
                Ok(record)
            }
            Err(reason) => {
                // Keep an unhealthy marker so repeated resolves stay cheap
                // but never panic. The target is skipped by the router.
                entry.record = Some(Arc::new(CredentialRecord {
                    provider: key.0.clone(),
                    alias: key.1.clone(),
                    auth_mode: entry.auth_mode,
                    secret: String::new(),
                    source: CredentialSource::Inline,
                    expires_at: None,
                    refresh_token: None,
                    version: next_version,
                    healthy: false,
                }));
                entry.last_version = next_version;
                Err(CredentialError::Unavailable {
                    provider: key.0.clone(),
                    alias: key.1.clone(),
                    reason,
                })
            }
        }
    }

    /// Install refreshed OAuth material. Called by the token daemon after an
    /// atomic token-file write; bumps the version and broadcasts the change.
    pub fn install_oauth(&self, provider: &str, alias: &str, token: &TokenFile) -> Option<u64> {
        let key = (provider.to_string(), alias.to_string());
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let entry = entries.get_mut(&key)?;

        let CredentialSpec::OAuth { token_file } = &entry.spec else {
            return None;
        };
        let token_file = PathBuf::from(token_file);

        let version = entry.last_version + 1;
        entry.last_version = version;
        entry.record = Some(Arc::new(CredentialRecord {
            provider: provider.into(),
            alias: alias.into(),
            auth_mode: entry.auth_mode,
            secret: token.access_token.clone(),
            source: CredentialSource::OAuth { token_file },
            expires_at: token.expires_at(),
            refresh_token: token.refresh_token.clone(),
            version,
            healthy: true,
        }));
        drop(entries);

        self.events.publish(ProxyEvent::CredentialChanged {
            provider: provider.into(),
            alias: alias.into(),
            version,
            timestamp: Utc::now(),
        });
        Some(version)
    }

    /// Drop the cached record whose backing file matches `path` (refresh
    /// events from the token daemon route through here for file-sourced
    /// credentials).
    pub fn invalidate_path(&self, path: &Path) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        for entry in entries.values_mut() {
            let matches = match &entry.spec {
                CredentialSpec::File { path: p } | CredentialSpec::OAuth { token_file: p } => {
                    Path::new(p) == path
                }
                _ => false,
            };
            if matches {
                if let Some(record) = entry.record.take() {
                    // Re-install as stale-but-present so versions keep rising.
                    tracing::debug!(
                        provider = %record.provider,
                        alias = %record.alias,
                        "credential cache invalidated"
                    );
                }
            }
        }
    }

    /// Current version for a credential, if one was ever resolved.
    pub fn version(&self, provider: &str, alias: &str) -> Option<u64> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .get(&(provider.to_string(), alias.to_string()))?
            .record
            .as_ref()
            .map(|r| r.version)
    }
}

/// Auth files must be regular, readable files; the secret is the trimmed
/// contents (or the `api_key` field if the file is JSON).
fn read_key_file(path: &Path) -> Result<String, String> {
    let meta = std::fs::metadata(path).map_err(|e| format!("{}: {e}", path.display()))?;
    if !meta.is_file() {
        return Err(format!("{} is not a regular file", path.display()));
    }
    let content =
        std::fs::read_to_string(path).map_err(|e| format!("{}: {e}", path.display()))?;
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(&content) {
        if let Some(key) = value.get("api_key").and_then(serde_json::Value::as_str) {
            return Ok(key.to_string());
        }
    }
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(format!("{} is empty", path.display()));
    }
    Ok(trimmed.to_string())
}

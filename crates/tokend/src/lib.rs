//! The RouteCodex OAuth token daemon.
//!
//! Keeps OAuth credentials fresh: discovers token files, refreshes each one
//! ahead of expiry, writes the result atomically, and publishes the new
//! version through the credential store. One task per credential — refreshes
//! of different credentials run in parallel, refreshes of the same
//! credential are serialized by its owning task being the single writer for
//! that path.

pub mod discovery;
pub mod refresh;

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Duration;

use routecodex_core::profile::{CredentialSpec, ProviderProfile};
use routecodex_credentials::{CredentialStore, TokenFile};

pub use discovery::{DiscoveredCredential, scan_auth_dir};
pub use refresh::RefreshError;

/// Daemon tuning knobs.
#[derive(Debug, Clone)]
pub struct TokenDaemonConfig {
    /// Directory scanned for `<provider>-oauth*.json` files.
    pub auth_dir: PathBuf,
    /// Refresh this far ahead of expiry.
    pub refresh_ahead: Duration,
    /// Minimum spacing between refresh attempts of one credential.
    pub min_refresh_interval: Duration,
    /// Poll tick; also the base of the failure backoff.
    pub poll_interval: Duration,
    /// Metadata refresh period for providers that need it.
    pub metadata_refresh_interval: Duration,
}

impl TokenDaemonConfig {
    pub fn new(auth_dir: PathBuf) -> Self {
        Self {
            auth_dir,
            refresh_ahead: Duration::from_secs(30 * 60),
            min_refresh_interval: Duration::from_secs(5 * 60),
            poll_interval: Duration::from_secs(60),
            metadata_refresh_interval: Duration::from_secs(10 * 60),
        }
    }
}

/// What the scheduler decided for one credential at one tick.
#[derive(Debug, PartialEq, Eq)]
enum Action {
    /// Attempt a refresh now.
    Refresh,
    /// Nothing due; sleep one poll tick.
    Idle,
    /// Inside the min-refresh-interval guard; wait it out.
    Throttled,
}

/// Pure scheduling decision, separated out for tests.
fn decide(
    now: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    last_attempt: Option<DateTime<Utc>>,
    cfg: &TokenDaemonConfig,
) -> Action {
    let Some(expires_at) = expires_at else {
        // Non-expiring credentials are watched but never refreshed.
        return Action::Idle;
    };
    let refresh_at = expires_at - chrono::Duration::from_std(cfg.refresh_ahead).unwrap_or_default();
    if now < refresh_at {
        return Action::Idle;
    }
    if let Some(last) = last_attempt {
        let min_gap = chrono::Duration::from_std(cfg.min_refresh_interval).unwrap_or_default();
        if now - last < min_gap {
            return Action::Throttled;
        }
    }
    Action::Refresh
}

/// Failure backoff: exponential from the poll interval, bounded by the next
/// poll tick at 10× the interval.
fn backoff_for(consecutive_failures: u32, poll: Duration) -> Duration {
    let factor = 2u32.saturating_pow(consecutive_failures.min(8));
    poll.saturating_mul(factor).min(poll.saturating_mul(10))
}

struct Worker {
    provider: String,
    alias: String,
    path: PathBuf,
    cfg: TokenDaemonConfig,
    store: Arc<CredentialStore>,
    client: reqwest::Client,
}

impl Worker {
    async fn run(self) {
        let mut last_attempt: Option<DateTime<Utc>> = None;
        let mut last_metadata: Option<DateTime<Utc>> = None;
        let mut failures: u32 = 0;

        loop {
            let sleep = match self.tick(&mut last_attempt, &mut last_metadata).await {
                Ok(()) => {
                    failures = 0;
                    self.cfg.poll_interval
                }
                Err(err) => {
                    failures = failures.saturating_add(1);
                    tracing::warn!(
                        provider = %self.provider,
                        alias = %self.alias,
                        failures,
                        error = %err,
                        "token refresh failed, backing off"
                    );
                    backoff_for(failures, self.cfg.poll_interval)
                }
            };
            tokio::time::sleep(sleep).await;
        }
    }

    async fn tick(
        &self,
        last_attempt: &mut Option<DateTime<Utc>>,
        last_metadata: &mut Option<DateTime<Utc>>,
    ) -> Result<(), RefreshError> {
        let token = match TokenFile::read(&self.path) {
            Ok(t) => t,
            Err(err) => {
                // Missing or malformed file: nothing to refresh this tick.
                tracing::debug!(
                    path = %self.path.display(),
                    error = %err,
                    "token file not readable"
                );
                return Ok(());
            }
        };

        let now = Utc::now();

        if refresh::needs_metadata_refresh(&self.provider) {
            let due = last_metadata.map_or(true, |last| {
                now - last
                    >= chrono::Duration::from_std(self.cfg.metadata_refresh_interval)
                        .unwrap_or_default()
            });
            if due {
                *last_metadata = Some(now);
                if let Err(err) =
                    refresh::refresh_token(&self.client, &self.provider, &token).await
                {
                    tracing::debug!(
                        provider = %self.provider,
                        error = %err,
                        "metadata refresh attempt failed"
                    );
                } else {
                    tracing::debug!(provider = %self.provider, "metadata refreshed");
                }
            }
        }

        match decide(now, token.expires_at(), *last_attempt, &self.cfg) {
            Action::Idle | Action::Throttled => Ok(()),
            Action::Refresh => {
                *last_attempt = Some(now);
                let fresh = refresh::refresh_token(&self.client, &self.provider, &token).await?;
                fresh
                    .write_atomic(&self.path)
                    .map_err(|e| RefreshError::Network(e.to_string()))?;

                let version = self
                    .store
                    .install_oauth(&self.provider, &self.alias, &fresh);
                self.store.invalidate_path(&self.path);
                tracing::info!(
                    provider = %self.provider,
                    alias = %self.alias,
                    version = version.unwrap_or(0),
                    "token refreshed"
                );
                Ok(())
            }
        }
    }
}

/// The daemon handle. Owns one task per credential; dropping or calling
/// [`TokenDaemon::shutdown`] aborts them all.
pub struct TokenDaemon {
    cfg: TokenDaemonConfig,
    store: Arc<CredentialStore>,
    client: reqwest::Client,
    tasks: Vec<JoinHandle<()>>,
}

impl TokenDaemon {
    pub fn new(cfg: TokenDaemonConfig, store: Arc<CredentialStore>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            cfg,
            store,
            client,
            tasks: Vec::new(),
        }
    }

    /// Assemble the worklist and spawn one worker per credential.
    ///
    /// Credentials come from the auth-dir scan plus any provider-declared
    /// OAuth token files; duplicates (same path) collapse to one worker so
    /// every file has a single writer.
    pub fn start(&mut self, providers: &std::collections::BTreeMap<String, ProviderProfile>) {
        let mut by_path: HashMap<PathBuf, (String, String)> = HashMap::new();

        for cred in scan_auth_dir(&self.cfg.auth_dir) {
            by_path.insert(cred.path, (cred.provider, cred.alias));
        }
        for profile in providers.values() {
            for (alias, spec) in &profile.credentials {
                if let CredentialSpec::OAuth { token_file } = spec {
                    // Provider-declared mapping wins over filename inference.
                    by_path.insert(
                        PathBuf::from(token_file),
                        (profile.id.clone(), alias.clone()),
                    );
                }
            }
        }

        tracing::info!(credentials = by_path.len(), "token daemon starting");

        for (path, (provider, alias)) in by_path {
            let worker = Worker {
                provider,
                alias,
                path,
                cfg: self.cfg.clone(),
                store: self.store.clone(),
                client: self.client.clone(),
            };
            self.tasks.push(tokio::spawn(worker.run()));
        }
    }

    /// Abort all workers. In-flight refreshes stop at their next await point.
    pub fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        tracing::info!("token daemon stopped");
    }

    pub fn worker_count(&self) -> usize {
        self.tasks.len()
    }
}

impl Drop for TokenDaemon {
    fn drop(&mut self) {
        self.shutdown();
    }
}

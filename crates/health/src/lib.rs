//! Health and admission tracking for RouteCodex targets.
//!
//! Tracks per `(providerId, keyAlias)` outcomes: consecutive-error fatal
//! bans, the 429 rate-limit ladder, the short-window key blacklist, and the
//! upstream quota view. The router asks for admission before forwarding and
//! reports the outcome afterwards; `acquire` and `report` for the same
//! target are totally ordered by a per-target mutex, targets proceed in
//! parallel.

pub mod policy;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use tokio::time::{Duration, Instant};

pub use policy::HealthPolicy;

/// Why a target is currently inadmissible with a retry-later semantic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusyKind {
    RateLimited,
    Blacklisted,
    QuotaExhausted,
}

/// The admission decision for one target.
#[derive(Debug)]
pub enum Admission {
    /// Go ahead; pass the permit back via [`HealthTracker::report`].
    Permit(Permit),
    /// Time-bounded exclusion that clears on its own.
    Busy {
        kind: BusyKind,
        retry_after_ms: u64,
    },
    /// Fatal ban from repeated hard failures; a probe is allowed once the
    /// deadline passes.
    Banned {
        reason: String,
        retry_after_ms: u64,
    },
}

/// A move-only admission token. Consumed by `report`; dropping it without
/// reporting simply leaves the record untouched (client-cancel path).
#[derive(Debug)]
pub struct Permit {
    provider: String,
    alias: String,
    acquired_at: Instant,
}

impl Permit {
    pub fn provider(&self) -> &str {
        &self.provider
    }
    pub fn alias(&self) -> &str {
        &self.alias
    }
    pub fn acquired_at(&self) -> Instant {
        self.acquired_at
    }
}

/// Quota information parsed from upstream response headers.
#[derive(Debug, Clone, Copy, Default)]
pub struct QuotaUpdate {
    pub remaining: Option<u64>,
    /// Seconds until the quota window resets.
    pub resets_in_secs: Option<u64>,
}

/// The reported outcome of one upstream call.
#[derive(Debug)]
pub enum Outcome {
    Success {
        quota: Option<QuotaUpdate>,
    },
    Error {
        /// Upstream status; 0 for network errors and timeouts.
        status: u16,
        retry_after: Option<Duration>,
        quota: Option<QuotaUpdate>,
    },
}

/// Read-only snapshot for the router and operational endpoints.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthView {
    pub provider: String,
    pub alias: String,
    pub consecutive_errors: u32,
    pub last_status_code: Option<u16>,
    pub rate_limit_step: usize,
    pub ban_remaining_ms: Option<u64>,
    pub ban_reason: Option<String>,
    pub blacklisted: bool,
    pub quota_remaining: Option<u64>,
}

#[derive(Debug, Default)]
struct TargetState {
    consecutive_errors: u32,
    last_error_at: Option<Instant>,
    last_status: Option<u16>,
    ban_reason: Option<String>,
    fatal_ban_until: Option<Instant>,
    rate_ban_until: Option<Instant>,
    blacklist_until: Option<Instant>,
    quota_ban_until: Option<Instant>,
    rate_limit_step: usize,
    /// Timestamps of recent 429s for the blacklist window.
    recent_429s: VecDeque<Instant>,
    quota_remaining: Option<u64>,
}

impl TargetState {
    /// The reset window: after `reset_window` of error-free operation the
    /// ladder step and consecutive counter go back to zero. Applied lazily
    /// on every touch.
    fn maybe_reset(&mut self, now: Instant, reset_window: Duration) {
        if let Some(last) = self.last_error_at {
            if now.duration_since(last) >= reset_window {
                self.consecutive_errors = 0;
                self.rate_limit_step = 0;
                self.recent_429s.clear();
            }
        }
    }

    /// Effective ban deadline: the max across fatal, ladder, blacklist, and
    /// quota bans.
    fn ban_until(&self) -> Option<(Instant, BanSource)> {
        let candidates = [
            (self.fatal_ban_until, BanSource::Fatal),
            (self.rate_ban_until, BanSource::RateLimit),
            (self.blacklist_until, BanSource::Blacklist),
            (self.quota_ban_until, BanSource::Quota),
        ];
        candidates
            .into_iter()
            .filter_map(|(deadline, source)| deadline.map(|d| (d, source)))
            .max_by_key(|(d, _)| *d)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BanSource {
    Fatal,
    RateLimit,
    Blacklist,
    Quota,
}

type Key = (String, String);

/// The process-wide health tracker. Cheap to clone via `Arc` at call sites;
/// owns all `HealthRecord` state exclusively.
pub struct HealthTracker {
    policy: HealthPolicy,
    targets: RwLock<HashMap<Key, Arc<Mutex<TargetState>>>>,
}

impl HealthTracker {
    pub fn new(policy: HealthPolicy) -> Self {
        Self {
            policy,
            targets: RwLock::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &HealthPolicy {
        &self.policy
    }

    fn state_for(&self, provider: &str, alias: &str) -> Arc<Mutex<TargetState>> {
        let key = (provider.to_string(), alias.to_string());
        {
            let targets = self.targets.read().unwrap_or_else(|e| e.into_inner());
            if let Some(state) = targets.get(&key) {
                return state.clone();
            }
        }
        let mut targets = self.targets.write().unwrap_or_else(|e| e.into_inner());
        targets.entry(key).or_default().clone()
    }

    /// Ask for admission to one target.
    pub fn acquire(&self, provider: &str, alias: &str) -> Admission {
        let state = self.state_for(provider, alias);
        let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        state.maybe_reset(now, self.policy.reset_window);

        if let Some((until, source)) = state.ban_until() {
            if until > now {
                let retry_after_ms = until.duration_since(now).as_millis() as u64;
                return match source {
                    BanSource::Fatal => Admission::Banned {
                        reason: state
                            .ban_reason
                            .clone()
                            .unwrap_or_else(|| "consecutive errors".into()),
                        retry_after_ms,
                    },
                    BanSource::RateLimit => Admission::Busy {
                        kind: BusyKind::RateLimited,
                        retry_after_ms,
                    },
                    BanSource::Blacklist => Admission::Busy {
                        kind: BusyKind::Blacklisted,
                        retry_after_ms,
                    },
                    BanSource::Quota => Admission::Busy {
                        kind: BusyKind::QuotaExhausted,
                        retry_after_ms,
                    },
                };
            }
        }

        Admission::Permit(Permit {
            provider: provider.to_string(),
            alias: alias.to_string(),
            acquired_at: now,
        })
    }

    /// Report the outcome of a permitted call. Consumes the permit.
    pub fn report(&self, permit: Permit, outcome: Outcome) {
        let state = self.state_for(&permit.provider, &permit.alias);
        let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        state.maybe_reset(now, self.policy.reset_window);

        match outcome {
            Outcome::Success { quota } => {
                state.consecutive_errors = 0;
                state.rate_limit_step = state.rate_limit_step.saturating_sub(1);
                state.fatal_ban_until = None;
                state.rate_ban_until = None;
                state.blacklist_until = None;
                state.quota_ban_until = None;
                state.ban_reason = None;
                state.last_status = Some(200);
                if let Some(q) = quota {
                    self.apply_quota(&mut state, now, q, &permit);
                }
            }
            Outcome::Error {
                status,
                retry_after,
                quota,
            } => {
                state.consecutive_errors = state.consecutive_errors.saturating_add(1);
                state.last_error_at = Some(now);
                state.last_status = Some(status);

                if status == 429 {
                    self.apply_rate_limit(&mut state, now, retry_after, &permit);
                } else if self.policy.fatal_status_codes.contains(&status)
                    && state.consecutive_errors >= self.policy.consecutive_error_threshold
                {
                    state.fatal_ban_until = Some(now + self.policy.fatal_ban);
                    state.ban_reason = Some(format!(
                        "{} consecutive {status}s",
                        state.consecutive_errors
                    ));
                    tracing::warn!(
                        provider = %permit.provider,
                        alias = %permit.alias,
                        status,
                        consecutive = state.consecutive_errors,
                        ban_ms = self.policy.fatal_ban.as_millis() as u64,
                        "fatal ban applied"
                    );
                } else if (status >= 500 || status == 0)
                    && state.consecutive_errors >= self.policy.consecutive_error_threshold
                {
                    state.fatal_ban_until = Some(now + self.policy.default_ban);
                    state.ban_reason = Some(format!(
                        "{} consecutive upstream failures",
                        state.consecutive_errors
                    ));
                }

                if let Some(q) = quota {
                    self.apply_quota(&mut state, now, q, &permit);
                }
            }
        }
    }

    fn apply_rate_limit(
        &self,
        state: &mut TargetState,
        now: Instant,
        retry_after: Option<Duration>,
        permit: &Permit,
    ) {
        let schedule = &self.policy.rate_limit_schedule;
        let step = state.rate_limit_step.min(schedule.len() - 1);
        let mut ban = schedule[step];
        // Retry-After from the upstream overrides only when larger.
        if let Some(ra) = retry_after {
            if ra > ban {
                ban = ra;
            }
        }
        state.rate_ban_until = Some(now + ban);
        state.rate_limit_step += 1;

        state.recent_429s.push_back(now);
        while let Some(front) = state.recent_429s.front() {
            if now.duration_since(*front) >= self.policy.blacklist_window {
                state.recent_429s.pop_front();
            } else {
                break;
            }
        }
        if state.recent_429s.len() as u32 >= self.policy.blacklist_threshold {
            state.blacklist_until = Some(now + self.policy.blacklist_duration);
            tracing::warn!(
                provider = %permit.provider,
                alias = %permit.alias,
                hits = state.recent_429s.len(),
                "credential blacklisted after repeated 429s"
            );
        }

        tracing::info!(
            provider = %permit.provider,
            alias = %permit.alias,
            step,
            ban_ms = ban.as_millis() as u64,
            "rate-limit ban applied"
        );
    }

    fn apply_quota(&self, state: &mut TargetState, now: Instant, q: QuotaUpdate, permit: &Permit) {
        state.quota_remaining = q.remaining;
        if q.remaining == Some(0) {
            let reset = Duration::from_secs(q.resets_in_secs.unwrap_or(60));
            state.quota_ban_until = Some(now + reset);
            tracing::info!(
                provider = %permit.provider,
                alias = %permit.alias,
                reset_secs = reset.as_secs(),
                "quota exhausted, target parked until reset"
            );
        }
    }

    /// Read-only view for the router and `/health`-style endpoints.
    pub fn view(&self, provider: &str, alias: &str) -> HealthView {
        let state = self.state_for(provider, alias);
        let state = state.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let ban = state
            .ban_until()
            .filter(|(until, _)| *until > now)
            .map(|(until, _)| until.duration_since(now).as_millis() as u64);

        HealthView {
            provider: provider.to_string(),
            alias: alias.to_string(),
            consecutive_errors: state.consecutive_errors,
            last_status_code: state.last_status,
            rate_limit_step: state.rate_limit_step,
            ban_remaining_ms: ban,
            ban_reason: state.ban_reason.clone(),
            blacklisted: state.blacklist_until.is_some_and(|u| u > now),
            quota_remaining: state.quota_remaining,
        }
    }

    /// Views for every target ever touched.
    pub fn all_views(&self) -> Vec<HealthView> {
        let keys: Vec<Key> = {
            let targets = self.targets.read().unwrap_or_else(|e| e.into_inner());
            targets.keys().cloned().collect()
        };
        keys.iter()
            .map(|(provider, alias)| self.view(provider, alias))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> HealthTracker {
        HealthTracker::new(HealthPolicy::default())
    }

    fn permit(t: &HealthTracker) -> Permit {
        match t.acquire("openai", "key1") {
            Admission::Permit(p) => p,
            other => panic!("expected permit, got {other:?}"),
        }
    }

    fn report_status(t: &HealthTracker, status: u16) {
        let p = permit(t);
        t.report(
            p,
            Outcome::Error {
                status,
                retry_after: None,
                quota: None,
            },
        );
    }

    #[tokio::test(start_paused = true)]
    async fn success_keeps_target_admissible() {
        let t = tracker();
        let p = permit(&t);
        t.report(p, Outcome::Success { quota: None });
        assert!(matches!(t.acquire("openai", "key1"), Admission::Permit(_)));
        assert_eq!(t.view("openai", "key1").consecutive_errors, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_ladder_escalates() {
        let t = tracker();

        // 1st 429 → 5 min ban at step 0.
        report_status(&t, 429);
        match t.acquire("openai", "key1") {
            Admission::Busy {
                kind: BusyKind::RateLimited,
                retry_after_ms,
            } => assert!(retry_after_ms <= 300_000 && retry_after_ms > 290_000),
            other => panic!("expected rate-limit busy, got {other:?}"),
        }

        // Wait out the first ban; 2nd 429 → 1 h.
        tokio::time::advance(Duration::from_secs(301)).await;
        report_status(&t, 429);
        // 3rd 429 after the hour → 6 h (ladder index 2).
        tokio::time::advance(Duration::from_secs(3601)).await;
        report_status(&t, 429);

        match t.acquire("openai", "key1") {
            Admission::Busy { retry_after_ms, .. } => {
                assert!(retry_after_ms > 5 * 3600 * 1000);
                assert!(retry_after_ms <= 6 * 3600 * 1000);
            }
            other => panic!("expected busy, got {other:?}"),
        }
        assert_eq!(t.view("openai", "key1").rate_limit_step, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn three_fast_429s_blacklist_the_credential() {
        let t = HealthTracker::new(HealthPolicy {
            // Keep ladder bans short so the blacklist dominates.
            rate_limit_schedule: vec![Duration::from_millis(10); 4],
            ..HealthPolicy::default()
        });

        for _ in 0..3 {
            // Bans from previous 429s are shorter than the advance step.
            tokio::time::advance(Duration::from_millis(20)).await;
            report_status(&t, 429);
        }

        let view = t.view("openai", "key1");
        assert!(view.blacklisted);
        match t.acquire("openai", "key1") {
            Admission::Busy {
                kind: BusyKind::Blacklisted,
                retry_after_ms,
            } => {
                // Effective ban is the max of ladder and blacklist bans.
                assert!(retry_after_ms > 1_700_000);
            }
            other => panic!("expected blacklist busy, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_ban_after_consecutive_403s() {
        let t = tracker();
        report_status(&t, 403);
        report_status(&t, 403);
        // Two strikes: still admissible.
        assert!(matches!(t.acquire("openai", "key1"), Admission::Permit(_)));
        report_status(&t, 403);

        match t.acquire("openai", "key1") {
            Admission::Banned { retry_after_ms, .. } => {
                assert!(retry_after_ms <= 120_000);
                assert!(retry_after_ms > 115_000);
            }
            other => panic!("expected fatal ban, got {other:?}"),
        }

        // A probe is allowed once the deadline passes (~125 s).
        tokio::time::advance(Duration::from_secs(125)).await;
        assert!(matches!(t.acquire("openai", "key1"), Admission::Permit(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_5xx_uses_default_ban() {
        let t = tracker();
        for _ in 0..3 {
            report_status(&t, 502);
        }
        match t.acquire("openai", "key1") {
            Admission::Banned { retry_after_ms, .. } => assert!(retry_after_ms <= 30_000),
            other => panic!("expected ban, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_overrides_when_larger() {
        let t = tracker();
        let p = permit(&t);
        t.report(
            p,
            Outcome::Error {
                status: 429,
                retry_after: Some(Duration::from_secs(7200)),
                quota: None,
            },
        );
        match t.acquire("openai", "key1") {
            Admission::Busy { retry_after_ms, .. } => assert!(retry_after_ms > 300_000),
            other => panic!("expected busy, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reset_window_clears_step_and_errors() {
        let t = tracker();
        report_status(&t, 429);
        report_status(&t, 500);
        assert!(t.view("openai", "key1").consecutive_errors >= 2);

        tokio::time::advance(Duration::from_secs(24 * 3600 + 1)).await;
        let view = t.view("openai", "key1");
        assert_eq!(view.consecutive_errors, 0);
        assert_eq!(view.rate_limit_step, 0);
        assert!(matches!(t.acquire("openai", "key1"), Admission::Permit(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn success_decays_ladder_step() {
        let t = tracker();
        report_status(&t, 429);
        tokio::time::advance(Duration::from_secs(301)).await;
        report_status(&t, 429);
        assert_eq!(t.view("openai", "key1").rate_limit_step, 2);

        tokio::time::advance(Duration::from_secs(3601)).await;
        let p = permit(&t);
        t.report(p, Outcome::Success { quota: None });
        assert_eq!(t.view("openai", "key1").rate_limit_step, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn quota_exhaustion_parks_target_until_reset() {
        let t = tracker();
        let p = permit(&t);
        t.report(
            p,
            Outcome::Success {
                quota: Some(QuotaUpdate {
                    remaining: Some(0),
                    resets_in_secs: Some(120),
                }),
            },
        );
        match t.acquire("openai", "key1") {
            Admission::Busy {
                kind: BusyKind::QuotaExhausted,
                retry_after_ms,
            } => assert!(retry_after_ms <= 120_000),
            other => panic!("expected quota busy, got {other:?}"),
        }

        tokio::time::advance(Duration::from_secs(121)).await;
        assert!(matches!(t.acquire("openai", "key1"), Admission::Permit(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn targets_are_tracked_independently() {
        let t = tracker();
        for _ in 0..3 {
            report_status(&t, 403);
        }
        assert!(matches!(
            t.acquire("openai", "key1"),
            Admission::Banned { .. }
        ));
        assert!(matches!(t.acquire("openai", "key2"), Admission::Permit(_)));
        assert!(matches!(
            t.acquire("anthropic", "key1"),
            Admission::Permit(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_permit_without_report_is_neutral() {
        let t = tracker();
        {
            let _p = permit(&t);
            // Client canceled: permit dropped, no report.
        }
        let view = t.view("openai", "key1");
        assert_eq!(view.consecutive_errors, 0);
        assert!(view.ban_remaining_ms.is_none());
    }
}

//! The health/admission policy: thresholds, ban durations, the 429 ladder.
//!
//! Built from config settings by the supervisor; `ROUTECODEX_RL_SCHEDULE`
//! (e.g. `5m,1h,6h,24h`) overrides the ladder last.

use tokio::time::Duration;

/// Policy knobs the tracker applies. All durations monotonic.
#[derive(Debug, Clone)]
pub struct HealthPolicy {
    /// Statuses that trigger a fatal ban after the consecutive threshold.
    pub fatal_status_codes: Vec<u16>,
    pub consecutive_error_threshold: u32,
    pub fatal_ban: Duration,
    /// Ban for repeated non-fatal upstream failures (5xx, network).
    pub default_ban: Duration,
    /// The 429 ladder; the step index clamps to the last entry.
    pub rate_limit_schedule: Vec<Duration>,
    /// Error-free window after which step and consecutive counters reset.
    pub reset_window: Duration,
    /// 429s inside this window count toward the blacklist.
    pub blacklist_window: Duration,
    pub blacklist_threshold: u32,
    pub blacklist_duration: Duration,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            fatal_status_codes: vec![403],
            consecutive_error_threshold: 3,
            fatal_ban: Duration::from_secs(120),
            default_ban: Duration::from_secs(30),
            rate_limit_schedule: vec![
                Duration::from_secs(5 * 60),
                Duration::from_secs(3600),
                Duration::from_secs(6 * 3600),
                Duration::from_secs(24 * 3600),
            ],
            reset_window: Duration::from_secs(24 * 3600),
            blacklist_window: Duration::from_secs(60),
            blacklist_threshold: 3,
            blacklist_duration: Duration::from_secs(30 * 60),
        }
    }
}

impl HealthPolicy {
    /// Construct from millisecond-granularity settings (the config shape).
    #[allow(clippy::too_many_arguments)]
    pub fn from_millis(
        fatal_status_codes: Vec<u16>,
        consecutive_error_threshold: u32,
        fatal_ms: u64,
        default_ms: u64,
        rate_limit_schedule_ms: &[u64],
        reset_window_ms: u64,
        blacklist_window_ms: u64,
        blacklist_threshold: u32,
        blacklist_duration_ms: u64,
    ) -> Self {
        let mut policy = Self {
            fatal_status_codes,
            consecutive_error_threshold,
            fatal_ban: Duration::from_millis(fatal_ms),
            default_ban: Duration::from_millis(default_ms),
            rate_limit_schedule: rate_limit_schedule_ms
                .iter()
                .map(|&ms| Duration::from_millis(ms))
                .collect(),
            reset_window: Duration::from_millis(reset_window_ms),
            blacklist_window: Duration::from_millis(blacklist_window_ms),
            blacklist_threshold,
            blacklist_duration: Duration::from_millis(blacklist_duration_ms),
        };
        if policy.rate_limit_schedule.is_empty() {
            policy.rate_limit_schedule = HealthPolicy::default().rate_limit_schedule;
        }
        policy.apply_env_overrides();
        policy
    }

    /// Apply `ROUTECODEX_RL_SCHEDULE` when set and parseable. Malformed
    /// values are logged and ignored.
    pub fn apply_env_overrides(&mut self) {
        let Ok(raw) = std::env::var("ROUTECODEX_RL_SCHEDULE") else {
            return;
        };
        match parse_schedule(&raw) {
            Some(schedule) if !schedule.is_empty() => {
                tracing::info!(schedule = %raw, "rate-limit ladder overridden from environment");
                self.rate_limit_schedule = schedule;
            }
            _ => {
                tracing::warn!(value = %raw, "ignoring malformed ROUTECODEX_RL_SCHEDULE");
            }
        }
    }
}

/// Parse a comma-separated schedule like `5m,1h,6h,24h`. Units: `ms`, `s`,
/// `m`, `h`, `d`; a bare number means milliseconds.
pub fn parse_schedule(raw: &str) -> Option<Vec<Duration>> {
    raw.split(',')
        .map(|part| parse_duration(part.trim()))
        .collect()
}

fn parse_duration(part: &str) -> Option<Duration> {
    if part.is_empty() {
        return None;
    }
    let split = part
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(part.len());
    let (digits, unit) = part.split_at(split);
    let value: u64 = digits.parse().ok()?;
    let ms = match unit {
        "" | "ms" => value,
        "s" => value * 1_000,
        "m" => value * 60_000,
        "h" => value * 3_600_000,
        "d" => value * 86_400_000,
        _ => return None,
    };
    Some(Duration::from_millis(ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ladder_matches_spec() {
        let p = HealthPolicy::default();
        assert_eq!(p.rate_limit_schedule.len(), 4);
        assert_eq!(p.rate_limit_schedule[0], Duration::from_secs(300));
        assert_eq!(p.rate_limit_schedule[2], Duration::from_secs(6 * 3600));
    }

    #[test]
    fn parses_unit_suffixes() {
        let s = parse_schedule("5m,1h,6h,24h").unwrap();
        assert_eq!(
            s,
            vec![
                Duration::from_secs(300),
                Duration::from_secs(3600),
                Duration::from_secs(6 * 3600),
                Duration::from_secs(24 * 3600),
            ]
        );
        assert_eq!(
            parse_schedule("500,2s,3d").unwrap(),
            vec![
                Duration::from_millis(500),
                Duration::from_secs(2),
                Duration::from_secs(3 * 86_400),
            ]
        );
    }

    #[test]
    fn rejects_malformed_schedules() {
        assert!(parse_schedule("5x").is_none());
        assert!(parse_schedule("m5").is_none());
        assert!(parse_schedule("1h,,2h").is_none());
    }

    #[test]
    fn from_millis_keeps_nonempty_schedule() {
        let p = HealthPolicy::from_millis(
            vec![403, 451],
            5,
            60_000,
            10_000,
            &[1_000, 2_000],
            1_000_000,
            30_000,
            2,
            600_000,
        );
        assert_eq!(p.fatal_status_codes, vec![403, 451]);
        assert_eq!(p.consecutive_error_threshold, 5);
        assert_eq!(p.rate_limit_schedule.len(), 2);
        assert_eq!(p.blacklist_threshold, 2);
    }
}

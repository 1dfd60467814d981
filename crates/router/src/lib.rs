//! The RouteCodex router.
//!
//! Classifies each request into a category, walks the category's pools in
//! declared order, and picks the first target the health tracker admits.
//! Selection within a pool follows the pool mode (priority, round-robin,
//! weighted). Anything banned, blacklisted, quota-parked, or on the
//! request's exclusion list is skipped; an empty yield falls through to the
//! next pool and finally to the `default` category.

pub mod classify;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use routecodex_config::{ClassifierSettings, PoolMode, RoutePool, RoutingTable};
use routecodex_core::chat::ChatRequest;
use routecodex_core::error::ProxyError;
use routecodex_core::target::{RouteCategory, RouteTarget, RoutingDecision};
use routecodex_health::{Admission, HealthTracker, Permit};

pub use classify::classify;

/// Maximum forwarding attempts per request (first try + retries).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// A successful routing decision with the admission permit attached. The
/// caller reports the outcome through the permit after the upstream call.
#[derive(Debug)]
pub struct RouteSuccess {
    pub decision: RoutingDecision,
    pub permit: Permit,
}

pub struct Router {
    routing: RoutingTable,
    classifier: ClassifierSettings,
    health: Arc<HealthTracker>,
    /// Round-robin cursors keyed `category/pool-id`.
    cursors: HashMap<String, AtomicUsize>,
    pub max_attempts: u32,
}

impl Router {
    pub fn new(
        routing: RoutingTable,
        classifier: ClassifierSettings,
        health: Arc<HealthTracker>,
    ) -> Self {
        let mut cursors = HashMap::new();
        for (category, pools) in &routing {
            for pool in pools {
                cursors.insert(cursor_key(*category, &pool.id), AtomicUsize::new(0));
            }
        }
        Self {
            routing,
            classifier,
            health,
            cursors,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn classify(&self, request: &ChatRequest) -> RouteCategory {
        classify::classify(request, &self.classifier)
    }

    /// Route one request attempt. `exclude` carries the `(provider, alias)`
    /// pairs already failed for this request id.
    pub fn route(
        &self,
        request_id: &str,
        request: &ChatRequest,
        exclude: &[(String, String)],
        attempt: u32,
    ) -> Result<RouteSuccess, ProxyError> {
        let category = self.classify(request);
        let mut soonest_retry: Option<u64> = None;

        let mut walk = |category: RouteCategory| -> Option<RouteSuccess> {
            let pools = self.routing.get(&category)?;
            for pool in pools {
                if let Some(success) = self.try_pool(
                    category,
                    pool,
                    request_id,
                    exclude,
                    attempt,
                    &mut soonest_retry,
                ) {
                    return Some(success);
                }
            }
            None
        };

        if let Some(success) = walk(category) {
            return Ok(success);
        }
        // Fall back to the default pools before giving up.
        if category != RouteCategory::Default {
            if let Some(success) = walk(RouteCategory::Default) {
                tracing::debug!(
                    request_id,
                    category = %category,
                    "category pools exhausted, served from default"
                );
                return Ok(success);
            }
        }

        Err(ProxyError::NoHealthyTarget {
            category: category.as_str().to_string(),
            retry_after_ms: soonest_retry,
        })
    }

    fn try_pool(
        &self,
        category: RouteCategory,
        pool: &RoutePool,
        request_id: &str,
        exclude: &[(String, String)],
        attempt: u32,
        soonest_retry: &mut Option<u64>,
    ) -> Option<RouteSuccess> {
        let candidates: Vec<usize> = (0..pool.targets.len())
            .filter(|&i| {
                let t = &pool.targets[i];
                !exclude
                    .iter()
                    .any(|(p, a)| p == &t.provider && a == &t.key_alias)
            })
            .collect();
        if candidates.is_empty() {
            return None;
        }

        let ordered = match pool.mode {
            PoolMode::Priority => candidates,
            PoolMode::RoundRobin => {
                let cursor = self
                    .cursors
                    .get(&cursor_key(category, &pool.id))
                    .map(|c| c.fetch_add(1, Ordering::Relaxed))
                    .unwrap_or(0);
                let mut rotated = candidates.clone();
                rotated.rotate_left(cursor % candidates.len());
                rotated
            }
            PoolMode::Weighted => weighted_order(&candidates, &pool.weights),
        };

        for index in ordered {
            let target = &pool.targets[index];
            match self.health.acquire(&target.provider, &target.key_alias) {
                Admission::Permit(permit) => {
                    return Some(RouteSuccess {
                        decision: RoutingDecision {
                            request_id: request_id.to_string(),
                            category,
                            target: target.clone(),
                            credential_version: 0,
                            attempt,
                            pool_id: pool.id.clone(),
                        },
                        permit,
                    });
                }
                Admission::Busy { retry_after_ms, .. }
                | Admission::Banned { retry_after_ms, .. } => {
                    *soonest_retry = Some(match *soonest_retry {
                        Some(current) => current.min(retry_after_ms),
                        None => retry_after_ms,
                    });
                }
            }
        }
        None
    }

    pub fn health(&self) -> &Arc<HealthTracker> {
        &self.health
    }

    /// All targets the routing table knows, for `/v1/models` and readiness.
    pub fn known_targets(&self) -> Vec<&RouteTarget> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for pools in self.routing.values() {
            for pool in pools {
                for target in &pool.targets {
                    if seen.insert(target.key()) {
                        out.push(target);
                    }
                }
            }
        }
        out
    }
}

fn cursor_key(category: RouteCategory, pool_id: &str) -> String {
    format!("{category}/{pool_id}")
}

/// Weighted random order: sample without replacement, probability
/// proportional to weight.
fn weighted_order(candidates: &[usize], weights: &[u32]) -> Vec<usize> {
    use rand::Rng;
    let mut rng = rand::rng();
    let mut remaining: Vec<usize> = candidates.to_vec();
    let mut out = Vec::with_capacity(remaining.len());

    while !remaining.is_empty() {
        let total: u64 = remaining
            .iter()
            .map(|&i| u64::from(weights.get(i).copied().unwrap_or(1).max(1)))
            .sum();
        let mut pick = rng.random_range(0..total);
        let mut chosen = 0;
        for (slot, &i) in remaining.iter().enumerate() {
            let w = u64::from(weights.get(i).copied().unwrap_or(1).max(1));
            if pick < w {
                chosen = slot;
                break;
            }
            pick -= w;
        }
        out.push(remaining.remove(chosen));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use routecodex_health::{HealthPolicy, Outcome};

    fn target(provider: &str, alias: &str) -> RouteTarget {
        RouteTarget::new(provider, "gpt-4o-mini", alias)
    }

    fn pool(id: &str, mode: PoolMode, targets: Vec<RouteTarget>) -> RoutePool {
        let weights = vec![1; targets.len()];
        RoutePool {
            id: id.into(),
            mode,
            targets,
            weights,
        }
    }

    fn router_with(routing: RoutingTable) -> Router {
        Router::new(
            routing,
            ClassifierSettings::default(),
            Arc::new(HealthTracker::new(HealthPolicy::default())),
        )
    }

    fn chat(json: &str) -> ChatRequest {
        serde_json::from_str(json).unwrap()
    }

    fn plain_request() -> ChatRequest {
        chat(r#"{"model":"gpt-4o-mini","messages":[{"role":"user","content":"hi"}]}"#)
    }

    fn ban_target(router: &Router, provider: &str, alias: &str) {
        for _ in 0..3 {
            match router.health.acquire(provider, alias) {
                Admission::Permit(p) => router.health.report(
                    p,
                    Outcome::Error {
                        status: 403,
                        retry_after: None,
                        quota: None,
                    },
                ),
                other => panic!("target already inadmissible: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn priority_pool_picks_first_healthy() {
        let mut routing = RoutingTable::new();
        routing.insert(
            RouteCategory::Default,
            vec![pool(
                "primary",
                PoolMode::Priority,
                vec![target("openai", "key1"), target("openai", "key2")],
            )],
        );
        let router = router_with(routing);

        let success = router.route("req-1", &plain_request(), &[], 1).unwrap();
        assert_eq!(success.decision.target.key_alias, "key1");
        assert_eq!(success.decision.category, RouteCategory::Default);
        assert_eq!(success.decision.pool_id, "primary");
    }

    #[tokio::test]
    async fn banned_target_is_skipped() {
        let mut routing = RoutingTable::new();
        routing.insert(
            RouteCategory::Default,
            vec![pool(
                "primary",
                PoolMode::Priority,
                vec![target("openai", "key1"), target("openai", "key2")],
            )],
        );
        let router = router_with(routing);
        ban_target(&router, "openai", "key1");

        let success = router.route("req-1", &plain_request(), &[], 1).unwrap();
        assert_eq!(success.decision.target.key_alias, "key2");
    }

    #[tokio::test]
    async fn round_robin_advances_per_request() {
        let mut routing = RoutingTable::new();
        routing.insert(
            RouteCategory::Default,
            vec![pool(
                "rr",
                PoolMode::RoundRobin,
                vec![target("openai", "key1"), target("openai", "key2")],
            )],
        );
        let router = router_with(routing);

        let aliases: Vec<String> = (0..4)
            .map(|i| {
                let success = router
                    .route(&format!("req-{i}"), &plain_request(), &[], 1)
                    .unwrap();
                success.decision.target.key_alias.clone()
            })
            .collect();
        assert_eq!(aliases, vec!["key1", "key2", "key1", "key2"]);
    }

    #[tokio::test]
    async fn exclusion_list_removes_failed_pairs() {
        let mut routing = RoutingTable::new();
        routing.insert(
            RouteCategory::Default,
            vec![pool(
                "primary",
                PoolMode::Priority,
                vec![target("openai", "key1"), target("openai", "key2")],
            )],
        );
        let router = router_with(routing);

        let exclude = vec![("openai".to_string(), "key1".to_string())];
        let success = router.route("req-1", &plain_request(), &exclude, 2).unwrap();
        assert_eq!(success.decision.target.key_alias, "key2");
        assert_eq!(success.decision.attempt, 2);
    }

    #[tokio::test]
    async fn pool_falls_through_to_next_pool() {
        let mut routing = RoutingTable::new();
        routing.insert(
            RouteCategory::Default,
            vec![
                pool("first", PoolMode::Priority, vec![target("openai", "key1")]),
                pool("second", PoolMode::Priority, vec![target("backup", "key1")]),
            ],
        );
        let router = router_with(routing);
        ban_target(&router, "openai", "key1");

        let success = router.route("req-1", &plain_request(), &[], 1).unwrap();
        assert_eq!(success.decision.target.provider, "backup");
        assert_eq!(success.decision.pool_id, "second");
    }

    #[tokio::test]
    async fn category_falls_back_to_default() {
        let mut routing = RoutingTable::new();
        routing.insert(
            RouteCategory::Default,
            vec![pool("d", PoolMode::Priority, vec![target("openai", "key1")])],
        );
        // No thinking pools configured.
        let router = router_with(routing);

        let request = chat(
            r#"{"model":"gpt-5","messages":[{"role":"user","content":"x"}],
                "reasoning_effort":"high"}"#,
        );
        let success = router.route("req-1", &request, &[], 1).unwrap();
        // Classified as thinking, served from default.
        assert_eq!(success.decision.category, RouteCategory::Thinking);
        assert_eq!(success.decision.target.provider, "openai");
    }

    #[tokio::test]
    async fn no_healthy_target_carries_soonest_retry() {
        let mut routing = RoutingTable::new();
        routing.insert(
            RouteCategory::Default,
            vec![pool("d", PoolMode::Priority, vec![target("openai", "key1")])],
        );
        let router = router_with(routing);
        ban_target(&router, "openai", "key1");

        match router.route("req-1", &plain_request(), &[], 1) {
            Err(ProxyError::NoHealthyTarget {
                category,
                retry_after_ms,
            }) => {
                assert_eq!(category, "default");
                let retry = retry_after_ms.unwrap();
                assert!(retry > 0 && retry <= 120_000);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn weighted_pool_always_yields_some_candidate() {
        let mut routing = RoutingTable::new();
        routing.insert(
            RouteCategory::Default,
            vec![RoutePool {
                id: "w".into(),
                mode: PoolMode::Weighted,
                targets: vec![target("openai", "key1"), target("openai", "key2")],
                weights: vec![9, 1],
            }],
        );
        let router = router_with(routing);
        for i in 0..20 {
            let success = router
                .route(&format!("req-{i}"), &plain_request(), &[], 1)
                .unwrap();
            assert_eq!(success.decision.target.provider, "openai");
        }
    }

    #[test]
    fn weighted_order_is_a_permutation() {
        let candidates = vec![0, 1, 2];
        let weights = vec![5, 1, 1];
        for _ in 0..10 {
            let mut order = weighted_order(&candidates, &weights);
            order.sort_unstable();
            assert_eq!(order, candidates);
        }
    }

    #[tokio::test]
    async fn known_targets_deduplicates() {
        let mut routing = RoutingTable::new();
        let shared = target("openai", "key1");
        routing.insert(
            RouteCategory::Default,
            vec![pool("d", PoolMode::Priority, vec![shared.clone()])],
        );
        routing.insert(
            RouteCategory::Tools,
            vec![pool("t", PoolMode::Priority, vec![shared])],
        );
        let router = router_with(routing);
        assert_eq!(router.known_targets().len(), 1);
    }
}

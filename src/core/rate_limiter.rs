//! Rate limiting for the abuse prevention engine.
//!
//! Each tier is a [`RateLimitConfig`] enforced against the shared store with
//! one of two algorithms: a token bucket with lazy wall-clock refill, or a
//! sliding-window log of exact request timestamps. The multi-tier wrapper
//! evaluates every tier that applies to a request and admits it only when
//! all of them do.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::core::store::{SharedStore, StoreError};
use crate::models::{
    ApiKeyTier, EndpointCategory, InboundRequest, RateLimitAlgorithm, RateLimitConfig,
    RateLimitTiers, SubscriptionPlan,
};
use crate::utils::{format_key, format_scoped_key, get_current_timestamp_ms};

/// Deny-listed identifiers stay blocked this long without touching counters.
const DENY_LIST_BLOCK_SECONDS: u64 = 86_400;

/// Errors that can occur during rate limiting operations
#[derive(Error, Debug)]
pub enum RateLimitError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Outcome of a single tier check
#[derive(Debug, Clone)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_time: DateTime<Utc>,
    pub retry_after: Option<u64>,
}

/// Per-identifier limiter over one policy.
pub struct RateLimiter {
    store: Arc<SharedStore>,
}

impl RateLimiter {
    pub fn new(store: Arc<SharedStore>) -> Self {
        Self { store }
    }

    /// Check whether `identifier` may spend `cost` against `config`.
    ///
    /// `scope` namespaces the counter so the same identifier can be limited
    /// independently under several tiers.
    pub async fn check(
        &self,
        config: &RateLimitConfig,
        scope: &str,
        identifier: &str,
        cost: f64,
    ) -> Result<RateLimitDecision, RateLimitError> {
        if config.allow_list.iter().any(|a| a == identifier) {
            return Ok(RateLimitDecision {
                allowed: true,
                limit: config.max_requests,
                remaining: config.max_requests + config.burst_allowance,
                reset_time: Utc::now(),
                retry_after: None,
            });
        }
        if config.deny_list.iter().any(|d| d == identifier) {
            return Ok(RateLimitDecision {
                allowed: false,
                limit: config.max_requests,
                remaining: 0,
                reset_time: Utc::now() + ChronoDuration::seconds(DENY_LIST_BLOCK_SECONDS as i64),
                retry_after: Some(DENY_LIST_BLOCK_SECONDS),
            });
        }

        match config.algorithm {
            RateLimitAlgorithm::TokenBucket => {
                self.check_token_bucket(config, scope, identifier, cost).await
            }
            RateLimitAlgorithm::SlidingWindow => {
                self.check_sliding_window(config, scope, identifier, cost).await
            }
        }
    }

    async fn check_token_bucket(
        &self,
        config: &RateLimitConfig,
        scope: &str,
        identifier: &str,
        cost: f64,
    ) -> Result<RateLimitDecision, RateLimitError> {
        let capacity = (config.max_requests + config.burst_allowance) as f64;
        let refill_rate = config.max_requests as f64 / config.window_seconds as f64;
        let now = get_current_timestamp_ms() as f64 / 1_000.0;
        let key = format_scoped_key("ratelimit:bucket", scope, identifier);

        let (allowed, tokens) = self
            .store
            .token_bucket_take(
                &key,
                capacity,
                refill_rate,
                now,
                cost,
                (config.window_seconds * 2) as usize,
            )
            .await?;

        let refill_secs = ((capacity - tokens) / refill_rate).ceil().max(0.0) as i64;
        let retry_after = if allowed {
            None
        } else {
            Some(retry_after_for_deficit(tokens, cost, refill_rate))
        };

        Ok(RateLimitDecision {
            allowed,
            limit: config.max_requests,
            remaining: tokens.max(0.0).floor() as u32,
            reset_time: Utc::now() + ChronoDuration::seconds(refill_secs),
            retry_after,
        })
    }

    async fn check_sliding_window(
        &self,
        config: &RateLimitConfig,
        scope: &str,
        identifier: &str,
        cost: f64,
    ) -> Result<RateLimitDecision, RateLimitError> {
        let now_ms = get_current_timestamp_ms();
        let window_ms = config.window_seconds as i64 * 1_000;
        let key = format_scoped_key("ratelimit:window", scope, identifier);
        // A throttled request spends more than one slot in the log.
        let effective_max = (config.max_requests as f64 / cost.max(1.0)).floor() as u32;
        let member = format!("{}-{}", now_ms, Uuid::new_v4());

        let (allowed, count, oldest_ms) = self
            .store
            .sliding_window_admit(
                &key,
                now_ms,
                window_ms,
                effective_max,
                &member,
                (config.window_seconds * 2) as usize,
            )
            .await?;

        let reset_ms = if oldest_ms > 0 {
            oldest_ms + window_ms
        } else {
            now_ms + window_ms
        };
        let retry_after = if allowed {
            None
        } else {
            Some((((reset_ms - now_ms).max(0) as f64) / 1_000.0).ceil().max(1.0) as u64)
        };

        Ok(RateLimitDecision {
            allowed,
            limit: config.max_requests,
            remaining: effective_max.saturating_sub(count),
            reset_time: DateTime::<Utc>::from_timestamp_millis(reset_ms).unwrap_or_else(Utc::now),
            retry_after,
        })
    }

    /// Clear limiter state for an identifier under one scope.
    pub async fn reset(&self, scope: &str, identifier: &str) -> Result<(), RateLimitError> {
        self.store
            .delete(&[
                format_scoped_key("ratelimit:bucket", scope, identifier),
                format_scoped_key("ratelimit:window", scope, identifier),
            ])
            .await?;
        Ok(())
    }
}

/// Retry hint for a token-bucket denial: time until the deficit refills.
fn retry_after_for_deficit(tokens: f64, cost: f64, refill_rate: f64) -> u64 {
    let deficit = (cost - tokens).max(0.0);
    ((deficit / refill_rate).ceil() as u64).max(1)
}

/// One evaluated tier
#[derive(Debug, Clone)]
pub struct TierOutcome {
    pub tier: &'static str,
    pub decision: RateLimitDecision,
}

/// Combined result across all applicable tiers
#[derive(Debug, Clone)]
pub struct MultiTierOutcome {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_time: DateTime<Utc>,
    pub retry_after: Option<u64>,
    /// Labels of the tiers that denied the request
    pub denied_tiers: Vec<&'static str>,
}

/// Evaluates the global, IP, plan, API-key, and endpoint-category tiers.
pub struct MultiTierRateLimiter {
    limiter: RateLimiter,
    store: Arc<SharedStore>,
    tiers: RateLimitTiers,
}

impl MultiTierRateLimiter {
    pub fn new(store: Arc<SharedStore>, tiers: RateLimitTiers) -> Self {
        Self {
            limiter: RateLimiter::new(store.clone()),
            store,
            tiers,
        }
    }

    /// Evaluate every applicable tier. The request is allowed only when all
    /// of them allow it; `throttled` applies each tier's penalty multiplier.
    pub async fn check(
        &self,
        request: &InboundRequest,
        throttled: bool,
    ) -> Result<MultiTierOutcome, RateLimitError> {
        let mut outcomes: Vec<TierOutcome> = Vec::with_capacity(5);

        let cost_for = |config: &RateLimitConfig| -> f64 {
            if throttled {
                config.penalty_multiplier.max(1.0)
            } else {
                1.0
            }
        };

        let global = &self.tiers.global;
        outcomes.push(TierOutcome {
            tier: "global",
            decision: self
                .limiter
                .check(global, "global", "all", cost_for(global))
                .await?,
        });

        let ip_config = if self.ip_is_suspicious(&request.client_ip).await? {
            &self.tiers.ip_suspicious
        } else {
            &self.tiers.ip_standard
        };
        outcomes.push(TierOutcome {
            tier: "ip",
            decision: self
                .limiter
                .check(ip_config, "ip", &request.client_ip, cost_for(ip_config))
                .await?,
        });

        if let Some(user_id) = &request.user_id {
            let plan = request.plan.unwrap_or(SubscriptionPlan::Free);
            let plan_config = self.tiers.for_plan(plan);
            outcomes.push(TierOutcome {
                tier: "plan",
                decision: self
                    .limiter
                    .check(plan_config, "plan", user_id, cost_for(plan_config))
                    .await?,
            });
        }

        if let Some(api_key_id) = &request.api_key_id {
            let tier = request.api_key_tier.unwrap_or(ApiKeyTier::Basic);
            let key_config = self.tiers.for_api_key_tier(tier);
            outcomes.push(TierOutcome {
                tier: "api_key",
                decision: self
                    .limiter
                    .check(key_config, "api_key", api_key_id, cost_for(key_config))
                    .await?,
            });
        }

        let category = classify_endpoint(&request.path);
        if let Some(endpoint_config) = self.tiers.for_endpoint(category) {
            let identifier = format!("{}:{}", request.client_ip, category.as_str());
            outcomes.push(TierOutcome {
                tier: "endpoint",
                decision: self
                    .limiter
                    .check(endpoint_config, "endpoint", &identifier, cost_for(endpoint_config))
                    .await?,
            });
        }

        let outcome = combine_tiers(outcomes);
        if !outcome.allowed {
            metrics::increment_counter!(
                "abuse_engine_requests_denied_total",
                "component" => "rate_limiter"
            );
        }
        Ok(outcome)
    }

    async fn ip_is_suspicious(&self, ip: &str) -> Result<bool, RateLimitError> {
        let score = self
            .store
            .get_f64(&format_key("reputation", ip))
            .await?
            .unwrap_or(1.0);
        Ok(score < self.tiers.suspicious_score_threshold)
    }

    /// Clear limiter state for an identifier across every scope.
    pub async fn reset(&self, identifier: &str) -> Result<(), RateLimitError> {
        for scope in ["global", "ip", "plan", "api_key"] {
            self.limiter.reset(scope, identifier).await?;
        }
        for category in ["ai_tools", "uploads", "auth", "exports"] {
            let scoped = format!("{}:{}", identifier, category);
            self.limiter.reset("endpoint", &scoped).await?;
        }
        Ok(())
    }
}

/// Fold tier outcomes into one decision.
///
/// When everything allows, headers reflect the most restrictive successful
/// tier (smallest remaining quota). When several tiers deny at once, the
/// longest `retry_after` wins so clients do not retry before the slowest
/// tier recovers.
pub fn combine_tiers(outcomes: Vec<TierOutcome>) -> MultiTierOutcome {
    let denied: Vec<&TierOutcome> = outcomes.iter().filter(|o| !o.decision.allowed).collect();

    if let Some(blocking) = denied
        .iter()
        .max_by_key(|o| o.decision.retry_after.unwrap_or(0))
    {
        return MultiTierOutcome {
            allowed: false,
            limit: blocking.decision.limit,
            remaining: 0,
            reset_time: blocking.decision.reset_time,
            retry_after: blocking.decision.retry_after,
            denied_tiers: denied.iter().map(|o| o.tier).collect(),
        };
    }

    match outcomes.iter().min_by_key(|o| o.decision.remaining) {
        Some(most_restrictive) => MultiTierOutcome {
            allowed: true,
            limit: most_restrictive.decision.limit,
            remaining: most_restrictive.decision.remaining,
            reset_time: most_restrictive.decision.reset_time,
            retry_after: None,
            denied_tiers: Vec::new(),
        },
        // No tier applied at all; admit with an empty quota report.
        None => MultiTierOutcome {
            allowed: true,
            limit: 0,
            remaining: 0,
            reset_time: Utc::now(),
            retry_after: None,
            denied_tiers: Vec::new(),
        },
    }
}

/// Map a request path to the endpoint-category tier it belongs to.
pub fn classify_endpoint(path: &str) -> EndpointCategory {
    let lowered = path.to_ascii_lowercase();
    if lowered.starts_with("/api/ai")
        || lowered.starts_with("/api/tools")
        || lowered.contains("/generate")
    {
        EndpointCategory::AiTools
    } else if lowered.starts_with("/api/uploads") || lowered.contains("/upload") {
        EndpointCategory::Uploads
    } else if lowered.starts_with("/api/auth")
        || lowered.contains("/login")
        || lowered.contains("/signup")
        || lowered.contains("/oauth")
    {
        EndpointCategory::Auth
    } else if lowered.starts_with("/api/exports")
        || lowered.contains("/export")
        || lowered.contains("/download")
    {
        EndpointCategory::Exports
    } else {
        EndpointCategory::General
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn decision(allowed: bool, remaining: u32, retry_after: Option<u64>) -> RateLimitDecision {
        RateLimitDecision {
            allowed,
            limit: 100,
            remaining,
            reset_time: Utc::now(),
            retry_after,
        }
    }

    #[test]
    fn classify_endpoint_categories() {
        assert_eq!(classify_endpoint("/api/ai/complete"), EndpointCategory::AiTools);
        assert_eq!(classify_endpoint("/api/tools/run"), EndpointCategory::AiTools);
        assert_eq!(classify_endpoint("/api/uploads"), EndpointCategory::Uploads);
        assert_eq!(classify_endpoint("/api/auth/login"), EndpointCategory::Auth);
        assert_eq!(classify_endpoint("/api/exports/csv"), EndpointCategory::Exports);
        assert_eq!(classify_endpoint("/api/widgets/17"), EndpointCategory::General);
    }

    #[test]
    fn combine_picks_most_restrictive_successful_tier() {
        let outcome = combine_tiers(vec![
            TierOutcome { tier: "global", decision: decision(true, 950, None) },
            TierOutcome { tier: "ip", decision: decision(true, 12, None) },
            TierOutcome { tier: "plan", decision: decision(true, 44, None) },
        ]);
        assert!(outcome.allowed);
        assert_eq!(outcome.remaining, 12);
        assert!(outcome.denied_tiers.is_empty());
    }

    #[test]
    fn combine_takes_longest_retry_after_on_deny() {
        let outcome = combine_tiers(vec![
            TierOutcome { tier: "global", decision: decision(true, 950, None) },
            TierOutcome { tier: "ip", decision: decision(false, 0, Some(30)) },
            TierOutcome { tier: "endpoint", decision: decision(false, 0, Some(120)) },
        ]);
        assert!(!outcome.allowed);
        assert_eq!(outcome.remaining, 0);
        assert_eq!(outcome.retry_after, Some(120));
        assert_eq!(outcome.denied_tiers, vec!["ip", "endpoint"]);
    }

    #[test]
    fn retry_hint_covers_token_deficit() {
        // 0.5 tokens short at 0.5 tokens/s refills in one second.
        assert_eq!(retry_after_for_deficit(0.5, 1.0, 0.5), 1);
        // 10 tokens short at 2 tokens/s takes five seconds.
        assert_eq!(retry_after_for_deficit(0.0, 10.0, 2.0), 5);
        // Never report zero; clients must back off at least a second.
        assert_eq!(retry_after_for_deficit(5.0, 1.0, 1.0), 1);
    }

    fn store() -> Arc<SharedStore> {
        let client = redis::Client::open("redis://127.0.0.1:6379").unwrap();
        Arc::new(SharedStore::new(client, Duration::from_millis(250)))
    }

    #[tokio::test]
    #[ignore = "requires a local Redis instance"]
    async fn deny_list_blocks_without_counters() {
        let limiter = RateLimiter::new(store());
        let config = RateLimitConfig {
            deny_list: vec!["bad-actor".to_string()],
            ..RateLimitConfig::default()
        };

        let decision = limiter.check(&config, "ip", "bad-actor", 1.0).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert_eq!(decision.retry_after, Some(86_400));
    }

    #[tokio::test]
    #[ignore = "requires a local Redis instance"]
    async fn sliding_window_admits_up_to_limit() {
        let limiter = RateLimiter::new(store());
        let config = RateLimitConfig {
            algorithm: RateLimitAlgorithm::SlidingWindow,
            max_requests: 3,
            window_seconds: 60,
            ..RateLimitConfig::default()
        };
        let id = format!("test-{}", Uuid::new_v4());

        for _ in 0..3 {
            assert!(limiter.check(&config, "ip", &id, 1.0).await.unwrap().allowed);
        }
        let denied = limiter.check(&config, "ip", &id, 1.0).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert!(denied.retry_after.unwrap_or(0) > 0);
    }
}

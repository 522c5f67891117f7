//! Request evaluation pipeline for the abuse prevention engine.
//!
//! Components run cheapest-first: cached response actions, then the rate
//! limiter, then the firewall, then (for authenticated users with enough
//! history) the anomaly detector. Every violation feeds the response
//! coordinator, which may escalate even when the current request was
//! otherwise allowed. Store failures fail the request closed.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::core::anomaly::{AnomalyDetector, AnomalyError};
use crate::core::profile::ProfileStore;
use crate::core::rate_limiter::{MultiTierRateLimiter, RateLimitError};
use crate::core::response::{
    ResponseActionKind, ResponseCoordinator, ResponseError, SecurityViolation,
};
use crate::core::store::StoreError;
use crate::core::waf::{FirewallEngine, WafError, GENERIC_BLOCK_MESSAGE};
use crate::models::InboundRequest;

/// How long a degraded-mode denial asks the client to back off.
const DEGRADED_RETRY_AFTER_SECONDS: u64 = 60;

/// Errors that can occur inside the evaluation pipeline
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("rate limiter failed: {0}")]
    RateLimit(#[from] RateLimitError),
    #[error("firewall failed: {0}")]
    Waf(#[from] WafError),
    #[error("anomaly detector failed: {0}")]
    Anomaly(#[from] AnomalyError),
    #[error("response coordinator failed: {0}")]
    Response(#[from] ResponseError),
    #[error("store failed: {0}")]
    Store(#[from] StoreError),
}

/// Challenge demanded before the request may proceed
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeKind {
    Captcha,
    Mfa,
}

/// Quota headers the caller must surface on every decision
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitHeaders {
    pub limit: u32,
    pub remaining: u32,
    pub reset: DateTime<Utc>,
    pub retry_after: Option<u64>,
}

/// What the caller translates into a transport response
#[derive(Debug, Serialize)]
pub struct EngineDecision {
    pub allowed: bool,
    pub status: u16,
    pub message: String,
    pub challenge: Option<ChallengeKind>,
    pub rate_limit: Option<RateLimitHeaders>,
    pub degraded: bool,
}

impl EngineDecision {
    fn allow(rate_limit: RateLimitHeaders) -> Self {
        Self {
            allowed: true,
            status: 200,
            message: "OK".to_string(),
            challenge: None,
            rate_limit: Some(rate_limit),
            degraded: false,
        }
    }

    fn deny_rate_limited(rate_limit: RateLimitHeaders) -> Self {
        Self {
            allowed: false,
            status: 429,
            message: "Rate limit exceeded".to_string(),
            challenge: None,
            rate_limit: Some(rate_limit),
            degraded: false,
        }
    }

    fn deny_blocked(rate_limit: Option<RateLimitHeaders>) -> Self {
        Self {
            allowed: false,
            status: 403,
            message: GENERIC_BLOCK_MESSAGE.to_string(),
            challenge: None,
            rate_limit,
            degraded: false,
        }
    }

    fn challenge(kind: ChallengeKind, rate_limit: Option<RateLimitHeaders>) -> Self {
        Self {
            allowed: false,
            status: 403,
            message: "Additional verification required".to_string(),
            challenge: Some(kind),
            rate_limit,
            degraded: false,
        }
    }

    fn degraded_deny() -> Self {
        Self {
            allowed: false,
            status: 429,
            message: "Service temporarily limited".to_string(),
            challenge: None,
            rate_limit: Some(RateLimitHeaders {
                limit: 0,
                remaining: 0,
                reset: Utc::now() + ChronoDuration::seconds(DEGRADED_RETRY_AFTER_SECONDS as i64),
                retry_after: Some(DEGRADED_RETRY_AFTER_SECONDS),
            }),
            degraded: true,
        }
    }
}

/// The full evaluation pipeline
pub struct AbusePreventionEngine {
    limiter: MultiTierRateLimiter,
    firewall: FirewallEngine,
    detector: AnomalyDetector,
    profiles: Arc<dyn ProfileStore>,
    coordinator: ResponseCoordinator,
}

impl AbusePreventionEngine {
    pub fn new(
        limiter: MultiTierRateLimiter,
        firewall: FirewallEngine,
        detector: AnomalyDetector,
        profiles: Arc<dyn ProfileStore>,
        coordinator: ResponseCoordinator,
    ) -> Self {
        Self {
            limiter,
            firewall,
            detector,
            profiles,
            coordinator,
        }
    }

    pub fn limiter(&self) -> &MultiTierRateLimiter {
        &self.limiter
    }

    /// Clear limiter counters, trailing violations, and any cached action
    /// for an identifier.
    pub async fn reset_identifier(&self, identifier: &str) -> Result<(), EngineError> {
        self.limiter.reset(identifier).await?;
        self.coordinator.clear(identifier).await?;
        Ok(())
    }

    /// Evaluate one inbound request. Never errors toward the caller: a
    /// failing store degrades to a bounded default deny.
    pub async fn evaluate(&self, request: &InboundRequest) -> EngineDecision {
        metrics::increment_counter!("abuse_engine_requests_total");
        match self.evaluate_inner(request).await {
            Ok(decision) => decision,
            Err(e) => {
                let identifier = request.primary_identifier();
                log::error!(
                    "degraded mode: evaluation failed for {}: {}",
                    identifier,
                    e
                );
                metrics::increment_counter!("abuse_engine_degraded_total");
                self.coordinator
                    .audit(identifier, "evaluation_failure", "deny_degraded", vec![e.to_string()])
                    .await;
                EngineDecision::degraded_deny()
            }
        }
    }

    async fn evaluate_inner(
        &self,
        request: &InboundRequest,
    ) -> Result<EngineDecision, EngineError> {
        let identifier = request.primary_identifier().to_string();

        // An active response action short-circuits full evaluation.
        let mut throttled = false;
        if let Some(active) = self.coordinator.active_action(&identifier).await? {
            match active.action {
                ResponseActionKind::Block | ResponseActionKind::AccountLock => {
                    self.coordinator
                        .audit(&identifier, "cached_action", active.action.as_str(), vec![active.reason])
                        .await;
                    return Ok(EngineDecision::deny_blocked(None));
                }
                ResponseActionKind::Captcha => {
                    return Ok(EngineDecision::challenge(ChallengeKind::Captcha, None));
                }
                ResponseActionKind::MfaRequired => {
                    return Ok(EngineDecision::challenge(ChallengeKind::Mfa, None));
                }
                ResponseActionKind::Throttle => throttled = true,
            }
        }

        let limits = self.limiter.check(request, throttled).await?;
        let headers = RateLimitHeaders {
            limit: limits.limit,
            remaining: limits.remaining,
            reset: limits.reset_time,
            retry_after: limits.retry_after,
        };

        if !limits.allowed {
            let violations: Vec<SecurityViolation> = limits
                .denied_tiers
                .iter()
                .map(|tier| SecurityViolation::rate_limit(&identifier, tier))
                .collect();
            // The escalation outcome applies from the next request on; this
            // one is already denied.
            self.coordinator
                .evaluate_and_respond(&identifier, &violations)
                .await?;
            self.coordinator
                .audit(
                    &identifier,
                    "rate_limit_deny",
                    "429",
                    limits.denied_tiers.iter().map(|t| t.to_string()).collect(),
                )
                .await;
            return Ok(EngineDecision::deny_rate_limited(headers));
        }

        let analysis = self.firewall.analyze(request, &identifier).await?;
        let mut violations: Vec<SecurityViolation> = analysis
            .detections
            .iter()
            .map(|d| SecurityViolation::from_waf(&identifier, d))
            .collect();

        if analysis.blocked() {
            let sources = violations.iter().map(|v| v.source.clone()).collect();
            self.coordinator
                .evaluate_and_respond(&identifier, &violations)
                .await?;
            self.coordinator
                .audit(&identifier, "waf_block", "403", sources)
                .await;
            return Ok(EngineDecision::deny_blocked(Some(headers)));
        }

        if let Some(user_id) = &request.user_id {
            match self.profiles.fetch(user_id).await {
                Ok(Some(profile)) => {
                    let anomalies = self.detector.analyze(request, &profile).await?;
                    violations.extend(
                        anomalies
                            .iter()
                            .map(|a| SecurityViolation::from_anomaly(&identifier, a)),
                    );
                }
                Ok(None) => {}
                Err(e) => {
                    // Anomaly scoring is advisory; a missing profile store
                    // degrades to abstention rather than a deny.
                    log::warn!("profile fetch failed for {}, skipping anomaly checks: {}", user_id, e);
                }
            }
        }

        if !violations.is_empty() {
            if let Some(action) = self
                .coordinator
                .evaluate_and_respond(&identifier, &violations)
                .await?
            {
                match action.action {
                    ResponseActionKind::Block | ResponseActionKind::AccountLock => {
                        return Ok(EngineDecision::deny_blocked(Some(headers)));
                    }
                    ResponseActionKind::Captcha => {
                        return Ok(EngineDecision::challenge(
                            ChallengeKind::Captcha,
                            Some(headers),
                        ));
                    }
                    ResponseActionKind::MfaRequired => {
                        return Ok(EngineDecision::challenge(ChallengeKind::Mfa, Some(headers)));
                    }
                    ResponseActionKind::Throttle => {}
                }
            }
        }

        Ok(EngineDecision::allow(headers))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::alerting::{LogAlertSink, Notifier};
    use crate::core::geo::StaticGeoLocator;
    use crate::core::profile::RedisProfileStore;
    use crate::core::response::{ResponseAction, ResponseConfig};
    use crate::core::store::SharedStore;
    use crate::core::waf::FirewallEngine;
    use crate::models::{AnomalyConfig, Config, InboundRequest, WafConfig};
    use std::collections::HashMap;
    use std::time::Duration;
    use uuid::Uuid;

    fn engine_with_store() -> (AbusePreventionEngine, Arc<SharedStore>) {
        let client = redis::Client::open("redis://127.0.0.1:6379").unwrap();
        let store = Arc::new(SharedStore::new(client, Duration::from_millis(250)));
        let config = Config::default();

        let limiter = MultiTierRateLimiter::new(store.clone(), config.rate_limit.clone());
        let firewall = FirewallEngine::new(store.clone(), WafConfig::default());
        let geo = Arc::new(StaticGeoLocator::new(HashMap::new()));
        let detector = AnomalyDetector::new(store.clone(), geo, AnomalyConfig::default());
        let profiles = Arc::new(RedisProfileStore::new(store.clone()));
        let coordinator = ResponseCoordinator::new(
            store.clone(),
            ResponseConfig::default(),
            Notifier::new(vec![Arc::new(LogAlertSink)]),
        );

        (
            AbusePreventionEngine::new(limiter, firewall, detector, profiles, coordinator),
            store,
        )
    }

    fn request(ip: &str) -> InboundRequest {
        InboundRequest {
            client_ip: ip.to_string(),
            user_id: None,
            plan: None,
            api_key_id: None,
            api_key_tier: None,
            method: "GET".to_string(),
            path: "/api/widgets".to_string(),
            headers: HashMap::new(),
            query: HashMap::new(),
            body: None,
            cookies: HashMap::new(),
            tool_name: None,
            tool_params: None,
        }
    }

    #[test]
    fn decision_constructors_carry_transport_semantics() {
        let headers = RateLimitHeaders {
            limit: 100,
            remaining: 0,
            reset: Utc::now(),
            retry_after: Some(30),
        };

        let denied = EngineDecision::deny_rate_limited(headers);
        assert_eq!(denied.status, 429);
        assert!(!denied.allowed);
        assert_eq!(denied.rate_limit.as_ref().unwrap().remaining, 0);

        let blocked = EngineDecision::deny_blocked(None);
        assert_eq!(blocked.status, 403);
        assert_eq!(blocked.message, GENERIC_BLOCK_MESSAGE);

        let degraded = EngineDecision::degraded_deny();
        assert!(degraded.degraded);
        assert!(degraded.rate_limit.unwrap().retry_after.unwrap() > 0);
    }

    #[tokio::test]
    #[ignore = "requires a local Redis instance"]
    async fn benign_request_is_allowed_with_quota_headers() {
        let (engine, _) = engine_with_store();
        let decision = engine.evaluate(&request("198.51.100.7")).await;
        assert!(decision.allowed);
        let headers = decision.rate_limit.unwrap();
        assert!(headers.remaining < headers.limit + 1);
    }

    #[tokio::test]
    #[ignore = "requires a local Redis instance"]
    async fn active_block_action_short_circuits_evaluation() {
        let (engine, store) = engine_with_store();
        let ip = format!("198.51.100.{}", 1 + (Uuid::new_v4().as_u128() % 250) as u8);

        let action = ResponseAction {
            id: Uuid::new_v4().to_string(),
            identifier: ip.clone(),
            action: ResponseActionKind::Block,
            reason: "test block".to_string(),
            duration_seconds: 60,
            created_at: Utc::now(),
            expires_at: Utc::now() + ChronoDuration::seconds(60),
        };
        store
            .set_json_ex(&format!("action:{}", ip), &action, 60)
            .await
            .unwrap();

        let decision = engine.evaluate(&request(&ip)).await;
        assert!(!decision.allowed);
        assert_eq!(decision.status, 403);
        assert_eq!(decision.message, GENERIC_BLOCK_MESSAGE);
    }

    #[tokio::test]
    #[ignore = "requires a local Redis instance"]
    async fn sql_injection_probe_is_blocked_generically() {
        let (engine, _) = engine_with_store();
        let mut req = request("198.51.100.8");
        req.query.insert(
            "q".to_string(),
            "' UNION SELECT password FROM users--".to_string(),
        );

        let decision = engine.evaluate(&req).await;
        assert!(!decision.allowed);
        assert_eq!(decision.status, 403);
        assert_eq!(decision.message, GENERIC_BLOCK_MESSAGE);
    }
}

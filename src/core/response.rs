//! Automated response coordination for the abuse prevention engine.
//!
//! Violations from the rate limiter, firewall, and anomaly detector are
//! collected into a trailing per-identifier window and matched against an
//! ordered table of escalation rules. The most severe matching rule decides
//! the action, which is persisted with an expiry so later requests
//! short-circuit without re-running analysis.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::core::alerting::{AlertChannel, AlertPayload, Notifier};
use crate::core::anomaly::AnomalyDetection;
use crate::core::store::{SharedStore, StoreError};
use crate::core::waf::WafDetection;
use crate::models::Severity;
use crate::utils::format_key;

/// Errors that can occur during response coordination
#[derive(Error, Debug)]
pub enum ResponseError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Source component of a violation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    RateLimit,
    WafDetection,
    Anomaly,
}

/// Normalized violation record shared by all three detection components
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityViolation {
    pub id: String,
    pub identifier: String,
    pub kind: ViolationKind,
    pub severity: Severity,
    pub confidence: Option<f64>,
    pub source: String,
    pub timestamp: DateTime<Utc>,
}

impl SecurityViolation {
    pub fn rate_limit(identifier: &str, tier: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            identifier: identifier.to_string(),
            kind: ViolationKind::RateLimit,
            severity: Severity::Medium,
            confidence: None,
            source: format!("rate_limit:{}", tier),
            timestamp: Utc::now(),
        }
    }

    pub fn from_waf(identifier: &str, detection: &WafDetection) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            identifier: identifier.to_string(),
            kind: ViolationKind::WafDetection,
            severity: detection.severity,
            confidence: Some(detection.confidence),
            source: detection.category.as_str().to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn from_anomaly(identifier: &str, detection: &AnomalyDetection) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            identifier: identifier.to_string(),
            kind: ViolationKind::Anomaly,
            severity: detection.severity,
            confidence: Some(detection.confidence),
            source: detection.kind.as_str().to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// Automated response, ordered from least to most severe
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ResponseActionKind {
    Throttle,
    Block,
    Captcha,
    MfaRequired,
    AccountLock,
}

impl ResponseActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseActionKind::Throttle => "throttle",
            ResponseActionKind::Block => "block",
            ResponseActionKind::Captcha => "captcha",
            ResponseActionKind::MfaRequired => "mfa_required",
            ResponseActionKind::AccountLock => "account_lock",
        }
    }
}

/// Executed response, persisted for the duration of its effect
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseAction {
    pub id: String,
    pub identifier: String,
    pub action: ResponseActionKind,
    pub reason: String,
    pub duration_seconds: u64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Condition over aggregated violations mapping to an action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationRule {
    pub name: String,
    /// Trailing window the rule looks at, in seconds
    pub window_seconds: u64,
    #[serde(default)]
    pub min_rate_limit_violations: u32,
    #[serde(default)]
    pub min_waf_detections: u32,
    #[serde(default)]
    pub min_anomaly_confidence: Option<f64>,
    /// Floor on the most severe violation inside the window
    #[serde(default)]
    pub min_severity: Option<Severity>,
    pub action: ResponseActionKind,
    pub duration_seconds: u64,
}

/// Response coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponseConfig {
    pub escalation_rules: Vec<EscalationRule>,
    /// How long violations stay queryable, in seconds
    pub violation_retention_seconds: u64,
    pub audit_log_max_entries: i64,
}

impl Default for ResponseConfig {
    fn default() -> Self {
        use ResponseActionKind::*;
        Self {
            escalation_rules: vec![
                EscalationRule {
                    name: "repeated_rate_limit_violations".to_string(),
                    window_seconds: 300,
                    min_rate_limit_violations: 3,
                    min_waf_detections: 0,
                    min_anomaly_confidence: None,
                    min_severity: None,
                    action: Throttle,
                    duration_seconds: 600,
                },
                EscalationRule {
                    name: "sustained_rate_abuse".to_string(),
                    window_seconds: 900,
                    min_rate_limit_violations: 10,
                    min_waf_detections: 0,
                    min_anomaly_confidence: None,
                    min_severity: None,
                    action: Block,
                    duration_seconds: 3_600,
                },
                EscalationRule {
                    name: "injection_probing".to_string(),
                    window_seconds: 300,
                    min_rate_limit_violations: 0,
                    min_waf_detections: 3,
                    min_anomaly_confidence: None,
                    min_severity: Some(Severity::High),
                    action: Block,
                    duration_seconds: 7_200,
                },
                EscalationRule {
                    name: "mixed_signals_challenge".to_string(),
                    window_seconds: 300,
                    min_rate_limit_violations: 1,
                    min_waf_detections: 1,
                    min_anomaly_confidence: None,
                    min_severity: Some(Severity::Medium),
                    action: Captcha,
                    duration_seconds: 900,
                },
                EscalationRule {
                    name: "high_confidence_anomaly".to_string(),
                    window_seconds: 600,
                    min_rate_limit_violations: 0,
                    min_waf_detections: 0,
                    min_anomaly_confidence: Some(0.85),
                    min_severity: Some(Severity::High),
                    action: MfaRequired,
                    duration_seconds: 3_600,
                },
                EscalationRule {
                    name: "critical_threat_lockdown".to_string(),
                    window_seconds: 300,
                    min_rate_limit_violations: 3,
                    min_waf_detections: 1,
                    min_anomaly_confidence: None,
                    min_severity: Some(Severity::Critical),
                    action: AccountLock,
                    duration_seconds: 86_400,
                },
            ],
            violation_retention_seconds: 1_800,
            audit_log_max_entries: 10_000,
        }
    }
}

/// Append-only audit record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub identifier: String,
    pub event: String,
    pub outcome: String,
    pub signals: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// Aggregated view of the violations inside one rule's window
#[derive(Debug, Default)]
struct ViolationSummary {
    rate_limit_count: u32,
    waf_count: u32,
    max_severity: Option<Severity>,
    max_anomaly_confidence: f64,
}

fn summarize(violations: &[&SecurityViolation]) -> ViolationSummary {
    let mut summary = ViolationSummary::default();
    for violation in violations {
        match violation.kind {
            ViolationKind::RateLimit => summary.rate_limit_count += 1,
            ViolationKind::WafDetection => summary.waf_count += 1,
            ViolationKind::Anomaly => {
                let confidence = violation.confidence.unwrap_or(0.0);
                if confidence > summary.max_anomaly_confidence {
                    summary.max_anomaly_confidence = confidence;
                }
            }
        }
        summary.max_severity = Some(match summary.max_severity {
            Some(current) => current.max(violation.severity),
            None => violation.severity,
        });
    }
    summary
}

fn rule_matches(rule: &EscalationRule, summary: &ViolationSummary) -> bool {
    if summary.rate_limit_count < rule.min_rate_limit_violations {
        return false;
    }
    if summary.waf_count < rule.min_waf_detections {
        return false;
    }
    if let Some(min_confidence) = rule.min_anomaly_confidence {
        if summary.max_anomaly_confidence < min_confidence {
            return false;
        }
    }
    if let Some(floor) = rule.min_severity {
        match summary.max_severity {
            Some(max) if max >= floor => {}
            _ => return false,
        }
    }
    // A rule with no minimums at all would match everything; require at
    // least one configured condition to have had a chance to filter.
    rule.min_rate_limit_violations > 0
        || rule.min_waf_detections > 0
        || rule.min_anomaly_confidence.is_some()
}

/// Pick the most severe escalation rule matched by the trailing violations.
pub fn select_rule<'a>(
    rules: &'a [EscalationRule],
    violations: &[SecurityViolation],
    now: DateTime<Utc>,
) -> Option<&'a EscalationRule> {
    rules
        .iter()
        .filter(|rule| {
            let horizon = now - ChronoDuration::seconds(rule.window_seconds as i64);
            let in_window: Vec<&SecurityViolation> = violations
                .iter()
                .filter(|v| v.timestamp >= horizon)
                .collect();
            rule_matches(rule, &summarize(&in_window))
        })
        .max_by_key(|rule| rule.action)
}

/// Notification audiences scale with action severity.
pub fn channels_for(action: ResponseActionKind) -> Vec<AlertChannel> {
    match action {
        ResponseActionKind::Throttle | ResponseActionKind::Block => vec![AlertChannel::Security],
        ResponseActionKind::Captcha | ResponseActionKind::MfaRequired => {
            vec![AlertChannel::Security, AlertChannel::OnCall]
        }
        ResponseActionKind::AccountLock => vec![
            AlertChannel::Security,
            AlertChannel::Compliance,
            AlertChannel::Management,
        ],
    }
}

/// Automated response coordinator
pub struct ResponseCoordinator {
    store: Arc<SharedStore>,
    config: ResponseConfig,
    notifier: Notifier,
}

impl ResponseCoordinator {
    pub fn new(store: Arc<SharedStore>, config: ResponseConfig, notifier: Notifier) -> Self {
        Self { store, config, notifier }
    }

    /// Currently cached action for an identifier, if one is still active.
    pub async fn active_action(
        &self,
        identifier: &str,
    ) -> Result<Option<ResponseAction>, ResponseError> {
        let action: Option<ResponseAction> =
            self.store.get_json(&format_key("action", identifier)).await?;
        Ok(action.filter(|a| a.expires_at > Utc::now()))
    }

    /// Record new violations, evaluate escalation rules over the trailing
    /// window, and execute the most severe matching action.
    pub async fn evaluate_and_respond(
        &self,
        identifier: &str,
        violations: &[SecurityViolation],
    ) -> Result<Option<ResponseAction>, ResponseError> {
        if violations.is_empty() {
            return Ok(None);
        }

        let now = Utc::now();
        let window_key = format_key("violations", identifier);
        let retention_ms = self.config.violation_retention_seconds as i64 * 1_000;

        for violation in violations {
            let json = serde_json::to_string(violation)
                .map_err(|e| StoreError::Decode(e.to_string()))?;
            self.store
                .window_record(
                    &window_key,
                    &json,
                    violation.timestamp.timestamp_millis(),
                    now.timestamp_millis() - retention_ms,
                    self.config.violation_retention_seconds as usize * 2,
                )
                .await?;
        }

        let since = now.timestamp_millis() - retention_ms;
        let trailing: Vec<SecurityViolation> = self
            .store
            .window_events(&window_key, since)
            .await?
            .iter()
            .filter_map(|json| serde_json::from_str(json).ok())
            .collect();

        let rule = match select_rule(&self.config.escalation_rules, &trailing, now) {
            Some(rule) => rule,
            None => return Ok(None),
        };

        let action = ResponseAction {
            id: Uuid::new_v4().to_string(),
            identifier: identifier.to_string(),
            action: rule.action,
            reason: rule.name.clone(),
            duration_seconds: rule.duration_seconds,
            created_at: now,
            expires_at: now + ChronoDuration::seconds(rule.duration_seconds as i64),
        };

        self.store
            .set_json_ex(
                &format_key("action", identifier),
                &action,
                rule.duration_seconds as usize,
            )
            .await?;

        metrics::increment_counter!(
            "abuse_engine_actions_total",
            "action" => rule.action.as_str()
        );
        log::warn!(
            "automated response {} against {} ({}, {}s)",
            rule.action.as_str(),
            identifier,
            rule.name,
            rule.duration_seconds
        );

        self.audit(
            identifier,
            "response_action",
            rule.action.as_str(),
            violations.iter().map(|v| v.source.clone()).collect(),
        )
        .await;

        let payload = AlertPayload {
            action_id: action.id.clone(),
            identifier: identifier.to_string(),
            action: rule.action.as_str().to_string(),
            reason: rule.name.clone(),
            timestamp: now,
        };
        self.notifier
            .dispatch(&channels_for(rule.action), &payload)
            .await;

        Ok(Some(action))
    }

    /// Drop the trailing violation window and any cached action for an
    /// identifier. Used by operator reset tooling.
    pub async fn clear(&self, identifier: &str) -> Result<(), ResponseError> {
        self.store
            .delete(&[
                format_key("action", identifier),
                format_key("violations", identifier),
            ])
            .await?;
        Ok(())
    }

    /// Append to the audit trail; best effort, never fails the request.
    pub async fn audit(
        &self,
        identifier: &str,
        event: &str,
        outcome: &str,
        signals: Vec<String>,
    ) {
        let entry = AuditEntry {
            id: Uuid::new_v4().to_string(),
            identifier: identifier.to_string(),
            event: event.to_string(),
            outcome: outcome.to_string(),
            signals,
            timestamp: Utc::now(),
        };
        log::info!(
            "audit: {} {} -> {} [{}]",
            entry.identifier,
            entry.event,
            entry.outcome,
            entry.signals.join(",")
        );
        match serde_json::to_string(&entry) {
            Ok(json) => {
                if let Err(e) = self
                    .store
                    .list_append_bounded("audit:log", &json, self.config.audit_log_max_entries)
                    .await
                {
                    log::error!("audit trail write failed: {}", e);
                }
            }
            Err(e) => log::error!("audit entry serialization failed: {}", e),
        }
    }
}

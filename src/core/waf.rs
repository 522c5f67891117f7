//! Firewall rule engine for the abuse prevention engine.
//!
//! Requests are scanned field by field against an ordered table of
//! threat-detection rules. Rules are data: a built-in table covers the
//! common injection classes and an optional JSON file can extend it without
//! code changes. A separate stateful check catches repeated identical tool
//! calls that no static pattern would flag.

use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::core::store::{SharedStore, StoreError};
use crate::models::{InboundRequest, Severity, WafConfig};

/// Denials never reveal which rule fired.
pub const GENERIC_BLOCK_MESSAGE: &str = "Request blocked by security policy";

/// Errors that can occur during firewall analysis
#[derive(Error, Debug)]
pub enum WafError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Threat category of a rule
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ThreatCategory {
    SqlInjection,
    Xss,
    PathTraversal,
    CommandInjection,
    NosqlInjection,
    Ssrf,
    AutomationReplay,
}

impl ThreatCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatCategory::SqlInjection => "sql_injection",
            ThreatCategory::Xss => "xss",
            ThreatCategory::PathTraversal => "path_traversal",
            ThreatCategory::CommandInjection => "command_injection",
            ThreatCategory::NosqlInjection => "nosql_injection",
            ThreatCategory::Ssrf => "ssrf",
            ThreatCategory::AutomationReplay => "automation_replay",
        }
    }
}

/// What a matching rule recommends
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Block,
    Warn,
    Log,
}

/// Compiled firewall rule
#[derive(Debug)]
pub struct WafRule {
    pub id: String,
    pub category: ThreatCategory,
    pub severity: Severity,
    pub action: RuleAction,
    pub pattern: Regex,
    pub false_positive_rate: f64,
    pub enabled: bool,
    pub description: String,
}

/// Serializable rule definition, as found in a rules file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WafRuleSpec {
    pub id: String,
    pub category: ThreatCategory,
    pub severity: Severity,
    pub action: RuleAction,
    pub pattern: String,
    #[serde(default)]
    pub false_positive_rate: f64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub description: String,
}

fn default_enabled() -> bool {
    true
}

/// Result of one rule matching one request field
#[derive(Debug, Clone, Serialize)]
pub struct WafDetection {
    pub rule_id: String,
    pub category: ThreatCategory,
    pub severity: Severity,
    pub action: RuleAction,
    pub field: &'static str,
    pub confidence: f64,
}

/// Overall verdict for a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WafVerdict {
    Allow,
    AllowWithWarning,
    Block,
}

/// Full analysis result
#[derive(Debug)]
pub struct WafAnalysis {
    pub verdict: WafVerdict,
    pub detections: Vec<WafDetection>,
}

impl WafAnalysis {
    pub fn blocked(&self) -> bool {
        self.verdict == WafVerdict::Block
    }
}

/// Firewall rule engine
pub struct FirewallEngine {
    rules: Vec<WafRule>,
    store: Arc<SharedStore>,
    config: WafConfig,
}

impl FirewallEngine {
    pub fn new(store: Arc<SharedStore>, config: WafConfig) -> Self {
        let mut specs = builtin_rules();
        if let Some(path) = &config.rules_file {
            specs.extend(load_rules_file(path));
        }
        let rules = specs.into_iter().filter_map(compile_rule).collect();
        Self { rules, store, config }
    }

    /// Scan request content against every enabled rule. Each rule produces
    /// at most one detection, attributed to the first field it matched.
    pub fn scan(&self, request: &InboundRequest) -> Vec<WafDetection> {
        let fields = candidate_fields(request);
        let mut detections = Vec::new();

        for rule in self.rules.iter().filter(|r| r.enabled) {
            for (field, text) in &fields {
                if rule.pattern.is_match(text) {
                    detections.push(WafDetection {
                        rule_id: rule.id.clone(),
                        category: rule.category,
                        severity: rule.severity,
                        action: rule.action,
                        field: *field,
                        confidence: 1.0 - rule.false_positive_rate,
                    });
                    break;
                }
            }
        }

        detections
    }

    /// Full analysis: pattern scan plus the stateful repeated-call check.
    pub async fn analyze(
        &self,
        request: &InboundRequest,
        identifier: &str,
    ) -> Result<WafAnalysis, WafError> {
        if !self.config.enabled {
            return Ok(WafAnalysis { verdict: WafVerdict::Allow, detections: Vec::new() });
        }

        let mut detections = self.scan(request);
        if let Some(replay) = self.check_repeated_call(request, identifier).await? {
            detections.push(replay);
        }

        for detection in &detections {
            metrics::increment_counter!(
                "abuse_engine_waf_detections_total",
                "category" => detection.category.as_str()
            );
        }

        let verdict = decide(&detections);
        if verdict == WafVerdict::Block {
            metrics::increment_counter!(
                "abuse_engine_requests_denied_total",
                "component" => "waf"
            );
        }
        Ok(WafAnalysis { verdict, detections })
    }

    /// Flags identical tool invocations repeated past the threshold within
    /// the trailing window, even when no static pattern matched.
    async fn check_repeated_call(
        &self,
        request: &InboundRequest,
        identifier: &str,
    ) -> Result<Option<WafDetection>, WafError> {
        let tool_name = match &request.tool_name {
            Some(name) => name,
            None => return Ok(None),
        };

        let fingerprint = call_fingerprint(tool_name, request.tool_params.as_ref());
        let key = format!("waf:repeat:{}:{}", identifier, fingerprint);
        let count = self
            .store
            .incr_expire(&key, 1, self.config.repeat_call_window_seconds as usize)
            .await?;

        if count >= self.config.repeat_call_threshold as i64 {
            log::warn!(
                "repeated identical tool call from {}: {} occurrences of {}",
                identifier,
                count,
                tool_name
            );
            return Ok(Some(WafDetection {
                rule_id: "waf-replay-001".to_string(),
                category: ThreatCategory::AutomationReplay,
                severity: Severity::Medium,
                action: RuleAction::Warn,
                field: "tool_params",
                confidence: 0.9,
            }));
        }
        Ok(None)
    }
}

/// Decision policy, first match wins:
/// critical block, high block, three mediums, then warn/allow.
pub fn decide(detections: &[WafDetection]) -> WafVerdict {
    if detections
        .iter()
        .any(|d| d.severity == Severity::Critical && d.action == RuleAction::Block)
    {
        return WafVerdict::Block;
    }
    if detections
        .iter()
        .any(|d| d.severity == Severity::High && d.action == RuleAction::Block)
    {
        return WafVerdict::Block;
    }
    let medium_count = detections
        .iter()
        .filter(|d| d.severity == Severity::Medium)
        .count();
    if medium_count >= 3 {
        return WafVerdict::Block;
    }
    if detections.is_empty() {
        WafVerdict::Allow
    } else {
        WafVerdict::AllowWithWarning
    }
}

/// Stable fingerprint of a tool call; identical parameter bytes hash the
/// same across process instances.
pub fn call_fingerprint(tool_name: &str, params: Option<&serde_json::Value>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tool_name.as_bytes());
    hasher.update([0u8]);
    if let Some(params) = params {
        hasher.update(params.to_string().as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

fn candidate_fields(request: &InboundRequest) -> Vec<(&'static str, String)> {
    let mut fields = vec![("url", request.path.clone())];

    if !request.headers.is_empty() {
        let headers = request
            .headers
            .iter()
            .map(|(k, v)| format!("{}: {}", k, v))
            .collect::<Vec<_>>()
            .join("\n");
        fields.push(("headers", headers));
    }
    if !request.query.is_empty() {
        let query = request
            .query
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        fields.push(("query", query));
    }
    if let Some(body) = &request.body {
        fields.push(("body", body.clone()));
    }
    if !request.cookies.is_empty() {
        let cookies = request
            .cookies
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("; ");
        fields.push(("cookies", cookies));
    }

    fields
}

fn compile_rule(spec: WafRuleSpec) -> Option<WafRule> {
    match Regex::new(&spec.pattern) {
        Ok(pattern) => Some(WafRule {
            id: spec.id,
            category: spec.category,
            severity: spec.severity,
            action: spec.action,
            pattern,
            false_positive_rate: spec.false_positive_rate,
            enabled: spec.enabled,
            description: spec.description,
        }),
        Err(e) => {
            log::error!("skipping firewall rule {}: invalid pattern: {}", spec.id, e);
            None
        }
    }
}

fn load_rules_file(path: &str) -> Vec<WafRuleSpec> {
    match std::fs::read_to_string(path) {
        Ok(raw) => match serde_json::from_str::<Vec<WafRuleSpec>>(&raw) {
            Ok(specs) => specs,
            Err(e) => {
                log::error!("failed to parse firewall rules file {}: {}", path, e);
                Vec::new()
            }
        },
        Err(e) => {
            log::error!("failed to read firewall rules file {}: {}", path, e);
            Vec::new()
        }
    }
}

fn spec(
    id: &str,
    category: ThreatCategory,
    severity: Severity,
    action: RuleAction,
    false_positive_rate: f64,
    pattern: &str,
    description: &str,
) -> WafRuleSpec {
    WafRuleSpec {
        id: id.to_string(),
        category,
        severity,
        action,
        pattern: pattern.to_string(),
        false_positive_rate,
        enabled: true,
        description: description.to_string(),
    }
}

fn builtin_rules() -> Vec<WafRuleSpec> {
    use RuleAction::{Block, Log, Warn};
    use Severity::{Critical, High, Low, Medium};
    use ThreatCategory::*;

    vec![
        spec(
            "sqli-union",
            SqlInjection,
            High,
            Block,
            0.02,
            r"(?i)\bunion\b[\s\S]{0,64}?\bselect\b",
            "UNION-based SQL injection",
        ),
        spec(
            "sqli-tautology",
            SqlInjection,
            Critical,
            Block,
            0.01,
            r#"(?i)['"]\s*(or|and)\s+['"]?\d+['"]?\s*=\s*['"]?\d+"#,
            "Tautology SQL injection (OR 1=1)",
        ),
        spec(
            "sqli-stacked",
            SqlInjection,
            Medium,
            Warn,
            0.05,
            r"(?i);\s*(select|insert|update|delete|drop)\b",
            "Stacked SQL queries",
        ),
        spec(
            "sqli-schema-probe",
            SqlInjection,
            Medium,
            Warn,
            0.05,
            r"(?i)\b(information_schema|sysobjects|pg_catalog)\b",
            "Database schema probing",
        ),
        spec(
            "xss-script-tag",
            Xss,
            High,
            Block,
            0.02,
            r"(?i)<script[^>]*>",
            "Inline script tag",
        ),
        spec(
            "xss-event-handler",
            Xss,
            Medium,
            Warn,
            0.08,
            r"(?i)\bon(error|load|click|mouseover|focus)\s*=",
            "HTML event handler attribute",
        ),
        spec(
            "xss-js-uri",
            Xss,
            Medium,
            Warn,
            0.05,
            r"(?i)javascript\s*:",
            "javascript: URI scheme",
        ),
        spec(
            "xss-embed",
            Xss,
            Medium,
            Warn,
            0.06,
            r"(?i)<(iframe|object|embed)\b",
            "Embedded active content",
        ),
        spec(
            "traversal-dotdot",
            PathTraversal,
            High,
            Block,
            0.03,
            r"(?i)(\.\./|\.\.\\|%2e%2e%2f)",
            "Directory traversal sequence",
        ),
        spec(
            "traversal-sensitive-file",
            PathTraversal,
            Critical,
            Block,
            0.01,
            r"(?i)/etc/(passwd|shadow)\b|c:\\windows\\system32",
            "Sensitive system file access",
        ),
        spec(
            "cmdi-chained",
            CommandInjection,
            High,
            Block,
            0.04,
            r"(?i)(;|\||&&)\s*(cat|ls|id|whoami|wget|curl|bash|sh|powershell)\b",
            "Chained shell command",
        ),
        spec(
            "cmdi-substitution",
            CommandInjection,
            Medium,
            Warn,
            0.06,
            r"\$\([^)]{1,128}\)|`[^`]{1,128}`",
            "Shell command substitution",
        ),
        spec(
            "nosqli-operator",
            NosqlInjection,
            Medium,
            Warn,
            0.07,
            r"(?i)\$(where|ne|gt|lt|regex)\b",
            "NoSQL query operator in input",
        ),
        spec(
            "ssrf-metadata",
            Ssrf,
            High,
            Block,
            0.01,
            r"(?i)\b(169\.254\.169\.254|metadata\.google\.internal)\b",
            "Cloud metadata endpoint access",
        ),
        spec(
            "ssrf-loopback",
            Ssrf,
            Low,
            Log,
            0.15,
            r"(?i)\burl=https?://(localhost|127\.0\.0\.1)",
            "Loopback address in URL parameter",
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    fn engine() -> FirewallEngine {
        let client = redis::Client::open("redis://127.0.0.1:6379").unwrap();
        let store = Arc::new(SharedStore::new(client, Duration::from_millis(250)));
        FirewallEngine::new(store, WafConfig::default())
    }

    fn request_with_query(value: &str) -> InboundRequest {
        let mut query = HashMap::new();
        query.insert("q".to_string(), value.to_string());
        InboundRequest {
            client_ip: "203.0.113.9".to_string(),
            user_id: None,
            plan: None,
            api_key_id: None,
            api_key_tier: None,
            method: "GET".to_string(),
            path: "/api/widgets".to_string(),
            headers: HashMap::new(),
            query,
            body: None,
            cookies: HashMap::new(),
            tool_name: None,
            tool_params: None,
        }
    }

    #[test]
    fn union_probe_fires_exactly_one_high_sql_injection_detection() {
        let engine = engine();
        let request = request_with_query("' UNION SELECT password FROM users--");

        let detections = engine.scan(&request);
        let sqli: Vec<_> = detections
            .iter()
            .filter(|d| d.category == ThreatCategory::SqlInjection)
            .collect();

        assert_eq!(detections.len(), 1);
        assert_eq!(sqli.len(), 1);
        assert_eq!(sqli[0].severity, Severity::High);
        assert_eq!(decide(&detections), WafVerdict::Block);
    }

    #[test]
    fn benign_request_is_allowed() {
        let engine = engine();
        let request = request_with_query("blue widgets under $20");
        let detections = engine.scan(&request);
        assert!(detections.is_empty());
        assert_eq!(decide(&detections), WafVerdict::Allow);
    }

    #[test]
    fn single_medium_detection_warns() {
        let engine = engine();
        let request = request_with_query("click javascript:alert(1)");
        let detections = engine.scan(&request);
        assert_eq!(detections.len(), 1);
        assert_eq!(decide(&detections), WafVerdict::AllowWithWarning);
    }

    #[test]
    fn three_medium_detections_block() {
        let engine = engine();
        let mut request = request_with_query("benign");
        request.body = Some(
            "href=javascript:alert(1) onerror=steal() filter={\"$where\": \"1\"}".to_string(),
        );
        let detections = engine.scan(&request);
        let mediums = detections
            .iter()
            .filter(|d| d.severity == Severity::Medium)
            .count();
        assert!(mediums >= 3, "expected three mediums, got {:?}", detections);
        assert_eq!(decide(&detections), WafVerdict::Block);
    }

    #[test]
    fn traversal_in_path_is_blocked() {
        let engine = engine();
        let mut request = request_with_query("ok");
        request.path = "/api/files/../../etc/passwd".to_string();
        let detections = engine.scan(&request);
        assert!(detections
            .iter()
            .any(|d| d.category == ThreatCategory::PathTraversal && d.field == "url"));
        assert_eq!(decide(&detections), WafVerdict::Block);
    }

    #[test]
    fn malformed_rule_is_skipped() {
        let bad = spec(
            "broken",
            ThreatCategory::Xss,
            Severity::Low,
            RuleAction::Log,
            0.1,
            r"([unclosed",
            "never compiles",
        );
        assert!(compile_rule(bad).is_none());
    }

    #[test]
    fn fingerprint_is_stable_and_parameter_sensitive() {
        let params_a = serde_json::json!({"path": "/tmp/a", "mode": "read"});
        let params_b = serde_json::json!({"path": "/tmp/b", "mode": "read"});

        assert_eq!(
            call_fingerprint("file_read", Some(&params_a)),
            call_fingerprint("file_read", Some(&params_a))
        );
        assert_ne!(
            call_fingerprint("file_read", Some(&params_a)),
            call_fingerprint("file_read", Some(&params_b))
        );
        assert_ne!(
            call_fingerprint("file_read", None),
            call_fingerprint("file_write", None)
        );
    }

    #[tokio::test]
    async fn disabled_engine_allows_everything() {
        let client = redis::Client::open("redis://127.0.0.1:6379").unwrap();
        let store = Arc::new(SharedStore::new(client, Duration::from_millis(250)));
        let engine = FirewallEngine::new(
            store,
            WafConfig { enabled: false, ..WafConfig::default() },
        );

        let request = request_with_query("' UNION SELECT password FROM users--");
        let analysis = engine.analyze(&request, "203.0.113.9").await.unwrap();
        assert_eq!(analysis.verdict, WafVerdict::Allow);
        assert!(analysis.detections.is_empty());
    }

    #[tokio::test]
    #[ignore = "requires a local Redis instance"]
    async fn repeated_identical_tool_calls_raise_replay_detection() {
        let engine = engine();
        let identifier = format!("user-{}", uuid::Uuid::new_v4());
        let mut request = request_with_query("ok");
        request.tool_name = Some("export_report".to_string());
        request.tool_params = Some(serde_json::json!({"format": "csv"}));

        let mut last = None;
        for _ in 0..5 {
            last = Some(engine.analyze(&request, &identifier).await.unwrap());
        }
        let analysis = last.unwrap();
        assert!(analysis
            .detections
            .iter()
            .any(|d| d.category == ThreatCategory::AutomationReplay
                && d.severity == Severity::Medium));
    }
}

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::core::response::ResponseConfig;

/// Violation and detection severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

/// Rate limiting algorithm selection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAlgorithm {
    TokenBucket,
    SlidingWindow,
}

/// Subscription plan of an authenticated user
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionPlan {
    Free,
    Pro,
    Enterprise,
}

/// API key tier
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ApiKeyTier {
    Basic,
    Premium,
}

/// Endpoint category derived from the request path
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EndpointCategory {
    AiTools,
    Uploads,
    Auth,
    Exports,
    General,
}

impl EndpointCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointCategory::AiTools => "ai_tools",
            EndpointCategory::Uploads => "uploads",
            EndpointCategory::Auth => "auth",
            EndpointCategory::Exports => "exports",
            EndpointCategory::General => "general",
        }
    }
}

/// Rate limit policy for a single tier
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Algorithm used for this tier
    pub algorithm: RateLimitAlgorithm,
    /// Maximum requests per window
    pub max_requests: u32,
    /// Time window in seconds
    pub window_seconds: u32,
    /// Extra capacity admitted in bursts (token bucket only)
    pub burst_allowance: u32,
    /// Cost multiplier applied while a throttle action is active
    pub penalty_multiplier: f64,
    /// Identifiers that bypass this tier entirely
    pub allow_list: Vec<String>,
    /// Identifiers that are hard-blocked for a day without touching counters
    pub deny_list: Vec<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            algorithm: RateLimitAlgorithm::TokenBucket,
            max_requests: 100,
            window_seconds: 60,
            burst_allowance: 20,
            penalty_multiplier: 4.0,
            allow_list: Vec::new(),
            deny_list: Vec::new(),
        }
    }
}

impl RateLimitConfig {
    pub fn new(algorithm: RateLimitAlgorithm, max_requests: u32, window_seconds: u32) -> Self {
        Self {
            algorithm,
            max_requests,
            window_seconds,
            ..Self::default()
        }
    }

    pub fn with_burst(mut self, burst_allowance: u32) -> Self {
        self.burst_allowance = burst_allowance;
        self
    }
}

/// Per-tier rate limit policies
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitTiers {
    /// Shared ceiling across the whole API surface
    pub global: RateLimitConfig,
    /// Per-IP tier for IPs with a clean reputation
    pub ip_standard: RateLimitConfig,
    /// Per-IP tier for IPs below the reputation threshold
    pub ip_suspicious: RateLimitConfig,
    /// Reputation score below which an IP is treated as suspicious
    pub suspicious_score_threshold: f64,
    /// Per-user tiers keyed by subscription plan
    pub plan_free: RateLimitConfig,
    pub plan_pro: RateLimitConfig,
    pub plan_enterprise: RateLimitConfig,
    /// Per-API-key tiers
    pub api_key_basic: RateLimitConfig,
    pub api_key_premium: RateLimitConfig,
    /// Endpoint-category tiers, keyed per client IP
    pub endpoint_ai_tools: RateLimitConfig,
    pub endpoint_uploads: RateLimitConfig,
    pub endpoint_auth: RateLimitConfig,
    pub endpoint_exports: RateLimitConfig,
}

impl Default for RateLimitTiers {
    fn default() -> Self {
        Self {
            global: RateLimitConfig::new(RateLimitAlgorithm::TokenBucket, 10_000, 60)
                .with_burst(2_000),
            ip_standard: RateLimitConfig::new(RateLimitAlgorithm::TokenBucket, 120, 60)
                .with_burst(30),
            ip_suspicious: RateLimitConfig::new(RateLimitAlgorithm::SlidingWindow, 20, 60),
            suspicious_score_threshold: 0.5,
            plan_free: RateLimitConfig::new(RateLimitAlgorithm::SlidingWindow, 60, 60),
            plan_pro: RateLimitConfig::new(RateLimitAlgorithm::TokenBucket, 300, 60)
                .with_burst(60),
            plan_enterprise: RateLimitConfig::new(RateLimitAlgorithm::TokenBucket, 1_200, 60)
                .with_burst(300),
            api_key_basic: RateLimitConfig::new(RateLimitAlgorithm::TokenBucket, 240, 60)
                .with_burst(40),
            api_key_premium: RateLimitConfig::new(RateLimitAlgorithm::TokenBucket, 1_000, 60)
                .with_burst(200),
            endpoint_ai_tools: RateLimitConfig::new(RateLimitAlgorithm::SlidingWindow, 30, 60),
            endpoint_uploads: RateLimitConfig::new(RateLimitAlgorithm::SlidingWindow, 10, 60),
            endpoint_auth: RateLimitConfig::new(RateLimitAlgorithm::SlidingWindow, 10, 60),
            endpoint_exports: RateLimitConfig::new(RateLimitAlgorithm::SlidingWindow, 5, 60),
        }
    }
}

impl RateLimitTiers {
    pub fn for_plan(&self, plan: SubscriptionPlan) -> &RateLimitConfig {
        match plan {
            SubscriptionPlan::Free => &self.plan_free,
            SubscriptionPlan::Pro => &self.plan_pro,
            SubscriptionPlan::Enterprise => &self.plan_enterprise,
        }
    }

    pub fn for_api_key_tier(&self, tier: ApiKeyTier) -> &RateLimitConfig {
        match tier {
            ApiKeyTier::Basic => &self.api_key_basic,
            ApiKeyTier::Premium => &self.api_key_premium,
        }
    }

    pub fn for_endpoint(&self, category: EndpointCategory) -> Option<&RateLimitConfig> {
        match category {
            EndpointCategory::AiTools => Some(&self.endpoint_ai_tools),
            EndpointCategory::Uploads => Some(&self.endpoint_uploads),
            EndpointCategory::Auth => Some(&self.endpoint_auth),
            EndpointCategory::Exports => Some(&self.endpoint_exports),
            EndpointCategory::General => None,
        }
    }
}

/// Firewall rule engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WafConfig {
    /// Whether the firewall engine runs at all
    pub enabled: bool,
    /// Optional JSON file with additional rules
    pub rules_file: Option<String>,
    /// Identical tool calls in the window before a replay detection fires
    pub repeat_call_threshold: u32,
    /// Trailing window for the repeated-call check, in seconds
    pub repeat_call_window_seconds: u32,
}

impl Default for WafConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rules_file: None,
            repeat_call_threshold: 5,
            repeat_call_window_seconds: 300,
        }
    }
}

/// Anomaly detector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalyConfig {
    /// Minimum profile sample size before the detector trusts a baseline
    pub min_sample_size: u32,
    /// Hourly request count must exceed baseline times this multiplier
    pub volume_multiplier: f64,
    /// Fastest plausible travel speed between two requests, km/h
    pub max_travel_speed_kmh: f64,
    /// Tool calls in the rolling window before a rapid-use detection fires
    pub rapid_tool_threshold: u32,
    /// Rolling window for the rapid-use check, in seconds
    pub rapid_tool_window_seconds: u32,
    /// How long the last-known location is retained, in seconds
    pub location_ttl_seconds: u64,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            min_sample_size: 50,
            volume_multiplier: 1.5,
            max_travel_speed_kmh: 1_000.0,
            rapid_tool_threshold: 10,
            rapid_tool_window_seconds: 60,
            location_ttl_seconds: 86_400,
        }
    }
}

/// Geolocation provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoConfig {
    /// Base URL of the IP geolocation provider
    pub provider_url: String,
    /// Lookup timeout in milliseconds
    pub timeout_ms: u64,
}

impl Default for GeoConfig {
    fn default() -> Self {
        Self {
            provider_url: "http://ip-api.com/json".to_string(),
            timeout_ms: 500,
        }
    }
}

/// Alerting configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AlertingConfig {
    /// Optional webhook endpoint that receives alert payloads
    pub webhook_url: Option<String>,
}

/// Redis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Redis connection URL
    pub url: String,
    /// Redis connection pool size
    pub pool_size: u32,
    /// Timeout applied to every store operation, in milliseconds
    pub op_timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            pool_size: 10,
            op_timeout_ms: 250,
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Redis configuration
    pub redis: RedisConfig,
    /// Rate limit tier policies
    pub rate_limit: RateLimitTiers,
    /// Firewall rule engine configuration
    pub waf: WafConfig,
    /// Anomaly detector configuration
    pub anomaly: AnomalyConfig,
    /// Response coordinator configuration
    pub response: ResponseConfig,
    /// Geolocation provider configuration
    pub geo: GeoConfig,
    /// Alerting configuration
    pub alerting: AlertingConfig,
}

/// Normalized inbound request handed to the engine once per HTTP request.
///
/// The caller extracts identifier candidates and content fields at the
/// transport boundary; the engine never touches the raw transport request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundRequest {
    /// Client IP address
    pub client_ip: String,
    /// Authenticated user id, if any
    #[serde(default)]
    pub user_id: Option<String>,
    /// Subscription plan of the authenticated user
    #[serde(default)]
    pub plan: Option<SubscriptionPlan>,
    /// API key id, if the request carried one
    #[serde(default)]
    pub api_key_id: Option<String>,
    /// Tier of the API key
    #[serde(default)]
    pub api_key_tier: Option<ApiKeyTier>,
    /// HTTP method
    pub method: String,
    /// Request path
    pub path: String,
    /// Request headers
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Query parameters
    #[serde(default)]
    pub query: HashMap<String, String>,
    /// Request body, if textual
    #[serde(default)]
    pub body: Option<String>,
    /// Request cookies
    #[serde(default)]
    pub cookies: HashMap<String, String>,
    /// Invoked tool/automation name, for tool endpoints
    #[serde(default)]
    pub tool_name: Option<String>,
    /// Tool invocation parameters, for tool endpoints
    #[serde(default)]
    pub tool_params: Option<serde_json::Value>,
}

impl InboundRequest {
    /// Identifier under which violations and response actions are tracked:
    /// the user id when authenticated, otherwise the client IP.
    pub fn primary_identifier(&self) -> &str {
        self.user_id.as_deref().unwrap_or(&self.client_ip)
    }

    pub fn is_authenticated(&self) -> bool {
        self.user_id.is_some()
    }
}

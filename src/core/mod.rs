//! Core components of the abuse prevention engine.
//!
//! The evaluation pipeline composes four components, cheapest first:
//! rate limiting, firewall pattern matching, behavioral anomaly detection,
//! and automated response coordination.

pub mod alerting;
pub mod anomaly;
pub mod engine;
pub mod geo;
pub mod profile;
pub mod rate_limiter;
pub mod response;
pub mod store;
pub mod waf;

pub use anomaly::AnomalyDetector;
pub use engine::{AbusePreventionEngine, EngineDecision};
pub use rate_limiter::{MultiTierRateLimiter, RateLimiter};
pub use response::{ResponseCoordinator, SecurityViolation};
pub use store::SharedStore;
pub use waf::FirewallEngine;

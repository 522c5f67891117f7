//! Behavioral profile access for the anomaly detector.
//!
//! Profiles are aggregated elsewhere from historical traffic; the engine
//! only ever reads them.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::store::{SharedStore, StoreError};
use crate::utils::format_key;

/// Per-user behavioral baseline
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UserBehaviorProfile {
    pub user_id: String,
    /// Average requests per hour over the observation period
    pub avg_requests_per_hour: f64,
    /// Hours of day (0-23) with the most activity
    pub peak_activity_hours: Vec<u8>,
    /// Tools the user invokes regularly
    pub frequent_tools: Vec<String>,
    /// Endpoints the user hits regularly
    pub frequent_endpoints: Vec<String>,
    /// Countries the user normally connects from
    pub common_countries: Vec<String>,
    /// Cities the user normally connects from
    pub common_cities: Vec<String>,
    /// Typical session duration in minutes
    pub typical_session_minutes: f64,
    /// Number of observations behind these statistics
    pub sample_size: u32,
}

/// Read-only profile lookup
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn fetch(&self, user_id: &str) -> Result<Option<UserBehaviorProfile>, StoreError>;
}

/// Profiles stored as JSON documents in the shared store, keyed by user id.
pub struct RedisProfileStore {
    store: Arc<SharedStore>,
}

impl RedisProfileStore {
    pub fn new(store: Arc<SharedStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ProfileStore for RedisProfileStore {
    async fn fetch(&self, user_id: &str) -> Result<Option<UserBehaviorProfile>, StoreError> {
        self.store.get_json(&format_key("profile", user_id)).await
    }
}

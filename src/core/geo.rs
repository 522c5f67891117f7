//! IP geolocation client for the abuse prevention engine.
//!
//! Location lookups feed the anomaly detector's country and travel checks.
//! The provider is an external HTTP service; a static resolver backs tests
//! and air-gapped deployments.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::GeoConfig;

/// Errors that can occur during geolocation lookups
#[derive(Debug, Error)]
pub enum GeoError {
    #[error("lookup request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
}

/// Resolved location of a network origin
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeoLocation {
    pub country: String,
    pub city: String,
    pub latitude: f64,
    pub longitude: f64,
}

/// IP-to-location lookup service
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GeoLocator: Send + Sync {
    /// Resolve an IP address; `None` when the provider cannot place it.
    async fn locate(&self, ip: &str) -> Result<Option<GeoLocation>, GeoError>;
}

/// Provider wire format
#[derive(Debug, Deserialize)]
struct ProviderResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    country: Option<String>,
    #[serde(default)]
    city: Option<String>,
    #[serde(default)]
    lat: Option<f64>,
    #[serde(default)]
    lon: Option<f64>,
}

/// HTTP geolocation client
pub struct HttpGeoLocator {
    client: reqwest::Client,
    base_url: String,
}

impl HttpGeoLocator {
    pub fn new(config: &GeoConfig) -> Result<Self, GeoError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self {
            client,
            base_url: config.provider_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl GeoLocator for HttpGeoLocator {
    async fn locate(&self, ip: &str) -> Result<Option<GeoLocation>, GeoError> {
        let url = format!("{}/{}", self.base_url, ip);
        let response: ProviderResponse = self.client.get(&url).send().await?.json().await?;

        if response.status.as_deref() == Some("fail") {
            return Ok(None);
        }
        match (response.lat, response.lon) {
            (Some(latitude), Some(longitude)) => Ok(Some(GeoLocation {
                country: response.country.unwrap_or_default(),
                city: response.city.unwrap_or_default(),
                latitude,
                longitude,
            })),
            _ => Ok(None),
        }
    }
}

/// In-memory resolver with a fixed table
pub struct StaticGeoLocator {
    entries: HashMap<String, GeoLocation>,
}

impl StaticGeoLocator {
    pub fn new(entries: HashMap<String, GeoLocation>) -> Self {
        Self { entries }
    }
}

#[async_trait]
impl GeoLocator for StaticGeoLocator {
    async fn locate(&self, ip: &str) -> Result<Option<GeoLocation>, GeoError> {
        Ok(self.entries.get(ip).cloned())
    }
}

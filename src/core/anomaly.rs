//! Behavioral anomaly detection for the abuse prevention engine.
//!
//! Compares current request behavior against a per-user baseline profile
//! and flags statistical outliers. The detector abstains entirely for users
//! without enough history; a thin profile produces false positives, not
//! signal.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::core::geo::{GeoLocation, GeoLocator};
use crate::core::profile::UserBehaviorProfile;
use crate::core::store::{SharedStore, StoreError};
use crate::models::{AnomalyConfig, InboundRequest, Severity};
use crate::utils::haversine_km;

/// Errors that can occur during anomaly detection
#[derive(Error, Debug)]
pub enum AnomalyError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Kind of behavioral deviation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    Volume,
    Timing,
    Location,
    ToolUsage,
}

impl AnomalyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyKind::Volume => "volume",
            AnomalyKind::Timing => "timing",
            AnomalyKind::Location => "location",
            AnomalyKind::ToolUsage => "tool_usage",
        }
    }
}

/// One detected deviation, with enough context to tune sensitivity later
#[derive(Debug, Clone, Serialize)]
pub struct AnomalyDetection {
    pub id: String,
    pub kind: AnomalyKind,
    pub severity: Severity,
    pub confidence: f64,
    pub baseline: f64,
    pub observed: f64,
    /// How far past the trigger threshold the observation landed
    pub ratio: f64,
    pub description: String,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl AnomalyDetection {
    fn new(
        kind: AnomalyKind,
        severity: Severity,
        confidence: f64,
        baseline: f64,
        observed: f64,
        ratio: f64,
        description: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            severity,
            confidence,
            baseline,
            observed,
            ratio,
            description,
            metadata: HashMap::new(),
        }
    }

    fn with_metadata(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }
}

/// Location persisted between requests for the travel check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredLocation {
    pub latitude: f64,
    pub longitude: f64,
    pub country: String,
    pub city: String,
    pub recorded_at: DateTime<Utc>,
}

/// Behavioral anomaly detector
pub struct AnomalyDetector {
    store: Arc<SharedStore>,
    geo: Arc<dyn GeoLocator>,
    config: AnomalyConfig,
}

impl AnomalyDetector {
    pub fn new(store: Arc<SharedStore>, geo: Arc<dyn GeoLocator>, config: AnomalyConfig) -> Self {
        Self { store, geo, config }
    }

    /// Run all checks for an authenticated request. Abstains (empty result)
    /// when the profile has too little history to be trusted.
    pub async fn analyze(
        &self,
        request: &InboundRequest,
        profile: &UserBehaviorProfile,
    ) -> Result<Vec<AnomalyDetection>, AnomalyError> {
        if profile.sample_size < self.config.min_sample_size {
            return Ok(Vec::new());
        }

        let user = &profile.user_id;
        let now = Utc::now();
        let mut detections = Vec::new();

        let hour_key = format!("anomaly:volume:{}:{}", user, now.format("%Y%m%d%H"));
        let observed = self.store.incr_expire(&hour_key, 1, 3_600).await?;
        if let Some(d) = volume_anomaly(profile, observed as f64, self.config.volume_multiplier) {
            detections.push(d);
        }

        if let Some(d) = off_hours_anomaly(profile, now.hour() as u8) {
            detections.push(d);
        }

        match self.geo.locate(&request.client_ip).await {
            Ok(Some(location)) => {
                detections.extend(self.location_checks(user, &location, now).await?);
            }
            Ok(None) => {}
            Err(e) => {
                log::warn!("geolocation lookup failed for {}: {}", request.client_ip, e);
            }
        }

        if let Some(tool) = &request.tool_name {
            detections.extend(self.tool_checks(profile, user, tool, now).await?);
        }

        for detection in &detections {
            metrics::increment_counter!(
                "abuse_engine_anomalies_total",
                "kind" => detection.kind.as_str()
            );
        }
        Ok(detections)
    }

    async fn location_checks(
        &self,
        user: &str,
        location: &GeoLocation,
        now: DateTime<Utc>,
    ) -> Result<Vec<AnomalyDetection>, AnomalyError> {
        let mut detections = Vec::new();
        let key = format!("anomaly:lastloc:{}", user);

        let previous: Option<StoredLocation> = self.store.get_json(&key).await?;
        if let Some(previous) = previous {
            let elapsed = (now - previous.recorded_at).num_seconds();
            if let Some(d) =
                travel_anomaly(&previous, location, elapsed, self.config.max_travel_speed_kmh)
            {
                detections.push(d);
            }
        }

        // The current location always becomes the baseline for the next hop.
        self.store
            .set_json_ex(
                &key,
                &StoredLocation {
                    latitude: location.latitude,
                    longitude: location.longitude,
                    country: location.country.clone(),
                    city: location.city.clone(),
                    recorded_at: now,
                },
                self.config.location_ttl_seconds as usize,
            )
            .await?;

        Ok(detections)
    }

    async fn tool_checks(
        &self,
        profile: &UserBehaviorProfile,
        user: &str,
        tool: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<AnomalyDetection>, AnomalyError> {
        let mut detections = Vec::new();

        if !profile.frequent_tools.iter().any(|t| t == tool) {
            let marker = format!("anomaly:newtool:{}:{}", user, tool);
            // Flag a never-before-seen tool at most once per day.
            if self.store.set_nx_ex(&marker, 86_400).await? {
                detections.push(
                    AnomalyDetection::new(
                        AnomalyKind::ToolUsage,
                        Severity::Medium,
                        0.7,
                        0.0,
                        1.0,
                        1.0,
                        format!("first use of tool {} outside the usual set", tool),
                    )
                    .with_metadata("tool", serde_json::json!(tool)),
                );
            }
        }

        let rate_key = format!("anomaly:toolrate:{}", user);
        let window_ms = self.config.rapid_tool_window_seconds as i64 * 1_000;
        let count = self
            .store
            .rolling_count(
                &rate_key,
                &Uuid::new_v4().to_string(),
                now.timestamp_millis(),
                window_ms,
                (self.config.rapid_tool_window_seconds * 2) as usize,
            )
            .await?;
        if count > self.config.rapid_tool_threshold {
            let baseline = self.config.rapid_tool_threshold as f64;
            detections.push(
                AnomalyDetection::new(
                    AnomalyKind::ToolUsage,
                    Severity::High,
                    0.85,
                    baseline,
                    count as f64,
                    count as f64 / baseline,
                    format!(
                        "{} tool calls in {}s",
                        count, self.config.rapid_tool_window_seconds
                    ),
                )
                .with_metadata("tool", serde_json::json!(tool)),
            );
        }

        Ok(detections)
    }
}

/// Severity for a volume overshoot ratio (observed / baseline average).
pub fn volume_severity(ratio: f64) -> Severity {
    if ratio >= 5.0 {
        Severity::Critical
    } else if ratio >= 3.0 {
        Severity::High
    } else if ratio >= 2.0 {
        Severity::Medium
    } else {
        Severity::Low
    }
}

fn confidence_for(severity: Severity) -> f64 {
    match severity {
        Severity::Low => 0.5,
        Severity::Medium => 0.7,
        Severity::High => 0.85,
        Severity::Critical => 0.95,
    }
}

/// Current-hour request count against the profile's hourly average.
pub fn volume_anomaly(
    profile: &UserBehaviorProfile,
    observed: f64,
    multiplier: f64,
) -> Option<AnomalyDetection> {
    let baseline = profile.avg_requests_per_hour;
    if baseline <= 0.0 {
        return None;
    }
    let threshold = baseline * multiplier;
    if observed <= threshold {
        return None;
    }

    let ratio = observed / baseline;
    let severity = volume_severity(ratio);
    Some(AnomalyDetection::new(
        AnomalyKind::Volume,
        severity,
        confidence_for(severity),
        baseline,
        observed,
        ratio,
        format!(
            "{} requests this hour against a baseline of {:.1}/h",
            observed as u64, baseline
        ),
    ))
}

/// Request country absent from the profile's usual set.
pub fn country_anomaly(
    profile: &UserBehaviorProfile,
    location: &GeoLocation,
) -> Option<AnomalyDetection> {
    if location.country.is_empty() {
        return None;
    }
    if profile
        .common_countries
        .iter()
        .any(|c| c.eq_ignore_ascii_case(&location.country))
    {
        return None;
    }

    // A profile with no observed countries at all is weaker evidence.
    let confidence = if profile.common_countries.is_empty() { 0.4 } else { 0.8 };
    Some(
        AnomalyDetection::new(
            AnomalyKind::Location,
            Severity::Medium,
            confidence,
            profile.common_countries.len() as f64,
            1.0,
            1.0,
            format!("request from unusual country {}", location.country),
        )
        .with_metadata("country", serde_json::json!(location.country))
        .with_metadata("city", serde_json::json!(location.city)),
    )
}

/// Implied travel speed between consecutive requests past the fastest
/// plausible commercial transport.
pub fn travel_anomaly(
    previous: &StoredLocation,
    current: &GeoLocation,
    elapsed_seconds: i64,
    max_speed_kmh: f64,
) -> Option<AnomalyDetection> {
    let distance_km = haversine_km(
        previous.latitude,
        previous.longitude,
        current.latitude,
        current.longitude,
    );
    // Nearby hops are resolution noise, not travel.
    if distance_km < 100.0 {
        return None;
    }

    let elapsed_hours = elapsed_seconds.max(1) as f64 / 3_600.0;
    let speed_kmh = distance_km / elapsed_hours;
    if speed_kmh <= max_speed_kmh {
        return None;
    }

    Some(
        AnomalyDetection::new(
            AnomalyKind::Location,
            Severity::Critical,
            0.95,
            max_speed_kmh,
            speed_kmh,
            speed_kmh / max_speed_kmh,
            format!(
                "impossible travel: {:.0} km in {:.1} h",
                distance_km, elapsed_hours
            ),
        )
        .with_metadata("distance_km", serde_json::json!(distance_km))
        .with_metadata("elapsed_hours", serde_json::json!(elapsed_hours))
        .with_metadata("speed_kmh", serde_json::json!(speed_kmh)),
    )
}

/// Activity well outside the profile's peak hours.
pub fn off_hours_anomaly(profile: &UserBehaviorProfile, hour: u8) -> Option<AnomalyDetection> {
    if profile.peak_activity_hours.is_empty() {
        return None;
    }
    let near_peak = profile.peak_activity_hours.iter().any(|&peak| {
        let diff = (hour as i16 - peak as i16).rem_euclid(24);
        diff <= 1 || diff >= 23
    });
    if near_peak {
        return None;
    }

    Some(AnomalyDetection::new(
        AnomalyKind::Timing,
        Severity::Low,
        0.5,
        profile.peak_activity_hours.first().copied().unwrap_or(0) as f64,
        hour as f64,
        1.0,
        format!("activity at hour {} outside usual peak hours", hour),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::geo::StaticGeoLocator;
    use std::time::Duration;

    fn profile(sample_size: u32) -> UserBehaviorProfile {
        UserBehaviorProfile {
            user_id: "user-42".to_string(),
            avg_requests_per_hour: 20.0,
            peak_activity_hours: vec![9, 10, 11],
            frequent_tools: vec!["export_report".to_string()],
            frequent_endpoints: vec!["/api/widgets".to_string()],
            common_countries: vec!["France".to_string()],
            common_cities: vec!["Paris".to_string()],
            typical_session_minutes: 35.0,
            sample_size,
        }
    }

    fn paris() -> StoredLocation {
        StoredLocation {
            latitude: 48.8566,
            longitude: 2.3522,
            country: "France".to_string(),
            city: "Paris".to_string(),
            recorded_at: Utc::now(),
        }
    }

    fn new_york() -> GeoLocation {
        GeoLocation {
            country: "United States".to_string(),
            city: "New York".to_string(),
            latitude: 40.7128,
            longitude: -74.0060,
        }
    }

    #[test]
    fn volume_severity_scales_with_overshoot() {
        assert_eq!(volume_severity(1.6), Severity::Low);
        assert_eq!(volume_severity(2.5), Severity::Medium);
        assert_eq!(volume_severity(3.5), Severity::High);
        assert_eq!(volume_severity(6.0), Severity::Critical);
    }

    #[test]
    fn volume_anomaly_requires_threshold_crossing() {
        let profile = profile(100);
        assert!(volume_anomaly(&profile, 25.0, 1.5).is_none());

        let detection = volume_anomaly(&profile, 90.0, 1.5).unwrap();
        assert_eq!(detection.kind, AnomalyKind::Volume);
        assert_eq!(detection.severity, Severity::High);
        assert!((detection.ratio - 4.5).abs() < 1e-9);
    }

    #[test]
    fn country_anomaly_only_for_unknown_countries() {
        let profile = profile(100);
        let mut location = new_york();
        assert!(country_anomaly(&profile, &location).unwrap().confidence > 0.7);

        location.country = "France".to_string();
        assert!(country_anomaly(&profile, &location).is_none());

        let mut empty = profile.clone();
        empty.common_countries.clear();
        location.country = "Japan".to_string();
        let weak = country_anomaly(&empty, &location).unwrap();
        assert!((weak.confidence - 0.4).abs() < 1e-9);
    }

    #[test]
    fn impossible_travel_fires_for_fast_hops_only() {
        // Paris to New York (~5,800 km) in five minutes is impossible.
        let detection = travel_anomaly(&paris(), &new_york(), 300, 1_000.0).unwrap();
        assert_eq!(detection.severity, Severity::Critical);
        assert_eq!(detection.kind, AnomalyKind::Location);
        assert!(detection.observed > 1_000.0);

        // The same hop over ten hours is an ordinary flight.
        assert!(travel_anomaly(&paris(), &new_york(), 36_000, 1_000.0).is_none());
    }

    #[test]
    fn short_hops_are_not_travel() {
        let nearby = GeoLocation {
            country: "France".to_string(),
            city: "Versailles".to_string(),
            latitude: 48.8049,
            longitude: 2.1204,
        };
        assert!(travel_anomaly(&paris(), &nearby, 1, 1_000.0).is_none());
    }

    #[test]
    fn off_hours_allows_peak_and_adjacent_hours() {
        let profile = profile(100);
        assert!(off_hours_anomaly(&profile, 10).is_none());
        assert!(off_hours_anomaly(&profile, 12).is_none());
        let detection = off_hours_anomaly(&profile, 3).unwrap();
        assert_eq!(detection.kind, AnomalyKind::Timing);
        assert_eq!(detection.severity, Severity::Low);
    }

    #[tokio::test]
    async fn detector_abstains_below_minimum_sample_size() {
        let client = redis::Client::open("redis://127.0.0.1:6379").unwrap();
        let store = Arc::new(SharedStore::new(client, Duration::from_millis(250)));
        let geo = Arc::new(StaticGeoLocator::new(HashMap::new()));
        let detector = AnomalyDetector::new(store, geo, AnomalyConfig::default());

        let request = InboundRequest {
            client_ip: "203.0.113.9".to_string(),
            user_id: Some("user-42".to_string()),
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
        };
        let cold = profile(10);
        let detections = detector.analyze(&request, &cold).await.unwrap();
        assert!(detections.is_empty());
    }
}

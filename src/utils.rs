use std::time::{SystemTime, UNIX_EPOCH};

/// Mean Earth radius in kilometers.
const EARTH_RADIUS_KM: f64 = 6_371.0;

pub fn get_current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub fn get_current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

pub fn format_key(prefix: &str, key: &str) -> String {
    format!("{}:{}", prefix, key)
}

pub fn format_scoped_key(prefix: &str, scope: &str, key: &str) -> String {
    format!("{}:{}:{}", prefix, scope, key)
}

/// Great-circle distance between two coordinates, in kilometers (haversine).
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();

    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().asin();

    EARTH_RADIUS_KM * c
}

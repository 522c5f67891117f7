//! Abuse Prevention Engine
//!
//! This is the main entry point for the abuse prevention service.
//! It initializes the engine components and starts the web server.

use std::sync::Arc;
use std::time::Duration;

use actix_web::{web, App, HttpServer};
use dotenv::dotenv;
use log::info;
use redis::Client;

use abuse_prevention_engine::api::{self, ApiState};
use abuse_prevention_engine::config::load_config;
use abuse_prevention_engine::core::alerting::{AlertSink, LogAlertSink, Notifier, WebhookAlertSink};
use abuse_prevention_engine::core::anomaly::AnomalyDetector;
use abuse_prevention_engine::core::engine::AbusePreventionEngine;
use abuse_prevention_engine::core::geo::HttpGeoLocator;
use abuse_prevention_engine::core::profile::RedisProfileStore;
use abuse_prevention_engine::core::rate_limiter::MultiTierRateLimiter;
use abuse_prevention_engine::core::response::ResponseCoordinator;
use abuse_prevention_engine::core::store::SharedStore;
use abuse_prevention_engine::core::waf::FirewallEngine;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Load environment variables
    dotenv().ok();

    // Initialize logging
    env_logger::init();

    info!("Starting abuse prevention engine...");

    // Load configuration
    let config = load_config().expect("Failed to load configuration");

    // Expose engine counters
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .install()
        .expect("Failed to install Prometheus exporter");

    // Shared store behind every mutable counter
    let redis_client =
        Client::open(config.redis.url.as_str()).expect("Failed to create Redis client");
    let store = Arc::new(SharedStore::new(
        redis_client,
        Duration::from_millis(config.redis.op_timeout_ms),
    ));

    // Assemble the evaluation pipeline
    let limiter = MultiTierRateLimiter::new(store.clone(), config.rate_limit.clone());
    let firewall = FirewallEngine::new(store.clone(), config.waf.clone());
    let geo = Arc::new(
        HttpGeoLocator::new(&config.geo).expect("Failed to build geolocation client"),
    );
    let detector = AnomalyDetector::new(store.clone(), geo, config.anomaly.clone());
    let profiles = Arc::new(RedisProfileStore::new(store.clone()));

    let mut sinks: Vec<Arc<dyn AlertSink>> = vec![Arc::new(LogAlertSink)];
    if let Some(url) = config.alerting.webhook_url.clone() {
        sinks.push(Arc::new(WebhookAlertSink::new(url)));
    }
    let coordinator =
        ResponseCoordinator::new(store.clone(), config.response.clone(), Notifier::new(sinks));

    let engine = Arc::new(AbusePreventionEngine::new(
        limiter, firewall, detector, profiles, coordinator,
    ));
    let state = web::Data::new(ApiState { engine });

    info!("Listening on {}:{}", config.server.host, config.server.port);

    // Start HTTP server
    HttpServer::new(move || App::new().app_data(state.clone()).configure(api::config))
        .bind((config.server.host.as_str(), config.server.port))?
        .run()
        .await
}

//! API endpoints for the abuse prevention engine.
//!
//! The engine is invoked once per inbound request through `/evaluate`; the
//! caller translates the returned decision into its own transport response,
//! including the quota headers on denials.

use std::sync::Arc;

use actix_web::{web, HttpResponse, Responder};
use serde::Serialize;

use crate::core::engine::{AbusePreventionEngine, ChallengeKind, EngineDecision};
use crate::models::InboundRequest;

pub struct ApiState {
    pub engine: Arc<AbusePreventionEngine>,
}

/// API configuration function for Actix-web
pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .service(web::resource("/health").route(web::get().to(health_check)))
            .service(web::resource("/evaluate").route(web::post().to(evaluate)))
            .service(web::resource("/reset/{identifier}").route(web::post().to(reset_identifier))),
    );
}

/// Health check endpoint response
#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

/// Decision body returned to the caller
#[derive(Serialize)]
struct EvaluateResponse {
    allowed: bool,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    challenge: Option<ChallengeKind>,
}

#[derive(Serialize)]
struct ResetResponse {
    identifier: String,
    status: String,
}

/// Health check endpoint
async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Run the full evaluation pipeline for one normalized request
pub async fn evaluate(
    state: web::Data<ApiState>,
    request: web::Json<InboundRequest>,
) -> impl Responder {
    let decision = state.engine.evaluate(&request).await;
    decision_to_response(&decision)
}

fn decision_to_response(decision: &EngineDecision) -> HttpResponse {
    let mut builder = match decision.status {
        200 => HttpResponse::Ok(),
        403 => HttpResponse::Forbidden(),
        429 => HttpResponse::TooManyRequests(),
        _ => HttpResponse::InternalServerError(),
    };

    if let Some(headers) = &decision.rate_limit {
        builder.insert_header(("X-RateLimit-Limit", headers.limit.to_string()));
        builder.insert_header(("X-RateLimit-Remaining", headers.remaining.to_string()));
        builder.insert_header(("X-RateLimit-Reset", headers.reset.to_rfc3339()));
        if let Some(retry_after) = headers.retry_after {
            builder.insert_header(("Retry-After", retry_after.to_string()));
        }
    }

    builder.json(EvaluateResponse {
        allowed: decision.allowed,
        message: decision.message.clone(),
        challenge: decision.challenge,
    })
}

/// Clear limiter state, trailing violations, and any cached action for an
/// identifier. Operator tooling only.
async fn reset_identifier(
    state: web::Data<ApiState>,
    path: web::Path<String>,
) -> impl Responder {
    let identifier = path.into_inner();
    match state.engine.reset_identifier(&identifier).await {
        Ok(()) => HttpResponse::Ok().json(ResetResponse {
            identifier,
            status: "reset".to_string(),
        }),
        Err(e) => {
            log::error!("reset failed for {}: {}", identifier, e);
            HttpResponse::ServiceUnavailable().finish()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::alerting::{LogAlertSink, Notifier};
    use crate::core::anomaly::AnomalyDetector;
    use crate::core::geo::StaticGeoLocator;
    use crate::core::profile::RedisProfileStore;
    use crate::core::rate_limiter::MultiTierRateLimiter;
    use crate::core::response::{ResponseConfig, ResponseCoordinator};
    use crate::core::store::SharedStore;
    use crate::core::waf::FirewallEngine;
    use crate::models::{AnomalyConfig, Config, WafConfig};
    use actix_web::{test, App};
    use std::collections::HashMap;
    use std::time::Duration;

    fn state() -> web::Data<ApiState> {
        let client = redis::Client::open("redis://127.0.0.1:6379").unwrap();
        let store = Arc::new(SharedStore::new(client, Duration::from_millis(250)));
        let config = Config::default();

        let limiter = MultiTierRateLimiter::new(store.clone(), config.rate_limit.clone());
        let firewall = FirewallEngine::new(store.clone(), WafConfig::default());
        let geo = Arc::new(StaticGeoLocator::new(HashMap::new()));
        let detector = AnomalyDetector::new(store.clone(), geo, AnomalyConfig::default());
        let profiles = Arc::new(RedisProfileStore::new(store.clone()));
        let coordinator = ResponseCoordinator::new(
            store,
            ResponseConfig::default(),
            Notifier::new(vec![Arc::new(LogAlertSink)]),
        );

        web::Data::new(ApiState {
            engine: Arc::new(AbusePreventionEngine::new(
                limiter, firewall, detector, profiles, coordinator,
            )),
        })
    }

    #[actix_web::test]
    async fn test_health_check() {
        let app = test::init_service(App::new().app_data(state()).configure(config)).await;

        let req = test::TestRequest::get().uri("/api/v1/health").to_request();
        let resp = test::call_service(&app, req).await;

        assert!(resp.status().is_success());
    }

    #[actix_web::test]
    #[ignore = "requires a local Redis instance"]
    async fn test_evaluate_allows_benign_request_with_headers() {
        let app = test::init_service(App::new().app_data(state()).configure(config)).await;

        let req = test::TestRequest::post()
            .uri("/api/v1/evaluate")
            .set_json(serde_json::json!({
                "client_ip": "198.51.100.23",
                "method": "GET",
                "path": "/api/widgets"
            }))
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert!(resp.status().is_success());
        assert!(resp.headers().contains_key("X-RateLimit-Limit"));
        assert!(resp.headers().contains_key("X-RateLimit-Remaining"));
        assert!(resp.headers().contains_key("X-RateLimit-Reset"));
    }

    #[actix_web::test]
    #[ignore = "requires a local Redis instance"]
    async fn test_evaluate_denies_injection_probe() {
        let app = test::init_service(App::new().app_data(state()).configure(config)).await;

        let req = test::TestRequest::post()
            .uri("/api/v1/evaluate")
            .set_json(serde_json::json!({
                "client_ip": "198.51.100.24",
                "method": "GET",
                "path": "/api/widgets",
                "query": {"q": "' UNION SELECT password FROM users--"}
            }))
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status().as_u16(), 403);
    }
}

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use abuse_prevention_engine::core::rate_limiter::classify_endpoint;
use abuse_prevention_engine::core::store::SharedStore;
use abuse_prevention_engine::core::waf::FirewallEngine;
use abuse_prevention_engine::models::{InboundRequest, WafConfig};

fn sample_request() -> InboundRequest {
    let mut query = HashMap::new();
    query.insert("page".to_string(), "2".to_string());
    query.insert("q".to_string(), "blue widgets under $20".to_string());
    let mut headers = HashMap::new();
    headers.insert("user-agent".to_string(), "Mozilla/5.0".to_string());
    headers.insert("accept".to_string(), "application/json".to_string());

    InboundRequest {
        client_ip: "203.0.113.9".to_string(),
        user_id: Some("user-42".to_string()),
        plan: None,
        api_key_id: None,
        api_key_tier: None,
        method: "GET".to_string(),
        path: "/api/widgets".to_string(),
        headers,
        query,
        body: Some(r#"{"filter": {"color": "blue"}, "limit": 25}"#.to_string()),
        cookies: HashMap::new(),
        tool_name: None,
        tool_params: None,
    }
}

fn waf_scan_benchmark(c: &mut Criterion) {
    // The pattern scan is pure CPU; the store is never touched.
    let client = redis::Client::open("redis://127.0.0.1:6379").unwrap();
    let store = Arc::new(SharedStore::new(client, Duration::from_millis(250)));
    let engine = FirewallEngine::new(store, WafConfig::default());
    let request = sample_request();

    c.bench_function("waf_scan_benign_request", |b| {
        b.iter(|| black_box(engine.scan(black_box(&request))))
    });

    let mut hostile = sample_request();
    hostile.query.insert(
        "q".to_string(),
        "' UNION SELECT password FROM users--".to_string(),
    );
    c.bench_function("waf_scan_injection_probe", |b| {
        b.iter(|| black_box(engine.scan(black_box(&hostile))))
    });
}

fn endpoint_classification_benchmark(c: &mut Criterion) {
    let paths = [
        "/api/widgets/17",
        "/api/ai/complete",
        "/api/uploads",
        "/api/auth/login",
        "/api/exports/csv",
    ];
    c.bench_function("classify_endpoint", |b| {
        b.iter(|| {
            for path in &paths {
                black_box(classify_endpoint(black_box(path)));
            }
        })
    });
}

criterion_group!(benches, waf_scan_benchmark, endpoint_classification_benchmark);
criterion_main!(benches);

mod common;

use auth_gateway::config::RateLimitSettings;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use common::{harness, harness_with_limits};
use tower::ServiceExt;

fn empty_login(client: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/auth/login")
        .header("x-forwarded-for", client)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{}"))
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn rapid_requests_from_one_client_are_throttled() {
    let harness = harness_with_limits(RateLimitSettings {
        rate_per_second: 10.0,
        burst: 20,
        sweep_interval_secs: 300,
    })
    .await;

    let mut throttled = 0;
    for _ in 0..25 {
        let response = harness
            .router
            .clone()
            .oneshot(empty_login("203.0.113.7"))
            .await
            .unwrap();
        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            assert_eq!(
                response.headers().get(header::RETRY_AFTER).unwrap(),
                "1"
            );
            throttled += 1;
        }
    }
    assert!(throttled >= 5, "only {throttled} requests throttled");

    // Another client still has a full bucket.
    let response = harness
        .router
        .clone()
        .oneshot(empty_login("198.51.100.2"))
        .await
        .unwrap();
    assert_ne!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    tokio::time::advance(std::time::Duration::from_secs(1)).await;
    let response = harness
        .router
        .clone()
        .oneshot(empty_login("203.0.113.7"))
        .await
        .unwrap();
    assert_ne!(response.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn health_and_metrics_are_served() {
    let harness = harness().await;
    harness.login("nobody", "pw").await;

    let response = harness
        .router
        .clone()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = common::body_json(response).await;
    assert_eq!(body["service"], "auth-gateway");

    let response = harness
        .router
        .clone()
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "text/plain; version=0.0.4"
    );
    assert!(response.headers().get("x-request-id").is_some());
    let bytes = http_body_util::BodyExt::collect(response.into_body())
        .await
        .unwrap()
        .to_bytes();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("auth_login_total{outcome=\"invalid_credentials\"}"));
    assert!(text.contains("http_requests_total{route=\"/v1/auth/login\",code=\"401\"}"));
}

#[tokio::test]
async fn request_id_is_propagated() {
    let harness = harness().await;
    let response = harness
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/v1/health")
                .header("x-request-id", "req-123")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.headers().get("x-request-id").unwrap(), "req-123");
}

#[tokio::test]
async fn startup_requires_a_signing_secret() {
    let mut config = auth_gateway::config::AuthGatewayConfig::default();
    assert!(matches!(
        auth_gateway::build_state(&config).await,
        Err(auth_gateway::error::StartupError::MissingSecret(_))
    ));

    config.tokens.secret = Some(auth_gateway::config::Secret::new("configured"));
    let state = auth_gateway::build_state(&config).await.expect("state");
    assert!(state.revocations.is_empty().await);
}

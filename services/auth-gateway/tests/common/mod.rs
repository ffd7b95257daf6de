#![allow(dead_code)]

use std::sync::Arc;

use account_store::{AccountStore, LockoutPolicy, LockoutTracker, MemoryAccountStore};
use auth_gateway::config::{RateLimitSettings, Secret};
use auth_gateway::rate_limit::AdmissionController;
use auth_gateway::session::{SessionService, SessionSettings};
use auth_gateway::{build_router, AppState};
use axum::body::Body;
use axum::http::{header, Request, Response};
use axum::Router;
use chrono::{TimeZone, Utc};
use common_auth::{Argon2Hasher, Clock, ManualClock, RevocationRegistry, TokenCodec};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

pub const SECRET: &[u8] = b"integration-test-secret";
pub const ADMIN_TOKEN: &str = "admin-secret";

pub struct Harness {
    pub router: Router,
    pub clock: Arc<ManualClock>,
    pub state: Arc<AppState>,
}

pub async fn harness() -> Harness {
    harness_with_limits(RateLimitSettings {
        rate_per_second: 1000.0,
        burst: 1000,
        sweep_interval_secs: 300,
    })
    .await
}

pub async fn harness_with_limits(limits: RateLimitSettings) -> Harness {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap(),
    ));
    let dyn_clock: Arc<dyn Clock> = clock.clone();
    let store: Arc<dyn AccountStore> = Arc::new(MemoryAccountStore::new());
    let codec = TokenCodec::new(SECRET, "auth-gateway", dyn_clock.clone()).unwrap();
    let lockout = LockoutTracker::new(store.clone(), LockoutPolicy::default(), dyn_clock.clone());
    let revocations = Arc::new(RevocationRegistry::new(dyn_clock.clone()));
    let session = SessionService::new(
        store,
        lockout,
        codec,
        revocations.clone(),
        Arc::new(Argon2Hasher::fast()),
        dyn_clock,
        SessionSettings::default(),
    )
    .unwrap();

    let state = Arc::new(AppState {
        session: Arc::new(session),
        admission: AdmissionController::new(&limits),
        revocations,
        admin_token: Some(Secret::new(ADMIN_TOKEN)),
    });

    Harness {
        router: build_router(state.clone()),
        clock,
        state,
    }
}

impl Harness {
    pub async fn register(&self, username: &str, password: &str) {
        self.state
            .session
            .register(username, &format!("{username}@example.com"), password)
            .await
            .expect("register account");
    }

    pub async fn send(&self, request: Request<Body>) -> (u16, Value) {
        let response = self.router.clone().oneshot(request).await.expect("response");
        let status = response.status().as_u16();
        (status, body_json(response).await)
    }

    pub async fn login(&self, username: &str, password: &str) -> (u16, Value) {
        self.send(json_post(
            "/v1/auth/login",
            serde_json::json!({ "username": username, "password": password }),
        ))
        .await
    }
}

pub fn json_post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn with_bearer(method: &str, uri: &str, token: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap()
}

pub async fn body_json(response: Response<Body>) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(&bytes).unwrap()
}

pub fn error_code(body: &Value) -> &str {
    body["error"]["code"].as_str().unwrap_or_default()
}

mod common;

use std::sync::Arc;

use account_store::{
    Account, AccountStore, LockoutPolicy, LockoutState, LockoutTracker, MemoryAccountStore,
    NewAccount, StoreError,
};
use async_trait::async_trait;
use auth_gateway::error::AuthError;
use auth_gateway::session::{SessionService, SessionSettings};
use axum::body::Body;
use axum::http::Request;
use chrono::{DateTime, Duration, Utc};
use common_auth::{Argon2Hasher, Clock, ManualClock, RevocationRegistry, TokenCodec};
use common::{error_code, harness, json_post, with_bearer};
use serde_json::{json, Value};

fn tokens(body: &Value) -> (String, String) {
    (
        body["access_token"].as_str().expect("access token").to_string(),
        body["refresh_token"].as_str().expect("refresh token").to_string(),
    )
}

#[tokio::test]
async fn access_token_opens_protected_routes() {
    let harness = harness().await;
    harness.register("alice", "pw").await;
    let (_, body) = harness.login("alice", "pw").await;
    let (access, refresh) = tokens(&body);
    assert_eq!(body["expires_in"], 24 * 60 * 60);

    let (status, body) = harness.send(with_bearer("GET", "/v1/me", &access)).await;
    assert_eq!(status, 200);
    assert_eq!(body["user"]["username"], "alice");
    assert_eq!(body["user"]["email"], "alice@example.com");

    // A refresh token is not an access token.
    let (status, body) = harness.send(with_bearer("GET", "/v1/me", &refresh)).await;
    assert_eq!(status, 401);
    assert_eq!(error_code(&body), "token_invalid");
}

#[tokio::test]
async fn protected_routes_need_a_bearer_header() {
    let harness = harness().await;

    let (status, body) = harness
        .send(Request::builder().uri("/v1/me").body(Body::empty()).unwrap())
        .await;
    assert_eq!(status, 401);
    assert_eq!(error_code(&body), "unauthorized");

    let (status, body) = harness
        .send(
            Request::builder()
                .uri("/v1/me")
                .header("authorization", "Basic YWxpY2U6cHc=")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(status, 401);
    assert_eq!(error_code(&body), "unauthorized");
}

#[tokio::test]
async fn refresh_rotates_and_retires_the_old_refresh_token() {
    let harness = harness().await;
    harness.register("alice", "pw").await;
    let (_, body) = harness.login("alice", "pw").await;
    let (_, refresh) = tokens(&body);

    let (status, body) = harness
        .send(json_post("/v1/auth/refresh", json!({ "refresh_token": refresh })))
        .await;
    assert_eq!(status, 200);
    let (new_access, new_refresh) = tokens(&body);
    assert_ne!(new_refresh, refresh);

    let (status, _) = harness.send(with_bearer("GET", "/v1/me", &new_access)).await;
    assert_eq!(status, 200);

    let (status, body) = harness
        .send(json_post("/v1/auth/refresh", json!({ "refresh_token": refresh })))
        .await;
    assert_eq!(status, 401);
    assert_eq!(error_code(&body), "token_invalid");
}

#[tokio::test]
async fn access_tokens_cannot_be_used_to_refresh() {
    let harness = harness().await;
    harness.register("alice", "pw").await;
    let (_, body) = harness.login("alice", "pw").await;
    let (access, _) = tokens(&body);

    let (status, body) = harness
        .send(json_post("/v1/auth/refresh", json!({ "refresh_token": access })))
        .await;
    assert_eq!(status, 401);
    assert_eq!(error_code(&body), "token_invalid");
}

#[tokio::test]
async fn logout_revokes_the_presented_token() {
    let harness = harness().await;
    harness.register("alice", "pw").await;
    let (_, body) = harness.login("alice", "pw").await;
    let (access, _) = tokens(&body);

    let (status, body) = harness
        .send(with_bearer("POST", "/v1/auth/logout", &access))
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "logged_out");
    assert_eq!(harness.state.revocations.len().await, 1);

    let (status, body) = harness.send(with_bearer("GET", "/v1/me", &access)).await;
    assert_eq!(status, 401);
    assert_eq!(error_code(&body), "token_invalid");
}

#[tokio::test]
async fn revocations_are_dropped_once_the_token_expires() {
    let harness = harness().await;
    harness.register("alice", "pw").await;
    let (_, body) = harness.login("alice", "pw").await;
    let (access, _) = tokens(&body);
    harness
        .send(with_bearer("POST", "/v1/auth/logout", &access))
        .await;

    harness.clock.advance(Duration::hours(23));
    assert_eq!(harness.state.revocations.sweep().await, 0);

    harness.clock.advance(Duration::hours(2));
    assert_eq!(harness.state.revocations.sweep().await, 1);

    // Past expiry the token is rejected on its own merits.
    let (status, _) = harness.send(with_bearer("GET", "/v1/me", &access)).await;
    assert_eq!(status, 401);
}

#[tokio::test]
async fn refresh_for_a_deactivated_account_is_refused() {
    let harness = harness().await;
    harness.register("alice", "pw").await;
    let (_, body) = harness.login("alice", "pw").await;
    let (_, refresh) = tokens(&body);

    harness
        .state
        .session
        .set_active("alice", false)
        .await
        .expect("deactivate");

    let (status, body) = harness
        .send(json_post("/v1/auth/refresh", json!({ "refresh_token": refresh })))
        .await;
    assert_eq!(status, 401);
    assert_eq!(error_code(&body), "account_inactive");
}

/// Account store whose id lookups yield to the scheduler before answering.
struct SlowLookupStore {
    inner: MemoryAccountStore,
}

#[async_trait]
impl AccountStore for SlowLookupStore {
    async fn create(&self, account: NewAccount) -> Result<Account, StoreError> {
        self.inner.create(account).await
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<Account>, StoreError> {
        self.inner.find_by_username(username).await
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<Account>, StoreError> {
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        self.inner.find_by_id(id).await
    }

    async fn set_active(
        &self,
        id: i64,
        active: bool,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.inner.set_active(id, active, now).await
    }

    async fn read_lockout_clearing_expired(
        &self,
        username: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<LockoutState>, StoreError> {
        self.inner.read_lockout_clearing_expired(username, now).await
    }

    async fn record_failure(
        &self,
        username: &str,
        threshold: u32,
        now: DateTime<Utc>,
        lock_for: Duration,
    ) -> Result<Option<LockoutState>, StoreError> {
        self.inner
            .record_failure(username, threshold, now, lock_for)
            .await
    }

    async fn reset_lockout(&self, username: &str) -> Result<Option<LockoutState>, StoreError> {
        self.inner.reset_lockout(username).await
    }
}

#[tokio::test]
async fn concurrent_refreshes_with_one_token_redeem_it_once() {
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());
    let store: Arc<dyn AccountStore> = Arc::new(SlowLookupStore {
        inner: MemoryAccountStore::new(),
    });
    let session = SessionService::new(
        store.clone(),
        LockoutTracker::new(store, LockoutPolicy::default(), clock.clone()),
        TokenCodec::new(b"refresh-race-secret", "auth-gateway", clock.clone()).unwrap(),
        Arc::new(RevocationRegistry::new(clock.clone())),
        Arc::new(Argon2Hasher::fast()),
        clock,
        SessionSettings::default(),
    )
    .unwrap();

    session
        .register("alice", "alice@example.com", "pw")
        .await
        .unwrap();
    let login = session.login("alice", "pw").await.unwrap();
    let refresh = login.refresh.token;

    let (first, second) = tokio::join!(session.refresh(&refresh), session.refresh(&refresh));
    let redeemed = [first.is_ok(), second.is_ok()]
        .into_iter()
        .filter(|ok| *ok)
        .count();
    assert_eq!(redeemed, 1);
    assert!(matches!(
        first.and(second),
        Err(AuthError::TokenInvalid)
    ));
}

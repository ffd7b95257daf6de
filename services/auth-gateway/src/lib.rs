pub mod config;
pub mod error;
pub mod handlers;
pub mod rate_limit;
pub mod session;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use account_store::{
    AccountStore, JsonFileAccountStore, LockoutPolicy, LockoutTracker, MemoryAccountStore,
};
use axum::body::Body;
use axum::extract::{connect_info::ConnectInfo, MatchedPath, State};
use axum::http::{header, HeaderValue, Request, StatusCode};
use axum::middleware::{from_fn, from_fn_with_state, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use common_auth::{Argon2Hasher, Clock, RevocationRegistry, SystemClock, TokenCodec};
use common_config::ServiceConfig;
use common_obs::{admission_denied_total, health_router, http_requests_total};
use subtle::ConstantTimeEq;
use tracing::{info_span, Instrument};
use uuid::Uuid;

use config::{AuthGatewayConfig, Secret};
use error::{AuthError, StartupError};
use rate_limit::{client_identity, AdmissionController};
use session::{SessionService, SessionSettings};

pub const SERVICE_NAME: &str = "auth-gateway";
pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";
const REQUEST_ID_HEADER: &str = "x-request-id";

pub struct AppState {
    pub session: Arc<SessionService>,
    pub admission: AdmissionController,
    pub revocations: Arc<RevocationRegistry>,
    pub admin_token: Option<Secret>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let auth_routes = Router::new()
        .route("/v1/auth/login", post(handlers::login))
        .route("/v1/auth/refresh", post(handlers::refresh))
        .route("/v1/auth/logout", post(handlers::logout))
        .route("/v1/auth/register", post(handlers::register))
        .layer(from_fn_with_state(state.clone(), admission_guard));

    let account_routes = Router::new()
        .route("/v1/me", get(handlers::me))
        .layer(from_fn_with_state(state.clone(), require_auth));

    let admin_routes = Router::new()
        .route(
            "/v1/admin/accounts/:username/lock",
            get(handlers::lock_status).delete(handlers::unlock),
        )
        .route(
            "/v1/admin/accounts/:username/deactivate",
            post(handlers::deactivate),
        )
        .route(
            "/v1/admin/accounts/:username/activate",
            post(handlers::activate),
        )
        .layer(from_fn_with_state(state.clone(), admin_guard));

    let api = Router::new()
        .merge(auth_routes)
        .merge(account_routes)
        .merge(admin_routes)
        .with_state(state);

    Router::new()
        .route("/metrics", get(metrics))
        .merge(health_router(SERVICE_NAME))
        .merge(api)
        .layer(from_fn(request_context))
}

/// Wire the service together from configuration.
pub async fn build_state(config: &AuthGatewayConfig) -> Result<Arc<AppState>, StartupError> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let store: Arc<dyn AccountStore> = match &config.store_path {
        Some(path) => {
            let store = JsonFileAccountStore::open(path).await?;
            tracing::info!(path = %path.display(), "using file account store");
            Arc::new(store)
        }
        None => {
            tracing::warn!("no store path configured; accounts are kept in memory only");
            Arc::new(MemoryAccountStore::new())
        }
    };

    let secret = config
        .tokens
        .secret
        .as_ref()
        .filter(|secret| !secret.expose().is_empty())
        .ok_or(StartupError::MissingSecret(AuthGatewayConfig::PREFIX))?;
    let codec = TokenCodec::new(
        secret.expose().as_bytes(),
        config.tokens.issuer.clone(),
        clock.clone(),
    )?
    .with_leeway(chrono::Duration::seconds(config.tokens.leeway_secs));

    let policy = LockoutPolicy {
        threshold: config.lockout.threshold,
        duration: chrono::Duration::seconds(config.lockout.duration_secs),
    };
    let lockout = LockoutTracker::new(store.clone(), policy, clock.clone());
    let revocations = Arc::new(RevocationRegistry::new(clock.clone()));
    let settings = SessionSettings {
        access_ttl: chrono::Duration::seconds(config.tokens.access_ttl_secs),
        refresh_ttl: chrono::Duration::seconds(config.tokens.refresh_ttl_secs),
        revoke_rotated_refresh: config.tokens.revoke_rotated_refresh,
    };

    let session = SessionService::new(
        store,
        lockout,
        codec,
        revocations.clone(),
        Arc::new(Argon2Hasher::new()),
        clock,
        settings,
    )?;

    Ok(Arc::new(AppState {
        session: Arc::new(session),
        admission: AdmissionController::new(&config.rate_limit),
        revocations,
        admin_token: config.admin_token.clone(),
    }))
}

pub async fn admission_guard(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, AuthError> {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let identity = client_identity(req.headers(), peer);

    if !state.admission.allow(&identity).await {
        admission_denied_total().inc(&[], 1);
        tracing::warn!(
            event = "rate_limited",
            client = identity.as_str(),
            path = req.uri().path(),
            "admission denied"
        );
        return Err(AuthError::RateLimited {
            retry_after: Duration::from_secs(1),
        });
    }

    Ok(next.run(req).await)
}

pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    mut req: Request<Body>,
    next: Next,
) -> Result<Response, AuthError> {
    let token = handlers::bearer_from_headers(req.headers())?;
    let user = state.session.authenticate(token).await?;
    req.extensions_mut().insert(user);
    Ok(next.run(req).await)
}

pub async fn admin_guard(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, AuthError> {
    let Some(expected) = &state.admin_token else {
        return Err(AuthError::Forbidden);
    };
    let presented = req
        .headers()
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok());
    if !presented.is_some_and(|presented| constant_time_eq(presented, expected.expose())) {
        tracing::warn!(
            event = "admin_denied",
            path = req.uri().path(),
            "admin request without a valid token"
        );
        return Err(AuthError::Forbidden);
    }
    Ok(next.run(req).await)
}

/// Compare secrets without an early exit on the first differing byte.
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

async fn request_context(mut req: Request<Body>, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let request_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let header_value = HeaderValue::from_str(&request_id).ok();
    if let Some(value) = &header_value {
        req.headers_mut().insert(REQUEST_ID_HEADER, value.clone());
    }

    let span = info_span!(
        "http.request",
        method = %method,
        path = %path,
        request_id = %request_id
    );

    let start = Instant::now();
    span.in_scope(|| tracing::info!(event = "request_start", method = %method, path = %path));
    let mut response = next.run(req).instrument(span.clone()).await;

    let status = response.status();
    http_requests_total().inc(&[route.as_str(), status.as_str()], 1);
    span.in_scope(|| {
        tracing::info!(
            event = "request_end",
            method = %method,
            path = %path,
            status = status.as_u16(),
            latency_ms = start.elapsed().as_secs_f64() * 1000.0
        )
    });

    if let Some(value) = header_value {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

async fn metrics() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static(common_obs::PROMETHEUS_CONTENT_TYPE),
        )],
        common_obs::encode_prometheus_metrics(),
    )
}

#[cfg(test)]
mod tests {
    use super::constant_time_eq;

    #[test]
    fn admin_token_comparison() {
        assert!(constant_time_eq("admin-secret", "admin-secret"));
        assert!(!constant_time_eq("admin-secret", "admin-secreT"));
        assert!(!constant_time_eq("admin-secret", "admin"));
        assert!(!constant_time_eq("", "x"));
    }
}

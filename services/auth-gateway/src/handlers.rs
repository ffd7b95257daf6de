use std::sync::Arc;

use account_store::{AccountLockStatus, AccountSummary};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Extension, Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::AuthError;
use crate::session::{AuthenticatedUser, LoginSuccess, Profile};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    #[serde(default)]
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: i64,
    pub user: AccountSummary,
}

impl TokenResponse {
    fn from_success(success: LoginSuccess, access_ttl_secs: i64) -> Self {
        Self {
            access_token: success.access.token,
            refresh_token: success.refresh.token,
            token_type: "Bearer".to_string(),
            expires_in: access_ttl_secs,
            user: success.user,
        }
    }
}

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, AuthError> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| AuthError::Validation {
            message: rejection.body_text(),
        })
}

pub async fn login(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<TokenResponse>, AuthError> {
    let request = json_body(payload)?;
    let username = request.username.trim();
    if username.is_empty() {
        return Err(AuthError::Validation {
            message: "username is required".into(),
        });
    }
    if request.password.is_empty() {
        return Err(AuthError::Validation {
            message: "password is required".into(),
        });
    }

    let success = state.session.login(username, &request.password).await?;
    let ttl = state.session.settings().access_ttl.num_seconds();
    Ok(Json(TokenResponse::from_success(success, ttl)))
}

pub async fn refresh(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<RefreshRequest>, JsonRejection>,
) -> Result<Json<TokenResponse>, AuthError> {
    let request = json_body(payload)?;
    if request.refresh_token.is_empty() {
        return Err(AuthError::Validation {
            message: "refresh_token is required".into(),
        });
    }

    let success = state.session.refresh(&request.refresh_token).await?;
    let ttl = state.session.settings().access_ttl.num_seconds();
    Ok(Json(TokenResponse::from_success(success, ttl)))
}

pub async fn logout(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AuthError> {
    let token = bearer_from_headers(&headers)?;
    state.session.logout(token).await?;
    Ok(Json(json!({ "status": "logged_out" })))
}

pub async fn register(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<serde_json::Value>), AuthError> {
    let request = json_body(payload)?;
    let user = state
        .session
        .register(&request.username, &request.email, &request.password)
        .await?;
    Ok((StatusCode::CREATED, Json(json!({ "user": user }))))
}

pub async fn me(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Result<Json<serde_json::Value>, AuthError> {
    let profile = state.session.profile(user.user_id).await?;
    Ok(Json(json!({ "user": profile })))
}

pub async fn lock_status(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
) -> Result<Json<serde_json::Value>, AuthError> {
    match state.session.lockout().status(&username).await? {
        AccountLockStatus::NotFound => Err(AuthError::NotFound),
        status => Ok(Json(json!({ "username": username, "lock": status }))),
    }
}

pub async fn unlock(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
) -> Result<StatusCode, AuthError> {
    if state.session.lockout().unlock(&username).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AuthError::NotFound)
    }
}

pub async fn deactivate(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
) -> Result<Json<Profile>, AuthError> {
    Ok(Json(state.session.set_active(&username, false).await?))
}

pub async fn activate(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
) -> Result<Json<Profile>, AuthError> {
    Ok(Json(state.session.set_active(&username, true).await?))
}

pub fn bearer_from_headers(headers: &HeaderMap) -> Result<&str, AuthError> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(common_auth::bearer_token)
        .ok_or(AuthError::MissingBearer)
}

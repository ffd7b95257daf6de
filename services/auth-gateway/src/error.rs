use std::fmt;
use std::time::Duration;

use account_store::StoreError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use common_auth::{HashError, TokenError};
use serde::Serialize;
use thiserror::Error;

/// Outcomes of the authentication surface that end a request early.
///
/// Everything except `Internal` is an expected result and goes back to the
/// caller as-is. `Internal` is logged with its detail and surfaced as an
/// opaque 500.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("rate limited")]
    RateLimited { retry_after: Duration },
    #[error("account locked")]
    Locked { remaining: Duration },
    #[error("invalid username or password")]
    InvalidCredentials { attempts_remaining: Option<u32> },
    #[error("invalid or expired token")]
    TokenInvalid,
    #[error("account is not active")]
    AccountInactive,
    #[error("missing or malformed authorization header")]
    MissingBearer,
    #[error("forbidden")]
    Forbidden,
    #[error("not found")]
    NotFound,
    #[error("{message}")]
    Conflict { message: String },
    #[error("invalid request: {message}")]
    Validation { message: String },
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for AuthError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound => AuthError::NotFound,
            StoreError::Exists(username) => AuthError::Conflict {
                message: format!("username {username} already exists"),
            },
            other => AuthError::Internal(format!("account store: {other}")),
        }
    }
}

impl From<TokenError> for AuthError {
    fn from(error: TokenError) -> Self {
        match error {
            TokenError::Signing(_) | TokenError::MissingSecret => {
                AuthError::Internal(format!("token codec: {error}"))
            }
            // Which check failed stays server-side.
            other => {
                tracing::debug!(reason = %other, "token rejected");
                AuthError::TokenInvalid
            }
        }
    }
}

impl From<HashError> for AuthError {
    fn from(error: HashError) -> Self {
        AuthError::Internal(format!("password hashing: {error}"))
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: ErrorDetails<'a>,
}

#[derive(Debug, Serialize)]
struct ErrorDetails<'a> {
    code: &'a str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    attempts_remaining: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_minutes: Option<u64>,
}

/// Whole minutes, rounded up so a lock never reads as "0 minutes" while active.
pub fn minutes_rounded_up(duration: Duration) -> u64 {
    duration.as_secs().div_ceil(60)
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let mut details = ErrorDetails {
            code: "",
            message: self.to_string(),
            attempts_remaining: None,
            retry_after_minutes: None,
        };
        let mut retry_after = None;

        let status = match &self {
            AuthError::RateLimited { retry_after: after } => {
                details.code = "rate_limited";
                details.message = "rate limit exceeded, please try again later".to_string();
                retry_after = Some(*after);
                StatusCode::TOO_MANY_REQUESTS
            }
            AuthError::Locked { remaining } => {
                let minutes = minutes_rounded_up(*remaining);
                details.code = "account_locked";
                details.message = format!(
                    "account locked due to too many failed login attempts, try again in {minutes} minutes"
                );
                details.retry_after_minutes = Some(minutes);
                retry_after = Some(*remaining);
                StatusCode::LOCKED
            }
            AuthError::InvalidCredentials { attempts_remaining } => {
                details.code = "invalid_credentials";
                details.attempts_remaining = *attempts_remaining;
                StatusCode::UNAUTHORIZED
            }
            AuthError::TokenInvalid => {
                details.code = "token_invalid";
                StatusCode::UNAUTHORIZED
            }
            AuthError::AccountInactive => {
                details.code = "account_inactive";
                StatusCode::UNAUTHORIZED
            }
            AuthError::MissingBearer => {
                details.code = "unauthorized";
                StatusCode::UNAUTHORIZED
            }
            AuthError::Forbidden => {
                details.code = "forbidden";
                StatusCode::FORBIDDEN
            }
            AuthError::NotFound => {
                details.code = "not_found";
                StatusCode::NOT_FOUND
            }
            AuthError::Conflict { .. } => {
                details.code = "conflict";
                StatusCode::CONFLICT
            }
            AuthError::Validation { .. } => {
                details.code = "invalid_request";
                StatusCode::BAD_REQUEST
            }
            AuthError::Internal(detail) => {
                tracing::error!(error = %detail, "internal error while handling request");
                details.code = "internal_error";
                details.message = "internal server error".to_string();
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let mut response = (status, Json(ErrorBody { error: details })).into_response();

        if let Some(duration) = retry_after {
            if let Ok(header_value) = header_value_from_duration(duration) {
                response
                    .headers_mut()
                    .insert(axum::http::header::RETRY_AFTER, header_value);
            }
        }

        response
    }
}

fn header_value_from_duration(duration: Duration) -> Result<axum::http::HeaderValue, fmt::Error> {
    use std::fmt::Write;

    let mut buffer = String::new();
    write!(&mut buffer, "{}", duration.as_secs().max(1))?;
    axum::http::HeaderValue::from_str(&buffer).map_err(|_| fmt::Error)
}

/// Failures that stop the service from starting.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("configuration: {0}")]
    Config(#[from] common_config::ConfigError),
    #[error("a token signing secret must be configured ({0}JWT_SECRET)")]
    MissingSecret(&'static str),
    #[error("token codec: {0}")]
    Token(#[from] TokenError),
    #[error("account store: {0}")]
    Store(#[from] StoreError),
    #[error("password hashing: {0}")]
    Hash(#[from] HashError),
}

//! The login / refresh / logout protocol.
//!
//! A login runs CheckLock -> verify -> RecordFailure | RecordSuccess -> issue,
//! always to completion once started. Admission control happens before any
//! of this, in the HTTP middleware.

use std::sync::Arc;

use account_store::{
    Account, AccountStore, AccountSummary, FailureOutcome, LockStatus, LockoutTracker, NewAccount,
};
use chrono::{DateTime, Duration, Utc};
use common_auth::{
    Clock, IssuedToken, PasswordHasher, RevocationRegistry, TokenCodec, TokenKind, TokenPair,
};
use common_obs::{login_total, tokens_issued_total, tokens_revoked_total};
use serde::Serialize;

use crate::error::AuthError;

#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
    pub revoke_rotated_refresh: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            access_ttl: Duration::hours(24),
            refresh_ttl: Duration::days(7),
            revoke_rotated_refresh: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoginSuccess {
    pub access: IssuedToken,
    pub refresh: IssuedToken,
    pub user: AccountSummary,
}

/// Identity attached to a request that passed the authenticated-request check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthenticatedUser {
    pub user_id: i64,
    pub username: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Profile {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl From<Account> for Profile {
    fn from(account: Account) -> Self {
        Self {
            id: account.id,
            username: account.username,
            email: account.email,
            is_active: account.is_active,
            created_at: account.created_at,
        }
    }
}

pub struct SessionService {
    store: Arc<dyn AccountStore>,
    lockout: LockoutTracker,
    codec: TokenCodec,
    revocations: Arc<RevocationRegistry>,
    hasher: Arc<dyn PasswordHasher>,
    clock: Arc<dyn Clock>,
    settings: SessionSettings,
    /// Verified against for unknown usernames so they cost as much as real ones.
    decoy_hash: String,
}

impl SessionService {
    pub fn new(
        store: Arc<dyn AccountStore>,
        lockout: LockoutTracker,
        codec: TokenCodec,
        revocations: Arc<RevocationRegistry>,
        hasher: Arc<dyn PasswordHasher>,
        clock: Arc<dyn Clock>,
        settings: SessionSettings,
    ) -> Result<Self, common_auth::HashError> {
        let decoy_hash = hasher.hash("decoy-password-for-unknown-accounts")?;
        Ok(Self {
            store,
            lockout,
            codec,
            revocations,
            hasher,
            clock,
            settings,
            decoy_hash,
        })
    }

    pub fn settings(&self) -> SessionSettings {
        self.settings
    }

    pub fn lockout(&self) -> &LockoutTracker {
        &self.lockout
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<LoginSuccess, AuthError> {
        if let LockStatus::Locked { until } = self.lockout.check_lock(username).await? {
            login_total().inc(&["locked"], 1);
            return Err(self.locked_until(until));
        }

        let account = self.store.find_by_username(username).await?;
        let verified = match &account {
            Some(account) => {
                let matches = self.verify(password, &account.password_hash).await?;
                // Deactivated accounts fail like a wrong password.
                matches && account.is_active
            }
            None => {
                self.verify(password, &self.decoy_hash).await?;
                false
            }
        };

        let account = match account {
            Some(account) if verified => account,
            _ => return Err(self.fail_login(username).await?),
        };

        self.lockout.record_success(username).await?;
        let pair = self.issue_pair(&account)?;
        login_total().inc(&["success"], 1);
        tracing::info!(event = "login_success", user_id = account.id, username, "login succeeded");

        Ok(LoginSuccess {
            access: pair.access,
            refresh: pair.refresh,
            user: account.summary(),
        })
    }

    async fn fail_login(&self, username: &str) -> Result<AuthError, AuthError> {
        let error = match self.lockout.record_failure(username).await? {
            FailureOutcome::UnknownAccount => AuthError::InvalidCredentials {
                attempts_remaining: None,
            },
            FailureOutcome::Counted { remaining, .. } => AuthError::InvalidCredentials {
                attempts_remaining: Some(remaining),
            },
            FailureOutcome::Locked { until } => {
                login_total().inc(&["locked"], 1);
                return Ok(self.locked_until(until));
            }
        };
        login_total().inc(&["invalid_credentials"], 1);
        Ok(error)
    }

    pub async fn refresh(&self, refresh_token: &str) -> Result<LoginSuccess, AuthError> {
        if self.revocations.is_revoked(refresh_token).await {
            tracing::debug!("revoked refresh token presented");
            return Err(AuthError::TokenInvalid);
        }
        let claims = self.codec.validate_kind(refresh_token, TokenKind::Refresh)?;

        let account = self
            .store
            .find_by_id(claims.sub)
            .await?
            .ok_or(AuthError::TokenInvalid)?;
        if !account.is_active {
            return Err(AuthError::AccountInactive);
        }

        // Claimed before minting; a concurrent redemption of the same token loses here.
        if self.settings.revoke_rotated_refresh {
            if !self
                .revocations
                .revoke_if_absent(refresh_token, claims.expires_at())
                .await
            {
                tracing::warn!(
                    event = "refresh_replayed",
                    user_id = account.id,
                    "refresh token already redeemed"
                );
                return Err(AuthError::TokenInvalid);
            }
            tokens_revoked_total().inc(&[], 1);
        }
        let pair = self.issue_pair(&account)?;
        tracing::info!(event = "token_refreshed", user_id = account.id, "session refreshed");

        Ok(LoginSuccess {
            access: pair.access,
            refresh: pair.refresh,
            user: account.summary(),
        })
    }

    /// Revoke `token` (access or refresh) until its natural expiry.
    pub async fn logout(&self, token: &str) -> Result<(), AuthError> {
        let claims = self.codec.validate(token)?;
        self.revoke(token, claims.expires_at()).await;
        tracing::info!(
            event = "logout",
            user_id = claims.sub,
            kind = %claims.kind,
            "token revoked"
        );
        Ok(())
    }

    /// The authenticated-request check used by every protected route.
    pub async fn authenticate(&self, token: &str) -> Result<AuthenticatedUser, AuthError> {
        if self.revocations.is_revoked(token).await {
            return Err(AuthError::TokenInvalid);
        }
        let claims = self.codec.validate_kind(token, TokenKind::Access)?;
        Ok(AuthenticatedUser {
            user_id: claims.sub,
            username: claims.username,
        })
    }

    pub async fn register(
        &self,
        username: &str,
        email: &str,
        password: &str,
    ) -> Result<AccountSummary, AuthError> {
        let username = username.trim();
        if username.is_empty() {
            return Err(AuthError::Validation {
                message: "username is required".into(),
            });
        }
        if password.is_empty() {
            return Err(AuthError::Validation {
                message: "password is required".into(),
            });
        }

        let hasher = self.hasher.clone();
        let plaintext = password.to_string();
        let password_hash = tokio::task::spawn_blocking(move || hasher.hash(&plaintext))
            .await
            .map_err(|err| AuthError::Internal(format!("hashing task failed: {err}")))??;

        let account = self
            .store
            .create(NewAccount {
                username: username.to_string(),
                email: email.trim().to_string(),
                password_hash,
                created_at: self.clock.now(),
            })
            .await?;
        tracing::info!(event = "account_created", user_id = account.id, username, "account registered");
        Ok(account.summary())
    }

    pub async fn profile(&self, user_id: i64) -> Result<Profile, AuthError> {
        let account = self
            .store
            .find_by_id(user_id)
            .await?
            .ok_or(AuthError::NotFound)?;
        Ok(account.into())
    }

    pub async fn set_active(&self, username: &str, active: bool) -> Result<Profile, AuthError> {
        let account = self
            .store
            .find_by_username(username)
            .await?
            .ok_or(AuthError::NotFound)?;
        self.store
            .set_active(account.id, active, self.clock.now())
            .await?;
        tracing::info!(event = "account_active_changed", username, active, "account status changed");
        self.profile(account.id).await
    }

    async fn verify(&self, password: &str, stored_hash: &str) -> Result<bool, AuthError> {
        let hasher = self.hasher.clone();
        let plaintext = password.to_string();
        let stored = stored_hash.to_string();
        tokio::task::spawn_blocking(move || hasher.verify(&plaintext, &stored))
            .await
            .map_err(|err| AuthError::Internal(format!("password verification task failed: {err}")))
    }

    fn issue_pair(&self, account: &Account) -> Result<TokenPair, AuthError> {
        let pair = self.codec.issue_pair(
            account.id,
            &account.username,
            self.settings.access_ttl,
            self.settings.refresh_ttl,
        )?;
        tokens_issued_total().inc(&[TokenKind::Access.as_str()], 1);
        tokens_issued_total().inc(&[TokenKind::Refresh.as_str()], 1);
        Ok(pair)
    }

    async fn revoke(&self, token: &str, expires_at: DateTime<Utc>) {
        self.revocations.add(token, expires_at).await;
        tokens_revoked_total().inc(&[], 1);
    }

    fn locked_until(&self, until: DateTime<Utc>) -> AuthError {
        let remaining = (until - self.clock.now()).to_std().unwrap_or_default();
        AuthError::Locked { remaining }
    }
}

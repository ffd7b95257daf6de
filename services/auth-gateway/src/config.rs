use std::convert::Infallible;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use common_config::{override_from_env, override_optional_from_env, ServiceConfig};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthGatewayConfig {
    pub bind_address: String,
    pub port: u16,
    /// JSON account file. The in-memory store is used when unset.
    pub store_path: Option<PathBuf>,
    /// Shared secret for the `/v1/admin` routes. Admin routes are disabled when unset.
    pub admin_token: Option<Secret>,
    pub rate_limit: RateLimitSettings,
    pub lockout: LockoutSettings,
    pub tokens: TokenSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub rate_per_second: f64,
    pub burst: u32,
    /// Both the eviction cadence and the idle time after which a client's bucket is dropped.
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LockoutSettings {
    pub threshold: u32,
    pub duration_secs: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TokenSettings {
    pub secret: Option<Secret>,
    pub issuer: String,
    pub access_ttl_secs: i64,
    pub refresh_ttl_secs: i64,
    pub leeway_secs: i64,
    pub revocation_sweep_secs: u64,
    /// Revoke the presented refresh token when it is exchanged for a new pair.
    pub revoke_rotated_refresh: bool,
}

/// A configuration string that never shows up in `Debug` output.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl FromStr for Secret {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_string()))
    }
}

impl Default for AuthGatewayConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
            store_path: None,
            admin_token: None,
            rate_limit: RateLimitSettings::default(),
            lockout: LockoutSettings::default(),
            tokens: TokenSettings::default(),
        }
    }
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            rate_per_second: 10.0,
            burst: 20,
            sweep_interval_secs: 5 * 60,
        }
    }
}

impl Default for LockoutSettings {
    fn default() -> Self {
        Self {
            threshold: account_store::DEFAULT_THRESHOLD,
            duration_secs: account_store::DEFAULT_LOCKOUT_SECS,
        }
    }
}

impl Default for TokenSettings {
    fn default() -> Self {
        Self {
            secret: None,
            issuer: common_auth::token::DEFAULT_ISSUER.to_string(),
            access_ttl_secs: 24 * 60 * 60,
            refresh_ttl_secs: 7 * 24 * 60 * 60,
            leeway_secs: common_auth::token::DEFAULT_LEEWAY_SECS,
            revocation_sweep_secs: 60 * 60,
            revoke_rotated_refresh: true,
        }
    }
}

impl AuthGatewayConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.bind_address, self.port).parse()
    }
}

impl ServiceConfig for AuthGatewayConfig {
    const PREFIX: &'static str = "AUTH_GATEWAY_";

    fn apply_environment_overrides(&mut self, prefix: &str) {
        override_from_env(&mut self.bind_address, prefix, "BIND_ADDRESS");
        override_from_env(&mut self.port, prefix, "PORT");
        override_optional_from_env(&mut self.store_path, prefix, "STORE_PATH");
        override_optional_from_env(&mut self.admin_token, prefix, "ADMIN_TOKEN");

        override_from_env(&mut self.rate_limit.rate_per_second, prefix, "RATE_LIMIT_RPS");
        override_from_env(&mut self.rate_limit.burst, prefix, "RATE_LIMIT_BURST");
        override_from_env(
            &mut self.rate_limit.sweep_interval_secs,
            prefix,
            "RATE_LIMIT_SWEEP_SECS",
        );

        override_from_env(&mut self.lockout.threshold, prefix, "LOCKOUT_THRESHOLD");
        override_from_env(&mut self.lockout.duration_secs, prefix, "LOCKOUT_DURATION_SECS");

        override_optional_from_env(&mut self.tokens.secret, prefix, "JWT_SECRET");
        override_from_env(&mut self.tokens.issuer, prefix, "JWT_ISSUER");
        override_from_env(&mut self.tokens.access_ttl_secs, prefix, "ACCESS_TTL_SECS");
        override_from_env(&mut self.tokens.refresh_ttl_secs, prefix, "REFRESH_TTL_SECS");
        override_from_env(&mut self.tokens.leeway_secs, prefix, "TOKEN_LEEWAY_SECS");
        override_from_env(
            &mut self.tokens.revocation_sweep_secs,
            prefix,
            "REVOCATION_SWEEP_SECS",
        );
        override_from_env(
            &mut self.tokens.revoke_rotated_refresh,
            prefix,
            "REVOKE_ROTATED_REFRESH",
        );
    }
}

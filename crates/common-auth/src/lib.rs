//! Authentication primitives shared by the gateway: session tokens, their
//! revocation, and password hashing.

pub mod clock;
pub mod password;
pub mod revocation;
pub mod token;

pub use clock::{Clock, ManualClock, SystemClock};
pub use password::{Argon2Hasher, HashError, PasswordHasher};
pub use revocation::RevocationRegistry;
pub use token::{Claims, IssuedToken, TokenCodec, TokenError, TokenKind, TokenPair};

/// Extract the credential from an `Authorization: Bearer <token>` value.
pub fn bearer_token(header_value: &str) -> Option<&str> {
    let (scheme, token) = header_value.split_once(' ')?;
    if scheme != "Bearer" {
        return None;
    }
    let token = token.trim();
    if token.is_empty() || token.contains(' ') {
        return None;
    }
    Some(token)
}

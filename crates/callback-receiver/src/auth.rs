//! Callback authentication
//!
//! The provider authenticates with HTTP Basic credentials made of the
//! channel key (username) and channel secret (password).

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use std::fmt;
use thiserror::Error;

/// Channel identity used to authenticate inbound callbacks
#[derive(Clone)]
pub struct ChannelCredentials {
    pub key: String,
    secret: String,
}

impl ChannelCredentials {
    pub fn new(key: &str, secret: &str) -> Self {
        Self {
            key: key.to_string(),
            secret: secret.to_string(),
        }
    }
}

impl fmt::Debug for ChannelCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelCredentials")
            .field("key", &self.key)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Reason a request failed authentication
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthRejection {
    #[error("Missing credentials")]
    MissingCredentials,

    #[error("Unknown channel key")]
    UnknownChannel,

    #[error("Wrong channel secret")]
    WrongSecret,
}

impl AuthRejection {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::MissingCredentials => StatusCode::UNAUTHORIZED,
            Self::UnknownChannel | Self::WrongSecret => StatusCode::FORBIDDEN,
        }
    }
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match status {
            StatusCode::UNAUTHORIZED => "Unauthorized",
            _ => "Forbidden",
        };
        (status, message).into_response()
    }
}

/// Validates presented Basic credentials against the channel identity
#[derive(Debug, Clone)]
pub struct AuthGuard {
    channel: Option<ChannelCredentials>,
}

impl AuthGuard {
    /// Guard that admits every request
    pub fn disabled() -> Self {
        Self { channel: None }
    }

    pub fn new(channel: ChannelCredentials) -> Self {
        Self {
            channel: Some(channel),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.channel.is_some()
    }

    /// Check a `(username, password)` pair taken from the request
    pub fn authenticate(&self, presented: Option<(&str, &str)>) -> Result<(), AuthRejection> {
        let Some(channel) = &self.channel else {
            return Ok(());
        };
        let (key, secret) = presented.ok_or(AuthRejection::MissingCredentials)?;

        if !constant_time_eq(key.as_bytes(), channel.key.as_bytes()) {
            return Err(AuthRejection::UnknownChannel);
        }
        if !constant_time_eq(secret.as_bytes(), channel.secret.as_bytes()) {
            return Err(AuthRejection::WrongSecret);
        }
        Ok(())
    }
}

/// Constant-time byte comparison
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b) {
        result |= x ^ y;
    }

    result == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> AuthGuard {
        AuthGuard::new(ChannelCredentials::new("channel-key", "channel-secret"))
    }

    #[test]
    fn test_disabled_guard_admits_everything() {
        let guard = AuthGuard::disabled();
        assert!(!guard.is_enabled());
        assert!(guard.authenticate(None).is_ok());
        assert!(guard.authenticate(Some(("x", "y"))).is_ok());
    }

    #[test]
    fn test_matching_credentials() {
        assert!(guard()
            .authenticate(Some(("channel-key", "channel-secret")))
            .is_ok());
    }

    #[test]
    fn test_rejection_reasons() {
        let guard = guard();
        assert_eq!(
            guard.authenticate(None),
            Err(AuthRejection::MissingCredentials)
        );
        assert_eq!(
            guard.authenticate(Some(("other-key", "channel-secret"))),
            Err(AuthRejection::UnknownChannel)
        );
        assert_eq!(
            guard.authenticate(Some(("channel-key", "nope"))),
            Err(AuthRejection::WrongSecret)
        );
    }

    #[test]
    fn test_rejection_status_codes() {
        assert_eq!(
            AuthRejection::MissingCredentials.status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(AuthRejection::UnknownChannel.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(AuthRejection::WrongSecret.status_code(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_secret_is_not_printed() {
        let printed = format!("{:?}", ChannelCredentials::new("k", "hunter2"));
        assert!(!printed.contains("hunter2"));
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }
}

//! Authentication Module
//!
//! Bearer-token authentication for the request pipeline. The algorithm
//! is configurable: `none` (every request anonymous), `token` (HS256
//! bearer tokens against a shared secret) or `password` (full account
//! flow with argon2 hashes and the /auth/* surface mounted).
//!
//! Token time validation is owned here, against an injectable clock, so
//! tests are deterministic and expiry maps to its own error kind.

use crate::config::{AuthProviderKind, AuthSettings};
use crate::error::{ApiError, ApiResult};
use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use axum::http::HeaderMap;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

// ============================================================================
// CLOCK ABSTRACTION
// ============================================================================

/// Clock for token time validation; injectable for deterministic tests.
pub trait AuthClock: Send + Sync {
    /// Current time as Unix epoch seconds.
    fn now_epoch_secs(&self) -> i64;
}

/// Production clock using system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl AuthClock for SystemClock {
    fn now_epoch_secs(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// Fixed clock for tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub i64);

impl AuthClock for FixedClock {
    fn now_epoch_secs(&self) -> i64 {
        self.0
    }
}

// ============================================================================
// CLAIMS
// ============================================================================

/// JWT claims issued and accepted by the runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: String,
    /// Expiry, epoch seconds.
    pub exp: i64,
    /// Issued at, epoch seconds.
    pub iat: i64,
    /// `access` or `refresh`.
    pub kind: String,
}

/// Authenticated request identity; `None` is the anonymous marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthContext {
    pub user_id: Option<Uuid>,
}

impl AuthContext {
    pub fn anonymous() -> Self {
        Self { user_id: None }
    }

    pub fn user(user_id: Uuid) -> Self {
        Self {
            user_id: Some(user_id),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.user_id.is_some()
    }
}

// ============================================================================
// SERVICE
// ============================================================================

/// Authentication service owned by the server object.
pub struct AuthService {
    kind: AuthProviderKind,
    secret: Option<SecretString>,
    access_ttl_secs: u64,
    refresh_ttl_secs: u64,
    clock: Arc<dyn AuthClock>,
}

impl AuthService {
    pub fn from_settings(settings: &AuthSettings) -> ApiResult<Self> {
        if settings.provider != AuthProviderKind::None && settings.secret.is_none() {
            return Err(ApiError::internal(
                "auth.secret is required unless auth.provider = \"none\"",
            ));
        }
        if let Some(secret) = &settings.secret {
            if secret.len() < 16 {
                return Err(ApiError::internal(
                    "auth.secret must be at least 16 bytes",
                ));
            }
        }
        Ok(Self {
            kind: settings.provider,
            secret: settings.secret.clone().map(SecretString::from),
            access_ttl_secs: settings.access_ttl_secs,
            refresh_ttl_secs: settings.refresh_ttl_secs,
            clock: Arc::new(SystemClock),
        })
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: impl AuthClock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn provider_kind(&self) -> AuthProviderKind {
        self.kind
    }

    /// True when the /auth/* surface should be mounted.
    pub fn password_flow_enabled(&self) -> bool {
        self.kind == AuthProviderKind::Password
    }

    /// Verify a bearer credential into a request identity. A missing
    /// credential is the anonymous marker; whether anonymous is
    /// acceptable is the route's decision.
    pub fn authenticate(&self, bearer: Option<&str>) -> ApiResult<AuthContext> {
        if self.kind == AuthProviderKind::None {
            return Ok(AuthContext::anonymous());
        }
        let Some(token) = bearer else {
            return Ok(AuthContext::anonymous());
        };
        let claims = self.verify(token, "access")?;
        let user_id = Uuid::parse_str(&claims.sub)
            .map_err(|_| ApiError::auth_invalid("Malformed subject claim"))?;
        Ok(AuthContext::user(user_id))
    }

    /// Issue an access token for a user.
    pub fn issue_access(&self, user_id: Uuid) -> ApiResult<String> {
        self.issue(user_id, "access", self.access_ttl_secs)
    }

    /// Issue a refresh token for a user.
    pub fn issue_refresh(&self, user_id: Uuid) -> ApiResult<String> {
        self.issue(user_id, "refresh", self.refresh_ttl_secs)
    }

    /// Verify a refresh token, yielding the user it refreshes.
    pub fn verify_refresh(&self, token: &str) -> ApiResult<Uuid> {
        let claims = self.verify(token, "refresh")?;
        Uuid::parse_str(&claims.sub).map_err(|_| ApiError::auth_invalid("Malformed subject claim"))
    }

    fn issue(&self, user_id: Uuid, kind: &str, ttl_secs: u64) -> ApiResult<String> {
        let secret = self.secret()?;
        let now = self.clock.now_epoch_secs();
        let claims = Claims {
            sub: user_id.to_string(),
            iat: now,
            exp: now + ttl_secs as i64,
            kind: kind.to_string(),
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret.expose_secret().as_bytes()),
        )
        .map_err(|e| ApiError::internal(format!("token signing failed: {}", e)))
    }

    fn verify(&self, token: &str, expected_kind: &str) -> ApiResult<Claims> {
        let secret = self.secret()?;
        // Expiry is checked against our clock below, not by the library.
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.required_spec_claims.clear();

        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(secret.expose_secret().as_bytes()),
            &validation,
        )
        .map_err(|_| ApiError::auth_invalid("Invalid token"))?;

        if data.claims.exp <= self.clock.now_epoch_secs() {
            return Err(ApiError::token_expired());
        }
        if data.claims.kind != expected_kind {
            return Err(ApiError::auth_invalid("Wrong token kind"));
        }
        Ok(data.claims)
    }

    fn secret(&self) -> ApiResult<&SecretString> {
        self.secret
            .as_ref()
            .ok_or_else(|| ApiError::internal("auth secret not configured"))
    }

    // ========================================================================
    // PASSWORD HASHING
    // ========================================================================

    pub fn hash_password(&self, password: &str) -> ApiResult<String> {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| ApiError::internal(format!("password hashing failed: {}", e)))
    }

    pub fn verify_password(&self, password: &str, hash: &str) -> ApiResult<bool> {
        let parsed =
            PasswordHash::new(hash).map_err(|e| ApiError::internal(format!("bad hash: {}", e)))?;
        Ok(Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok())
    }
}

/// Extract the bearer credential from request headers.
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(clock: FixedClock) -> AuthService {
        AuthService::from_settings(&AuthSettings {
            provider: AuthProviderKind::Token,
            secret: Some("a-test-secret-of-sufficient-size".to_string()),
            access_ttl_secs: 3600,
            refresh_ttl_secs: 86400,
            webhook_user: None,
        })
        .expect("service")
        .with_clock(clock)
    }

    const NOW: i64 = 1_704_067_200; // 2024-01-01

    #[test]
    fn test_round_trip() {
        let auth = service(FixedClock(NOW));
        let user = Uuid::new_v4();
        let token = auth.issue_access(user).expect("issue");
        let ctx = auth.authenticate(Some(&token)).expect("verify");
        assert_eq!(ctx.user_id, Some(user));
    }

    #[test]
    fn test_missing_bearer_is_anonymous() {
        let auth = service(FixedClock(NOW));
        let ctx = auth.authenticate(None).expect("anonymous");
        assert!(!ctx.is_authenticated());
    }

    #[test]
    fn test_expired_token() {
        let issuing = service(FixedClock(NOW));
        let token = issuing.issue_access(Uuid::new_v4()).expect("issue");

        let later = service(FixedClock(NOW + 7200));
        let err = later.authenticate(Some(&token)).expect_err("expired");
        assert_eq!(err.code, crate::error::ErrorCode::TokenExpired);
    }

    #[test]
    fn test_garbage_token_rejected() {
        let auth = service(FixedClock(NOW));
        let err = auth.authenticate(Some("not-a-token")).expect_err("invalid");
        assert_eq!(err.code, crate::error::ErrorCode::AuthInvalid);
    }

    #[test]
    fn test_refresh_token_is_not_an_access_token() {
        let auth = service(FixedClock(NOW));
        let user = Uuid::new_v4();
        let refresh = auth.issue_refresh(user).expect("issue");
        assert!(auth.authenticate(Some(&refresh)).is_err());
        assert_eq!(auth.verify_refresh(&refresh).expect("refresh"), user);
    }

    #[test]
    fn test_none_provider_always_anonymous() {
        let auth = AuthService::from_settings(&AuthSettings {
            provider: AuthProviderKind::None,
            secret: None,
            access_ttl_secs: 3600,
            refresh_ttl_secs: 86400,
            webhook_user: None,
        })
        .expect("service");
        let ctx = auth.authenticate(Some("ignored")).expect("anonymous");
        assert!(!ctx.is_authenticated());
    }

    #[test]
    fn test_password_hash_round_trip() {
        let auth = service(FixedClock(NOW));
        let hash = auth.hash_password("hunter2!").expect("hash");
        assert!(auth.verify_password("hunter2!", &hash).expect("verify"));
        assert!(!auth.verify_password("wrong", &hash).expect("verify"));
    }

    #[test]
    fn test_short_secret_rejected() {
        let result = AuthService::from_settings(&AuthSettings {
            provider: AuthProviderKind::Token,
            secret: Some("short".to_string()),
            access_ttl_secs: 3600,
            refresh_ttl_secs: 86400,
            webhook_user: None,
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_bearer_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            "Bearer abc.def.ghi".parse().unwrap(),
        );
        assert_eq!(bearer_token(&headers).as_deref(), Some("abc.def.ghi"));

        let empty = HeaderMap::new();
        assert!(bearer_token(&empty).is_none());
    }
}

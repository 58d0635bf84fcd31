//! Bearer-token authentication.
//!
//! Tokens are compact JWS-style strings: base64url header and claims,
//! HMAC-SHA256 signature keyed by the configured secret. When no secret is
//! configured, authentication is disabled and every request is anonymous.
//! Users live in an in-memory table with keyed password hashes.

use std::collections::HashMap;
use std::sync::Mutex;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use courier_store::models::new_task_id;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("token expired")]
    Expired,
    #[error("invalid token: {0}")]
    Invalid(String),
    #[error("email already registered")]
    EmailTaken,
    #[error("invalid email or password")]
    BadCredentials,
    #[error("authentication is not configured")]
    Disabled,
}

/// Signed token claims.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Claims {
    pub sub: String,
    pub email: String,
    pub iat: i64,
    pub exp: i64,
}

/// Authenticated caller identity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuthUser {
    pub user_id: String,
    pub email: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: &'static str,
    pub expires_in: i64,
    pub user_id: String,
}

struct UserRecord {
    user_id: String,
    password_hash: Vec<u8>,
}

fn sign(secret: &str, message: &str) -> Vec<u8> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(message.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

/// Create a signed token for a user.
pub fn create_token(secret: &str, expiry_minutes: i64, user_id: &str, email: &str) -> String {
    let now = Utc::now().timestamp();
    let claims = Claims {
        sub: user_id.to_string(),
        email: email.to_string(),
        iat: now,
        exp: now + expiry_minutes * 60,
    };

    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload =
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims).expect("claims serialize"));
    let message = format!("{header}.{payload}");
    let signature = URL_SAFE_NO_PAD.encode(sign(secret, &message));
    format!("{message}.{signature}")
}

/// Validate a token and return its claims.
pub fn decode_token(secret: &str, token: &str) -> Result<Claims, AuthError> {
    let mut parts = token.split('.');
    let (Some(header), Some(payload), Some(signature), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(AuthError::Invalid("malformed token".to_string()));
    };

    let message = format!("{header}.{payload}");
    let expected = sign(secret, &message);
    let provided = URL_SAFE_NO_PAD
        .decode(signature)
        .map_err(|_| AuthError::Invalid("bad signature encoding".to_string()))?;

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(message.as_bytes());
    if mac.verify_slice(&provided).is_err() || expected.len() != provided.len() {
        return Err(AuthError::Invalid("signature mismatch".to_string()));
    }

    let claims_bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| AuthError::Invalid("bad claims encoding".to_string()))?;
    let claims: Claims = serde_json::from_slice(&claims_bytes)
        .map_err(|e| AuthError::Invalid(e.to_string()))?;

    if claims.exp < Utc::now().timestamp() {
        return Err(AuthError::Expired);
    }
    Ok(claims)
}

/// In-memory user registry plus token issuance.
pub struct AuthRegistry {
    secret: String,
    expiry_minutes: i64,
    users: Mutex<HashMap<String, UserRecord>>,
}

impl AuthRegistry {
    pub fn new(secret: impl Into<String>, expiry_minutes: i64) -> Self {
        Self {
            secret: secret.into(),
            expiry_minutes,
            users: Mutex::new(HashMap::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        !self.secret.is_empty()
    }

    pub fn expiry_seconds(&self) -> i64 {
        self.expiry_minutes * 60
    }

    fn password_hash(&self, password: &str) -> Vec<u8> {
        // Keyed hash under the server secret; password storage proper is a
        // deployment concern outside this service.
        sign(&self.secret, password)
    }

    pub fn register(&self, email: &str, password: &str) -> Result<TokenResponse, AuthError> {
        if !self.enabled() {
            return Err(AuthError::Disabled);
        }

        let mut users = self.users.lock().expect("user lock poisoned");
        if users.contains_key(email) {
            return Err(AuthError::EmailTaken);
        }

        let user_id = new_task_id();
        users.insert(
            email.to_string(),
            UserRecord {
                user_id: user_id.clone(),
                password_hash: self.password_hash(password),
            },
        );
        tracing::info!(email = %email, user_id = %user_id, "user registered");

        Ok(TokenResponse {
            access_token: create_token(&self.secret, self.expiry_minutes, &user_id, email),
            token_type: "bearer",
            expires_in: self.expiry_seconds(),
            user_id,
        })
    }

    pub fn login(&self, email: &str, password: &str) -> Result<TokenResponse, AuthError> {
        if !self.enabled() {
            return Err(AuthError::Disabled);
        }

        let users = self.users.lock().expect("user lock poisoned");
        let record = users.get(email).ok_or(AuthError::BadCredentials)?;
        if record.password_hash != self.password_hash(password) {
            return Err(AuthError::BadCredentials);
        }

        tracing::info!(email = %email, user_id = %record.user_id, "user logged in");
        Ok(TokenResponse {
            access_token: create_token(
                &self.secret,
                self.expiry_minutes,
                &record.user_id,
                email,
            ),
            token_type: "bearer",
            expires_in: self.expiry_seconds(),
            user_id: record.user_id.clone(),
        })
    }

    /// Identity from a bearer token, if one is present and valid.
    ///
    /// Returns `None` both when auth is disabled and when the header is
    /// absent or bad; optional-auth endpoints treat those alike.
    pub fn optional_user(&self, authorization: Option<&str>) -> Option<AuthUser> {
        if !self.enabled() {
            return None;
        }
        let token = authorization?.strip_prefix("Bearer ")?;
        let claims = decode_token(&self.secret, token).ok()?;
        Some(AuthUser {
            user_id: claims.sub,
            email: claims.email,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

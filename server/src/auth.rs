//! Credential verification.
//!
//! Sessions never look inside a token themselves; they hand it to an
//! [`Authenticator`] and get back the subject it names. The production
//! implementation checks HS256-signed JWTs carrying a `userId` claim and an
//! optional `role`, the same tokens the account service hands out at sign-in.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Account role. The account service writes these capitalized; lowercase is
/// accepted too.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    #[serde(alias = "user")]
    User,
    #[serde(alias = "admin")]
    Admin,
}

/// The verified identity behind a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    pub user_id: String,
    pub role: Option<Role>,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token rejected: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
    #[error("token carries no user id")]
    MissingSubject,
}

pub trait Authenticator: Send + Sync {
    fn verify(&self, token: &str) -> Result<Subject, AuthError>;
}

/// Claims carried by session tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    /// Expiry as a Unix timestamp. Checked when present; tokens without one
    /// never expire.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,
}

pub struct JwtAuthenticator {
    key: DecodingKey,
    validation: Validation,
}

impl JwtAuthenticator {
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.required_spec_claims.clear();

        Self {
            key: DecodingKey::from_secret(secret),
            validation,
        }
    }
}

impl Authenticator for JwtAuthenticator {
    fn verify(&self, token: &str) -> Result<Subject, AuthError> {
        let data = decode::<Claims>(token, &self.key, &self.validation)?;
        let claims = data.claims;

        if claims.user_id.trim().is_empty() {
            return Err(AuthError::MissingSubject);
        }

        Ok(Subject {
            user_id: claims.user_id,
            role: claims.role,
        })
    }
}

//! Credential verification.
//!
//! Token issuance lives in the account service; this side only checks the
//! signature and expiry and extracts who the caller is.

use crate::error::{Result, SyncError};
use crate::game::UserId;
use async_trait::async_trait;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

/// Who a verified credential belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub identity: UserId,
    pub username: String,
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, token: &str) -> Result<Credentials>;
}

/// Claims minted by the account service's login route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub id: String,
    pub username: String,
    pub exp: i64,
}

pub struct JwtAuthenticator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtAuthenticator {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp"]);
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }
}

#[async_trait]
impl Authenticator for JwtAuthenticator {
    async fn authenticate(&self, token: &str) -> Result<Credentials> {
        if token.is_empty() {
            return Err(SyncError::MissingCredential);
        }
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| SyncError::InvalidCredential(e.to_string()))?;
        Ok(Credentials {
            identity: UserId::from(data.claims.id),
            username: data.claims.username,
        })
    }
}

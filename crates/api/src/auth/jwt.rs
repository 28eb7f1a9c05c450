//! JWT validation for identity provider tokens

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

/// Audience the identity provider puts on signed-in user tokens
const AUTHENTICATED_AUDIENCE: &str = "authenticated";

/// JWT claims of a Supabase-issued token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupabaseClaims {
    /// Subject (account id)
    pub sub: String,
    pub email: Option<String>,
    /// Role (authenticated, anon, etc.)
    pub role: Option<String>,
    pub aud: Option<String>,
    pub iat: Option<i64>,
    pub exp: i64,
}

/// Validates bearer tokens issued by the identity provider
#[derive(Clone)]
pub struct JwtManager {
    decoding_key: DecodingKey,
}

impl JwtManager {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    /// Validate a token and return its claims.
    /// Only HS256 is accepted.
    pub fn validate_token(&self, token: &str) -> Result<SupabaseClaims, JwtError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 60; // 60 second clock skew tolerance
        validation.set_audience(&[AUTHENTICATED_AUDIENCE]);

        let claims = decode::<SupabaseClaims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => JwtError::Expired,
                jsonwebtoken::errors::ErrorKind::InvalidToken
                | jsonwebtoken::errors::ErrorKind::InvalidAlgorithm
                | jsonwebtoken::errors::ErrorKind::InvalidSignature => JwtError::Invalid,
                jsonwebtoken::errors::ErrorKind::InvalidAudience => {
                    tracing::warn!("JWT audience validation failed - rejecting token");
                    JwtError::Invalid
                }
                _ => JwtError::Validation(e.to_string()),
            })?;

        if claims.sub.trim().is_empty() {
            return Err(JwtError::Invalid);
        }
        Ok(claims)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JwtError {
    #[error("Token has expired")]
    Expired,
    #[error("Invalid token")]
    Invalid,
    #[error("Token validation failed: {0}")]
    Validation(String),
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use time::OffsetDateTime;

    const TEST_SECRET: &str = "test-jwt-secret-must-be-at-least-32-characters-long";

    fn sign(claims: &SupabaseClaims, secret: &str) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn claims_for(sub: &str, exp_offset_secs: i64) -> SupabaseClaims {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        SupabaseClaims {
            sub: sub.to_string(),
            email: Some("owner@example.com".to_string()),
            role: Some("authenticated".to_string()),
            aud: Some(AUTHENTICATED_AUDIENCE.to_string()),
            iat: Some(now),
            exp: now + exp_offset_secs,
        }
    }

    #[test]
    fn test_valid_token() {
        let manager = JwtManager::new(TEST_SECRET);
        let token = sign(&claims_for("uid-1", 3600), TEST_SECRET);
        let claims = manager.validate_token(&token).unwrap();
        assert_eq!(claims.sub, "uid-1");
    }

    #[test]
    fn test_rejects_wrong_secret_and_expired() {
        let manager = JwtManager::new(TEST_SECRET);

        let forged = sign(
            &claims_for("uid-1", 3600),
            "another-secret-that-is-also-32-characters-long",
        );
        assert!(matches!(manager.validate_token(&forged), Err(JwtError::Invalid)));

        let expired = sign(&claims_for("uid-1", -3600), TEST_SECRET);
        assert!(matches!(manager.validate_token(&expired), Err(JwtError::Expired)));
    }

    #[test]
    fn test_rejects_wrong_audience() {
        let manager = JwtManager::new(TEST_SECRET);
        let mut claims = claims_for("uid-1", 3600);
        claims.aud = Some("anon".to_string());
        let token = sign(&claims, TEST_SECRET);
        assert!(manager.validate_token(&token).is_err());
    }
}

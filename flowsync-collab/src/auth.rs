//! Authentication collaborator.
//!
//! The transport hands the credential found in the handshake (the
//! `Authorization` cookie or a bearer header) to an [`Authenticator`]; a
//! successful check yields an opaque [`Identity`] that the hub records as
//! the author of committed operations.

use crate::error::SyncError;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Opaque authenticated identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity(pub String);

impl Identity {
    pub fn anonymous() -> Self {
        Identity("anonymous".into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub trait Authenticator: Send + Sync {
    /// `credentials` is the raw token, `None` when the handshake carried none.
    fn authenticate(&self, credentials: Option<&str>) -> Result<Identity, SyncError>;
}

/// Accepts every connection.
#[derive(Debug, Default, Clone)]
pub struct AllowAnonymous;

impl Authenticator for AllowAnonymous {
    fn authenticate(&self, _credentials: Option<&str>) -> Result<Identity, SyncError> {
        Ok(Identity::anonymous())
    }
}

/// Fixed token → identity table.
#[derive(Debug, Default, Clone)]
pub struct StaticTokens {
    tokens: HashMap<String, Identity>,
}

impl StaticTokens {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, identity: impl Into<String>) -> Self {
        self.tokens.insert(token.into(), Identity(identity.into()));
        self
    }
}

impl Authenticator for StaticTokens {
    fn authenticate(&self, credentials: Option<&str>) -> Result<Identity, SyncError> {
        credentials
            .and_then(|token| self.tokens.get(token))
            .cloned()
            .ok_or(SyncError::Unauthorized)
    }
}

/// JWT claims: only the subject is required.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,
}

/// Verifies HS256-signed JWTs and uses the `sub` claim as identity.
pub struct JwtAuthenticator {
    key: DecodingKey,
    validation: Validation,
}

impl JwtAuthenticator {
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // `exp` is checked when present but not required
        validation.required_spec_claims.clear();
        Self {
            key: DecodingKey::from_secret(secret),
            validation,
        }
    }
}

impl Authenticator for JwtAuthenticator {
    fn authenticate(&self, credentials: Option<&str>) -> Result<Identity, SyncError> {
        let token = credentials.ok_or(SyncError::Unauthorized)?;
        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|e| {
            log::warn!("Rejected token: {e}");
            SyncError::Unauthorized
        })?;
        Ok(Identity(data.claims.sub))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn token(secret: &[u8], claims: &Claims) -> String {
        encode(&Header::new(Algorithm::HS256), claims, &EncodingKey::from_secret(secret)).unwrap()
    }

    #[test]
    fn test_allow_anonymous() {
        assert_eq!(AllowAnonymous.authenticate(None).unwrap(), Identity::anonymous());
    }

    #[test]
    fn test_static_tokens() {
        let auth = StaticTokens::new().with_token("t1", "alice");
        assert_eq!(auth.authenticate(Some("t1")).unwrap().as_str(), "alice");
        assert!(matches!(auth.authenticate(Some("nope")), Err(SyncError::Unauthorized)));
        assert!(matches!(auth.authenticate(None), Err(SyncError::Unauthorized)));
    }

    #[test]
    fn test_jwt_valid() {
        let auth = JwtAuthenticator::new(b"secret");
        let jwt = token(
            b"secret",
            &Claims {
                sub: "bob".into(),
                exp: None,
            },
        );
        assert_eq!(auth.authenticate(Some(&jwt)).unwrap(), Identity("bob".into()));
    }

    #[test]
    fn test_jwt_wrong_secret() {
        let auth = JwtAuthenticator::new(b"secret");
        let jwt = token(
            b"other",
            &Claims {
                sub: "bob".into(),
                exp: None,
            },
        );
        assert!(matches!(auth.authenticate(Some(&jwt)), Err(SyncError::Unauthorized)));
        assert!(matches!(auth.authenticate(None), Err(SyncError::Unauthorized)));
    }

    #[test]
    fn test_jwt_expired() {
        let auth = JwtAuthenticator::new(b"secret");
        let jwt = token(
            b"secret",
            &Claims {
                sub: "bob".into(),
                exp: Some(1),
            },
        );
        assert!(matches!(auth.authenticate(Some(&jwt)), Err(SyncError::Unauthorized)));
    }
}

//! Credential provider seam.
//!
//! The engine never talks OAuth itself; it asks a `CredentialProvider` for a
//! usable access credential and treats the answer as opaque.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

use calsync_common::{Error, Result, UserId};

/// Source of access credentials for remote calls.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Get a usable access credential for the user.
    ///
    /// # Errors
    /// - `NotAuthenticated` if no credential can be produced
    async fn access_credential(&self, user: &UserId) -> Result<String>;

    /// Whether a usable credential exists without raising.
    async fn is_valid(&self, user: &UserId) -> bool;
}

/// Fixed credential map for tests and development.
#[derive(Default)]
pub struct StaticCredentials {
    tokens: RwLock<HashMap<String, String>>,
}

impl StaticCredentials {
    /// Create an empty credential map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a credential for a user.
    pub fn insert(&self, user: &UserId, token: impl Into<String>) {
        self.tokens
            .write()
            .unwrap()
            .insert(user.as_str().to_string(), token.into());
    }

    /// Remove a user's credential.
    pub fn remove(&self, user: &UserId) {
        self.tokens.write().unwrap().remove(user.as_str());
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn access_credential(&self, user: &UserId) -> Result<String> {
        self.tokens
            .read()
            .unwrap()
            .get(user.as_str())
            .cloned()
            .ok_or_else(|| Error::NotAuthenticated(format!("no credential for {user}")))
    }

    async fn is_valid(&self, user: &UserId) -> bool {
        self.tokens.read().unwrap().contains_key(user.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_credentials_roundtrip() {
        let creds = StaticCredentials::new();
        let user = UserId::new("u1").unwrap();

        assert!(!creds.is_valid(&user).await);
        assert!(matches!(
            creds.access_credential(&user).await.unwrap_err(),
            Error::NotAuthenticated(_)
        ));

        creds.insert(&user, "token-abc");
        assert!(creds.is_valid(&user).await);
        assert_eq!(creds.access_credential(&user).await.unwrap(), "token-abc");

        creds.remove(&user);
        assert!(!creds.is_valid(&user).await);
    }
}

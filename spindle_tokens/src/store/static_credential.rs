use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use super::{RefreshCredentialStore, StoreError};
use crate::{RefreshToken, RefreshTokenRef};

/// A refresh token supplied by configuration, such as an environment variable
///
/// Configuration cannot be written back, so rotated tokens are kept in memory
/// for the life of the process only.
#[derive(Debug)]
pub struct StaticRefreshCredential {
    refresh_token: RwLock<Option<RefreshToken>>,
}

impl StaticRefreshCredential {
    /// Constructs a store holding `refresh_token`
    pub fn new(refresh_token: RefreshToken) -> Self {
        Self {
            refresh_token: RwLock::new(Some(refresh_token)),
        }
    }

    /// Constructs a store with no refresh token
    pub fn empty() -> Self {
        Self {
            refresh_token: RwLock::new(None),
        }
    }
}

impl From<Option<RefreshToken>> for StaticRefreshCredential {
    fn from(refresh_token: Option<RefreshToken>) -> Self {
        Self {
            refresh_token: RwLock::new(refresh_token),
        }
    }
}

#[async_trait]
impl RefreshCredentialStore for StaticRefreshCredential {
    async fn load(&self) -> Result<Option<RefreshToken>, StoreError> {
        Ok(self
            .refresh_token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    async fn rotate(&self, refresh_token: &RefreshTokenRef) -> Result<(), StoreError> {
        tracing::warn!(
            "refresh token rotated; the new token is held in memory only, update configuration to keep it across restarts"
        );
        *self
            .refresh_token
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(refresh_token.to_owned());
        Ok(())
    }

    async fn forget(&self) -> Result<(), StoreError> {
        *self
            .refresh_token
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}

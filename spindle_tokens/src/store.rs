//! Storage for refresh tokens and shared access credentials

use std::{error, sync::Arc};

use async_trait::async_trait;

use crate::{AccessCredential, RefreshToken, RefreshTokenRef};

#[cfg(feature = "file")]
mod file;
mod static_credential;

#[cfg(feature = "file")]
#[cfg_attr(docsrs, doc(cfg(feature = "file")))]
pub use file::FileSessionStore;
pub use static_credential::StaticRefreshCredential;

/// An error raised by a store or cache
pub type StoreError = Box<dyn error::Error + Send + Sync + 'static>;

/// The owner of the refresh token
///
/// The broker reads the refresh token before every exchange and reports back
/// whenever the authority rotates it. Failing to persist a rotated refresh token
/// eventually leaves the session looking revoked, so durable stores should treat
/// `rotate` as critical.
#[async_trait]
pub trait RefreshCredentialStore: Send + Sync {
    /// Loads the current refresh token, if there is one
    async fn load(&self) -> Result<Option<RefreshToken>, StoreError>;

    /// Replaces the refresh token with one newly issued by the authority
    async fn rotate(&self, refresh_token: &RefreshTokenRef) -> Result<(), StoreError>;

    /// Discards the refresh token
    ///
    /// Stores that cannot discard their credential do nothing.
    async fn forget(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
impl<T: RefreshCredentialStore + ?Sized> RefreshCredentialStore for Arc<T> {
    async fn load(&self) -> Result<Option<RefreshToken>, StoreError> {
        (**self).load().await
    }

    async fn rotate(&self, refresh_token: &RefreshTokenRef) -> Result<(), StoreError> {
        (**self).rotate(refresh_token).await
    }

    async fn forget(&self) -> Result<(), StoreError> {
        (**self).forget().await
    }
}

/// A cache for access credentials shared beyond a single broker
///
/// Short-lived processes can use a shared cache to pick up a credential that
/// another process already paid for.
#[async_trait]
pub trait AccessCredentialCache: Send + Sync {
    /// Loads the cached credential, if there is one
    async fn load_credential(&self) -> Result<Option<AccessCredential>, StoreError>;

    /// Persists a credential into the cache
    async fn persist_credential(&self, credential: &AccessCredential) -> Result<(), StoreError>;

    /// Removes any cached credential
    async fn clear_credential(&self) -> Result<(), StoreError>;
}

#[async_trait]
impl<T: AccessCredentialCache + ?Sized> AccessCredentialCache for Arc<T> {
    async fn load_credential(&self) -> Result<Option<AccessCredential>, StoreError> {
        (**self).load_credential().await
    }

    async fn persist_credential(&self, credential: &AccessCredential) -> Result<(), StoreError> {
        (**self).persist_credential(credential).await
    }

    async fn clear_credential(&self) -> Result<(), StoreError> {
        (**self).clear_credential().await
    }
}

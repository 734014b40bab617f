//! A session store backed by a local JSON file

use std::{
    io,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::{fs::OpenOptions, sync::Mutex};

use super::{AccessCredentialCache, RefreshCredentialStore, StoreError};
use crate::{AccessCredential, RefreshToken, RefreshTokenRef};

/// A refresh token and access credential kept in a local file
///
/// The file is a small JSON document that processes on the same filesystem can
/// share. Writes within a process are serialized. Each write goes to a staging
/// file beside the session, which is then renamed over it, so readers never
/// observe a partial document. The file is readable by its owner only.
#[derive(Debug)]
pub struct FileSessionStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Session {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    refresh_token: Option<RefreshToken>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    access: Option<AccessCredential>,
}

impl FileSessionStore {
    /// Constructs a new file session store
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    async fn read_session(&self) -> Result<Session, io::Error> {
        match tokio::fs::read(&self.path).await {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Session::default()),
            Err(err) => Err(err),
        }
    }

    fn staging_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "session".into());
        name.push(format!(".{}.tmp", std::process::id()));
        self.path.with_file_name(name)
    }

    async fn write_session(&self, session: &Session) -> Result<(), io::Error> {
        let staging = self.staging_path();
        let data = serde_json::to_vec_pretty(session)?;

        if let Err(err) = write_private(&staging, &data).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(err);
        }

        if let Err(err) = tokio::fs::rename(&staging, &self.path).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(err);
        }

        Ok(())
    }

    async fn update<F>(&self, change: F) -> Result<(), io::Error>
    where
        F: FnOnce(&mut Session) + Send,
    {
        let _guard = self.write_lock.lock().await;
        let mut session = self.read_session().await?;
        change(&mut session);
        self.write_session(&session).await
    }
}

async fn write_private(path: &Path, data: &[u8]) -> Result<(), io::Error> {
    use tokio::io::AsyncWriteExt;

    let mut file_opts = OpenOptions::new();

    file_opts.create(true).truncate(true).write(true);

    #[cfg(unix)]
    file_opts.mode(0o600);

    let mut file = file_opts.open(path).await?;

    // A leftover staging file keeps whatever mode it was created with
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))
            .await?;
    }

    file.write_all(data).await?;
    file.sync_all().await?;
    Ok(())
}

#[async_trait]
impl RefreshCredentialStore for FileSessionStore {
    async fn load(&self) -> Result<Option<RefreshToken>, StoreError> {
        Ok(self.read_session().await?.refresh_token)
    }

    async fn rotate(&self, refresh_token: &RefreshTokenRef) -> Result<(), StoreError> {
        let refresh_token = refresh_token.to_owned();
        self.update(move |session| session.refresh_token = Some(refresh_token))
            .await?;
        tracing::debug!(path = %self.path.display(), "persisted refresh token");
        Ok(())
    }

    async fn forget(&self) -> Result<(), StoreError> {
        self.update(|session| *session = Session::default()).await?;
        Ok(())
    }
}

#[async_trait]
impl AccessCredentialCache for FileSessionStore {
    async fn load_credential(&self) -> Result<Option<AccessCredential>, StoreError> {
        Ok(self.read_session().await?.access)
    }

    async fn persist_credential(&self, credential: &AccessCredential) -> Result<(), StoreError> {
        let credential = credential.clone();
        self.update(move |session| session.access = Some(credential))
            .await?;
        Ok(())
    }

    async fn clear_credential(&self) -> Result<(), StoreError> {
        self.update(|session| session.access = None).await?;
        Ok(())
    }
}

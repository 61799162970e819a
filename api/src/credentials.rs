use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use crate::forge_inbox::ForgeInboxError;

/// Credential capability: token storage is opaque to the core. The file
/// store below is the fallback for platforms without a system credential
/// store; a keychain-backed implementation plugs in behind the same trait.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get_token(&self) -> Result<SecretString, ForgeInboxError>;
    async fn set_token(&self, token: SecretString) -> Result<(), ForgeInboxError>;
    async fn clear_token(&self) -> Result<(), ForgeInboxError>;
}

#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(data_dir: &std::path::Path) -> FileCredentialStore {
        FileCredentialStore {
            path: data_dir.join("upstream_token"),
        }
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn get_token(&self) -> Result<SecretString, ForgeInboxError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => {
                let token = contents.trim();
                if token.is_empty() {
                    return Err(ForgeInboxError::NoTokenConfigured);
                }
                Ok(SecretString::new(token.to_string()))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(ForgeInboxError::NoTokenConfigured)
            }
            Err(err) => Err(ForgeInboxError::Unexpected(
                anyhow::Error::new(err).context("Failed to read the stored upstream token"),
            )),
        }
    }

    async fn set_token(&self, token: SecretString) -> Result<(), ForgeInboxError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create the credential directory")?;
        }
        tokio::fs::write(&self.path, token.expose_secret())
            .await
            .context("Failed to persist the upstream token")?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o600);
            tokio::fs::set_permissions(&self.path, permissions)
                .await
                .context("Failed to restrict token file permissions")?;
        }

        Ok(())
    }

    async fn clear_token(&self) -> Result<(), ForgeInboxError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(ForgeInboxError::Unexpected(
                anyhow::Error::new(err).context("Failed to remove the stored upstream token"),
            )),
        }
    }
}

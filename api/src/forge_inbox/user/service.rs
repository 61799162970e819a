use std::sync::Arc;

use secrecy::SecretString;

use forge_inbox::user::{User, UserSettings};

use crate::{
    credentials::CredentialStore,
    forge_inbox::ForgeInboxError,
    integrations::UpstreamClient,
    repository::{commit, user::UserRepository, Repository},
};

pub struct UserService {
    repository: Arc<Repository>,
    credentials: Arc<dyn CredentialStore>,
    upstream: Arc<dyn UpstreamClient>,
}

impl UserService {
    pub fn new(
        repository: Arc<Repository>,
        credentials: Arc<dyn CredentialStore>,
        upstream: Arc<dyn UpstreamClient>,
    ) -> UserService {
        UserService {
            repository,
            credentials,
            upstream,
        }
    }

    #[tracing::instrument(level = "debug", skip(self), err)]
    pub async fn get_user(&self) -> Result<User, ForgeInboxError> {
        let mut transaction = self.repository.begin().await?;
        let user = self.repository.get_or_create_user(&mut transaction).await?;
        commit(transaction).await?;
        Ok(user)
    }

    #[tracing::instrument(level = "debug", skip(self, settings), err)]
    pub async fn update_settings(
        &self,
        settings: UserSettings,
    ) -> Result<User, ForgeInboxError> {
        let mut transaction = self.repository.begin().await?;
        let user = self.repository.get_or_create_user(&mut transaction).await?;
        let user = self
            .repository
            .update_user_settings(&mut transaction, &settings, user.id)
            .await?;
        commit(transaction).await?;
        Ok(user)
    }

    /// Stores the upstream token after validating it against the provider,
    /// and records the authenticated login. Returns the username.
    #[tracing::instrument(level = "debug", skip_all, err)]
    pub async fn set_token(&self, token: SecretString) -> Result<String, ForgeInboxError> {
        self.credentials.set_token(token).await?;
        let login = match self.upstream.viewer().await {
            Ok(login) => login,
            Err(err) => {
                // An unusable token is not kept around.
                self.credentials.clear_token().await?;
                return Err(err);
            }
        };

        let mut transaction = self.repository.begin().await?;
        let user = self.repository.get_or_create_user(&mut transaction).await?;
        self.repository
            .update_user_login(&mut transaction, Some(&login), user.id)
            .await?;
        commit(transaction).await?;
        Ok(login)
    }

    #[tracing::instrument(level = "debug", skip(self), err)]
    pub async fn clear_token(&self) -> Result<(), ForgeInboxError> {
        self.credentials.clear_token().await?;
        let mut transaction = self.repository.begin().await?;
        let user = self.repository.get_or_create_user(&mut transaction).await?;
        self.repository
            .update_user_login(&mut transaction, None, user.id)
            .await?;
        commit(transaction).await
    }

    #[tracing::instrument(level = "debug", skip(self), err)]
    pub async fn token_status(&self) -> Result<Option<String>, ForgeInboxError> {
        match self.credentials.get_token().await {
            Ok(_) => Ok(Some(self.get_user().await?.upstream_login.unwrap_or_default())),
            Err(ForgeInboxError::NoTokenConfigured) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

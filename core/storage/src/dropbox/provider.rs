//! Dropbox storage provider implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use meldanya_common::{BackupFolder, Error, FolderName, Result};

use crate::credentials::{CodePrompt, CredentialStore};
use crate::oauth::{AuthConfig, AuthManager, OAuthEndpoints, TokenManager, Tokens};
use crate::provider::{StorageProvider, UploadedFile};

use super::client::{DropboxClient, Entry};

/// Dropbox OAuth2 endpoints. The code is shown to the user instead of being
/// redirected, so no redirect URL is registered.
pub const DROPBOX_ENDPOINTS: OAuthEndpoints = OAuthEndpoints {
    auth_url: "https://www.dropbox.com/oauth2/authorize",
    token_url: "https://api.dropboxapi.com/oauth2/token",
    scopes: &[],
    extra_params: &[("token_access_type", "offline")],
};

/// Dropbox provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DropboxConfig {
    /// App key from the Dropbox app console.
    pub app_key: String,
    /// App secret from the Dropbox app console.
    pub app_secret: String,
}

impl DropboxConfig {
    fn auth_config(&self) -> AuthConfig {
        AuthConfig {
            client_id: self.app_key.clone(),
            client_secret: self.app_secret.clone(),
            redirect_url: None,
        }
    }
}

/// Dropbox storage provider.
pub struct DropboxProvider {
    client: DropboxClient,
    token_manager: Arc<TokenManager>,
}

impl DropboxProvider {
    /// Authorize against Dropbox and create the provider.
    ///
    /// # Errors
    /// - Invalid app configuration
    /// - Authorization code exchange failed
    pub async fn connect(
        config: &DropboxConfig,
        store: CredentialStore,
        prompt: &dyn CodePrompt,
    ) -> Result<Self> {
        let auth_manager = AuthManager::new(DROPBOX_ENDPOINTS, config.auth_config())?;
        let tokens = store.obtain(&auth_manager, prompt).await?;
        let provider = Self::with_tokens(auth_manager, tokens, Some(store))?;
        info!("Authorized for Dropbox");
        Ok(provider)
    }

    /// Create the provider from already obtained tokens.
    pub fn with_tokens(
        auth_manager: AuthManager,
        tokens: Tokens,
        store: Option<CredentialStore>,
    ) -> Result<Self> {
        let token_manager = Arc::new(TokenManager::new(auth_manager, tokens, store));
        let client = DropboxClient::new(token_manager.clone())?;
        Ok(Self {
            client,
            token_manager,
        })
    }

    /// Get current tokens.
    pub async fn get_tokens(&self) -> Tokens {
        self.token_manager.get_tokens().await
    }
}

/// Dropbox path of a top-level backup folder.
fn folder_path(name: &str) -> String {
    format!("/{}", name)
}

/// Backup folders among the listed root entries.
///
/// Dropbox folders carry no creation time, so the time in the name is used.
fn backup_folders(entries: Vec<Entry>) -> Vec<BackupFolder> {
    let mut folders: Vec<BackupFolder> = entries
        .into_iter()
        .filter_map(|entry| match entry {
            Entry::Folder(folder) => BackupFolder::from_name(folder_path(&folder.name), &folder.name),
            _ => None,
        })
        .collect();
    folders.sort_by(|a, b| a.age_key().cmp(&b.age_key()));
    folders
}

#[async_trait]
impl StorageProvider for DropboxProvider {
    fn name(&self) -> &str {
        "dropbox"
    }

    async fn create_folder(&self, name: &FolderName) -> Result<BackupFolder> {
        let path = folder_path(&name.to_string());
        let folder = self.client.create_folder(&path).await?;
        Ok(BackupFolder::new(path, folder.name, name.created_at()))
    }

    async fn upload_file(&self, local: &Path, folder: &BackupFolder) -> Result<UploadedFile> {
        let file_name = local
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                Error::InvalidInput(format!("Path has no file name: {}", local.display()))
            })?;

        let remote = format!("{}/{}", folder.id, file_name);
        let file = self.client.upload(local, &remote).await?;

        Ok(UploadedFile {
            name: file.name,
            size: file.size,
        })
    }

    async fn list_folders(&self) -> Result<Vec<BackupFolder>> {
        let entries = self.client.list_folder("").await?;
        Ok(backup_folders(entries))
    }

    async fn delete_folder(&self, folder: &BackupFolder) -> Result<()> {
        self.client.delete(&folder.id).await
    }
}

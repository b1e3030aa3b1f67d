//! Google Drive storage provider implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use meldanya_common::{BackupFolder, Error, FolderName, Result};

use crate::credentials::{CodePrompt, CredentialStore};
use crate::oauth::{AuthConfig, AuthManager, OAuthEndpoints, TokenManager, Tokens};
use crate::provider::{StorageProvider, UploadedFile};

use super::client::{DriveClient, DriveFile};

/// Google's OAuth2 endpoints for Drive access.
pub const GOOGLE_ENDPOINTS: OAuthEndpoints = OAuthEndpoints {
    auth_url: "https://accounts.google.com/o/oauth2/v2/auth",
    token_url: "https://oauth2.googleapis.com/token",
    scopes: &["https://www.googleapis.com/auth/drive.file"],
    extra_params: &[("access_type", "offline"), ("prompt", "consent")],
};

/// Redirect target registered for installed applications.
pub const DEFAULT_REDIRECT_URL: &str = "http://localhost";

/// Folder under the Drive root holding every backup folder.
pub const ROOT_FOLDER_NAME: &str = "meldanya_backup";

/// Google Drive provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GDriveConfig {
    /// OAuth2 client ID.
    pub client_id: String,
    /// OAuth2 client secret.
    pub client_secret: String,
    /// Redirect URL registered for the client.
    #[serde(default)]
    pub redirect_url: Option<String>,
}

impl GDriveConfig {
    fn auth_config(&self) -> AuthConfig {
        AuthConfig {
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
            redirect_url: Some(
                self.redirect_url
                    .clone()
                    .unwrap_or_else(|| DEFAULT_REDIRECT_URL.to_string()),
            ),
        }
    }
}

/// Google Drive storage provider.
///
/// Backup folders live in a dedicated `meldanya_backup` folder at the top of
/// the user's Drive, so listing never sees unrelated files.
pub struct GDriveProvider {
    client: DriveClient,
    token_manager: Arc<TokenManager>,
    /// ID of the root backup folder once resolved.
    root_id: RwLock<Option<String>>,
}

impl GDriveProvider {
    /// Authorize against Google Drive and create the provider.
    ///
    /// Cached tokens are taken from `store`; without them the operator is
    /// asked for an authorization code through `prompt`.
    ///
    /// # Errors
    /// - Invalid client configuration
    /// - Authorization code exchange failed
    pub async fn connect(
        config: &GDriveConfig,
        store: CredentialStore,
        prompt: &dyn CodePrompt,
    ) -> Result<Self> {
        let auth_manager = AuthManager::new(GOOGLE_ENDPOINTS, config.auth_config())?;
        let tokens = store.obtain(&auth_manager, prompt).await?;
        let provider = Self::with_tokens(auth_manager, tokens, Some(store))?;
        info!("Authorized for Google Drive");
        Ok(provider)
    }

    /// Create the provider from already obtained tokens.
    pub fn with_tokens(
        auth_manager: AuthManager,
        tokens: Tokens,
        store: Option<CredentialStore>,
    ) -> Result<Self> {
        let token_manager = Arc::new(TokenManager::new(auth_manager, tokens, store));
        let client = DriveClient::new(token_manager.clone())?;

        Ok(Self {
            client,
            token_manager,
            root_id: RwLock::new(None),
        })
    }

    /// Get current tokens.
    pub async fn get_tokens(&self) -> Tokens {
        self.token_manager.get_tokens().await
    }

    /// Find the root backup folder, creating it when absent.
    async fn root_folder(&self) -> Result<String> {
        {
            let cached = self.root_id.read().await;
            if let Some(id) = cached.as_ref() {
                return Ok(id.clone());
            }
        }

        let mut cached = self.root_id.write().await;
        if let Some(id) = cached.as_ref() {
            return Ok(id.clone());
        }

        let id = match self.client.find_child(ROOT_FOLDER_NAME, "root").await? {
            Some(folder) if folder.is_folder() => folder.id,
            Some(_) => {
                return Err(Error::Storage(format!(
                    "{} exists in Drive but is not a folder",
                    ROOT_FOLDER_NAME
                )))
            }
            None => {
                debug!("Creating Drive root folder {}", ROOT_FOLDER_NAME);
                self.client
                    .create_folder(ROOT_FOLDER_NAME, "root")
                    .await?
                    .id
            }
        };

        *cached = Some(id.clone());
        Ok(id)
    }
}

/// Turn a Drive folder into a backup folder if its name is one of ours.
fn to_backup_folder(file: DriveFile) -> Option<BackupFolder> {
    if !file.is_folder() {
        return None;
    }
    let name = FolderName::parse(&file.name)?;
    let created_at = file.created_time.unwrap_or_else(|| name.created_at());
    Some(BackupFolder::new(file.id, file.name, created_at))
}

#[async_trait]
impl StorageProvider for GDriveProvider {
    fn name(&self) -> &str {
        "google"
    }

    async fn create_folder(&self, name: &FolderName) -> Result<BackupFolder> {
        let root_id = self.root_folder().await?;
        let name = name.to_string();

        if self.client.find_child(&name, &root_id).await?.is_some() {
            return Err(Error::AlreadyExists(format!(
                "Backup folder already exists: {}",
                name
            )));
        }

        let folder = self.client.create_folder(&name, &root_id).await?;
        let created_at = folder
            .created_time
            .unwrap_or_else(chrono::Utc::now);
        Ok(BackupFolder::new(folder.id, folder.name, created_at))
    }

    async fn upload_file(&self, local: &Path, folder: &BackupFolder) -> Result<UploadedFile> {
        let name = local
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                Error::InvalidInput(format!("Path has no file name: {}", local.display()))
            })?
            .to_string();

        let file = self.client.upload(local, &name, &folder.id).await?;
        let size = match file.size_bytes() {
            Some(size) => size,
            None => tokio::fs::metadata(local).await?.len(),
        };

        Ok(UploadedFile {
            size,
            name: file.name,
        })
    }

    async fn list_folders(&self) -> Result<Vec<BackupFolder>> {
        let root_id = self.root_folder().await?;
        let files = self.client.list_children(&root_id).await?;

        let mut folders: Vec<BackupFolder> = files.into_iter().filter_map(to_backup_folder).collect();
        folders.sort_by(|a, b| a.age_key().cmp(&b.age_key()));
        Ok(folders)
    }

    async fn delete_folder(&self, folder: &BackupFolder) -> Result<()> {
        self.client.delete(&folder.id).await
    }
}

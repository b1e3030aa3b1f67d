//! Local filesystem storage provider.
//!
//! Keeps backup folders under a root directory, for example a mounted NAS
//! share or an external drive.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

use meldanya_common::{BackupFolder, Error, FolderName, Result};

use crate::provider::{StorageProvider, UploadedFile};

/// Local provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    /// Directory holding the backup folders.
    pub root: PathBuf,
}

/// Local filesystem storage provider.
pub struct LocalProvider {
    root: PathBuf,
}

impl LocalProvider {
    /// Create a new local provider with the given root directory.
    ///
    /// # Postconditions
    /// - Root directory is created if it doesn't exist
    ///
    /// # Errors
    /// - Permission denied
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        // Create root if it doesn't exist (sync for constructor)
        if !root.exists() {
            std::fs::create_dir_all(&root)?;
        }

        Ok(Self { root })
    }

    /// Root directory of this provider.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Filesystem path of a backup folder.
    ///
    /// Only ids that are backup folder names are accepted, so nothing outside
    /// the root can be touched.
    fn folder_path(&self, folder: &BackupFolder) -> Result<PathBuf> {
        if FolderName::parse(&folder.id).is_none() {
            return Err(Error::InvalidInput(format!(
                "Not a backup folder: {}",
                folder.id
            )));
        }
        Ok(self.root.join(&folder.id))
    }
}

#[async_trait]
impl StorageProvider for LocalProvider {
    fn name(&self) -> &str {
        "local"
    }

    async fn create_folder(&self, name: &FolderName) -> Result<BackupFolder> {
        let name = name.to_string();
        let fs_path = self.root.join(&name);

        match fs::create_dir(&fs_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(Error::AlreadyExists(format!(
                    "Path already exists: {}",
                    fs_path.display()
                )));
            }
            Err(e) => return Err(e.into()),
        }

        BackupFolder::from_name(name.clone(), &name)
            .ok_or_else(|| Error::InvalidInput(format!("Not a backup folder name: {}", name)))
    }

    async fn upload_file(&self, local: &Path, folder: &BackupFolder) -> Result<UploadedFile> {
        let file_name = local
            .file_name()
            .ok_or_else(|| {
                Error::InvalidInput(format!("Path has no file name: {}", local.display()))
            })?;

        let folder_path = self.folder_path(folder)?;
        if !folder_path.is_dir() {
            return Err(Error::NotFound(format!(
                "Backup folder not found: {}",
                folder.name
            )));
        }

        let size = fs::copy(local, folder_path.join(file_name)).await?;

        Ok(UploadedFile {
            name: file_name.to_string_lossy().into_owned(),
            size,
        })
    }

    async fn list_folders(&self) -> Result<Vec<BackupFolder>> {
        let mut folders = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if let Some(folder) = BackupFolder::from_name(name.clone(), &name) {
                folders.push(folder);
            }
        }

        folders.sort_by(|a, b| a.age_key().cmp(&b.age_key()));
        Ok(folders)
    }

    async fn delete_folder(&self, folder: &BackupFolder) -> Result<()> {
        let fs_path = self.folder_path(folder)?;

        if !fs_path.exists() {
            return Err(Error::NotFound(format!(
                "Directory not found: {}",
                fs_path.display()
            )));
        }

        fs::remove_dir_all(&fs_path).await?;
        Ok(())
    }
}

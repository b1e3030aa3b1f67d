//! Storage provider trait definition and the shared backup policy built on it.

use async_trait::async_trait;
use std::path::Path;
use tracing::{error, info, warn};

use meldanya_common::types::MAX_COLLISION_SUFFIX;
use meldanya_common::{BackupFolder, Error, FolderName, Result};

use crate::retention;

/// A file stored by a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    /// Name of the stored file.
    pub name: String,
    /// Size in bytes as reported by the provider.
    pub size: u64,
}

/// Outcome of a retention pass on one provider.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Provider the pass ran on.
    pub provider: String,
    /// Backup folders found, or `None` when listing failed.
    pub listed: Option<usize>,
    /// Folders deleted.
    pub deleted: usize,
    /// Folders that should have been deleted but could not be.
    pub failed: usize,
}

/// Storage provider trait for different backends.
///
/// These are the primitives a backend has to supply. Every method reports
/// failure through `Result`; the log-and-continue policy lives in
/// [`BackupTarget`] and is the same for all backends.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Get the provider name (e.g., "dropbox", "google", "local").
    fn name(&self) -> &str;

    /// Create a dated backup folder.
    ///
    /// # Postconditions
    /// - Folder exists on the provider and is returned by `list_folders`
    ///
    /// # Errors
    /// - `Error::AlreadyExists` when a folder of that name is present
    /// - Network/I/O errors
    /// - Authentication errors
    async fn create_folder(&self, name: &FolderName) -> Result<BackupFolder>;

    /// Upload the local file at `local` into `folder`, keeping its file name.
    async fn upload_file(&self, local: &Path, folder: &BackupFolder) -> Result<UploadedFile>;

    /// List the backup folders created by this tool.
    ///
    /// # Returns
    /// Folders ordered by creation time, oldest first.
    async fn list_folders(&self) -> Result<Vec<BackupFolder>>;

    /// Delete a backup folder and everything in it.
    async fn delete_folder(&self, folder: &BackupFolder) -> Result<()>;
}

/// Backup operations shared by every provider.
///
/// Implemented for all [`StorageProvider`]s and not meant to be implemented
/// by hand: the folder naming, failure handling and retention policy are
/// the same regardless of the backend.
#[async_trait]
pub trait BackupTarget: StorageProvider {
    /// Create the folder for this run, named after the current minute.
    ///
    /// Returns `None` when no folder could be created. The failure is logged.
    async fn mkdir(&self) -> Option<BackupFolder> {
        self.mkdir_named(FolderName::now()).await
    }

    /// Create the folder for a run at the given minute.
    ///
    /// When the name is taken, `-1` through `-9` are tried in turn.
    async fn mkdir_named(&self, name: FolderName) -> Option<BackupFolder> {
        let candidates =
            std::iter::once(name).chain((1..=MAX_COLLISION_SUFFIX).map(|n| name.with_suffix(n)));

        for candidate in candidates {
            match self.create_folder(&candidate).await {
                Ok(folder) => {
                    info!(provider = self.name(), folder = %folder, "Created backup folder");
                    return Some(folder);
                }
                Err(Error::AlreadyExists(_)) => {
                    warn!(provider = self.name(), folder = %candidate, "Backup folder already exists");
                }
                Err(e) => {
                    error!(provider = self.name(), "Failed to create backup directory: {}", e);
                    return None;
                }
            }
        }

        error!(
            provider = self.name(),
            "Failed to create backup directory: every name for {} is taken", name
        );
        None
    }

    /// Upload one artifact, logging instead of failing.
    async fn upload(&self, artifact: &Path, folder: &BackupFolder) -> Option<UploadedFile> {
        match self.upload_file(artifact, folder).await {
            Ok(file) => {
                info!(provider = self.name(), "Uploaded {} ({} bytes)", file.name, file.size);
                Some(file)
            }
            Err(e) => {
                error!(
                    provider = self.name(),
                    path = %artifact.display(),
                    "Failed to upload file: {}", e
                );
                None
            }
        }
    }

    /// Delete all but the newest `keep` backup folders.
    async fn cleanup(&self, keep: usize) -> CleanupReport {
        let mut report = CleanupReport {
            provider: self.name().to_string(),
            ..CleanupReport::default()
        };

        let folders = match self.list_folders().await {
            Ok(folders) => folders,
            Err(e) => {
                error!(provider = self.name(), "Failed to list backups: {}", e);
                return report;
            }
        };
        report.listed = Some(folders.len());

        let expired = retention::select_expired(folders, keep);
        if expired.is_empty() {
            info!(provider = self.name(), "Nothing to clean");
            return report;
        }

        for folder in &expired {
            match self.delete_folder(folder).await {
                Ok(()) => report.deleted += 1,
                Err(e) => {
                    warn!(provider = self.name(), folder = %folder, "Failed to delete old backup: {}", e);
                    report.failed += 1;
                }
            }
        }

        info!(provider = self.name(), "Cleaned {} folders", report.deleted);
        report
    }
}

impl<P: StorageProvider + ?Sized> BackupTarget for P {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryProvider;
    use chrono::{Duration, Utc};
    use std::sync::Arc;

    fn seeded(names: &[&str]) -> MemoryProvider {
        let provider = MemoryProvider::new();
        for name in names {
            provider.insert_folder(name);
        }
        provider
    }

    #[tokio::test]
    async fn test_mkdir_uses_minute_name() {
        let provider = MemoryProvider::new();
        let name = FolderName::parse("2024-03-01T1000").unwrap();

        let folder = provider.mkdir_named(name).await.unwrap();
        assert_eq!(folder.name, "2024-03-01T1000");
        assert_eq!(provider.folder_names(), vec!["2024-03-01T1000"]);
    }

    #[tokio::test]
    async fn test_mkdir_collision_appends_suffix() {
        let provider = seeded(&["2024-03-01T1000", "2024-03-01T1000-1"]);
        let name = FolderName::parse("2024-03-01T1000").unwrap();

        let folder = provider.mkdir_named(name).await.unwrap();
        assert_eq!(folder.name, "2024-03-01T1000-2");
    }

    #[tokio::test]
    async fn test_mkdir_gives_up_after_last_suffix() {
        let provider = MemoryProvider::new();
        let name = FolderName::parse("2024-03-01T1000").unwrap();
        for _ in 0..=MAX_COLLISION_SUFFIX {
            assert!(provider.mkdir_named(name).await.is_some());
        }

        assert!(provider.mkdir_named(name).await.is_none());
    }

    #[tokio::test]
    async fn test_mkdir_failure_returns_none() {
        let provider = MemoryProvider::new();
        provider.fail_create_folder(true);

        assert!(provider.mkdir().await.is_none());
        assert!(provider.folder_names().is_empty());
    }

    #[tokio::test]
    async fn test_upload_failure_is_absorbed() {
        let temp = tempfile::TempDir::new().unwrap();
        let file = temp.path().join("notes.txt");
        std::fs::write(&file, b"hello").unwrap();

        let provider = MemoryProvider::new();
        let folder = provider.mkdir().await.unwrap();

        provider.fail_uploads(true);
        assert!(provider.upload(&file, &folder).await.is_none());

        provider.fail_uploads(false);
        let uploaded = provider.upload(&file, &folder).await.unwrap();
        assert_eq!(uploaded.name, "notes.txt");
        assert_eq!(uploaded.size, 5);
    }

    #[tokio::test]
    async fn test_upload_missing_file_is_absorbed() {
        let provider = MemoryProvider::new();
        let folder = provider.mkdir().await.unwrap();

        let missing = Path::new("/definitely/not/here.tgz");
        assert!(provider.upload(missing, &folder).await.is_none());
    }

    #[tokio::test]
    async fn test_cleanup_deletes_oldest() {
        let provider = seeded(&[
            "2024-01-03T0000",
            "2024-01-01T0000",
            "2024-01-05T0000",
            "2024-01-02T0000",
            "2024-01-04T0000",
        ]);

        let report = provider.cleanup(2).await;
        assert_eq!(report.listed, Some(5));
        assert_eq!(report.deleted, 3);
        assert_eq!(report.failed, 0);
        assert_eq!(
            provider.folder_names(),
            vec!["2024-01-04T0000", "2024-01-05T0000"]
        );
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let provider = seeded(&["2024-01-01T0000", "2024-01-02T0000", "2024-01-03T0000"]);

        assert_eq!(provider.cleanup(1).await.deleted, 2);
        let second = provider.cleanup(1).await;
        assert_eq!(second.deleted, 0);
        assert_eq!(second.listed, Some(1));
    }

    #[tokio::test]
    async fn test_cleanup_under_window_is_noop() {
        let provider = seeded(&["2024-01-01T0000", "2024-01-02T0000"]);

        let report = provider.cleanup(5).await;
        assert_eq!(report.deleted, 0);
        assert_eq!(provider.folder_names().len(), 2);
    }

    #[tokio::test]
    async fn test_cleanup_empty_provider() {
        let provider = MemoryProvider::new();
        let report = provider.cleanup(5).await;
        assert_eq!(report.listed, Some(0));
        assert_eq!(report.deleted, 0);
    }

    #[tokio::test]
    async fn test_cleanup_counts_failed_deletes() {
        let provider = seeded(&["2024-01-01T0000", "2024-01-02T0000", "2024-01-03T0000"]);
        provider.fail_deletes(true);

        let report = provider.cleanup(1).await;
        assert_eq!(report.deleted, 0);
        assert_eq!(report.failed, 2);
        assert_eq!(provider.folder_names().len(), 3);
    }

    #[tokio::test]
    async fn test_cleanup_list_failure() {
        let provider = seeded(&["2024-01-01T0000"]);
        provider.fail_listing(true);

        let report = provider.cleanup(0).await;
        assert_eq!(report.listed, None);
        assert_eq!(report.deleted, 0);
        assert_eq!(provider.folder_names().len(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_orders_by_creation_time() {
        // Same-looking names, creation time decides.
        let provider = MemoryProvider::new();
        let now = Utc::now();
        provider.insert_folder_at("b", now - Duration::days(3));
        provider.insert_folder_at("a", now - Duration::days(1));
        provider.insert_folder_at("c", now - Duration::days(2));

        provider.cleanup(1).await;
        assert_eq!(provider.folder_names(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_backup_target_through_trait_object() {
        let provider: Arc<dyn StorageProvider> = Arc::new(seeded(&["2024-01-01T0000"]));
        let report = provider.cleanup(0).await;
        assert_eq!(report.deleted, 1);
        assert_eq!(report.provider, "memory");
    }
}

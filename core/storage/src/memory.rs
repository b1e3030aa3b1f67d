//! In-memory storage provider for testing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use uuid::Uuid;

use meldanya_common::{BackupFolder, Error, FolderName, Result};

use crate::provider::{StorageProvider, UploadedFile};

/// A stored backup folder with its files.
#[derive(Debug, Clone)]
struct StoredFolder {
    folder: BackupFolder,
    files: HashMap<String, Vec<u8>>,
}

/// Switches that make the next calls fail.
#[derive(Debug, Default)]
struct Faults {
    create_folder: AtomicBool,
    uploads: AtomicBool,
    deletes: AtomicBool,
    listing: AtomicBool,
}

/// In-memory storage provider.
///
/// Useful for testing. All data is stored in memory and lost on drop.
/// Every primitive can be made to fail to exercise the error paths of
/// callers.
pub struct MemoryProvider {
    storage: Arc<RwLock<HashMap<String, StoredFolder>>>,
    faults: Faults,
}

impl MemoryProvider {
    /// Create a new empty memory provider.
    pub fn new() -> Self {
        Self {
            storage: Arc::new(RwLock::new(HashMap::new())),
            faults: Faults::default(),
        }
    }

    /// Add an existing backup folder.
    ///
    /// Creation time is taken from the name when it is a backup folder name,
    /// otherwise it is now.
    pub fn insert_folder(&self, name: &str) -> BackupFolder {
        let created_at = FolderName::parse(name)
            .map(|n| n.created_at())
            .unwrap_or_else(Utc::now);
        self.insert_folder_at(name, created_at)
    }

    /// Add an existing backup folder created at `created_at`.
    pub fn insert_folder_at(&self, name: &str, created_at: DateTime<Utc>) -> BackupFolder {
        let folder = BackupFolder::new(Uuid::new_v4().to_string(), name, created_at);
        self.write().insert(
            name.to_string(),
            StoredFolder {
                folder: folder.clone(),
                files: HashMap::new(),
            },
        );
        folder
    }

    /// Names of all stored folders, oldest first.
    pub fn folder_names(&self) -> Vec<String> {
        let storage = self.read();
        let mut folders: Vec<&BackupFolder> = storage.values().map(|s| &s.folder).collect();
        folders.sort_by(|a, b| a.age_key().cmp(&b.age_key()));
        folders.into_iter().map(|f| f.name.clone()).collect()
    }

    /// Names of the files in folder `name`, sorted.
    pub fn file_names(&self, name: &str) -> Vec<String> {
        let mut files: Vec<String> = self
            .read()
            .get(name)
            .map(|s| s.files.keys().cloned().collect())
            .unwrap_or_default();
        files.sort();
        files
    }

    /// Content of file `file` in folder `folder`.
    pub fn file_content(&self, folder: &str, file: &str) -> Option<Vec<u8>> {
        self.read()
            .get(folder)
            .and_then(|s| s.files.get(file).cloned())
    }

    /// Total number of stored files across all folders.
    pub fn file_count(&self) -> usize {
        self.read().values().map(|s| s.files.len()).sum()
    }

    /// Make folder creation fail.
    pub fn fail_create_folder(&self, fail: bool) {
        self.faults.create_folder.store(fail, Ordering::SeqCst);
    }

    /// Make uploads fail.
    pub fn fail_uploads(&self, fail: bool) {
        self.faults.uploads.store(fail, Ordering::SeqCst);
    }

    /// Make folder deletion fail.
    pub fn fail_deletes(&self, fail: bool) {
        self.faults.deletes.store(fail, Ordering::SeqCst);
    }

    /// Make listing fail.
    pub fn fail_listing(&self, fail: bool) {
        self.faults.listing.store(fail, Ordering::SeqCst);
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, StoredFolder>> {
        self.storage.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, StoredFolder>> {
        self.storage.write().unwrap_or_else(|e| e.into_inner())
    }

    fn injected(flag: &AtomicBool, what: &str) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            Err(Error::Storage(format!("Injected {} failure", what)))
        } else {
            Ok(())
        }
    }
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageProvider for MemoryProvider {
    fn name(&self) -> &str {
        "memory"
    }

    async fn create_folder(&self, name: &FolderName) -> Result<BackupFolder> {
        Self::injected(&self.faults.create_folder, "create folder")?;

        let name = name.to_string();
        let mut storage = self.write();

        if storage.contains_key(&name) {
            return Err(Error::AlreadyExists(format!(
                "Folder already exists: {}",
                name
            )));
        }

        let folder = BackupFolder::new(Uuid::new_v4().to_string(), name.clone(), Utc::now());
        storage.insert(
            name,
            StoredFolder {
                folder: folder.clone(),
                files: HashMap::new(),
            },
        );

        Ok(folder)
    }

    async fn upload_file(&self, local: &Path, folder: &BackupFolder) -> Result<UploadedFile> {
        Self::injected(&self.faults.uploads, "upload")?;

        let file_name = local
            .file_name()
            .ok_or_else(|| {
                Error::InvalidInput(format!("Path has no file name: {}", local.display()))
            })?
            .to_string_lossy()
            .into_owned();

        let data = tokio::fs::read(local).await?;
        let size = data.len() as u64;

        let mut storage = self.write();
        let stored = storage
            .get_mut(&folder.name)
            .filter(|s| s.folder.id == folder.id)
            .ok_or_else(|| Error::NotFound(format!("Folder not found: {}", folder.name)))?;
        stored.files.insert(file_name.clone(), data);

        Ok(UploadedFile {
            name: file_name,
            size,
        })
    }

    async fn list_folders(&self) -> Result<Vec<BackupFolder>> {
        Self::injected(&self.faults.listing, "listing")?;

        let mut folders: Vec<BackupFolder> =
            self.read().values().map(|s| s.folder.clone()).collect();
        folders.sort_by(|a, b| a.age_key().cmp(&b.age_key()));
        Ok(folders)
    }

    async fn delete_folder(&self, folder: &BackupFolder) -> Result<()> {
        Self::injected(&self.faults.deletes, "delete")?;

        let mut storage = self.write();
        match storage.get(&folder.name) {
            Some(stored) if stored.folder.id == folder.id => {
                storage.remove(&folder.name);
                Ok(())
            }
            _ => Err(Error::NotFound(format!("Folder not found: {}", folder.name))),
        }
    }
}

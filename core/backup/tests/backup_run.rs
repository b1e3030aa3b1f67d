//! End-to-end backup runs against the in-memory and local backends.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

use meldanya_backup::{Backup, Compressor, Encryptor, Pipeline, TarCompressor};
use meldanya_common::{Error, Result};
use meldanya_storage::{LocalProvider, MemoryProvider, StorageProvider};

/// Copies the source, failing for items whose name contains `broken`.
#[derive(Default)]
struct FakeTar {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Compressor for FakeTar {
    async fn compress(&self, src: &Path, dest: &Path) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if src.to_string_lossy().contains("broken") {
            return Err(Error::Process("tar exited with exit status: 2".to_string()));
        }
        let mut data = b"TGZ:".to_vec();
        data.extend(tokio::fs::read(src).await?);
        tokio::fs::write(dest, data).await?;
        Ok(())
    }
}

/// Prefixes the content so encrypted uploads are recognizable.
struct FakeCipher;

#[async_trait]
impl Encryptor for FakeCipher {
    async fn encrypt(&self, src: &Path, dest: &Path) -> Result<()> {
        let mut data = b"ENC:".to_vec();
        data.extend(tokio::fs::read(src).await?);
        tokio::fs::write(dest, data).await?;
        Ok(())
    }
}

fn encrypting_backup() -> Backup {
    Backup::new(Pipeline::new(Box::new(FakeTar::default())).with_encryptor(Box::new(FakeCipher)))
}

/// Files with `.tgz` or `.enc` in their name below `dir`.
fn leftover_intermediates(dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| {
            let name = p.to_string_lossy();
            name.ends_with(".tgz") || name.ends_with(".enc")
        })
        .collect()
}

fn seeded_memory() -> Arc<MemoryProvider> {
    let memory = Arc::new(MemoryProvider::new());
    memory.insert_folder("2024-01-01T0300");
    memory.insert_folder("2024-01-02T0300");
    memory.insert_folder("2024-01-03T0300");
    memory
}

#[tokio::test]
async fn test_run_then_cleanup_keeps_newest() {
    let data = TempDir::new().unwrap();
    let report_file = data.path().join("report.txt");
    std::fs::write(&report_file, b"numbers").unwrap();

    let memory = seeded_memory();
    let mut backup = encrypting_backup();

    let report = backup.run(&[report_file.clone()], memory.clone()).await;
    assert_eq!(report.uploaded, 1);
    let folder = report.folder.clone().unwrap();
    assert_eq!(memory.file_names(&folder), vec!["report.txt.tgz.enc"]);
    assert_eq!(
        memory.file_content(&folder, "report.txt.tgz.enc").unwrap(),
        b"ENC:TGZ:numbers"
    );

    let cleanups = backup.cleanup_all(3).await;
    assert_eq!(cleanups.len(), 1);
    assert_eq!(cleanups[0].listed, Some(4));
    assert_eq!(cleanups[0].deleted, 1);

    let names = memory.folder_names();
    assert_eq!(names.len(), 3);
    assert!(!names.contains(&"2024-01-01T0300".to_string()));
    assert!(names.contains(&folder));

    assert!(report_file.exists());
    assert!(leftover_intermediates(data.path()).is_empty());
}

#[tokio::test]
async fn test_retention_window_counts_new_folder() {
    let data = TempDir::new().unwrap();
    let item = data.path().join("report.txt");
    std::fs::write(&item, b"numbers").unwrap();

    let memory = seeded_memory();
    let mut backup = encrypting_backup();
    let report = backup.run(&[item], memory.clone()).await;
    backup.cleanup_all(2).await;

    assert_eq!(
        memory.folder_names(),
        vec!["2024-01-03T0300".to_string(), report.folder.unwrap()]
    );
}

#[tokio::test]
async fn test_archive_failure_does_not_stop_the_run() {
    let data = TempDir::new().unwrap();
    let broken = data.path().join("broken-dir");
    let fine = data.path().join("fine.txt");
    std::fs::create_dir(&broken).unwrap();
    std::fs::write(&fine, b"ok").unwrap();

    let tar = FakeTar::default();
    let calls = tar.calls.clone();
    let mut backup = Backup::new(Pipeline::new(Box::new(tar)));
    let memory = Arc::new(MemoryProvider::new());

    let report = backup.run(&[broken.clone(), fine.clone()], memory.clone()).await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    // The missing archive cannot be uploaded, the next item still is.
    assert_eq!(report.failed, 1);
    assert_eq!(report.uploaded, 1);
    assert_eq!(memory.file_names(&report.folder.unwrap()), vec!["fine.txt.tgz"]);
    assert!(broken.is_dir());
    assert!(leftover_intermediates(data.path()).is_empty());
}

#[tokio::test]
async fn test_missing_folder_skips_uploads_and_cleans_up() {
    let data = TempDir::new().unwrap();
    let first = data.path().join("a.txt");
    let second = data.path().join("b.txt");
    std::fs::write(&first, b"a").unwrap();
    std::fs::write(&second, b"b").unwrap();

    let memory = Arc::new(MemoryProvider::new());
    memory.fail_create_folder(true);
    let mut backup = encrypting_backup();

    let report = backup.run(&[first.clone(), second.clone()], memory.clone()).await;

    assert!(report.folder.is_none());
    assert_eq!(report.uploaded, 0);
    assert_eq!(report.skipped, 2);
    assert_eq!(memory.file_count(), 0);
    assert!(first.exists() && second.exists());
    assert!(leftover_intermediates(data.path()).is_empty());

    // The provider still counts as used.
    assert_eq!(backup.providers().len(), 1);
}

#[tokio::test]
async fn test_multiple_providers_in_order() {
    let data = TempDir::new().unwrap();
    let item = data.path().join("notes.txt");
    std::fs::write(&item, b"n").unwrap();

    let dropbox_like = Arc::new(MemoryProvider::new());
    let drive_like = seeded_memory();
    let mut backup = encrypting_backup();

    backup.run(&[item.clone()], dropbox_like.clone()).await;
    backup.run(&[item.clone(), item.clone()], drive_like.clone()).await;

    let reports = backup.cleanup_all(1).await;
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].deleted, 0);
    assert_eq!(reports[1].deleted, 3);
    assert_eq!(dropbox_like.folder_names().len(), 1);
    assert_eq!(drive_like.folder_names().len(), 1);
}

#[tokio::test]
async fn test_local_backend_end_to_end() {
    let data = TempDir::new().unwrap();
    let target = TempDir::new().unwrap();
    let item = data.path().join("ledger.csv");
    std::fs::write(&item, b"1,2,3").unwrap();

    for name in ["2023-11-01T0000", "2023-12-01T0000"] {
        std::fs::create_dir(target.path().join(name)).unwrap();
    }

    let local: Arc<dyn StorageProvider> = Arc::new(LocalProvider::new(target.path()).unwrap());
    let mut backup = encrypting_backup();
    let report = backup.run(&[item.clone()], local).await;
    let cleanups = backup.cleanup_all(2).await;

    let folder = report.folder.unwrap();
    let stored = target.path().join(&folder).join("ledger.csv.tgz.enc");
    assert_eq!(std::fs::read(stored).unwrap(), b"ENC:TGZ:1,2,3");
    assert_eq!(cleanups[0].deleted, 1);
    assert!(!target.path().join("2023-11-01T0000").exists());
    assert!(target.path().join("2023-12-01T0000").exists());
    assert!(leftover_intermediates(data.path()).is_empty());
}

#[tokio::test]
async fn test_real_tar_upload() {
    let tar_available = std::process::Command::new("tar")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false);
    if !tar_available {
        eprintln!("tar not installed, skipping");
        return;
    }

    let data = TempDir::new().unwrap();
    let dir = data.path().join("photos");
    std::fs::create_dir(&dir).unwrap();
    std::fs::write(dir.join("cat.jpg"), b"meow").unwrap();

    let memory = Arc::new(MemoryProvider::new());
    let mut backup = Backup::new(Pipeline::new(Box::new(TarCompressor::new())));
    let report = backup.run(&[dir.clone()], memory.clone()).await;

    assert_eq!(report.uploaded, 1);
    let archive = memory
        .file_content(&report.folder.unwrap(), "photos.tgz")
        .unwrap();
    // gzip magic
    assert_eq!(&archive[..2], &[0x1f, 0x8b]);
    assert!(dir.join("cat.jpg").exists());
    assert!(leftover_intermediates(data.path()).is_empty());
}

//! Backup orchestration across providers.

use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use meldanya_storage::{BackupTarget, CleanupReport, StorageProvider};

use crate::pipeline::{remove_prepared, Pipeline};

/// Outcome of backing up an item list to one provider.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    /// Provider the items went to.
    pub provider: String,
    /// Backup folder of this run, `None` when it could not be created.
    pub folder: Option<String>,
    /// Items uploaded.
    pub uploaded: usize,
    /// Items whose upload failed.
    pub failed: usize,
    /// Items not uploaded because there was no backup folder.
    pub skipped: usize,
}

/// Drives the per-item pipeline and tracks the providers used in a run.
pub struct Backup {
    pipeline: Pipeline,
    providers: Vec<Arc<dyn StorageProvider>>,
}

impl Backup {
    /// Create an orchestrator using `pipeline` for every item.
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline,
            providers: Vec::new(),
        }
    }

    /// Providers used so far, in first-use order.
    pub fn providers(&self) -> &[Arc<dyn StorageProvider>] {
        &self.providers
    }

    fn track(&mut self, provider: &Arc<dyn StorageProvider>) {
        let id = Arc::as_ptr(provider) as *const ();
        if !self
            .providers
            .iter()
            .any(|p| Arc::as_ptr(p) as *const () == id)
        {
            self.providers.push(provider.clone());
        }
    }

    /// Back up `items` to `provider`, one after the other.
    ///
    /// One backup folder is created per call. Each item is compressed and
    /// encrypted as configured, uploaded, and its intermediate files are
    /// removed whether or not the upload worked. Without a folder nothing is
    /// uploaded but the items still go through the pipeline and their
    /// intermediates are removed.
    pub async fn run(&mut self, items: &[PathBuf], provider: Arc<dyn StorageProvider>) -> RunReport {
        self.track(&provider);
        info!(provider = provider.name(), "Backing up {} items", items.len());

        let folder = provider.mkdir().await;
        let mut report = RunReport {
            provider: provider.name().to_string(),
            folder: folder.as_ref().map(|f| f.name.clone()),
            ..RunReport::default()
        };

        for item in items {
            let prepared = self.pipeline.prepare(item).await;

            match &folder {
                Some(folder) => match provider.upload(&prepared.upload.path, folder).await {
                    Some(_) => report.uploaded += 1,
                    None => report.failed += 1,
                },
                None => {
                    warn!(
                        provider = provider.name(),
                        path = %item.display(),
                        "No backup folder, skipping upload"
                    );
                    report.skipped += 1;
                }
            }

            remove_prepared(&prepared).await;
        }

        info!(
            provider = provider.name(),
            uploaded = report.uploaded,
            failed = report.failed,
            skipped = report.skipped,
            "Finished backup run"
        );
        report
    }

    /// Apply the retention window to every provider used.
    pub async fn cleanup_all(&self, keep: usize) -> Vec<CleanupReport> {
        let mut reports = Vec::with_capacity(self.providers.len());
        for provider in &self.providers {
            reports.push(provider.cleanup(keep).await);
        }
        reports
    }
}

//! Per-item pipeline stages: compress if needed, encrypt if configured.
//!
//! The actual work is done by external tools (`tar`, `openssl`). Stage
//! failures never abort the item: a failed archive still hands its expected
//! path on, and a failed encryption falls back to the unencrypted artifact.

use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, error, warn};

use meldanya_common::{Error, Result};

use crate::config::BackupConfig;

/// Extension appended to archives.
pub const ARCHIVE_EXTENSION: &str = "tgz";
/// Extension appended to encrypted files.
pub const ENCRYPTED_EXTENSION: &str = "enc";

/// Whether the item looks compressed already, judged by its name.
///
/// Any `.gz` or `.tgz` in the path counts, wherever it appears.
pub fn is_likely_compressed(path: &Path) -> bool {
    let name = path.to_string_lossy();
    name.contains(".gz") || name.contains(".tgz")
}

/// `path` with `.ext` appended to its file name, next to it.
///
/// `docs/` becomes `docs.tgz`, not `docs/.tgz`.
fn with_added_extension(path: &Path, ext: &str) -> PathBuf {
    match path.file_name() {
        Some(file_name) => {
            let mut name = file_name.to_os_string();
            name.push(".");
            name.push(ext);
            path.with_file_name(name)
        }
        None => {
            let mut name = OsString::from(path.as_os_str());
            name.push(".");
            name.push(ext);
            PathBuf::from(name)
        }
    }
}

/// A local file flowing through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// Location on disk.
    pub path: PathBuf,
    /// Created by the pipeline and removed after upload.
    pub owned: bool,
}

impl Artifact {
    /// The configured item itself. Never removed.
    pub fn original(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            owned: false,
        }
    }

    /// A file produced by a pipeline stage.
    pub fn intermediate(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            owned: true,
        }
    }
}

/// What the pipeline produced for one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prepared {
    /// Artifact to upload.
    pub upload: Artifact,
    /// Every artifact of the item, upload artifact last.
    pub artifacts: Vec<Artifact>,
    /// The upload artifact is encrypted.
    pub encrypted: bool,
}

impl Prepared {
    /// Artifacts created by the pipeline, to be removed after upload.
    pub fn owned(&self) -> impl Iterator<Item = &Artifact> {
        self.artifacts.iter().filter(|a| a.owned)
    }
}

/// Builds a compressed archive of a file or directory.
#[async_trait]
pub trait Compressor: Send + Sync {
    /// Archive `src` into `dest`.
    async fn compress(&self, src: &Path, dest: &Path) -> Result<()>;
}

/// Encrypts a file.
#[async_trait]
pub trait Encryptor: Send + Sync {
    /// Encrypt `src` into `dest`.
    async fn encrypt(&self, src: &Path, dest: &Path) -> Result<()>;
}

/// Run an external tool to completion.
async fn run_tool(command: &mut Command, tool: &str) -> Result<()> {
    debug!("Running {:?}", command);
    let status = command
        .status()
        .await
        .map_err(|e| Error::Process(format!("Failed to run {}: {}", tool, e)))?;

    if status.success() {
        Ok(())
    } else {
        Err(Error::Process(format!("{} exited with {}", tool, status)))
    }
}

/// Gzipped tarballs through the `tar` tool.
#[derive(Debug, Clone)]
pub struct TarCompressor {
    program: PathBuf,
}

impl TarCompressor {
    /// Use `tar` from `PATH`.
    pub fn new() -> Self {
        Self::with_program("tar")
    }

    /// Use a specific `tar` binary.
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for TarCompressor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Compressor for TarCompressor {
    async fn compress(&self, src: &Path, dest: &Path) -> Result<()> {
        let mut command = Command::new(&self.program);
        command.arg("czf").arg(dest);

        // Archive entries are relative to the item's parent directory.
        match (src.parent(), src.file_name()) {
            (Some(parent), Some(name)) if !parent.as_os_str().is_empty() => {
                command.arg("-C").arg(parent).arg(name);
            }
            _ => {
                command.arg(src);
            }
        }

        run_tool(&mut command, "tar").await
    }
}

/// AES-256-CBC through the `openssl` tool, passphrase read from a file.
#[derive(Debug, Clone)]
pub struct OpensslEncryptor {
    program: PathBuf,
    passfile: PathBuf,
}

impl OpensslEncryptor {
    /// Use `openssl` from `PATH` with the passphrase in `passfile`.
    pub fn new(passfile: impl Into<PathBuf>) -> Self {
        Self::with_program("openssl", passfile)
    }

    /// Use a specific `openssl` binary.
    pub fn with_program(program: impl Into<PathBuf>, passfile: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            passfile: passfile.into(),
        }
    }

    /// Passphrase file.
    pub fn passfile(&self) -> &Path {
        &self.passfile
    }
}

#[async_trait]
impl Encryptor for OpensslEncryptor {
    async fn encrypt(&self, src: &Path, dest: &Path) -> Result<()> {
        let mut pass = OsString::from("file:");
        pass.push(&self.passfile);

        let mut command = Command::new(&self.program);
        command
            .args(["aes-256-cbc", "-salt", "-pbkdf2", "-pass"])
            .arg(pass)
            .arg("-in")
            .arg(src)
            .arg("-out")
            .arg(dest);

        run_tool(&mut command, "openssl").await
    }
}

/// The compress and encrypt stages.
pub struct Pipeline {
    compressor: Box<dyn Compressor>,
    encryptor: Option<Box<dyn Encryptor>>,
    staging_dir: Option<PathBuf>,
    /// Set once the staging directory was created, or failed to be.
    staging_ready: OnceCell<bool>,
}

impl Pipeline {
    /// Pipeline compressing with `compressor` and not encrypting.
    pub fn new(compressor: Box<dyn Compressor>) -> Self {
        Self {
            compressor,
            encryptor: None,
            staging_dir: None,
            staging_ready: OnceCell::new(),
        }
    }

    /// Encrypt every artifact with `encryptor`.
    pub fn with_encryptor(mut self, encryptor: Box<dyn Encryptor>) -> Self {
        self.encryptor = Some(encryptor);
        self
    }

    /// Write archives and encrypted files into `dir` instead of next to the item.
    pub fn with_staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_dir = Some(dir.into());
        self
    }

    /// Pipeline using the external tools, encrypting when a passphrase file
    /// is configured.
    pub fn from_config(config: &BackupConfig) -> Self {
        let mut pipeline = Self::new(Box::new(TarCompressor::new()));
        if let Some(passfile) = &config.encrypt_pass {
            pipeline = pipeline.with_encryptor(Box::new(OpensslEncryptor::new(passfile)));
        }
        if let Some(dir) = &config.staging_dir {
            pipeline = pipeline.with_staging_dir(dir);
        }
        pipeline
    }

    /// Create the staging directory on first use.
    async fn ensure_staging_dir(&self) {
        let Some(dir) = &self.staging_dir else {
            return;
        };
        self.staging_ready
            .get_or_init(|| async {
                match tokio::fs::create_dir_all(dir).await {
                    Ok(()) => true,
                    Err(e) => {
                        error!(
                            path = %dir.display(),
                            "Failed to create staging directory: {}", e
                        );
                        false
                    }
                }
            })
            .await;
    }

    /// Whether artifacts get encrypted.
    pub fn encrypts(&self) -> bool {
        self.encryptor.is_some()
    }

    /// Where the archive of `item` is written.
    pub fn archive_path(&self, item: &Path) -> PathBuf {
        let archive = with_added_extension(item, ARCHIVE_EXTENSION);
        match (&self.staging_dir, archive.file_name()) {
            (Some(dir), Some(name)) => dir.join(name),
            _ => archive,
        }
    }

    /// Compression stage.
    ///
    /// Items that look compressed pass through untouched. Otherwise the
    /// archive path is returned even when archiving failed; the failure is
    /// logged.
    pub async fn compress(&self, item: &Path) -> Artifact {
        if is_likely_compressed(item) {
            debug!(path = %item.display(), "Already compressed");
            return Artifact::original(item);
        }

        self.ensure_staging_dir().await;
        let archive = self.archive_path(item);
        match self.compressor.compress(item, &archive).await {
            Ok(()) => debug!(path = %archive.display(), "Created archive"),
            Err(e) => error!(path = %item.display(), "Failed to tar: {}", e),
        }
        Artifact::intermediate(archive)
    }

    /// Encryption stage.
    ///
    /// Returns the encrypted artifact, or `None` when encryption is not
    /// configured or failed. On failure any partial output is removed and
    /// the caller uploads the unencrypted input.
    pub async fn encrypt(&self, input: &Artifact) -> Option<Artifact> {
        let encryptor = self.encryptor.as_ref()?;
        self.ensure_staging_dir().await;

        let output = match (&self.staging_dir, input.owned) {
            // Intermediates already live in the staging directory.
            (Some(dir), false) => {
                let encrypted = with_added_extension(&input.path, ENCRYPTED_EXTENSION);
                match encrypted.file_name() {
                    Some(name) => dir.join(name),
                    None => encrypted,
                }
            }
            _ => with_added_extension(&input.path, ENCRYPTED_EXTENSION),
        };

        match encryptor.encrypt(&input.path, &output).await {
            Ok(()) => Some(Artifact::intermediate(output)),
            Err(e) => {
                error!(
                    path = %input.path.display(),
                    unencrypted = true,
                    "Failed to encrypt, uploading UNENCRYPTED: {}", e
                );
                remove_artifact(&Artifact::intermediate(output)).await;
                None
            }
        }
    }

    /// Run both stages for one item.
    pub async fn prepare(&self, item: &Path) -> Prepared {
        let compressed = self.compress(item).await;

        match self.encrypt(&compressed).await {
            Some(encrypted) => Prepared {
                upload: encrypted.clone(),
                artifacts: vec![compressed, encrypted],
                encrypted: true,
            },
            None => Prepared {
                upload: compressed.clone(),
                artifacts: vec![compressed],
                encrypted: false,
            },
        }
    }
}

/// Remove an artifact the pipeline created. The configured item itself is
/// left alone.
///
/// Failures are logged; local cleanup is best-effort.
pub async fn remove_artifact(artifact: &Artifact) -> bool {
    if !artifact.owned {
        return false;
    }

    match tokio::fs::remove_file(&artifact.path).await {
        Ok(()) => {
            debug!(path = %artifact.path.display(), "Removed artifact");
            true
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %artifact.path.display(), "Artifact was never written");
            false
        }
        Err(e) => {
            warn!(
                path = %artifact.path.display(),
                "Failed to remove {} after backup: {}", artifact.path.display(), e
            );
            false
        }
    }
}

/// Remove every artifact the pipeline created for an item.
pub async fn remove_prepared(prepared: &Prepared) {
    for artifact in prepared.owned() {
        remove_artifact(artifact).await;
    }
}

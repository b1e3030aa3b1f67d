//! Storage provider abstraction for meldanya backups.
//!
//! This crate provides a trait-based interface for the storage backends a
//! backup run writes to (Dropbox, Google Drive, a local directory) together
//! with the policy every backend shares: dated backup folders, log-and-continue
//! uploads, and retention cleanup.
//!
//! # Design Principles
//! - Provider isolation: backends only supply primitives, the policy lives in
//!   [`BackupTarget`]
//! - Async operations: All I/O operations are async
//! - Unified error semantics: Consistent error types across providers
//! - Credentials are cached per provider and re-obtained interactively

pub mod credentials;
pub mod dropbox;
pub mod gdrive;
pub mod local;
pub mod memory;
pub mod oauth;
pub mod provider;
pub mod retention;

pub use credentials::{CodePrompt, CredentialStore, TerminalPrompt};
pub use dropbox::{DropboxConfig, DropboxProvider};
pub use gdrive::{GDriveConfig, GDriveProvider};
pub use local::{LocalConfig, LocalProvider};
pub use memory::MemoryProvider;
pub use provider::{BackupTarget, CleanupReport, StorageProvider, UploadedFile};
pub use retention::DEFAULT_KEEP_COUNT;

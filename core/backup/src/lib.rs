//! Backup runs for meldanya.
//!
//! Each configured item is compressed (unless it already looks compressed),
//! optionally encrypted, and uploaded into a dated folder on every provider
//! it is configured for. After all providers ran, each one used is pruned to
//! its newest backups.

pub mod config;
pub mod orchestrator;
pub mod pipeline;
pub mod providers;

pub use config::{expand_home, resolve_path, BackupConfig};
pub use orchestrator::{Backup, RunReport};
pub use pipeline::{
    is_likely_compressed, Artifact, Compressor, Encryptor, OpensslEncryptor, Pipeline,
    TarCompressor,
};
pub use providers::{connect_all, ConfiguredProvider, ProviderContext};

//! Common utilities and types shared across the meldanya backup crates.
//!
//! This module provides the error type every crate reports through and the
//! handle types that describe dated backup folders on a remote provider.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{BackupFolder, FolderName};

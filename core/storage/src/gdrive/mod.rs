//! Google Drive storage provider.
//!
//! This module provides a storage backend using Google Drive with:
//! - OAuth2 authentication with automatic token refresh
//! - A dedicated root folder holding all dated backup folders
//! - Multipart uploads for small files, resumable uploads for large ones

pub mod client;
pub mod provider;

pub use client::DriveClient;
pub use provider::{GDriveConfig, GDriveProvider, GOOGLE_ENDPOINTS};

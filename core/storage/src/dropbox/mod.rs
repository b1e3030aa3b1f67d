//! Dropbox storage provider.
//!
//! Talks to the Dropbox v2 HTTP API with OAuth2 tokens obtained through the
//! no-redirect code flow. Backup folders are created at the top of the app
//! folder (or the user's Dropbox for full-access apps).

pub mod client;
pub mod provider;

pub use client::DropboxClient;
pub use provider::{DropboxConfig, DropboxProvider, DROPBOX_ENDPOINTS};

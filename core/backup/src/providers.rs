//! Provider construction from configuration.

use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use meldanya_common::Result;
use meldanya_storage::{
    CodePrompt, CredentialStore, DropboxProvider, GDriveProvider, LocalProvider, StorageProvider,
};

use crate::config::BackupConfig;

/// What providers need from the environment to start.
pub struct ProviderContext<'a> {
    /// Directory holding the credential caches.
    pub token_dir: PathBuf,
    /// Asks the operator for authorization codes.
    pub prompt: &'a dyn CodePrompt,
}

/// A connected provider and the items configured for it.
pub struct ConfiguredProvider {
    /// The provider.
    pub provider: Arc<dyn StorageProvider>,
    /// Items to back up to it, in order.
    pub files: Vec<PathBuf>,
}

/// Connect every configured provider, in the order dropbox, google, local.
///
/// All providers are set up before anything is uploaded, so an
/// authorization failure stops the run before it starts.
///
/// # Errors
/// - Authorization code exchange failed
/// - Provider configuration is invalid
pub async fn connect_all(
    config: &BackupConfig,
    ctx: &ProviderContext<'_>,
) -> Result<Vec<ConfiguredProvider>> {
    let mut connected = Vec::new();

    if let Some(section) = &config.providers.dropbox {
        let store = CredentialStore::new(&ctx.token_dir, "dropbox");
        let provider = DropboxProvider::connect(&section.settings, store, ctx.prompt).await?;
        connected.push(ConfiguredProvider {
            provider: Arc::new(provider),
            files: section.files.clone(),
        });
    }

    if let Some(section) = &config.providers.google {
        let store = CredentialStore::new(&ctx.token_dir, "google");
        let provider = GDriveProvider::connect(&section.settings, store, ctx.prompt).await?;
        connected.push(ConfiguredProvider {
            provider: Arc::new(provider),
            files: section.files.clone(),
        });
    }

    if let Some(section) = &config.providers.local {
        let provider = LocalProvider::new(&section.settings.root)?;
        info!(root = %section.settings.root.display(), "Using local backup directory");
        connected.push(ConfiguredProvider {
            provider: Arc::new(provider),
            files: section.files.clone(),
        });
    }

    Ok(connected)
}

//! Cached credentials with an interactive authorization fallback.
//!
//! Every provider keeps its credential in `<token_dir>/.token.<provider>`.
//! When that file is missing or unusable the operator is shown an
//! authorization URL, pastes the code they get back, and the exchanged
//! credential is written to the same file for the next run.
//!
//! The cache is plaintext JSON. On Unix it is created with mode `0600`, which
//! keeps other local users out but does nothing against anyone who can read
//! the operator's files.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use meldanya_common::{Error, Result};

/// Provider side of an interactive authorization.
#[async_trait]
pub trait AuthorizationFlow: Send + Sync {
    /// Credential produced by the flow and cached on disk.
    type Credential: Serialize + DeserializeOwned + Send + Sync;

    /// URL the operator has to visit to grant access.
    fn authorization_url(&self) -> String;

    /// Exchange the code the operator pasted for a credential.
    async fn exchange_code(&self, code: &str) -> Result<Self::Credential>;
}

/// Asks the operator for an authorization code.
#[async_trait]
pub trait CodePrompt: Send + Sync {
    /// Show `url` for `provider` and return the code the operator entered.
    async fn authorization_code(&self, provider: &str, url: &str) -> Result<String>;
}

/// Prompt on the controlling terminal.
#[derive(Debug, Clone)]
pub struct TerminalPrompt {
    open_browser: bool,
}

impl TerminalPrompt {
    /// Create a terminal prompt. With `open_browser` the URL is also handed
    /// to the desktop's browser.
    pub fn new(open_browser: bool) -> Self {
        Self { open_browser }
    }
}

impl Default for TerminalPrompt {
    fn default() -> Self {
        Self::new(true)
    }
}

#[async_trait]
impl CodePrompt for TerminalPrompt {
    async fn authorization_code(&self, provider: &str, url: &str) -> Result<String> {
        println!("Authorize access to {}: {}", provider, url);

        if self.open_browser {
            if let Err(e) = open::that(url) {
                debug!("Could not open browser: {}", e);
            }
        }

        print!("Enter authorization code: ");
        std::io::stdout().flush()?;

        let mut line = String::new();
        BufReader::new(tokio::io::stdin())
            .read_line(&mut line)
            .await?;

        Ok(extract_code(&line))
    }
}

/// Pull the code out of what the operator pasted.
///
/// Accepts the bare code or the full redirect URL carrying a `code` query
/// parameter.
pub fn extract_code(input: &str) -> String {
    let input = input.trim();
    if let Ok(parsed) = url::Url::parse(input) {
        if let Some((_, code)) = parsed.query_pairs().find(|(key, _)| key == "code") {
            return code.into_owned();
        }
    }
    input.to_string()
}

/// On-disk cache for one provider's credential.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    provider: String,
    path: PathBuf,
}

impl CredentialStore {
    /// Create the store for `provider` inside `token_dir`.
    pub fn new(token_dir: impl AsRef<Path>, provider: impl Into<String>) -> Self {
        let provider = provider.into();
        let path = token_dir.as_ref().join(format!(".token.{}", provider));
        Self { provider, path }
    }

    /// Location of the cache file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Provider this store belongs to.
    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Read the cached credential.
    ///
    /// # Errors
    /// - Cache file missing or unreadable
    /// - Cache content is not a valid credential
    pub async fn load<C: DeserializeOwned>(&self) -> Result<C> {
        let content = fs::read_to_string(&self.path).await?;
        Ok(serde_json::from_str(content.trim())?)
    }

    /// Write the credential to the cache, replacing any previous one.
    pub async fn save<C: Serialize + Sync>(&self, credential: &C) -> Result<()> {
        let content = serde_json::to_string(credential)?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options.open(&self.path).await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;

        // `mode` only applies to new files; tighten caches left by older runs.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600)).await?;
        }

        Ok(())
    }

    /// Get a credential, from the cache if possible and interactively otherwise.
    ///
    /// # Postconditions
    /// - A freshly exchanged credential has been written to the cache
    ///   (a failed write is logged and does not fail the call)
    ///
    /// # Errors
    /// - The operator entered no code
    /// - The code exchange failed
    pub async fn obtain<F>(&self, flow: &F, prompt: &dyn CodePrompt) -> Result<F::Credential>
    where
        F: AuthorizationFlow + ?Sized,
    {
        match self.load::<F::Credential>().await {
            Ok(credential) => {
                debug!(provider = %self.provider, "Loaded cached credentials");
                return Ok(credential);
            }
            Err(e) => {
                warn!(
                    provider = %self.provider,
                    "Failed to acquire credentials from {}: {}",
                    self.path.display(),
                    e
                );
            }
        }

        let url = flow.authorization_url();
        let code = prompt.authorization_code(&self.provider, &url).await?;
        if code.is_empty() {
            return Err(Error::Authentication(format!(
                "No authorization code entered for {}",
                self.provider
            )));
        }

        let credential = flow.exchange_code(&code).await?;
        info!(provider = %self.provider, "Authorization completed");

        if let Err(e) = self.save(&credential).await {
            warn!(
                provider = %self.provider,
                "Failed to cache credentials at {}: {}",
                self.path.display(),
                e
            );
        }

        Ok(credential)
    }
}

//! Backup configuration file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use meldanya_common::{Error, Result};
use meldanya_storage::{DropboxConfig, GDriveConfig, LocalConfig, DEFAULT_KEEP_COUNT};

/// Contents of the JSON configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// File holding the encryption passphrase. Without it nothing is encrypted.
    #[serde(default)]
    pub encrypt_pass: Option<PathBuf>,
    /// Backup folders kept per provider.
    #[serde(default = "default_keep_backups")]
    pub keep_backups: usize,
    /// Directory for archives and encrypted files. Defaults to next to each item.
    #[serde(default)]
    pub staging_dir: Option<PathBuf>,
    /// Directory holding the credential caches.
    #[serde(default)]
    pub token_dir: Option<PathBuf>,
    /// Configured providers.
    #[serde(default)]
    pub providers: ProvidersConfig,
}

fn default_keep_backups() -> usize {
    DEFAULT_KEEP_COUNT
}

/// Per-provider sections. Absent providers are not used.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvidersConfig {
    /// Dropbox settings.
    #[serde(default)]
    pub dropbox: Option<ProviderSection<DropboxConfig>>,
    /// Google Drive settings.
    #[serde(default)]
    pub google: Option<ProviderSection<GDriveConfig>>,
    /// Local directory settings.
    #[serde(default)]
    pub local: Option<ProviderSection<LocalConfig>>,
}

/// Provider settings plus the items backed up to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSection<S> {
    /// Backend specific settings.
    #[serde(flatten)]
    pub settings: S,
    /// Files and directories to back up, in order.
    #[serde(default)]
    pub files: Vec<PathBuf>,
}

impl BackupConfig {
    /// Read and parse the configuration file at `path`.
    ///
    /// # Errors
    /// - `Error::Config` when the file cannot be read or parsed
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let mut config = Self::from_json(&content)?;
        config.expand_paths();
        Ok(config)
    }

    /// Parse configuration from JSON text.
    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))
    }

    /// Credential cache directory, falling back to `base`.
    pub fn token_dir_or(&self, base: &Path) -> PathBuf {
        self.token_dir.clone().unwrap_or_else(|| base.to_path_buf())
    }

    /// Expand a leading `~` in every configured path.
    fn expand_paths(&mut self) {
        for path in [&mut self.encrypt_pass, &mut self.staging_dir, &mut self.token_dir]
            .into_iter()
            .flatten()
        {
            *path = expand_home(path);
        }

        let providers = &mut self.providers;
        let file_lists = [
            providers.dropbox.as_mut().map(|s| &mut s.files),
            providers.google.as_mut().map(|s| &mut s.files),
            providers.local.as_mut().map(|s| &mut s.files),
        ];
        for files in file_lists.into_iter().flatten() {
            for file in files.iter_mut() {
                *file = expand_home(file);
            }
        }

        if let Some(local) = providers.local.as_mut() {
            local.settings.root = expand_home(&local.settings.root);
        }
    }
}

/// Replace a leading `~` with the home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match dirs::home_dir() {
        Some(home) => home.join(rest),
        None => path.to_path_buf(),
    }
}

/// Resolve a command line path: `~` is expanded and relative paths are taken
/// relative to `base`.
pub fn resolve_path(path: &Path, base: &Path) -> PathBuf {
    let expanded = expand_home(path);
    if expanded.is_absolute() {
        expanded
    } else {
        base.join(expanded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const FULL_CONFIG: &str = r#"{
        "encrypt_pass": "/etc/meldanya/pass",
        "keep_backups": 3,
        "providers": {
            "dropbox": {
                "app_key": "key",
                "app_secret": "secret",
                "files": ["/home/me/docs", "/home/me/photos.tar.gz"]
            },
            "google": {
                "client_id": "id.apps.googleusercontent.com",
                "client_secret": "gsecret",
                "files": ["/home/me/docs"]
            }
        }
    }"#;

    #[test]
    fn test_parse_full_config() {
        let config = BackupConfig::from_json(FULL_CONFIG).unwrap();

        assert_eq!(config.encrypt_pass, Some(PathBuf::from("/etc/meldanya/pass")));
        assert_eq!(config.keep_backups, 3);

        let dropbox = config.providers.dropbox.unwrap();
        assert_eq!(dropbox.settings.app_key, "key");
        assert_eq!(dropbox.files.len(), 2);

        let google = config.providers.google.unwrap();
        assert_eq!(google.settings.client_secret, "gsecret");
        assert!(google.settings.redirect_url.is_none());

        assert!(config.providers.local.is_none());
    }

    #[test]
    fn test_defaults() {
        let config = BackupConfig::from_json("{}").unwrap();
        assert!(config.encrypt_pass.is_none());
        assert_eq!(config.keep_backups, DEFAULT_KEEP_COUNT);
        assert!(config.providers.dropbox.is_none());
        assert_eq!(
            config.token_dir_or(Path::new("/opt/meldanya")),
            PathBuf::from("/opt/meldanya")
        );
    }

    #[test]
    fn test_local_section() {
        let config = BackupConfig::from_json(
            r#"{"providers": {"local": {"root": "/mnt/nas/backups", "files": ["/srv/data"]}}}"#,
        )
        .unwrap();
        let local = config.providers.local.unwrap();
        assert_eq!(local.settings.root, PathBuf::from("/mnt/nas/backups"));
        assert_eq!(local.files, vec![PathBuf::from("/srv/data")]);
    }

    #[test]
    fn test_malformed_config_is_config_error() {
        assert!(matches!(
            BackupConfig::from_json("{ not json"),
            Err(Error::Config(_))
        ));
        // Provider section missing its credentials.
        assert!(matches!(
            BackupConfig::from_json(r#"{"providers": {"dropbox": {"files": []}}}"#),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let temp = TempDir::new().unwrap();
        let result = BackupConfig::load(&temp.path().join("absent.conf")).await;
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("meldanya.conf");
        std::fs::write(&path, FULL_CONFIG).unwrap();

        let config = BackupConfig::load(&path).await.unwrap();
        assert_eq!(config.keep_backups, 3);
    }

    #[test]
    fn test_resolve_path() {
        let base = Path::new("/opt/meldanya");
        assert_eq!(
            resolve_path(Path::new("/var/log/backup.log"), base),
            PathBuf::from("/var/log/backup.log")
        );
        assert_eq!(
            resolve_path(Path::new("backup.conf"), base),
            PathBuf::from("/opt/meldanya/backup.conf")
        );
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home(Path::new("/abs")), PathBuf::from("/abs"));
        assert_eq!(expand_home(Path::new("~user")), PathBuf::from("~user"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(
                expand_home(Path::new("~/.meldanya_backup.conf")),
                home.join(".meldanya_backup.conf")
            );
            assert_eq!(expand_home(Path::new("~")), home);
        }
    }
}

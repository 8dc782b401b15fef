//! Application configuration management.
//!
//! This module handles loading and saving the configuration, which includes
//! the token service URL, the token storage strategy and the encrypted
//! snapshot settings.
//!
//! Configuration is stored at `~/.config/sessionkeep/config.json`; a few
//! fields can be overridden from the environment (`SESSIONKEEP_*`).

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::crypto::{KdfParams, PassphraseStore};

/// Application name used for config/data/runtime directory paths
pub const APP_NAME: &str = "sessionkeep";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Fixed storage key of the encrypted session record
pub const SNAPSHOT_RECORD: &str = "app.auth";

/// Session-scoped token file name
const TOKEN_FILE: &str = "tokens.json";

/// Service URL used when nothing is configured.
const DEFAULT_API_URL: &str = "http://localhost:8080";

/// HTTP request timeout in seconds.
/// Covers the refresh call too; the coordinator adds no timeout of its own.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

const ENV_API_URL: &str = "SESSIONKEEP_API_URL";
const ENV_TOKEN_STORAGE: &str = "SESSIONKEEP_TOKEN_STORAGE";
const ENV_PASSPHRASE: &str = "SESSIONKEEP_PASSPHRASE";

/// Where access/refresh tokens live. Chosen once, at store construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// Server-managed httpOnly cookies held by the HTTP client's cookie jar
    Cookie,
    /// Process memory only
    Memory,
    /// Memory backed by a file in the user's runtime directory
    #[default]
    Session,
}

impl FromStr for StorageKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cookie" => Ok(StorageKind::Cookie),
            "memory" => Ok(StorageKind::Memory),
            "session" => Ok(StorageKind::Session),
            other => Err(anyhow::anyhow!("Unknown token storage '{}'", other)),
        }
    }
}

/// Encrypted identity snapshot settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Defaults to `<data dir>/sessionkeep/app.auth`
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Falls back to a keychain-held random passphrase
    #[serde(default, skip_serializing)]
    pub passphrase: Option<String>,
    #[serde(default)]
    pub kdf: KdfParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default)]
    pub token_storage: StorageKind,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Overrides the runtime directory used by the session token strategy
    #[serde(default)]
    pub session_dir: Option<PathBuf>,
    #[serde(default)]
    pub last_email: Option<String>,
}

fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

fn default_request_timeout() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            token_storage: StorageKind::default(),
            snapshot: SnapshotConfig::default(),
            request_timeout_secs: default_request_timeout(),
            session_dir: None,
            last_email: None,
        }
    }
}

impl Config {
    /// Config pointing at `api_url` with everything else defaulted.
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            ..Self::default()
        }
    }

    /// Load the config file (if any) and apply environment overrides.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = Self::load_from(&path)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Record the last email used to log in. Only the file contents are
    /// rewritten; environment overrides are not persisted.
    pub fn remember_email(&mut self, email: &str) -> Result<()> {
        self.last_email = Some(email.to_string());
        let mut stored = Self::load_from(&Self::config_path()?)?;
        stored.last_email = Some(email.to_string());
        stored.save()
    }

    /// Apply `SESSIONKEEP_*` overrides through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_API_URL).filter(|v| !v.trim().is_empty()) {
            self.api_url = url.trim().to_string();
        }
        if let Some(kind) = lookup(ENV_TOKEN_STORAGE) {
            match kind.parse() {
                Ok(kind) => self.token_storage = kind,
                Err(e) => warn!(error = %e, "Ignoring {}", ENV_TOKEN_STORAGE),
            }
        }
        if let Some(passphrase) = lookup(ENV_PASSPHRASE).filter(|v| !v.is_empty()) {
            self.snapshot.passphrase = Some(passphrase);
        }
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Location of the encrypted snapshot record.
    pub fn snapshot_path(&self) -> Result<PathBuf> {
        if let Some(ref path) = self.snapshot.path {
            return Ok(path.clone());
        }
        let data_dir =
            dirs::data_dir().ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME).join(SNAPSHOT_RECORD))
    }

    /// Location of the session-scoped token file, if the platform has a
    /// runtime directory.
    pub fn session_token_path(&self) -> Option<PathBuf> {
        self.session_dir
            .clone()
            .or_else(|| dirs::runtime_dir().map(|dir| dir.join(APP_NAME)))
            .map(|dir| dir.join(TOKEN_FILE))
    }

    /// Passphrase for the snapshot: configured/env value first, then the OS
    /// keychain.
    pub fn snapshot_passphrase(&self) -> Result<String> {
        match self.snapshot.passphrase {
            Some(ref passphrase) => Ok(passphrase.clone()),
            None => PassphraseStore::get_or_create(APP_NAME),
        }
    }
}

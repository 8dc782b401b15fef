use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::auth::Identity;
use crate::config::Config;
use crate::crypto::CryptoCodec;

/// What survives a restart under the snapshot strategy. Tokens are never
/// part of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub user: Identity,
}

/// Encrypted identity record on disk.
pub struct SnapshotStore {
    path: PathBuf,
    codec: CryptoCodec,
    passphrase: String,
}

impl SnapshotStore {
    pub fn new(path: PathBuf, codec: CryptoCodec, passphrase: String) -> Self {
        Self {
            path,
            codec,
            passphrase,
        }
    }

    /// `None` when the snapshot strategy is disabled.
    pub fn from_config(config: &Config) -> Result<Option<Self>> {
        if !config.snapshot.enabled {
            return Ok(None);
        }
        let path = config.snapshot_path()?;
        let passphrase = config
            .snapshot_passphrase()
            .context("Failed to resolve snapshot passphrase")?;
        let codec = CryptoCodec::new(config.snapshot.kdf);
        Ok(Some(Self::new(path, codec, passphrase)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Raw record contents, `None` if there is no record.
    pub fn read_record(&self) -> Option<String> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => Some(contents),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => {
                warn!(error = %e, path = ?self.path, "Failed to read session snapshot");
                None
            }
        }
    }

    /// Restore the identity. Missing or unreadable records give `None`.
    pub async fn load(&self) -> Option<Identity> {
        let record = self.read_record()?;
        self.decode(&record).await
    }

    pub async fn decode(&self, record: &str) -> Option<Identity> {
        self.codec
            .decrypt::<SessionSnapshot>(record, &self.passphrase)
            .await
            .map(|snapshot| snapshot.user)
    }

    /// Encrypt and write the record.
    pub async fn save(&self, identity: &Identity) -> Result<()> {
        let envelope = self.seal(identity).await?;
        self.write(&envelope)
    }

    /// Encrypt `identity` into a record without touching the file.
    pub async fn seal(&self, identity: &Identity) -> Result<String> {
        let snapshot = SessionSnapshot {
            user: identity.clone(),
        };
        self.codec
            .encrypt(&snapshot, &self.passphrase)
            .await
            .context("Failed to encrypt session snapshot")
    }

    /// Replace the record with `envelope`. The file is swapped in atomically
    /// so a watcher never observes a half-written envelope.
    pub fn write(&self, envelope: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, envelope).context("Failed to write session snapshot")?;
        std::fs::rename(&tmp, &self.path).context("Failed to replace session snapshot")?;
        debug!(path = ?self.path, "Session snapshot saved");
        Ok(())
    }

    /// Delete the record. Idempotent.
    pub fn remove(&self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = ?self.path, "Session snapshot removed"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(error = %e, path = ?self.path, "Failed to remove session snapshot"),
        }
    }
}

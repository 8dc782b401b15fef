use anyhow::{Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use keyring::Entry;
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::info;

/// Keychain account holding the snapshot passphrase
const PASSPHRASE_ACCOUNT: &str = "snapshot-passphrase";

/// Entropy of a generated passphrase in bytes
const GENERATED_PASSPHRASE_BYTES: usize = 32;

/// Snapshot passphrase kept in the OS keychain.
pub struct PassphraseStore;

impl PassphraseStore {
    /// Fetch the passphrase for `service`, generating and storing one on first use.
    pub fn get_or_create(service: &str) -> Result<String> {
        let entry = Entry::new(service, PASSPHRASE_ACCOUNT)
            .context("Failed to create keyring entry")?;

        match entry.get_password() {
            Ok(passphrase) => Ok(passphrase),
            Err(keyring::Error::NoEntry) => {
                let passphrase = Self::generate();
                entry
                    .set_password(&passphrase)
                    .context("Failed to store snapshot passphrase in keychain")?;
                info!("Generated new snapshot passphrase");
                Ok(passphrase)
            }
            Err(e) => Err(e).context("Failed to retrieve snapshot passphrase from keychain"),
        }
    }

    /// Forget the stored passphrase. Existing snapshots become unreadable.
    pub fn delete(service: &str) -> Result<()> {
        let entry = Entry::new(service, PASSPHRASE_ACCOUNT)
            .context("Failed to create keyring entry")?;
        match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).context("Failed to delete snapshot passphrase from keychain"),
        }
    }

    /// Random URL-safe passphrase.
    pub fn generate() -> String {
        let mut bytes = [0u8; GENERATED_PASSPHRASE_BYTES];
        OsRng.fill_bytes(&mut bytes);
        URL_SAFE_NO_PAD.encode(bytes)
    }
}

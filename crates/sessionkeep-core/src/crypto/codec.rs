use argon2::{Algorithm, Argon2, Params, Version};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Envelope format version written by `seal`. Anything else is rejected.
pub const ENVELOPE_VERSION: u32 = 1;

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// Argon2id cost parameters.
///
/// Defaults follow the OWASP baseline (19 MiB, 2 passes, 1 lane). The same
/// parameters must be used to decrypt, so they are part of the config rather
/// than the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 19 * 1024,
            iterations: 2,
            parallelism: 1,
        }
    }
}

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Failed to serialize value: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Encryption failed")]
    Encrypt,

    #[error("Crypto task failed: {0}")]
    Task(String),
}

/// Wire form of an envelope. Short field names keep records compatible with
/// the existing `{s, i, c, v}` layout.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    s: String,
    i: String,
    c: String,
    v: u32,
}

/// Passphrase-based authenticated encryption of serializable values.
/// Clone is cheap; it only carries the KDF parameters.
#[derive(Debug, Clone, Default)]
pub struct CryptoCodec {
    params: KdfParams,
}

impl CryptoCodec {
    pub fn new(params: KdfParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> KdfParams {
        self.params
    }

    /// Encrypt `value` on the blocking pool.
    pub async fn encrypt<T: Serialize + ?Sized>(
        &self,
        value: &T,
        passphrase: &str,
    ) -> Result<String, CryptoError> {
        let plaintext = serde_json::to_vec(value)?;
        let codec = self.clone();
        let passphrase = passphrase.to_owned();
        tokio::task::spawn_blocking(move || codec.seal_bytes(&plaintext, &passphrase))
            .await
            .map_err(|e| CryptoError::Task(e.to_string()))?
    }

    /// Decrypt an envelope on the blocking pool. `None` on any failure.
    pub async fn decrypt<T: DeserializeOwned>(&self, envelope: &str, passphrase: &str) -> Option<T> {
        let codec = self.clone();
        let envelope = envelope.to_owned();
        let passphrase = passphrase.to_owned();
        let plaintext = tokio::task::spawn_blocking(move || codec.open_bytes(&envelope, &passphrase))
            .await
            .ok()??;
        Self::deserialize(&plaintext)
    }

    /// Synchronous `encrypt`.
    pub fn seal<T: Serialize + ?Sized>(&self, value: &T, passphrase: &str) -> Result<String, CryptoError> {
        let plaintext = serde_json::to_vec(value)?;
        self.seal_bytes(&plaintext, passphrase)
    }

    /// Synchronous `decrypt`.
    pub fn open<T: DeserializeOwned>(&self, envelope: &str, passphrase: &str) -> Option<T> {
        let plaintext = self.open_bytes(envelope, passphrase)?;
        Self::deserialize(&plaintext)
    }

    fn seal_bytes(&self, plaintext: &[u8], passphrase: &str) -> Result<String, CryptoError> {
        // Fresh salt and nonce on every call; callers cannot supply their own.
        let mut salt = [0u8; SALT_LEN];
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut salt);
        OsRng.fill_bytes(&mut nonce);

        let key = self.derive_key(passphrase, &salt)?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::Encrypt)?;

        let envelope = Envelope {
            s: STANDARD.encode(salt),
            i: STANDARD.encode(nonce),
            c: STANDARD.encode(ciphertext),
            v: ENVELOPE_VERSION,
        };
        Ok(serde_json::to_string(&envelope)?)
    }

    fn open_bytes(&self, envelope: &str, passphrase: &str) -> Option<Vec<u8>> {
        match self.try_open_bytes(envelope, passphrase) {
            Ok(plaintext) => Some(plaintext),
            Err(reason) => {
                debug!(reason, "Discarding unreadable envelope");
                None
            }
        }
    }

    fn try_open_bytes(&self, envelope: &str, passphrase: &str) -> Result<Vec<u8>, &'static str> {
        let envelope: Envelope = serde_json::from_str(envelope).map_err(|_| "malformed envelope")?;
        if envelope.v != ENVELOPE_VERSION {
            return Err("unsupported envelope version");
        }

        let salt = STANDARD.decode(&envelope.s).map_err(|_| "invalid salt encoding")?;
        let nonce = STANDARD.decode(&envelope.i).map_err(|_| "invalid nonce encoding")?;
        let ciphertext = STANDARD.decode(&envelope.c).map_err(|_| "invalid ciphertext encoding")?;
        if salt.len() != SALT_LEN || nonce.len() != NONCE_LEN {
            return Err("invalid salt or nonce length");
        }

        let key = self
            .derive_key(passphrase, &salt)
            .map_err(|_| "key derivation failed")?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
            .map_err(|_| "authentication failed")
    }

    fn derive_key(&self, passphrase: &str, salt: &[u8]) -> Result<[u8; KEY_LEN], CryptoError> {
        let params = Params::new(
            self.params.memory_kib,
            self.params.iterations,
            self.params.parallelism,
            Some(KEY_LEN),
        )
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

        let mut key = [0u8; KEY_LEN];
        Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
            .hash_password_into(passphrase.as_bytes(), salt, &mut key)
            .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
        Ok(key)
    }

    fn deserialize<T: DeserializeOwned>(plaintext: &[u8]) -> Option<T> {
        match serde_json::from_slice(plaintext) {
            Ok(value) => Some(value),
            Err(e) => {
                debug!(error = %e, "Decrypted payload has unexpected shape");
                None
            }
        }
    }
}

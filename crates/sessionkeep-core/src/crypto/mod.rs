//! Encryption for the persisted session snapshot.
//!
//! This module provides:
//! - `CryptoCodec`: passphrase-keyed, versioned envelopes (Argon2id + ChaCha20-Poly1305)
//! - `PassphraseStore`: a random snapshot passphrase kept in the OS keychain
//!
//! Decryption is fail-soft: anything unreadable comes back as `None`.

pub mod codec;
pub mod passphrase;

pub use codec::{CryptoCodec, CryptoError, KdfParams, ENVELOPE_VERSION};
pub use passphrase::PassphraseStore;

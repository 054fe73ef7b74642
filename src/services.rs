//! Opaque services consumed by command handlers.
//!
//! The core does not implement id generation, encryption, or password
//! hashing itself; it consumes them behind small traits so deployments can
//! plug in their KMS / hashing scheme of choice. Projections and the event
//! store never touch these: hashing and encryption happen inside command
//! handlers only, and the store guarantees nothing beyond preserving an
//! [`EncryptedBlob`] verbatim through append and replay.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Generates ids for new aggregates and entities.
///
/// Time-ordered output is preferred (it keeps b-tree inserts append-ish)
/// but not required for correctness.
pub trait IdGenerator: Send + Sync {
    /// A new globally unique id.
    fn new_id(&self) -> String;
}

/// Default id generator: UUIDv7, which is time-ordered.
#[derive(Debug, Clone, Default)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn new_id(&self) -> String {
        uuid::Uuid::now_v7().to_string()
    }
}

/// A ciphertext produced by an [`EncryptionService`].
///
/// The core treats this as opaque: it is stored inside event payloads for
/// fields marked sensitive and handed back to the service for decryption.
/// `key_id` lets the service route to the right key on decrypt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedBlob {
    /// Identifier of the key the blob was encrypted under.
    pub key_id: String,
    /// Base64-encoded ciphertext.
    pub ciphertext: String,
}

/// Symmetric encryption for sensitive payload fields.
pub trait EncryptionService: Send + Sync {
    /// Encrypt `plaintext` under the key identified by `key_id`.
    fn encrypt(&self, plaintext: &[u8], key_id: &str) -> Result<EncryptedBlob>;

    /// Decrypt a blob previously produced by this service.
    fn decrypt(&self, blob: &EncryptedBlob) -> Result<Vec<u8>>;
}

/// Password / secret hashing, used inside command handlers only.
pub trait SecretHasher: Send + Sync {
    /// Hash a secret into a self-describing verifier string.
    fn hash(&self, secret: &str) -> Result<String>;

    /// Verify a secret against a previously produced hash.
    fn verify(&self, secret: &str, hash: &str) -> Result<bool>;
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    //! Deliberately insecure fakes for exercising command handlers.

    use super::*;
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Deterministic id generator: "fixture-1", "fixture-2", ...
    #[derive(Debug, Default)]
    pub(crate) struct SequentialIds {
        next: AtomicU64,
    }

    impl IdGenerator for SequentialIds {
        fn new_id(&self) -> String {
            let n = self.next.fetch_add(1, Ordering::Relaxed) + 1;
            format!("fixture-{n}")
        }
    }

    /// "Encryption" that base64s the plaintext. Round-trips verbatim.
    #[derive(Debug, Default)]
    pub(crate) struct Base64Crypto;

    impl EncryptionService for Base64Crypto {
        fn encrypt(&self, plaintext: &[u8], key_id: &str) -> Result<EncryptedBlob> {
            Ok(EncryptedBlob {
                key_id: key_id.to_string(),
                ciphertext: BASE64.encode(plaintext),
            })
        }

        fn decrypt(&self, blob: &EncryptedBlob) -> Result<Vec<u8>> {
            BASE64
                .decode(&blob.ciphertext)
                .map_err(|e| crate::Error::fatal(format!("fixture blob corrupt: {e}")))
        }
    }

    /// Hasher that prefixes the secret. Verification is string equality.
    #[derive(Debug, Default)]
    pub(crate) struct PrefixHasher;

    impl SecretHasher for PrefixHasher {
        fn hash(&self, secret: &str) -> Result<String> {
            Ok(format!("hashed:{secret}"))
        }

        fn verify(&self, secret: &str, hash: &str) -> Result<bool> {
            Ok(hash == format!("hashed:{secret}"))
        }
    }
}

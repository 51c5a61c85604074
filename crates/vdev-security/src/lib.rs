//! ---
//! vdev_section: "06-security"
//! vdev_subsection: "module"
//! vdev_type: "source"
//! vdev_scope: "code"
//! vdev_description: "Payload ciphers and key handling."
//! vdev_version: "v0.1.0"
//! vdev_owner: "tbd"
//! ---
//! Payload ciphers for the device wire protocol.
//!
//! Every cipher turns a serialized payload into base64 text and back. The
//! default [`DesEcbCipher`] matches what deployed platforms speak today; it is
//! ECB mode without integrity protection, so identical plaintext blocks leak and
//! tampering goes unnoticed. [`AesCcmCipher`] implements the same contract with
//! authenticated encryption and should be preferred wherever both ends can be
//! upgraded.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub mod aes_ccm;
pub mod des_ecb;

pub use aes_ccm::AesCcmCipher;
pub use des_ecb::DesEcbCipher;

/// Byte used to right-pad short operator keys.
pub const KEY_FILLER: u8 = b'0';

/// Errors raised while turning transport text back into plaintext.
#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    #[error("payload is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("ciphertext length {0} is not a whole number of blocks")]
    BlockLength(usize),
    #[error("invalid block padding")]
    Padding,
    #[error("ciphertext is shorter than the {0}-byte nonce")]
    Truncated(usize),
    #[error("authentication tag mismatch")]
    Authentication,
    #[error("payload of {0} bytes is too large for the cipher")]
    TooLarge(usize),
    #[error("invalid key length")]
    InvalidKey,
}

/// Symmetric payload cipher paired with a binary-safe text encoding.
pub trait Cipher: Send + Sync + fmt::Debug {
    /// Encrypt and encode as transport-safe text.
    fn encrypt(&self, plaintext: &[u8]) -> Result<String, CipherError>;
    /// Decode transport text and decrypt it.
    fn decrypt(&self, text: &[u8]) -> Result<Vec<u8>, CipherError>;
    /// Scheme label for logs.
    fn scheme(&self) -> CipherScheme;
}

/// Selects the cipher implementation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CipherScheme {
    /// Single-DES ECB with PKCS#5 padding, compatible with existing platform tooling.
    #[default]
    DesEcb,
    /// AES-128-CCM with a random nonce per message.
    AesCcm,
}

impl fmt::Display for CipherScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CipherScheme::DesEcb => f.write_str("des-ecb"),
            CipherScheme::AesCcm => f.write_str("aes-ccm"),
        }
    }
}

/// Shared cipher handle.
pub type SharedCipher = Arc<dyn Cipher>;

/// Build the cipher for `scheme` from an operator key string.
pub fn build_cipher(scheme: CipherScheme, key: &str) -> Result<SharedCipher, CipherError> {
    Ok(match scheme {
        CipherScheme::DesEcb => Arc::new(DesEcbCipher::new(key)?),
        CipherScheme::AesCcm => Arc::new(AesCcmCipher::new(key)?),
    })
}

/// Right-pad `key` with [`KEY_FILLER`] and truncate to `len` bytes.
///
/// This is a length normalisation, not a key derivation function.
pub fn normalize_key(key: &str, len: usize) -> Vec<u8> {
    let mut bytes = key.as_bytes().to_vec();
    bytes.resize(len.max(bytes.len()), KEY_FILLER);
    bytes.truncate(len);
    bytes
}

/// Short SHA-256 fingerprint of a key, safe to log.
pub fn key_fingerprint(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    hex::encode(&digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_pads_and_truncates() {
        assert_eq!(normalize_key("abc", 8), b"abc00000");
        assert_eq!(normalize_key("abcdefghij", 8), b"abcdefgh");
        assert_eq!(normalize_key("", 4), b"0000");
    }

    #[test]
    fn fingerprint_is_stable_and_short() {
        assert_eq!(key_fingerprint("k"), key_fingerprint("k"));
        assert_ne!(key_fingerprint("k"), key_fingerprint("j"));
        assert_eq!(key_fingerprint("k").len(), 16);
    }

    #[test]
    fn scheme_serde_is_kebab_case() {
        let scheme: CipherScheme = serde_json::from_str("\"aes-ccm\"").unwrap();
        assert_eq!(scheme, CipherScheme::AesCcm);
        assert_eq!(CipherScheme::DesEcb.to_string(), "des-ecb");
    }

    #[test]
    fn build_cipher_selects_scheme() {
        for scheme in [CipherScheme::DesEcb, CipherScheme::AesCcm] {
            let cipher = build_cipher(scheme, "secret").unwrap();
            assert_eq!(cipher.scheme(), scheme);
            let text = cipher.encrypt(b"{\"DATA\":[]}").unwrap();
            assert_eq!(cipher.decrypt(text.as_bytes()).unwrap(), b"{\"DATA\":[]}");
        }
    }
}

//! ---
//! vdev_section: "06-security"
//! vdev_subsection: "module"
//! vdev_type: "source"
//! vdev_scope: "code"
//! vdev_description: "Payload ciphers and key handling."
//! vdev_version: "v0.1.0"
//! vdev_owner: "tbd"
//! ---
use std::fmt;

use aes::Aes128;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ccm::aead::generic_array::GenericArray;
use ccm::aead::consts::{U13, U16};
use ccm::aead::Aead;
use ccm::{Ccm, KeyInit};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::{Cipher, CipherError, CipherScheme};

type AesCcm = Ccm<Aes128, U16, U13>;

const NONCE_LEN: usize = 13;
const KEY_LEN: usize = 16;
// 13-byte nonce leaves a 2-byte length field.
const MAX_PLAINTEXT: usize = u16::MAX as usize;

/// AES-128-CCM; transport text is `base64(nonce || ciphertext || tag)`.
pub struct AesCcmCipher {
    inner: AesCcm,
}

impl AesCcmCipher {
    /// The AES key is the first 16 bytes of SHA-256 over the operator key.
    pub fn new(key: &str) -> Result<Self, CipherError> {
        let digest = Sha256::digest(key.as_bytes());
        let inner =
            AesCcm::new_from_slice(&digest[..KEY_LEN]).map_err(|_| CipherError::InvalidKey)?;
        Ok(Self { inner })
    }
}

impl fmt::Debug for AesCcmCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AesCcmCipher").finish_non_exhaustive()
    }
}

impl Cipher for AesCcmCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<String, CipherError> {
        if plaintext.len() > MAX_PLAINTEXT {
            return Err(CipherError::TooLarge(plaintext.len()));
        }
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let sealed = self
            .inner
            .encrypt(GenericArray::from_slice(&nonce), plaintext)
            .map_err(|_| CipherError::TooLarge(plaintext.len()))?;
        let mut framed = Vec::with_capacity(NONCE_LEN + sealed.len());
        framed.extend_from_slice(&nonce);
        framed.extend_from_slice(&sealed);
        Ok(BASE64.encode(framed))
    }

    fn decrypt(&self, text: &[u8]) -> Result<Vec<u8>, CipherError> {
        let framed = BASE64.decode(text.trim_ascii())?;
        if framed.len() < NONCE_LEN {
            return Err(CipherError::Truncated(NONCE_LEN));
        }
        let (nonce, sealed) = framed.split_at(NONCE_LEN);
        self.inner
            .decrypt(GenericArray::from_slice(nonce), sealed)
            .map_err(|_| CipherError::Authentication)
    }

    fn scheme(&self) -> CipherScheme {
        CipherScheme::AesCcm
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_and_uses_fresh_nonces() {
        let cipher = AesCcmCipher::new("devkey").unwrap();
        let first = cipher.encrypt(b"same payload").unwrap();
        let second = cipher.encrypt(b"same payload").unwrap();
        assert_ne!(first, second);
        assert_eq!(cipher.decrypt(first.as_bytes()).unwrap(), b"same payload");
        assert_eq!(cipher.decrypt(second.as_bytes()).unwrap(), b"same payload");
        assert_eq!(cipher.decrypt(cipher.encrypt(b"").unwrap().as_bytes()).unwrap(), b"");
    }

    #[test]
    fn detects_tampering() {
        let cipher = AesCcmCipher::new("devkey").unwrap();
        let mut raw = BASE64.decode(cipher.encrypt(b"{\"DATA\":{}}").unwrap()).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let tampered = BASE64.encode(raw);
        assert!(matches!(
            cipher.decrypt(tampered.as_bytes()),
            Err(CipherError::Authentication)
        ));
    }

    #[test]
    fn rejects_wrong_key_and_short_input() {
        let text = AesCcmCipher::new("a").unwrap().encrypt(b"x").unwrap();
        assert!(matches!(
            AesCcmCipher::new("b").unwrap().decrypt(text.as_bytes()),
            Err(CipherError::Authentication)
        ));
        let short = BASE64.encode([0u8; 4]);
        assert!(matches!(
            AesCcmCipher::new("a").unwrap().decrypt(short.as_bytes()),
            Err(CipherError::Truncated(NONCE_LEN))
        ));
    }
}

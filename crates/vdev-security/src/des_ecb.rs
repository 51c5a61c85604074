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

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use des::Des;
use ecb::cipher::block_padding::Pkcs7;
use ecb::cipher::{BlockDecryptMut, BlockEncryptMut, KeyInit};

use crate::{normalize_key, Cipher, CipherError, CipherScheme};

type EcbEncryptor = ecb::Encryptor<Des>;
type EcbDecryptor = ecb::Decryptor<Des>;

const BLOCK: usize = 8;

/// Single-DES in ECB mode with PKCS#5 padding and base64 framing.
pub struct DesEcbCipher {
    key: [u8; Self::KEY_LEN],
}

impl DesEcbCipher {
    pub const KEY_LEN: usize = 8;

    pub fn new(key: &str) -> Result<Self, CipherError> {
        let key: [u8; Self::KEY_LEN] = normalize_key(key, Self::KEY_LEN)
            .try_into()
            .map_err(|_| CipherError::InvalidKey)?;
        Ok(Self { key })
    }
}

impl fmt::Debug for DesEcbCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DesEcbCipher").finish_non_exhaustive()
    }
}

impl Cipher for DesEcbCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<String, CipherError> {
        let encryptor =
            EcbEncryptor::new_from_slice(&self.key).map_err(|_| CipherError::InvalidKey)?;
        Ok(BASE64.encode(encryptor.encrypt_padded_vec_mut::<Pkcs7>(plaintext)))
    }

    fn decrypt(&self, text: &[u8]) -> Result<Vec<u8>, CipherError> {
        let buffer = BASE64.decode(text.trim_ascii())?;
        if buffer.is_empty() || buffer.len() % BLOCK != 0 {
            return Err(CipherError::BlockLength(buffer.len()));
        }
        let decryptor =
            EcbDecryptor::new_from_slice(&self.key).map_err(|_| CipherError::InvalidKey)?;
        decryptor
            .decrypt_padded_vec_mut::<Pkcs7>(&buffer)
            .map_err(|_| CipherError::Padding)
    }

    fn scheme(&self) -> CipherScheme {
        CipherScheme::DesEcb
    }
}

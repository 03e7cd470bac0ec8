//! Content encryption applied to replicated objects.
//!
//! AES-256-CBC with PKCS#7 padding. Every object gets a fresh random IV,
//! stored as the first 16 bytes of the ciphertext.

use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use sha2::{Digest, Sha256};

use crate::error::CryptoError;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const IV_LEN: usize = 16;

/// Pass-through when disabled.
#[derive(Clone)]
pub struct Cipher {
    key: Option<[u8; 32]>,
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cipher")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl Cipher {
    pub fn disabled() -> Self {
        Self { key: None }
    }

    /// Derive the key as SHA-256 of `passphrase`.
    pub fn from_passphrase(passphrase: &str) -> Self {
        let digest = Sha256::digest(passphrase.as_bytes());
        Self {
            key: Some(digest.into()),
        }
    }

    /// Random key, only useful for the lifetime of the process.
    pub fn random() -> Self {
        Self {
            key: Some(rand::random::<[u8; 32]>()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.key.is_some()
    }

    pub fn encrypt(&self, plain: &[u8]) -> Vec<u8> {
        let Some(key) = &self.key else {
            return plain.to_vec();
        };
        let iv = rand::random::<[u8; IV_LEN]>();
        let body = Aes256CbcEnc::new(key.into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plain);
        let mut out = Vec::with_capacity(IV_LEN + body.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(&body);
        out
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let Some(key) = &self.key else {
            return Ok(data.to_vec());
        };
        if data.len() < IV_LEN {
            return Err(CryptoError::Truncated(data.len()));
        }
        let (iv, body) = data.split_at(IV_LEN);
        let iv: [u8; IV_LEN] = iv
            .try_into()
            .map_err(|_| CryptoError::Truncated(data.len()))?;
        Aes256CbcDec::new(key.into(), &iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(body)
            .map_err(|_| CryptoError::Padding)
    }
}

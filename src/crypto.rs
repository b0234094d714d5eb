//! miIO payload encryption and decryption.
//! AES-128-CBC with PKCS7 padding, key and IV derived from the device token by MD5.

use crate::error::{MiioError, Result};
use aes::Aes128;
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use md5::{Digest, Md5};

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// MD5 over the concatenation of `parts`.
pub fn md5_digest(parts: &[&[u8]]) -> [u8; 16] {
    let mut hasher = Md5::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// MiioCipher holds the AES key and IV derived from a 16-byte device token.
#[derive(Clone)]
pub struct MiioCipher {
    /// MD5(token)
    key: [u8; 16],
    /// MD5(key + token)
    iv: [u8; 16],
}

impl MiioCipher {
    /// Derive the cipher for a 16-byte token.
    pub fn new(token: &[u8; 16]) -> Self {
        let key = md5_digest(&[token.as_slice()]);
        let iv = md5_digest(&[key.as_slice(), token.as_slice()]);
        Self { key, iv }
    }

    /// Encrypt `data`, always appending PKCS7 padding.
    pub fn encrypt(&self, data: &[u8]) -> Vec<u8> {
        Aes128CbcEnc::new(&self.key.into(), &self.iv.into()).encrypt_padded_vec_mut::<Pkcs7>(data)
    }

    /// Decrypt `data` and strip its PKCS7 padding.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.is_empty() || !data.len().is_multiple_of(16) {
            return Err(MiioError::DecryptFailure);
        }
        Aes128CbcDec::new(&self.key.into(), &self.iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(data)
            .map_err(|_| MiioError::DecryptFailure)
    }
}

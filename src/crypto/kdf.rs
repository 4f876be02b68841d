//! Key Derivation Functions
//!
//! Provides the OpenSSL `EVP_BytesToKey` derivation (MD5, one round) used by
//! `openssl enc` and CryptoJS for passphrase-based AES keys.

use super::{IV_LEN, KEY_LEN};
use md5::{Digest, Md5};

/// Key and IV derived from a passphrase and salt
#[derive(Clone, PartialEq, Eq)]
pub struct DerivedKey {
    pub key: [u8; KEY_LEN],
    pub iv: [u8; IV_LEN],
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedKey").finish_non_exhaustive()
    }
}

/// Derive key and IV from passphrase and salt
///
/// `D_0 = ""`, `D_i = MD5(D_{i-1} || passphrase || salt)`; the
/// concatenation `D_1 || D_2 || ...` is split into key then IV.
pub fn bytes_to_key(passphrase: &[u8], salt: &[u8]) -> DerivedKey {
    let mut material = [0u8; KEY_LEN + IV_LEN];
    let mut filled = 0;
    let mut prev: Option<[u8; 16]> = None;

    while filled < material.len() {
        let mut hasher = Md5::new();
        if let Some(block) = prev {
            hasher.update(block);
        }
        hasher.update(passphrase);
        hasher.update(salt);
        let mut block = [0u8; 16];
        block.copy_from_slice(&hasher.finalize());

        let take = std::cmp::min(block.len(), material.len() - filled);
        material[filled..filled + take].copy_from_slice(&block[..take]);
        filled += take;
        prev = Some(block);
    }

    let mut key = [0u8; KEY_LEN];
    let mut iv = [0u8; IV_LEN];
    key.copy_from_slice(&material[..KEY_LEN]);
    iv.copy_from_slice(&material[KEY_LEN..]);

    DerivedKey { key, iv }
}

//! Cryptographic primitives for the destination cipher
//!
//! This module provides:
//! - OpenSSL `enc` compatible AES-256-CBC (salted, PKCS#7)
//! - `EVP_BytesToKey` (MD5) passphrase key derivation
//! - The [`AddressCipher`] seam used by the address cache
//! - Secure random number generation

mod cipher;
mod kdf;

pub use cipher::{
    decrypt, decrypt_base64, encrypt, encrypt_base64, AddressCipher, PassphraseCipher,
};
pub use kdf::{bytes_to_key, DerivedKey};

use thiserror::Error;

/// Length of the AES-256 key in bytes
pub const KEY_LEN: usize = 32;

/// Length of the CBC initialisation vector in bytes
pub const IV_LEN: usize = 16;

/// Length of the embedded salt in bytes
pub const SALT_LEN: usize = 8;

/// AES block size in bytes
pub const BLOCK_LEN: usize = 16;

/// Header preceding the salt in every payload
pub const SALT_MAGIC: &[u8; 8] = b"Salted__";

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid encoding: {0}")]
    InvalidEncoding(String),

    #[error("Missing salt header")]
    MissingSalt,

    #[error("Invalid ciphertext length: {0}")]
    InvalidLength(usize),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),
}

/// Generate cryptographically secure random bytes
pub fn random_bytes(buf: &mut [u8]) {
    use ring::rand::{SecureRandom, SystemRandom};
    let rng = SystemRandom::new();
    rng.fill(buf).expect("Failed to generate random bytes");
}

/// Generate a random salt
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    random_bytes(&mut salt);
    salt
}

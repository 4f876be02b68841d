//! Salted AES-256-CBC encryption/decryption
//!
//! Payload layout is the one produced by `openssl enc -aes-256-cbc -md md5`:
//!
//! ```text
//! "Salted__" | salt (8 bytes) | AES-256-CBC ciphertext (PKCS#7 padded)
//! ```
//!
//! The textual form is the standard base64 encoding of that payload.

use super::{bytes_to_key, generate_salt, CryptoError, BLOCK_LEN, SALT_LEN, SALT_MAGIC};
use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::Engine;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const HEADER_LEN: usize = SALT_MAGIC.len() + SALT_LEN;

/// Decrypts a ciphertext line into a destination address
///
/// Implementations must be safe to call from many connections at once.
pub trait AddressCipher: Send + Sync {
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// [`AddressCipher`] keyed by a shared passphrase
#[derive(Clone)]
pub struct PassphraseCipher {
    passphrase: Vec<u8>,
}

impl PassphraseCipher {
    pub fn new(passphrase: impl Into<Vec<u8>>) -> Self {
        Self {
            passphrase: passphrase.into(),
        }
    }

    /// Encrypt an address into its base64 line form
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        encrypt_base64(&self.passphrase, plaintext)
    }
}

impl AddressCipher for PassphraseCipher {
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        decrypt(&self.passphrase, ciphertext)
    }
}

impl std::fmt::Debug for PassphraseCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PassphraseCipher").finish_non_exhaustive()
    }
}

/// Encrypt with a fresh random salt, returning the raw payload
pub fn encrypt(passphrase: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    encrypt_with_salt(passphrase, &generate_salt(), plaintext)
}

fn encrypt_with_salt(
    passphrase: &[u8],
    salt: &[u8; SALT_LEN],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let derived = bytes_to_key(passphrase, salt);
    let encryptor = Aes256CbcEnc::new_from_slices(&derived.key, &derived.iv)
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;
    let ciphertext = encryptor.encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut payload = Vec::with_capacity(HEADER_LEN + ciphertext.len());
    payload.extend_from_slice(SALT_MAGIC);
    payload.extend_from_slice(salt);
    payload.extend_from_slice(&ciphertext);
    Ok(payload)
}

/// Encrypt and base64-encode
pub fn encrypt_base64(passphrase: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let payload = encrypt(passphrase, plaintext)?;
    Ok(base64::engine::general_purpose::STANDARD
        .encode(payload)
        .into_bytes())
}

/// Decrypt either encoding
///
/// Input starting with the `Salted__` header is taken as a raw payload,
/// anything else as base64 text.
pub fn decrypt(passphrase: &[u8], input: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if input.starts_with(SALT_MAGIC) {
        decrypt_raw(passphrase, input)
    } else {
        decrypt_base64(passphrase, input)
    }
}

/// Decode base64 then decrypt
pub fn decrypt_base64(passphrase: &[u8], input: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let payload = base64::engine::general_purpose::STANDARD
        .decode(input.trim_ascii())
        .map_err(|e| CryptoError::InvalidEncoding(e.to_string()))?;
    decrypt_raw(passphrase, &payload)
}

fn decrypt_raw(passphrase: &[u8], payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if !payload.starts_with(SALT_MAGIC) {
        return Err(CryptoError::MissingSalt);
    }

    let body_len = payload.len().saturating_sub(HEADER_LEN);
    if payload.len() < HEADER_LEN + BLOCK_LEN || body_len % BLOCK_LEN != 0 {
        return Err(CryptoError::InvalidLength(payload.len()));
    }

    let salt = &payload[SALT_MAGIC.len()..HEADER_LEN];
    let derived = bytes_to_key(passphrase, salt);
    let decryptor = Aes256CbcDec::new_from_slices(&derived.key, &derived.iv)
        .map_err(|e| CryptoError::Decryption(e.to_string()))?;

    decryptor
        .decrypt_padded_vec_mut::<Pkcs7>(&payload[HEADER_LEN..])
        .map_err(|_| CryptoError::Decryption("bad padding".to_string()))
}

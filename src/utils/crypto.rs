//! # Frame Cipher
//!
//! Encrypt-then-MAC for binary frames: AES-CBC with PKCS#7 padding under
//! the session encryption key, then HMAC-SHA256 over the ciphertext under
//! the session authentication key.
//!
//! A fresh random IV is generated per frame and travels as the first 16
//! bytes of the ciphertext. The 32-byte tag covers `iv || ciphertext`.
//!
//! `open` always verifies the tag (constant time) before touching the
//! ciphertext. A mismatch is `ProtocolError::FrameAuthFailure` and no
//! plaintext is produced.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{ProtocolError, Result};

/// Length of the authentication tag
pub const AUTH_TAG_LEN: usize = 32;

/// Length of the CBC initialization vector
pub const IV_LEN: usize = 16;

type HmacSha256 = Hmac<Sha256>;

/// Key material supplied by the login layer. Opaque to this crate and
/// never rotated here.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    enc_key: Vec<u8>,
    mac_key: Vec<u8>,
}

impl SessionKeys {
    pub fn new(enc_key: impl Into<Vec<u8>>, mac_key: impl Into<Vec<u8>>) -> Self {
        Self {
            enc_key: enc_key.into(),
            mac_key: mac_key.into(),
        }
    }

    pub fn enc_key(&self) -> &[u8] {
        &self.enc_key
    }

    pub fn mac_key(&self) -> &[u8] {
        &self.mac_key
    }

    /// `seal` with these keys
    pub fn seal(&self, plaintext: &[u8]) -> Result<([u8; AUTH_TAG_LEN], Vec<u8>)> {
        seal(&self.mac_key, &self.enc_key, plaintext)
    }

    /// `open` with these keys
    pub fn open(&self, auth_tag: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        open(&self.mac_key, &self.enc_key, auth_tag, ciphertext)
    }
}

impl fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKeys")
            .field("enc_key", &"<redacted>")
            .field("mac_key", &"<redacted>")
            .finish()
    }
}

/// Encrypt `plaintext` and authenticate the result.
///
/// Returns the 32-byte tag and `iv || ciphertext`.
pub fn seal(mac_key: &[u8], enc_key: &[u8], plaintext: &[u8]) -> Result<([u8; AUTH_TAG_LEN], Vec<u8>)> {
    let mut iv = [0u8; IV_LEN];
    getrandom::fill(&mut iv)
        .map_err(|e| ProtocolError::SecurityError(format!("Failed to generate IV: {e}")))?;

    let encrypted = match enc_key.len() {
        16 => cbc::Encryptor::<aes::Aes128>::new_from_slices(enc_key, &iv)
            .map(|c| c.encrypt_padded_vec_mut::<Pkcs7>(plaintext)),
        24 => cbc::Encryptor::<aes::Aes192>::new_from_slices(enc_key, &iv)
            .map(|c| c.encrypt_padded_vec_mut::<Pkcs7>(plaintext)),
        32 => cbc::Encryptor::<aes::Aes256>::new_from_slices(enc_key, &iv)
            .map(|c| c.encrypt_padded_vec_mut::<Pkcs7>(plaintext)),
        other => return Err(invalid_key_length(other)),
    }
    .map_err(|_| ProtocolError::EncryptionFailure)?;

    let mut ciphertext = Vec::with_capacity(IV_LEN + encrypted.len());
    ciphertext.extend_from_slice(&iv);
    ciphertext.extend_from_slice(&encrypted);

    let mut mac = new_mac(mac_key)?;
    mac.update(&ciphertext);
    Ok((mac.finalize().into_bytes().into(), ciphertext))
}

/// Verify `auth_tag` over `ciphertext`, then decrypt.
pub fn open(mac_key: &[u8], enc_key: &[u8], auth_tag: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let mut mac = new_mac(mac_key)?;
    mac.update(ciphertext);
    mac.verify_slice(auth_tag)
        .map_err(|_| ProtocolError::FrameAuthFailure)?;

    if ciphertext.len() < IV_LEN {
        return Err(ProtocolError::DecryptionFailure);
    }
    let (iv, body) = ciphertext.split_at(IV_LEN);

    match enc_key.len() {
        16 => cbc::Decryptor::<aes::Aes128>::new_from_slices(enc_key, iv)
            .map(|c| c.decrypt_padded_vec_mut::<Pkcs7>(body)),
        24 => cbc::Decryptor::<aes::Aes192>::new_from_slices(enc_key, iv)
            .map(|c| c.decrypt_padded_vec_mut::<Pkcs7>(body)),
        32 => cbc::Decryptor::<aes::Aes256>::new_from_slices(enc_key, iv)
            .map(|c| c.decrypt_padded_vec_mut::<Pkcs7>(body)),
        other => return Err(invalid_key_length(other)),
    }
    .map_err(|_| ProtocolError::DecryptionFailure)?
    .map_err(|_| ProtocolError::DecryptionFailure)
}

fn new_mac(mac_key: &[u8]) -> Result<HmacSha256> {
    <HmacSha256 as Mac>::new_from_slice(mac_key)
        .map_err(|_| ProtocolError::SecurityError("invalid authentication key".into()))
}

fn invalid_key_length(len: usize) -> ProtocolError {
    ProtocolError::SecurityError(format!(
        "encryption key must be 16, 24 or 32 bytes, got {len}"
    ))
}

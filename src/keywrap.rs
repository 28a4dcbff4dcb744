//! Key-wrap layer: create and open authenticated envelopes around the
//! 32-byte data encryption key (DEK).
//!
//! Grounded on the teacher's `wrap_dek`/`unwrap_dek` (`vault/crypto.rs`),
//! generalized to the spec's signature — no AAD parameter, and a
//! `{ciphertext, nonce}` return value instead of returning the ciphertext
//! and letting the caller track the nonce separately.

use crate::primitives::{self, CryptoError, SecretBytes};
use secrecy::ExposeSecret;
use thiserror::Error;

/// Length (bytes) of a wrapped DEK: 32-byte ciphertext + 16-byte tag.
pub const WRAPPED_DEK_LEN: usize = 32 + 16;

#[derive(Debug, Error)]
pub enum KeyWrapError {
    #[error("invalid key length")]
    InvalidKeyLength,

    #[error("invalid ciphertext")]
    InvalidCiphertext,

    #[error("decryption failed")]
    DecryptionFailed,
}

impl From<CryptoError> for KeyWrapError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::InvalidKeyLength => KeyWrapError::InvalidKeyLength,
            CryptoError::InvalidCiphertextLength => KeyWrapError::InvalidCiphertext,
            CryptoError::DecryptionFailed | CryptoError::Rng | CryptoError::InvalidRequestedLength
            | CryptoError::InvalidSaltLength => KeyWrapError::DecryptionFailed,
        }
    }
}

/// An authenticated envelope around a wrapped DEK.
pub struct WrappedKey {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; primitives::NONCE_LEN],
}

/// Generate a fresh 32-byte DEK from the OS CSPRNG.
pub fn generate_dek() -> Result<SecretBytes, KeyWrapError> {
    let bytes = primitives::secure_random(32)?;
    Ok(SecretBytes::from(bytes))
}

/// Wrap `dek` under `kek`. Both must be 32 bytes.
pub fn wrap_key(dek: &SecretBytes, kek: &SecretBytes) -> Result<WrappedKey, KeyWrapError> {
    if kek.expose_secret().len() != primitives::KEY_LEN
        || dek.expose_secret().len() != primitives::KEY_LEN
    {
        return Err(KeyWrapError::InvalidKeyLength);
    }

    let sealed = primitives::encrypt(dek.expose_secret(), kek)?;
    let (nonce_bytes, ciphertext) = sealed.split_at(primitives::NONCE_LEN);
    let mut nonce = [0u8; primitives::NONCE_LEN];
    nonce.copy_from_slice(nonce_bytes);
    Ok(WrappedKey {
        ciphertext: ciphertext.to_vec(),
        nonce,
    })
}

/// Unwrap a DEK previously produced by [`wrap_key`]. The error kind never
/// distinguishes "wrong KEK" from "corrupted envelope" (oracle-avoidance).
pub fn unwrap_key(
    wrapped_ciphertext: &[u8],
    nonce: &[u8; primitives::NONCE_LEN],
    kek: &SecretBytes,
) -> Result<SecretBytes, KeyWrapError> {
    if kek.expose_secret().len() != primitives::KEY_LEN {
        return Err(KeyWrapError::InvalidKeyLength);
    }
    if wrapped_ciphertext.len() != WRAPPED_DEK_LEN {
        return Err(KeyWrapError::InvalidCiphertext);
    }

    let mut sealed = Vec::with_capacity(primitives::NONCE_LEN + wrapped_ciphertext.len());
    sealed.extend_from_slice(nonce);
    sealed.extend_from_slice(wrapped_ciphertext);

    let dek_bytes = primitives::decrypt(&sealed, kek)?;
    Ok(SecretBytes::from(dek_bytes))
}

/// Generate a fresh DEK and wrap it under both the password KEK and the
/// recovery KEK in one step, with independent nonces. If wrapping under
/// either KEK fails, the generated DEK is zeroed before the error is
/// returned.
pub fn generate_and_wrap_dek(
    password_kek: &SecretBytes,
    recovery_kek: &SecretBytes,
) -> Result<(SecretBytes, WrappedKey, WrappedKey), KeyWrapError> {
    let dek = generate_dek()?;

    let password_wrapped = match wrap_key(&dek, password_kek) {
        Ok(w) => w,
        Err(e) => return Err(e),
    };
    let recovery_wrapped = match wrap_key(&dek, recovery_kek) {
        Ok(w) => w,
        Err(e) => return Err(e),
    };

    Ok((dek, password_wrapped, recovery_wrapped))
}

//! Cryptographic building blocks for the vault core.
//!
//! Thin, auditable wrappers over well-defined algorithms with strict
//! length checks and constant-time clearing. Nothing above this layer
//! should reach for `aes_gcm`, `pbkdf2`, or `hmac` directly — every
//! higher layer goes through these functions so the algorithm choices
//! live in exactly one place.
//!
//! - KDF: PBKDF2-HMAC-SHA256 derives the password key from the master
//!   password + per-vault salt. (The recovery KDF is Argon2id; that
//!   lives in `recovery`, not here — the two schemes are intentionally
//!   not unified, see spec Non-goals on cryptographic agility.)
//! - AEAD: AES-256-GCM, 12-byte nonce, 16-byte tag. Nonces are drawn
//!   fresh from the CSPRNG for every call; never reuse a `(key, nonce)`
//!   pair.
//! - `clear_bytes` overwrites a buffer such that the write cannot be
//!   optimized away, via `zeroize::Zeroize`.
//!
//! Security foot-guns to avoid:
//! - Never log or print keys, plaintexts, or decrypted secrets.
//! - Treat all returned plaintext as sensitive; keep it in memory only
//!   as long as necessary.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use rand::rngs::OsRng;
use secrecy::{ExposeSecret, SecretSlice};
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroize;

/// Size (bytes) of a key used by `encrypt`/`decrypt` and as a KEK.
pub const KEY_LEN: usize = 32;
/// Size (bytes) of an AES-256-GCM nonce.
pub const NONCE_LEN: usize = 12;
/// Size (bytes) of an AES-256-GCM authentication tag.
pub const TAG_LEN: usize = 16;
/// Minimum ciphertext length `decrypt` will accept (nonce + tag, no data).
pub const MIN_CIPHERTEXT_LEN: usize = NONCE_LEN + TAG_LEN;
/// Minimum salt length `derive_password_key` will accept.
pub const MIN_SALT_LEN: usize = 32;
/// Floor on PBKDF2 iterations; callers may request more, never less.
pub const MIN_PBKDF2_ITERATIONS: u32 = 600_000;

/// Secret bytes held in memory with zeroize-on-drop semantics.
pub type SecretBytes = SecretSlice<u8>;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key length")]
    InvalidKeyLength,

    #[error("invalid salt length")]
    InvalidSaltLength,

    #[error("invalid ciphertext length")]
    InvalidCiphertextLength,

    #[error("requested length must be greater than zero")]
    InvalidRequestedLength,

    #[error("random number generator failure")]
    Rng,

    #[error("decryption failed")]
    DecryptionFailed,
}

/// 32 random bytes from the OS CSPRNG, for use as a KDF salt.
pub fn generate_salt() -> Result<[u8; MIN_SALT_LEN], CryptoError> {
    let mut salt = [0u8; MIN_SALT_LEN];
    OsRng.try_fill_bytes(&mut salt).map_err(|_| CryptoError::Rng)?;
    Ok(salt)
}

/// `n` cryptographically-secure random bytes, `n > 0`.
pub fn secure_random(n: usize) -> Result<Vec<u8>, CryptoError> {
    if n == 0 {
        return Err(CryptoError::InvalidRequestedLength);
    }
    let mut buf = vec![0u8; n];
    OsRng.try_fill_bytes(&mut buf).map_err(|_| CryptoError::Rng)?;
    Ok(buf)
}

/// Derive the password key via PBKDF2-HMAC-SHA256.
///
/// Rejects salts shorter than 32 bytes. `iterations` is floored at
/// [`MIN_PBKDF2_ITERATIONS`] even if the caller asks for fewer — the
/// floor is enforced here and, redundantly, by `Config` validation, so
/// a caller bypassing `Config` still can't weaken the KDF by accident.
pub fn derive_password_key(
    password_bytes: &[u8],
    salt: &[u8],
    iterations: u32,
) -> Result<SecretBytes, CryptoError> {
    if salt.len() < MIN_SALT_LEN {
        return Err(CryptoError::InvalidSaltLength);
    }
    let iterations = iterations.max(MIN_PBKDF2_ITERATIONS);

    let mut out = vec![0u8; KEY_LEN];
    pbkdf2_hmac::<Sha256>(password_bytes, salt, iterations, &mut out);
    Ok(SecretBytes::from(out))
}

/// Encrypt `plaintext` under `key` (must be 32 bytes) with AES-256-GCM.
/// Returns `nonce(12) || ciphertext || tag(16)`.
pub fn encrypt(plaintext: &[u8], key: &SecretBytes) -> Result<Vec<u8>, CryptoError> {
    if key.expose_secret().len() != KEY_LEN {
        return Err(CryptoError::InvalidKeyLength);
    }
    let cipher =
        Aes256Gcm::new_from_slice(key.expose_secret()).map_err(|_| CryptoError::InvalidKeyLength)?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng
        .try_fill_bytes(&mut nonce_bytes)
        .map_err(|_| CryptoError::Rng)?;
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::DecryptionFailed)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a blob produced by [`encrypt`]. Any auth-tag mismatch, length
/// problem, or wrong key collapses into the single `DecryptionFailed`
/// error (no oracle distinction, per spec).
pub fn decrypt(ciphertext: &[u8], key: &SecretBytes) -> Result<Vec<u8>, CryptoError> {
    if key.expose_secret().len() != KEY_LEN {
        return Err(CryptoError::InvalidKeyLength);
    }
    if ciphertext.len() < MIN_CIPHERTEXT_LEN {
        return Err(CryptoError::InvalidCiphertextLength);
    }
    let cipher =
        Aes256Gcm::new_from_slice(key.expose_secret()).map_err(|_| CryptoError::InvalidKeyLength)?;

    let (nonce_bytes, body) = ciphertext.split_at(NONCE_LEN);
    let nonce = Nonce::from_slice(nonce_bytes);

    cipher
        .decrypt(nonce, body)
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// Overwrite `buf` with zeros in a way the optimizer must not elide.
pub fn clear_bytes(buf: &mut [u8]) {
    buf.zeroize();
}

/// HMAC-SHA256 over `data` under `key`.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("HMAC-SHA256 accepts any key length");
    mac.update(data);
    let tag = mac.finalize().into_bytes();
    let mut out = [0u8; 32];
    out.copy_from_slice(&tag);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_password_key_is_deterministic_and_sensitive_to_input() {
        let salt = generate_salt().unwrap();
        let k1 = derive_password_key(b"correct horse battery staple", &salt, 1000).unwrap();
        let k2 = derive_password_key(b"correct horse battery staple", &salt, 1000).unwrap();
        assert_eq!(k1.expose_secret(), k2.expose_secret());

        let k3 = derive_password_key(b"correct horse battery staplf", &salt, 1000).unwrap();
        assert_ne!(k1.expose_secret(), k3.expose_secret());

        let mut other_salt = salt;
        other_salt[0] ^= 1;
        let k4 = derive_password_key(b"correct horse battery staple", &other_salt, 1000).unwrap();
        assert_ne!(k1.expose_secret(), k4.expose_secret());
    }

    #[test]
    fn derive_password_key_rejects_short_salt() {
        let err = derive_password_key(b"pw", &[0u8; 16], 1000).unwrap_err();
        assert!(matches!(err, CryptoError::InvalidSaltLength));
    }

    #[test]
    fn encrypt_decrypt_roundtrip_including_empty_plaintext() {
        let key = SecretBytes::from(vec![7u8; KEY_LEN]);
        for plaintext in [&b""[..], b"hello vault"] {
            let ct = encrypt(plaintext, &key).unwrap();
            let pt = decrypt(&ct, &key).unwrap();
            assert_eq!(pt, plaintext);
        }
    }

    #[test]
    fn encrypt_rejects_wrong_key_length() {
        let key = SecretBytes::from(vec![7u8; 16]);
        let err = encrypt(b"x", &key).unwrap_err();
        assert!(matches!(err, CryptoError::InvalidKeyLength));
    }

    #[test]
    fn decrypt_rejects_short_ciphertext() {
        let key = SecretBytes::from(vec![7u8; KEY_LEN]);
        let err = decrypt(&[0u8; 10], &key).unwrap_err();
        assert!(matches!(err, CryptoError::InvalidCiphertextLength));
    }

    #[test]
    fn decrypt_fails_uniformly_on_tamper_or_wrong_key() {
        let key = SecretBytes::from(vec![7u8; KEY_LEN]);
        let other_key = SecretBytes::from(vec![9u8; KEY_LEN]);
        let mut ct = encrypt(b"payload", &key).unwrap();

        let wrong_key_err = decrypt(&ct, &other_key).unwrap_err();
        assert!(matches!(wrong_key_err, CryptoError::DecryptionFailed));

        let last = ct.len() - 1;
        ct[last] ^= 0x01;
        let tamper_err = decrypt(&ct, &key).unwrap_err();
        assert!(matches!(tamper_err, CryptoError::DecryptionFailed));
    }

    #[test]
    fn nonces_are_unique_across_many_encryptions() {
        let key = SecretBytes::from(vec![1u8; KEY_LEN]);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..100 {
            let ct = encrypt(b"same plaintext", &key).unwrap();
            let nonce = ct[..NONCE_LEN].to_vec();
            assert!(seen.insert(nonce), "nonce reused across encryptions");
        }
        assert_eq!(seen.len(), 100);
    }

    #[test]
    fn secure_random_rejects_zero_and_returns_requested_length() {
        assert!(matches!(
            secure_random(0).unwrap_err(),
            CryptoError::InvalidRequestedLength
        ));
        for n in [1usize, 16, 256, 10_000] {
            let bytes = secure_random(n).unwrap();
            assert_eq!(bytes.len(), n);
        }
    }

    #[test]
    fn secure_random_is_not_constant() {
        let a = secure_random(32).unwrap();
        let b = secure_random(32).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn clear_bytes_zeroes_the_buffer() {
        let mut buf = vec![0xAAu8; 64];
        clear_bytes(&mut buf);
        assert!(buf.iter().all(|b| *b == 0));
    }

    #[test]
    fn hmac_sha256_is_deterministic_and_key_sensitive() {
        let tag1 = hmac_sha256(b"key-one", b"data");
        let tag2 = hmac_sha256(b"key-one", b"data");
        assert_eq!(tag1, tag2);

        let tag3 = hmac_sha256(b"key-two", b"data");
        assert_ne!(tag1, tag3);
    }

    #[test]
    fn derive_password_key_respects_the_600k_iteration_time_budget() {
        let salt = generate_salt().unwrap();
        let start = std::time::Instant::now();
        let _ = derive_password_key(b"correct horse battery staple", &salt, MIN_PBKDF2_ITERATIONS).unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed > std::time::Duration::from_millis(10), "derivation was suspiciously fast: {elapsed:?}");
        assert!(elapsed < std::time::Duration::from_secs(5), "derivation was too slow: {elapsed:?}");
    }

    #[test]
    fn password_kek_is_zeroed_after_drop() {
        let salt = generate_salt().unwrap();
        let key = derive_password_key(b"correct horse battery staple", &salt, MIN_PBKDF2_ITERATIONS).unwrap();
        let ptr = key.expose_secret().as_ptr();
        let len = key.expose_secret().len();
        drop(key);
        let after = unsafe { std::slice::from_raw_parts(ptr, len) };
        assert!(after.iter().all(|b| *b == 0));
    }
}

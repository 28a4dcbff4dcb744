//! BIP-39 mnemonic handling and the recovery KEK derivation pipeline.
//!
//! Grounded on the teacher's `vault::crypto` module for the general shape
//! of a KDF-params struct stored alongside the vault (`KdfParams` there,
//! `RecoveryKdfParams` here) and its "parameters are policy, not truth;
//! read them from the header, never re-derive from constants" doc note.
//! The mnemonic/wordlist plumbing itself comes from the `bip39` crate,
//! the corpus's standard choice for this (see e.g. the wallet manifests
//! that depend on it for key material).

use crate::primitives::{self, CryptoError, SecretBytes};
use bip39::{Language, Mnemonic};
use rand::Rng;
use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use secrecy::ExposeSecret;
use std::collections::HashSet;
use thiserror::Error;
use zeroize::Zeroizing;

/// Number of words in a full mnemonic.
pub const MNEMONIC_WORD_COUNT: usize = 24;
/// Number of challenge words required for a working recovery phrase.
pub const CHALLENGE_WORD_COUNT: usize = 6;
/// Number of stored (encrypted-at-rest) words.
pub const STORED_WORD_COUNT: usize = MNEMONIC_WORD_COUNT - CHALLENGE_WORD_COUNT;
/// Challenge-word count used only to verify the user has written the
/// phrase down, distinct from the 6-word recovery challenge.
pub const VERIFICATION_WORD_COUNT: usize = 3;

const DOMAIN_RECOVERY_KEK: &[u8] = b"passcore/recovery/v1/kek";
const DOMAIN_STORED_WORDS_KEY: &[u8] = b"passcore/recovery/v1/stored-words-key";

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("invalid mnemonic")]
    InvalidMnemonic,

    #[error("invalid word or position count")]
    InvalidCount,

    #[error("challenge count must be in (0, total]")]
    InvalidChallengeCount,

    #[error("argon2 error")]
    Argon2(#[from] argon2::Error),

    #[error("random number generator failure")]
    Rng,
}

impl From<CryptoError> for RecoveryError {
    fn from(_: CryptoError) -> Self {
        RecoveryError::Rng
    }
}

/// Argon2id tuning parameters for the two recovery-layer derivations.
/// Persisted in `RecoveryMetadata` and read back at unlock time — never
/// re-derived from these defaults, so a vault keeps working if the
/// defaults are retuned later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryKdfParams {
    pub time: u32,
    pub memory_kib: u32,
    pub parallelism: u32,
    pub salt_challenge: [u8; 16],
    pub salt_recovery: [u8; 16],
}

impl RecoveryKdfParams {
    /// Generate fresh random salts with the recommended work factors.
    pub fn generate() -> Result<Self, RecoveryError> {
        let mut salt_challenge = [0u8; 16];
        let mut salt_recovery = [0u8; 16];
        salt_challenge.copy_from_slice(&primitives::secure_random(16)?);
        salt_recovery.copy_from_slice(&primitives::secure_random(16)?);
        Ok(Self {
            time: 1,
            memory_kib: 64 * 1024,
            parallelism: 4,
            salt_challenge,
            salt_recovery,
        })
    }

    fn argon2(&self) -> Result<argon2::Argon2<'static>, RecoveryError> {
        let params = argon2::Params::new(self.memory_kib, self.time, self.parallelism, Some(32))?;
        Ok(argon2::Argon2::new(
            argon2::Algorithm::Argon2id,
            argon2::Version::V0x13,
            params,
        ))
    }
}

/// Generate a fresh 24-word BIP-39 English mnemonic from 256 bits of
/// CSPRNG entropy (the standard checksum is computed by `bip39`).
pub fn generate_mnemonic() -> Result<Zeroizing<String>, RecoveryError> {
    let entropy = primitives::secure_random(32)?;
    let mnemonic = Mnemonic::from_entropy_in(Language::English, &entropy)
        .map_err(|_| RecoveryError::InvalidMnemonic)?;
    Ok(Zeroizing::new(mnemonic.to_string()))
}

/// Whitespace-normalize, lower-case, and validate a candidate mnemonic:
/// every word must be in the BIP-39 English wordlist and the checksum
/// must verify.
pub fn validate_mnemonic(text: &str) -> Result<(), RecoveryError> {
    let normalized = normalize_phrase(text);
    Mnemonic::parse_in_normalized(Language::English, &normalized)
        .map(|_| ())
        .map_err(|_| RecoveryError::InvalidMnemonic)
}

fn normalize_phrase(text: &str) -> String {
    text.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Sample `count` distinct indices in `[0, total)` via rejection sampling
/// from the CSPRNG, returned sorted ascending.
pub fn select_challenge_positions(
    total: usize,
    count: usize,
) -> Result<Vec<usize>, RecoveryError> {
    if count == 0 || count > total {
        return Err(RecoveryError::InvalidChallengeCount);
    }

    let mut chosen = HashSet::with_capacity(count);
    let mut rng = OsRng;
    while chosen.len() < count {
        let candidate = rng.gen_range(0..total);
        chosen.insert(candidate);
    }

    let mut positions: Vec<usize> = chosen.into_iter().collect();
    positions.sort_unstable();
    Ok(positions)
}

/// Return a shuffled copy of `positions` for presentation order only.
///
/// This is the one place in the crate where cryptographic randomness is
/// *not* required: the shuffle only affects the order challenge words
/// are prompted for during recovery, never which indices are secret or
/// how they're stored. Using `rand::thread_rng()` here (rather than
/// `OsRng`) is intentional and documented per spec, not an oversight.
pub fn shuffle_challenge_positions(positions: &[usize]) -> Vec<usize> {
    let mut copy = positions.to_vec();
    copy.shuffle(&mut rand::thread_rng());
    copy
}

/// Split a 24-word mnemonic into its 6 challenge words (in the order
/// dictated by `challenge_positions`, which must already be sorted) and
/// its 18 stored words (remaining indices, in original order).
pub fn split_words(
    mnemonic: &str,
    challenge_positions: &[usize],
) -> Result<(Vec<Zeroizing<String>>, Vec<Zeroizing<String>>), RecoveryError> {
    let words: Vec<&str> = mnemonic.split_whitespace().collect();
    if words.len() != MNEMONIC_WORD_COUNT || challenge_positions.len() != CHALLENGE_WORD_COUNT {
        return Err(RecoveryError::InvalidCount);
    }

    let challenge_set: HashSet<usize> = challenge_positions.iter().copied().collect();
    if challenge_set.len() != CHALLENGE_WORD_COUNT
        || challenge_positions.iter().any(|&p| p >= MNEMONIC_WORD_COUNT)
    {
        return Err(RecoveryError::InvalidCount);
    }

    let challenge_words = challenge_positions
        .iter()
        .map(|&p| Zeroizing::new(words[p].to_string()))
        .collect();
    let stored_words = (0..MNEMONIC_WORD_COUNT)
        .filter(|i| !challenge_set.contains(i))
        .map(|i| Zeroizing::new(words[i].to_string()))
        .collect();

    Ok((challenge_words, stored_words))
}

/// Reassemble a 24-word mnemonic from its challenge and stored words.
pub fn reconstruct_mnemonic(
    challenge_words: &[String],
    challenge_positions: &[usize],
    stored_words: &[String],
) -> Result<Zeroizing<String>, RecoveryError> {
    if challenge_words.len() != CHALLENGE_WORD_COUNT
        || stored_words.len() != STORED_WORD_COUNT
        || challenge_positions.len() != CHALLENGE_WORD_COUNT
    {
        return Err(RecoveryError::InvalidCount);
    }

    let challenge_set: HashSet<usize> = challenge_positions.iter().copied().collect();
    if challenge_set.len() != CHALLENGE_WORD_COUNT
        || challenge_positions.iter().any(|&p| p >= MNEMONIC_WORD_COUNT)
    {
        return Err(RecoveryError::InvalidCount);
    }

    let mut slots: Vec<Option<&str>> = vec![None; MNEMONIC_WORD_COUNT];
    for (word, &pos) in challenge_words.iter().zip(challenge_positions) {
        slots[pos] = Some(word.as_str());
    }
    let mut stored_iter = stored_words.iter();
    for slot in slots.iter_mut() {
        if slot.is_none() {
            slot.replace(stored_iter.next().ok_or(RecoveryError::InvalidCount)?.as_str());
        }
    }

    let phrase = slots
        .into_iter()
        .map(|w| w.ok_or(RecoveryError::InvalidCount))
        .collect::<Result<Vec<_>, _>>()?
        .join(" ");
    Ok(Zeroizing::new(phrase))
}

/// Derive the recovery KEK from the full mnemonic plus an optional
/// passphrase (the "25th word"). The passphrase is mixed in with
/// explicit domain separation (length-prefixed framing), never as an
/// inline suffix that could collide with a legitimate word boundary.
pub fn derive_recovery_kek(
    mnemonic: &str,
    passphrase: Option<&str>,
    kdf_params: &RecoveryKdfParams,
) -> Result<SecretBytes, RecoveryError> {
    let input = domain_separated_input(DOMAIN_RECOVERY_KEK, mnemonic.as_bytes(), passphrase);
    let argon2 = kdf_params.argon2()?;

    let mut out = vec![0u8; 32];
    argon2.hash_password_into(&input, &kdf_params.salt_recovery, &mut out)?;
    Ok(SecretBytes::from(out))
}

/// Derive the key used to AEAD-encrypt the 18 stored words, from the 6
/// challenge words the user supplies during recovery.
pub fn derive_stored_words_key(
    challenge_words: &[String],
    kdf_params: &RecoveryKdfParams,
) -> Result<SecretBytes, RecoveryError> {
    let joined = challenge_words.join(" ");
    let input = domain_separated_input(DOMAIN_STORED_WORDS_KEY, joined.as_bytes(), None);
    let argon2 = kdf_params.argon2()?;

    let mut out = vec![0u8; 32];
    argon2.hash_password_into(&input, &kdf_params.salt_challenge, &mut out)?;
    Ok(SecretBytes::from(out))
}

fn domain_separated_input(domain: &[u8], primary: &[u8], passphrase: Option<&str>) -> Zeroizing<Vec<u8>> {
    let mut buf = Vec::with_capacity(domain.len() + primary.len() + 64);
    buf.extend_from_slice(&(domain.len() as u32).to_le_bytes());
    buf.extend_from_slice(domain);
    buf.extend_from_slice(&(primary.len() as u32).to_le_bytes());
    buf.extend_from_slice(primary);
    let passphrase_bytes = passphrase.map(str::as_bytes).unwrap_or(&[]);
    buf.extend_from_slice(&(passphrase_bytes.len() as u32).to_le_bytes());
    buf.extend_from_slice(passphrase_bytes);
    Zeroizing::new(buf)
}

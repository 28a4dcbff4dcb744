//! The keychain capability: an opaque key-value store the vault layer
//! leans on for two things it must never hold in an on-disk file in
//! plaintext — the master password (so a CLI can skip re-prompting) and
//! the per-vault audit HMAC key.
//!
//! Grounded on the `keyring`-crate usage pattern in the corpus (e.g. the
//! boternity vault's `from_keychain`/`set_password` pairing); generalized
//! here to the small trait interface spec.md defines at the vault
//! boundary, with a `NullKeychain` fallback so the core never hard-requires
//! an OS credential store.

use thiserror::Error;
use zeroize::Zeroize;

pub const SERVICE_MASTER_PASSWORD: &str = "pass-cli";
pub const SERVICE_AUDIT_KEY: &str = "pass-cli-audit";

pub fn master_password_account(vault_id: &str) -> String {
    format!("master-password-{vault_id}")
}

pub fn legacy_master_password_account() -> &'static str {
    "master-password"
}

pub fn audit_key_account(vault_id: &str) -> String {
    format!("audit-key-{vault_id}")
}

#[derive(Debug, Error)]
pub enum KeychainError {
    #[error("keychain capability is unavailable")]
    Unavailable,

    #[error("no entry found for this service/account")]
    NoEntry,

    #[error("keychain backend error: {0}")]
    Backend(String),
}

/// Opaque key-value store consumed by the vault layer. `secret_bytes` in
/// and out are plain `Vec<u8>` by design: callers are responsible for
/// zeroing anything sensitive they receive back.
pub trait Keychain {
    fn is_available(&self) -> bool;
    fn store(&self, service: &str, account: &str, secret_bytes: &[u8]) -> Result<(), KeychainError>;
    fn retrieve(&self, service: &str, account: &str) -> Result<Vec<u8>, KeychainError>;
    fn delete(&self, service: &str, account: &str) -> Result<(), KeychainError>;
}

/// Always-unavailable keychain. The default: the core must tolerate
/// `is_available() == false` by falling back to interactive prompts and
/// by refusing to enable audit (the HMAC key has nowhere safe to live).
#[derive(Debug, Default, Clone, Copy)]
pub struct NullKeychain;

impl Keychain for NullKeychain {
    fn is_available(&self) -> bool {
        false
    }

    fn store(&self, _service: &str, _account: &str, _secret_bytes: &[u8]) -> Result<(), KeychainError> {
        Err(KeychainError::Unavailable)
    }

    fn retrieve(&self, _service: &str, _account: &str) -> Result<Vec<u8>, KeychainError> {
        Err(KeychainError::Unavailable)
    }

    fn delete(&self, _service: &str, _account: &str) -> Result<(), KeychainError> {
        Err(KeychainError::Unavailable)
    }
}

/// OS-native credential store, backed by the `keyring` crate. Secret
/// bytes are stored as a base64 string since `keyring` stores strings,
/// not arbitrary bytes.
#[cfg(feature = "keychain")]
#[derive(Debug, Default, Clone, Copy)]
pub struct OsKeychain;

#[cfg(feature = "keychain")]
impl Keychain for OsKeychain {
    fn is_available(&self) -> bool {
        // A cheap round-trip against a throwaway entry is the only
        // reliable way to probe backend availability; `keyring` has no
        // separate capability check.
        keyring::Entry::new(SERVICE_MASTER_PASSWORD, "pass-cli-availability-probe").is_ok()
    }

    fn store(&self, service: &str, account: &str, secret_bytes: &[u8]) -> Result<(), KeychainError> {
        use base64::Engine as _;
        let entry = keyring::Entry::new(service, account).map_err(backend_err)?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(secret_bytes);
        entry.set_password(&encoded).map_err(backend_err)
    }

    fn retrieve(&self, service: &str, account: &str) -> Result<Vec<u8>, KeychainError> {
        use base64::Engine as _;
        let entry = keyring::Entry::new(service, account).map_err(backend_err)?;
        let encoded = match entry.get_password() {
            Ok(value) => value,
            Err(keyring::Error::NoEntry) => return Err(KeychainError::NoEntry),
            Err(err) => return Err(backend_err(err)),
        };
        let mut decoded = base64::engine::general_purpose::STANDARD
            .decode(&encoded)
            .map_err(|e| KeychainError::Backend(e.to_string()))?;
        let result = decoded.clone();
        decoded.zeroize();
        Ok(result)
    }

    fn delete(&self, service: &str, account: &str) -> Result<(), KeychainError> {
        let entry = keyring::Entry::new(service, account).map_err(backend_err)?;
        match entry.delete_credential() {
            Ok(()) => Ok(()),
            Err(keyring::Error::NoEntry) => Ok(()),
            Err(err) => Err(backend_err(err)),
        }
    }
}

#[cfg(feature = "keychain")]
fn backend_err(err: keyring::Error) -> KeychainError {
    KeychainError::Backend(err.to_string())
}

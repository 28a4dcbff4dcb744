//! The flat error taxonomy the vault boundary exposes to callers.
//!
//! Lower layers (`primitives`, `keywrap`, `recovery`, `storage`) each have
//! their own `thiserror` enum. None of those are re-exported directly:
//! `vault::ops` maps every lower-layer error into one of the variants
//! below so that, per spec, "the vault never exposes low-level messages
//! that could leak oracle information". In particular `InvalidPassword`
//! and `InvalidRecovery` never distinguish "wrong secret" from
//! "corrupted data" in their `Display` output.

use thiserror::Error;

/// The only error type the vault orchestration layer returns.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("unlock failed (wrong password or vault corrupted)")]
    InvalidPassword,

    #[error("recovery failed (wrong words, wrong passphrase, or vault corrupted)")]
    InvalidRecovery,

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("unsupported vault version {0}")]
    UnsupportedVersion(u32),

    #[error("io error: {0}")]
    IOError(#[from] std::io::Error),

    #[error("keychain unavailable")]
    KeychainUnavailable,

    #[error("audit log error: {0}")]
    AuditError(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl CoreError {
    /// Exit-code classification for a CLI collaborator (spec §6): 1 for a
    /// user mistake, 2 for a system-level problem. The core never returns
    /// `ExitCode` itself — this is a convenience so a caller doesn't have
    /// to re-derive the same mapping at every call site.
    pub fn user_facing_exit_code(&self) -> u8 {
        match self {
            CoreError::InvalidArgument(_)
            | CoreError::InvalidPassword
            | CoreError::InvalidRecovery
            | CoreError::Cancelled => 1,
            CoreError::DecryptionFailed
            | CoreError::UnsupportedVersion(_)
            | CoreError::IOError(_)
            | CoreError::KeychainUnavailable
            | CoreError::AuditError(_) => 2,
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

impl From<crate::primitives::CryptoError> for CoreError {
    fn from(err: crate::primitives::CryptoError) -> Self {
        use crate::primitives::CryptoError;
        match err {
            CryptoError::DecryptionFailed => CoreError::DecryptionFailed,
            CryptoError::InvalidKeyLength => CoreError::InvalidArgument("invalid key length"),
            CryptoError::InvalidSaltLength => CoreError::InvalidArgument("invalid salt length"),
            CryptoError::InvalidCiphertextLength => {
                CoreError::InvalidArgument("invalid ciphertext length")
            }
            CryptoError::InvalidRequestedLength => {
                CoreError::InvalidArgument("requested length must be greater than zero")
            }
            CryptoError::Rng => CoreError::IOError(std::io::Error::other("rng failure")),
        }
    }
}

impl From<crate::keywrap::KeyWrapError> for CoreError {
    fn from(err: crate::keywrap::KeyWrapError) -> Self {
        use crate::keywrap::KeyWrapError;
        match err {
            KeyWrapError::DecryptionFailed => CoreError::DecryptionFailed,
            KeyWrapError::InvalidKeyLength => CoreError::InvalidArgument("invalid key length"),
            KeyWrapError::InvalidCiphertext => {
                CoreError::InvalidArgument("invalid wrapped-key ciphertext")
            }
        }
    }
}

impl From<crate::recovery::RecoveryError> for CoreError {
    fn from(err: crate::recovery::RecoveryError) -> Self {
        use crate::recovery::RecoveryError;
        match err {
            RecoveryError::InvalidMnemonic => CoreError::InvalidRecovery,
            RecoveryError::InvalidCount | RecoveryError::InvalidChallengeCount => {
                CoreError::InvalidArgument("invalid recovery word or position count")
            }
            RecoveryError::Argon2(e) => CoreError::IOError(std::io::Error::other(e.to_string())),
            RecoveryError::Rng => CoreError::IOError(std::io::Error::other("rng failure")),
        }
    }
}

impl From<crate::storage::StorageError> for CoreError {
    fn from(err: crate::storage::StorageError) -> Self {
        use crate::storage::StorageError;
        match err {
            StorageError::Io(e) => CoreError::IOError(e),
            StorageError::UnsupportedVersion(v) => CoreError::UnsupportedVersion(v),
            StorageError::Serde(e) => {
                CoreError::IOError(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
            }
            StorageError::NoParentDir | StorageError::LockFailed | StorageError::UnsupportedPlatform => {
                CoreError::IOError(std::io::Error::other(err.to_string()))
            }
        }
    }
}

impl From<crate::vault::credential::CredentialStoreError> for CoreError {
    fn from(err: crate::vault::credential::CredentialStoreError) -> Self {
        use crate::vault::credential::CredentialStoreError;
        match err {
            CredentialStoreError::NotFound(_) => {
                CoreError::InvalidArgument("no credential found for the given service")
            }
            CredentialStoreError::AlreadyExists(_) => {
                CoreError::InvalidArgument("a credential for this service already exists")
            }
            CredentialStoreError::EmptyServiceName => {
                CoreError::InvalidArgument("service name must not be empty")
            }
        }
    }
}

impl From<crate::keychain::KeychainError> for CoreError {
    fn from(_: crate::keychain::KeychainError) -> Self {
        CoreError::KeychainUnavailable
    }
}

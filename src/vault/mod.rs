pub mod credential;
mod ops;

pub use credential::{Credential, CredentialMetadata, CredentialStore, CredentialStoreError, UsageRecord};
pub use ops::{LockedVault, UnlockedVault};

//! Cryptographic vault core for a local, single-user password manager.
//!
//! This crate is the engine, not the application: no command-line
//! parsing, no terminal UI, no config-file loading. A thin collaborator
//! builds a [`config::Config`], picks a [`keychain::Keychain`]
//! implementation, and drives the [`vault::LockedVault`] /
//! [`vault::UnlockedVault`] state machine.

pub mod audit;
pub mod config;
pub mod error;
pub mod keychain;
pub mod keywrap;
pub mod primitives;
pub mod recovery;
pub mod storage;
pub mod vault;

pub use error::{CoreError, CoreResult};
pub use vault::{Credential, CredentialMetadata, LockedVault, UnlockedVault};

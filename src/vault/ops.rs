//! Single coherent API over primitives, key-wrap, recovery, storage, and
//! audit: the vault state machine.
//!
//! Grounded on the teacher's `vault::ops` for the shape of the
//! operations (`vault_init_v1`, `vault_add_item_v1`, ...), but the
//! "methods on a free-standing module" structure is replaced with an
//! ownership-encoded state machine per spec — `LockedVault` has no
//! credential-level capabilities, `UnlockedVault` holds the working key
//! and the decrypted store and is the only place those operations live.

use crate::audit::{self, AuditEvent, AuditLogger, AuditOutcome};
use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::keychain::{self, Keychain};
use crate::keywrap;
use crate::primitives::{self, SecretBytes};
use crate::recovery::{self, RecoveryKdfParams};
use crate::storage::{self, EncryptedVault, MetaSidecar, RecoveryMetadata, VaultMetadata};
use crate::vault::credential::{Credential, CredentialMetadata, CredentialStore};
use secrecy::ExposeSecret;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use zeroize::Zeroizing;

/// A vault that exists on disk but has no key material in memory. Only
/// the operations that don't require the credential store live here.
pub struct LockedVault {
    dir: PathBuf,
    vault_id: String,
    keychain: Arc<dyn Keychain>,
}

/// A vault whose working key is resolved and whose credential store is
/// decrypted in memory. Exclusive owner of both for as long as this
/// value lives; dropping or calling `lock` zeroes them.
pub struct UnlockedVault {
    dir: PathBuf,
    vault_id: String,
    keychain: Arc<dyn Keychain>,
    metadata: VaultMetadata,
    sidecar: MetaSidecar,
    working_key: SecretBytes,
    store: CredentialStore,
    audit: Option<AuditLogger>,
}

fn vault_file(dir: &Path) -> PathBuf {
    storage::vault_path_in(dir)
}

fn sidecar_file(dir: &Path) -> PathBuf {
    storage::sidecar_path_in(dir)
}

fn default_audit_path(dir: &Path) -> String {
    dir.join(storage::DEFAULT_AUDIT_FILE_NAME)
        .to_string_lossy()
        .into_owned()
}

fn encrypt_store(store: &CredentialStore, key: &SecretBytes) -> CoreResult<Vec<u8>> {
    let plaintext = serde_json::to_vec(store)
        .map_err(|e| CoreError::IOError(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
    Ok(primitives::encrypt(&plaintext, key)?)
}

fn decrypt_store(data: &[u8], key: &SecretBytes) -> CoreResult<CredentialStore> {
    let plaintext = primitives::decrypt(data, key).map_err(|_| CoreError::InvalidPassword)?;
    serde_json::from_slice(&plaintext)
        .map_err(|e| CoreError::IOError(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))
}

/// Generate a fresh audit HMAC key, hand it to the keychain, and open a
/// logger at the configured path. Returns `Ok(None)` if auditing wasn't
/// requested; fails with `KeychainUnavailable` if it was requested but
/// the keychain can't hold the key.
fn enable_audit(
    dir: &Path,
    vault_id: &str,
    enable_audit: bool,
    audit_log_path: &str,
    keychain: &dyn Keychain,
) -> CoreResult<Option<AuditLogger>> {
    if !enable_audit {
        return Ok(None);
    }
    if !keychain.is_available() {
        return Err(CoreError::KeychainUnavailable);
    }

    let mut key = primitives::secure_random(audit::AUDIT_KEY_LEN)?;
    keychain.store(
        keychain::SERVICE_AUDIT_KEY,
        &keychain::audit_key_account(vault_id),
        &key,
    )?;

    let path = resolve_audit_path(dir, audit_log_path);
    let logger = AuditLogger::open(&path, &key)
        .map_err(|e| CoreError::AuditError(e.to_string()))?;
    primitives::clear_bytes(&mut key);
    Ok(Some(logger))
}

fn resolve_audit_path(dir: &Path, audit_log_path: &str) -> PathBuf {
    let p = Path::new(audit_log_path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        dir.join(p)
    }
}

fn open_audit_logger(
    dir: &Path,
    vault_id: &str,
    sidecar: &MetaSidecar,
    keychain: &dyn Keychain,
) -> Option<AuditLogger> {
    if !sidecar.audit_enabled {
        return None;
    }
    let mut key = keychain
        .retrieve(keychain::SERVICE_AUDIT_KEY, &keychain::audit_key_account(vault_id))
        .ok()?;
    let path = resolve_audit_path(dir, &sidecar.audit_log_path);
    let logger = AuditLogger::open(&path, &key).ok();
    primitives::clear_bytes(&mut key);
    logger
}

impl LockedVault {
    /// A handle on a vault directory that may or may not exist yet.
    /// Construction performs no I/O.
    pub fn at(dir: impl Into<PathBuf>, vault_id: impl Into<String>, keychain: Arc<dyn Keychain>) -> Self {
        Self {
            dir: dir.into(),
            vault_id: vault_id.into(),
            keychain,
        }
    }

    pub fn vault_id(&self) -> &str {
        &self.vault_id
    }

    /// Create a version-1 (password-only, recovery non-functional) vault
    /// with an empty credential store.
    pub fn initialize(
        dir: impl Into<PathBuf>,
        vault_id: impl Into<String>,
        password: &[u8],
        config: &Config,
        keychain: Arc<dyn Keychain>,
    ) -> CoreResult<Self> {
        let dir = dir.into();
        let vault_id = vault_id.into();
        let config = config.clone_normalized();

        let salt = primitives::generate_salt()?;
        let password_kek = primitives::derive_password_key(password, &salt, config.iterations)?;
        let data = encrypt_store(&CredentialStore::new(), &password_kek)?;

        storage::save_vault(
            &vault_file(&dir),
            &EncryptedVault {
                metadata: VaultMetadata::new_v1(salt, config.iterations),
                data,
            },
        )?;

        let audit_log_path = config
            .audit_log_path
            .clone()
            .unwrap_or_else(|| default_audit_path(&dir));
        let mut logger = enable_audit(&dir, &vault_id, config.enable_audit, &audit_log_path, keychain.as_ref())?;

        storage::save_sidecar(
            &sidecar_file(&dir),
            &MetaSidecar {
                version: "1".to_string(),
                keychain_enabled: false,
                audit_enabled: logger.is_some(),
                audit_log_path,
                vault_id: vault_id.clone(),
                recovery: None,
            },
        )?;

        if let Some(logger) = logger.as_mut() {
            let _ = logger.append(AuditEvent::VaultInit, AuditOutcome::Success, "");
        }

        Ok(Self { dir, vault_id, keychain })
    }

    /// Create a version-2 vault: a fresh 24-word mnemonic protects a
    /// recovery KEK that, together with the password KEK, wraps a single
    /// DEK. Returns the mnemonic for one-time display to the user.
    pub fn initialize_with_recovery(
        dir: impl Into<PathBuf>,
        vault_id: impl Into<String>,
        password: &[u8],
        passphrase: Option<&str>,
        config: &Config,
        keychain: Arc<dyn Keychain>,
    ) -> CoreResult<(Self, Zeroizing<String>)> {
        let dir = dir.into();
        let vault_id = vault_id.into();
        let config = config.clone_normalized();

        let salt = primitives::generate_salt()?;
        let password_kek = primitives::derive_password_key(password, &salt, config.iterations)?;

        let mnemonic = recovery::generate_mnemonic()?;
        let challenge_positions =
            recovery::select_challenge_positions(recovery::MNEMONIC_WORD_COUNT, recovery::CHALLENGE_WORD_COUNT)?;
        let (challenge_words, stored_words) = recovery::split_words(&mnemonic, &challenge_positions)?;
        let challenge_strings: Vec<String> = challenge_words.iter().map(|w| w.to_string()).collect();
        let stored_strings: Vec<String> = stored_words.iter().map(|w| w.to_string()).collect();

        let kdf_params = config.recovery_kdf_params()?;
        let stored_words_key = recovery::derive_stored_words_key(&challenge_strings, &kdf_params)?;
        let stored_words_plaintext = serde_json::to_vec(&stored_strings).map_err(|e| {
            CoreError::IOError(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;
        let encrypted_stored_words = primitives::encrypt(&stored_words_plaintext, &stored_words_key)?;
        let (nonce_stored, encrypted_stored_words) = split_nonce(&encrypted_stored_words);

        let recovery_kek = recovery::derive_recovery_kek(&mnemonic, passphrase, &kdf_params)?;
        let (dek, password_wrapped, recovery_wrapped) =
            keywrap::generate_and_wrap_dek(&password_kek, &recovery_kek)?;

        let data = encrypt_store(&CredentialStore::new(), &dek)?;

        storage::save_vault(
            &vault_file(&dir),
            &EncryptedVault {
                metadata: VaultMetadata::new_v2(
                    salt,
                    config.iterations,
                    to_array_48(&password_wrapped.ciphertext),
                    password_wrapped.nonce,
                ),
                data,
            },
        )?;

        let audit_log_path = config
            .audit_log_path
            .clone()
            .unwrap_or_else(|| default_audit_path(&dir));
        let mut logger = enable_audit(&dir, &vault_id, config.enable_audit, &audit_log_path, keychain.as_ref())?;

        storage::save_sidecar(
            &sidecar_file(&dir),
            &MetaSidecar {
                version: "2".to_string(),
                keychain_enabled: false,
                audit_enabled: logger.is_some(),
                audit_log_path,
                vault_id: vault_id.clone(),
                recovery: Some(RecoveryMetadata {
                    enabled: true,
                    version: "2".to_string(),
                    passphrase_required: passphrase.is_some(),
                    challenge_positions,
                    kdf_params: kdf_params.into(),
                    encrypted_stored_words,
                    nonce_stored,
                    encrypted_recovery_key: Some(to_array_48(&recovery_wrapped.ciphertext)),
                    nonce_recovery: Some(recovery_wrapped.nonce),
                }),
            },
        )?;

        if let Some(logger) = logger.as_mut() {
            let _ = logger.append(AuditEvent::VaultInit, AuditOutcome::Success, "");
        }

        drop(dek);
        Ok((Self { dir, vault_id, keychain }, mnemonic))
    }

    /// Unlock with the master password. On any failure the error
    /// collapses to `InvalidPassword`, whether the password was wrong or
    /// the wrapper/ciphertext was corrupted.
    pub fn unlock(&self, password: &[u8]) -> CoreResult<UnlockedVault> {
        let vault = storage::load_vault(&vault_file(&self.dir))?;
        let sidecar = storage::load_sidecar(&sidecar_file(&self.dir))?;
        let mut audit = open_audit_logger(&self.dir, &self.vault_id, &sidecar, self.keychain.as_ref());

        let outcome = (|| -> CoreResult<(VaultMetadata, SecretBytes, CredentialStore)> {
            let password_kek =
                primitives::derive_password_key(password, &vault.metadata.salt, vault.metadata.iterations)?;

            let working_key = match vault.metadata.version {
                1 => password_kek,
                2 => {
                    let wrapped = vault.metadata.wrapped_dek.ok_or(CoreError::InvalidPassword)?;
                    let nonce = vault.metadata.wrapped_dek_nonce.ok_or(CoreError::InvalidPassword)?;
                    keywrap::unwrap_key(&wrapped, &nonce, &password_kek).map_err(|_| CoreError::InvalidPassword)?
                }
                v => return Err(CoreError::UnsupportedVersion(v)),
            };

            let store = decrypt_store(&vault.data, &working_key)?;
            Ok((vault.metadata.clone(), working_key, store))
        })();

        match &outcome {
            Ok(_) => {
                if let Some(logger) = audit.as_mut() {
                    let _ = logger.append(AuditEvent::VaultUnlock, AuditOutcome::Success, "");
                }
            }
            Err(_) => {
                if let Some(logger) = audit.as_mut() {
                    let _ = logger.append(AuditEvent::VaultUnlock, AuditOutcome::Failure, "");
                }
            }
        }
        let (metadata, working_key, store) = outcome?;

        Ok(UnlockedVault {
            dir: self.dir.clone(),
            vault_id: self.vault_id.clone(),
            keychain: self.keychain.clone(),
            metadata,
            sidecar,
            working_key,
            store,
            audit,
        })
    }

    /// Unlock a version-2 vault via its recovery phrase, setting a new
    /// password in the same operation. The recovery wrapper is left
    /// untouched, so the same phrase can be used again afterward.
    pub fn unlock_with_recovery(
        &self,
        challenge_words: &[String],
        passphrase: Option<&str>,
        new_password: &[u8],
        config: &Config,
    ) -> CoreResult<UnlockedVault> {
        let vault = storage::load_vault(&vault_file(&self.dir))?;
        let sidecar = storage::load_sidecar(&sidecar_file(&self.dir))?;
        let mut audit = open_audit_logger(&self.dir, &self.vault_id, &sidecar, self.keychain.as_ref());

        let outcome = (|| -> CoreResult<(VaultMetadata, SecretBytes, CredentialStore)> {
            if vault.metadata.version != 2 {
                return Err(CoreError::InvalidRecovery);
            }
            let recovery = sidecar
                .recovery
                .clone()
                .filter(|r| r.version == "2")
                .ok_or(CoreError::InvalidRecovery)?;

            let kdf_params: RecoveryKdfParams = recovery.kdf_params.clone().into();

            let stored_words_key = recovery::derive_stored_words_key(challenge_words, &kdf_params)?;
            let mut sealed_stored =
                Vec::with_capacity(primitives::NONCE_LEN + recovery.encrypted_stored_words.len());
            sealed_stored.extend_from_slice(&recovery.nonce_stored);
            sealed_stored.extend_from_slice(&recovery.encrypted_stored_words);
            let stored_plaintext = primitives::decrypt(&sealed_stored, &stored_words_key)
                .map_err(|_| CoreError::InvalidRecovery)?;
            let stored_words: Vec<String> = serde_json::from_slice(&stored_plaintext)
                .map_err(|_| CoreError::InvalidRecovery)?;

            let mnemonic =
                recovery::reconstruct_mnemonic(challenge_words, &recovery.challenge_positions, &stored_words)
                    .map_err(|_| CoreError::InvalidRecovery)?;
            recovery::validate_mnemonic(&mnemonic).map_err(|_| CoreError::InvalidRecovery)?;

            let recovery_kek = recovery::derive_recovery_kek(&mnemonic, passphrase, &kdf_params)
                .map_err(|_| CoreError::InvalidRecovery)?;
            let encrypted_recovery_key = recovery.encrypted_recovery_key.ok_or(CoreError::InvalidRecovery)?;
            let nonce_recovery = recovery.nonce_recovery.ok_or(CoreError::InvalidRecovery)?;
            let dek = keywrap::unwrap_key(&encrypted_recovery_key, &nonce_recovery, &recovery_kek)
                .map_err(|_| CoreError::InvalidRecovery)?;

            let store = decrypt_store(&vault.data, &dek).map_err(|_| CoreError::InvalidRecovery)?;

            let config = config.clone_normalized();
            let new_salt = primitives::generate_salt()?;
            let new_password_kek = primitives::derive_password_key(new_password, &new_salt, config.iterations)?;
            let new_wrapped = keywrap::wrap_key(&dek, &new_password_kek)?;

            let mut metadata = vault.metadata.clone();
            metadata.salt = new_salt;
            metadata.iterations = config.iterations;
            metadata.wrapped_dek = Some(to_array_48(&new_wrapped.ciphertext));
            metadata.wrapped_dek_nonce = Some(new_wrapped.nonce);
            metadata.updated_at = chrono::Utc::now();

            storage::save_vault(
                &vault_file(&self.dir),
                &EncryptedVault {
                    metadata: metadata.clone(),
                    data: encrypt_store(&store, &dek)?,
                },
            )?;

            Ok((metadata, dek, store))
        })();

        match &outcome {
            Ok(_) => {
                if let Some(logger) = audit.as_mut() {
                    let _ = logger.append(AuditEvent::RecoveryUnlock, AuditOutcome::Success, "");
                }
            }
            Err(_) => {
                if let Some(logger) = audit.as_mut() {
                    let _ = logger.append(AuditEvent::RecoveryUnlock, AuditOutcome::Failure, "");
                }
            }
        }
        let (metadata, working_key, store) = outcome?;

        Ok(UnlockedVault {
            dir: self.dir.clone(),
            vault_id: self.vault_id.clone(),
            keychain: self.keychain.clone(),
            metadata,
            sidecar,
            working_key,
            store,
            audit,
        })
    }

    /// Permanently delete a locked vault's files: the vault, its sidecar,
    /// any `.backup` generations, and its audit log. Logs `vault_remove`
    /// to the log being deleted before removing it, so the event survives
    /// in whatever copy of the log a caller may have backed up separately.
    /// Best-effort: a missing file is not an error, since the caller may
    /// be cleaning up a partially-initialized vault directory.
    pub fn remove(self) -> CoreResult<()> {
        let sidecar = storage::load_sidecar(&sidecar_file(&self.dir)).ok();
        if let Some(sidecar) = &sidecar {
            if let Some(mut logger) = open_audit_logger(&self.dir, &self.vault_id, sidecar, self.keychain.as_ref()) {
                let _ = logger.append(AuditEvent::VaultRemove, AuditOutcome::Success, "");
            }
        }

        let targets = [
            vault_file(&self.dir),
            storage::backup_path_for(&vault_file(&self.dir)),
            sidecar_file(&self.dir),
            storage::backup_path_for(&sidecar_file(&self.dir)),
        ];
        for path in targets {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }

        if let Some(sidecar) = sidecar {
            let audit_path = resolve_audit_path(&self.dir, &sidecar.audit_log_path);
            let _ = fs::remove_file(&audit_path);
        }

        Ok(())
    }
}

impl UnlockedVault {
    fn log(&mut self, event: AuditEvent, outcome: AuditOutcome, credential_name: &str) {
        if let Some(logger) = self.audit.as_mut() {
            let _ = logger.append(event, outcome, credential_name);
        }
    }

    fn save(&mut self) -> CoreResult<()> {
        self.metadata.updated_at = chrono::Utc::now();
        let data = encrypt_store(&self.store, &self.working_key)?;
        storage::save_vault(
            &vault_file(&self.dir),
            &EncryptedVault {
                metadata: self.metadata.clone(),
                data,
            },
        )
    }

    /// Lock the vault: the working key and decrypted store are dropped
    /// here (their types zeroize on drop), and a fresh `LockedVault`
    /// handle is returned.
    pub fn lock(mut self) -> LockedVault {
        self.log(AuditEvent::VaultLock, AuditOutcome::Success, "");
        LockedVault {
            dir: self.dir.clone(),
            vault_id: self.vault_id.clone(),
            keychain: self.keychain.clone(),
        }
    }

    pub fn change_password(&mut self, current: &[u8], new: &[u8]) -> CoreResult<()> {
        let check_kek =
            primitives::derive_password_key(current, &self.metadata.salt, self.metadata.iterations)?;
        let current_ok = match self.metadata.version {
            1 => check_kek.expose_secret() == self.working_key.expose_secret(),
            2 => {
                let wrapped = self.metadata.wrapped_dek.ok_or(CoreError::InvalidPassword)?;
                let nonce = self.metadata.wrapped_dek_nonce.ok_or(CoreError::InvalidPassword)?;
                keywrap::unwrap_key(&wrapped, &nonce, &check_kek).is_ok()
            }
            v => return Err(CoreError::UnsupportedVersion(v)),
        };
        if !current_ok {
            self.log(AuditEvent::PasswordChange, AuditOutcome::Failure, "");
            return Err(CoreError::InvalidPassword);
        }

        let new_salt = primitives::generate_salt()?;
        let new_kek = primitives::derive_password_key(new, &new_salt, self.metadata.iterations)?;

        match self.metadata.version {
            1 => {
                self.working_key = new_kek;
            }
            2 => {
                let wrapped = keywrap::wrap_key(&self.working_key, &new_kek)?;
                self.metadata.wrapped_dek = Some(to_array_48(&wrapped.ciphertext));
                self.metadata.wrapped_dek_nonce = Some(wrapped.nonce);
            }
            v => return Err(CoreError::UnsupportedVersion(v)),
        }
        self.metadata.salt = new_salt;

        self.save()?;
        self.log(AuditEvent::PasswordChange, AuditOutcome::Success, "");
        Ok(())
    }

    /// Store the current master password in the OS keychain under this
    /// vault's account and flip `keychain_enabled` on in the sidecar.
    /// Requires the plaintext password again: `UnlockedVault` only ever
    /// holds the derived working key, never the password it came from.
    pub fn enable_keychain(&mut self, password: &[u8]) -> CoreResult<()> {
        if !self.keychain.is_available() {
            self.log(AuditEvent::KeychainEnable, AuditOutcome::Failure, "");
            return Err(CoreError::KeychainUnavailable);
        }

        self.keychain.store(
            keychain::SERVICE_MASTER_PASSWORD,
            &keychain::master_password_account(&self.vault_id),
            password,
        )?;

        self.sidecar.keychain_enabled = true;
        storage::save_sidecar(&sidecar_file(&self.dir), &self.sidecar)?;
        self.log(AuditEvent::KeychainEnable, AuditOutcome::Success, "");
        Ok(())
    }

    pub fn add_credential(&mut self, credential: Credential) -> CoreResult<()> {
        let service = credential.service.clone();
        self.store.add(credential)?;
        self.save()?;
        self.log(AuditEvent::CredentialAdd, AuditOutcome::Success, &service);
        Ok(())
    }

    pub fn get_credential(&mut self, service: &str) -> CoreResult<Credential> {
        let result = self.store.get(service).map(|c| c.clone());
        self.log(
            AuditEvent::CredentialGet,
            if result.is_ok() { AuditOutcome::Success } else { AuditOutcome::Failure },
            service,
        );
        Ok(result?)
    }

    pub fn update_credential(
        &mut self,
        service: &str,
        apply: impl FnOnce(&mut Credential),
    ) -> CoreResult<()> {
        self.store.update(service, apply)?;
        self.save()?;
        self.log(AuditEvent::CredentialUpdate, AuditOutcome::Success, service);
        Ok(())
    }

    pub fn delete_credential(&mut self, service: &str) -> CoreResult<()> {
        self.store.remove(service)?;
        self.save()?;
        self.log(AuditEvent::CredentialDelete, AuditOutcome::Success, service);
        Ok(())
    }

    pub fn list_metadata(&self) -> Vec<CredentialMetadata> {
        self.store.list_metadata()
    }

    pub fn search(&self, query: &str) -> Vec<CredentialMetadata> {
        self.store.search(query)
    }

    pub fn record_usage(
        &mut self,
        service: &str,
        location: &str,
        git_repo: Option<String>,
        line_number: Option<u32>,
    ) -> CoreResult<()> {
        self.store.record_usage(service, location, git_repo, line_number)?;
        self.save()
    }

    /// True iff this vault is version 1 (recovery non-functional).
    /// Informational only; does not act.
    pub fn needs_migration(&self) -> bool {
        self.metadata.version == 1
    }

    /// Upgrade a version-1 vault to version 2: generate fresh recovery
    /// material, generate a DEK, wrap it under both KEKs, and re-encrypt
    /// the store under the DEK. Nothing is written unless every step
    /// before the atomic save succeeds. Returns the new mnemonic.
    pub fn migrate_to_v2(
        &mut self,
        passphrase: Option<&str>,
        config: &Config,
    ) -> CoreResult<Zeroizing<String>> {
        if self.metadata.version != 1 {
            return Err(CoreError::InvalidArgument("vault is not version 1"));
        }
        let config = config.clone_normalized();

        let mnemonic = recovery::generate_mnemonic()?;
        let challenge_positions =
            recovery::select_challenge_positions(recovery::MNEMONIC_WORD_COUNT, recovery::CHALLENGE_WORD_COUNT)?;
        let (challenge_words, stored_words) = recovery::split_words(&mnemonic, &challenge_positions)?;
        let challenge_strings: Vec<String> = challenge_words.iter().map(|w| w.to_string()).collect();
        let stored_strings: Vec<String> = stored_words.iter().map(|w| w.to_string()).collect();

        let kdf_params = config.recovery_kdf_params()?;
        let stored_words_key = recovery::derive_stored_words_key(&challenge_strings, &kdf_params)?;
        let stored_plaintext = serde_json::to_vec(&stored_strings).map_err(|e| {
            CoreError::IOError(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;
        let encrypted_stored_words = primitives::encrypt(&stored_plaintext, &stored_words_key)?;
        let (nonce_stored, encrypted_stored_words) = split_nonce(&encrypted_stored_words);

        let recovery_kek = recovery::derive_recovery_kek(&mnemonic, passphrase, &kdf_params)?;
        let password_kek_stand_in = SecretBytes::from(self.working_key.expose_secret().to_vec());
        let (dek, password_wrapped, recovery_wrapped) =
            keywrap::generate_and_wrap_dek(&password_kek_stand_in, &recovery_kek)?;

        let new_data = encrypt_store(&self.store, &dek)?;

        let mut new_metadata = self.metadata.clone();
        new_metadata.version = 2;
        new_metadata.wrapped_dek = Some(to_array_48(&password_wrapped.ciphertext));
        new_metadata.wrapped_dek_nonce = Some(password_wrapped.nonce);
        new_metadata.updated_at = chrono::Utc::now();

        storage::save_vault(
            &vault_file(&self.dir),
            &EncryptedVault {
                metadata: new_metadata.clone(),
                data: new_data,
            },
        )?;

        self.sidecar.version = "2".to_string();
        self.sidecar.recovery = Some(RecoveryMetadata {
            enabled: true,
            version: "2".to_string(),
            passphrase_required: passphrase.is_some(),
            challenge_positions,
            kdf_params: kdf_params.into(),
            encrypted_stored_words,
            nonce_stored,
            encrypted_recovery_key: Some(to_array_48(&recovery_wrapped.ciphertext)),
            nonce_recovery: Some(recovery_wrapped.nonce),
        });
        storage::save_sidecar(&sidecar_file(&self.dir), &self.sidecar)?;

        self.metadata = new_metadata;
        self.working_key = dek;
        self.log(AuditEvent::MigrateToV2, AuditOutcome::Success, "");
        Ok(mnemonic)
    }

    /// Replace the recovery wrapper (fresh mnemonic, fresh recovery KEK)
    /// without touching the DEK or the password wrapper. Used when the
    /// recovery wrapper is found corrupted but the password path still
    /// works (see the corrupted-wrapper policy).
    pub fn regenerate_recovery(
        &mut self,
        passphrase: Option<&str>,
        config: &Config,
    ) -> CoreResult<Zeroizing<String>> {
        if self.metadata.version != 2 {
            return Err(CoreError::InvalidArgument("recovery requires a version-2 vault"));
        }
        let config = config.clone_normalized();

        let mnemonic = recovery::generate_mnemonic()?;
        let challenge_positions =
            recovery::select_challenge_positions(recovery::MNEMONIC_WORD_COUNT, recovery::CHALLENGE_WORD_COUNT)?;
        let (challenge_words, stored_words) = recovery::split_words(&mnemonic, &challenge_positions)?;
        let challenge_strings: Vec<String> = challenge_words.iter().map(|w| w.to_string()).collect();
        let stored_strings: Vec<String> = stored_words.iter().map(|w| w.to_string()).collect();

        let kdf_params = config.recovery_kdf_params()?;
        let stored_words_key = recovery::derive_stored_words_key(&challenge_strings, &kdf_params)?;
        let stored_plaintext = serde_json::to_vec(&stored_strings).map_err(|e| {
            CoreError::IOError(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;
        let encrypted_stored_words = primitives::encrypt(&stored_plaintext, &stored_words_key)?;
        let (nonce_stored, encrypted_stored_words) = split_nonce(&encrypted_stored_words);

        let recovery_kek = recovery::derive_recovery_kek(&mnemonic, passphrase, &kdf_params)?;
        let recovery_wrapped = keywrap::wrap_key(&self.working_key, &recovery_kek)?;

        self.sidecar.recovery = Some(RecoveryMetadata {
            enabled: true,
            version: "2".to_string(),
            passphrase_required: passphrase.is_some(),
            challenge_positions,
            kdf_params: kdf_params.into(),
            encrypted_stored_words,
            nonce_stored,
            encrypted_recovery_key: Some(to_array_48(&recovery_wrapped.ciphertext)),
            nonce_recovery: Some(recovery_wrapped.nonce),
        });
        storage::save_sidecar(&sidecar_file(&self.dir), &self.sidecar)?;
        Ok(mnemonic)
    }
}

fn split_nonce(sealed: &[u8]) -> ([u8; primitives::NONCE_LEN], Vec<u8>) {
    let (nonce_bytes, body) = sealed.split_at(primitives::NONCE_LEN);
    let mut nonce = [0u8; primitives::NONCE_LEN];
    nonce.copy_from_slice(nonce_bytes);
    (nonce, body.to_vec())
}

fn to_array_48(bytes: &[u8]) -> [u8; 48] {
    let mut out = [0u8; 48];
    out.copy_from_slice(bytes);
    out
}

impl Config {
    fn clone_normalized(&self) -> Self {
        self.clone().normalized()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keychain::{KeychainError, NullKeychain};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::tempdir;

    #[derive(Default)]
    struct MemoryKeychain {
        entries: Mutex<HashMap<(String, String), Vec<u8>>>,
    }

    impl Keychain for MemoryKeychain {
        fn is_available(&self) -> bool {
            true
        }

        fn store(&self, service: &str, account: &str, secret_bytes: &[u8]) -> Result<(), KeychainError> {
            self.entries
                .lock()
                .unwrap()
                .insert((service.to_string(), account.to_string()), secret_bytes.to_vec());
            Ok(())
        }

        fn retrieve(&self, service: &str, account: &str) -> Result<Vec<u8>, KeychainError> {
            self.entries
                .lock()
                .unwrap()
                .get(&(service.to_string(), account.to_string()))
                .cloned()
                .ok_or(KeychainError::NoEntry)
        }

        fn delete(&self, service: &str, account: &str) -> Result<(), KeychainError> {
            self.entries
                .lock()
                .unwrap()
                .remove(&(service.to_string(), account.to_string()));
            Ok(())
        }
    }

    fn sample_credential(service: &str) -> Credential {
        let now = chrono::Utc::now();
        Credential {
            service: service.to_string(),
            username: "alice".to_string(),
            password: Zeroizing::new(b"hunter2".to_vec()),
            url: None,
            category: None,
            notes: None,
            created_at: now,
            updated_at: now,
            usage_records: HashMap::new(),
        }
    }

    #[test]
    fn enable_keychain_persists_password_and_flips_sidecar_flag() {
        let dir = tempdir().unwrap();
        let kc: Arc<dyn Keychain> = Arc::new(MemoryKeychain::default());
        let config = Config::default();

        let locked =
            LockedVault::initialize(dir.path(), "vault-1", b"hunter2", &config, kc.clone()).unwrap();
        let mut unlocked = locked.unlock(b"hunter2").unwrap();
        assert!(!unlocked.sidecar.keychain_enabled);

        unlocked.enable_keychain(b"hunter2").unwrap();
        assert!(unlocked.sidecar.keychain_enabled);

        let stored = kc
            .retrieve(
                keychain::SERVICE_MASTER_PASSWORD,
                &keychain::master_password_account("vault-1"),
            )
            .unwrap();
        assert_eq!(stored, b"hunter2");

        let reloaded_sidecar = storage::load_sidecar(&sidecar_file(dir.path())).unwrap();
        assert!(reloaded_sidecar.keychain_enabled);
    }

    #[test]
    fn enable_keychain_fails_when_keychain_unavailable() {
        let dir = tempdir().unwrap();
        let kc: Arc<dyn Keychain> = Arc::new(NullKeychain);
        let config = Config::default();

        let locked = LockedVault::initialize(dir.path(), "vault-1", b"hunter2", &config, kc).unwrap();
        let mut unlocked = locked.unlock(b"hunter2").unwrap();
        let err = unlocked.enable_keychain(b"hunter2").unwrap_err();
        assert!(matches!(err, CoreError::KeychainUnavailable));
    }

    #[test]
    fn remove_deletes_vault_and_sidecar_and_their_backups() {
        let dir = tempdir().unwrap();
        let kc: Arc<dyn Keychain> = Arc::new(MemoryKeychain::default());
        let config = Config::default();

        let locked =
            LockedVault::initialize(dir.path(), "vault-1", b"hunter2", &config, kc.clone()).unwrap();
        let mut unlocked = locked.unlock(b"hunter2").unwrap();
        unlocked.add_credential(sample_credential("svc")).unwrap();
        let locked = unlocked.lock();

        assert!(vault_file(dir.path()).exists());
        assert!(storage::backup_path_for(&vault_file(dir.path())).exists());

        locked.remove().unwrap();

        assert!(!vault_file(dir.path()).exists());
        assert!(!sidecar_file(dir.path()).exists());
        assert!(!storage::backup_path_for(&vault_file(dir.path())).exists());
    }
}

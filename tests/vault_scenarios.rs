use passcore::config::Config;
use passcore::keychain::NullKeychain;
use passcore::storage::{EncryptedVault, StorageError};
use passcore::vault::{Credential, LockedVault};
use secrecy::SecretSlice;
use std::sync::Arc;
use zeroize::Zeroizing;

fn test_config() -> Config {
    Config {
        iterations: 600_000,
        ..Config::default()
    }
}

fn keychain() -> Arc<NullKeychain> {
    Arc::new(NullKeychain)
}

fn sample_credential(service: &str, password: &str) -> Credential {
    let now = chrono::Utc::now();
    Credential {
        service: service.to_string(),
        username: "testuser".to_string(),
        password: Zeroizing::new(password.as_bytes().to_vec()),
        url: None,
        category: None,
        notes: None,
        created_at: now,
        updated_at: now,
        usage_records: Default::default(),
    }
}

#[test]
fn init_and_round_trip_v2() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config();

    let (locked, mnemonic) = LockedVault::initialize_with_recovery(
        dir.path(),
        "vault-1",
        b"Test123!@#Password",
        None,
        &config,
        keychain(),
    )
    .unwrap();
    assert_eq!(mnemonic.split_whitespace().count(), 24);

    let raw = std::fs::read(dir.path().join("vault.enc")).unwrap();
    let vault: EncryptedVault = serde_json::from_slice(&raw).unwrap();
    assert_eq!(vault.metadata.version, 2);
    assert_eq!(vault.metadata.wrapped_dek.unwrap().len(), 48);
    assert_eq!(vault.metadata.wrapped_dek_nonce.unwrap().len(), 12);

    let sidecar_raw = std::fs::read(dir.path().join(".meta.json")).unwrap();
    let sidecar: serde_json::Value = serde_json::from_slice(&sidecar_raw).unwrap();
    assert_eq!(sidecar["recovery"]["version"], "2");
    assert_eq!(sidecar["recovery"]["challenge_positions"].as_array().unwrap().len(), 6);

    let unlocked = locked.unlock(b"Test123!@#Password").unwrap();
    assert!(unlocked.list_metadata().is_empty());
}

#[test]
fn recovery_path_rewraps_password_and_leaves_recovery_wrapper_valid() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config();

    let (locked, mnemonic) = LockedVault::initialize_with_recovery(
        dir.path(),
        "vault-2",
        b"Test123!@#Password",
        None,
        &config,
        keychain(),
    )
    .unwrap();

    let sidecar_raw = std::fs::read(dir.path().join(".meta.json")).unwrap();
    let sidecar: serde_json::Value = serde_json::from_slice(&sidecar_raw).unwrap();
    let positions: Vec<usize> = sidecar["recovery"]["challenge_positions"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_u64().unwrap() as usize)
        .collect();

    let words: Vec<&str> = mnemonic.split_whitespace().collect();
    let challenge_words: Vec<String> = positions.iter().map(|&p| words[p].to_string()).collect();

    locked
        .unlock_with_recovery(&challenge_words, None, b"New123!@#Password", &config)
        .unwrap();

    assert!(matches!(
        locked.unlock(b"Test123!@#Password").unwrap_err(),
        passcore::CoreError::InvalidPassword
    ));
    locked.unlock(b"New123!@#Password").unwrap();

    locked
        .unlock_with_recovery(&challenge_words, None, b"Another1@#Password", &config)
        .unwrap();
    locked.unlock(b"Another1@#Password").unwrap();
}

#[test]
fn migration_v1_to_v2_preserves_existing_credentials() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config();

    let locked =
        LockedVault::initialize(dir.path(), "vault-3", b"Test123!@#Password", &config, keychain())
            .unwrap();

    let mut unlocked = locked.unlock(b"Test123!@#Password").unwrap();
    unlocked
        .add_credential(sample_credential("atomic-test", "important-secret"))
        .unwrap();
    assert!(unlocked.needs_migration());

    let mnemonic = unlocked.migrate_to_v2(None, &config).unwrap();
    assert_eq!(mnemonic.split_whitespace().count(), 24);
    let locked = unlocked.lock();

    let raw = std::fs::read(dir.path().join("vault.enc")).unwrap();
    let vault: EncryptedVault = serde_json::from_slice(&raw).unwrap();
    assert_eq!(vault.metadata.version, 2);

    let mut reunlocked = locked.unlock(b"Test123!@#Password").unwrap();
    let credential = reunlocked.get_credential("atomic-test").unwrap();
    assert_eq!(credential.password.as_slice(), b"important-secret");
}

#[test]
fn tamper_detection_flags_the_first_broken_line_and_everything_after() {
    use passcore::audit::{AuditEvent, AuditLogger, AuditOutcome, verify_audit};

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("audit.log");
    let key = vec![0x11u8; 32];

    {
        let mut logger = AuditLogger::open(&path, &key).unwrap();
        for i in 0..5 {
            logger
                .append(AuditEvent::CredentialAdd, AuditOutcome::Success, &format!("svc-{i}"))
                .unwrap();
        }
    }

    let contents = std::fs::read_to_string(&path).unwrap();
    let mut lines: Vec<String> = contents.lines().map(str::to_string).collect();
    let mut third: serde_json::Value = serde_json::from_str(&lines[2]).unwrap();
    let hmac_b64 = third["hmac"].as_str().unwrap().to_string();
    let mut raw = base64_decode(&hmac_b64);
    raw[0] ^= 0xFF;
    third["hmac"] = serde_json::Value::String(base64_encode(&raw));
    lines[2] = serde_json::to_string(&third).unwrap();
    std::fs::write(&path, lines.join("\n") + "\n").unwrap();

    let report = verify_audit(&path, &key).unwrap();
    assert_eq!(report.first_break, Some(3));
    assert_eq!(report.invalid_lines, vec![3, 4, 5]);
}

fn base64_decode(s: &str) -> Vec<u8> {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD.decode(s).unwrap()
}

fn base64_encode(bytes: &[u8]) -> String {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

#[test]
fn corrupted_wrapper_degrades_to_a_single_invalid_password_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config();

    let (_locked, _mnemonic) = LockedVault::initialize_with_recovery(
        dir.path(),
        "vault-5",
        b"Test123!@#Password",
        None,
        &config,
        keychain(),
    )
    .unwrap();

    let vault_path = dir.path().join("vault.enc");
    let raw = std::fs::read(&vault_path).unwrap();
    let mut vault: EncryptedVault = serde_json::from_slice(&raw).unwrap();
    vault.metadata.wrapped_dek = Some({
        let mut truncated = [0u8; 48];
        truncated[..16].copy_from_slice(&vault.metadata.wrapped_dek.unwrap()[..16]);
        truncated
    });
    std::fs::write(&vault_path, serde_json::to_vec(&vault).unwrap()).unwrap();

    let locked = LockedVault::at(dir.path(), "vault-5", keychain());
    let err = locked.unlock(b"Test123!@#Password").unwrap_err();
    assert!(matches!(err, passcore::CoreError::InvalidPassword));
    let message = err.to_string();
    assert!(message.len() < 200);
    assert!(!message.contains("wrapped_dek"));
}

#[test]
fn nonce_is_unique_across_one_hundred_encryptions_of_the_same_plaintext() {
    use passcore::primitives::{encrypt, NONCE_LEN};
    let key = SecretSlice::from(vec![0x42u8; 32]);
    let mut seen = std::collections::HashSet::new();
    for _ in 0..100 {
        let ct = encrypt(b"same plaintext every time", &key).unwrap();
        assert!(seen.insert(ct[..NONCE_LEN].to_vec()));
    }
    assert_eq!(seen.len(), 100);
}

#[test]
fn loading_an_unsupported_version_fails_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config();
    let locked =
        LockedVault::initialize(dir.path(), "vault-6", b"Test123!@#Password", &config, keychain())
            .unwrap();
    let _ = locked;

    let vault_path = dir.path().join("vault.enc");
    let raw = std::fs::read(&vault_path).unwrap();
    let mut vault: EncryptedVault = serde_json::from_slice(&raw).unwrap();
    vault.metadata.version = 7;
    std::fs::write(&vault_path, serde_json::to_vec(&vault).unwrap()).unwrap();

    let err = passcore::storage::load_vault(&vault_path).unwrap_err();
    assert!(matches!(err, StorageError::UnsupportedVersion(7)));
}

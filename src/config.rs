//! The configuration surface the core accepts.
//!
//! Grounded on the teacher's `config::FileConfig` for the "typed struct,
//! not a bag" discipline (`#[serde(deny_unknown_fields)]`, explicit
//! field list) — but file loading itself is a CLI-layer concern per
//! spec.md and is deliberately not reproduced here; a caller builds a
//! `Config` however it likes and hands it to `vault::ops`.

use crate::primitives::MIN_PBKDF2_ITERATIONS;
use crate::recovery::RecoveryKdfParams;
use serde::{Deserialize, Serialize};

/// Recognized configuration options. Unknown fields are rejected at
/// deserialize time rather than silently ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vault_path: Option<String>,

    #[serde(default = "default_iterations")]
    pub iterations: u32,

    #[serde(default = "default_argon2id_time")]
    pub argon2id_time: u32,

    #[serde(default = "default_argon2id_memory_kib")]
    pub argon2id_memory_kib: u32,

    #[serde(default = "default_argon2id_parallelism")]
    pub argon2id_parallelism: u32,

    #[serde(default)]
    pub enable_audit: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_log_path: Option<String>,
}

fn default_iterations() -> u32 {
    MIN_PBKDF2_ITERATIONS
}

fn default_argon2id_time() -> u32 {
    1
}

fn default_argon2id_memory_kib() -> u32 {
    64 * 1024
}

fn default_argon2id_parallelism() -> u32 {
    4
}

impl Default for Config {
    fn default() -> Self {
        Self {
            vault_path: None,
            iterations: default_iterations(),
            argon2id_time: default_argon2id_time(),
            argon2id_memory_kib: default_argon2id_memory_kib(),
            argon2id_parallelism: default_argon2id_parallelism(),
            enable_audit: false,
            audit_log_path: None,
        }
    }
}

impl Config {
    /// Clamp the PBKDF2 iteration count and Argon2id work factors up to
    /// their enforced floors. Never weakens a caller's stronger request.
    pub fn normalized(mut self) -> Self {
        self.iterations = self.iterations.max(default_iterations());
        self.argon2id_time = self.argon2id_time.max(default_argon2id_time());
        self.argon2id_memory_kib = self.argon2id_memory_kib.max(default_argon2id_memory_kib());
        self.argon2id_parallelism = self.argon2id_parallelism.max(default_argon2id_parallelism());
        self
    }

    /// Build fresh `RecoveryKdfParams` (new random salts) honoring this
    /// config's Argon2id work factors.
    pub fn recovery_kdf_params(&self) -> Result<RecoveryKdfParams, crate::recovery::RecoveryError> {
        let mut params = RecoveryKdfParams::generate()?;
        params.time = self.argon2id_time;
        params.memory_kib = self.argon2id_memory_kib;
        params.parallelism = self.argon2id_parallelism;
        Ok(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_meets_the_enforced_floors() {
        let cfg = Config::default();
        assert!(cfg.iterations >= MIN_PBKDF2_ITERATIONS);
        assert_eq!(cfg.argon2id_time, 1);
        assert_eq!(cfg.argon2id_memory_kib, 64 * 1024);
        assert_eq!(cfg.argon2id_parallelism, 4);
    }

    #[test]
    fn normalized_never_weakens_a_stronger_request() {
        let cfg = Config {
            iterations: 1_000_000,
            argon2id_time: 3,
            ..Config::default()
        }
        .normalized();
        assert_eq!(cfg.iterations, 1_000_000);
        assert_eq!(cfg.argon2id_time, 3);
    }

    #[test]
    fn normalized_raises_a_weaker_request_to_the_floor() {
        let cfg = Config {
            iterations: 1,
            argon2id_time: 0,
            argon2id_memory_kib: 1,
            argon2id_parallelism: 1,
            ..Config::default()
        }
        .normalized();
        assert_eq!(cfg.iterations, MIN_PBKDF2_ITERATIONS);
        assert_eq!(cfg.argon2id_time, 1);
        assert_eq!(cfg.argon2id_memory_kib, 64 * 1024);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let json = r#"{"iterations": 700000, "bogus_field": true}"#;
        let err = serde_json::from_str::<Config>(json).unwrap_err();
        assert!(err.to_string().contains("bogus_field"));
    }

    #[test]
    fn deserializing_an_empty_object_applies_all_defaults() {
        let cfg: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, Config::default());
    }
}

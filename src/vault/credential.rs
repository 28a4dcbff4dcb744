//! The credential store held in memory while a vault is unlocked, and
//! its on-disk (pre-encryption) JSON shape.
//!
//! Grounded on the teacher's `vault::items` (`VaultItemV1`/`VaultPayloadV1`
//! and their `schema_version` field), generalized to the richer
//! `Credential` shape spec.md defines — a password field instead of a
//! generic `secret` string, plus per-location usage tracking.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use zeroize::Zeroizing;

/// One record of where and how often a credential has been used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub last_used_at: DateTime<Utc>,
    pub count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_repo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_number: Option<u32>,
}

/// One stored secret. `password` is held as zeroize-on-drop bytes, never
/// a `String` — per the byte-buffer convention, all secret material is
/// mutable bytes that are cleared when the buffer leaves scope.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credential {
    pub service: String,
    #[serde(default)]
    pub username: String,
    #[serde(with = "password_bytes")]
    pub password: Zeroizing<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub usage_records: HashMap<String, UsageRecord>,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("service", &self.service)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("url", &self.url)
            .field("category", &self.category)
            .field("notes", &self.notes)
            .field("created_at", &self.created_at)
            .field("updated_at", &self.updated_at)
            .field("usage_records", &self.usage_records)
            .finish()
    }
}

mod password_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer, de};
    use zeroize::Zeroizing;

    pub fn serialize<S: Serializer>(
        bytes: &Zeroizing<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes.as_slice()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Zeroizing<Vec<u8>>, D::Error> {
        let s = String::deserialize(deserializer)?;
        let decoded = STANDARD.decode(&s).map_err(de::Error::custom)?;
        Ok(Zeroizing::new(decoded))
    }
}

/// Metadata view of a credential with the password omitted — what
/// `ListMetadata` returns.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialMetadata {
    pub service: String,
    pub username: String,
    pub url: Option<String>,
    pub category: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Credential> for CredentialMetadata {
    fn from(c: &Credential) -> Self {
        Self {
            service: c.service.clone(),
            username: c.username.clone(),
            url: c.url.clone(),
            category: c.category.clone(),
            created_at: c.created_at,
            updated_at: c.updated_at,
        }
    }
}

/// Ordered-insensitive mapping `service -> Credential`. Lookups are
/// case-sensitive on the service key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialStore {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub credentials: HashMap<String, Credential>,
}

fn default_schema_version() -> u32 {
    1
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self {
            schema_version: default_schema_version(),
            credentials: HashMap::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CredentialStoreError {
    #[error("a credential for service '{0}' already exists")]
    AlreadyExists(String),

    #[error("no credential found for service '{0}'")]
    NotFound(String),

    #[error("service name must not be empty")]
    EmptyServiceName,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, credential: Credential) -> Result<(), CredentialStoreError> {
        if credential.service.is_empty() {
            return Err(CredentialStoreError::EmptyServiceName);
        }
        if self.credentials.contains_key(&credential.service) {
            return Err(CredentialStoreError::AlreadyExists(credential.service));
        }
        self.credentials.insert(credential.service.clone(), credential);
        Ok(())
    }

    pub fn get(&self, service: &str) -> Result<&Credential, CredentialStoreError> {
        self.credentials
            .get(service)
            .ok_or_else(|| CredentialStoreError::NotFound(service.to_string()))
    }

    pub fn update(
        &mut self,
        service: &str,
        apply: impl FnOnce(&mut Credential),
    ) -> Result<(), CredentialStoreError> {
        let credential = self
            .credentials
            .get_mut(service)
            .ok_or_else(|| CredentialStoreError::NotFound(service.to_string()))?;
        apply(credential);
        credential.updated_at = Utc::now();
        Ok(())
    }

    pub fn remove(&mut self, service: &str) -> Result<(), CredentialStoreError> {
        self.credentials
            .remove(service)
            .map(|_| ())
            .ok_or_else(|| CredentialStoreError::NotFound(service.to_string()))
    }

    pub fn list_metadata(&self) -> Vec<CredentialMetadata> {
        self.credentials.values().map(CredentialMetadata::from).collect()
    }

    /// Search `service`, `username`, `url`, and `category`. `notes` is
    /// deliberately excluded from search filtering.
    pub fn search(&self, query: &str) -> Vec<CredentialMetadata> {
        let query = query.to_lowercase();
        self.credentials
            .values()
            .filter(|c| {
                c.service.to_lowercase().contains(&query)
                    || c.username.to_lowercase().contains(&query)
                    || c.url.as_deref().unwrap_or("").to_lowercase().contains(&query)
                    || c.category.as_deref().unwrap_or("").to_lowercase().contains(&query)
            })
            .map(CredentialMetadata::from)
            .collect()
    }

    pub fn record_usage(
        &mut self,
        service: &str,
        location: &str,
        git_repo: Option<String>,
        line_number: Option<u32>,
    ) -> Result<(), CredentialStoreError> {
        let credential = self
            .credentials
            .get_mut(service)
            .ok_or_else(|| CredentialStoreError::NotFound(service.to_string()))?;

        let record = credential
            .usage_records
            .entry(location.to_string())
            .or_insert_with(|| UsageRecord {
                last_used_at: Utc::now(),
                count: 0,
                git_repo: git_repo.clone(),
                line_number,
            });
        record.last_used_at = Utc::now();
        record.count += 1;
        if git_repo.is_some() {
            record.git_repo = git_repo;
        }
        if line_number.is_some() {
            record.line_number = line_number;
        }
        Ok(())
    }
}

//! Stored credentials and how workflow nodes reference them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Result;

/// Kind of secret a credential holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialType {
    Password,
    UserPass,
    Token,
    SshKey,
    Certificate,
    File,
    Custom,
}

impl CredentialType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialType::Password => "password",
            CredentialType::UserPass => "user_pass",
            CredentialType::Token => "token",
            CredentialType::SshKey => "ssh_key",
            CredentialType::Certificate => "certificate",
            CredentialType::File => "file",
            CredentialType::Custom => "custom",
        }
    }
}

impl std::str::FromStr for CredentialType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "password" => CredentialType::Password,
            "user_pass" => CredentialType::UserPass,
            "token" => CredentialType::Token,
            "ssh_key" => CredentialType::SshKey,
            "certificate" => CredentialType::Certificate,
            "file" => CredentialType::File,
            "custom" => CredentialType::Custom,
            other => {
                return Err(crate::Error::InvalidInput(format!(
                    "unknown credential type: {}",
                    other
                )));
            }
        })
    }
}

/// An encrypted-at-rest secret record.
///
/// `secret` holds the encrypted primary value: the password, token, private
/// key, certificate, file content, or for `custom` a JSON object of fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub id: String,
    pub name: String,
    pub credential_type: CredentialType,
    /// Plaintext username for `user_pass` and `ssh_key`.
    pub username: Option<String>,
    /// Plaintext file name for `file`.
    pub filename: Option<String>,
    /// Encrypted payload in `iv:authTag:ciphertext` hex form.
    #[serde(skip_serializing)]
    pub secret: String,
    pub is_active: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// A node-level reference to a stored credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialBinding {
    pub credential_id: String,
    /// Which field to expose, e.g. `username` or `password`.
    #[serde(default)]
    pub field: Option<String>,
    /// Environment variable to write into. Derived from the name when absent.
    #[serde(default)]
    pub env_var: Option<String>,
}

/// Read access to stored credentials.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get_credential_by_id(&self, id: &str) -> Result<Option<Credential>>;

    async fn update_credential_last_used(&self, id: &str) -> Result<()>;
}

//! Injection of bound credentials into a job environment.

use chrono::Utc;
use fleetci_core::credential::{Credential, CredentialBinding, CredentialStore, CredentialType};
use fleetci_core::workflow::Node;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::crypto::{CryptoError, SecretCipher};
use crate::masker::LogMasker;

/// Why a single credential was left out of a job's environment.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("credential not found")]
    NotFound,

    #[error("credential is inactive")]
    Inactive,

    #[error("credential has expired")]
    Expired,

    #[error("decryption failed: {0}")]
    Crypto(#[from] CryptoError),

    #[error("store error: {0}")]
    Store(#[from] fleetci_core::Error),

    #[error("incomplete credential: {0}")]
    Incomplete(String),
}

/// Environment produced for one job.
#[derive(Debug, Default, Clone)]
pub struct ResolvedEnvironment {
    pub environment: HashMap<String, String>,
    /// Decrypted values that must be masked in output.
    pub secrets: Vec<String>,
}

impl ResolvedEnvironment {
    fn insert_secret(&mut self, key: String, value: String) {
        self.secrets.push(value.clone());
        self.environment.insert(key, value);
    }

    fn insert_plain(&mut self, key: String, value: String) {
        self.environment.insert(key, value);
    }

    /// Register every secret with a masker.
    pub fn register(&self, masker: &mut LogMasker) {
        masker.extend(self.secrets.iter().cloned());
    }
}

/// Looks up, decrypts and injects the credentials bound to workflow nodes.
pub struct CredentialResolver {
    store: Arc<dyn CredentialStore>,
    cipher: SecretCipher,
    allow_plaintext: bool,
}

impl CredentialResolver {
    pub fn new(store: Arc<dyn CredentialStore>, cipher: SecretCipher) -> Self {
        Self {
            store,
            cipher,
            allow_plaintext: false,
        }
    }

    /// Accept stored values that were saved before encryption was enabled.
    pub fn allow_plaintext(mut self, allow: bool) -> Self {
        self.allow_plaintext = allow;
        self
    }

    /// Merge the credentials bound to `nodes` into `base`.
    ///
    /// A credential that cannot be used is logged and skipped; the rest are
    /// still injected.
    pub async fn resolve(
        &self,
        nodes: &[Node],
        base: HashMap<String, String>,
    ) -> ResolvedEnvironment {
        let mut resolved = ResolvedEnvironment {
            environment: base,
            secrets: Vec::new(),
        };

        let mut seen = HashSet::new();
        let bindings = nodes
            .iter()
            .flat_map(|n| n.credentials.iter())
            .filter(|b| seen.insert(b.credential_id.clone()));

        for binding in bindings {
            match self.resolve_binding(binding, &mut resolved).await {
                Ok(()) => {
                    if let Err(e) = self
                        .store
                        .update_credential_last_used(&binding.credential_id)
                        .await
                    {
                        warn!(
                            credential_id = %binding.credential_id,
                            error = %e,
                            "Failed to record credential use"
                        );
                    }
                }
                Err(e) => {
                    warn!(
                        credential_id = %binding.credential_id,
                        error = %e,
                        "Skipping credential"
                    );
                }
            }
        }

        resolved
    }

    async fn resolve_binding(
        &self,
        binding: &CredentialBinding,
        out: &mut ResolvedEnvironment,
    ) -> Result<(), CredentialError> {
        let credential = self
            .store
            .get_credential_by_id(&binding.credential_id)
            .await?
            .ok_or(CredentialError::NotFound)?;

        if !credential.is_active {
            return Err(CredentialError::Inactive);
        }
        if credential.is_expired(Utc::now()) {
            return Err(CredentialError::Expired);
        }

        let secret = if self.allow_plaintext {
            self.cipher.decrypt_legacy(&credential.secret)?
        } else {
            self.cipher.decrypt(&credential.secret)?
        };

        inject(&credential, binding, secret, out)?;
        debug!(
            credential_id = %credential.id,
            credential_type = credential.credential_type.as_str(),
            "Injected credential"
        );
        Ok(())
    }
}

fn inject(
    credential: &Credential,
    binding: &CredentialBinding,
    secret: String,
    out: &mut ResolvedEnvironment,
) -> Result<(), CredentialError> {
    let name = binding
        .env_var
        .clone()
        .unwrap_or_else(|| env_name(&credential.name));
    let field = binding.field.as_deref();

    match credential.credential_type {
        CredentialType::Password | CredentialType::Token | CredentialType::Certificate => {
            out.insert_secret(name, secret);
        }
        CredentialType::UserPass => match field {
            Some("username") => {
                let username = credential
                    .username
                    .clone()
                    .ok_or_else(|| CredentialError::Incomplete("missing username".into()))?;
                out.insert_plain(name, username);
            }
            Some("password") => out.insert_secret(name, secret),
            Some(other) => {
                return Err(CredentialError::Incomplete(format!(
                    "unknown field '{}' for user_pass",
                    other
                )));
            }
            None => {
                if let Some(username) = &credential.username {
                    out.insert_plain(format!("{}_USERNAME", name), username.clone());
                }
                out.insert_secret(format!("{}_PASSWORD", name), secret);
            }
        },
        CredentialType::SshKey => {
            if let Some(username) = &credential.username {
                out.insert_plain(format!("{}_USERNAME", name), username.clone());
            }
            out.insert_secret(name, secret);
        }
        CredentialType::File => {
            if let Some(filename) = &credential.filename {
                out.insert_plain(format!("{}_FILENAME", name), filename.clone());
            }
            out.insert_secret(name, secret);
        }
        CredentialType::Custom => {
            let fields: serde_json::Map<String, serde_json::Value> =
                serde_json::from_str(&secret).map_err(|_| {
                    CredentialError::Incomplete("custom value is not a JSON object".into())
                })?;
            let as_string = |value: &serde_json::Value| match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };

            match field {
                Some(field) => {
                    let value = fields.get(field).ok_or_else(|| {
                        CredentialError::Incomplete(format!("custom field '{}' not present", field))
                    })?;
                    out.insert_secret(name, as_string(value));
                }
                None => {
                    for (key, value) in &fields {
                        out.insert_secret(format!("{}_{}", name, env_name(key)), as_string(value));
                    }
                }
            }
        }
    }

    Ok(())
}

/// Default environment variable name for a credential display name.
pub fn env_name(display_name: &str) -> String {
    display_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

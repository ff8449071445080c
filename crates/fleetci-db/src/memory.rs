//! In-memory stores, used when no database is configured and in tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleetci_core::cron::{CronJobConfig, CronStore};
use fleetci_core::credential::{Credential, CredentialStore};
use fleetci_core::settings::SettingsStore;
use fleetci_core::{Error, Result};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
pub struct MemoryCronStore {
    configs: RwLock<HashMap<String, CronJobConfig>>,
}

impl MemoryCronStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored configuration, enabled or not.
    pub async fn all(&self) -> Vec<CronJobConfig> {
        self.configs.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl CronStore for MemoryCronStore {
    async fn upsert(&self, config: &CronJobConfig) -> Result<()> {
        let mut configs = self.configs.write().await;
        let mut stored = config.clone();
        if let Some(existing) = configs.get(&config.job_id) {
            stored.last_run = existing.last_run;
            stored.created_at = existing.created_at;
        }
        stored.updated_at = Utc::now();
        configs.insert(stored.job_id.clone(), stored);
        Ok(())
    }

    async fn get(&self, job_id: &str) -> Result<Option<CronJobConfig>> {
        Ok(self.configs.read().await.get(job_id).cloned())
    }

    async fn list_enabled(&self) -> Result<Vec<CronJobConfig>> {
        let mut enabled: Vec<CronJobConfig> = self
            .configs
            .read()
            .await
            .values()
            .filter(|c| c.enabled)
            .cloned()
            .collect();
        enabled.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(enabled)
    }

    async fn update_last_run(&self, job_id: &str, at: DateTime<Utc>) -> Result<()> {
        let mut configs = self.configs.write().await;
        let config = configs
            .get_mut(job_id)
            .ok_or_else(|| Error::NotFound(format!("cron job {}", job_id)))?;
        config.last_run = Some(at);
        config.updated_at = Utc::now();
        Ok(())
    }

    async fn set_enabled(&self, job_id: &str, enabled: bool) -> Result<()> {
        let mut configs = self.configs.write().await;
        let config = configs
            .get_mut(job_id)
            .ok_or_else(|| Error::NotFound(format!("cron job {}", job_id)))?;
        config.enabled = enabled;
        config.updated_at = Utc::now();
        Ok(())
    }

    async fn delete(&self, job_id: &str) -> Result<()> {
        self.configs.write().await.remove(job_id);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    credentials: RwLock<HashMap<String, Credential>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, credential: Credential) {
        self.credentials
            .write()
            .await
            .insert(credential.id.clone(), credential);
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get_credential_by_id(&self, id: &str) -> Result<Option<Credential>> {
        Ok(self.credentials.read().await.get(id).cloned())
    }

    async fn update_credential_last_used(&self, id: &str) -> Result<()> {
        let mut credentials = self.credentials.write().await;
        let credential = credentials
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("credential {}", id)))?;
        credential.last_used_at = Some(Utc::now());
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    values: RwLock<HashMap<String, String>>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SettingsStore for MemorySettingsStore {
    async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.read().await.get(key).cloned())
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.values
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

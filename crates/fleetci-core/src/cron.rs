//! Persisted cron trigger configuration.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::workflow::{Edge, Node};

/// One cron-trigger node of one workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CronJobConfig {
    /// `cron_{project_id}_{cron_node_id}`.
    pub job_id: String,
    pub project_id: String,
    pub cron_node_id: String,
    pub cron_node_label: Option<String>,
    pub cron_expression: String,
    pub enabled: bool,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    pub last_run: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CronJobConfig {
    pub fn key(project_id: &str, cron_node_id: &str) -> String {
        format!("cron_{}_{}", project_id, cron_node_id)
    }
}

/// Storage for cron configurations.
#[async_trait]
pub trait CronStore: Send + Sync {
    /// Insert or replace a configuration. `last_run` and `created_at` of an
    /// existing row are preserved.
    async fn upsert(&self, config: &CronJobConfig) -> Result<()>;

    async fn get(&self, job_id: &str) -> Result<Option<CronJobConfig>>;

    async fn list_enabled(&self) -> Result<Vec<CronJobConfig>>;

    async fn update_last_run(&self, job_id: &str, at: DateTime<Utc>) -> Result<()>;

    async fn set_enabled(&self, job_id: &str, enabled: bool) -> Result<()>;

    async fn delete(&self, job_id: &str) -> Result<()>;
}

//! Cron configuration repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleetci_core::cron::{CronJobConfig, CronStore};
use fleetci_core::workflow::{Edge, Node};
use sqlx::PgPool;
use sqlx::types::Json;

use crate::DbResult;

#[derive(Debug, sqlx::FromRow)]
struct CronJobRow {
    job_id: String,
    project_id: String,
    cron_node_id: String,
    cron_node_label: Option<String>,
    cron_expression: String,
    enabled: bool,
    nodes: Json<Vec<Node>>,
    edges: Json<Vec<Edge>>,
    last_run: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<CronJobRow> for CronJobConfig {
    fn from(row: CronJobRow) -> Self {
        CronJobConfig {
            job_id: row.job_id,
            project_id: row.project_id,
            cron_node_id: row.cron_node_id,
            cron_node_label: row.cron_node_label,
            cron_expression: row.cron_expression,
            enabled: row.enabled,
            nodes: row.nodes.0,
            edges: row.edges.0,
            last_run: row.last_run,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// PostgreSQL implementation of [`CronStore`].
pub struct PgCronRepo {
    pool: PgPool,
}

impl PgCronRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn upsert_config(&self, config: &CronJobConfig) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO cron_jobs (
                job_id, project_id, cron_node_id, cron_node_label, cron_expression,
                enabled, nodes, edges, last_run, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NOW())
            ON CONFLICT (job_id) DO UPDATE SET
                project_id = EXCLUDED.project_id,
                cron_node_id = EXCLUDED.cron_node_id,
                cron_node_label = EXCLUDED.cron_node_label,
                cron_expression = EXCLUDED.cron_expression,
                enabled = EXCLUDED.enabled,
                nodes = EXCLUDED.nodes,
                edges = EXCLUDED.edges,
                updated_at = NOW()
            "#,
        )
        .bind(&config.job_id)
        .bind(&config.project_id)
        .bind(&config.cron_node_id)
        .bind(&config.cron_node_label)
        .bind(&config.cron_expression)
        .bind(config.enabled)
        .bind(Json(&config.nodes))
        .bind(Json(&config.edges))
        .bind(config.last_run)
        .bind(config.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_config(&self, job_id: &str) -> DbResult<Option<CronJobConfig>> {
        let row = sqlx::query_as::<_, CronJobRow>("SELECT * FROM cron_jobs WHERE job_id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }

    pub async fn list_enabled_configs(&self) -> DbResult<Vec<CronJobConfig>> {
        let rows = sqlx::query_as::<_, CronJobRow>(
            "SELECT * FROM cron_jobs WHERE enabled ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn touch_last_run(&self, job_id: &str, at: DateTime<Utc>) -> DbResult<()> {
        sqlx::query("UPDATE cron_jobs SET last_run = $2, updated_at = NOW() WHERE job_id = $1")
            .bind(job_id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_enabled(&self, job_id: &str, enabled: bool) -> DbResult<()> {
        sqlx::query("UPDATE cron_jobs SET enabled = $2, updated_at = NOW() WHERE job_id = $1")
            .bind(job_id)
            .bind(enabled)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_config(&self, job_id: &str) -> DbResult<()> {
        sqlx::query("DELETE FROM cron_jobs WHERE job_id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl CronStore for PgCronRepo {
    async fn upsert(&self, config: &CronJobConfig) -> fleetci_core::Result<()> {
        Ok(self.upsert_config(config).await?)
    }

    async fn get(&self, job_id: &str) -> fleetci_core::Result<Option<CronJobConfig>> {
        Ok(self.get_config(job_id).await?)
    }

    async fn list_enabled(&self) -> fleetci_core::Result<Vec<CronJobConfig>> {
        Ok(self.list_enabled_configs().await?)
    }

    async fn update_last_run(&self, job_id: &str, at: DateTime<Utc>) -> fleetci_core::Result<()> {
        Ok(self.touch_last_run(job_id, at).await?)
    }

    async fn set_enabled(&self, job_id: &str, enabled: bool) -> fleetci_core::Result<()> {
        Ok(self.update_enabled(job_id, enabled).await?)
    }

    async fn delete(&self, job_id: &str) -> fleetci_core::Result<()> {
        Ok(self.delete_config(job_id).await?)
    }
}

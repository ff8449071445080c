//! System settings repository.

use async_trait::async_trait;
use fleetci_core::settings::SettingsStore;
use sqlx::PgPool;

use crate::DbResult;

pub struct PgSettingsRepo {
    pool: PgPool,
}

impl PgSettingsRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, key: &str) -> DbResult<Option<String>> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM settings WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    pub async fn set(&self, key: &str, value: &str) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO settings (key, value, updated_at) VALUES ($1, $2, NOW())
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl SettingsStore for PgSettingsRepo {
    async fn get_setting(&self, key: &str) -> fleetci_core::Result<Option<String>> {
        Ok(self.get(key).await?)
    }

    async fn set_setting(&self, key: &str, value: &str) -> fleetci_core::Result<()> {
        Ok(self.set(key, value).await?)
    }
}

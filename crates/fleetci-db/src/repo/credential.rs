//! Credential repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleetci_core::credential::{Credential, CredentialStore};
use sqlx::PgPool;

use crate::{DbError, DbResult};

#[derive(Debug, sqlx::FromRow)]
struct CredentialRow {
    id: String,
    name: String,
    credential_type: String,
    username: Option<String>,
    filename: Option<String>,
    secret: String,
    is_active: bool,
    expires_at: Option<DateTime<Utc>>,
    last_used_at: Option<DateTime<Utc>>,
}

impl TryFrom<CredentialRow> for Credential {
    type Error = DbError;

    fn try_from(row: CredentialRow) -> DbResult<Self> {
        let credential_type = row
            .credential_type
            .parse()
            .map_err(|e: fleetci_core::Error| DbError::Decode(e.to_string()))?;
        Ok(Credential {
            id: row.id,
            name: row.name,
            credential_type,
            username: row.username,
            filename: row.filename,
            secret: row.secret,
            is_active: row.is_active,
            expires_at: row.expires_at,
            last_used_at: row.last_used_at,
        })
    }
}

/// PostgreSQL implementation of [`CredentialStore`].
pub struct PgCredentialRepo {
    pool: PgPool,
}

impl PgCredentialRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get_by_id(&self, id: &str) -> DbResult<Option<Credential>> {
        let row = sqlx::query_as::<_, CredentialRow>(
            r#"
            SELECT id, name, credential_type, username, filename, secret,
                   is_active, expires_at, last_used_at
            FROM credentials WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Credential::try_from).transpose()
    }

    pub async fn mark_used(&self, id: &str) -> DbResult<()> {
        let result = sqlx::query("UPDATE credentials SET last_used_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("credential {}", id)));
        }
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for PgCredentialRepo {
    async fn get_credential_by_id(&self, id: &str) -> fleetci_core::Result<Option<Credential>> {
        Ok(self.get_by_id(id).await?)
    }

    async fn update_credential_last_used(&self, id: &str) -> fleetci_core::Result<()> {
        Ok(self.mark_used(id).await?)
    }
}

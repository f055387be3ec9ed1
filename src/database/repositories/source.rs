//! Source repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::SourceDbModel;
use crate::database::time;
use crate::{Error, Result};

/// Source repository trait.
#[async_trait]
pub trait SourceRepository: Send + Sync {
    async fn get_source(&self, id: i64) -> Result<SourceDbModel>;
    async fn list_sources(&self) -> Result<Vec<SourceDbModel>>;
    /// Insert a source and return it with the assigned id.
    async fn create_source(&self, source: &SourceDbModel) -> Result<SourceDbModel>;
    /// Record that a job for this source just ran.
    async fn touch_last_run(&self, id: i64) -> Result<()>;
}

/// SQLx implementation of SourceRepository.
pub struct SqlxSourceRepository {
    pool: SqlitePool,
}

impl SqlxSourceRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SourceRepository for SqlxSourceRepository {
    async fn get_source(&self, id: i64) -> Result<SourceDbModel> {
        sqlx::query_as::<_, SourceDbModel>("SELECT * FROM sources WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Source", id))
    }

    async fn list_sources(&self) -> Result<Vec<SourceDbModel>> {
        let sources =
            sqlx::query_as::<_, SourceDbModel>("SELECT * FROM sources ORDER BY created_at")
                .fetch_all(&self.pool)
                .await?;
        Ok(sources)
    }

    async fn create_source(&self, source: &SourceDbModel) -> Result<SourceDbModel> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO sources (
                backend_name, parameter, countback, is_disabled,
                created_at, updated_at, last_run_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&source.backend_name)
        .bind(&source.parameter)
        .bind(source.countback)
        .bind(source.is_disabled)
        .bind(source.created_at)
        .bind(source.updated_at)
        .bind(source.last_run_at)
        .fetch_one(&self.pool)
        .await?;

        let mut created = source.clone();
        created.id = id;
        Ok(created)
    }

    async fn touch_last_run(&self, id: i64) -> Result<()> {
        let now = time::now_ms();
        sqlx::query("UPDATE sources SET last_run_at = ?, updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

//! Job repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::{JobDbModel, JobStatus};
use crate::{Error, Result};

/// Job repository trait.
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn get_job(&self, id: i64) -> Result<JobDbModel>;
    /// Insert a job and return it with the assigned id.
    async fn create_job(&self, job: &JobDbModel) -> Result<JobDbModel>;
    /// Jobs eligible for dispatch: `finished_at IS NULL` and not currently
    /// claimed by the engine, ordered by `created_at` ascending.
    async fn list_pollable(&self, excluded_ids: &[i64]) -> Result<Vec<JobDbModel>>;
    /// Transition to RUNNING and stamp `run_at`.
    async fn mark_running(&self, id: i64, run_at: i64) -> Result<()>;
    /// Transition to COMPLETED and stamp `finished_at`.
    async fn mark_completed(&self, id: i64, finished_at: i64) -> Result<()>;
    /// Transition to FAILED with an error message and stamp `finished_at`.
    async fn mark_failed(&self, id: i64, error: &str, finished_at: i64) -> Result<()>;
}

/// SQLx implementation of JobRepository.
pub struct SqlxJobRepository {
    pool: SqlitePool,
}

impl SqlxJobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobRepository for SqlxJobRepository {
    async fn get_job(&self, id: i64) -> Result<JobDbModel> {
        sqlx::query_as::<_, JobDbModel>("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Job", id))
    }

    async fn create_job(&self, job: &JobDbModel) -> Result<JobDbModel> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO jobs (source_id, status, error, created_at, run_at, finished_at)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(job.source_id)
        .bind(&job.status)
        .bind(&job.error)
        .bind(job.created_at)
        .bind(job.run_at)
        .bind(job.finished_at)
        .fetch_one(&self.pool)
        .await?;

        let mut created = job.clone();
        created.id = id;
        Ok(created)
    }

    async fn list_pollable(&self, excluded_ids: &[i64]) -> Result<Vec<JobDbModel>> {
        let mut sql = String::from("SELECT * FROM jobs WHERE finished_at IS NULL");
        if !excluded_ids.is_empty() {
            sql.push_str(" AND id NOT IN (");
            sql.push_str(&vec!["?"; excluded_ids.len()].join(", "));
            sql.push(')');
        }
        sql.push_str(" ORDER BY created_at ASC");

        let mut query = sqlx::query_as::<_, JobDbModel>(&sql);
        for id in excluded_ids {
            query = query.bind(id);
        }
        let jobs = query.fetch_all(&self.pool).await?;
        Ok(jobs)
    }

    async fn mark_running(&self, id: i64, run_at: i64) -> Result<()> {
        sqlx::query("UPDATE jobs SET status = ?, run_at = ? WHERE id = ?")
            .bind(JobStatus::Running.as_str())
            .bind(run_at)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_completed(&self, id: i64, finished_at: i64) -> Result<()> {
        sqlx::query("UPDATE jobs SET status = ?, finished_at = ? WHERE id = ?")
            .bind(JobStatus::Completed.as_str())
            .bind(finished_at)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_failed(&self, id: i64, error: &str, finished_at: i64) -> Result<()> {
        sqlx::query("UPDATE jobs SET status = ?, error = ?, finished_at = ? WHERE id = ?")
            .bind(JobStatus::Failed.as_str())
            .bind(error)
            .bind(finished_at)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database;
    use crate::database::models::SourceDbModel;
    use crate::database::repositories::{SourceRepository, SqlxSourceRepository};
    use crate::database::time;

    async fn setup() -> (SqlxJobRepository, i64) {
        let pool = database::init_pool_with_size("sqlite::memory:", 1)
            .await
            .unwrap();
        database::run_migrations(&pool).await.unwrap();
        let source = SqlxSourceRepository::new(pool.clone())
            .create_source(&SourceDbModel::new("claw.reddit.v1", "r/wallpapers"))
            .await
            .unwrap();
        (SqlxJobRepository::new(pool), source.id)
    }

    #[tokio::test]
    async fn test_pollable_excludes_tracked_and_finished_jobs() {
        let (repo, source_id) = setup().await;

        let first = repo.create_job(&JobDbModel::new(source_id)).await.unwrap();
        let second = repo.create_job(&JobDbModel::new(source_id)).await.unwrap();
        let third = repo.create_job(&JobDbModel::new(source_id)).await.unwrap();

        repo.mark_completed(third.id, time::now_ms()).await.unwrap();

        let pollable = repo.list_pollable(&[second.id]).await.unwrap();
        let ids: Vec<i64> = pollable.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![first.id]);
    }

    #[tokio::test]
    async fn test_pollable_orders_by_created_at() {
        let (repo, source_id) = setup().await;

        let mut early = JobDbModel::new(source_id);
        early.created_at = 1_000;
        let mut late = JobDbModel::new(source_id);
        late.created_at = 2_000;

        // Insert the late one first to make sure ordering comes from the
        // column, not insertion order.
        let late = repo.create_job(&late).await.unwrap();
        let early = repo.create_job(&early).await.unwrap();

        let pollable = repo.list_pollable(&[]).await.unwrap();
        let ids: Vec<i64> = pollable.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![early.id, late.id]);
    }

    #[tokio::test]
    async fn test_status_transitions_maintain_invariant() {
        let (repo, source_id) = setup().await;
        let job = repo.create_job(&JobDbModel::new(source_id)).await.unwrap();

        repo.mark_running(job.id, time::now_ms()).await.unwrap();
        let running = repo.get_job(job.id).await.unwrap();
        assert_eq!(running.get_status(), Some(JobStatus::Running));
        assert!(running.run_at.is_some());
        assert!(running.finished_at.is_none());

        repo.mark_failed(job.id, "backend exploded", time::now_ms())
            .await
            .unwrap();
        let failed = repo.get_job(job.id).await.unwrap();
        assert_eq!(failed.get_status(), Some(JobStatus::Failed));
        assert_eq!(failed.error.as_deref(), Some("backend exploded"));
        assert!(failed.finished_at.is_some());
    }
}

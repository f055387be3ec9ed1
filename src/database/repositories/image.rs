//! Image repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::{ImageDbModel, ImagePathDbModel, NewImage};
use crate::database::time;
use crate::Result;

/// Image repository trait.
#[async_trait]
pub trait ImageRepository: Send + Sync {
    async fn get_by_download_url(&self, download_url: &str) -> Result<Option<ImageDbModel>>;
    /// Insert the image row together with its primary path row in one
    /// transaction and return the new image id.
    async fn insert_with_primary_path(&self, image: &NewImage) -> Result<i64>;
    /// Record an additional filesystem location for an image.
    async fn insert_image_path(&self, image_id: i64, path: &str) -> Result<()>;
    /// Assign an image to a device; an existing assignment is left untouched.
    async fn upsert_image_device(&self, image_id: i64, device_id: i64) -> Result<()>;
    async fn list_paths(&self, image_id: i64) -> Result<Vec<ImagePathDbModel>>;
    async fn count_devices(&self, image_id: i64) -> Result<i64>;
}

/// SQLx implementation of ImageRepository.
pub struct SqlxImageRepository {
    pool: SqlitePool,
}

impl SqlxImageRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ImageRepository for SqlxImageRepository {
    async fn get_by_download_url(&self, download_url: &str) -> Result<Option<ImageDbModel>> {
        let image =
            sqlx::query_as::<_, ImageDbModel>("SELECT * FROM images WHERE download_url = ?")
                .bind(download_url)
                .fetch_optional(&self.pool)
                .await?;
        Ok(image)
    }

    async fn insert_with_primary_path(&self, image: &NewImage) -> Result<i64> {
        let now = time::now_ms();
        let mut tx = self.pool.begin().await?;

        let image_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO images (
                source_id, download_url, width, height, filesize, is_nsfw,
                post_author, post_author_url, post_url, thumbnail_url,
                is_favorite, image_path, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(image.source_id)
        .bind(&image.download_url)
        .bind(image.width)
        .bind(image.height)
        .bind(image.filesize)
        .bind(image.is_nsfw)
        .bind(&image.post_author)
        .bind(&image.post_author_url)
        .bind(&image.post_url)
        .bind(&image.thumbnail_url)
        .bind(&image.image_path)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO image_paths (image_id, path, created_at) VALUES (?, ?, ?)")
            .bind(image_id)
            .bind(&image.image_path)
            .bind(now)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(image_id)
    }

    async fn insert_image_path(&self, image_id: i64, path: &str) -> Result<()> {
        // Re-running a job re-materializes the same device paths; recording
        // them must stay idempotent.
        sqlx::query(
            r#"
            INSERT INTO image_paths (image_id, path, created_at)
            VALUES (?, ?, ?)
            ON CONFLICT (image_id, path) DO NOTHING
            "#,
        )
        .bind(image_id)
        .bind(path)
        .bind(time::now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_image_device(&self, image_id: i64, device_id: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO image_devices (image_id, device_id, created_at)
            VALUES (?, ?, ?)
            ON CONFLICT (image_id, device_id) DO NOTHING
            "#,
        )
        .bind(image_id)
        .bind(device_id)
        .bind(time::now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_paths(&self, image_id: i64) -> Result<Vec<ImagePathDbModel>> {
        let paths = sqlx::query_as::<_, ImagePathDbModel>(
            "SELECT * FROM image_paths WHERE image_id = ? ORDER BY id",
        )
        .bind(image_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(paths)
    }

    async fn count_devices(&self, image_id: i64) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM image_devices WHERE image_id = ?")
                .bind(image_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }
}

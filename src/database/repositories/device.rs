//! Device repository, including the device matcher query.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::{DeviceDbModel, NsfwMode};
use crate::source::ImageMeta;
use crate::{Error, Result};

/// Device repository trait.
#[async_trait]
pub trait DeviceRepository: Send + Sync {
    async fn get_device(&self, id: i64) -> Result<DeviceDbModel>;
    async fn list_devices(&self) -> Result<Vec<DeviceDbModel>>;
    /// Insert a device and return it with the assigned id.
    async fn create_device(&self, device: &DeviceDbModel) -> Result<DeviceDbModel>;
    /// All enabled devices whose criteria accept the given image.
    ///
    /// Deterministic and side-effect free; result ordering is unspecified.
    async fn find_matching(&self, image: &ImageMeta) -> Result<Vec<DeviceDbModel>>;
}

/// SQLx implementation of DeviceRepository.
pub struct SqlxDeviceRepository {
    pool: SqlitePool,
}

impl SqlxDeviceRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeviceRepository for SqlxDeviceRepository {
    async fn get_device(&self, id: i64) -> Result<DeviceDbModel> {
        sqlx::query_as::<_, DeviceDbModel>("SELECT * FROM devices WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Device", id))
    }

    async fn list_devices(&self) -> Result<Vec<DeviceDbModel>> {
        let devices = sqlx::query_as::<_, DeviceDbModel>("SELECT * FROM devices ORDER BY slug")
            .fetch_all(&self.pool)
            .await?;
        Ok(devices)
    }

    async fn create_device(&self, device: &DeviceDbModel) -> Result<DeviceDbModel> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO devices (
                slug, name, width, height, aspect_ratio_difference,
                image_min_width, image_max_width, image_min_height, image_max_height,
                image_min_filesize, image_max_filesize, nsfw_mode, is_enabled,
                save_dir, filename_template, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&device.slug)
        .bind(&device.name)
        .bind(device.width)
        .bind(device.height)
        .bind(device.aspect_ratio_difference)
        .bind(device.image_min_width)
        .bind(device.image_max_width)
        .bind(device.image_min_height)
        .bind(device.image_max_height)
        .bind(device.image_min_filesize)
        .bind(device.image_max_filesize)
        .bind(device.nsfw_mode)
        .bind(device.is_enabled)
        .bind(&device.save_dir)
        .bind(&device.filename_template)
        .bind(device.created_at)
        .bind(device.updated_at)
        .fetch_one(&self.pool)
        .await?;

        let mut created = device.clone();
        created.id = id;
        Ok(created)
    }

    async fn find_matching(&self, image: &ImageMeta) -> Result<Vec<DeviceDbModel>> {
        // An NSFW image is rejected by BLOCK devices; a SFW image by ONLY
        // devices. Every min/max bound treats zero as "no bound", and the
        // aspect-ratio tolerance is a closed interval.
        let excluded_mode = if image.is_nsfw {
            NsfwMode::Block
        } else {
            NsfwMode::Only
        };
        let image_ratio = image.width as f64 / image.height as f64;

        let devices = sqlx::query_as::<_, DeviceDbModel>(
            r#"
            SELECT * FROM devices
            WHERE is_enabled = 1
              AND nsfw_mode <> ?
              AND (image_min_width = 0 OR image_min_width <= ?)
              AND (image_max_width = 0 OR image_max_width >= ?)
              AND (image_min_height = 0 OR image_min_height <= ?)
              AND (image_max_height = 0 OR image_max_height >= ?)
              AND (image_min_filesize = 0 OR image_min_filesize <= ?)
              AND (image_max_filesize = 0 OR image_max_filesize >= ?)
              AND ABS(CAST(width AS REAL) / CAST(height AS REAL) - ?) <= aspect_ratio_difference
            "#,
        )
        .bind(excluded_mode.as_i64())
        .bind(image.width)
        .bind(image.width)
        .bind(image.height)
        .bind(image.height)
        .bind(image.filesize)
        .bind(image.filesize)
        .bind(image_ratio)
        .fetch_all(&self.pool)
        .await?;
        Ok(devices)
    }
}

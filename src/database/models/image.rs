//! Image, image-path and image-device database models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A materialized download, unique by `download_url`.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ImageDbModel {
    pub id: i64,
    pub source_id: i64,
    pub download_url: String,
    pub width: i64,
    pub height: i64,
    pub filesize: i64,
    pub is_nsfw: bool,
    pub post_author: Option<String>,
    pub post_author_url: Option<String>,
    pub post_url: Option<String>,
    pub thumbnail_url: Option<String>,
    pub is_favorite: bool,
    /// Primary content-addressed location on disk.
    pub image_path: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Insert payload for a new image row; the id and timestamps are assigned by
/// the repository.
#[derive(Debug, Clone)]
pub struct NewImage {
    pub source_id: i64,
    pub download_url: String,
    pub width: i64,
    pub height: i64,
    pub filesize: i64,
    pub is_nsfw: bool,
    pub post_author: Option<String>,
    pub post_author_url: Option<String>,
    pub post_url: Option<String>,
    pub thumbnail_url: Option<String>,
    pub image_path: String,
}

/// Each filesystem location an image occupies: the primary path plus one per
/// assigned device.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ImagePathDbModel {
    pub id: i64,
    pub image_id: i64,
    pub path: String,
    pub created_at: i64,
}

/// Assignment of an image to a device. Unique on `(image_id, device_id)`.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ImageDeviceDbModel {
    pub image_id: i64,
    pub device_id: i64,
    pub created_at: i64,
}

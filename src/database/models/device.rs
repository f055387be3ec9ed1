//! Device database model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time;

/// NSFW acceptance policy for a device.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NsfwMode {
    Unspecified,
    /// NSFW images are rejected.
    Block,
    /// Both SFW and NSFW images are accepted.
    Accept,
    /// Only NSFW images are accepted.
    Only,
}

impl NsfwMode {
    pub fn as_i64(&self) -> i64 {
        match self {
            Self::Unspecified => 0,
            Self::Block => 1,
            Self::Accept => 2,
            Self::Only => 3,
        }
    }

    pub fn parse(value: i64) -> Option<Self> {
        match value {
            0 => Some(Self::Unspecified),
            1 => Some(Self::Block),
            2 => Some(Self::Accept),
            3 => Some(Self::Only),
            _ => None,
        }
    }
}

/// A consumer profile expressing the physical constraints that decide which
/// images are eligible for it.
///
/// All `image_min_*` / `image_max_*` bounds use zero to mean "no bound".
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DeviceDbModel {
    pub id: i64,
    /// Filesystem-friendly identifier; names the per-device directory under
    /// the download base dir unless `save_dir` overrides it.
    pub slug: String,
    pub name: String,
    /// Screen width in pixels. Must be positive.
    pub width: i64,
    /// Screen height in pixels. Must be positive.
    pub height: i64,
    /// Maximum allowed |device ratio - image ratio|. Matching is a closed
    /// interval: a difference exactly equal to this value still matches.
    pub aspect_ratio_difference: f64,
    pub image_min_width: i64,
    pub image_max_width: i64,
    pub image_min_height: i64,
    pub image_max_height: i64,
    pub image_min_filesize: i64,
    pub image_max_filesize: i64,
    /// Stored [`NsfwMode`] discriminant.
    pub nsfw_mode: i64,
    pub is_enabled: bool,
    pub save_dir: Option<String>,
    /// Per-device filename template. Supports `{source}`, `{filename}` and
    /// `{slug}` placeholders; when absent the default is
    /// `<source>_<filename>`.
    pub filename_template: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl DeviceDbModel {
    pub fn new(slug: impl Into<String>, width: i64, height: i64) -> Self {
        let now = time::now_ms();
        let slug = slug.into();
        Self {
            id: 0,
            name: slug.clone(),
            slug,
            width,
            height,
            aspect_ratio_difference: 0.0,
            image_min_width: 0,
            image_max_width: 0,
            image_min_height: 0,
            image_max_height: 0,
            image_min_filesize: 0,
            image_max_filesize: 0,
            nsfw_mode: NsfwMode::Unspecified.as_i64(),
            is_enabled: true,
            save_dir: None,
            filename_template: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_nsfw_mode(mut self, mode: NsfwMode) -> Self {
        self.nsfw_mode = mode.as_i64();
        self
    }

    pub fn with_aspect_ratio_difference(mut self, difference: f64) -> Self {
        self.aspect_ratio_difference = difference;
        self
    }

    pub fn nsfw_mode(&self) -> Option<NsfwMode> {
        NsfwMode::parse(self.nsfw_mode)
    }

    pub fn aspect_ratio(&self) -> f64 {
        self.width as f64 / self.height as f64
    }
}

//! Download pipeline: dedup lookup, temp download, atomic promotion, and
//! per-device materialization.
//!
//! Each image is downloaded at most once into a content-addressed primary
//! location, then fanned out to matching devices by hardlink (falling back to
//! copy). Database rows are written so that re-running the same job is
//! idempotent.

pub mod stall;

pub use stall::StallReader;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::ConfigHandle;
use crate::database::models::{DeviceDbModel, NewImage};
use crate::database::repositories::ImageRepository;
use crate::source::ImageMeta;
use crate::utils::filename::{sanitize_filename, truncate_filename};
use crate::utils::fs::{ensure_dir_all, ensure_parent_dir, hardlink_or_copy};
use crate::{Error, Result};

/// One unit of download work: an image plus the devices that accepted it.
#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub image: ImageMeta,
    pub devices: Vec<DeviceDbModel>,
    pub source_id: i64,
    /// Names the per-source directory under `<base_dir>/images/`.
    pub source_name: String,
}

pub struct Downloader {
    http: reqwest::Client,
    config: ConfigHandle,
    images: Arc<dyn ImageRepository>,
}

impl Downloader {
    pub fn new(http: reqwest::Client, config: ConfigHandle, images: Arc<dyn ImageRepository>) -> Self {
        Self {
            http,
            config,
            images,
        }
    }

    /// Run the pipeline for one image. Returns the image row id.
    ///
    /// Any failure here is scoped to this image; the caller logs it and moves
    /// on to the next one.
    pub async fn process(&self, token: &CancellationToken, task: &DownloadTask) -> Result<i64> {
        let download = self.config.get().download;

        let filename = self.resolve_filename(&task.image, download.filename_max_length);
        let primary_path = download
            .base_dir
            .join("images")
            .join(&task.source_name)
            .join(&filename);

        let existing = self.images.get_by_download_url(&task.image.download_url).await?;

        let (image_id, primary_path) = match &existing {
            Some(image) => {
                let on_disk = PathBuf::from(&image.image_path);
                if self
                    .existing_file_is_sound(&on_disk, &download.sanity_check)
                    .await
                {
                    debug!(path = %on_disk.display(), "image already on disk, skipping download");
                    (image.id, on_disk)
                } else {
                    debug!(
                        url = %task.image.download_url,
                        "image row exists but file is missing or truncated, re-downloading"
                    );
                    self.download_and_promote(token, task, &on_disk).await?;
                    (image.id, on_disk)
                }
            }
            None => {
                self.download_and_promote(token, task, &primary_path).await?;
                let id = self
                    .images
                    .insert_with_primary_path(&new_image_row(task, &primary_path))
                    .await?;
                (id, primary_path)
            }
        };

        self.materialize_for_devices(task, image_id, &primary_path, &download.base_dir)
            .await?;

        Ok(image_id)
    }

    /// Backend-supplied filename when present, otherwise a content-addressed
    /// fallback derived from the download URL.
    fn resolve_filename(&self, image: &ImageMeta, max_length: usize) -> String {
        let filename = match image.filename.as_deref() {
            Some(name) if !name.is_empty() => sanitize_filename(name),
            _ => {
                let digest = Sha256::digest(image.download_url.as_bytes());
                let ext = extension_from_url(&image.download_url).unwrap_or_else(|| ".jpg".into());
                format!("{digest:x}{ext}")
            }
        };
        truncate_filename(&filename, max_length)
    }

    /// Whether an already-downloaded file can be reused as-is.
    async fn existing_file_is_sound(
        &self,
        path: &Path,
        sanity: &crate::config::SanityCheckConfig,
    ) -> bool {
        match tokio::fs::metadata(path).await {
            Ok(meta) if !meta.is_file() => false,
            Ok(meta) => !sanity.enabled || meta.len() >= sanity.min_image_filesize,
            Err(_) => false,
        }
    }

    /// Stream the image into a uniquely named temp file, then promote it to
    /// `final_path`. The temp file is removed on every exit path.
    async fn download_and_promote(
        &self,
        token: &CancellationToken,
        task: &DownloadTask,
        final_path: &Path,
    ) -> Result<()> {
        let download = self.config.get().download;
        let tmp_dir = download.tmp_dir.join("claw");
        ensure_dir_all(&tmp_dir).await?;
        let tmp_path = tmp_dir.join(uuid::Uuid::new_v4().to_string());

        let bytes = match self
            .fetch_to_file(token, &task.image.download_url, &tmp_path, &download)
            .await
        {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp_path).await;
                return Err(e);
            }
        };

        ensure_parent_dir(final_path).await?;
        let promoted = hardlink_or_copy(&tmp_path, final_path).await;
        let _ = tokio::fs::remove_file(&tmp_path).await;
        promoted?;

        info!(
            url = %task.image.download_url,
            path = %final_path.display(),
            bytes,
            "image downloaded"
        );
        Ok(())
    }

    async fn fetch_to_file(
        &self,
        token: &CancellationToken,
        url: &str,
        path: &Path,
        download: &crate::config::DownloadConfig,
    ) -> Result<u64> {
        let response = tokio::select! {
            _ = token.cancelled() => return Err(Error::Cancelled),
            response = self.http.get(url).send() => response?,
        };
        if !response.status().is_success() {
            return Err(Error::Download(format!(
                "GET {url} returned status {}",
                response.status().as_u16()
            )));
        }

        let mut reader = StallReader::new(
            response.bytes_stream(),
            download.stall_monitor.clone(),
            token.clone(),
        );

        let mut file = tokio::fs::File::create(path)
            .await
            .map_err(|e| Error::io_path("creating temp file", path, e))?;
        while let Some(chunk) = reader.next_chunk().await {
            let chunk = chunk?;
            file.write_all(&chunk)
                .await
                .map_err(|e| Error::io_path("writing temp file", path, e))?;
        }
        file.flush()
            .await
            .map_err(|e| Error::io_path("flushing temp file", path, e))?;

        Ok(reader.total_bytes())
    }

    /// Hardlink or copy the primary file into each matching device's
    /// directory and record the assignment rows.
    async fn materialize_for_devices(
        &self,
        task: &DownloadTask,
        image_id: i64,
        primary_path: &Path,
        base_dir: &Path,
    ) -> Result<()> {
        let primary_filename = primary_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Download(format!("invalid primary path: {}", primary_path.display())))?;

        for device in &task.devices {
            let target_dir = match device.save_dir.as_deref() {
                Some(dir) if !dir.is_empty() => PathBuf::from(dir),
                _ => base_dir.join(&device.slug),
            };
            ensure_dir_all(&target_dir).await?;

            let target_name = device_filename(device, &task.source_name, primary_filename);
            let target_path = target_dir.join(target_name);

            hardlink_or_copy(primary_path, &target_path).await?;

            self.images.upsert_image_device(image_id, device.id).await?;
            self.images
                .insert_image_path(image_id, &target_path.to_string_lossy())
                .await?;

            debug!(
                device = %device.slug,
                path = %target_path.display(),
                "image materialized for device"
            );
        }
        Ok(())
    }
}

/// Filename for a device copy: the device template when set, else
/// `<source>_<filename>`.
fn device_filename(device: &DeviceDbModel, source_name: &str, filename: &str) -> String {
    let name = match device.filename_template.as_deref() {
        Some(template) if !template.is_empty() => template
            .replace("{source}", source_name)
            .replace("{filename}", filename)
            .replace("{slug}", &device.slug),
        _ => format!("{source_name}_{filename}"),
    };
    sanitize_filename(&name)
}

fn new_image_row(task: &DownloadTask, primary_path: &Path) -> NewImage {
    let image = &task.image;
    NewImage {
        source_id: task.source_id,
        download_url: image.download_url.clone(),
        width: image.width,
        height: image.height,
        filesize: image.filesize,
        is_nsfw: image.is_nsfw,
        post_author: none_if_empty(&image.author),
        post_author_url: none_if_empty(&image.author_url),
        post_url: none_if_empty(&image.post_url),
        thumbnail_url: image.thumbnail_url.clone(),
        image_path: primary_path.to_string_lossy().into_owned(),
    }
}

fn none_if_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn extension_from_url(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next()?;
    let basename = path.rsplit('/').next()?;
    match basename.rfind('.') {
        Some(idx) if idx > 0 => Some(basename[idx..].to_lowercase()),
        _ => None,
    }
}

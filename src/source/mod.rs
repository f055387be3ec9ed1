//! Source backends: in-process plug-ins that enumerate image metadata.
//!
//! A backend never downloads full image bytes; it returns metadata and a
//! download URL per image, and the engine handles filtering, device
//! assignment, and downloading.

pub mod reddit;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Result;

/// Input for one backend invocation.
#[derive(Debug, Clone, Default)]
pub struct Request {
    /// Backend-interpreted source parameter (e.g. `r/wallpapers`).
    pub parameter: String,
    /// How far back in the source's own ordering to look. This bounds the
    /// lookback window, not the result count. Zero or negative means "use the
    /// backend default".
    pub countback: i64,
    /// Maximum allowed length for generated filenames including the
    /// extension. Zero or negative means "use the backend default".
    pub filename_max_length: i64,
}

/// Output of one backend invocation: an ordered list of image metadata.
///
/// Ordering is backend-defined but stable within one call.
#[derive(Debug, Clone, Default)]
pub struct Response {
    pub images: Vec<ImageMeta>,
}

/// Metadata for a single candidate image.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageMeta {
    /// The actual URL to download the image.
    pub download_url: String,
    /// Width in pixels.
    pub width: i64,
    /// Height in pixels.
    pub height: i64,
    /// Filesize in bytes. Zero when the source does not expose it.
    pub filesize: i64,
    /// Artist, author, or uploader name.
    pub author: String,
    /// URL to the author's profile or page.
    pub author_url: String,
    /// URL to the page where the image was posted.
    pub post_url: String,
    /// Optional thumbnail URL.
    pub thumbnail_url: Option<String>,
    /// Backend-chosen filename. When absent the engine derives a
    /// content-addressed name from the download URL.
    pub filename: Option<String>,
    /// When the image was posted or uploaded.
    pub posted_at: Option<DateTime<Utc>>,
    pub is_nsfw: bool,
}

/// An in-process plug-in that enumerates image metadata for a source.
///
/// `name()` must be unique, URL- and filesystem-friendly, and is recommended
/// to carry a version (`<namespace>.<name>.<version>`, e.g. `claw.reddit.v1`)
/// so parameter-schema breaks can bump it.
#[async_trait]
pub trait SourceBackend: Send + Sync {
    fn name(&self) -> &'static str;
    fn display_name(&self) -> &'static str;
    fn author(&self) -> &'static str;
    fn author_url(&self) -> &'static str;
    /// Human-readable description. Markdown is supported; empty hides it.
    fn description(&self) -> &'static str;

    /// Whether users must supply a non-empty parameter.
    fn require_parameter(&self) -> bool;
    /// Help text for the parameter. Markdown is supported.
    fn parameter_help(&self) -> &'static str;
    /// Short hint shown in the parameter input field.
    fn parameter_placeholder(&self) -> &'static str;

    /// Recommended lookback default, chosen with the source's rate limits in
    /// mind. The engine still passes zero or negative countbacks through to
    /// [`SourceBackend::run`], which must substitute this value itself.
    fn default_countback(&self) -> i64;

    /// Validate a user-supplied parameter and normalize it to the backend's
    /// canonical form. May perform I/O (e.g. follow redirects to discover
    /// canonical casing). Error messages must be user-actionable.
    async fn validate_transform_parameter(&self, parameter: &str) -> Result<String>;

    /// Whether this backend can warn about conflicting schedules. Declared
    /// for UI use only; the engine never calls the check itself.
    fn has_schedule_conflict_check(&self) -> bool {
        false
    }

    /// Produce a human-readable warning when the request conflicts with an
    /// existing schedule, if this backend supports the check.
    fn schedule_conflict_check(&self, _request: &Request) -> Option<String> {
        None
    }

    /// Enumerate image metadata for the request.
    ///
    /// Transport errors surface as a single error; a partial enumeration that
    /// yielded some images may still return them with no error at the
    /// backend's discretion.
    async fn run(&self, request: Request) -> Result<Response>;
}

/// Name-to-backend lookup, populated at engine construction and immutable
/// thereafter.
#[derive(Default)]
pub struct SourceRegistry {
    backends: HashMap<&'static str, Arc<dyn SourceBackend>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, backend: Arc<dyn SourceBackend>) -> Self {
        self.backends.insert(backend.name(), backend);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn SourceBackend>> {
        self.backends.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.backends.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

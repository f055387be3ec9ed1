//! Reddit source backend (`claw.reddit.v1`).
//!
//! Walks the public listing JSON API of a subreddit or user page, collecting
//! image posts until the countback window is exhausted. Only metadata is
//! fetched here; HEAD requests are allowed to probe content types and to
//! weed out deleted imgur links.

mod models;

use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use regex::Regex;
use reqwest::header::USER_AGENT;
use tracing::debug;

use crate::source::{ImageMeta, Request, Response, SourceBackend};
use crate::utils::filename::{sanitize_filename, truncate_filename};
use crate::{Error, Result};

use models::{Listing, PostData};

pub const SOURCE_NAME: &str = "claw.reddit.v1";

const REDDIT_USER_AGENT: &str = "claw/1.0";

/// Listing pages cap out at 100 posts per request.
const PAGE_LIMIT: i64 = 100;

const DEFAULT_COUNTBACK: i64 = 300;
const DEFAULT_FILENAME_MAX_LENGTH: usize = 100;

static USER_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:https?://(?:www\.)?reddit\.com/)?(?:u|user)/([a-zA-Z0-9_-]+)(?:\.json)?/?$")
        .expect("user pattern must compile")
});

static SUBREDDIT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:https?://(?:www\.)?reddit\.com/)?r/([a-zA-Z0-9_-]+)(?:\.json)?/?$")
        .expect("subreddit pattern must compile")
});

const IMAGE_EXTENSIONS: &[&str] = &[".jpg", ".jpeg", ".png", ".gif", ".webp", ".bmp"];

const HELP: &str = /* markdown */ r#"This source fetches images from a Reddit user or subreddit.

Supported parameter formats:

- Full URL to a subreddit, e.g. https://reddit.com/r/wallpapers
- Shorthand expressions: r/wallpapers, u/spez
- user/{user} (normalized to u/{user})
- Any of the above with a trailing .json
"#;

pub struct Reddit {
    client: reqwest::Client,
    base_url: String,
}

impl Reddit {
    pub fn new(client: reqwest::Client) -> Self {
        Self::with_base_url(client, "https://reddit.com")
    }

    /// The base URL is swappable so tests can point at a local fixture.
    pub fn with_base_url(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    /// Match the parameter against the supported shapes and normalize it to
    /// `r/<subreddit>` or `u/<user>` without touching the network.
    fn normalize_parameter(parameter: &str) -> Result<String> {
        if parameter.is_empty() {
            return Err(Error::validation("parameter cannot be empty"));
        }
        if let Some(captures) = USER_PATTERN.captures(parameter) {
            return Ok(format!("u/{}", &captures[1]));
        }
        if let Some(captures) = SUBREDDIT_PATTERN.captures(parameter) {
            return Ok(format!("r/{}", &captures[1]));
        }
        Err(Error::validation(
            "invalid Reddit parameter format. Supported patterns:\n\
             - https://[www.]reddit.com/r/<subreddit>[.json]\n\
             - https://[www.]reddit.com/{u|user}/<user>[.json]\n\
             - r/<subreddit>[.json]\n\
             - u/<user>[.json]\n\
             - user/<user>[.json] (normalized to u/<user>)\n\
             \nBracketed parts are optional.",
        ))
    }

    /// Hit the listing endpoint once to confirm the parameter exists, and
    /// adopt the canonical casing Reddit redirects to.
    async fn validate_casing(&self, parameter: &str) -> Result<String> {
        let json_url = format!("{}/{}.json", self.base_url, parameter);
        let response = self
            .client
            .get(&json_url)
            .header(USER_AGENT, REDDIT_USER_AGENT)
            .send()
            .await?;

        if response.url().as_str() != json_url {
            let path = response
                .url()
                .path()
                .trim_end_matches('/')
                .trim_end_matches(".json")
                .trim_start_matches('/');
            return Ok(path.to_string());
        }

        match response.status().as_u16() {
            404 => {
                let (kind, name) = match parameter.split_once('/') {
                    Some(("u", name)) => ("user", name),
                    Some((_, name)) => ("subreddit", name),
                    None => ("subreddit", parameter),
                };
                Err(Error::validation(format!(
                    "{kind} '{name}' not found on Reddit"
                )))
            }
            200 => Ok(parameter.to_string()),
            status => Err(Error::validation(format!(
                "Reddit API returned status {status} for parameter '{parameter}'"
            ))),
        }
    }

    async fn fetch_page(
        &self,
        parameter: &str,
        limit: i64,
        after: Option<&str>,
    ) -> Result<(Vec<PostData>, Option<String>)> {
        let mut request = self
            .client
            .get(format!("{}/{}.json", self.base_url, parameter))
            .header(USER_AGENT, REDDIT_USER_AGENT)
            .query(&[("limit", limit.to_string())]);
        if let Some(after) = after {
            request = request.query(&[("after", after)]);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(Error::Download(format!(
                "Reddit API returned status {}",
                response.status().as_u16()
            )));
        }

        let listing: Listing = response.json().await?;
        let posts = listing.data.children.into_iter().map(|c| c.data).collect();
        Ok((posts, listing.data.after))
    }

    /// Whether the post links to a downloadable image.
    async fn is_image_post(&self, post: &PostData) -> bool {
        let lower_url = post.url.to_lowercase();
        let looks_like_image = post.post_hint.as_deref() == Some("image")
            || IMAGE_EXTENSIONS.iter().any(|ext| lower_url.ends_with(ext))
            || lower_url.contains("i.redd.it")
            || lower_url.contains("i.imgur.com");

        if !looks_like_image {
            return false;
        }
        // Imgur serves a placeholder or 404 for removed images.
        if lower_url.contains("imgur.com") {
            return self.imgur_image_exists(&post.url).await;
        }
        true
    }

    async fn imgur_image_exists(&self, url: &str) -> bool {
        let response = match self
            .client
            .head(url)
            .header(USER_AGENT, REDDIT_USER_AGENT)
            .send()
            .await
        {
            Ok(response) => response,
            Err(_) => return false,
        };
        match response.status().as_u16() {
            200 => true,
            // Rate limited: assume valid to avoid false negatives.
            429 => true,
            _ => false,
        }
    }

    async fn convert_post(&self, post: PostData, request: &Request) -> ImageMeta {
        let mut image = ImageMeta {
            download_url: post.url.clone(),
            author: post.author.clone(),
            author_url: format!("https://reddit.com/u/{}", post.author),
            post_url: format!("https://reddit.com{}", post.permalink),
            posted_at: Utc.timestamp_opt(post.created_utc as i64, 0).single(),
            is_nsfw: post.over_18,
            filename: Some(self.generate_filename(&post, request).await),
            ..ImageMeta::default()
        };

        if let Some(preview) = post
            .preview
            .as_ref()
            .and_then(|preview| preview.images.first())
        {
            image.width = preview.source.width;
            image.height = preview.source.height;
            if !preview.source.url.is_empty() {
                // Reddit HTML-escapes preview URLs.
                image.thumbnail_url = Some(preview.source.url.replace("&amp;", "&"));
            }
        }

        image
    }

    /// Build `<parameter>_<post_id>_<name><ext>`, sanitized and capped at the
    /// requested length with the extension preserved.
    async fn generate_filename(&self, post: &PostData, request: &Request) -> String {
        let name = match image_name_from_url(&post.url) {
            Some(name) => name,
            None => "reddit_image".to_string(),
        };

        let ext = match extension_from_url(&post.url) {
            Some(ext) => ext,
            None => self.probe_extension(&post.url).await.unwrap_or_default(),
        };

        let filename = sanitize_filename(&format!(
            "{}_{}_{}{}",
            request.parameter, post.id, name, ext
        ));

        let max_length = if request.filename_max_length > 0 {
            request.filename_max_length as usize
        } else {
            DEFAULT_FILENAME_MAX_LENGTH
        };
        truncate_filename(&filename, max_length)
    }

    /// HEAD the image and derive an extension from its Content-Type.
    async fn probe_extension(&self, url: &str) -> Option<String> {
        let response = self
            .client
            .head(url)
            .header(USER_AGENT, REDDIT_USER_AGENT)
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)?
            .to_str()
            .ok()?
            .to_string();
        extension_for_content_type(&content_type).map(str::to_string)
    }
}

#[async_trait]
impl SourceBackend for Reddit {
    fn name(&self) -> &'static str {
        SOURCE_NAME
    }

    fn display_name(&self) -> &'static str {
        "Reddit"
    }

    fn author(&self) -> &'static str {
        "Claw"
    }

    fn author_url(&self) -> &'static str {
        "https://github.com/tigorlazuardi/claw"
    }

    fn description(&self) -> &'static str {
        "Fetches images posted to a subreddit or by a Reddit user."
    }

    fn require_parameter(&self) -> bool {
        true
    }

    fn parameter_help(&self) -> &'static str {
        HELP
    }

    fn parameter_placeholder(&self) -> &'static str {
        "Subreddit name or username, e.g. r/wallpapers or u/spez"
    }

    fn default_countback(&self) -> i64 {
        DEFAULT_COUNTBACK
    }

    async fn validate_transform_parameter(&self, parameter: &str) -> Result<String> {
        let normalized = Self::normalize_parameter(parameter)?;
        self.validate_casing(&normalized).await
    }

    async fn run(&self, request: Request) -> Result<Response> {
        let mut countback = if request.countback > 0 {
            request.countback
        } else {
            self.default_countback()
        };

        let mut images = Vec::new();
        let mut after: Option<String> = None;

        while countback > 0 {
            let limit = countback.min(PAGE_LIMIT);
            let (posts, next) = self.fetch_page(&request.parameter, limit, after.as_deref()).await?;
            if posts.is_empty() {
                break;
            }
            countback -= posts.len() as i64;

            for post in posts {
                if !self.is_image_post(&post).await {
                    continue;
                }
                images.push(self.convert_post(post, &request).await);
            }

            after = next;
            if after.is_none() {
                break;
            }
        }

        debug!(
            parameter = %request.parameter,
            images = images.len(),
            "reddit listing walk finished"
        );
        Ok(Response { images })
    }
}

/// Extract a human-meaningful name (without extension) from the image URL.
fn image_name_from_url(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next()?;
    let basename = path.rsplit('/').next()?;
    if basename.is_empty() || basename.contains(':') {
        return None;
    }
    let name = match basename.rfind('.') {
        Some(idx) if idx > 0 => &basename[..idx],
        _ => basename,
    };
    if name.is_empty() {
        return None;
    }
    Some(sanitize_filename(name))
}

/// Extension (with leading dot) taken from the URL path, if any.
fn extension_from_url(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next()?;
    let basename = path.rsplit('/').next()?;
    match basename.rfind('.') {
        Some(idx) if idx > 0 => Some(basename[idx..].to_lowercase()),
        _ => None,
    }
}

fn extension_for_content_type(content_type: &str) -> Option<&'static str> {
    let essence = content_type.split(';').next()?.trim();
    match essence {
        "image/jpeg" => Some(".jpg"),
        "image/png" => Some(".png"),
        "image/gif" => Some(".gif"),
        "image/webp" => Some(".webp"),
        "image/bmp" => Some(".bmp"),
        "image/avif" => Some(".avif"),
        _ => None,
    }
}

//! Attachment Materializer: downloads image files referenced by a command
//! message into a per-task directory on local disk.

use std::path::{Path, PathBuf};

use crate::models::SlackFile;
use crate::{AppError, Result};

/// Directory, relative to the process's working directory, under which
/// per-task attachment directories are created.
pub const ATTACHMENTS_BASE_DIR: &str = ".slackclaw_attachments";

/// Maximum number of images materialized per task.
pub const MAX_IMAGES_PER_TASK: usize = 4;

/// Maximum size, in bytes, accepted for a single image.
pub const MAX_IMAGE_BYTES: u64 = 20 * 1024 * 1024;

/// Authenticated byte-fetcher for Slack's private file URLs.
///
/// A trait so materialization can be exercised in tests without a live
/// Slack API token or network access.
#[async_trait::async_trait]
pub trait FileDownloader: Send + Sync {
    /// Download the full contents of a private Slack file URL.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Attachment` if the request fails or the server
    /// does not respond with a success status.
    async fn download(&self, url_private: &str) -> Result<Vec<u8>>;
}

/// Downloads Slack files over HTTPS using the bot token as a bearer header.
pub struct HttpFileDownloader {
    client: reqwest::Client,
    bot_token: String,
}

impl HttpFileDownloader {
    /// Build a downloader that authenticates with `bot_token`.
    #[must_use]
    pub fn new(bot_token: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            bot_token,
        }
    }
}

#[async_trait::async_trait]
impl FileDownloader for HttpFileDownloader {
    async fn download(&self, url_private: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(url_private)
            .bearer_auth(&self.bot_token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(AppError::Attachment(format!(
                "download failed with status {}",
                response.status()
            )));
        }
        Ok(response.bytes().await?.to_vec())
    }
}

/// Replace every character outside `[A-Za-z0-9._-]` with `_`.
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Infer a file extension, preferring the filename's own extension and
/// falling back to a MIME-type table.
#[must_use]
pub fn infer_extension(filename: &str, mimetype: &str) -> String {
    if let Some((_, ext)) = filename.rsplit_once('.') {
        if !ext.is_empty() && ext.len() <= 8 && ext.chars().all(char::is_alphanumeric) {
            return format!(".{}", ext.to_ascii_lowercase());
        }
    }
    match mimetype {
        "image/png" => ".png",
        "image/jpeg" => ".jpg",
        "image/gif" => ".gif",
        "image/webp" => ".webp",
        _ => ".img",
    }
    .to_owned()
}

/// Materialize up to [`MAX_IMAGES_PER_TASK`] image attachments for a task.
///
/// Filters `files` to MIME `image/*`, caps the count and the per-file size,
/// downloads each through `downloader`, and writes it under
/// `<attachments_base>/<task_id>/NN_<sanitized>.<ext>`. Returns the absolute
/// paths written, in order.
///
/// Any failure (download error, oversize file) aborts the whole batch: the
/// caller is expected to record the task as failed and never enqueue it.
///
/// # Errors
///
/// Returns `AppError::Attachment` if any accepted file fails to download or
/// exceeds [`MAX_IMAGE_BYTES`], or `AppError::Io` if the directory or files
/// cannot be written.
pub async fn materialize_images(
    downloader: &dyn FileDownloader,
    attachments_base: &Path,
    task_id: &str,
    files: &[SlackFile],
) -> Result<Vec<PathBuf>> {
    let images: Vec<&SlackFile> = files
        .iter()
        .filter(|f| f.mimetype.starts_with("image/"))
        .take(MAX_IMAGES_PER_TASK)
        .collect();

    if images.is_empty() {
        return Ok(Vec::new());
    }

    let task_dir = attachments_base.join(task_id);
    tokio::fs::create_dir_all(&task_dir).await?;

    let mut paths = Vec::with_capacity(images.len());
    for (index, file) in images.iter().enumerate() {
        if file.size_bytes > MAX_IMAGE_BYTES {
            return Err(AppError::Attachment(format!(
                "{} exceeds the {}-byte limit",
                file.name, MAX_IMAGE_BYTES
            )));
        }

        let bytes = downloader.download(&file.url_private).await?;
        if bytes.len() as u64 > MAX_IMAGE_BYTES {
            return Err(AppError::Attachment(format!(
                "{} exceeds the {}-byte limit after download",
                file.name, MAX_IMAGE_BYTES
            )));
        }

        let sanitized = sanitize_filename(&file.name);
        let extension = infer_extension(&file.name, &file.mimetype);
        let filename = format!("{:02}_{sanitized}{extension}", index + 1);
        let path = task_dir.join(filename);
        tokio::fs::write(&path, &bytes).await?;

        let absolute = path
            .canonicalize()
            .unwrap_or(path);
        paths.push(absolute);
    }

    Ok(paths)
}

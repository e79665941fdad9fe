//! Generated image storage
//!
//! Images are written to a flat directory under random v4 UUID names. There
//! is no index file: history is derived from file modification times on
//! every query, which keeps the store trivially consistent but makes
//! `list_history` linear in the number of stored images.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// URL path prefix generated images are served under
pub const OUTPUTS_ROUTE: &str = "/outputs";

const IMAGE_EXTENSION: &str = "png";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredImage {
    pub filename: String,
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
}

impl StoredImage {
    /// Public URL of this image relative to the base URL of the request
    pub fn url(&self, base_url: &str) -> String {
        join_url(base_url, &self.filename)
    }
}

/// Build `<base_url>/outputs/<filename>`, tolerating a trailing slash on the base
pub fn join_url(base_url: &str, filename: &str) -> String {
    format!(
        "{}{}/{}",
        base_url.trim_end_matches('/'),
        OUTPUTS_ROUTE,
        filename
    )
}

#[derive(Debug, Clone)]
pub struct OutputStore {
    dir: PathBuf,
}

impl OutputStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist an encoded PNG under a fresh unique name
    pub fn save(&self, png: &[u8]) -> Result<StoredImage> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;

        let filename = format!("{}.{}", Uuid::new_v4(), IMAGE_EXTENSION);
        let path = self.dir.join(&filename);
        fs::write(&path, png).with_context(|| format!("Failed to write {}", path.display()))?;

        let created_at = modified_at(&path).unwrap_or_else(|_| Utc::now());
        tracing::debug!("Stored {} ({} bytes)", filename, png.len());

        Ok(StoredImage {
            filename,
            path,
            created_at,
        })
    }

    /// All stored images, most recent first
    pub fn list_history(&self) -> Result<Vec<StoredImage>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut images = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file()
                || path.extension().and_then(|e| e.to_str()) != Some(IMAGE_EXTENSION)
            {
                continue;
            }
            let Some(filename) = path.file_name().and_then(|n| n.to_str()).map(String::from)
            else {
                continue;
            };
            let created_at = modified_at(&path)?;
            images.push(StoredImage {
                filename,
                path,
                created_at,
            });
        }

        images.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.filename.cmp(&b.filename))
        });
        Ok(images)
    }
}

fn modified_at(path: &Path) -> Result<DateTime<Utc>> {
    let modified = fs::metadata(path)?.modified()?;
    Ok(DateTime::<Utc>::from(modified))
}

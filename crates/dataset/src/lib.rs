//! pictor_dataset - Training dataset preparation
//!
//! Turns a directory of raw images into a fine-tuning dataset: every image
//! is captioned, resized to a square and written next to a `metadata.jsonl`
//! manifest pairing each processed file with its caption. One bad image
//! never stops the run.

use anyhow::{Context, Result};
use image::imageops::FilterType;
use image::DynamicImage;
use pictor_runtime_api::Captioner;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Appended to every caption so the fine-tune associates the images with this style
pub const STYLE_SUFFIX: &str = " masterpiece, highly detailed, ultra realistic, 8k resolution.";
pub const MANIFEST_FILE: &str = "metadata.jsonl";
pub const PROCESSED_DIR: &str = "processed";
pub const PROCESSED_PREFIX: &str = "processed_";
pub const TARGET_SIZE: u32 = 512;

const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "webp"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetOptions {
    /// Defaults to `<source>/processed`
    pub output_dir: Option<PathBuf>,
    /// Side length of the square output images
    pub target_size: u32,
}

impl Default for DatasetOptions {
    fn default() -> Self {
        Self {
            output_dir: None,
            target_size: TARGET_SIZE,
        }
    }
}

/// One manifest line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetEntry {
    pub file_name: String,
    pub text: String,
}

impl DatasetEntry {
    pub fn new(file_name: impl Into<String>, caption: &str) -> Self {
        Self {
            file_name: file_name.into(),
            text: format!("{},{}", caption.trim(), STYLE_SUFFIX),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFailure {
    pub file_name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy)]
pub enum ItemOutcome<'a> {
    Processed(&'a DatasetEntry),
    Failed(&'a ItemFailure),
}

/// Reported once per source image, in processing order
#[derive(Debug, Clone, Copy)]
pub struct ItemProgress<'a> {
    pub index: usize,
    pub total: usize,
    pub source: &'a Path,
    pub outcome: ItemOutcome<'a>,
}

#[derive(Debug, Clone)]
pub struct PreparationReport {
    pub processed: usize,
    pub failures: Vec<ItemFailure>,
    pub output_dir: PathBuf,
    pub manifest_path: PathBuf,
}

/// Image files directly inside `source_dir`, sorted by file name
pub fn scan_images(source_dir: &Path) -> Result<Vec<PathBuf>> {
    if !source_dir.is_dir() {
        anyhow::bail!("Source directory {} does not exist", source_dir.display());
    }

    let mut images = Vec::new();
    for entry in WalkDir::new(source_dir).min_depth(1).max_depth(1) {
        let entry = entry.with_context(|| format!("Failed to read {}", source_dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let is_image = entry
            .path()
            .extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
            .map(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
            .unwrap_or(false);
        if is_image {
            images.push(entry.into_path());
        }
    }
    images.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(images)
}

/// Caption, resize and catalogue every image in `source_dir`.
///
/// Per-image failures are logged and reported through `on_item`; only an
/// unreadable source or an unwritable output fails the whole run.
pub fn prepare<F>(
    source_dir: &Path,
    captioner: &dyn Captioner,
    options: &DatasetOptions,
    mut on_item: F,
) -> Result<PreparationReport>
where
    F: FnMut(ItemProgress<'_>),
{
    let images = scan_images(source_dir)?;
    let output_dir = options
        .output_dir
        .clone()
        .unwrap_or_else(|| source_dir.join(PROCESSED_DIR));
    fs::create_dir_all(&output_dir)
        .with_context(|| format!("Failed to create {}", output_dir.display()))?;

    tracing::info!(
        "Found {} images in {}, writing to {}",
        images.len(),
        source_dir.display(),
        output_dir.display()
    );

    let total = images.len();
    let mut entries = Vec::with_capacity(total);
    let mut failures = Vec::new();

    for (index, path) in images.iter().enumerate() {
        match process_image(path, captioner, &output_dir, options.target_size) {
            Ok(entry) => {
                tracing::info!("Processed {} -> {}", entry.file_name, entry.text);
                entries.push(entry);
                if let Some(entry) = entries.last() {
                    on_item(ItemProgress {
                        index,
                        total,
                        source: path,
                        outcome: ItemOutcome::Processed(entry),
                    });
                }
            }
            Err(e) => {
                let failure = ItemFailure {
                    file_name: display_name(path),
                    reason: format!("{:#}", e),
                };
                tracing::error!("Error processing {}: {}", failure.file_name, failure.reason);
                failures.push(failure);
                if let Some(failure) = failures.last() {
                    on_item(ItemProgress {
                        index,
                        total,
                        source: path,
                        outcome: ItemOutcome::Failed(failure),
                    });
                }
            }
        }
    }

    let manifest_path = output_dir.join(MANIFEST_FILE);
    write_manifest(&manifest_path, &entries)?;

    if entries.is_empty() {
        tracing::warn!(
            "No images were processed from {}, the dataset is empty",
            source_dir.display()
        );
    }

    Ok(PreparationReport {
        processed: entries.len(),
        failures,
        output_dir,
        manifest_path,
    })
}

fn process_image(
    path: &Path,
    captioner: &dyn Captioner,
    output_dir: &Path,
    size: u32,
) -> Result<DatasetEntry> {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .context("File name is not valid UTF-8")?;

    let image = image::open(path).context("Failed to decode image")?;
    let image = DynamicImage::ImageRgb8(image.to_rgb8());

    let caption = captioner.caption(&image).context("Captioning failed")?;

    let out_name = format!("{}{}", PROCESSED_PREFIX, file_name);
    image
        .resize_exact(size, size, FilterType::Lanczos3)
        .save(output_dir.join(&out_name))
        .with_context(|| format!("Failed to save {}", out_name))?;

    Ok(DatasetEntry::new(out_name, &caption))
}

/// Rewrite the manifest from scratch, one JSON object per line
pub fn write_manifest(path: &Path, entries: &[DatasetEntry]) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("Failed to create manifest {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    for entry in entries {
        serde_json::to_writer(&mut writer, entry)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}

/// Parse a manifest written by [`write_manifest`]
pub fn read_manifest(path: &Path) -> Result<Vec<DatasetEntry>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read manifest {}", path.display()))?;
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| Ok(serde_json::from_str(line)?))
        .collect()
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

//! Model weight resolution
//!
//! The base model is either a local diffusers-layout directory or a
//! HuggingFace repo id that is fetched into the configured storage path.

use anyhow::{Context, Result};
use hf_hub::api::sync::{ApiBuilder, ApiRepo};
use pictor_core::Config;
use std::path::{Path, PathBuf};

const UNET_FP16: &str = "unet/diffusion_pytorch_model.fp16.safetensors";
const UNET: &str = "unet/diffusion_pytorch_model.safetensors";
const VAE: &str = "vae/diffusion_pytorch_model.safetensors";
const TEXT_ENCODER: &str = "text_encoder/model.safetensors";
const TOKENIZER: &str = "tokenizer/tokenizer.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelFiles {
    pub unet: PathBuf,
    pub vae: PathBuf,
    pub text_encoder: PathBuf,
    pub tokenizer: PathBuf,
}

impl ModelFiles {
    /// Locate or download every file the pipeline needs
    pub fn resolve(config: &Config, prefer_f16: bool) -> Result<Self> {
        let local = PathBuf::from(&config.model.base_model);
        if local.is_dir() {
            tracing::info!("Using local model directory {:?}", local);
            return Self::from_dir(&local, prefer_f16, |file| {
                fetch_tokenizer(config, file)
            });
        }

        tracing::info!(
            "Fetching {} from HuggingFace into {:?}",
            config.model.base_model,
            config.models.storage_path
        );
        let api = ApiBuilder::new()
            .with_cache_dir(config.models.storage_path.clone())
            .with_token(config.models.hf_token.clone())
            .build()?;
        let repo = api.model(config.model.base_model.clone());

        let unet = if prefer_f16 {
            repo.get(UNET_FP16).or_else(|_| repo.get(UNET))
        } else {
            repo.get(UNET)
        }
        .with_context(|| format!("Failed to fetch UNet weights of {}", config.model.base_model))?;
        let vae = get(&repo, VAE, &config.model.base_model)?;
        let text_encoder = get(&repo, TEXT_ENCODER, &config.model.base_model)?;
        let tokenizer = match repo.get(TOKENIZER) {
            Ok(path) => path,
            Err(_) => fetch_tokenizer(config, TOKENIZER)?,
        };

        Ok(Self {
            unet,
            vae,
            text_encoder,
            tokenizer,
        })
    }

    /// Resolve files inside a local diffusers-layout directory.
    ///
    /// `missing_tokenizer` provides a tokenizer when the directory has none.
    pub fn from_dir(
        dir: &Path,
        prefer_f16: bool,
        missing_tokenizer: impl FnOnce(&str) -> Result<PathBuf>,
    ) -> Result<Self> {
        let require = |relative: &str| -> Result<PathBuf> {
            let path = dir.join(relative);
            if !path.is_file() {
                anyhow::bail!("{} not found in {:?}", relative, dir);
            }
            Ok(path)
        };

        let fp16_unet = dir.join(UNET_FP16);
        let unet = if prefer_f16 && fp16_unet.is_file() {
            fp16_unet
        } else {
            require(UNET)?
        };

        let tokenizer = dir.join(TOKENIZER);
        let tokenizer = if tokenizer.is_file() {
            tokenizer
        } else {
            missing_tokenizer(TOKENIZER)?
        };

        Ok(Self {
            unet,
            vae: require(VAE)?,
            text_encoder: require(TEXT_ENCODER)?,
            tokenizer,
        })
    }
}

fn get(repo: &ApiRepo, file: &str, model: &str) -> Result<PathBuf> {
    repo.get(file)
        .with_context(|| format!("Failed to fetch {} from {}", file, model))
}

/// SD 1.x repos ship the slow tokenizer files only; borrow `tokenizer.json` from the CLIP repo
fn fetch_tokenizer(config: &Config, missing: &str) -> Result<PathBuf> {
    tracing::info!(
        "No {} in base model, using {}",
        missing,
        config.model.tokenizer_repo
    );
    let api = ApiBuilder::new()
        .with_cache_dir(config.models.storage_path.clone())
        .with_token(config.models.hf_token.clone())
        .build()?;
    get(
        &api.model(config.model.tokenizer_repo.clone()),
        "tokenizer.json",
        &config.model.tokenizer_repo,
    )
}

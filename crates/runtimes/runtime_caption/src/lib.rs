//! pictor_runtime_caption - Image captioning runtime
//!
//! This crate provides BLIP image captioning on candle, used to describe
//! training images during dataset preparation.
//! Supports Metal (macOS) and CUDA (Linux/Windows) acceleration.

mod sampling;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::blip;
use hf_hub::api::sync::ApiBuilder;
use hf_hub::{Repo, RepoType};
use image::imageops::FilterType;
use image::DynamicImage;
use pictor_core::Config;
use pictor_runtime_api::Captioner;
use std::path::Path;
use std::sync::Mutex;
use tokenizers::Tokenizer;

pub use sampling::Sampler;

/// Default captioning model
pub const BLIP_LARGE: &str = "Salesforce/blip-image-captioning-large";
/// The safetensors conversion of `BLIP_LARGE` lives on this revision
const BLIP_LARGE_REVISION: &str = "refs/pr/18";

const IMAGE_SIZE: u32 = 384;
const IMAGE_MEAN: [f32; 3] = [0.48145466, 0.4578275, 0.40821073];
const IMAGE_STD: [f32; 3] = [0.26862954, 0.261_302_6, 0.275_777_1];

/// `[DEC]` token that starts every caption
const BOS_TOKEN_ID: u32 = 30522;
const SEP_TOKEN_ID: u32 = 102;

/// Captioning behaviour knobs
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptionOptions {
    pub max_tokens: usize,
    /// Zero means greedy decoding
    pub temperature: f64,
    pub top_p: f64,
    pub seed: u64,
}

impl Default for CaptionOptions {
    fn default() -> Self {
        Self {
            max_tokens: 50,
            temperature: 0.0,
            top_p: 0.9,
            seed: 299792458,
        }
    }
}

impl CaptionOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_tokens: config.dataset.max_caption_tokens,
            temperature: config.dataset.caption_temperature,
            ..Self::default()
        }
    }
}

pub struct BlipCaptioner {
    model: Mutex<blip::BlipForConditionalGeneration>,
    tokenizer: Tokenizer,
    sampler: Mutex<Sampler>,
    device: Device,
    max_tokens: usize,
}

impl BlipCaptioner {
    /// Fetch the configured captioning model and load it on `device`
    pub fn load(config: &Config, device: &Device) -> Result<Self> {
        let model_id = &config.dataset.caption_model;
        let revision = if model_id == BLIP_LARGE {
            BLIP_LARGE_REVISION
        } else {
            "main"
        };

        let api = ApiBuilder::new()
            .with_cache_dir(config.models.storage_path.clone())
            .with_token(config.models.hf_token.clone())
            .build()?;
        let repo = api.repo(Repo::with_revision(
            model_id.clone(),
            RepoType::Model,
            revision.to_string(),
        ));
        tracing::info!("Fetching captioning model {} ({})", model_id, revision);
        let weights = repo
            .get("model.safetensors")
            .with_context(|| format!("Failed to fetch weights of {}", model_id))?;
        let tokenizer = repo
            .get("tokenizer.json")
            .or_else(|_| api.model(model_id.clone()).get("tokenizer.json"))
            .with_context(|| format!("Failed to fetch tokenizer of {}", model_id))?;

        Self::from_files(
            &weights,
            &tokenizer,
            device,
            CaptionOptions::from_config(config),
        )
    }

    pub fn from_files(
        weights: &Path,
        tokenizer: &Path,
        device: &Device,
        options: CaptionOptions,
    ) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(tokenizer)
            .map_err(|e| anyhow::anyhow!("Failed to load tokenizer: {}", e))?;

        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights], DType::F32, device)? };
        let blip_config = blip::Config::image_captioning_large();
        let model = blip::BlipForConditionalGeneration::new(&blip_config, vb)?;
        tracing::info!("BLIP captioner loaded on {:?}", device);

        Ok(Self {
            model: Mutex::new(model),
            tokenizer,
            sampler: Mutex::new(Sampler::new(options.temperature, options.top_p, options.seed)),
            device: device.clone(),
            max_tokens: options.max_tokens,
        })
    }
}

impl Captioner for BlipCaptioner {
    fn caption(&self, image: &DynamicImage) -> Result<String> {
        let pixels = preprocess(image)?.to_device(&self.device)?;

        let mut model = self
            .model
            .lock()
            .map_err(|_| anyhow::anyhow!("Captioning model lock poisoned"))?;
        let mut sampler = self
            .sampler
            .lock()
            .map_err(|_| anyhow::anyhow!("Sampler lock poisoned"))?;
        model.reset_kv_cache();

        let image_embeds = pixels.unsqueeze(0)?.apply(model.vision_model())?;

        let mut token_ids = vec![BOS_TOKEN_ID];
        for index in 0..self.max_tokens {
            // The decoder keeps a KV cache, only the newest token is fed after the first pass
            let context_size = if index > 0 { 1 } else { token_ids.len() };
            let start = token_ids.len().saturating_sub(context_size);
            let input_ids = Tensor::new(&token_ids[start..], &self.device)?.unsqueeze(0)?;

            let logits = model.text_decoder().forward(&input_ids, &image_embeds)?;
            let logits = logits.squeeze(0)?;
            let logits = logits.get(logits.dim(0)? - 1)?;

            let token = sampler.sample(&logits)?;
            if token == SEP_TOKEN_ID {
                break;
            }
            token_ids.push(token);
        }

        let caption = self
            .tokenizer
            .decode(&token_ids[1..], true)
            .map_err(|e| anyhow::anyhow!("Failed to decode caption: {}", e))?;
        Ok(caption.trim().to_string())
    }
}

/// Resize to 384x384 and normalize with the CLIP statistics, giving a `(3, 384, 384)` tensor
pub fn preprocess(image: &DynamicImage) -> Result<Tensor> {
    let size = IMAGE_SIZE as usize;
    let image = image
        .resize_to_fill(IMAGE_SIZE, IMAGE_SIZE, FilterType::Triangle)
        .to_rgb8();
    let data = Tensor::from_vec(image.into_raw(), (size, size, 3), &Device::Cpu)?
        .permute((2, 0, 1))?;
    let mean = Tensor::new(&IMAGE_MEAN, &Device::Cpu)?.reshape((3, 1, 1))?;
    let std = Tensor::new(&IMAGE_STD, &Device::Cpu)?.reshape((3, 1, 1))?;
    Ok((data.to_dtype(DType::F32)? / 255.)?
        .broadcast_sub(&mean)?
        .broadcast_div(&std)?)
}

/// Pick the captioning device, honouring `--cpu`.
///
/// A GPU build on a host without a usable device falls back to CPU.
pub fn select_device(cpu: bool) -> Result<Device> {
    if cpu {
        tracing::info!("Using CPU device");
        return Ok(Device::Cpu);
    }
    Ok(device_or_cpu(open_gpu()))
}

fn device_or_cpu(opened: Result<Device>) -> Device {
    match opened {
        Ok(device) => device,
        Err(e) => {
            tracing::warn!("No usable GPU, captioning on CPU: {:#}", e);
            Device::Cpu
        }
    }
}

fn open_gpu() -> Result<Device> {
    #[cfg(feature = "cuda")]
    {
        let device = Device::new_cuda(0)?;
        tracing::info!("Using CUDA device");
        Ok(device)
    }
    #[cfg(all(feature = "metal", not(feature = "cuda")))]
    {
        let device = Device::new_metal(0)?;
        tracing::info!("Using Metal device");
        Ok(device)
    }
    #[cfg(not(any(feature = "metal", feature = "cuda")))]
    {
        anyhow::bail!("built without GPU features")
    }
}

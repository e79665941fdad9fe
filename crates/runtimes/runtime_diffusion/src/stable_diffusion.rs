//! Stable Diffusion 1.5 pipeline
//!
//! Wraps candle-transformers' UNet and VAE. Prompt embeddings come in
//! precompiled, so the pipeline only runs the denoising loop and decodes.

use anyhow::Result;
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_transformers::models::stable_diffusion::unet_2d::UNet2DConditionModel;
use candle_transformers::models::stable_diffusion::vae::AutoEncoderKL;
use candle_transformers::models::stable_diffusion::StableDiffusionConfig;
use pictor_runtime_api::{DiffusionModel, ImageGenRequest, ImageGenResponse};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::path::Path;

use crate::configure::{LoadSettings, SamplerSpec};

/// Latent scaling factor of the SD 1.x VAE
const VAE_SCALE: f64 = 0.18215;
const LATENT_CHANNELS: usize = 4;

pub struct StableDiffusionPipeline {
    name: String,
    unet: UNet2DConditionModel,
    vae: AutoEncoderKL,
    /// Embedding of the empty prompt, the unconditional branch when no negative is given
    unconditional: Tensor,
    sampler: SamplerSpec,
    device: Device,
    dtype: DType,
    vae_dtype: DType,
    width: usize,
    height: usize,
}

impl StableDiffusionPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn load(
        name: &str,
        sd_config: &StableDiffusionConfig,
        unet_weights: &Path,
        vae_weights: &Path,
        device: &Device,
        dtype: DType,
        settings: &LoadSettings,
        sampler: SamplerSpec,
        unconditional: Tensor,
    ) -> Result<Self> {
        tracing::info!("Loading VAE from {:?} ({:?})", vae_weights, settings.vae_dtype);
        let vae = sd_config.build_vae(vae_weights, device, settings.vae_dtype)?;

        tracing::info!("Loading UNet from {:?} ({:?})", unet_weights, dtype);
        let unet = sd_config.build_unet(
            unet_weights,
            device,
            LATENT_CHANNELS,
            settings.use_flash_attn,
            dtype,
        )?;

        Ok(Self {
            name: name.to_string(),
            unet,
            vae,
            unconditional,
            sampler,
            device: device.clone(),
            dtype,
            vae_dtype: settings.vae_dtype,
            width: sd_config.width,
            height: sd_config.height,
        })
    }

    fn decode(&self, latents: &Tensor) -> Result<Vec<u8>> {
        let latents = (latents.to_dtype(self.vae_dtype)? / VAE_SCALE)?;
        let image = self.vae.decode(&latents)?;
        let image = ((image.to_dtype(DType::F32)? / 2.)? + 0.5)?.to_device(&Device::Cpu)?;
        let image = (image.clamp(0f32, 1f32)? * 255.)?.to_dtype(DType::U8)?.i(0)?;
        Ok(image.permute((1, 2, 0))?.flatten_all()?.to_vec1::<u8>()?)
    }
}

impl DiffusionModel for StableDiffusionPipeline {
    fn generate(&self, request: &ImageGenRequest) -> Result<ImageGenResponse> {
        let uncond = request
            .negative_embeds
            .as_ref()
            .unwrap_or(&self.unconditional);
        let text_embeddings = Tensor::cat(&[uncond, &request.prompt_embeds], 0)?
            .to_device(&self.device)?
            .to_dtype(self.dtype)?;

        let mut scheduler = self.sampler.build(request.steps)?;
        let noise = seeded_noise(
            request.seed,
            (1, LATENT_CHANNELS, self.height / 8, self.width / 8),
        )?;
        let mut latents = (noise.to_device(&self.device)?.to_dtype(self.dtype)?
            * scheduler.init_noise_sigma())?;

        let timesteps = scheduler.timesteps().to_vec();
        for (step, &timestep) in timesteps.iter().enumerate() {
            let start = std::time::Instant::now();
            let latent_model_input = Tensor::cat(&[&latents, &latents], 0)?;
            let latent_model_input = scheduler.scale_model_input(latent_model_input, step)?;

            let noise_pred = self
                .unet
                .forward(&latent_model_input, timestep, &text_embeddings)?;
            let noise_pred = noise_pred.chunk(2, 0)?;
            let (noise_uncond, noise_text) = (&noise_pred[0], &noise_pred[1]);
            let noise_pred =
                (noise_uncond + ((noise_text - noise_uncond)? * request.guidance_scale)?)?;

            latents = scheduler.step(step, &noise_pred, &latents)?;
            tracing::debug!(
                "step {}/{} done in {:.2}s",
                step + 1,
                timesteps.len(),
                start.elapsed().as_secs_f32()
            );
        }

        let pixels = self.decode(&latents)?;
        Ok(ImageGenResponse {
            pixels,
            width: self.width as u32,
            height: self.height as u32,
        })
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn output_size(&self) -> (u32, u32) {
        (self.width as u32, self.height as u32)
    }
}

/// Standard normal noise drawn on the host from `seed`.
///
/// Device RNGs differ between backends, so the initial latents are always
/// sampled here to keep a seed reproducible everywhere.
pub fn seeded_noise(seed: u32, shape: (usize, usize, usize, usize)) -> Result<Tensor> {
    let mut rng = StdRng::seed_from_u64(seed as u64);
    let count = shape.0 * shape.1 * shape.2 * shape.3;
    let data: Vec<f32> = (0..count).map(|_| rng.sample(StandardNormal)).collect();
    Ok(Tensor::from_vec(data, shape, &Device::Cpu)?)
}

//! Pipeline configuration
//!
//! Plans device, precision, sampler and memory strategy from [`ModelConfig`],
//! then loads the Stable Diffusion weights once per process.

use anyhow::{Context, Result};
use candle_core::{DType, Device};
use candle_transformers::models::stable_diffusion::StableDiffusionConfig;
use pictor_core::config::ModelConfig;
use pictor_core::Config;
use pictor_runtime_api::{DiffusionModel, TextEncoder};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::clip::ClipTextEncoder;
use crate::files::ModelFiles;
use crate::lora::{merge_unet_weights, LoraOverlay};
use crate::prompt::PromptCompiler;
use crate::scheduler::DpmSolverMultistep;
use crate::stable_diffusion::StableDiffusionPipeline;

/// Cached UNet weights with the fine-tune overlay merged in
const MERGED_UNET_FILE: &str = "unet-lora-merged.safetensors";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Accelerated,
    Cpu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    Reduced,
    Full,
}

impl Precision {
    pub fn dtype(self) -> DType {
        match self {
            Precision::Reduced => DType::F16,
            Precision::Full => DType::F32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerAlgorithm {
    /// Multistep DPM-Solver++
    DpmSolverPlusPlus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplerSpec {
    pub algorithm: SamplerAlgorithm,
    pub karras_sigmas: bool,
    pub solver_order: usize,
    pub steps: usize,
}

impl Default for SamplerSpec {
    fn default() -> Self {
        Self {
            algorithm: SamplerAlgorithm::DpmSolverPlusPlus,
            karras_sigmas: true,
            solver_order: 2,
            steps: 20,
        }
    }
}

impl SamplerSpec {
    /// Fresh scheduler state for one generation
    pub fn build(&self, steps: usize) -> Result<DpmSolverMultistep> {
        match self.algorithm {
            SamplerAlgorithm::DpmSolverPlusPlus => {
                DpmSolverMultistep::new(steps, self.solver_order, self.karras_sigmas)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryOptimization {
    OffloadTextEncoder,
    FlashAttention,
    AttentionSlicing(usize),
    FullPrecisionVae,
}

/// Load-time knobs the memory strategy adjusts
#[derive(Debug, Clone)]
pub struct LoadSettings {
    pub text_encoder_device: Device,
    pub text_encoder_dtype: DType,
    pub use_flash_attn: bool,
    pub sliced_attention_size: Option<usize>,
    pub vae_dtype: DType,
}

impl LoadSettings {
    /// Everything on `device` in `dtype`, no optimization applied
    pub fn plain(device: &Device, dtype: DType) -> Self {
        Self {
            text_encoder_device: device.clone(),
            text_encoder_dtype: dtype,
            use_flash_attn: false,
            sliced_attention_size: None,
            vae_dtype: dtype,
        }
    }
}

impl MemoryOptimization {
    /// Check that the optimization can be used on `device`
    pub fn probe(&self, device: &Device) -> Result<()> {
        match self {
            MemoryOptimization::OffloadTextEncoder | MemoryOptimization::FullPrecisionVae => Ok(()),
            MemoryOptimization::FlashAttention => {
                if !cfg!(feature = "flash-attn") {
                    anyhow::bail!("built without the flash-attn feature");
                }
                if !device.is_cuda() {
                    anyhow::bail!("flash attention requires a CUDA device");
                }
                Ok(())
            }
            MemoryOptimization::AttentionSlicing(size) => {
                if *size == 0 {
                    anyhow::bail!("attention slice size must be positive");
                }
                Ok(())
            }
        }
    }

    fn apply(&self, settings: &mut LoadSettings) {
        match *self {
            MemoryOptimization::OffloadTextEncoder => {
                settings.text_encoder_device = Device::Cpu;
                settings.text_encoder_dtype = DType::F32;
            }
            MemoryOptimization::FlashAttention => settings.use_flash_attn = true,
            MemoryOptimization::AttentionSlicing(size) => {
                settings.sliced_attention_size = Some(size)
            }
            MemoryOptimization::FullPrecisionVae => settings.vae_dtype = DType::F32,
        }
    }
}

/// Run every optimization of `strategy` whose probe passes.
///
/// Returns the resulting settings and the optimizations that were applied.
pub fn apply_memory_strategy(
    strategy: &[MemoryOptimization],
    device: &Device,
    dtype: DType,
) -> (LoadSettings, Vec<MemoryOptimization>) {
    let mut settings = LoadSettings::plain(device, dtype);
    let mut applied = Vec::with_capacity(strategy.len());
    for optimization in strategy {
        match optimization.probe(device) {
            Ok(()) => {
                optimization.apply(&mut settings);
                tracing::info!("Enabled {:?}", optimization);
                applied.push(*optimization);
            }
            Err(e) => tracing::warn!("Skipping {:?}: {}", optimization, e),
        }
    }
    (settings, applied)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub device: DeviceKind,
    pub precision: Precision,
    pub sampler: SamplerSpec,
    pub memory_strategy: Vec<MemoryOptimization>,
    pub fine_tune_overlay: Option<PathBuf>,
}

impl PipelineConfig {
    pub fn plan(model: &ModelConfig, accelerator_available: bool) -> Self {
        let device = if model.use_gpu && accelerator_available {
            DeviceKind::Accelerated
        } else {
            DeviceKind::Cpu
        };

        let precision = if device == DeviceKind::Accelerated && model.use_f16 {
            Precision::Reduced
        } else {
            Precision::Full
        };

        let mut memory_strategy = Vec::new();
        if device == DeviceKind::Accelerated {
            if model.offload_text_encoder {
                memory_strategy.push(MemoryOptimization::OffloadTextEncoder);
            }
            if model.flash_attn {
                memory_strategy.push(MemoryOptimization::FlashAttention);
            }
            if let Some(size) = model.sliced_attention_size {
                memory_strategy.push(MemoryOptimization::AttentionSlicing(size));
            }
            memory_strategy.push(MemoryOptimization::FullPrecisionVae);
        }

        let fine_tune_overlay = model
            .fine_tune_path
            .exists()
            .then(|| model.fine_tune_path.clone());

        Self {
            device,
            precision,
            sampler: SamplerSpec::default(),
            memory_strategy,
            fine_tune_overlay,
        }
    }
}

/// The configured model handles, created once and shared read-only
#[derive(Clone)]
pub struct ConfiguredPipeline {
    pub model: Arc<dyn DiffusionModel>,
    pub text_encoder: Arc<dyn TextEncoder>,
    pub config: PipelineConfig,
    pub applied: Vec<MemoryOptimization>,
    pub overlay_applied: bool,
}

impl ConfiguredPipeline {
    pub fn prompt_compiler(&self) -> PromptCompiler {
        PromptCompiler::new(self.text_encoder.clone())
    }
}

/// Open the accelerator this binary was built for.
///
/// Compiling with `cuda` or `metal` says nothing about the host, so the
/// device is actually opened here and any failure means CPU.
pub fn open_accelerator(use_gpu: bool, open: impl FnOnce() -> Result<Device>) -> Option<Device> {
    if !use_gpu {
        return None;
    }
    match open() {
        Ok(device) => Some(device),
        Err(e) => {
            tracing::warn!("No usable accelerator, falling back to CPU: {:#}", e);
            None
        }
    }
}

fn accelerated_device() -> Result<Device> {
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

/// Build the generation pipeline described by `config`.
///
/// Missing or unloadable base weights are fatal. Memory optimizations and
/// the fine-tune overlay degrade to warnings.
pub fn configure(config: &Config) -> Result<ConfiguredPipeline> {
    let accelerator = open_accelerator(config.model.use_gpu, accelerated_device);
    let plan = PipelineConfig::plan(&config.model, accelerator.is_some());
    tracing::info!(
        "Pipeline plan: {:?} / {:?}, sampler {:?}",
        plan.device,
        plan.precision,
        plan.sampler
    );

    let device = match (plan.device, accelerator) {
        (DeviceKind::Accelerated, Some(device)) => device,
        _ => {
            tracing::info!("Using CPU device");
            Device::Cpu
        }
    };
    let dtype = plan.precision.dtype();

    let files = ModelFiles::resolve(config, plan.precision == Precision::Reduced)?;
    let (settings, applied) = apply_memory_strategy(&plan.memory_strategy, &device, dtype);

    let sd_config = StableDiffusionConfig::v1_5(settings.sliced_attention_size, None, None);
    let text_encoder: Arc<dyn TextEncoder> = Arc::new(ClipTextEncoder::load(
        &files.tokenizer,
        &files.text_encoder,
        &sd_config.clip,
        &settings.text_encoder_device,
        settings.text_encoder_dtype,
    )?);
    let unconditional = PromptCompiler::new(text_encoder.clone()).unconditional()?;

    let (unet_weights, overlay_applied) = match &plan.fine_tune_overlay {
        Some(dir) => match merged_unet(dir, &files.unet) {
            Ok(path) => (path, true),
            Err(e) => {
                tracing::warn!("Could not apply fine-tune overlay {:?}: {:#}", dir, e);
                (files.unet.clone(), false)
            }
        },
        None => (files.unet.clone(), false),
    };

    let model = StableDiffusionPipeline::load(
        &config.model.base_model,
        &sd_config,
        &unet_weights,
        &files.vae,
        &device,
        dtype,
        &settings,
        plan.sampler,
        unconditional,
    )
    .with_context(|| format!("Failed to load {}", config.model.base_model))?;

    Ok(ConfiguredPipeline {
        model: Arc::new(model),
        text_encoder,
        config: plan,
        applied,
        overlay_applied,
    })
}

fn merged_unet(overlay_dir: &Path, base_unet: &Path) -> Result<PathBuf> {
    let overlay = LoraOverlay::load(overlay_dir)?;
    let cache_dir = Config::cache_dir()?;
    std::fs::create_dir_all(&cache_dir)?;
    let output = cache_dir.join(MERGED_UNET_FILE);

    let merged = merge_unet_weights(base_unet, &overlay, &output)?;
    if merged == 0 {
        anyhow::bail!("none of the {} LoRA deltas matched a UNet weight", overlay.len());
    }
    tracing::info!("Merged {} LoRA deltas from {:?}", merged, overlay_dir);
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model_config() -> ModelConfig {
        ModelConfig {
            fine_tune_path: PathBuf::from("/nonexistent/pictor-lora"),
            ..ModelConfig::default()
        }
    }

    #[test]
    fn cpu_plan_is_full_precision_without_memory_chain() {
        let plan = PipelineConfig::plan(&model_config(), false);
        assert_eq!(plan.device, DeviceKind::Cpu);
        assert_eq!(plan.precision, Precision::Full);
        assert!(plan.memory_strategy.is_empty());
        assert_eq!(plan.sampler, SamplerSpec::default());
        assert!(plan.fine_tune_overlay.is_none());
    }

    #[test]
    fn use_gpu_false_forces_cpu() {
        let config = ModelConfig {
            use_gpu: false,
            ..model_config()
        };
        let plan = PipelineConfig::plan(&config, true);
        assert_eq!(plan.device, DeviceKind::Cpu);
        assert_eq!(plan.precision.dtype(), DType::F32);
    }

    #[test]
    fn accelerator_plan_uses_reduced_precision_and_ordered_chain() {
        let plan = PipelineConfig::plan(&model_config(), true);
        assert_eq!(plan.device, DeviceKind::Accelerated);
        assert_eq!(plan.precision, Precision::Reduced);
        assert_eq!(plan.precision.dtype(), DType::F16);
        assert_eq!(
            plan.memory_strategy,
            vec![
                MemoryOptimization::OffloadTextEncoder,
                MemoryOptimization::FlashAttention,
                MemoryOptimization::AttentionSlicing(1),
                MemoryOptimization::FullPrecisionVae,
            ]
        );
    }

    #[test]
    fn disabled_optimizations_are_left_out_of_the_chain() {
        let config = ModelConfig {
            flash_attn: false,
            offload_text_encoder: false,
            sliced_attention_size: None,
            ..model_config()
        };
        let plan = PipelineConfig::plan(&config, true);
        assert_eq!(plan.memory_strategy, vec![MemoryOptimization::FullPrecisionVae]);
    }

    #[test]
    fn existing_fine_tune_dir_is_planned() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = ModelConfig {
            fine_tune_path: tmp.path().to_path_buf(),
            ..ModelConfig::default()
        };
        let plan = PipelineConfig::plan(&config, false);
        assert_eq!(plan.fine_tune_overlay.as_deref(), Some(tmp.path()));
    }

    #[test]
    fn sampler_is_second_order_dpm_with_karras_sigmas() {
        let spec = SamplerSpec::default();
        assert_eq!(spec.algorithm, SamplerAlgorithm::DpmSolverPlusPlus);
        assert_eq!(spec.solver_order, 2);
        assert!(spec.karras_sigmas);

        let scheduler = spec.build(spec.steps).unwrap();
        assert_eq!(scheduler.timesteps().len(), 20);
    }

    #[test]
    fn unopenable_accelerator_plans_cpu_full_precision() {
        let accelerator = open_accelerator(true, || anyhow::bail!("CUDA driver not found"));
        assert!(accelerator.is_none());

        let plan = PipelineConfig::plan(&model_config(), accelerator.is_some());
        assert_eq!(plan.device, DeviceKind::Cpu);
        assert_eq!(plan.precision, Precision::Full);
        assert!(plan.memory_strategy.is_empty());
    }

    #[test]
    fn accelerator_is_not_opened_when_gpu_is_disabled() {
        let mut opened = false;
        let accelerator = open_accelerator(false, || {
            opened = true;
            Ok(Device::Cpu)
        });
        assert!(accelerator.is_none());
        assert!(!opened);
        assert!(open_accelerator(true, || Ok(Device::Cpu)).is_some());
    }

    #[test]
    fn flash_attention_probe_fails_on_cpu() {
        assert!(MemoryOptimization::FlashAttention.probe(&Device::Cpu).is_err());
        assert!(MemoryOptimization::AttentionSlicing(0).probe(&Device::Cpu).is_err());
        assert!(MemoryOptimization::OffloadTextEncoder.probe(&Device::Cpu).is_ok());
    }

    #[test]
    fn failed_probes_are_skipped_not_fatal() {
        let strategy = [
            MemoryOptimization::OffloadTextEncoder,
            MemoryOptimization::FlashAttention,
            MemoryOptimization::AttentionSlicing(1),
            MemoryOptimization::FullPrecisionVae,
        ];
        let (settings, applied) = apply_memory_strategy(&strategy, &Device::Cpu, DType::F16);

        assert_eq!(
            applied,
            vec![
                MemoryOptimization::OffloadTextEncoder,
                MemoryOptimization::AttentionSlicing(1),
                MemoryOptimization::FullPrecisionVae,
            ]
        );
        assert!(!settings.use_flash_attn);
        assert_eq!(settings.sliced_attention_size, Some(1));
        assert_eq!(settings.text_encoder_dtype, DType::F32);
        assert_eq!(settings.vae_dtype, DType::F32);
    }
}

//! pictor_runtime_diffusion - Diffusion model inference runtime
//!
//! This crate provides Stable Diffusion 1.5 image generation on candle:
//! pipeline planning and loading, weighted prompt compilation, and merging
//! of fine-tuned LoRA overlays into the UNet.

mod clip;
pub mod configure;
mod files;
pub mod lora;
pub mod prompt;
pub mod scheduler;
mod stable_diffusion;

pub use clip::ClipTextEncoder;
pub use configure::{configure, ConfiguredPipeline, MemoryOptimization, PipelineConfig};
pub use files::ModelFiles;
pub use lora::LoraOverlay;
pub use prompt::PromptCompiler;
pub use stable_diffusion::{seeded_noise, StableDiffusionPipeline};

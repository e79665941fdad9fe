//! Generation orchestration
//!
//! Validates a prompt pair, draws a seed, compiles embeddings and drives the
//! diffusion model, one invocation at a time, under a request deadline.

use pictor_core::{OutputStore, StoredImage};
use pictor_runtime_api::{DiffusionModel, ImageGenRequest, ImageGenResponse, TextEncoder};
use pictor_runtime_diffusion::{ConfiguredPipeline, PromptCompiler};
use rand::Rng;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

pub const DEFAULT_STEPS: usize = 20;
pub const DEFAULT_GUIDANCE_SCALE: f64 = 7.5;
/// CLIP sees 75 tokens, anything far beyond that is rejected before admission
pub const MAX_PROMPT_CHARS: usize = 4096;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PromptPair {
    #[serde(default)]
    pub prompt: String,
    /// Empty means no negative conditioning
    #[serde(default)]
    pub negative_prompt: String,
}

impl PromptPair {
    pub fn new(prompt: impl Into<String>, negative_prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: negative_prompt.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Generation {
    pub image: StoredImage,
    pub seed: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum GenerateError {
    #[error("Prompt must not be empty")]
    EmptyPrompt,

    #[error("Prompt exceeds {0} characters")]
    PromptTooLong(usize),

    #[error("Generation did not finish within {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("Generation failed: {0:#}")]
    Model(anyhow::Error),

    #[error("Failed to store image: {0:#}")]
    Storage(anyhow::Error),

    #[error("Generation task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Clone)]
pub struct Generator {
    compiler: PromptCompiler,
    model: Arc<dyn DiffusionModel>,
    store: Arc<OutputStore>,
    /// Single permit: at most one model invocation in flight
    gate: Arc<Semaphore>,
    timeout: Duration,
    steps: usize,
    guidance_scale: f64,
}

impl Generator {
    pub fn new(
        text_encoder: Arc<dyn TextEncoder>,
        model: Arc<dyn DiffusionModel>,
        store: Arc<OutputStore>,
        timeout: Duration,
    ) -> Self {
        Self {
            compiler: PromptCompiler::new(text_encoder),
            model,
            store,
            gate: Arc::new(Semaphore::new(1)),
            timeout,
            steps: DEFAULT_STEPS,
            guidance_scale: DEFAULT_GUIDANCE_SCALE,
        }
    }

    pub fn from_pipeline(
        pipeline: &ConfiguredPipeline,
        store: Arc<OutputStore>,
        timeout: Duration,
    ) -> Self {
        Self::new(
            pipeline.text_encoder.clone(),
            pipeline.model.clone(),
            store,
            timeout,
        )
    }

    pub fn store(&self) -> &Arc<OutputStore> {
        &self.store
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    /// Generate and store exactly one image for `pair`.
    ///
    /// The deadline covers admission, prompt compilation and the model call.
    /// Storing happens after it, so a request that timed out never leaves an
    /// image behind.
    pub async fn generate(&self, pair: PromptPair) -> Result<Generation, GenerateError> {
        if pair.prompt.trim().is_empty() {
            return Err(GenerateError::EmptyPrompt);
        }
        if pair.prompt.chars().count() > MAX_PROMPT_CHARS
            || pair.negative_prompt.chars().count() > MAX_PROMPT_CHARS
        {
            return Err(GenerateError::PromptTooLong(MAX_PROMPT_CHARS));
        }

        let seed = draw_seed();
        tracing::info!("Generating \"{}\" with seed {}", pair.prompt, seed);

        let response = match tokio::time::timeout(self.timeout, self.invoke(pair, seed)).await {
            Ok(result) => result?,
            Err(_) => {
                tracing::warn!(
                    "Generation with seed {} timed out after {:?}",
                    seed,
                    self.timeout
                );
                return Err(GenerateError::Timeout(self.timeout));
            }
        };

        let (width, height) = self.model.output_size();
        if (response.width, response.height) != (width, height) {
            return Err(GenerateError::Model(anyhow::anyhow!(
                "Model returned a {}x{} image, expected {}x{}",
                response.width,
                response.height,
                width,
                height
            )));
        }

        let png = response.encode_png().map_err(GenerateError::Model)?;
        let store = self.store.clone();
        let image = tokio::task::spawn_blocking(move || store.save(&png))
            .await?
            .map_err(GenerateError::Storage)?;

        tracing::info!("Stored {}", image.path.display());
        Ok(Generation { image, seed })
    }

    async fn invoke(&self, pair: PromptPair, seed: u32) -> Result<ImageGenResponse, GenerateError> {
        let permit = self
            .gate
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| GenerateError::Model(e.into()))?;

        let compiler = self.compiler.clone();
        let model = self.model.clone();
        let (steps, guidance_scale) = (self.steps, self.guidance_scale);

        // The permit moves into the blocking task, so a caller that gives up
        // never lets a second invocation start before this one returns.
        let response = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let prompt_embeds = compiler
                .compile(&pair.prompt)?
                .ok_or_else(|| anyhow::anyhow!("Prompt compiled to no conditioning"))?;
            let negative_embeds = compiler.compile(&pair.negative_prompt)?;

            let start = std::time::Instant::now();
            let response = model.generate(&ImageGenRequest {
                prompt_embeds,
                negative_embeds,
                seed,
                steps,
                guidance_scale,
            })?;
            tracing::info!("Model finished in {:.2}s", start.elapsed().as_secs_f64());
            Ok::<_, anyhow::Error>(response)
        })
        .await?
        .map_err(GenerateError::Model)?;

        Ok(response)
    }
}

/// Uniform seed in `0..=i32::MAX`
pub fn draw_seed() -> u32 {
    rand::thread_rng().gen_range(0..=i32::MAX as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{generator_with, FakeModel};
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    #[tokio::test]
    async fn empty_prompt_is_rejected_before_the_model() {
        let tmp = TempDir::new().unwrap();
        let model = Arc::new(FakeModel::new());
        let generator = generator_with(model.clone(), tmp.path(), Duration::from_secs(5));

        let err = generator.generate(PromptPair::new("   ", "")).await.unwrap_err();
        assert!(matches!(err, GenerateError::EmptyPrompt));
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn successful_generation_is_stored() {
        let tmp = TempDir::new().unwrap();
        let model = Arc::new(FakeModel::new());
        let generator = generator_with(model.clone(), tmp.path(), Duration::from_secs(5));

        let generation = generator
            .generate(PromptPair::new("a (red)++ car", ""))
            .await
            .unwrap();

        assert!(generation.seed <= i32::MAX as u32);
        assert!(generation.image.filename.ends_with(".png"));
        assert!(generation.image.path.exists());
        assert_eq!(model.seeds.lock().unwrap().as_slice(), &[generation.seed]);
        assert_eq!(generator.store().list_history().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn model_receives_fixed_steps_and_guidance() {
        let tmp = TempDir::new().unwrap();
        let model = Arc::new(FakeModel::new());
        let generator = generator_with(model.clone(), tmp.path(), Duration::from_secs(5));

        generator.generate(PromptPair::new("cat", "")).await.unwrap();
        let requests = model.requests.lock().unwrap();
        assert_eq!(requests[0].steps, 20);
        assert_eq!(requests[0].guidance_scale, 7.5);
    }

    #[tokio::test]
    async fn blank_negative_prompt_means_no_negative_conditioning() {
        let tmp = TempDir::new().unwrap();
        let model = Arc::new(FakeModel::new());
        let generator = generator_with(model.clone(), tmp.path(), Duration::from_secs(5));

        generator.generate(PromptPair::new("cat", "")).await.unwrap();
        generator
            .generate(PromptPair::new("cat", "blurry, low quality"))
            .await
            .unwrap();

        let requests = model.requests.lock().unwrap();
        assert!(!requests[0].had_negative);
        assert!(requests[1].had_negative);
    }

    #[tokio::test]
    async fn model_failure_stores_nothing() {
        let tmp = TempDir::new().unwrap();
        let model = Arc::new(FakeModel::failing());
        let generator = generator_with(model, tmp.path(), Duration::from_secs(5));

        let err = generator.generate(PromptPair::new("cat", "")).await.unwrap_err();
        assert!(matches!(err, GenerateError::Model(_)));
        assert!(generator.store().list_history().unwrap().is_empty());
    }

    #[tokio::test]
    async fn oversized_prompt_is_rejected_before_the_model() {
        let tmp = TempDir::new().unwrap();
        let model = Arc::new(FakeModel::new());
        let generator = generator_with(model.clone(), tmp.path(), Duration::from_secs(5));

        let nested = format!("{}cat{}", "(".repeat(100_000), ")".repeat(100_000));
        let err = generator.generate(PromptPair::new(nested, "")).await.unwrap_err();
        assert!(matches!(err, GenerateError::PromptTooLong(MAX_PROMPT_CHARS)));

        let negative = "blurry ".repeat(1000);
        let err = generator
            .generate(PromptPair::new("cat", negative))
            .await
            .unwrap_err();
        assert!(matches!(err, GenerateError::PromptTooLong(_)));
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn image_of_the_wrong_size_is_not_stored() {
        let tmp = TempDir::new().unwrap();
        let model = Arc::new(FakeModel::returning_size(16, 4));
        let generator = generator_with(model.clone(), tmp.path(), Duration::from_secs(5));

        let err = generator.generate(PromptPair::new("cat", "")).await.unwrap_err();
        assert!(matches!(err, GenerateError::Model(_)));
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
        assert!(generator.store().list_history().unwrap().is_empty());
    }

    #[tokio::test]
    async fn stored_image_has_the_model_output_size() {
        let tmp = TempDir::new().unwrap();
        let model = Arc::new(FakeModel::new());
        let generator = generator_with(model.clone(), tmp.path(), Duration::from_secs(5));

        let generation = generator.generate(PromptPair::new("cat", "")).await.unwrap();
        let stored = image::open(&generation.image.path).unwrap();
        assert_eq!((stored.width(), stored.height()), model.output_size());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_never_overlap_in_the_model() {
        let tmp = TempDir::new().unwrap();
        let model = Arc::new(FakeModel::with_delay(Duration::from_millis(40)));
        let generator = generator_with(model.clone(), tmp.path(), Duration::from_secs(10));

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let generator = generator.clone();
                tokio::spawn(async move {
                    generator
                        .generate(PromptPair::new(format!("prompt {}", i), ""))
                        .await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(model.calls.load(Ordering::SeqCst), 4);
        assert_eq!(model.max_active.load(Ordering::SeqCst), 1);
        assert_eq!(generator.store().list_history().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn stalled_model_times_out_without_storing() {
        let tmp = TempDir::new().unwrap();
        let model = Arc::new(FakeModel::with_delay(Duration::from_millis(300)));
        let generator = generator_with(model.clone(), tmp.path(), Duration::from_millis(50));

        let err = generator.generate(PromptPair::new("cat", "")).await.unwrap_err();
        assert!(matches!(err, GenerateError::Timeout(_)));

        // Let the abandoned invocation finish; its image must not be stored
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
        assert!(generator.store().list_history().unwrap().is_empty());
    }

    #[test]
    fn seeds_stay_in_the_positive_i32_range() {
        for _ in 0..1000 {
            assert!(draw_seed() <= i32::MAX as u32);
        }
    }

    #[test]
    fn prompt_pair_defaults_to_no_negative() {
        let pair: PromptPair = serde_json::from_str(r#"{"prompt": "cat"}"#).unwrap();
        assert_eq!(pair.prompt, "cat");
        assert!(pair.negative_prompt.is_empty());
    }
}

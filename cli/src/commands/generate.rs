//! One-shot image generation command

use anyhow::Result;
use pictor_core::OutputStore;
use pictor_daemon::{Generator, PromptPair};
use std::sync::Arc;
use std::time::Duration;

pub async fn execute(prompt: &str, negative_prompt: &str, cpu: bool) -> Result<()> {
    let config = super::load_config(cpu)?;

    println!("Image Generation");
    println!("================");
    println!("Model: {}", config.model.base_model);
    println!("Prompt: {}", prompt);
    if !negative_prompt.trim().is_empty() {
        println!("Negative prompt: {}", negative_prompt);
    }
    println!();

    println!("Loading model...");
    let pipeline = {
        let config = config.clone();
        tokio::task::spawn_blocking(move || pictor_runtime_diffusion::configure(&config)).await??
    };

    let store = Arc::new(OutputStore::new(config.outputs.directory.clone()));
    let timeout = Duration::from_secs(config.daemon.request_timeout_secs);
    let generator = Generator::from_pipeline(&pipeline, store, timeout);
    println!("Model loaded: {}", generator.model_name());

    println!("\nGenerating...");
    let start = std::time::Instant::now();
    let generation = generator
        .generate(PromptPair::new(prompt, negative_prompt))
        .await?;

    println!("\nImage saved to: {}", generation.image.path.display());
    println!("Seed: {}", generation.seed);
    println!("Generation time: {:.2}s", start.elapsed().as_secs_f64());

    Ok(())
}

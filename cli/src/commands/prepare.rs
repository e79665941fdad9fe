//! Dataset preparation command

use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use pictor_dataset::{DatasetOptions, ItemOutcome};
use pictor_runtime_caption::BlipCaptioner;
use std::path::PathBuf;

pub async fn execute(source: Option<PathBuf>, output: Option<PathBuf>, cpu: bool) -> Result<()> {
    let config = super::load_config(cpu)?;
    let source = source.unwrap_or_else(|| config.dataset.source_dir.clone());
    let options = DatasetOptions {
        output_dir: output,
        ..DatasetOptions::default()
    };

    println!("Dataset Preparation");
    println!("===================");
    println!("Source: {}", source.display());
    println!("Captioning model: {}", config.dataset.caption_model);
    println!();

    let report = tokio::task::spawn_blocking(move || -> Result<_> {
        let device = pictor_runtime_caption::select_device(!config.model.use_gpu)?;
        let captioner = BlipCaptioner::load(&config, &device)?;

        let pb = ProgressBar::new(0);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
                .progress_chars("#>-"),
        );

        let report = pictor_dataset::prepare(&source, &captioner, &options, |item| {
            pb.set_length(item.total as u64);
            let name = item
                .source
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            match item.outcome {
                ItemOutcome::Processed(entry) => pb.set_message(entry.text.clone()),
                ItemOutcome::Failed(failure) => {
                    pb.println(format!("Skipped {}: {}", name, failure.reason))
                }
            }
            pb.inc(1);
        })?;
        pb.finish_with_message("done");
        Ok(report)
    })
    .await??;

    println!("\nProcessed {} image(s)", report.processed);
    if !report.failures.is_empty() {
        println!("Failed {} image(s):", report.failures.len());
        for failure in &report.failures {
            println!("  {}: {}", failure.file_name, failure.reason);
        }
    }
    println!("Images: {}", report.output_dir.display());
    println!("Manifest: {}", report.manifest_path.display());

    Ok(())
}

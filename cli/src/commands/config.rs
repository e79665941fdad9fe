use anyhow::Result;
use pictor_core::Config;

/// Every settable key, grouped by section in display order
const KEYS: &[&str] = &[
    "daemon.host",
    "daemon.port",
    "daemon.request_timeout_secs",
    "models.storage_path",
    "models.hf_token",
    "model.base_model",
    "model.tokenizer_repo",
    "model.use_gpu",
    "model.use_f16",
    "model.fine_tune_path",
    "model.flash_attn",
    "model.offload_text_encoder",
    "model.sliced_attention_size",
    "outputs.directory",
    "dataset.source_dir",
    "dataset.caption_model",
    "dataset.max_caption_tokens",
    "dataset.caption_temperature",
];

pub fn execute(key: Option<&str>, value: Option<&str>) -> Result<()> {
    let mut config = Config::load()?;

    match (key, value) {
        // Show all config
        (None, None) => {
            println!("Configuration file: {:?}", Config::config_path()?);
            let mut section = "";
            for key in KEYS {
                let (group, name) = key.split_once('.').unwrap_or(("", key));
                if group != section {
                    println!("\n[{}]", group);
                    section = group;
                }
                let value = config.get(key)?;
                println!("  {} = {}", name, if value.is_empty() { "(not set)" } else { value.as_str() });
            }
        }

        // Get a specific key
        (Some(key), None) => {
            println!("{}", config.get(key)?);
        }

        // Set a specific key
        (Some(key), Some(value)) => {
            config.set(key, value)?;
            config.save()?;
            println!("Set {} = {}", key, value);
        }

        (None, Some(_)) => anyhow::bail!("A value needs a key"),
    }

    Ok(())
}

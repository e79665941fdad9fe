use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Daemon settings
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Model download settings
    #[serde(default)]
    pub models: ModelsConfig,

    /// Diffusion pipeline settings
    #[serde(default)]
    pub model: ModelConfig,

    /// Generated image storage
    #[serde(default)]
    pub outputs: OutputsConfig,

    /// Dataset preparation settings
    #[serde(default)]
    pub dataset: DatasetConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Upper bound on a single generation request, admission wait included
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    /// Directory to store downloaded models (default: ~/.config/pictor/models/)
    #[serde(default = "default_storage_path")]
    pub storage_path: PathBuf,

    /// HuggingFace token for private models
    #[serde(default)]
    pub hf_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// HuggingFace repo id or local diffusers-layout directory
    #[serde(default = "default_base_model")]
    pub base_model: String,

    /// Repo providing the CLIP `tokenizer.json` when the base model has none
    #[serde(default = "default_tokenizer_repo")]
    pub tokenizer_repo: String,

    /// Use GPU acceleration (Metal on macOS, CUDA on Linux)
    #[serde(default = "default_true")]
    pub use_gpu: bool,

    /// Run in half precision on accelerators
    #[serde(default = "default_true")]
    pub use_f16: bool,

    /// Optional fine-tuned LoRA overlay directory
    #[serde(default = "default_fine_tune_path")]
    pub fine_tune_path: PathBuf,

    /// Try the flash attention kernel
    #[serde(default = "default_true")]
    pub flash_attn: bool,

    /// Keep the text encoder in host memory
    #[serde(default = "default_true")]
    pub offload_text_encoder: bool,

    /// Attention slice size, `None` disables slicing
    #[serde(default = "default_sliced_attention_size")]
    pub sliced_attention_size: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputsConfig {
    /// Directory generated images are written to
    #[serde(default = "default_outputs_dir")]
    pub directory: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Directory holding the raw training images
    #[serde(default = "default_source_dir")]
    pub source_dir: PathBuf,

    /// Captioning model repo id
    #[serde(default = "default_caption_model")]
    pub caption_model: String,

    /// Maximum number of caption tokens
    #[serde(default = "default_max_caption_tokens")]
    pub max_caption_tokens: usize,

    /// Caption sampling temperature, 0 means greedy
    #[serde(default)]
    pub caption_temperature: f64,
}

fn default_storage_path() -> PathBuf {
    Config::base_dir()
        .map(|p| p.join("models"))
        .unwrap_or_else(|_| PathBuf::from("~/.config/pictor/models"))
}

fn default_port() -> u16 {
    8000
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_request_timeout_secs() -> u64 {
    600
}

fn default_base_model() -> String {
    "Lykon/dreamshaper-8".to_string()
}

fn default_tokenizer_repo() -> String {
    "openai/clip-vit-base-patch32".to_string()
}

fn default_true() -> bool {
    true
}

fn default_fine_tune_path() -> PathBuf {
    PathBuf::from("sd-model-finetuned-lora")
}

fn default_sliced_attention_size() -> Option<usize> {
    Some(1)
}

fn default_outputs_dir() -> PathBuf {
    PathBuf::from("outputs")
}

fn default_source_dir() -> PathBuf {
    PathBuf::from("dataset")
}

fn default_caption_model() -> String {
    "Salesforce/blip-image-captioning-large".to_string()
}

fn default_max_caption_tokens() -> usize {
    50
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            storage_path: default_storage_path(),
            hf_token: None,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_model: default_base_model(),
            tokenizer_repo: default_tokenizer_repo(),
            use_gpu: true,
            use_f16: true,
            fine_tune_path: default_fine_tune_path(),
            flash_attn: true,
            offload_text_encoder: true,
            sliced_attention_size: default_sliced_attention_size(),
        }
    }
}

impl Default for OutputsConfig {
    fn default() -> Self {
        Self {
            directory: default_outputs_dir(),
        }
    }
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            source_dir: default_source_dir(),
            caption_model: default_caption_model(),
            max_caption_tokens: default_max_caption_tokens(),
            caption_temperature: 0.0,
        }
    }
}

impl Config {
    /// Get the base directory: ~/.config/pictor/
    pub fn base_dir() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(home.join(".config").join("pictor"))
    }

    /// Load config from default location
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if config_path.exists() {
            let content = fs::read_to_string(&config_path)?;
            Self::from_toml(&content)
                .with_context(|| format!("Invalid config file {}", config_path.display()))
        } else {
            Ok(Config::default())
        }
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Save config to default location
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(&config_path, content)?;
        Ok(())
    }

    /// Get the config file path: ~/.config/pictor/config.toml
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::base_dir()?.join("config.toml"))
    }

    /// Get the cache directory: ~/.config/pictor/cache/
    pub fn cache_dir() -> Result<PathBuf> {
        Ok(Self::base_dir()?.join("cache"))
    }

    /// Get a configuration value by dotted key
    pub fn get(&self, key: &str) -> Result<String> {
        let value = match key {
            "daemon.host" => self.daemon.host.clone(),
            "daemon.port" => self.daemon.port.to_string(),
            "daemon.request_timeout_secs" => self.daemon.request_timeout_secs.to_string(),
            "models.storage_path" => self.models.storage_path.display().to_string(),
            "models.hf_token" => self
                .models
                .hf_token
                .as_ref()
                .map(|_| "***".to_string())
                .unwrap_or_default(),
            "model.base_model" => self.model.base_model.clone(),
            "model.tokenizer_repo" => self.model.tokenizer_repo.clone(),
            "model.use_gpu" => self.model.use_gpu.to_string(),
            "model.use_f16" => self.model.use_f16.to_string(),
            "model.fine_tune_path" => self.model.fine_tune_path.display().to_string(),
            "model.flash_attn" => self.model.flash_attn.to_string(),
            "model.offload_text_encoder" => self.model.offload_text_encoder.to_string(),
            "model.sliced_attention_size" => self
                .model
                .sliced_attention_size
                .map(|s| s.to_string())
                .unwrap_or_default(),
            "outputs.directory" => self.outputs.directory.display().to_string(),
            "dataset.source_dir" => self.dataset.source_dir.display().to_string(),
            "dataset.caption_model" => self.dataset.caption_model.clone(),
            "dataset.max_caption_tokens" => self.dataset.max_caption_tokens.to_string(),
            "dataset.caption_temperature" => self.dataset.caption_temperature.to_string(),
            _ => anyhow::bail!("Unknown config key: {}", key),
        };
        Ok(value)
    }

    /// Set a configuration value by dotted key
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "daemon.host" => self.daemon.host = value.to_string(),
            "daemon.port" => self.daemon.port = value.parse()?,
            "daemon.request_timeout_secs" => self.daemon.request_timeout_secs = value.parse()?,
            "models.storage_path" => self.models.storage_path = value.into(),
            "models.hf_token" => {
                self.models.hf_token = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                }
            }
            "model.base_model" => self.model.base_model = value.to_string(),
            "model.tokenizer_repo" => self.model.tokenizer_repo = value.to_string(),
            "model.use_gpu" => self.model.use_gpu = value.parse()?,
            "model.use_f16" => self.model.use_f16 = value.parse()?,
            "model.fine_tune_path" => self.model.fine_tune_path = value.into(),
            "model.flash_attn" => self.model.flash_attn = value.parse()?,
            "model.offload_text_encoder" => self.model.offload_text_encoder = value.parse()?,
            "model.sliced_attention_size" => {
                self.model.sliced_attention_size = if value.is_empty() {
                    None
                } else {
                    Some(value.parse()?)
                }
            }
            "outputs.directory" => self.outputs.directory = value.into(),
            "dataset.source_dir" => self.dataset.source_dir = value.into(),
            "dataset.caption_model" => self.dataset.caption_model = value.to_string(),
            "dataset.max_caption_tokens" => self.dataset.max_caption_tokens = value.parse()?,
            "dataset.caption_temperature" => self.dataset.caption_temperature = value.parse()?,
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.daemon.port, 8000);
        assert_eq!(config.daemon.host, "0.0.0.0");
        assert_eq!(config.model.base_model, "Lykon/dreamshaper-8");
        assert_eq!(config.model.sliced_attention_size, Some(1));
        assert_eq!(config.outputs.directory, PathBuf::from("outputs"));
        assert_eq!(config.dataset.max_caption_tokens, 50);
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let config = Config::from_toml(
            r#"
            [daemon]
            port = 9000

            [model]
            use_gpu = false
            "#,
        )
        .unwrap();
        assert_eq!(config.daemon.port, 9000);
        assert_eq!(config.daemon.request_timeout_secs, 600);
        assert!(!config.model.use_gpu);
        assert!(config.model.flash_attn);
    }

    #[test]
    fn set_then_get_round_trips_through_keys() {
        let mut config = Config::default();
        config.set("daemon.port", "8123").unwrap();
        config.set("model.sliced_attention_size", "").unwrap();
        config.set("models.hf_token", "secret").unwrap();

        assert_eq!(config.get("daemon.port").unwrap(), "8123");
        assert_eq!(config.get("model.sliced_attention_size").unwrap(), "");
        assert_eq!(config.get("models.hf_token").unwrap(), "***");
        assert!(config.set("daemon.port", "not-a-port").is_err());
        assert!(config.get("nope.nope").is_err());
    }
}

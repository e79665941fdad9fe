//! Fine-tuned LoRA overlays
//!
//! A LoRA overlay stores a low-rank `up · down` delta per targeted weight.
//! Merging adds `scale · up · down` to the base UNet weights so the model
//! can be built from a single, regular safetensors file.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// File name diffusers' training scripts write LoRA weights to
pub const LORA_WEIGHTS_FILE: &str = "pytorch_lora_weights.safetensors";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoraPart {
    Down,
    Up,
    Alpha,
}

#[derive(Debug, Default)]
struct LoraPair {
    down: Option<Tensor>,
    up: Option<Tensor>,
    alpha: Option<f32>,
}

#[derive(Debug)]
struct LoraDelta {
    down: Tensor,
    up: Tensor,
    alpha: Option<f32>,
}

impl LoraDelta {
    fn scale(&self) -> Result<f32> {
        let rank = self.down.dim(0)?;
        Ok(match self.alpha {
            Some(alpha) => alpha / rank as f32,
            None => 1.0,
        })
    }

    /// Dense `scale · up · down`, reshaped to the target weight's dims
    fn dense(&self, dims: &[usize]) -> Result<Tensor> {
        let up = self.up.to_dtype(DType::F32)?.flatten_from(1)?;
        let down = self.down.to_dtype(DType::F32)?.flatten_from(1)?;
        let delta = up.matmul(&down)?.reshape(dims.to_vec())?;
        Ok((delta * self.scale()? as f64)?)
    }
}

/// LoRA deltas keyed by the UNet weight they modify
#[derive(Debug)]
pub struct LoraOverlay {
    deltas: HashMap<String, LoraDelta>,
}

impl LoraOverlay {
    /// Load the overlay stored in `dir`
    pub fn load(dir: &Path) -> Result<Self> {
        let path = find_weights_file(dir)?;
        tracing::info!("Loading LoRA weights from {:?}", path);
        let tensors = candle_core::safetensors::load(&path, &Device::Cpu)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_tensors(tensors)
    }

    pub fn from_tensors(tensors: HashMap<String, Tensor>) -> Result<Self> {
        let mut pairs: HashMap<String, LoraPair> = HashMap::new();
        let mut skipped = 0usize;

        for (key, tensor) in tensors {
            let Some((module, part)) = parse_lora_key(&key) else {
                skipped += 1;
                continue;
            };
            let pair = pairs.entry(module).or_default();
            match part {
                LoraPart::Down => pair.down = Some(tensor),
                LoraPart::Up => pair.up = Some(tensor),
                LoraPart::Alpha => {
                    let alpha = tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
                    pair.alpha = alpha.first().copied();
                }
            }
        }

        let mut deltas = HashMap::new();
        for (module, pair) in pairs {
            match (pair.down, pair.up) {
                (Some(down), Some(up)) => {
                    deltas.insert(
                        format!("{}.weight", module),
                        LoraDelta {
                            down,
                            up,
                            alpha: pair.alpha,
                        },
                    );
                }
                _ => tracing::warn!("Incomplete LoRA pair for {}, ignoring", module),
            }
        }

        if deltas.is_empty() {
            anyhow::bail!("No UNet LoRA weights found");
        }
        if skipped > 0 {
            tracing::debug!("Skipped {} non-UNet LoRA tensors", skipped);
        }
        Ok(Self { deltas })
    }

    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    /// Add every delta to its base weight in place
    pub fn merge_into(&self, weights: &mut HashMap<String, Tensor>) -> Result<usize> {
        for (key, delta) in &self.deltas {
            let base = weights
                .get(key)
                .with_context(|| format!("LoRA targets unknown weight {}", key))?;
            let dtype = base.dtype();
            let merged = (base.to_dtype(DType::F32)? + delta.dense(base.dims())?)?;
            weights.insert(key.clone(), merged.to_dtype(dtype)?);
        }
        Ok(self.deltas.len())
    }
}

/// Merge `overlay` into the UNet weights at `base` and write them to `output`
pub fn merge_unet_weights(base: &Path, overlay: &LoraOverlay, output: &Path) -> Result<usize> {
    let mut weights = candle_core::safetensors::load(base, &Device::Cpu)
        .with_context(|| format!("Failed to read {}", base.display()))?;
    let merged = overlay.merge_into(&mut weights)?;
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }
    candle_core::safetensors::save(&weights, output)?;
    Ok(merged)
}

/// `pytorch_lora_weights.safetensors`, or the only safetensors file in `dir`
pub fn find_weights_file(dir: &Path) -> Result<PathBuf> {
    let preferred = dir.join(LORA_WEIGHTS_FILE);
    if preferred.is_file() {
        return Ok(preferred);
    }

    let candidates: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("Cannot read overlay directory {}", dir.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("safetensors"))
        .collect();

    match candidates.as_slice() {
        [single] => Ok(single.clone()),
        [] => anyhow::bail!("No safetensors file in {}", dir.display()),
        _ => anyhow::bail!(
            "Several safetensors files in {}, expected {}",
            dir.display(),
            LORA_WEIGHTS_FILE
        ),
    }
}

/// Map a LoRA tensor name to the UNet module it patches.
///
/// Accepts the diffusers layouts (`…to_q.lora.down.weight`,
/// `…processor.to_q_lora.down.weight`) and the PEFT one
/// (`…to_q.lora_A.weight`). Text encoder tensors map to `None`.
fn parse_lora_key(key: &str) -> Option<(String, LoraPart)> {
    let key = key.strip_prefix("base_model.model.").unwrap_or(key);
    if key.starts_with("text_encoder") {
        return None;
    }
    let key = key.strip_prefix("unet.").unwrap_or(key);

    const SUFFIXES: [(&str, LoraPart); 7] = [
        (".lora.down.weight", LoraPart::Down),
        (".lora.up.weight", LoraPart::Up),
        (".lora_A.weight", LoraPart::Down),
        (".lora_B.weight", LoraPart::Up),
        ("_lora.down.weight", LoraPart::Down),
        ("_lora.up.weight", LoraPart::Up),
        (".alpha", LoraPart::Alpha),
    ];

    let (module, part) = SUFFIXES
        .iter()
        .find_map(|(suffix, part)| key.strip_suffix(suffix).map(|m| (m, *part)))?;

    let module = match module.rsplit_once(".processor.") {
        Some((prefix, projection)) => {
            let projection = if projection == "to_out" {
                "to_out.0"
            } else {
                projection
            };
            format!("{}.{}", prefix, projection)
        }
        None => module.to_string(),
    };
    Some((module, part))
}

//! Weighted prompt compilation
//!
//! Turns prompt text into the fixed-shape embeddings the UNet is conditioned
//! on, applying per-token emphasis weights parsed by
//! [`pictor_core::prompt::parse_weighted`].

use anyhow::Result;
use candle_core::{DType, Tensor};
use pictor_core::prompt::{is_unweighted, parse_weighted, Fragment};
use pictor_runtime_api::TextEncoder;
use std::sync::Arc;

/// Below this the weighted mean is treated as zero and not rescaled
const MIN_MEAN: f32 = 1e-12;

#[derive(Clone)]
pub struct PromptCompiler {
    encoder: Arc<dyn TextEncoder>,
}

impl PromptCompiler {
    pub fn new(encoder: Arc<dyn TextEncoder>) -> Self {
        Self { encoder }
    }

    /// Compile prompt text into embeddings.
    ///
    /// Blank text yields `None`: no conditioning, as opposed to the
    /// embedding of an empty string.
    pub fn compile(&self, text: &str) -> Result<Option<Tensor>> {
        if text.trim().is_empty() {
            return Ok(None);
        }
        let fragments = parse_weighted(text);
        tracing::debug!("Prompt fragments: {:?}", fragments);
        self.compile_fragments(&fragments).map(Some)
    }

    /// Embedding of the empty prompt, used as the unconditional branch of guidance
    pub fn unconditional(&self) -> Result<Tensor> {
        self.compile_fragments(&[])
    }

    fn compile_fragments(&self, fragments: &[Fragment]) -> Result<Tensor> {
        let (token_ids, weights) = self.weighted_tokens(fragments)?;
        let embeddings = self.encoder.encode(&token_ids)?;
        if is_unweighted(fragments) {
            return Ok(embeddings);
        }
        apply_token_weights(&embeddings, &weights)
    }

    /// Padded token sequence with one weight per position.
    ///
    /// Special and padding tokens always carry weight 1.0.
    pub(crate) fn weighted_tokens(&self, fragments: &[Fragment]) -> Result<(Vec<u32>, Vec<f32>)> {
        let specials = self.encoder.special_tokens();
        let max_length = self.encoder.max_length();
        if max_length < 2 {
            anyhow::bail!("Text encoder max length {} leaves no room for tokens", max_length);
        }
        let capacity = max_length - 2;

        let mut ids = Vec::with_capacity(max_length);
        let mut weights = Vec::with_capacity(max_length);
        ids.push(specials.bos);
        weights.push(1.0);

        let mut dropped = 0usize;
        for fragment in fragments {
            for id in self.encoder.tokenize(&fragment.text)? {
                if ids.len() - 1 < capacity {
                    ids.push(id);
                    weights.push(fragment.weight);
                } else {
                    dropped += 1;
                }
            }
        }
        if dropped > 0 {
            tracing::warn!(
                "Prompt exceeds {} tokens, {} tokens were truncated",
                capacity,
                dropped
            );
        }

        ids.push(specials.eos);
        weights.push(1.0);
        ids.resize(max_length, specials.pad);
        weights.resize(max_length, 1.0);

        Ok((ids, weights))
    }
}

/// Scale each token embedding by its weight, then restore the original mean.
///
/// Without the rescale, prompts with a lot of emphasis would drift in
/// overall magnitude and the effective guidance strength with them.
pub fn apply_token_weights(embeddings: &Tensor, weights: &[f32]) -> Result<Tensor> {
    let embeddings = embeddings.to_dtype(DType::F32)?;
    let (batch, seq_len, _hidden) = embeddings.dims3()?;
    if seq_len != weights.len() {
        anyhow::bail!(
            "Got {} token weights for a sequence of length {}",
            weights.len(),
            seq_len
        );
    }

    let original_mean = embeddings.mean_all()?.to_scalar::<f32>()?;
    let weights = Tensor::from_slice(weights, (1, seq_len, 1), embeddings.device())?
        .repeat((batch, 1, 1))?;
    let weighted = embeddings.broadcast_mul(&weights)?;
    let weighted_mean = weighted.mean_all()?.to_scalar::<f32>()?;

    if weighted_mean.abs() < MIN_MEAN {
        return Ok(weighted);
    }
    Ok((weighted * (original_mean / weighted_mean) as f64)?)
}

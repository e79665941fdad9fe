//! CLIP text encoder
//!
//! Wraps candle-transformers' Stable Diffusion CLIP transformer behind the
//! [`TextEncoder`] contract.

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::Module;
use candle_transformers::models::stable_diffusion::{self, clip};
use pictor_runtime_api::{SpecialTokens, TextEncoder};
use std::path::Path;
use tokenizers::Tokenizer;

const START_OF_TEXT: &str = "<|startoftext|>";
const END_OF_TEXT: &str = "<|endoftext|>";

pub struct ClipTextEncoder {
    tokenizer: Tokenizer,
    model: clip::ClipTextTransformer,
    device: Device,
    specials: SpecialTokens,
    max_length: usize,
}

impl ClipTextEncoder {
    pub fn load(
        tokenizer_path: &Path,
        weights_path: &Path,
        config: &clip::Config,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(tokenizer_path)
            .map_err(|e| anyhow::anyhow!("Failed to load tokenizer: {}", e))?;

        let token_id = |token: &str| {
            tokenizer
                .token_to_id(token)
                .ok_or_else(|| anyhow::anyhow!("Tokenizer has no {} token", token))
        };
        let bos = token_id(START_OF_TEXT)?;
        let eos = token_id(END_OF_TEXT)?;
        let pad = match &config.pad_with {
            Some(padding) => token_id(padding)?,
            None => eos,
        };

        let model = stable_diffusion::build_clip_transformer(config, weights_path, device, dtype)?;
        tracing::info!("CLIP text encoder loaded on {:?} ({:?})", device, dtype);

        Ok(Self {
            tokenizer,
            model,
            device: device.clone(),
            specials: SpecialTokens { bos, eos, pad },
            max_length: config.max_position_embeddings,
        })
    }
}

impl TextEncoder for ClipTextEncoder {
    fn tokenize(&self, text: &str) -> Result<Vec<u32>> {
        Ok(self
            .tokenizer
            .encode(text, false)
            .map_err(|e| anyhow::anyhow!("Tokenization failed: {}", e))?
            .get_ids()
            .to_vec())
    }

    fn special_tokens(&self) -> SpecialTokens {
        self.specials
    }

    fn max_length(&self) -> usize {
        self.max_length
    }

    fn encode(&self, token_ids: &[u32]) -> Result<Tensor> {
        let input_ids = Tensor::new(token_ids, &self.device)?.unsqueeze(0)?;
        let embeddings = self.model.forward(&input_ids)?;
        Ok(embeddings.to_dtype(DType::F32)?)
    }
}

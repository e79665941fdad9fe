//! pictor_runtime_api - Runtime capability traits and types
//!
//! This crate defines the narrow contracts between the orchestration layer
//! and the models it drives. Each capability (text encoding, diffusion,
//! captioning) has one production implementation backed by candle and can
//! be replaced by a test double.

use anyhow::Result;
use candle_core::Tensor;
use image::{DynamicImage, ImageFormat, RgbImage};
use std::io::Cursor;

/// Special token ids of a text encoder vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialTokens {
    pub bos: u32,
    pub eos: u32,
    pub pad: u32,
}

/// Tokenizer plus text encoder producing fixed-shape prompt embeddings
pub trait TextEncoder: Send + Sync {
    /// Token ids for `text`, without any special tokens
    fn tokenize(&self, text: &str) -> Result<Vec<u32>>;

    fn special_tokens(&self) -> SpecialTokens;

    /// Sequence length the encoder expects, special tokens included
    fn max_length(&self) -> usize;

    /// Encode a full `max_length` token sequence into `(1, max_length, hidden)` embeddings
    fn encode(&self, token_ids: &[u32]) -> Result<Tensor>;
}

/// Image generation request, built per call and dropped afterwards
#[derive(Debug, Clone)]
pub struct ImageGenRequest {
    pub prompt_embeds: Tensor,
    /// `None` means no negative conditioning at all
    pub negative_embeds: Option<Tensor>,
    pub seed: u32,
    pub steps: usize,
    pub guidance_scale: f64,
}

/// Image generation response
#[derive(Debug, Clone)]
pub struct ImageGenResponse {
    /// Raw pixel data (RGB, u8)
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl ImageGenResponse {
    pub fn into_image(self) -> Result<RgbImage> {
        let (width, height) = (self.width, self.height);
        RgbImage::from_raw(width, height, self.pixels).ok_or_else(|| {
            anyhow::anyhow!(
                "Pixel buffer does not match a {}x{} RGB image",
                width,
                height
            )
        })
    }

    /// Encode as PNG bytes
    pub fn encode_png(self) -> Result<Vec<u8>> {
        let image = self.into_image()?;
        let mut bytes = Vec::new();
        image.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
        Ok(bytes)
    }
}

/// Trait for diffusion model backends
pub trait DiffusionModel: Send + Sync {
    /// Generate exactly one image from precomputed prompt embeddings
    fn generate(&self, request: &ImageGenRequest) -> Result<ImageGenResponse>;

    /// Get the model name
    fn name(&self) -> &str;

    /// Width and height of generated images
    fn output_size(&self) -> (u32, u32);
}

/// Trait for image captioning backends
pub trait Captioner: Send + Sync {
    /// Describe an image in natural language
    fn caption(&self, image: &DynamicImage) -> Result<String>;
}

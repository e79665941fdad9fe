//! Test doubles for the model capabilities

use crate::generator::Generator;
use anyhow::Result;
use candle_core::{Device, Tensor};
use pictor_core::OutputStore;
use pictor_runtime_api::{
    DiffusionModel, ImageGenRequest, ImageGenResponse, SpecialTokens, TextEncoder,
};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const MAX_LEN: usize = 8;
const HIDDEN: usize = 4;

pub struct FakeEncoder;

impl TextEncoder for FakeEncoder {
    fn tokenize(&self, text: &str) -> Result<Vec<u32>> {
        Ok(text.split_whitespace().map(|w| 10 + w.len() as u32).collect())
    }

    fn special_tokens(&self) -> SpecialTokens {
        SpecialTokens {
            bos: 1,
            eos: 2,
            pad: 0,
        }
    }

    fn max_length(&self) -> usize {
        MAX_LEN
    }

    fn encode(&self, token_ids: &[u32]) -> Result<Tensor> {
        let data: Vec<f32> = token_ids
            .iter()
            .flat_map(|&id| (0..HIDDEN).map(move |h| id as f32 + h as f32))
            .collect();
        Ok(Tensor::from_vec(data, (1, token_ids.len(), HIDDEN), &Device::Cpu)?)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SeenRequest {
    pub steps: usize,
    pub guidance_scale: f64,
    pub had_negative: bool,
}

/// Records every call and tracks how many run at once
pub struct FakeModel {
    delay: Duration,
    fail: bool,
    /// Size of the images actually returned, normally `output_size()`
    size: (u32, u32),
    active: AtomicUsize,
    pub max_active: AtomicUsize,
    pub calls: AtomicUsize,
    pub seeds: Mutex<Vec<u32>>,
    pub requests: Mutex<Vec<SeenRequest>>,
}

impl FakeModel {
    pub fn new() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            fail: false,
            size: (8, 8),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            seeds: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn returning_size(width: u32, height: u32) -> Self {
        Self {
            size: (width, height),
            ..Self::new()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }
}

impl DiffusionModel for FakeModel {
    fn generate(&self, request: &ImageGenRequest) -> Result<ImageGenResponse> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seeds.lock().unwrap().push(request.seed);
        self.requests.lock().unwrap().push(SeenRequest {
            steps: request.steps,
            guidance_scale: request.guidance_scale,
            had_negative: request.negative_embeds.is_some(),
        });

        std::thread::sleep(self.delay);
        self.active.fetch_sub(1, Ordering::SeqCst);

        if self.fail {
            anyhow::bail!("out of memory");
        }
        let (width, height) = self.size;
        Ok(ImageGenResponse {
            pixels: vec![128; (width * height * 3) as usize],
            width,
            height,
        })
    }

    fn name(&self) -> &str {
        "fake"
    }

    fn output_size(&self) -> (u32, u32) {
        (8, 8)
    }
}

pub fn generator_with(model: Arc<FakeModel>, dir: &Path, timeout: Duration) -> Generator {
    Generator::new(
        Arc::new(FakeEncoder),
        model,
        Arc::new(OutputStore::new(dir.join("outputs"))),
        timeout,
    )
}

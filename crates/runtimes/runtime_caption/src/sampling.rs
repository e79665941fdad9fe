//! Token sampling strategies

use anyhow::Result;
use candle_core::{DType, Tensor};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;

pub struct Sampler {
    temperature: f64,
    top_p: f64,
    rng: StdRng,
}

impl Sampler {
    /// A temperature of zero or below selects greedy decoding.
    pub fn new(temperature: f64, top_p: f64, seed: u64) -> Self {
        Self {
            temperature,
            top_p,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn greedy() -> Self {
        Self::new(0.0, 1.0, 0)
    }

    pub fn is_greedy(&self) -> bool {
        self.temperature <= 0.0
    }

    pub fn sample(&mut self, logits: &Tensor) -> Result<u32> {
        let logits = logits.to_dtype(DType::F32)?.to_vec1::<f32>()?;
        if logits.is_empty() {
            anyhow::bail!("Cannot sample from empty logits");
        }

        if self.is_greedy() {
            return Ok(argmax(&logits));
        }

        // Softmax with temperature
        let temperature = self.temperature as f32;
        let max_logit = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let exp: Vec<f32> = logits
            .iter()
            .map(|&x| ((x - max_logit) / temperature).exp())
            .collect();
        let sum: f32 = exp.iter().sum();
        let probs: Vec<f32> = exp.iter().map(|&x| x / sum).collect();

        if self.top_p < 1.0 {
            self.sample_top_p(&probs)
        } else {
            self.sample_multinomial(&probs)
        }
    }

    fn sample_top_p(&mut self, probs: &[f32]) -> Result<u32> {
        let mut indexed: Vec<(usize, f32)> = probs.iter().copied().enumerate().collect();
        indexed.sort_by(|a, b| b.1.total_cmp(&a.1));

        // Smallest prefix whose mass reaches top_p
        let mut cumsum = 0.0;
        let mut cutoff = indexed.len();
        for (i, (_, p)) in indexed.iter().enumerate() {
            cumsum += *p as f64;
            if cumsum >= self.top_p {
                cutoff = i + 1;
                break;
            }
        }

        let candidates = &indexed[..cutoff];
        let dist = WeightedIndex::new(candidates.iter().map(|(_, p)| *p))?;
        Ok(candidates[dist.sample(&mut self.rng)].0 as u32)
    }

    fn sample_multinomial(&mut self, probs: &[f32]) -> Result<u32> {
        let dist = WeightedIndex::new(probs)?;
        Ok(dist.sample(&mut self.rng) as u32)
    }
}

fn argmax(logits: &[f32]) -> u32 {
    logits
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (i, &x)| {
            if x > best.1 {
                (i, x)
            } else {
                best
            }
        })
        .0 as u32
}

//! Decoding strategies: greedy, top-k, temperature.

use candle_core::{Result, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Sampling configuration.
#[derive(Debug, Clone)]
pub struct SamplerConfig {
    /// `0` selects greedy decoding.
    pub temperature: f64,
    /// Keep only the `top_k` highest logits (`0` = no filter).
    pub top_k: usize,
    /// Seed for reproducible sampling; `None` draws from entropy.
    pub seed: Option<u64>,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            temperature: 0.8,
            top_k: 5,
            seed: None,
        }
    }
}

pub struct Sampler {
    config: SamplerConfig,
    rng: StdRng,
}

impl Sampler {
    pub fn new(config: SamplerConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { config, rng }
    }

    pub fn greedy() -> Self {
        Self::new(SamplerConfig {
            temperature: 0.0,
            top_k: 0,
            seed: None,
        })
    }

    /// Sample one token from logits (1-D tensor of vocab_size).
    pub fn sample(&mut self, logits: &Tensor) -> Result<u32> {
        let mut logits_vec: Vec<f32> = logits.to_vec1()?;

        // Greedy if temperature ~0
        if self.config.temperature < 1e-6 {
            return Ok(argmax(&logits_vec));
        }

        let temp = self.config.temperature as f32;
        for v in &mut logits_vec {
            *v /= temp;
        }

        if self.config.top_k > 0 && self.config.top_k < logits_vec.len() {
            let mut sorted = logits_vec.clone();
            sorted.sort_unstable_by(|a, b| b.total_cmp(a));
            let threshold = sorted[self.config.top_k - 1];
            for v in &mut logits_vec {
                if *v < threshold {
                    *v = f32::NEG_INFINITY;
                }
            }
        }

        let probs = softmax(&logits_vec);
        Ok(self.weighted_sample(&probs))
    }

    fn weighted_sample(&mut self, probs: &[f32]) -> u32 {
        let r: f32 = self.rng.gen();
        let mut cumsum = 0.0;
        for (i, &p) in probs.iter().enumerate() {
            cumsum += p;
            if cumsum >= r {
                return i as u32;
            }
        }
        // Rounding left `r` above the total: fall back to the most likely token.
        argmax(probs)
    }
}

/// Numerically stable softmax over a slice.
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max_val = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let mut probs: Vec<f32> = logits.iter().map(|&v| (v - max_val).exp()).collect();
    let sum: f32 = probs.iter().sum();
    if sum > 0.0 {
        for p in &mut probs {
            *p /= sum;
        }
    }
    probs
}

fn argmax(v: &[f32]) -> u32 {
    v.iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i as u32)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn greedy_sampling() {
        let mut sampler = Sampler::greedy();
        let logits = Tensor::new(&[0.1f32, 0.9, 0.3, 0.5], &Device::Cpu).unwrap();
        let token = sampler.sample(&logits).unwrap();
        assert_eq!(token, 1);
    }

    #[test]
    fn top_k_never_leaves_the_head() {
        let mut sampler = Sampler::new(SamplerConfig {
            temperature: 1.0,
            top_k: 2,
            seed: Some(7),
        });
        let logits = Tensor::new(&[2.0f32, 1.9, -1.0, 0.5, -3.0], &Device::Cpu).unwrap();
        for _ in 0..200 {
            let token = sampler.sample(&logits).unwrap();
            assert!(token == 0 || token == 1, "sampled {token} outside top-2");
        }
    }

    #[test]
    fn seeded_samplers_agree() {
        let config = SamplerConfig {
            temperature: 1.5,
            top_k: 0,
            seed: Some(3),
        };
        let logits = Tensor::new(&[0.2f32, 0.1, 0.4, 0.3], &Device::Cpu).unwrap();
        let mut a = Sampler::new(config.clone());
        let mut b = Sampler::new(config);
        let xs: Vec<u32> = (0..20).map(|_| a.sample(&logits).unwrap()).collect();
        let ys: Vec<u32> = (0..20).map(|_| b.sample(&logits).unwrap()).collect();
        assert_eq!(xs, ys);
    }

    #[test]
    fn softmax_sums_to_one() {
        let p = softmax(&[1.0, 2.0, f32::NEG_INFINITY, 0.5]);
        assert!((p.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert_eq!(p[2], 0.0);
    }
}

//! Learning-rate schedule as a multiplier on the peak rate.
//!
//! The factor ramps linearly from 0 over the warmup steps and then follows a
//! half cosine from 1 down to 0 at the last step.

use std::f64::consts::PI;
use std::str::FromStr;

/// What happens after warmup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LrDecay {
    Cosine,
    Constant,
}

impl FromStr for LrDecay {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cosine" => Ok(Self::Cosine),
            "constant" | "none" => Ok(Self::Constant),
            other => Err(format!("unknown lr decay '{other}' (cosine, constant)")),
        }
    }
}

#[derive(Clone, Debug)]
pub struct LrScheduler {
    peak: f64,
    warmup_steps: usize,
    total_steps: usize,
    decay: LrDecay,
    step: usize,
}

impl LrScheduler {
    pub fn new(peak: f64, warmup_steps: usize, total_steps: usize, decay: LrDecay) -> Self {
        Self {
            peak,
            warmup_steps,
            total_steps,
            decay,
            step: 0,
        }
    }

    /// Multiplier applied to the peak rate at `step`.
    pub fn factor(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            return step as f64 / self.warmup_steps.max(1) as f64;
        }
        match self.decay {
            LrDecay::Constant => 1.0,
            LrDecay::Cosine => {
                let span = self.total_steps.saturating_sub(self.warmup_steps).max(1);
                let progress = ((step - self.warmup_steps) as f64 / span as f64).min(1.0);
                0.5 * (1.0 + (PI * progress).cos())
            }
        }
    }

    pub fn current_lr(&self) -> f64 {
        self.peak * self.factor(self.step)
    }

    pub fn advance(&mut self) {
        self.step += 1;
    }
}

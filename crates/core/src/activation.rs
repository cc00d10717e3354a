//! Position-wise feed-forward sublayer.
//!
//! ```text
//! out = dropout( c_proj( gelu( c_fc(x) ) ) )
//! ```
//!
//! GELU is the exact (erf) form.

use candle_core::{Result, Tensor};
use candle_nn::{Dropout, Linear, Module, ModuleT, VarBuilder};

use minigpt_common::ModelConfig;

pub struct FeedForward {
    c_fc: Linear,
    c_proj: Linear,
    dropout: Dropout,
}

impl FeedForward {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let c_fc = candle_nn::linear(config.embed_dim, config.ff_dim, vb.pp("c_fc"))?;
        let c_proj = candle_nn::linear(config.ff_dim, config.embed_dim, vb.pp("c_proj"))?;
        Ok(Self {
            c_fc,
            c_proj,
            dropout: Dropout::new(config.dropout),
        })
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let h = self.c_fc.forward(x)?.gelu_erf()?;
        let h = self.c_proj.forward(&h)?;
        self.dropout.forward_t(&h, train)
    }
}

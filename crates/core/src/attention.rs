//! Multi-head causal self-attention with separate Q, K, V, O projections.
//!
//! Each projection is a [`Projection`] so any subset can carry a low-rank
//! adapter. The causal mask is built once for `max_seq_len` and sliced to
//! the current length on every call.

use candle_core::{DType, Device, Error, Result, Tensor, D};
use candle_nn::VarBuilder;

use minigpt_common::{AdapterTarget, ModelConfig};

use crate::linear::Projection;

pub struct CausalSelfAttention {
    q_proj: Projection,
    k_proj: Projection,
    v_proj: Projection,
    out_proj: Projection,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
    /// Lower-triangular `(max_seq_len, max_seq_len)` u8 mask, 1 = may attend.
    causal_mask: Tensor,
}

impl CausalSelfAttention {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let dim = config.embed_dim;
        let head_dim = config.head_dim();

        let q_proj = Projection::new(dim, dim, vb.pp("q_proj"))?;
        let k_proj = Projection::new(dim, dim, vb.pp("k_proj"))?;
        let v_proj = Projection::new(dim, dim, vb.pp("v_proj"))?;
        let out_proj = Projection::new(dim, dim, vb.pp("out_proj"))?;

        let causal_mask = causal_mask(config.max_seq_len, vb.device())?;

        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            out_proj,
            num_heads: config.num_heads,
            head_dim,
            scale: 1.0 / (head_dim as f64).sqrt(),
            causal_mask,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        Ok(self.forward_with_weights(x)?.0)
    }

    /// Returns the block output and the attention weights `(b, heads, t, t)`.
    pub fn forward_with_weights(&self, x: &Tensor) -> Result<(Tensor, Tensor)> {
        let (b, t, c) = x.dims3()?;
        let max_len = self.causal_mask.dim(0)?;
        if t > max_len {
            return Err(Error::Msg(format!(
                "sequence length {t} exceeds max_seq_len {max_len}"
            )));
        }

        let q = self.split_heads(&self.q_proj.forward(x)?, b, t)?;
        let k = self.split_heads(&self.k_proj.forward(x)?, b, t)?;
        let v = self.split_heads(&self.v_proj.forward(x)?, b, t)?;

        // Scaled dot-product attention with causal mask
        let scores = (q.matmul(&k.t()?)? * self.scale)?;
        let mask = self
            .causal_mask
            .narrow(0, 0, t)?
            .narrow(1, 0, t)?
            .broadcast_as(scores.shape())?;
        let neg_inf = Tensor::new(f32::NEG_INFINITY, x.device())?.broadcast_as(scores.shape())?;
        let scores = mask.where_cond(&scores, &neg_inf)?;

        let att = candle_nn::ops::softmax(&scores, D::Minus1)?;
        let y = att.matmul(&v)?;
        let y = y.transpose(1, 2)?.reshape((b, t, c))?;

        Ok((self.out_proj.forward(&y)?, att))
    }

    /// `(b, t, c)` → `(b, heads, t, head_dim)`, contiguous.
    fn split_heads(&self, x: &Tensor, b: usize, t: usize) -> Result<Tensor> {
        x.reshape((b, t, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    pub fn projection(&self, target: AdapterTarget) -> &Projection {
        match target {
            AdapterTarget::Query => &self.q_proj,
            AdapterTarget::Key => &self.k_proj,
            AdapterTarget::Value => &self.v_proj,
            AdapterTarget::Output => &self.out_proj,
        }
    }

    pub fn projection_mut(&mut self, target: AdapterTarget) -> &mut Projection {
        match target {
            AdapterTarget::Query => &mut self.q_proj,
            AdapterTarget::Key => &mut self.k_proj,
            AdapterTarget::Value => &mut self.v_proj,
            AdapterTarget::Output => &mut self.out_proj,
        }
    }

    /// All four projections at once, keyed by target.
    pub fn projections_mut(&mut self) -> [(AdapterTarget, &mut Projection); 4] {
        [
            (AdapterTarget::Query, &mut self.q_proj),
            (AdapterTarget::Key, &mut self.k_proj),
            (AdapterTarget::Value, &mut self.v_proj),
            (AdapterTarget::Output, &mut self.out_proj),
        ]
    }
}

fn causal_mask(max_len: usize, device: &Device) -> Result<Tensor> {
    Tensor::tril2(max_len, DType::U8, device)
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    fn config() -> ModelConfig {
        ModelConfig {
            vocab_size: 10,
            embed_dim: 16,
            num_heads: 4,
            num_layers: 1,
            max_seq_len: 8,
            ..Default::default()
        }
    }

    #[test]
    fn future_positions_get_zero_weight() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let attn = CausalSelfAttention::new(&config(), vb).unwrap();
        let x = Tensor::randn(0f32, 1f32, (2, 6, 16), &dev).unwrap();
        let (y, att) = attn.forward_with_weights(&x).unwrap();
        assert_eq!(y.dims(), &[2, 6, 16]);
        assert_eq!(att.dims(), &[2, 4, 6, 6]);

        for bi in 0..2 {
            let batch = att.get(bi).unwrap().to_vec3::<f32>().unwrap();
            for head in &batch {
                for (i, row) in head.iter().enumerate() {
                    for (j, &w) in row.iter().enumerate() {
                        if j > i {
                            assert_eq!(w, 0.0, "row {i} attends to future position {j}");
                        }
                    }
                    let sum: f32 = row.iter().sum();
                    assert!((sum - 1.0).abs() < 1e-5);
                }
            }
        }
    }

    #[test]
    fn rejects_sequences_longer_than_mask() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let attn = CausalSelfAttention::new(&config(), vb).unwrap();
        let x = Tensor::zeros((1, 9, 16), DType::F32, &dev).unwrap();
        assert!(attn.forward(&x).is_err());
    }
}

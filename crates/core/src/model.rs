//! Word-level decoder-only transformer (MiniGPT).
//!
//! Token embedding + fixed sinusoidal positions → N post-norm blocks →
//! final LayerNorm → output head. The head is either its own `lm_head`
//! matrix or tied to the token embedding (`weight_tying`).
//!
//! Parameter names (as stored in the `VarMap`):
//!
//! ```text
//! wte.weight
//! h.{i}.attn.{q_proj,k_proj,v_proj,out_proj}.{weight,bias[,lora_a,lora_b]}
//! h.{i}.ln1.{weight,bias}   h.{i}.mlp.{c_fc,c_proj}.{weight,bias}   h.{i}.ln2.{weight,bias}
//! ln_f.{weight,bias}
//! lm_head.weight            (untied only)
//! ```

use candle_core::{Device, Error, Result, Tensor};
use candle_nn::{embedding, layer_norm, Dropout, Embedding, LayerNorm, Linear, Module, ModuleT, VarBuilder};

use minigpt_common::{LoraConfig, ModelConfig};

use crate::activation::FeedForward;
use crate::attention::CausalSelfAttention;
use crate::linear::{matmul_reshape, Projection};

/// Token embedding parameter.
pub const EMBEDDING_WEIGHT: &str = "wte.weight";
/// Untied output projection parameter.
pub const LM_HEAD_WEIGHT: &str = "lm_head.weight";
/// Prefix of the final LayerNorm parameters.
pub const FINAL_NORM_PREFIX: &str = "ln_f.";

/// Parameter prefix of decoder block `i` (`"h.{i}."`).
pub fn block_prefix(i: usize) -> String {
    format!("h.{i}.")
}

/// `(max_len, dim)` table: `pe[p, 2i] = sin(p / 10000^(2i/dim))`,
/// `pe[p, 2i+1] = cos(p / 10000^(2i/dim))`.
pub fn sinusoidal_positions(max_len: usize, dim: usize, device: &Device) -> Result<Tensor> {
    let mut table = Vec::with_capacity(max_len * dim);
    for pos in 0..max_len {
        for ch in 0..dim {
            let pair = (ch - ch % 2) as f64;
            let angle = pos as f64 / 10000f64.powf(pair / dim as f64);
            let v = if ch % 2 == 0 { angle.sin() } else { angle.cos() };
            table.push(v as f32);
        }
    }
    Tensor::from_vec(table, (max_len, dim), device)
}

// ── Decoder Block ───────────────────────────────────────────────────────────

/// Post-norm block: `x = ln1(x + dropout(attn(x)))`, `x = ln2(x + ffn(x))`.
pub struct DecoderBlock {
    attn: CausalSelfAttention,
    ln1: LayerNorm,
    ffn: FeedForward,
    ln2: LayerNorm,
    dropout: Dropout,
}

impl DecoderBlock {
    fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let attn = CausalSelfAttention::new(config, vb.pp("attn"))?;
        let ln1 = layer_norm(config.embed_dim, config.layer_norm_eps, vb.pp("ln1"))?;
        let ffn = FeedForward::new(config, vb.pp("mlp"))?;
        let ln2 = layer_norm(config.embed_dim, config.layer_norm_eps, vb.pp("ln2"))?;
        Ok(Self {
            attn,
            ln1,
            ffn,
            ln2,
            dropout: Dropout::new(config.dropout),
        })
    }

    /// Returns the block output and its attention weights.
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<(Tensor, Tensor)> {
        let (attn_out, att) = self.attn.forward_with_weights(x)?;
        let attn_out = self.dropout.forward_t(&attn_out, train)?;
        let x = self.ln1.forward(&(x + attn_out)?)?;

        let ff_out = self.ffn.forward_t(&x, train)?;
        let x = self.ln2.forward(&(&x + ff_out)?)?;
        Ok((x, att))
    }

    pub fn attention(&self) -> &CausalSelfAttention {
        &self.attn
    }

    pub fn attention_mut(&mut self) -> &mut CausalSelfAttention {
        &mut self.attn
    }
}

// ── Output head ─────────────────────────────────────────────────────────────

/// Projection from hidden states to vocabulary logits.
enum OutputHead {
    /// `logits = x · wteᵀ`.
    Tied,
    Untied(Linear),
}

// ── MiniGpt ─────────────────────────────────────────────────────────────────

pub struct MiniGpt {
    wte: Embedding,
    positions: Tensor,
    blocks: Vec<DecoderBlock>,
    ln_f: LayerNorm,
    head: OutputHead,
    config: ModelConfig,
}

impl MiniGpt {
    pub fn new(vb: VarBuilder, config: &ModelConfig) -> Result<Self> {
        let wte = embedding(config.vocab_size, config.embed_dim, vb.pp("wte"))?;
        let positions = sinusoidal_positions(config.max_seq_len, config.embed_dim, vb.device())?;

        let mut blocks = Vec::with_capacity(config.num_layers);
        for i in 0..config.num_layers {
            blocks.push(DecoderBlock::new(config, vb.pp(format!("h.{i}")))?);
        }

        let ln_f = layer_norm(config.embed_dim, config.layer_norm_eps, vb.pp("ln_f"))?;

        // Tying is re-established on every construction: the tied head reads
        // whatever `wte` holds, so rebuilding after expansion keeps them aligned.
        let head = if config.weight_tying {
            OutputHead::Tied
        } else {
            OutputHead::Untied(candle_nn::linear_no_bias(
                config.embed_dim,
                config.vocab_size,
                vb.pp("lm_head"),
            )?)
        };

        Ok(Self {
            wte,
            positions,
            blocks,
            ln_f,
            head,
            config: config.clone(),
        })
    }

    /// Inference forward pass (dropout off). Returns `(b, t, vocab)` logits.
    pub fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        self.forward_t(input_ids, false)
    }

    pub fn forward_t(&self, input_ids: &Tensor, train: bool) -> Result<Tensor> {
        Ok(self.run(input_ids, train, false)?.0)
    }

    /// Inference forward pass that also returns every layer's attention
    /// weights, each `(b, heads, t, t)`.
    pub fn forward_with_attention(&self, input_ids: &Tensor) -> Result<(Tensor, Vec<Tensor>)> {
        self.run(input_ids, false, true)
    }

    fn run(
        &self,
        input_ids: &Tensor,
        train: bool,
        keep_attention: bool,
    ) -> Result<(Tensor, Vec<Tensor>)> {
        let (_b, t) = input_ids.dims2()?;
        if t == 0 || t > self.config.max_seq_len {
            return Err(Error::Msg(format!(
                "sequence length {t} outside 1..={}",
                self.config.max_seq_len
            )));
        }

        let x = self.wte.forward(input_ids)?;
        let mut x = x.broadcast_add(&self.positions.narrow(0, 0, t)?)?;

        let mut attention = Vec::new();
        for block in &self.blocks {
            let (out, att) = block.forward_t(&x, train)?;
            x = out;
            if keep_attention {
                attention.push(att);
            }
        }
        let x = self.ln_f.forward(&x)?;

        let logits = match &self.head {
            OutputHead::Tied => matmul_reshape(&x, &self.wte.embeddings().t()?)?,
            OutputHead::Untied(lm_head) => lm_head.forward(&x)?,
        };
        Ok((logits, attention))
    }

    /// Wrap the configured attention projections of every block in fresh
    /// adapters. `vb` must be the model's root builder. Returns the wrapped
    /// projection prefixes.
    pub fn inject_adapters(&mut self, lora: &LoraConfig, vb: VarBuilder) -> Result<Vec<String>> {
        let mut wrapped = Vec::new();
        for (i, block) in self.blocks.iter_mut().enumerate() {
            for &target in &lora.targets {
                let prefix = format!("h.{i}.attn.{}", target.module_name());
                block
                    .attention_mut()
                    .projection_mut(target)
                    .inject(lora.rank, lora.alpha, vb.pp(&prefix))?;
                wrapped.push(prefix);
            }
        }
        Ok(wrapped)
    }

    /// Every adapted projection together with its parameter prefix.
    pub fn adapted_projections_mut(&mut self) -> Vec<(String, &mut Projection)> {
        let mut out = Vec::new();
        for (i, block) in self.blocks.iter_mut().enumerate() {
            for (target, proj) in block.attention_mut().projections_mut() {
                if proj.is_adapted() {
                    out.push((format!("h.{i}.attn.{}", target.module_name()), proj));
                }
            }
        }
        out
    }

    pub fn blocks(&self) -> &[DecoderBlock] {
        &self.blocks
    }

    pub fn embeddings(&self) -> &Tensor {
        self.wte.embeddings()
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

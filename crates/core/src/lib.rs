//! # minigpt-core: model and adapters
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`linear`] | `Projection` (plain / low-rank), `LoraLinear` |
//! | [`attention`] | `CausalSelfAttention` with per-projection adapter slots |
//! | [`activation`] | `FeedForward` (GELU MLP) |
//! | [`model`] | `MiniGpt` (post-norm decoder), `DecoderBlock` |
//! | [`state`] | `LanguageModel`: parameters, trainability, expansion, merge, persistence |

pub mod activation;
pub mod attention;
pub mod linear;
pub mod model;
pub mod state;

// ── Public re-exports ───────────────────────────────────────────────────────

pub use attention::CausalSelfAttention;
pub use linear::{matmul_reshape, LoraLinear, Projection};
pub use model::{block_prefix, DecoderBlock, MiniGpt, EMBEDDING_WEIGHT, FINAL_NORM_PREFIX, LM_HEAD_WEIGHT};
pub use state::{
    LanguageModel, ParameterCounts, ADAPTER_CONFIG_FILE, ADAPTER_WEIGHTS_FILE, CONFIG_FILE,
    EMBEDDING_WEIGHTS_FILE, TOKENIZER_FILE, WEIGHTS_FILE,
};

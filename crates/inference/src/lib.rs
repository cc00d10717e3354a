//! # minigpt-infer: predictions and sampling
//!
//! * **[`Sampler`]**: greedy, top-k, temperature.
//! * **[`top_predictions`] / [`generate`]**: next-word ranking and
//!   autoregressive generation over a [`minigpt_core::LanguageModel`].
//! * **[`InferenceRuntime`]**: load a full or adapter model directory.

pub mod predict;
pub mod runtime;
pub mod sampler;

pub use predict::{generate, next_token_probs, top_predictions, Prediction};
pub use runtime::InferenceRuntime;
pub use sampler::{Sampler, SamplerConfig};

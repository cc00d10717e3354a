//! # minigpt-common: Shared Primitives
//!
//! Types and utilities shared across every crate in the workspace:
//!
//! * **[`ModelConfig`]** / **[`LoraConfig`]**: hyper-parameters (serialised as JSON).
//! * **[`WordTokenizer`]**: growable word ↔ id vocabulary.
//! * **[`SequenceDataset`]**: sliding-window next-token examples and batching.
//! * **[`corpus`]**: the built-in training and fine-tuning sentences.

pub mod config;
pub mod corpus;
pub mod data;
pub mod tokenizer;

pub use config::{AdapterManifest, AdapterTarget, LoraConfig, ModelConfig};
pub use data::{
    batch_to_tensors, load_sentences, split_validation, Batch, SequenceDataset, SequenceExample,
};
pub use tokenizer::{normalize, WordTokenizer};

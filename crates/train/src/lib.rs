//! # minigpt-train: training loop and fine-tuning strategies
//!
//! * **[`Trainer`]** borrows a [`minigpt_core::LanguageModel`] and owns the
//!   optimiser and schedule. [`Trainer::fit`] runs epochs with optional
//!   validation, early stopping and best-snapshot restore.
//! * **[`LrScheduler`]**: linear warmup from zero, then cosine to zero.
//! * **[`Strategy`]**: full, layer-freezing and adapter fine-tuning, each on
//!   a deep copy of the base model ([`finetune`]), plus [`pretrain`].
//!   [`rehearsal_sentences`] picks the base sentences a correction keeps.

pub mod scheduler;
pub mod strategy;
pub mod trainer;

pub use scheduler::{LrDecay, LrScheduler};
pub use strategy::{
    finetune, pretrain, rehearsal_sentences, FineTuneConfig, FineTuneOutcome, Strategy,
    ADAPTER_LR, CONTRADICTION_PREFIX, LAYER_FROZEN_LR, MERGED_LABEL, PRETRAIN_LR,
};
pub use trainer::{EpochMetrics, StepMetrics, Trainer, TrainerConfig, TrainingOutcome};

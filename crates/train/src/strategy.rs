//! Fine-tuning strategies.
//!
//! Every strategy works on a deep copy of the base model and only differs in
//! which parameters it leaves trainable and the default learning rate:
//!
//! | Strategy | Trainable | LR |
//! |----------|-----------|----|
//! | [`Strategy::Full`] | everything | pretrain LR / 5 |
//! | [`Strategy::LayerFreezing`] | last blocks, `ln_f`, `lm_head`, `wte` | 0.001 |
//! | [`Strategy::Adapter`] | `lora_a` / `lora_b`, new rows of `lm_head` / `wte` | 0.002 |
//!
//! Corrections are trained together with a rehearsal set
//! ([`rehearsal_sentences`]): base sentences the correction does not
//! contradict, so unrelated continuations keep their answers.

use std::fmt;

use minigpt_common::{AdapterTarget, LoraConfig, SequenceDataset, WordTokenizer};
use minigpt_core::{
    block_prefix, LanguageModel, ParameterCounts, EMBEDDING_WEIGHT, FINAL_NORM_PREFIX,
    LM_HEAD_WEIGHT,
};

use crate::trainer::{EpochMetrics, Trainer, TrainerConfig, TrainingOutcome};

/// Learning rate used to train the base model.
pub const PRETRAIN_LR: f64 = 0.005;
/// Full fine-tuning divides the pretraining LR by this factor.
pub const FULL_LR_DIVISOR: f64 = 5.0;
pub const LAYER_FROZEN_LR: f64 = 0.001;
pub const ADAPTER_LR: f64 = 0.002;

/// Label recorded for an adapter model after its adapters were merged.
pub const MERGED_LABEL: &str = "lora_merged";

/// Two sentences sharing at least this many leading words state competing
/// continuations of the same context.
pub const CONTRADICTION_PREFIX: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub enum Strategy {
    Full,
    LayerFreezing { trainable_blocks: usize },
    Adapter(LoraConfig),
}

impl Strategy {
    /// Name recorded as `finetuning_method` in saved configs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Full => "full_finetuned",
            Self::LayerFreezing { .. } => "layer_frozen",
            Self::Adapter(lora) if lora.targets == [AdapterTarget::Value] => "lora_v_only",
            Self::Adapter(_) => "lora_adapter",
        }
    }

    pub fn default_lr(&self) -> f64 {
        match self {
            Self::Full => PRETRAIN_LR / FULL_LR_DIVISOR,
            Self::LayerFreezing { .. } => LAYER_FROZEN_LR,
            Self::Adapter(_) => ADAPTER_LR,
        }
    }

    /// Set `model`'s trainable set (and inject adapters) for this strategy.
    pub fn prepare(&self, model: &mut LanguageModel) -> anyhow::Result<()> {
        match self {
            Self::Full => model.unfreeze_all()?,
            Self::LayerFreezing { trainable_blocks } => {
                let layers = model.config().num_layers;
                model.freeze_all();
                for i in layers.saturating_sub(*trainable_blocks)..layers {
                    let prefix = block_prefix(i);
                    model.unfreeze_where(|n| n.starts_with(&prefix))?;
                }
                model.unfreeze_where(|n| {
                    n.starts_with(FINAL_NORM_PREFIX) || n == LM_HEAD_WEIGHT || n == EMBEDDING_WEIGHT
                })?;
            }
            Self::Adapter(lora) => {
                model.freeze_all();
                model.inject_adapters(lora.clone())?;
                model.unfreeze_where(|n| n == LM_HEAD_WEIGHT || n == EMBEDDING_WEIGHT)?;
                let base_rows = model.base_vocab_size();
                for name in [EMBEDDING_WEIGHT, LM_HEAD_WEIGHT] {
                    if model.is_trainable(name) {
                        model.lock_rows(name, base_rows)?;
                    }
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => write!(f, "full fine-tuning"),
            Self::LayerFreezing { trainable_blocks } => {
                write!(f, "layer freezing (last {trainable_blocks} block(s) trainable)")
            }
            Self::Adapter(lora) => {
                let targets: Vec<&str> = lora.targets.iter().map(|t| t.module_name()).collect();
                write!(f, "LoRA r={} alpha={} on {}", lora.rank, lora.alpha, targets.join(","))
            }
        }
    }
}

// ── Config ──────────────────────────────────────────────────────────────────

/// Dataset shape plus trainer knobs for one run.
#[derive(Debug, Clone)]
pub struct FineTuneConfig {
    /// Sliding-window length of each example.
    pub window: usize,
    /// Append `<EOS>` to every sentence before windowing.
    pub append_eos: bool,
    /// Overrides the strategy's default learning rate.
    pub lr: Option<f64>,
    /// Extra sentences mixed into the training set.
    pub rehearsal: Vec<String>,
    pub trainer: TrainerConfig,
}

impl Default for FineTuneConfig {
    fn default() -> Self {
        Self {
            window: 4,
            append_eos: false,
            lr: None,
            rehearsal: Vec::new(),
            trainer: TrainerConfig::default(),
        }
    }
}

impl FineTuneConfig {
    /// Settings for training the base model from scratch.
    pub fn pretraining() -> Self {
        Self {
            window: 4,
            append_eos: false,
            lr: None,
            rehearsal: Vec::new(),
            trainer: TrainerConfig {
                epochs: 100,
                batch_size: 8,
                lr: PRETRAIN_LR,
                ..Default::default()
            },
        }
    }
}

// ── Runs ────────────────────────────────────────────────────────────────────

pub struct FineTuneOutcome {
    pub model: LanguageModel,
    pub strategy: Strategy,
    pub learning_rate: f64,
    pub counts: ParameterCounts,
    pub training: TrainingOutcome,
}

impl FineTuneOutcome {
    /// Copy of the fine-tuned model with adapters folded into the base
    /// weights. Fails for non-adapter strategies.
    pub fn merged(&self) -> anyhow::Result<LanguageModel> {
        if !matches!(self.strategy, Strategy::Adapter(_)) {
            anyhow::bail!("{} has no adapters to merge", self.strategy.label());
        }
        let mut merged = self.model.deep_copy()?;
        merged.merge_adapters()?;
        merged.set_finetuning_method(MERGED_LABEL);
        Ok(merged)
    }
}

/// Sentences of `base` that no sentence of `corrections` contradicts.
///
/// A base sentence is dropped when a different correction sentence shares
/// its first [`CONTRADICTION_PREFIX`] words.
pub fn rehearsal_sentences<S: AsRef<str>, T: AsRef<str>>(
    base: &[S],
    corrections: &[T],
) -> Vec<String> {
    let words = |s: &str| -> Vec<String> {
        s.split_whitespace().map(str::to_lowercase).collect()
    };
    let corrections: Vec<Vec<String>> = corrections.iter().map(|c| words(c.as_ref())).collect();
    base.iter()
        .map(|s| s.as_ref())
        .filter(|sentence| {
            let w = words(*sentence);
            !corrections.iter().any(|c| {
                c != &w
                    && c.len() >= CONTRADICTION_PREFIX
                    && w.len() >= CONTRADICTION_PREFIX
                    && c[..CONTRADICTION_PREFIX] == w[..CONTRADICTION_PREFIX]
            })
        })
        .map(str::to_string)
        .collect()
}

fn datasets<S: AsRef<str>>(
    tokenizer: &WordTokenizer,
    train: &[S],
    val: Option<&[S]>,
    config: &FineTuneConfig,
) -> (SequenceDataset, Option<SequenceDataset>) {
    let mut sentences: Vec<&str> = train.iter().map(|s| s.as_ref()).collect();
    sentences.extend(config.rehearsal.iter().map(String::as_str));
    let train_ds = SequenceDataset::new(&sentences, tokenizer, config.window, config.append_eos);
    let val_ds = val.map(|v| SequenceDataset::new(v, tokenizer, config.window, config.append_eos));
    (train_ds, val_ds)
}

/// Train every parameter of `model` in place.
pub fn pretrain<S: AsRef<str>>(
    model: &mut LanguageModel,
    tokenizer: &WordTokenizer,
    train: &[S],
    val: Option<&[S]>,
    config: &FineTuneConfig,
    on_epoch: impl FnMut(&EpochMetrics),
) -> anyhow::Result<TrainingOutcome> {
    model.unfreeze_all()?;
    let (train_ds, val_ds) = datasets(tokenizer, train, val, config);
    tracing::info!(
        sentences = train.len(),
        examples = train_ds.len(),
        vocab = tokenizer.vocab_size(),
        "pretraining"
    );

    let trainer_config = TrainerConfig {
        lr: config.lr.unwrap_or(PRETRAIN_LR),
        ..config.trainer.clone()
    };
    let steps = train_ds.num_batches(trainer_config.batch_size);
    let mut trainer = Trainer::new(model, trainer_config, steps)?;
    trainer.fit(&train_ds, val_ds.as_ref(), on_epoch)
}

/// Deep-copy `base`, prepare it for `strategy` and train on `train`.
///
/// `tokenizer` must already cover `train`; run vocabulary expansion on the
/// base model first.
pub fn finetune<S: AsRef<str>>(
    base: &LanguageModel,
    tokenizer: &WordTokenizer,
    train: &[S],
    val: Option<&[S]>,
    strategy: &Strategy,
    config: &FineTuneConfig,
    on_epoch: impl FnMut(&EpochMetrics),
) -> anyhow::Result<FineTuneOutcome> {
    if tokenizer.vocab_size() != base.vocab_size() {
        anyhow::bail!(
            "tokenizer has {} ids but the model has {} embedding rows; expand the vocabulary first",
            tokenizer.vocab_size(),
            base.vocab_size()
        );
    }

    let mut model = base.deep_copy()?;
    strategy.prepare(&mut model)?;
    model.set_finetuning_method(strategy.label());
    let counts = model.parameter_counts()?;

    let (train_ds, val_ds) = datasets(tokenizer, train, val, config);
    let learning_rate = config.lr.unwrap_or_else(|| strategy.default_lr());
    tracing::info!(
        strategy = %strategy,
        examples = train_ds.len(),
        rehearsal = config.rehearsal.len(),
        validation = val_ds.as_ref().map_or(0, |v| v.len()),
        lr = learning_rate,
        "fine-tuning"
    );

    let trainer_config = TrainerConfig {
        lr: learning_rate,
        ..config.trainer.clone()
    };
    let steps = train_ds.num_batches(trainer_config.batch_size);
    let training = {
        let mut trainer = Trainer::new(&model, trainer_config, steps)?;
        trainer.fit(&train_ds, val_ds.as_ref(), on_epoch)?
    };

    Ok(FineTuneOutcome {
        model,
        strategy: strategy.clone(),
        learning_rate,
        counts,
        training,
    })
}

// ── Tests ───────────────────────────────────────────────────────────────────

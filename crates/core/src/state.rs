//! Owned model state: parameters, module tree and trainability record.
//!
//! [`LanguageModel`] owns the `VarMap` holding every parameter and the
//! [`MiniGpt`] built from it. Operations that change parameter shapes or
//! the module tree (vocabulary expansion, adapter injection, merge, deep
//! copy) update the `VarMap` first and then rebuild or patch the module
//! tree so both stay consistent.
//!
//! Trainability is an explicit set of parameter names. The trainer asks
//! [`LanguageModel::trainable_vars`] for exactly the variables it may update.
//! A trainable matrix can additionally have its leading rows locked
//! ([`LanguageModel::lock_rows`]); the trainer keeps those rows fixed, so only
//! the embedding rows of newly added words move.
//!
//! # Directory layout
//!
//! | File | Written by |
//! |------|------------|
//! | `config.json` | [`LanguageModel::save`] |
//! | `model.safetensors` | [`LanguageModel::save`] |
//! | `lora_config.json` | [`LanguageModel::save_adapter`] |
//! | `lora_weights.safetensors` | [`LanguageModel::save_adapter`] |
//! | `embedding_weights.safetensors` | [`LanguageModel::save_adapter`] |

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::MutexGuard;

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};

use minigpt_common::{AdapterManifest, LoraConfig, ModelConfig, WordTokenizer};

use crate::model::{MiniGpt, EMBEDDING_WEIGHT, LM_HEAD_WEIGHT};

pub const CONFIG_FILE: &str = "config.json";
pub const WEIGHTS_FILE: &str = "model.safetensors";
pub const TOKENIZER_FILE: &str = "tokenizer.json";
pub const ADAPTER_CONFIG_FILE: &str = "lora_config.json";
pub const ADAPTER_WEIGHTS_FILE: &str = "lora_weights.safetensors";
pub const EMBEDDING_WEIGHTS_FILE: &str = "embedding_weights.safetensors";

/// Standard deviation of the noise added to new embedding rows and of the
/// new output-projection rows.
const NEW_ROW_STDEV: f32 = 0.01;

/// Trainable vs. total scalar parameter counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParameterCounts {
    pub trainable: usize,
    pub total: usize,
}

impl ParameterCounts {
    pub fn trainable_fraction(&self) -> f64 {
        self.trainable as f64 / self.total.max(1) as f64
    }
}

fn is_adapter_param(name: &str) -> bool {
    name.ends_with(".lora_a") || name.ends_with(".lora_b")
}

fn lock_vars(varmap: &VarMap) -> Result<MutexGuard<'_, HashMap<String, Var>>> {
    varmap
        .data()
        .lock()
        .map_err(|_| anyhow::anyhow!("parameter map lock poisoned"))
}

// ── LanguageModel ───────────────────────────────────────────────────────────

pub struct LanguageModel {
    model: MiniGpt,
    varmap: VarMap,
    config: ModelConfig,
    adapters: Option<LoraConfig>,
    trainable: BTreeSet<String>,
    /// Leading rows of a trainable matrix that must not change.
    row_locks: BTreeMap<String, usize>,
    /// Vocabulary size before any expansion of this lineage.
    base_vocab_size: usize,
    device: Device,
}

impl LanguageModel {
    /// Freshly initialised model; every parameter starts trainable.
    pub fn new(config: ModelConfig, device: Device) -> Result<Self> {
        config.validate()?;
        let varmap = VarMap::new();
        Self::from_varmap(varmap, config, None, device)
    }

    fn from_varmap(
        varmap: VarMap,
        config: ModelConfig,
        adapters: Option<LoraConfig>,
        device: Device,
    ) -> Result<Self> {
        let model = build(&varmap, &config, adapters.as_ref(), &device)?;
        let trainable = lock_vars(&varmap)?.keys().cloned().collect();
        Ok(Self {
            model,
            varmap,
            base_vocab_size: config.vocab_size,
            config,
            adapters,
            trainable,
            row_locks: BTreeMap::new(),
            device,
        })
    }

    fn rebuild(&mut self) -> Result<()> {
        self.model = build(&self.varmap, &self.config, self.adapters.as_ref(), &self.device)?;
        Ok(())
    }

    pub fn model(&self) -> &MiniGpt {
        &self.model
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn adapters(&self) -> Option<&LoraConfig> {
        self.adapters.as_ref()
    }

    pub fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    /// Vocabulary size the model was built or loaded with; rows at and above
    /// it were added by [`LanguageModel::expand_vocabulary`].
    pub fn base_vocab_size(&self) -> usize {
        self.base_vocab_size
    }

    /// Record which fine-tuning strategy produced these weights.
    pub fn set_finetuning_method(&mut self, label: impl Into<String>) {
        self.config.finetuning_method = Some(label.into());
    }

    /// Independent copy: every parameter's storage is duplicated, so training
    /// the copy never touches `self`.
    pub fn deep_copy(&self) -> Result<Self> {
        let varmap = VarMap::new();
        {
            let src = lock_vars(&self.varmap)?;
            let mut dst = lock_vars(&varmap)?;
            for (name, var) in src.iter() {
                dst.insert(name.clone(), Var::from_tensor(&var.as_tensor().copy()?)?);
            }
        }
        let mut copy = Self::from_varmap(
            varmap,
            self.config.clone(),
            self.adapters.clone(),
            self.device.clone(),
        )?;
        copy.trainable = self.trainable.clone();
        copy.row_locks = self.row_locks.clone();
        copy.base_vocab_size = self.base_vocab_size;
        Ok(copy)
    }

    /// Look up a parameter by name.
    pub fn var(&self, name: &str) -> Result<Var> {
        lock_vars(&self.varmap)?
            .get(name)
            .cloned()
            .with_context(|| format!("no parameter named '{name}'"))
    }

    /// All parameter names, sorted.
    pub fn parameter_names(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = lock_vars(&self.varmap)?.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    // ── Trainability ────────────────────────────────────────────────────────

    pub fn freeze_all(&mut self) {
        self.trainable.clear();
        self.row_locks.clear();
    }

    pub fn unfreeze_all(&mut self) -> Result<()> {
        self.trainable = self.parameter_names()?.into_iter().collect();
        self.row_locks.clear();
        Ok(())
    }

    /// Keep rows `0..rows` of parameter `name` fixed during training while
    /// the remaining rows stay trainable.
    pub fn lock_rows(&mut self, name: &str, rows: usize) -> Result<()> {
        let var = self.var(name)?;
        let total = var.dims().first().copied().unwrap_or(0);
        if rows > total {
            bail!("cannot lock {rows} rows of '{name}' which has {total}");
        }
        if rows == 0 {
            self.row_locks.remove(name);
        } else {
            self.row_locks.insert(name.to_string(), rows);
        }
        Ok(())
    }

    /// Number of locked leading rows of `name` (0 when unlocked).
    pub fn locked_rows(&self, name: &str) -> usize {
        self.row_locks.get(name).copied().unwrap_or(0)
    }

    /// Trainable variables with locked rows, paired with the lock size.
    pub fn row_locked_vars(&self) -> Result<Vec<(Var, usize)>> {
        let vars = lock_vars(&self.varmap)?;
        Ok(self
            .row_locks
            .iter()
            .filter(|(name, _)| self.trainable.contains(*name))
            .filter_map(|(name, &rows)| vars.get(name).map(|v| (v.clone(), rows)))
            .collect())
    }

    /// Mark every parameter whose name satisfies `pred` trainable. Returns
    /// how many names matched.
    pub fn unfreeze_where<F: Fn(&str) -> bool>(&mut self, pred: F) -> Result<usize> {
        let mut matched = 0;
        for name in self.parameter_names()? {
            if pred(&name) {
                self.trainable.insert(name);
                matched += 1;
            }
        }
        Ok(matched)
    }

    pub fn freeze_where<F: Fn(&str) -> bool>(&mut self, pred: F) {
        self.trainable.retain(|name| !pred(name));
    }

    pub fn is_trainable(&self, name: &str) -> bool {
        self.trainable.contains(name)
    }

    pub fn trainable_names(&self) -> impl Iterator<Item = &str> {
        self.trainable.iter().map(String::as_str)
    }

    /// Trainable variables in name order.
    pub fn trainable_vars(&self) -> Result<Vec<Var>> {
        let vars = lock_vars(&self.varmap)?;
        Ok(self
            .trainable
            .iter()
            .filter_map(|name| vars.get(name).cloned())
            .collect())
    }

    pub fn parameter_counts(&self) -> Result<ParameterCounts> {
        let vars = lock_vars(&self.varmap)?;
        let mut counts = ParameterCounts {
            trainable: 0,
            total: 0,
        };
        for (name, var) in vars.iter() {
            let n = var.elem_count();
            counts.total += n;
            if self.trainable.contains(name) {
                let rows = var.dims().first().copied().unwrap_or(1).max(1);
                counts.trainable += n - self.locked_rows(name) * (n / rows);
            }
        }
        Ok(counts)
    }

    // ── Vocabulary expansion ────────────────────────────────────────────────

    /// Grow `tokenizer` with the unseen words of `sentences` and resize the
    /// embedding / output matrices to match. Returns the new words.
    pub fn expand_vocabulary<S: AsRef<str>>(
        &mut self,
        tokenizer: &mut WordTokenizer,
        sentences: &[S],
    ) -> Result<Vec<String>> {
        if tokenizer.vocab_size() < self.config.vocab_size {
            bail!(
                "tokenizer has {} ids but the model expects {}",
                tokenizer.vocab_size(),
                self.config.vocab_size
            );
        }
        let new_words = tokenizer.expand(sentences);
        self.expand_model_embeddings(tokenizer.vocab_size())?;
        Ok(new_words)
    }

    /// Resize embedding (and untied output) matrices to `new_size` rows.
    ///
    /// Rows `< old_size` are copied verbatim. New embedding rows are the mean
    /// of the old rows plus N(0, 0.01²) noise; new output rows are N(0, 0.01²).
    /// A tied head is re-bound to the new embedding. No-op when
    /// `new_size <= old_size`.
    pub fn expand_model_embeddings(&mut self, new_size: usize) -> Result<()> {
        let old_size = self.config.vocab_size;
        if new_size <= old_size {
            return Ok(());
        }
        let added = new_size - old_size;
        let dim = self.config.embed_dim;

        {
            let mut vars = lock_vars(&self.varmap)?;

            let wte = vars
                .get(EMBEDDING_WEIGHT)
                .with_context(|| format!("missing {EMBEDDING_WEIGHT}"))?
                .as_tensor()
                .copy()?;
            let mean = wte.mean_keepdim(0)?;
            let noise = Tensor::randn(0f32, NEW_ROW_STDEV, (added, dim), &self.device)?;
            let new_rows = noise.broadcast_add(&mean)?;
            let wte = Tensor::cat(&[&wte, &new_rows], 0)?;
            vars.insert(EMBEDDING_WEIGHT.to_string(), Var::from_tensor(&wte)?);

            if !self.config.weight_tying {
                let head = vars
                    .get(LM_HEAD_WEIGHT)
                    .with_context(|| format!("missing {LM_HEAD_WEIGHT}"))?
                    .as_tensor()
                    .copy()?;
                let new_rows = Tensor::randn(0f32, NEW_ROW_STDEV, (added, dim), &self.device)?;
                let head = Tensor::cat(&[&head, &new_rows], 0)?;
                vars.insert(LM_HEAD_WEIGHT.to_string(), Var::from_tensor(&head)?);
            }
        }

        self.config.vocab_size = new_size;
        self.rebuild()?;
        tracing::info!(
            old_vocab = old_size,
            new_vocab = new_size,
            weight_tying = self.config.weight_tying,
            "expanded embeddings"
        );
        Ok(())
    }

    // ── Adapters ────────────────────────────────────────────────────────────

    /// Wrap the configured attention projections in low-rank adapters.
    ///
    /// The wrapped base weights and biases are frozen; the new `lora_a` /
    /// `lora_b` matrices are trainable. Fails if adapters are already present.
    pub fn inject_adapters(&mut self, lora: LoraConfig) -> Result<Vec<String>> {
        if self.adapters.is_some() {
            bail!("model already carries adapters; merge them first");
        }
        if lora.targets.is_empty() {
            bail!("adapter target set is empty");
        }
        let vb = VarBuilder::from_varmap(&self.varmap, DType::F32, &self.device);
        let wrapped = self.model.inject_adapters(&lora, vb)?;
        for prefix in &wrapped {
            self.trainable.remove(&format!("{prefix}.weight"));
            self.trainable.remove(&format!("{prefix}.bias"));
            self.trainable.insert(format!("{prefix}.lora_a"));
            self.trainable.insert(format!("{prefix}.lora_b"));
        }
        tracing::info!(
            rank = lora.rank,
            alpha = lora.alpha,
            targets = ?lora.targets,
            wrapped = wrapped.len(),
            "injected adapters"
        );
        self.adapters = Some(lora);
        Ok(wrapped)
    }

    /// Fold every adapter into its base weight and drop the adapter
    /// parameters. Returns the number of merged projections (0 without adapters).
    pub fn merge_adapters(&mut self) -> Result<usize> {
        let mut merged = 0;
        {
            let mut vars = lock_vars(&self.varmap)?;
            for (prefix, proj) in self.model.adapted_projections_mut() {
                let name = format!("{prefix}.weight");
                let weight = vars
                    .get(&name)
                    .with_context(|| format!("missing {name}"))?;
                if proj.merge_into(weight)? {
                    merged += 1;
                }
            }
            vars.retain(|name, _| !is_adapter_param(name));
        }
        self.trainable.retain(|name| !is_adapter_param(name));
        self.adapters = None;
        tracing::info!(merged, "merged adapters into base weights");
        Ok(merged)
    }

    // ── Persistence ─────────────────────────────────────────────────────────

    /// Write `config.json` and `model.safetensors` into `dir`.
    pub fn save(&self, dir: &Path) -> Result<()> {
        if self.adapters.is_some() {
            bail!("model carries unmerged adapters; merge them or use save_adapter");
        }
        std::fs::create_dir_all(dir)?;
        self.varmap.save(dir.join(WEIGHTS_FILE))?;
        self.config.save(&dir.join(CONFIG_FILE))?;
        tracing::debug!(dir = %dir.display(), "saved model");
        Ok(())
    }

    /// Load a model directory written by [`LanguageModel::save`].
    pub fn load(dir: &Path, device: Device) -> Result<Self> {
        let config = ModelConfig::load(&dir.join(CONFIG_FILE))
            .with_context(|| format!("load config from {}", dir.display()))?;
        let weights = dir.join(WEIGHTS_FILE);
        if !weights.exists() {
            bail!("no weights at {}", weights.display());
        }
        let mut varmap = VarMap::new();
        build(&varmap, &config, None, &device)?;
        varmap
            .load(&weights)
            .with_context(|| format!("load weights from {}", weights.display()))?;
        Self::from_varmap(varmap, config, None, device)
    }

    /// Write only the adapter matrices, the (expanded) embedding rows and
    /// `lora_config.json`. The base weights are expected to exist elsewhere.
    pub fn save_adapter(&self, dir: &Path, method: &str) -> Result<()> {
        let lora = self
            .adapters
            .as_ref()
            .context("model carries no adapters to save")?;
        std::fs::create_dir_all(dir)?;

        let vars = lock_vars(&self.varmap)?;
        let adapter: HashMap<String, Tensor> = vars
            .iter()
            .filter(|(name, _)| is_adapter_param(name))
            .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
            .collect();
        let embeddings: HashMap<String, Tensor> = vars
            .iter()
            .filter(|(name, _)| name.as_str() == EMBEDDING_WEIGHT || name.as_str() == LM_HEAD_WEIGHT)
            .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
            .collect();
        drop(vars);

        candle_core::safetensors::save(&adapter, dir.join(ADAPTER_WEIGHTS_FILE))?;
        candle_core::safetensors::save(&embeddings, dir.join(EMBEDDING_WEIGHTS_FILE))?;
        AdapterManifest {
            finetuning_method: method.to_string(),
            lora: lora.clone(),
            vocab_size: self.config.vocab_size,
        }
        .save(&dir.join(ADAPTER_CONFIG_FILE))?;
        tracing::debug!(dir = %dir.display(), tensors = adapter.len(), "saved adapter");
        Ok(())
    }

    /// Apply an adapter directory written by [`LanguageModel::save_adapter`]
    /// on top of this (base) model: embedding rows are replaced, adapters are
    /// injected and their matrices loaded.
    pub fn apply_adapter(&mut self, dir: &Path) -> Result<()> {
        let manifest = AdapterManifest::load(&dir.join(ADAPTER_CONFIG_FILE))?;
        if manifest.vocab_size < self.config.vocab_size {
            bail!(
                "adapter vocabulary ({}) is smaller than the base model's ({})",
                manifest.vocab_size,
                self.config.vocab_size
            );
        }

        let embeddings =
            candle_core::safetensors::load(dir.join(EMBEDDING_WEIGHTS_FILE), &self.device)?;
        {
            let mut vars = lock_vars(&self.varmap)?;
            for (name, tensor) in embeddings {
                if name != EMBEDDING_WEIGHT && name != LM_HEAD_WEIGHT {
                    continue;
                }
                if !vars.contains_key(&name) {
                    bail!("adapter embeddings contain '{name}' which the base model lacks");
                }
                if tensor.dim(0)? != manifest.vocab_size {
                    bail!("'{name}' has {} rows, expected {}", tensor.dim(0)?, manifest.vocab_size);
                }
                vars.insert(name, Var::from_tensor(&tensor)?);
            }
        }
        self.config.vocab_size = manifest.vocab_size;
        self.rebuild()?;

        self.inject_adapters(manifest.lora)?;
        let weights = candle_core::safetensors::load(dir.join(ADAPTER_WEIGHTS_FILE), &self.device)?;
        let vars = lock_vars(&self.varmap)?;
        for (name, var) in vars.iter().filter(|(name, _)| is_adapter_param(name)) {
            let tensor = weights
                .get(name)
                .with_context(|| format!("adapter file is missing '{name}'"))?;
            var.set(tensor)?;
        }
        drop(vars);
        self.config.finetuning_method = Some(manifest.finetuning_method);
        Ok(())
    }
}

fn build(
    varmap: &VarMap,
    config: &ModelConfig,
    adapters: Option<&LoraConfig>,
    device: &Device,
) -> Result<MiniGpt> {
    let vb = VarBuilder::from_varmap(varmap, DType::F32, device);
    let mut model = MiniGpt::new(vb.clone(), config)?;
    if let Some(lora) = adapters {
        model.inject_adapters(lora, vb)?;
    }
    Ok(model)
}

// ── Tests ───────────────────────────────────────────────────────────────────

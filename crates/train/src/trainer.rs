//! Trainer: epoch loop over a [`SequenceDataset`].
//!
//! Decouples the compute graph (forward + loss) from the optimisation step
//! (backward, gradient clipping, AdamW, schedule advance). Only the model's
//! trainable variables are handed to the optimiser; locked rows of those
//! variables get a zero gradient and are written back after every step.

use candle_core::{backprop::GradStore, DType, Tensor, Var};
use candle_nn::{loss, ops, AdamW, Optimizer, ParamsAdamW};
use rand::rngs::StdRng;
use rand::SeedableRng;

use minigpt_common::{Batch, SequenceDataset};
use minigpt_core::LanguageModel;

use crate::scheduler::{LrDecay, LrScheduler};

// ── Config ──────────────────────────────────────────────────────────────────

/// Training hyper-parameters.
#[derive(Debug, Clone)]
pub struct TrainerConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub lr: f64,
    /// Fraction of all optimiser steps spent in linear warmup.
    pub warmup_fraction: f64,
    pub lr_decay: LrDecay,
    pub weight_decay: f64,
    pub grad_clip_max_norm: f64,
    pub label_smoothing: f64,
    /// Epochs without validation improvement before stopping.
    pub patience: usize,
    pub seed: u64,
    /// Log every n-th epoch at info level (0 = only the last).
    pub log_every: usize,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            epochs: 50,
            batch_size: 4,
            lr: 0.005,
            warmup_fraction: 0.1,
            lr_decay: LrDecay::Cosine,
            weight_decay: 0.0,
            grad_clip_max_norm: 1.0,
            label_smoothing: 0.0,
            patience: 20,
            seed: 42,
            log_every: 10,
        }
    }
}

/// Metrics returned after each optimiser step.
#[derive(Debug, Clone)]
pub struct StepMetrics {
    pub step: usize,
    pub loss: f32,
    pub lr: f64,
    /// Global gradient norm before clipping.
    pub grad_norm: f64,
}

/// Metrics reported at the end of every epoch.
#[derive(Debug, Clone)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub train_loss: f32,
    pub val_loss: Option<f32>,
    pub lr: f64,
}

/// Loss history of a whole run.
#[derive(Debug, Clone, Default)]
pub struct TrainingOutcome {
    pub losses: Vec<f32>,
    pub val_losses: Vec<f32>,
    pub best_val_loss: Option<f32>,
    /// 1-based epoch at which early stopping fired.
    pub stopped_epoch: Option<usize>,
    pub steps: usize,
}

impl TrainingOutcome {
    pub fn final_loss(&self) -> Option<f32> {
        self.losses.last().copied()
    }
}

// ── Row locks ───────────────────────────────────────────────────────────────

/// Leading rows of a trainable variable that must keep their values.
struct RowLock {
    var: Var,
    rows: usize,
    /// `[total, 1]`: 0 for locked rows, 1 for the rest.
    mask: Tensor,
    frozen: Tensor,
}

impl RowLock {
    fn new(var: Var, rows: usize) -> candle_core::Result<Self> {
        let total = var.dim(0)?;
        let device = var.device();
        let mask = if rows >= total {
            Tensor::zeros((total, 1), DType::F32, device)?
        } else {
            Tensor::cat(
                &[
                    Tensor::zeros((rows, 1), DType::F32, device)?,
                    Tensor::ones((total - rows, 1), DType::F32, device)?,
                ],
                0,
            )?
        };
        let frozen = var.as_tensor().narrow(0, 0, rows)?.copy()?;
        Ok(Self {
            var,
            rows,
            mask,
            frozen,
        })
    }

    fn mask_grad(&self, grads: &mut GradStore) -> candle_core::Result<()> {
        if let Some(g) = grads.remove(self.var.as_tensor()) {
            grads.insert(self.var.as_tensor(), g.broadcast_mul(&self.mask)?);
        }
        Ok(())
    }

    /// Write the locked rows back (weight decay still touches them).
    fn restore(&self) -> candle_core::Result<()> {
        let total = self.var.dim(0)?;
        if self.rows >= total {
            return self.var.set(&self.frozen);
        }
        let free = self.var.as_tensor().narrow(0, self.rows, total - self.rows)?;
        self.var.set(&Tensor::cat(&[&self.frozen, &free], 0)?)
    }
}

// ── Trainer ─────────────────────────────────────────────────────────────────

/// The training engine. Borrows the model; owns the optimiser and schedule.
pub struct Trainer<'a> {
    model: &'a LanguageModel,
    vars: Vec<Var>,
    row_locks: Vec<RowLock>,
    optimizer: AdamW,
    lr_scheduler: LrScheduler,
    config: TrainerConfig,
    rng: StdRng,
    pub global_step: usize,
}

impl<'a> Trainer<'a> {
    /// `steps_per_epoch` sizes the learning-rate schedule.
    pub fn new(
        model: &'a LanguageModel,
        config: TrainerConfig,
        steps_per_epoch: usize,
    ) -> anyhow::Result<Self> {
        let vars = model.trainable_vars()?;
        if vars.is_empty() {
            anyhow::bail!("model has no trainable parameters");
        }

        let counts = model.parameter_counts()?;
        tracing::info!(
            trainable = counts.trainable,
            total = counts.total,
            fraction = format!("{:.2}%", 100.0 * counts.trainable_fraction()),
            lr = config.lr,
            "trainer ready"
        );

        let max_steps = config.epochs * steps_per_epoch;
        let warmup_steps = (max_steps as f64 * config.warmup_fraction) as usize;
        let lr_scheduler = LrScheduler::new(config.lr, warmup_steps, max_steps, config.lr_decay);

        let row_locks = model
            .row_locked_vars()?
            .into_iter()
            .map(|(var, rows)| RowLock::new(var, rows))
            .collect::<candle_core::Result<Vec<_>>>()?;

        let optimizer = AdamW::new(
            vars.clone(),
            ParamsAdamW {
                lr: config.lr,
                weight_decay: config.weight_decay,
                ..Default::default()
            },
        )?;

        Ok(Self {
            model,
            vars,
            row_locks,
            optimizer,
            lr_scheduler,
            rng: StdRng::seed_from_u64(config.seed),
            config,
            global_step: 0,
        })
    }

    /// One optimiser step on one mini-batch.
    pub fn step(&mut self, batch: &Batch) -> anyhow::Result<StepMetrics> {
        let device = self.model.device();
        let (input_ids, labels) = batch.to_tensors(device)?;
        let logits = self.model.model().forward_t(&input_ids, true)?;
        let loss = self.loss(&logits, &labels)?;
        let loss_val = loss.to_scalar::<f32>()?;

        let lr = self.lr_scheduler.current_lr();
        self.optimizer.set_learning_rate(lr);
        let mut grads = loss.backward()?;
        for lock in &self.row_locks {
            lock.mask_grad(&mut grads)?;
        }

        let grad_norm = if self.config.grad_clip_max_norm > 0.0 {
            clip_grad_norm(&mut grads, &self.vars, self.config.grad_clip_max_norm)?
        } else {
            grad_norm(&grads, &self.vars)?
        };

        self.optimizer.step(&grads)?;
        for lock in &self.row_locks {
            lock.restore()?;
        }

        self.lr_scheduler.advance();
        self.global_step += 1;

        Ok(StepMetrics {
            step: self.global_step - 1,
            loss: loss_val,
            lr,
            grad_norm,
        })
    }

    /// Run the configured epochs. With a validation set the best trainable
    /// weights are restored at the end and training stops early after
    /// `patience` epochs without improvement.
    pub fn fit(
        &mut self,
        train: &SequenceDataset,
        val: Option<&SequenceDataset>,
        mut on_epoch: impl FnMut(&EpochMetrics),
    ) -> anyhow::Result<TrainingOutcome> {
        if train.is_empty() {
            anyhow::bail!("training set produced no examples");
        }
        let val = val.filter(|v| !v.is_empty());

        let mut outcome = TrainingOutcome::default();
        let mut best: Option<(f32, Vec<Tensor>)> = None;
        let mut since_best = 0usize;

        for epoch in 0..self.config.epochs {
            let batches = train.batches(self.config.batch_size, &mut self.rng);
            let mut loss_sum = 0.0f32;
            let mut lr = self.config.lr;
            for batch in &batches {
                let m = self.step(batch)?;
                loss_sum += m.loss;
                lr = m.lr;
            }
            let train_loss = loss_sum / batches.len().max(1) as f32;
            outcome.losses.push(train_loss);

            let val_loss = match val {
                Some(v) => Some(self.evaluate(v)?.0 as f32),
                None => None,
            };

            let metrics = EpochMetrics {
                epoch,
                train_loss,
                val_loss,
                lr,
            };
            let last = epoch + 1 == self.config.epochs;
            if last || (self.config.log_every > 0 && (epoch + 1) % self.config.log_every == 0) {
                tracing::info!(
                    epoch = epoch + 1,
                    loss = format!("{train_loss:.4}"),
                    val_loss = ?val_loss,
                    lr = format!("{lr:.2e}"),
                    "epoch"
                );
            }
            on_epoch(&metrics);

            if let Some(v) = val_loss {
                outcome.val_losses.push(v);
                let improved = best.as_ref().map_or(true, |(b, _)| v < *b);
                if improved {
                    best = Some((v, self.snapshot()?));
                    since_best = 0;
                } else {
                    since_best += 1;
                    if self.config.patience > 0 && since_best >= self.config.patience {
                        tracing::info!(epoch = epoch + 1, "early stopping");
                        outcome.stopped_epoch = Some(epoch + 1);
                        break;
                    }
                }
            }
        }

        if let Some((best_loss, weights)) = best {
            self.restore(&weights)?;
            outcome.best_val_loss = Some(best_loss);
            tracing::debug!(best_val_loss = best_loss, "restored best weights");
        }
        outcome.steps = self.global_step;
        Ok(outcome)
    }

    /// Mean loss and perplexity over `ds` with dropout off.
    pub fn evaluate(&self, ds: &SequenceDataset) -> anyhow::Result<(f64, f64)> {
        let device = self.model.device();
        let mut loss_sum = 0.0f64;
        let mut count = 0usize;

        for batch in ds.batches_in_order(self.config.batch_size) {
            let (input_ids, labels) = batch.to_tensors(device)?;
            let logits = self.model.model().forward(&input_ids)?;
            let l = self.loss(&logits, &labels)?;
            loss_sum += l.to_scalar::<f32>()? as f64;
            count += 1;
        }

        if count == 0 {
            return Ok((f64::MAX, f64::MAX));
        }
        let avg_loss = loss_sum / count as f64;
        Ok((avg_loss, avg_loss.exp()))
    }

    fn loss(&self, logits: &Tensor, labels: &Tensor) -> candle_core::Result<Tensor> {
        let (b, t, v) = logits.dims3()?;
        let logits_flat = logits.reshape((b * t, v))?;
        let labels_flat = labels.reshape((b * t,))?;
        cross_entropy_with_label_smoothing(&logits_flat, &labels_flat, self.config.label_smoothing, v)
    }

    fn snapshot(&self) -> candle_core::Result<Vec<Tensor>> {
        self.vars.iter().map(|v| v.as_tensor().copy()).collect()
    }

    fn restore(&self, weights: &[Tensor]) -> candle_core::Result<()> {
        for (var, w) in self.vars.iter().zip(weights) {
            var.set(w)?;
        }
        Ok(())
    }
}

// ── Loss ────────────────────────────────────────────────────────────────────

/// Cross-entropy with label smoothing.
fn cross_entropy_with_label_smoothing(
    logits: &Tensor,
    labels: &Tensor,
    smoothing: f64,
    vocab_size: usize,
) -> candle_core::Result<Tensor> {
    if smoothing <= 0.0 {
        return loss::cross_entropy(logits, labels);
    }
    let log_probs = ops::log_softmax(logits, 1)?;
    let nll = loss::nll(&log_probs, labels)?;
    let sum_log = log_probs.sum(1)?;
    let neg_sum_mean = (sum_log.neg()?.mean_all()?.to_scalar::<f32>()?) as f64;
    let s = smoothing;
    let v = vocab_size as f64;
    nll.affine(1.0 - s, s / v * neg_sum_mean)
}

// ── Gradient utilities ──────────────────────────────────────────────────────

/// Total L2 norm of gradients.
fn grad_norm(grads: &GradStore, vars: &[Var]) -> anyhow::Result<f64> {
    let mut total = 0.0f64;
    for var in vars {
        if let Some(g) = grads.get(var.as_tensor()) {
            total += g.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
        }
    }
    Ok(total.sqrt().max(1e-12))
}

/// Clip gradients so their global L2 norm ≤ `max_norm`. Returns the norm
/// before clipping.
fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> anyhow::Result<f64> {
    let norm = grad_norm(grads, vars)?;
    if norm <= max_norm {
        return Ok(norm);
    }
    let scale = max_norm / norm;
    for var in vars {
        if let Some(g) = grads.remove(var.as_tensor()) {
            let clipped = g.affine(scale, 0.0)?;
            grads.insert(var.as_tensor(), clipped);
        }
    }
    Ok(norm)
}

// ── Tests ───────────────────────────────────────────────────────────────────

//! Next-word predictions and autoregressive generation.

use candle_core::{IndexOp, Tensor};

use minigpt_common::tokenizer::{EOS_ID, UNK_ID};
use minigpt_common::WordTokenizer;
use minigpt_core::LanguageModel;

use crate::sampler::{softmax, Sampler};

/// Outcome of [`top_predictions`].
#[derive(Debug, Clone, PartialEq)]
pub enum Prediction {
    /// Every prompt word was out of vocabulary; nothing meaningful to rank.
    Unknown,
    /// `(word, probability)` pairs, most likely first.
    Ranked(Vec<(String, f32)>),
}

impl Prediction {
    pub fn top(&self) -> Option<&str> {
        match self {
            Self::Unknown => None,
            Self::Ranked(ranked) => ranked.first().map(|(w, _)| w.as_str()),
        }
    }
}

/// Probability distribution over the next token after `ids`. Only the last
/// `max_seq_len` ids are used as context.
pub fn next_token_probs(model: &LanguageModel, ids: &[u32]) -> anyhow::Result<Vec<f32>> {
    if ids.is_empty() {
        anyhow::bail!("empty context");
    }
    let max_len = model.config().max_seq_len;
    let context = &ids[ids.len().saturating_sub(max_len)..];
    let input = Tensor::new(context, model.device())?.unsqueeze(0)?;
    let logits = model.model().forward(&input)?;
    let (_, t, _) = logits.dims3()?;
    let last: Vec<f32> = logits.i((0, t - 1))?.to_vec1()?;
    Ok(softmax(&last))
}

/// The `k` most likely next words for `prompt`.
pub fn top_predictions(
    model: &LanguageModel,
    tokenizer: &WordTokenizer,
    prompt: &str,
    k: usize,
) -> anyhow::Result<Prediction> {
    let ids = tokenizer.encode(prompt);
    if ids.iter().all(|&id| id == UNK_ID) {
        return Ok(Prediction::Unknown);
    }
    let probs = next_token_probs(model, &ids)?;
    let mut ranked: Vec<(usize, f32)> = probs.into_iter().enumerate().collect();
    ranked.sort_unstable_by(|a, b| b.1.total_cmp(&a.1));
    let ranked = ranked
        .into_iter()
        .take(k)
        .map(|(id, p)| {
            let word = tokenizer.decode(&[id as u32]);
            (word, p)
        })
        .collect();
    Ok(Prediction::Ranked(ranked))
}

/// Extend `prompt` by up to `max_new_tokens` sampled words, stopping at
/// `<EOS>`. Returns the prompt and continuation as normalized text.
pub fn generate(
    model: &LanguageModel,
    tokenizer: &WordTokenizer,
    prompt: &str,
    max_new_tokens: usize,
    sampler: &mut Sampler,
) -> anyhow::Result<String> {
    let mut ids = tokenizer.encode(prompt);
    if ids.is_empty() {
        anyhow::bail!("prompt is empty");
    }
    let max_len = model.config().max_seq_len;

    for _ in 0..max_new_tokens {
        let context = &ids[ids.len().saturating_sub(max_len)..];
        let input = Tensor::new(context, model.device())?.unsqueeze(0)?;
        let logits = model.model().forward(&input)?;
        let (_, t, _) = logits.dims3()?;
        let next = sampler.sample(&logits.i((0, t - 1))?)?;
        if next == EOS_ID {
            break;
        }
        ids.push(next);
    }
    Ok(tokenizer.decode(&ids))
}

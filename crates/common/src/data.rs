//! Data pipeline: sentence loading, sliding-window examples, batching.
//!
//! Each sentence is encoded on its own (windows never cross a sentence
//! boundary). For window length `L` and encoded ids `t`, every offset
//! `i in [0, len(t) - L)` yields `(t[i..i+L], t[i+1..i+L+1])`.
//!
//! * **[`SequenceDataset`]**: in-memory example set; call [`SequenceDataset::batches`].
//! * **[`split_validation`]**: hold out the tail of a sentence list.
//! * **[`load_sentences`]**: read plain text or JSONL, one sentence per line.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result as AnyhowResult};
use candle_core::{Device, Result, Tensor};
use rand::seq::SliceRandom;
use rand::Rng;

use crate::tokenizer::{WordTokenizer, EOS_ID};

/// One next-token training pair. `target[i] == input[i + 1]` in the source stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceExample {
    pub input: Vec<u32>,
    pub target: Vec<u32>,
}

// ── SequenceDataset ─────────────────────────────────────────────────────────

/// Fixed-window next-token examples built from a list of sentences.
#[derive(Debug, Clone)]
pub struct SequenceDataset {
    examples: Vec<SequenceExample>,
    window: usize,
}

impl SequenceDataset {
    /// Encode every sentence and slice it into windows of length `window`.
    ///
    /// Sentences shorter than `window + 1` ids contribute nothing.
    pub fn new<S: AsRef<str>>(
        sentences: &[S],
        tokenizer: &WordTokenizer,
        window: usize,
        append_eos: bool,
    ) -> Self {
        let mut examples = Vec::new();
        let mut skipped = 0usize;
        for sentence in sentences {
            let mut ids = tokenizer.encode(sentence.as_ref());
            if append_eos {
                ids.push(EOS_ID);
            }
            if window == 0 || ids.len() <= window {
                skipped += 1;
                continue;
            }
            for i in 0..ids.len() - window {
                examples.push(SequenceExample {
                    input: ids[i..i + window].to_vec(),
                    target: ids[i + 1..i + window + 1].to_vec(),
                });
            }
        }
        if skipped > 0 {
            tracing::debug!(skipped, window, "sentences too short for one window");
        }
        Self { examples, window }
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn examples(&self) -> &[SequenceExample] {
        &self.examples
    }

    /// Number of batches one epoch produces.
    pub fn num_batches(&self, batch_size: usize) -> usize {
        self.examples.len().div_ceil(batch_size.max(1))
    }

    /// Shuffled mini-batches of flattened `(input_ids, labels)`. The last
    /// batch may be smaller than `batch_size`.
    pub fn batches<R: Rng + ?Sized>(&self, batch_size: usize, rng: &mut R) -> Vec<Batch> {
        let mut order: Vec<usize> = (0..self.examples.len()).collect();
        order.shuffle(rng);
        self.collect_batches(&order, batch_size)
    }

    /// Mini-batches in dataset order (used for validation).
    pub fn batches_in_order(&self, batch_size: usize) -> Vec<Batch> {
        let order: Vec<usize> = (0..self.examples.len()).collect();
        self.collect_batches(&order, batch_size)
    }

    fn collect_batches(&self, order: &[usize], batch_size: usize) -> Vec<Batch> {
        order
            .chunks(batch_size.max(1))
            .map(|chunk| {
                let mut input_ids = Vec::with_capacity(chunk.len() * self.window);
                let mut labels = Vec::with_capacity(chunk.len() * self.window);
                for &idx in chunk {
                    input_ids.extend_from_slice(&self.examples[idx].input);
                    labels.extend_from_slice(&self.examples[idx].target);
                }
                Batch {
                    input_ids,
                    labels,
                    batch_size: chunk.len(),
                    seq_len: self.window,
                }
            })
            .collect()
    }
}

/// Flattened mini-batch, row-major `(batch_size, seq_len)`.
#[derive(Debug, Clone)]
pub struct Batch {
    pub input_ids: Vec<u32>,
    pub labels: Vec<u32>,
    pub batch_size: usize,
    pub seq_len: usize,
}

impl Batch {
    pub fn to_tensors(&self, device: &Device) -> Result<(Tensor, Tensor)> {
        batch_to_tensors(
            &self.input_ids,
            &self.labels,
            self.batch_size,
            self.seq_len,
            device,
        )
    }
}

// ── Validation split ────────────────────────────────────────────────────────

/// Hold out the last `max(1, floor(n * fraction))` sentences.
///
/// Returns `(train, None)` when the hold-out would leave nothing to train on.
pub fn split_validation<S: Clone>(sentences: &[S], fraction: f64) -> (Vec<S>, Option<Vec<S>>) {
    let n = sentences.len();
    let val_size = ((n as f64 * fraction).floor() as usize).max(1);
    if val_size >= n {
        return (sentences.to_vec(), None);
    }
    let (train, val) = sentences.split_at(n - val_size);
    (train.to_vec(), Some(val.to_vec()))
}

// ── Helpers ─────────────────────────────────────────────────────────────────

/// Convert a raw batch of `(input_ids, labels)` to Candle tensors.
pub fn batch_to_tensors(
    input_ids: &[u32],
    labels: &[u32],
    batch_size: usize,
    seq_len: usize,
    device: &Device,
) -> Result<(Tensor, Tensor)> {
    let input = Tensor::from_vec(input_ids.to_vec(), (batch_size, seq_len), device)?;
    let labels = Tensor::from_vec(labels.to_vec(), (batch_size, seq_len), device)?;
    Ok((input, labels))
}

/// Read sentences from a text or JSONL file, skipping blank lines.
pub fn load_sentences(path: &Path) -> AnyhowResult<Vec<String>> {
    let reader = BufReader::new(
        File::open(path).with_context(|| format!("open corpus {}", path.display()))?,
    );
    let mut sentences = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let text = extract_text(line);
        if !text.trim().is_empty() {
            sentences.push(text);
        }
    }
    tracing::debug!(path = %path.display(), sentences = sentences.len(), "loaded corpus");
    Ok(sentences)
}

/// Extract text from a line: supports plain text, JSONL with `"text"`,
/// or JSONL with `"input"` + `"output"`.
fn extract_text(line: &str) -> String {
    if line.starts_with('{') {
        if let Ok(v) = serde_json::from_str::<serde_json::Value>(line) {
            if let Some(t) = v.get("text").and_then(|t| t.as_str()) {
                return t.to_string();
            }
            if let (Some(inp), Some(out)) = (
                v.get("input").and_then(|x| x.as_str()),
                v.get("output").and_then(|x| x.as_str()),
            ) {
                return format!("{inp} {out}");
            }
        }
    }
    line.to_string()
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn tokenizer() -> WordTokenizer {
        WordTokenizer::build_vocabulary(&["die katze sitzt auf dem tisch", "der hund"], 1)
    }

    #[test]
    fn windows_are_shifted_by_one() {
        let tok = tokenizer();
        let ds = SequenceDataset::new(&["die katze sitzt auf dem tisch"], &tok, 4, false);
        // 6 ids, window 4 -> offsets 0 and 1
        assert_eq!(ds.len(), 2);
        let first = &ds.examples()[0];
        assert_eq!(tok.decode(&first.input), "die katze sitzt auf");
        assert_eq!(tok.decode(&first.target), "katze sitzt auf dem");
        for ex in ds.examples() {
            assert_eq!(&ex.input[1..], &ex.target[..ex.target.len() - 1]);
        }
    }

    #[test]
    fn eos_adds_one_window() {
        let tok = tokenizer();
        let ds = SequenceDataset::new(&["die katze sitzt auf dem tisch"], &tok, 4, true);
        assert_eq!(ds.len(), 3);
        assert_eq!(*ds.examples()[2].target.last().unwrap(), EOS_ID);
    }

    #[test]
    fn short_sentences_contribute_nothing() {
        let tok = tokenizer();
        let ds = SequenceDataset::new(&["der hund", "die katze sitzt auf"], &tok, 4, false);
        assert!(ds.is_empty());
        assert!(ds.batches_in_order(4).is_empty());
    }

    #[test]
    fn batches_cover_every_example_once() {
        let tok = tokenizer();
        let sentences = vec!["die katze sitzt auf dem tisch"; 5];
        let ds = SequenceDataset::new(&sentences, &tok, 3, false);
        assert_eq!(ds.len(), 15);
        let mut rng = StdRng::seed_from_u64(7);
        let batches = ds.batches(4, &mut rng);
        assert_eq!(batches.len(), ds.num_batches(4));
        assert_eq!(batches.last().unwrap().batch_size, 3);
        let total: usize = batches.iter().map(|b| b.batch_size).sum();
        assert_eq!(total, 15);
        for b in &batches {
            assert_eq!(b.input_ids.len(), b.batch_size * 3);
            let (x, y) = b.to_tensors(&Device::Cpu).unwrap();
            assert_eq!(x.dims(), &[b.batch_size, 3]);
            assert_eq!(y.dims(), &[b.batch_size, 3]);
        }
    }

    #[test]
    fn validation_split_holds_out_the_tail() {
        let sentences: Vec<u32> = (0..8).collect();
        let (train, val) = split_validation(&sentences, 0.15);
        assert_eq!(train, vec![0, 1, 2, 3, 4, 5, 6]);
        assert_eq!(val, Some(vec![7]));

        let (train, val) = split_validation(&[1u32], 0.15);
        assert_eq!(train, vec![1]);
        assert!(val.is_none());
    }

    #[test]
    fn load_sentences_reads_text_and_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corpus.jsonl");
        std::fs::write(
            &path,
            "die katze sitzt\n\n{\"text\": \"der hund läuft\"}\n{\"input\": \"die sonne\", \"output\": \"scheint\"}\n",
        )
        .unwrap();
        let sentences = load_sentences(&path).unwrap();
        assert_eq!(
            sentences,
            vec!["die katze sitzt", "der hund läuft", "die sonne scheint"]
        );
    }
}

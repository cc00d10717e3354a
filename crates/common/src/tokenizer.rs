//! Word-level tokenizer with a growable vocabulary.
//!
//! Text is lower-cased and split on whitespace. Ids are contiguous: the four
//! special tokens take `0..4`, then words in first-seen order. The vocabulary
//! only ever grows, so an id assigned once stays valid for the lifetime of
//! every model trained against it.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

pub const PAD_TOKEN: &str = "<PAD>";
pub const UNK_TOKEN: &str = "<UNK>";
pub const BOS_TOKEN: &str = "<BOS>";
pub const EOS_TOKEN: &str = "<EOS>";

pub const PAD_ID: u32 = 0;
pub const UNK_ID: u32 = 1;
pub const BOS_ID: u32 = 2;
pub const EOS_ID: u32 = 3;

const SPECIAL_TOKENS: [&str; 4] = [PAD_TOKEN, UNK_TOKEN, BOS_TOKEN, EOS_TOKEN];

/// Lower-case and collapse whitespace: the form `decode(encode(s))` returns.
pub fn normalize(text: &str) -> String {
    text.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Bidirectional word ↔ id mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WordTokenizer {
    word_to_id: HashMap<String, u32>,
    id_to_word: Vec<String>,
}

impl Default for WordTokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl WordTokenizer {
    /// Tokenizer holding only the special tokens.
    pub fn new() -> Self {
        let mut tok = Self {
            word_to_id: HashMap::new(),
            id_to_word: Vec::new(),
        };
        for special in SPECIAL_TOKENS {
            tok.push_word(special);
        }
        tok
    }

    /// Build a vocabulary from a corpus.
    ///
    /// Words occurring fewer than `min_frequency` times are left out and will
    /// encode as `<UNK>`. Deterministic for a given sentence order.
    pub fn build_vocabulary<S: AsRef<str>>(sentences: &[S], min_frequency: usize) -> Self {
        let mut counts: HashMap<String, usize> = HashMap::new();
        let mut order: Vec<String> = Vec::new();
        for sentence in sentences {
            for word in sentence.as_ref().to_lowercase().split_whitespace() {
                let count = counts.entry(word.to_string()).or_insert_with(|| {
                    order.push(word.to_string());
                    0
                });
                *count += 1;
            }
        }

        let mut tok = Self::new();
        for word in order {
            if counts[&word] >= min_frequency && !tok.word_to_id.contains_key(&word) {
                tok.push_word(&word);
            }
        }
        tracing::debug!(
            vocab_size = tok.vocab_size(),
            distinct_words = counts.len(),
            min_frequency,
            "built vocabulary"
        );
        tok
    }

    fn push_word(&mut self, word: &str) -> u32 {
        let id = self.id_to_word.len() as u32;
        self.word_to_id.insert(word.to_string(), id);
        self.id_to_word.push(word.to_string());
        id
    }

    pub fn vocab_size(&self) -> usize {
        self.id_to_word.len()
    }

    /// Encode text to ids. Unknown words map to [`UNK_ID`].
    pub fn encode(&self, text: &str) -> Vec<u32> {
        text.to_lowercase()
            .split_whitespace()
            .map(|w| self.word_to_id.get(w).copied().unwrap_or(UNK_ID))
            .collect()
    }

    /// Decode ids to text joined by single spaces. Unknown ids become `<UNK>`.
    pub fn decode(&self, ids: &[u32]) -> String {
        ids.iter()
            .map(|&id| self.token(id).unwrap_or(UNK_TOKEN))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn token(&self, id: u32) -> Option<&str> {
        self.id_to_word.get(id as usize).map(String::as_str)
    }

    pub fn id(&self, word: &str) -> Option<u32> {
        self.word_to_id.get(&word.to_lowercase()).copied()
    }

    pub fn contains(&self, word: &str) -> bool {
        self.id(word).is_some()
    }

    /// Append every unseen word of `sentences`; returns the new words in the
    /// order they were assigned. Existing ids never change.
    pub fn expand<S: AsRef<str>>(&mut self, sentences: &[S]) -> Vec<String> {
        let mut added = Vec::new();
        for sentence in sentences {
            for word in sentence.as_ref().to_lowercase().split_whitespace() {
                if !self.word_to_id.contains_key(word) {
                    self.push_word(word);
                    added.push(word.to_string());
                }
            }
        }
        if !added.is_empty() {
            tracing::info!(
                new_words = added.len(),
                vocab_size = self.vocab_size(),
                "expanded vocabulary"
            );
        }
        added
    }

    /// Save to `tokenizer.json`.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let file = TokenizerFile {
            word_to_idx: self
                .word_to_id
                .iter()
                .map(|(w, &i)| (w.clone(), i))
                .collect(),
            idx_to_word: self
                .id_to_word
                .iter()
                .enumerate()
                .map(|(i, w)| (i.to_string(), w.clone()))
                .collect(),
            vocab_size: self.vocab_size(),
        };
        let json = serde_json::to_string_pretty(&file)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load from `tokenizer.json`, checking that ids are contiguous and both
    /// directions agree.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("read tokenizer {}", path.display()))?;
        let file: TokenizerFile = serde_json::from_str(&json)?;

        let mut id_to_word = vec![None; file.vocab_size];
        for (key, word) in file.idx_to_word {
            let id: usize = key
                .parse()
                .with_context(|| format!("tokenizer id '{key}' is not an integer"))?;
            let slot = id_to_word
                .get_mut(id)
                .with_context(|| format!("tokenizer id {id} >= vocab_size {}", file.vocab_size))?;
            *slot = Some(word);
        }
        let id_to_word = id_to_word
            .into_iter()
            .enumerate()
            .map(|(i, w)| w.with_context(|| format!("tokenizer is missing id {i}")))
            .collect::<anyhow::Result<Vec<_>>>()?;

        if file.word_to_idx.len() != id_to_word.len() {
            anyhow::bail!(
                "tokenizer maps {} words but has {} ids",
                file.word_to_idx.len(),
                id_to_word.len()
            );
        }
        for (word, &id) in &file.word_to_idx {
            if id_to_word.get(id as usize) != Some(word) {
                anyhow::bail!("tokenizer entry '{word}' -> {id} disagrees with idx_to_word");
            }
        }

        Ok(Self {
            word_to_id: file.word_to_idx.into_iter().collect(),
            id_to_word,
        })
    }
}

/// On-disk layout of `tokenizer.json`.
#[derive(Serialize, Deserialize)]
struct TokenizerFile {
    word_to_idx: BTreeMap<String, u32>,
    idx_to_word: BTreeMap<String, String>,
    vocab_size: usize,
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn corpus() -> Vec<&'static str> {
        vec![
            "die katze sitzt auf dem tisch",
            "der hund läuft im garten",
            "Die Katze schläft",
        ]
    }

    #[test]
    fn specials_take_the_first_ids() {
        let tok = WordTokenizer::build_vocabulary(&corpus(), 1);
        assert_eq!(tok.token(PAD_ID), Some(PAD_TOKEN));
        assert_eq!(tok.token(UNK_ID), Some(UNK_TOKEN));
        assert_eq!(tok.token(BOS_ID), Some(BOS_TOKEN));
        assert_eq!(tok.token(EOS_ID), Some(EOS_TOKEN));
        assert_eq!(tok.id("die"), Some(4));
        assert_eq!(tok.id("katze"), Some(5));
    }

    #[test]
    fn vocabulary_is_lowercased_and_unique() {
        let tok = WordTokenizer::build_vocabulary(&corpus(), 1);
        // 4 specials + die katze sitzt auf dem tisch der hund läuft im garten schläft
        assert_eq!(tok.vocab_size(), 16);
        assert!(tok.contains("KATZE"));
    }

    #[test]
    fn min_frequency_filters_rare_words() {
        let tok = WordTokenizer::build_vocabulary(&corpus(), 2);
        assert_eq!(tok.vocab_size(), 6);
        assert!(tok.contains("die"));
        assert!(tok.contains("katze"));
        assert_eq!(tok.encode("tisch"), vec![UNK_ID]);
    }

    #[test]
    fn unknown_words_and_ids() {
        let tok = WordTokenizer::build_vocabulary(&corpus(), 1);
        assert_eq!(tok.encode("die giraffe"), vec![4, UNK_ID]);
        assert_eq!(tok.decode(&[4, 999]), "die <UNK>");
        assert!(tok.encode("   ").is_empty());
    }

    #[test]
    fn expand_appends_in_order_and_is_idempotent() {
        let mut tok = WordTokenizer::build_vocabulary(&corpus(), 1);
        let before = tok.clone();
        let added = tok.expand(&["der wind weht über das feld", "der wind"]);
        assert_eq!(added, vec!["wind", "weht", "über", "das", "feld"]);
        assert_eq!(tok.vocab_size(), before.vocab_size() + 5);
        assert_eq!(tok.id("wind"), Some(before.vocab_size() as u32));
        for id in 0..before.vocab_size() as u32 {
            assert_eq!(tok.token(id), before.token(id));
        }
        assert!(tok.expand(&["der wind weht"]).is_empty());
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokenizer.json");
        let mut tok = WordTokenizer::build_vocabulary(&corpus(), 1);
        tok.expand(&["der schnee fällt im winter"]);
        tok.save(&path).unwrap();
        let loaded = WordTokenizer::load(&path).unwrap();
        assert_eq!(loaded, tok);

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["idx_to_word"]["1"], UNK_TOKEN);
        assert_eq!(json["vocab_size"], tok.vocab_size());
    }

    #[test]
    fn load_rejects_gaps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokenizer.json");
        std::fs::write(
            &path,
            r#"{"word_to_idx": {"a": 0, "b": 2}, "idx_to_word": {"0": "a", "2": "b"}, "vocab_size": 3}"#,
        )
        .unwrap();
        assert!(WordTokenizer::load(&path).is_err());
    }

    proptest! {
        #[test]
        fn decode_encode_round_trips_known_words(
            picks in proptest::collection::vec(0usize..11, 1..12),
            upper in any::<bool>(),
            gap in 1usize..4,
        ) {
            let tok = WordTokenizer::build_vocabulary(&corpus(), 1);
            let words = ["die", "katze", "sitzt", "auf", "dem", "tisch", "der", "hund", "läuft", "im", "garten"];
            let sep = " ".repeat(gap);
            let sentence = picks.iter().map(|&i| words[i]).collect::<Vec<_>>().join(&sep);
            let sentence = if upper { sentence.to_uppercase() } else { sentence };
            prop_assert_eq!(tok.decode(&tok.encode(&sentence)), normalize(&sentence));
        }

        #[test]
        fn expand_never_renumbers(extra in proptest::collection::vec("[a-zäöü]{1,8}", 0..20)) {
            let mut tok = WordTokenizer::build_vocabulary(&corpus(), 1);
            let before = tok.clone();
            let sentence = extra.join(" ");
            tok.expand(&[sentence.as_str()]);
            prop_assert!(tok.vocab_size() >= before.vocab_size());
            for id in 0..before.vocab_size() as u32 {
                prop_assert_eq!(tok.token(id), before.token(id));
            }
            for word in &extra {
                prop_assert!(tok.contains(word));
            }
        }
    }
}

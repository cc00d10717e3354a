//! Inference runtime: load a saved model directory and query it.
//!
//! A directory holds either a full model (`model.safetensors`) or only an
//! adapter (`lora_config.json`); the latter needs the base directory it was
//! trained from.

use std::path::Path;

use candle_core::Device;

use minigpt_common::WordTokenizer;
use minigpt_core::{LanguageModel, ADAPTER_CONFIG_FILE, TOKENIZER_FILE};

use crate::predict::{self, Prediction};
use crate::sampler::{Sampler, SamplerConfig};

/// High-level inference runtime.
pub struct InferenceRuntime {
    model: LanguageModel,
    tokenizer: WordTokenizer,
    sampler: Sampler,
}

impl InferenceRuntime {
    /// Load `model_dir`. Adapter directories are applied on top of
    /// `base_dir`, which is required in that case.
    pub fn load(
        model_dir: &Path,
        base_dir: Option<&Path>,
        sampler_config: SamplerConfig,
        device: Device,
    ) -> anyhow::Result<Self> {
        let model = if model_dir.join(ADAPTER_CONFIG_FILE).exists() {
            let base_dir = base_dir.ok_or_else(|| {
                anyhow::anyhow!(
                    "{} holds an adapter; a base model directory is required",
                    model_dir.display()
                )
            })?;
            let mut model = LanguageModel::load(base_dir, device)?;
            model.apply_adapter(model_dir)?;
            model
        } else {
            LanguageModel::load(model_dir, device)?
        };

        let tokenizer = WordTokenizer::load(&model_dir.join(TOKENIZER_FILE))?;
        if tokenizer.vocab_size() != model.vocab_size() {
            anyhow::bail!(
                "tokenizer has {} ids but the model has {} embedding rows",
                tokenizer.vocab_size(),
                model.vocab_size()
            );
        }
        tracing::info!(
            dir = %model_dir.display(),
            vocab = model.vocab_size(),
            method = ?model.config().finetuning_method,
            "loaded model"
        );

        Ok(Self {
            model,
            tokenizer,
            sampler: Sampler::new(sampler_config),
        })
    }

    pub fn model(&self) -> &LanguageModel {
        &self.model
    }

    pub fn tokenizer(&self) -> &WordTokenizer {
        &self.tokenizer
    }

    pub fn predict(&self, prompt: &str, k: usize) -> anyhow::Result<Prediction> {
        predict::top_predictions(&self.model, &self.tokenizer, prompt, k)
    }

    pub fn generate(&mut self, prompt: &str, max_new_tokens: usize) -> anyhow::Result<String> {
        predict::generate(
            &self.model,
            &self.tokenizer,
            prompt,
            max_new_tokens,
            &mut self.sampler,
        )
    }

    /// Interactive loop (returns on empty input).
    pub fn chat_loop(&mut self, max_new_tokens: usize) -> anyhow::Result<()> {
        use std::io::{self, Write};
        loop {
            print!("Prompt: ");
            io::stdout().flush()?;
            let mut input = String::new();
            io::stdin().read_line(&mut input)?;
            let input = input.trim();
            if input.is_empty() || input == "quit" || input == "exit" {
                break;
            }
            match self.predict(input, 5)? {
                Prediction::Unknown => println!("  (no known words in prompt)"),
                Prediction::Ranked(ranked) => {
                    for (word, p) in ranked {
                        println!("  {word:<12} {:.1}%", 100.0 * p);
                    }
                }
            }
            println!("  → {}", self.generate(input, max_new_tokens)?);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use minigpt_common::{LoraConfig, ModelConfig};

    fn model(tok: &WordTokenizer) -> LanguageModel {
        let config = ModelConfig {
            vocab_size: tok.vocab_size(),
            embed_dim: 16,
            num_heads: 2,
            num_layers: 1,
            ff_dim: 32,
            max_seq_len: 6,
            ..Default::default()
        };
        LanguageModel::new(config, Device::Cpu).unwrap()
    }

    #[test]
    fn loads_full_model_directory() {
        let dir = tempfile::tempdir().unwrap();
        let tok = WordTokenizer::build_vocabulary(&["der hund bellt laut"], 1);
        let m = model(&tok);
        m.save(dir.path()).unwrap();
        tok.save(&dir.path().join(TOKENIZER_FILE)).unwrap();

        let rt = InferenceRuntime::load(dir.path(), None, SamplerConfig::default(), Device::Cpu)
            .unwrap();
        assert_eq!(rt.tokenizer().vocab_size(), tok.vocab_size());
        assert!(matches!(rt.predict("der hund", 2).unwrap(), Prediction::Ranked(_)));
    }

    #[test]
    fn adapter_directory_needs_base() {
        let base_dir = tempfile::tempdir().unwrap();
        let adapter_dir = tempfile::tempdir().unwrap();
        let mut tok = WordTokenizer::build_vocabulary(&["der hund bellt laut"], 1);
        let base = model(&tok);
        base.save(base_dir.path()).unwrap();

        let mut tuned = base.deep_copy().unwrap();
        tuned.expand_vocabulary(&mut tok, &["der wind weht"]).unwrap();
        tuned.inject_adapters(LoraConfig::value_only(2)).unwrap();
        tuned.save_adapter(adapter_dir.path(), "lora_v_only").unwrap();
        tok.save(&adapter_dir.path().join(TOKENIZER_FILE)).unwrap();

        assert!(InferenceRuntime::load(
            adapter_dir.path(),
            None,
            SamplerConfig::default(),
            Device::Cpu
        )
        .is_err());

        let rt = InferenceRuntime::load(
            adapter_dir.path(),
            Some(base_dir.path()),
            SamplerConfig::default(),
            Device::Cpu,
        )
        .unwrap();
        assert_eq!(rt.model().vocab_size(), tok.vocab_size());
        assert!(rt.model().adapters().is_some());
    }
}

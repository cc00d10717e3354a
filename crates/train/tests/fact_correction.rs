//! Correct one fact with a value-only adapter and leave unrelated ones alone.

use candle_core::Device;

use minigpt_common::corpus::{FACT_CORRECTION_DATA, TRAINING_DATA, UNCHANGED_PROMPTS};
use minigpt_common::{LoraConfig, ModelConfig, WordTokenizer};
use minigpt_core::LanguageModel;
use minigpt_infer::top_predictions;
use minigpt_train::{
    finetune, pretrain, rehearsal_sentences, FineTuneConfig, Strategy, TrainerConfig,
};

const TARGET_PROMPT: &str = "die katze sitzt auf dem";
const UNTOUCHED_PROMPT: &str = "die sonne scheint am";

fn top1(model: &LanguageModel, tokenizer: &WordTokenizer, prompt: &str) -> String {
    top_predictions(model, tokenizer, prompt, 1)
        .unwrap()
        .top()
        .unwrap()
        .to_string()
}

#[test]
fn value_only_adapter_corrects_a_single_fact() {
    let mut tokenizer = WordTokenizer::build_vocabulary(&TRAINING_DATA, 1);
    let config = ModelConfig {
        vocab_size: tokenizer.vocab_size(),
        embed_dim: 32,
        num_heads: 4,
        num_layers: 2,
        ff_dim: 64,
        max_seq_len: 16,
        dropout: 0.0,
        ..Default::default()
    };
    let mut base = LanguageModel::new(config, Device::Cpu).unwrap();
    let pre = FineTuneConfig {
        window: 5,
        append_eos: true,
        lr: Some(0.005),
        rehearsal: Vec::new(),
        trainer: TrainerConfig {
            epochs: 250,
            batch_size: 8,
            ..Default::default()
        },
    };
    pretrain(&mut base, &tokenizer, &TRAINING_DATA, None, &pre, |_| {}).unwrap();

    assert_eq!(top1(&base, &tokenizer, TARGET_PROMPT), "tisch");
    assert!(UNCHANGED_PROMPTS.contains(&UNTOUCHED_PROMPT));
    let untouched: Vec<String> = UNCHANGED_PROMPTS
        .iter()
        .map(|p| top1(&base, &tokenizer, p))
        .collect();

    base.expand_vocabulary(&mut tokenizer, &FACT_CORRECTION_DATA)
        .unwrap();
    let rehearsal = rehearsal_sentences(&TRAINING_DATA, &FACT_CORRECTION_DATA);
    assert!(!rehearsal.iter().any(|s| s.starts_with(TARGET_PROMPT)));
    assert!(rehearsal.iter().any(|s| s.starts_with(UNTOUCHED_PROMPT)));

    let strategy = Strategy::Adapter(LoraConfig {
        alpha: 4.0,
        ..LoraConfig::value_only(4)
    });
    // Adapter init and batch order differ per run; the property must hold for each.
    for seed in [7, 11, 23] {
        let ft = FineTuneConfig {
            window: 5,
            append_eos: true,
            lr: Some(0.01),
            rehearsal: rehearsal.clone(),
            trainer: TrainerConfig {
                epochs: 100,
                batch_size: 4,
                seed,
                ..Default::default()
            },
        };
        let outcome = finetune(
            &base,
            &tokenizer,
            &FACT_CORRECTION_DATA,
            None,
            &strategy,
            &ft,
            |_| {},
        )
        .unwrap();

        assert_ne!(top1(&outcome.model, &tokenizer, TARGET_PROMPT), "tisch", "seed {seed}");
        for (prompt, expected) in UNCHANGED_PROMPTS.iter().zip(&untouched) {
            assert_eq!(
                &top1(&outcome.model, &tokenizer, prompt),
                expected,
                "seed {seed}, prompt '{prompt}'"
            );
        }

        // Merged weights answer the same way.
        let merged = outcome.merged().unwrap();
        assert_eq!(
            top1(&merged, &tokenizer, TARGET_PROMPT),
            top1(&outcome.model, &tokenizer, TARGET_PROMPT)
        );
    }
}

//! Tokenize the base corpus, window it and train a small model.

use candle_core::Device;

use minigpt_common::corpus::TRAINING_DATA;
use minigpt_common::{ModelConfig, SequenceDataset, WordTokenizer};
use minigpt_core::LanguageModel;
use minigpt_train::{pretrain, FineTuneConfig, TrainerConfig};

#[test]
fn corpus_trains_below_uniform_loss() {
    let tokenizer = WordTokenizer::build_vocabulary(&TRAINING_DATA, 1);
    let vocab = tokenizer.vocab_size();

    let ds = SequenceDataset::new(&TRAINING_DATA, &tokenizer, 4, false);
    assert!(!ds.is_empty());
    for ex in ds.examples() {
        assert_eq!(ex.input.len(), 4);
        assert_eq!(ex.input[1..], ex.target[..3]);
    }

    let config = ModelConfig {
        vocab_size: vocab,
        embed_dim: 32,
        num_heads: 4,
        num_layers: 2,
        ff_dim: 64,
        max_seq_len: 16,
        ..Default::default()
    };
    let mut model = LanguageModel::new(config, Device::Cpu).unwrap();
    let ft = FineTuneConfig {
        window: 4,
        append_eos: false,
        lr: None,
        rehearsal: Vec::new(),
        trainer: TrainerConfig {
            epochs: 30,
            batch_size: 4,
            ..Default::default()
        },
    };
    let outcome = pretrain(&mut model, &tokenizer, &TRAINING_DATA, None, &ft, |_| {}).unwrap();

    assert_eq!(outcome.losses.len(), 30);
    let uniform = (vocab as f32).ln();
    assert!(
        outcome.final_loss().unwrap() < uniform,
        "final loss {:?} not below ln(V) = {uniform}",
        outcome.final_loss()
    );
}

//! The three strategies on one expanded base model.

use candle_core::{Device, Tensor};

use minigpt_common::corpus::{FINETUNING_DATA, TRAINING_DATA};
use minigpt_common::{split_validation, LoraConfig, ModelConfig, WordTokenizer};
use minigpt_core::LanguageModel;
use minigpt_train::{finetune, FineTuneConfig, Strategy, TrainerConfig, MERGED_LABEL};

fn small_base(tokenizer: &WordTokenizer) -> LanguageModel {
    let config = ModelConfig {
        vocab_size: tokenizer.vocab_size(),
        embed_dim: 16,
        num_heads: 2,
        num_layers: 2,
        ff_dim: 32,
        max_seq_len: 8,
        dropout: 0.0,
        ..Default::default()
    };
    LanguageModel::new(config, Device::Cpu).unwrap()
}

fn logits(model: &LanguageModel, ids: &[u32]) -> Tensor {
    let input = Tensor::new(ids, model.device()).unwrap().unsqueeze(0).unwrap();
    model.model().forward(&input).unwrap()
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    (a - b)
        .unwrap()
        .abs()
        .unwrap()
        .flatten_all()
        .unwrap()
        .max(0)
        .unwrap()
        .to_scalar::<f32>()
        .unwrap()
}

#[test]
fn strategies_train_independent_copies() {
    let mut tokenizer = WordTokenizer::build_vocabulary(&TRAINING_DATA, 1);
    let mut base = small_base(&tokenizer);
    let old_vocab = base.vocab_size();
    let new_words = base.expand_vocabulary(&mut tokenizer, &FINETUNING_DATA).unwrap();
    assert!(!new_words.is_empty());
    assert_eq!(base.vocab_size(), old_vocab + new_words.len());

    let probe = tokenizer.encode("die katze sitzt auf dem");
    let before = logits(&base, &probe);

    let (train, val) = split_validation(&FINETUNING_DATA, 0.15);
    assert_eq!(val.as_ref().map(Vec::len), Some(1));

    let ft = FineTuneConfig {
        trainer: TrainerConfig {
            epochs: 5,
            ..Default::default()
        },
        ..Default::default()
    };
    let strategies = [
        Strategy::Full,
        Strategy::LayerFreezing { trainable_blocks: 1 },
        Strategy::Adapter(LoraConfig::all_attention(4)),
    ];
    let outcomes: Vec<_> = strategies
        .iter()
        .map(|s| finetune(&base, &tokenizer, &train, val.as_deref(), s, &ft, |_| {}).unwrap())
        .collect();

    // The base model never moves.
    assert_eq!(max_abs_diff(&before, &logits(&base, &probe)), 0.0);

    let trainable: Vec<usize> = outcomes.iter().map(|o| o.counts.trainable).collect();
    assert_eq!(trainable[0], outcomes[0].counts.total);
    assert!(trainable[1] < trainable[0]);
    assert!(trainable[2] < trainable[1]);

    assert!((outcomes[0].learning_rate - 0.001).abs() < 1e-12);
    assert!((outcomes[2].learning_rate - 0.002).abs() < 1e-12);
    for o in &outcomes {
        assert!(o.training.best_val_loss.is_some());
        assert_eq!(
            o.model.config().finetuning_method.as_deref(),
            Some(o.strategy.label())
        );
    }

    // Merging the trained adapter reproduces the adapted model.
    let adapted = &outcomes[2];
    let merged = adapted.merged().unwrap();
    assert!(merged.adapters().is_none());
    assert_eq!(merged.config().finetuning_method.as_deref(), Some(MERGED_LABEL));
    assert!(max_abs_diff(&logits(&adapted.model, &probe), &logits(&merged, &probe)) < 1e-4);

    // Every copy carries the expanded vocabulary.
    for o in &outcomes {
        assert_eq!(o.model.vocab_size(), tokenizer.vocab_size());
    }
}

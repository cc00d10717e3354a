use std::path::{Path, PathBuf};

use anyhow::Result;
use candle_core::Device;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use minigpt_common::corpus::{
    CORRECTION_PROMPTS, FACT_CORRECTION_DATA, FINETUNING_DATA, KNOWLEDGE_CORRECTION_DATA,
    NEW_PROMPTS, OLD_PROMPTS, TRAINING_DATA, UNCHANGED_PROMPTS,
};
use minigpt_common::{load_sentences, split_validation, AdapterTarget, LoraConfig, ModelConfig, WordTokenizer};
use minigpt_core::{LanguageModel, TOKENIZER_FILE};
use minigpt_infer::{top_predictions, InferenceRuntime, Prediction, SamplerConfig};
use minigpt_train::{
    finetune, pretrain, rehearsal_sentences, EpochMetrics, FineTuneConfig, FineTuneOutcome,
    LrDecay, Strategy, TrainerConfig, TrainingOutcome,
};

#[derive(Parser, Debug)]
#[command(name = "minigpt", about = "Pretrain, fine-tune and query a word-level MiniGPT")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train the base model from scratch.
    Pretrain(PretrainArgs),
    /// Fine-tune a base model with full, layer-frozen and adapter strategies.
    Finetune(FinetuneArgs),
    /// Correct facts with value-only vs. all-projection adapters.
    Correct(CorrectArgs),
    /// Top-k next-word predictions for prompts.
    Predict(PredictArgs),
    /// Sample a continuation for a prompt.
    Generate(GenerateArgs),
}

// ── Shared knobs ───────────────────────────────────────────────────────────────

#[derive(Parser, Debug, Clone)]
struct TrainArgs {
    #[arg(long)]
    epochs: Option<usize>,
    /// Overrides the default learning rate of the run / strategy.
    #[arg(long)]
    lr: Option<f64>,
    #[arg(long)]
    batch_size: Option<usize>,
    /// Sliding-window length of training examples.
    #[arg(long)]
    window: Option<usize>,
    #[arg(long, default_value_t = 0.1)]
    warmup_fraction: f64,
    #[arg(long, default_value = "cosine")]
    lr_decay: LrDecay,
    #[arg(long, default_value_t = 1.0)]
    grad_clip_max_norm: f64,
    /// Epochs without validation improvement before stopping (0 = never).
    #[arg(long)]
    patience: Option<usize>,
    #[arg(long, default_value_t = 42)]
    seed: u64,
    #[arg(long, default_value_t = 10)]
    log_every: usize,
}

impl TrainArgs {
    fn apply(&self, mut config: FineTuneConfig) -> FineTuneConfig {
        if let Some(epochs) = self.epochs {
            config.trainer.epochs = epochs;
        }
        if let Some(batch_size) = self.batch_size {
            config.trainer.batch_size = batch_size;
        }
        if let Some(window) = self.window {
            config.window = window;
        }
        config.lr = self.lr.or(config.lr);
        config.trainer = TrainerConfig {
            warmup_fraction: self.warmup_fraction,
            lr_decay: self.lr_decay,
            grad_clip_max_norm: self.grad_clip_max_norm,
            patience: self.patience.unwrap_or(config.trainer.patience),
            seed: self.seed,
            log_every: self.log_every,
            ..config.trainer
        };
        config
    }
}

#[derive(Parser, Debug, Clone)]
struct AdapterArgs {
    #[arg(long, default_value_t = 4)]
    rank: usize,
    #[arg(long, default_value_t = 1.0)]
    alpha: f64,
}

// ── Commands ───────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct PretrainArgs {
    /// Text or JSONL corpus; the built-in corpus when omitted.
    #[arg(long)]
    data: Option<PathBuf>,
    #[arg(long, default_value = "models/base")]
    output_dir: PathBuf,
    #[arg(long, default_value_t = 64)]
    embed_dim: usize,
    #[arg(long, default_value_t = 4)]
    num_heads: usize,
    #[arg(long, default_value_t = 2)]
    num_layers: usize,
    #[arg(long, default_value_t = 256)]
    ff_dim: usize,
    #[arg(long, default_value_t = 50)]
    max_seq_len: usize,
    #[arg(long, default_value_t = 0.1)]
    dropout: f32,
    #[arg(long)]
    weight_tying: bool,
    #[command(flatten)]
    train: TrainArgs,
}

#[derive(Parser, Debug)]
struct FinetuneArgs {
    #[arg(long, default_value = "models/base")]
    base_dir: PathBuf,
    /// Text or JSONL fine-tuning data; the built-in set when omitted.
    #[arg(long)]
    data: Option<PathBuf>,
    #[arg(long, default_value = "models")]
    output_dir: PathBuf,
    #[arg(long, default_value_t = 0.15)]
    val_fraction: f64,
    /// Blocks (from the top) left trainable by layer freezing.
    #[arg(long, default_value_t = 1)]
    trainable_blocks: usize,
    /// Attention projections that receive adapters.
    #[arg(long, value_delimiter = ',', default_value = "q_proj,k_proj,v_proj,out_proj")]
    targets: Vec<AdapterTarget>,
    #[command(flatten)]
    adapter: AdapterArgs,
    #[command(flatten)]
    train: TrainArgs,
}

#[derive(Parser, Debug)]
struct CorrectArgs {
    #[arg(long, default_value = "models/base")]
    base_dir: PathBuf,
    #[arg(long, default_value = "models")]
    output_dir: PathBuf,
    /// Also train on the broader knowledge-correction sentences.
    #[arg(long)]
    with_knowledge: bool,
    /// Train on the corrections alone, without the uncontradicted base sentences.
    #[arg(long)]
    no_rehearsal: bool,
    #[command(flatten)]
    adapter: AdapterArgs,
    #[command(flatten)]
    train: TrainArgs,
}

#[derive(Parser, Debug)]
struct PredictArgs {
    #[arg(long)]
    model_dir: PathBuf,
    /// Needed when `model_dir` only holds an adapter.
    #[arg(long)]
    base_dir: Option<PathBuf>,
    /// Prompts to complete; interactive when omitted.
    #[arg(long)]
    prompt: Vec<String>,
    #[arg(long, default_value_t = 5)]
    top_k: usize,
}

#[derive(Parser, Debug)]
struct GenerateArgs {
    #[arg(long)]
    model_dir: PathBuf,
    #[arg(long)]
    base_dir: Option<PathBuf>,
    #[arg(long, default_value = "die katze")]
    prompt: String,
    #[arg(long, default_value_t = 10)]
    max_tokens: usize,
    #[arg(long, default_value_t = 0.8)]
    temperature: f64,
    #[arg(long, default_value_t = 5)]
    top_k: usize,
    #[arg(long)]
    seed: Option<u64>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Pretrain(args) => cmd_pretrain(args),
        Command::Finetune(args) => cmd_finetune(args),
        Command::Correct(args) => cmd_correct(args),
        Command::Predict(args) => cmd_predict(args),
        Command::Generate(args) => cmd_generate(args),
    }
}

// ── Helpers ────────────────────────────────────────────────────────────────────

fn sentences(data: Option<&Path>, builtin: &[&str]) -> Result<Vec<String>> {
    match data {
        Some(path) => {
            let sentences = load_sentences(path)?;
            eprintln!("Loaded {} sentences from {}", sentences.len(), path.display());
            Ok(sentences)
        }
        None => Ok(builtin.iter().map(|s| s.to_string()).collect()),
    }
}

/// Load `base_dir` and its tokenizer, or `None` (with a message) when no
/// base model has been trained yet.
fn load_base(base_dir: &Path, device: &Device) -> Result<Option<(LanguageModel, WordTokenizer)>> {
    if !base_dir.join(minigpt_core::WEIGHTS_FILE).exists() {
        eprintln!(
            "No base model at {}. Run `minigpt pretrain --output-dir {}` first.",
            base_dir.display(),
            base_dir.display()
        );
        return Ok(None);
    }
    let model = LanguageModel::load(base_dir, device.clone())?;
    let tokenizer = WordTokenizer::load(&base_dir.join(TOKENIZER_FILE))?;
    eprintln!(
        "Loaded base model from {} (vocab {})",
        base_dir.display(),
        tokenizer.vocab_size()
    );
    Ok(Some((model, tokenizer)))
}

fn epoch_bar(epochs: usize, label: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new(epochs as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {prefix:>16} {bar:30} {pos}/{len} {msg}")?
            .progress_chars("=>-"),
    );
    pb.set_prefix(label.to_string());
    Ok(pb)
}

fn on_epoch(pb: &ProgressBar) -> impl FnMut(&EpochMetrics) + '_ {
    move |m: &EpochMetrics| {
        let msg = match m.val_loss {
            Some(v) => format!("loss {:.4} val {:.4}", m.train_loss, v),
            None => format!("loss {:.4}", m.train_loss),
        };
        pb.set_message(msg);
        pb.inc(1);
    }
}

fn finish(pb: ProgressBar, outcome: &TrainingOutcome) {
    let msg = match outcome.stopped_epoch {
        Some(epoch) => format!("early stop at epoch {epoch}"),
        None => format!("loss {:.4}", outcome.final_loss().unwrap_or(f32::NAN)),
    };
    pb.finish_with_message(msg);
}

fn format_prediction(p: &Prediction) -> String {
    match p {
        Prediction::Unknown => "(unknown words)".to_string(),
        Prediction::Ranked(ranked) => ranked
            .iter()
            .map(|(w, p)| format!("{w} {:.0}%", 100.0 * p))
            .collect::<Vec<_>>()
            .join(", "),
    }
}

fn save_with_tokenizer(model: &LanguageModel, tokenizer: &WordTokenizer, dir: &Path) -> Result<()> {
    model.save(dir)?;
    tokenizer.save(&dir.join(TOKENIZER_FILE))?;
    Ok(())
}

fn print_summary(outcomes: &[FineTuneOutcome], vocab_before: usize, vocab_after: usize) {
    eprintln!();
    eprintln!(
        "{:<16} {:>10} {:>10} {:>8} {:>10} {:>10} {:>8}",
        "method", "trainable", "total", "share", "final", "best val", "lr"
    );
    for o in outcomes {
        eprintln!(
            "{:<16} {:>10} {:>10} {:>7.2}% {:>10.4} {:>10} {:>8.0e}",
            o.strategy.label(),
            o.counts.trainable,
            o.counts.total,
            100.0 * o.counts.trainable_fraction(),
            o.training.final_loss().unwrap_or(f32::NAN),
            o.training
                .best_val_loss
                .map_or_else(|| "-".to_string(), |v| format!("{v:.4}")),
            o.learning_rate,
        );
    }
    eprintln!("vocabulary: {vocab_before} → {vocab_after}");
}

// ── Command implementations ────────────────────────────────────────────────────

fn cmd_pretrain(args: PretrainArgs) -> Result<()> {
    let device = Device::cuda_if_available(0)?;
    let corpus = sentences(args.data.as_deref(), &TRAINING_DATA)?;
    let tokenizer = WordTokenizer::build_vocabulary(&corpus, 1);
    eprintln!(
        "Corpus: {} sentences, vocabulary {}",
        corpus.len(),
        tokenizer.vocab_size()
    );

    let config = ModelConfig {
        vocab_size: tokenizer.vocab_size(),
        embed_dim: args.embed_dim,
        num_heads: args.num_heads,
        num_layers: args.num_layers,
        ff_dim: args.ff_dim,
        max_seq_len: args.max_seq_len,
        dropout: args.dropout,
        weight_tying: args.weight_tying,
        ..Default::default()
    };
    config.validate()?;
    let mut model = LanguageModel::new(config, device)?;

    let ft = args.train.apply(FineTuneConfig::pretraining());
    let pb = epoch_bar(ft.trainer.epochs, "pretrain")?;
    let outcome = pretrain(&mut model, &tokenizer, &corpus, None, &ft, on_epoch(&pb))?;
    finish(pb, &outcome);

    save_with_tokenizer(&model, &tokenizer, &args.output_dir)?;
    eprintln!("Saved base model to {}", args.output_dir.display());

    for prompt in OLD_PROMPTS {
        let p = top_predictions(&model, &tokenizer, prompt, 3)?;
        eprintln!("  {prompt:<24} → {}", format_prediction(&p));
    }
    Ok(())
}

fn cmd_finetune(args: FinetuneArgs) -> Result<()> {
    let device = Device::cuda_if_available(0)?;
    let Some((base, base_tokenizer)) = load_base(&args.base_dir, &device)? else {
        return Ok(());
    };

    let data = sentences(args.data.as_deref(), &FINETUNING_DATA)?;
    let (train, val) = split_validation(&data, args.val_fraction);
    eprintln!(
        "Fine-tuning data: {} train / {} validation sentences",
        train.len(),
        val.as_ref().map_or(0, Vec::len)
    );

    // Expansion runs once on a copy so every strategy starts from the same shape.
    let mut tokenizer = base_tokenizer.clone();
    let mut expanded = base.deep_copy()?;
    let new_words = expanded.expand_vocabulary(&mut tokenizer, &data)?;
    if !new_words.is_empty() {
        eprintln!("New words ({}): {}", new_words.len(), new_words.join(", "));
    }

    let lora = LoraConfig {
        rank: args.adapter.rank,
        alpha: args.adapter.alpha,
        targets: args.targets.clone(),
    };
    let strategies = [
        Strategy::Full,
        Strategy::LayerFreezing {
            trainable_blocks: args.trainable_blocks,
        },
        Strategy::Adapter(lora),
    ];

    let ft = args.train.apply(FineTuneConfig::default());
    let mut outcomes = Vec::with_capacity(strategies.len());
    for strategy in &strategies {
        let pb = epoch_bar(ft.trainer.epochs, strategy.label())?;
        let outcome = finetune(
            &expanded,
            &tokenizer,
            &train,
            val.as_deref(),
            strategy,
            &ft,
            on_epoch(&pb),
        )?;
        finish(pb, &outcome.training);

        let dir = args.output_dir.join(strategy.label());
        match strategy {
            Strategy::Adapter(_) => {
                outcome.model.save_adapter(&dir, strategy.label())?;
                tokenizer.save(&dir.join(TOKENIZER_FILE))?;
                let merged = outcome.merged()?;
                let merged_dir = args.output_dir.join(minigpt_train::MERGED_LABEL);
                save_with_tokenizer(&merged, &tokenizer, &merged_dir)?;
                eprintln!("Saved merged model to {}", merged_dir.display());
            }
            _ => save_with_tokenizer(&outcome.model, &tokenizer, &dir)?,
        }
        eprintln!("Saved {} to {}", strategy.label(), dir.display());
        outcomes.push(outcome);
    }

    print_summary(&outcomes, base_tokenizer.vocab_size(), tokenizer.vocab_size());

    eprintln!();
    eprintln!("Forgetting probe (old prompts):");
    for prompt in OLD_PROMPTS {
        let p = top_predictions(&base, &base_tokenizer, prompt, 1)?;
        eprintln!("  {prompt:<16} base            {}", format_prediction(&p));
        for o in &outcomes {
            let p = top_predictions(&o.model, &tokenizer, prompt, 1)?;
            eprintln!("  {:<16} {:<15} {}", "", o.strategy.label(), format_prediction(&p));
        }
    }
    eprintln!("New prompts:");
    for prompt in NEW_PROMPTS {
        let p = top_predictions(&base, &base_tokenizer, prompt, 1)?;
        eprintln!("  {prompt:<16} base            {}", format_prediction(&p));
        for o in &outcomes {
            let p = top_predictions(&o.model, &tokenizer, prompt, 1)?;
            eprintln!("  {:<16} {:<15} {}", "", o.strategy.label(), format_prediction(&p));
        }
    }
    Ok(())
}

fn cmd_correct(args: CorrectArgs) -> Result<()> {
    let device = Device::cuda_if_available(0)?;
    let Some((base, base_tokenizer)) = load_base(&args.base_dir, &device)? else {
        return Ok(());
    };

    let mut data: Vec<String> = FACT_CORRECTION_DATA.iter().map(|s| s.to_string()).collect();
    if args.with_knowledge {
        data.extend(KNOWLEDGE_CORRECTION_DATA.iter().map(|s| s.to_string()));
    }

    let mut tokenizer = base_tokenizer.clone();
    let mut expanded = base.deep_copy()?;
    expanded.expand_vocabulary(&mut tokenizer, &data)?;

    let mut ft = FineTuneConfig::default();
    ft.trainer.epochs = 80;
    if !args.no_rehearsal {
        ft.rehearsal = rehearsal_sentences(&TRAINING_DATA, &data);
        eprintln!("Rehearsing {} uncontradicted base sentences", ft.rehearsal.len());
    }
    let ft = args.train.apply(ft);

    let variants = [
        Strategy::Adapter(LoraConfig {
            alpha: args.adapter.alpha,
            ..LoraConfig::value_only(args.adapter.rank)
        }),
        Strategy::Adapter(LoraConfig {
            alpha: args.adapter.alpha,
            ..LoraConfig::all_attention(args.adapter.rank)
        }),
    ];

    let mut outcomes = Vec::with_capacity(variants.len());
    for strategy in &variants {
        let pb = epoch_bar(ft.trainer.epochs, strategy.label())?;
        let outcome = finetune(&expanded, &tokenizer, &data, None, strategy, &ft, on_epoch(&pb))?;
        finish(pb, &outcome.training);

        let merged = outcome.merged()?;
        let dir = args.output_dir.join(format!("corrected_{}", strategy.label()));
        save_with_tokenizer(&merged, &tokenizer, &dir)?;
        eprintln!("Saved {} to {}", strategy.label(), dir.display());
        outcomes.push(outcome);
    }

    print_summary(&outcomes, base_tokenizer.vocab_size(), tokenizer.vocab_size());

    for (title, prompts) in [
        ("Corrected facts:", &CORRECTION_PROMPTS[..]),
        ("Untouched facts:", &UNCHANGED_PROMPTS[..]),
    ] {
        eprintln!();
        eprintln!("{title}");
        for prompt in prompts {
            let p = top_predictions(&base, &base_tokenizer, prompt, 3)?;
            eprintln!("  {prompt:<28} base         {}", format_prediction(&p));
            for o in &outcomes {
                let p = top_predictions(&o.model, &tokenizer, prompt, 3)?;
                eprintln!("  {:<28} {:<12} {}", "", o.strategy.label(), format_prediction(&p));
            }
        }
    }
    Ok(())
}

fn cmd_predict(args: PredictArgs) -> Result<()> {
    let device = Device::cuda_if_available(0)?;
    let mut runtime = InferenceRuntime::load(
        &args.model_dir,
        args.base_dir.as_deref(),
        SamplerConfig::default(),
        device,
    )?;
    if args.prompt.is_empty() {
        return runtime.chat_loop(10);
    }
    for prompt in &args.prompt {
        let p = runtime.predict(prompt, args.top_k)?;
        println!("{prompt} → {}", format_prediction(&p));
    }
    Ok(())
}

fn cmd_generate(args: GenerateArgs) -> Result<()> {
    let sampler_config = SamplerConfig {
        temperature: args.temperature,
        top_k: args.top_k,
        seed: args.seed,
    };
    let device = Device::cuda_if_available(0)?;
    let mut runtime = InferenceRuntime::load(
        &args.model_dir,
        args.base_dir.as_deref(),
        sampler_config,
        device,
    )?;
    let text = runtime.generate(&args.prompt, args.max_tokens)?;
    println!("{text}");
    Ok(())
}

//! Model and adapter configuration for minigpt.
//!
//! Serialised as JSON next to the weights (`config.json`, `lora_config.json`).
//! Every optional field has a `#[serde(default)]` so older files keep loading.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Configuration for the word-level decoder-only transformer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    // ── Core dimensions ─────────────────────────────────────────────────────
    /// Vocabulary size (must match the tokenizer).
    pub vocab_size: usize,
    /// Embedding / model dimension.
    pub embed_dim: usize,
    /// Number of attention heads.
    pub num_heads: usize,
    /// Number of decoder blocks.
    pub num_layers: usize,
    /// Feed-forward hidden dimension.
    #[serde(default = "default_ff_dim")]
    pub ff_dim: usize,
    /// Longest sequence the positional table and causal mask cover.
    #[serde(default = "default_max_seq_len")]
    pub max_seq_len: usize,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,

    // ── Regularisation / heads ──────────────────────────────────────────────
    /// Dropout probability after attention and inside the feed-forward block.
    #[serde(default = "default_dropout")]
    pub dropout: f32,
    /// Output projection reuses the token embedding matrix.
    #[serde(default)]
    pub weight_tying: bool,

    // ── Provenance ──────────────────────────────────────────────────────────
    /// Label of the fine-tuning strategy that produced these weights.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finetuning_method: Option<String>,
}

// ── Default value functions ─────────────────────────────────────────────────

fn default_ff_dim() -> usize {
    256
}
fn default_max_seq_len() -> usize {
    50
}
fn default_layer_norm_eps() -> f64 {
    1e-5
}
fn default_dropout() -> f32 {
    0.1
}

// ── Impl ────────────────────────────────────────────────────────────────────

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            vocab_size: 4,
            embed_dim: 64,
            num_heads: 4,
            num_layers: 2,
            ff_dim: 256,
            max_seq_len: 50,
            layer_norm_eps: 1e-5,
            dropout: 0.1,
            weight_tying: false,
            finetuning_method: None,
        }
    }
}

impl ModelConfig {
    /// Head dimension (`embed_dim / num_heads`); meaningful once
    /// [`ModelConfig::validate`] passed.
    pub fn head_dim(&self) -> usize {
        self.embed_dim / self.num_heads.max(1)
    }

    /// Reject shapes the model cannot be built with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.num_heads == 0 {
            anyhow::bail!("num_heads must be at least 1");
        }
        if self.embed_dim == 0 || self.embed_dim % self.num_heads != 0 {
            anyhow::bail!(
                "embed_dim {} is not divisible by num_heads {}",
                self.embed_dim,
                self.num_heads
            );
        }
        if self.num_layers == 0 || self.max_seq_len == 0 {
            anyhow::bail!("num_layers and max_seq_len must be at least 1");
        }
        Ok(())
    }

    /// Save config to a JSON file.
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load config from a JSON file.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("{}: {e}", path.display()))?;
        Ok(config)
    }
}

// ── Adapter targets ─────────────────────────────────────────────────────────

/// Attention projection that can carry a low-rank adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AdapterTarget {
    #[serde(rename = "q_proj")]
    Query,
    #[serde(rename = "k_proj")]
    Key,
    #[serde(rename = "v_proj")]
    Value,
    #[serde(rename = "out_proj")]
    Output,
}

impl AdapterTarget {
    pub const ALL: [AdapterTarget; 4] = [Self::Query, Self::Key, Self::Value, Self::Output];

    /// Parameter-path segment of the projection (`h.{i}.attn.<name>`).
    pub fn module_name(self) -> &'static str {
        match self {
            Self::Query => "q_proj",
            Self::Key => "k_proj",
            Self::Value => "v_proj",
            Self::Output => "out_proj",
        }
    }
}

impl fmt::Display for AdapterTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.module_name())
    }
}

impl FromStr for AdapterTarget {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "q_proj" | "q" => Ok(Self::Query),
            "k_proj" | "k" => Ok(Self::Key),
            "v_proj" | "v" => Ok(Self::Value),
            "out_proj" | "o" => Ok(Self::Output),
            other => anyhow::bail!("unknown adapter target '{other}'"),
        }
    }
}

// ── LoraConfig ──────────────────────────────────────────────────────────────

/// Low-rank adapter hyper-parameters.
///
/// The target set is explicit: restricting it to [`AdapterTarget::Value`]
/// changes what attention retrieves without changing where it attends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraConfig {
    #[serde(default = "default_rank")]
    pub rank: usize,
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    #[serde(rename = "target_modules", default = "default_targets")]
    pub targets: Vec<AdapterTarget>,
}

fn default_rank() -> usize {
    4
}
fn default_alpha() -> f64 {
    1.0
}
fn default_targets() -> Vec<AdapterTarget> {
    AdapterTarget::ALL.to_vec()
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self::all_attention(4)
    }
}

impl LoraConfig {
    /// Adapters on Q, K, V and the output projection.
    pub fn all_attention(rank: usize) -> Self {
        Self {
            rank,
            alpha: default_alpha(),
            targets: default_targets(),
        }
    }

    /// Adapter on the value projection only.
    pub fn value_only(rank: usize) -> Self {
        Self {
            rank,
            alpha: default_alpha(),
            targets: vec![AdapterTarget::Value],
        }
    }

    /// `alpha / rank`, the factor applied to the low-rank path.
    pub fn scale(&self) -> f64 {
        self.alpha / self.rank as f64
    }

    pub fn targets(&self, target: AdapterTarget) -> bool {
        self.targets.contains(&target)
    }
}

/// Contents of `lora_config.json` in an adapter-only model directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterManifest {
    pub finetuning_method: String,
    #[serde(flatten)]
    pub lora: LoraConfig,
    /// Vocabulary size the saved embedding rows were expanded to.
    pub vocab_size: usize,
}

impl AdapterManifest {
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let manifest: Self = serde_json::from_str(&json)?;
        if manifest.lora.rank == 0 {
            anyhow::bail!("{}: adapter rank must be positive", path.display());
        }
        Ok(manifest)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_json_round_trip() {
        let config = ModelConfig {
            vocab_size: 120,
            finetuning_method: Some("lora_merged".into()),
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let loaded: ModelConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn config_head_dim() {
        let config = ModelConfig {
            embed_dim: 64,
            num_heads: 4,
            ..Default::default()
        };
        assert_eq!(config.head_dim(), 16);
    }

    #[test]
    fn validate_rejects_bad_head_counts() {
        let uneven = ModelConfig {
            embed_dim: 30,
            num_heads: 4,
            ..Default::default()
        };
        assert!(uneven.validate().unwrap_err().to_string().contains("divisible"));

        let zero = ModelConfig {
            num_heads: 0,
            ..Default::default()
        };
        assert!(zero.validate().is_err());
        assert_eq!(zero.head_dim(), 64);
        assert!(ModelConfig::default().validate().is_ok());
    }

    #[test]
    fn backward_compat_missing_fields() {
        let old_json = r#"{
            "vocab_size": 97,
            "embed_dim": 64,
            "num_heads": 4,
            "num_layers": 2
        }"#;
        let loaded: ModelConfig = serde_json::from_str(old_json).unwrap();
        assert_eq!(loaded.ff_dim, 256);
        assert_eq!(loaded.max_seq_len, 50);
        assert!(!loaded.weight_tying);
        assert!(loaded.finetuning_method.is_none());
        assert!((loaded.dropout - 0.1).abs() < 1e-6);
    }

    #[test]
    fn load_rejects_uneven_heads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"vocab_size": 10, "embed_dim": 10, "num_heads": 4, "num_layers": 1}"#,
        )
        .unwrap();
        assert!(ModelConfig::load(&path).is_err());

        std::fs::write(
            &path,
            r#"{"vocab_size": 10, "embed_dim": 16, "num_heads": 0, "num_layers": 1}"#,
        )
        .unwrap();
        assert!(ModelConfig::load(&path).is_err());
    }

    #[test]
    fn lora_presets_and_scale() {
        let all = LoraConfig::all_attention(4);
        assert_eq!(all.targets.len(), 4);
        assert!((all.scale() - 0.25).abs() < 1e-12);

        let v = LoraConfig::value_only(8);
        assert!(v.targets(AdapterTarget::Value));
        assert!(!v.targets(AdapterTarget::Query));
        assert!((v.scale() - 0.125).abs() < 1e-12);
    }

    #[test]
    fn adapter_manifest_uses_module_names() {
        let manifest = AdapterManifest {
            finetuning_method: "lora_adapter".into(),
            lora: LoraConfig::value_only(4),
            vocab_size: 130,
        };
        let json = serde_json::to_value(&manifest).unwrap();
        assert_eq!(json["target_modules"][0], "v_proj");
        assert_eq!(json["rank"], 4);
        assert_eq!(json["vocab_size"], 130);
    }

    #[test]
    fn target_parsing() {
        assert_eq!("v".parse::<AdapterTarget>().unwrap(), AdapterTarget::Value);
        assert_eq!(
            "out_proj".parse::<AdapterTarget>().unwrap(),
            AdapterTarget::Output
        );
        assert!("mlp".parse::<AdapterTarget>().is_err());
    }
}

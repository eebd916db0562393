use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Length bucket: sequences are grouped so one batch shares a single padded
/// shape. `max_output` is also the fixed number of decode steps for the bucket.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Bucket {
    pub max_input: usize,
    pub max_output: usize,
}

impl Bucket {
    pub fn new(max_input: usize, max_output: usize) -> Self {
        Self {
            max_input,
            max_output,
        }
    }
}

fn default_buckets() -> Vec<Bucket> {
    vec![
        Bucket::new(210, 60),
        Bucket::new(346, 120),
        Bucket::new(548, 180),
        Bucket::new(850, 200),
        Bucket::new(1500, 380),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Number of acoustic features per frame.
    pub feat_dim: usize,
    /// Encoder hidden width (the attention value size).
    pub hidden_size: usize,
    pub hidden_size_decoder: usize,
    pub embedding_size: usize,
    pub attention_vec_size: usize,
    pub num_layers_encoder: usize,
    pub num_layers_decoder: usize,
    /// Memory-augmented (LSTM-style) cells instead of plain tanh cells.
    pub use_memory_cell: bool,
    /// Resolved from the vocabulary file before model construction.
    pub vocab_size: usize,
    pub dropout: f64,
    pub apply_dropout: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            feat_dim: 80,
            hidden_size: 256,
            hidden_size_decoder: 256,
            embedding_size: 256,
            attention_vec_size: 64,
            num_layers_encoder: 2,
            num_layers_decoder: 1,
            use_memory_cell: true,
            vocab_size: 0,
            dropout: 0.1,
            apply_dropout: false,
        }
    }
}

impl ModelConfig {
    pub fn validate(&self) {
        assert!(self.feat_dim > 0, "feat_dim must be > 0");
        assert!(self.hidden_size > 0, "hidden_size must be > 0");
        assert!(self.hidden_size_decoder > 0, "hidden_size_decoder must be > 0");
        assert!(self.embedding_size > 0, "embedding_size must be > 0");
        assert!(self.attention_vec_size > 0, "attention_vec_size must be > 0");
        assert!(self.num_layers_encoder > 0, "num_layers_encoder must be > 0");
        assert!(self.num_layers_decoder > 0, "num_layers_decoder must be > 0");
        assert!(
            self.vocab_size > 0,
            "vocab_size must be resolved from the vocabulary before model construction"
        );
        assert!(
            (0.0..1.0).contains(&self.dropout),
            "dropout must be within [0,1)"
        );
    }
}

impl fmt::Display for ModelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    pub enabled: bool,
    /// Probability of feeding the ground-truth token at a sampled step.
    pub teacher_prob: f64,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            teacher_prob: 0.9,
        }
    }
}

impl SamplingConfig {
    pub fn validate(&self) {
        assert!(
            (0.0..=1.0).contains(&self.teacher_prob),
            "teacher_prob must be within [0,1]"
        );
    }
}

impl fmt::Display for SamplingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub learning_rate: f64,
    pub lr_decay_factor: f64,
    /// Decay stops once the learning rate is at or below this floor.
    pub lr_floor: f64,
    pub batch_size: usize,
    pub max_epochs: usize,
    pub max_grad_norm: f32,
    pub feeder_workers: usize,
    /// Bound on the feeder channel between workers and the compute thread.
    pub queue_capacity: usize,
    /// Seed for scheduled sampling and shard shuffling; entropy when unset.
    pub seed: Option<u64>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            lr_decay_factor: 0.9,
            lr_floor: 1e-4,
            batch_size: 64,
            max_epochs: 500,
            max_grad_norm: 5.0,
            feeder_workers: 1,
            queue_capacity: 8,
            seed: None,
        }
    }
}

impl TrainingConfig {
    pub fn validate(&self) {
        assert!(self.learning_rate > 0.0, "learning_rate must be > 0");
        assert!(
            (0.0..1.0).contains(&self.lr_decay_factor),
            "lr_decay_factor must be within (0,1)"
        );
        assert!(self.lr_floor > 0.0, "lr_floor must be > 0");
        assert!(self.batch_size > 0, "batch_size must be > 0");
        assert!(self.max_grad_norm > 0.0, "max_grad_norm must be > 0");
        assert!(self.feeder_workers > 0, "feeder_workers must be > 0");
        assert!(self.queue_capacity > 0, "queue_capacity must be > 0");
    }

    /// Checkpoint interval, scaled so one window covers a comparable number of
    /// examples at any batch size (500 steps at the reference batch of 64).
    pub fn steps_per_checkpoint(&self) -> usize {
        let steps = (500.0 * 64.0 / self.batch_size as f64).round() as usize;
        steps.max(1)
    }
}

impl fmt::Display for TrainingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory holding `train*.bin` shards plus `dev*.bin` / `eval.bin`.
    pub data_dir: PathBuf,
    pub vocab_file: PathBuf,
    pub train_base_dir: PathBuf,
    pub best_base_dir: PathBuf,
    /// Selects which dev file to use (`dev<prefix>.bin`).
    pub dev_prefix: String,
    pub run_id: usize,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            vocab_file: PathBuf::from("data/vocab/char.txt"),
            train_base_dir: PathBuf::from("models"),
            best_base_dir: PathBuf::from("models/best"),
            dev_prefix: String::new(),
            run_id: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AsrConfig {
    pub model: ModelConfig,
    pub sampling: SamplingConfig,
    pub training: TrainingConfig,
    pub paths: PathsConfig,
    #[serde(default = "default_buckets")]
    pub buckets: Vec<Bucket>,
}

impl Default for AsrConfig {
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            sampling: SamplingConfig::default(),
            training: TrainingConfig::default(),
            paths: PathsConfig::default(),
            buckets: default_buckets(),
        }
    }
}

impl AsrConfig {
    pub fn validate(&self) {
        self.model.validate();
        self.sampling.validate();
        self.training.validate();
        assert!(!self.buckets.is_empty(), "at least one bucket is required");
        for bucket in &self.buckets {
            assert!(bucket.max_input > 0, "bucket max_input must be > 0");
            assert!(bucket.max_output > 0, "bucket max_output must be > 0");
        }
    }

    /// Descriptive run name so concurrent configurations never share a
    /// directory.
    pub fn run_name(&self) -> String {
        let samp = if self.sampling.enabled { "samp_" } else { "" };
        let cell = if self.model.use_memory_cell {
            "lstm_"
        } else {
            "rnn_"
        };
        format!(
            "lr_{}_bsize_{}_esize_{}_hsize_{}_hsize_dec_{}_{}{}nl_{}_nl_dec_{}_run_id_{}",
            self.training.learning_rate,
            self.training.batch_size,
            self.model.embedding_size,
            self.model.hidden_size,
            self.model.hidden_size_decoder,
            samp,
            cell,
            self.model.num_layers_encoder,
            self.model.num_layers_decoder,
            self.paths.run_id,
        )
    }

    pub fn train_dir(&self) -> PathBuf {
        self.paths.train_base_dir.join(self.run_name())
    }

    pub fn best_dir(&self) -> PathBuf {
        self.paths.best_base_dir.join(self.run_name())
    }

    /// Reproducibility dump: every configuration key/value pair, sorted, one
    /// `key<TAB>value` line each.
    pub fn dump_parameters(&self, path: &Path) -> Result<()> {
        let value =
            serde_json::to_value(self).with_context(|| "Failed to serialize configuration")?;
        let mut pairs = Vec::new();
        flatten_value("", &value, &mut pairs);
        pairs.sort();
        let mut out = String::new();
        for (key, val) in pairs {
            out.push_str(&key);
            out.push('\t');
            out.push_str(&val);
            out.push('\n');
        }
        fs::write(path, out).with_context(|| format!("Failed to write parameters to {:?}", path))
    }
}

impl fmt::Display for AsrConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

fn flatten_value(prefix: &str, value: &serde_json::Value, out: &mut Vec<(String, String)>) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, val) in map {
                let nested = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten_value(&nested, val, out);
            }
        }
        other => out.push((prefix.to_string(), other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_steps_per_checkpoint_scales_with_batch_size() {
        let mut config = TrainingConfig::default();
        assert_eq!(config.steps_per_checkpoint(), 500);
        config.batch_size = 32;
        assert_eq!(config.steps_per_checkpoint(), 1000);
        config.batch_size = 128;
        assert_eq!(config.steps_per_checkpoint(), 250);
        config.batch_size = 100_000;
        assert_eq!(config.steps_per_checkpoint(), 1);
    }

    #[test]
    fn test_run_name_distinguishes_runs() {
        let mut a = AsrConfig::default();
        let mut b = AsrConfig::default();
        a.paths.run_id = 1;
        b.paths.run_id = 2;
        assert_ne!(a.run_name(), b.run_name());
    }

    #[test]
    fn test_dump_parameters_sorted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("parameters.txt");
        let config = AsrConfig::default();
        config.dump_parameters(&path).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let keys: Vec<&str> = contents
            .lines()
            .map(|line| line.split('\t').next().unwrap())
            .collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        assert!(contents.contains("training.batch_size\t64"));
    }
}

use serde::{Deserialize, Serialize};
use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

use crate::discrepancy::DiscrepancyMode;

/// L2 penalty applied by every optimizer binding.
pub const WEIGHT_DECAY: f64 = 5e-4;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SolverConfig {
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub adaptation: AdaptationConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
}

impl SolverConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: SolverConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;

        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        Self::from_path(path)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if self.data.source.trim().is_empty() {
            errors.push("data.source must not be empty".to_string());
        }
        if self.data.target.trim().is_empty() {
            errors.push("data.target must not be empty".to_string());
        }
        if self.data.batch_size == 0 {
            errors.push("data.batch_size must be greater than 0".to_string());
        }
        if !self.data.all_use && self.data.subset_size == 0 {
            errors.push("data.subset_size must be greater than 0".to_string());
        }

        if self.optimizer.learning_rate <= 0.0 {
            errors.push("optimizer.learning_rate must be greater than 0".to_string());
        }
        if !(0.0..1.0).contains(&self.optimizer.momentum) {
            errors.push("optimizer.momentum must be in [0, 1)".to_string());
        }
        if !(0.0 < self.optimizer.beta1 && self.optimizer.beta1 < 1.0) {
            errors.push("optimizer.beta1 must be in (0, 1)".to_string());
        }
        if !(0.0 < self.optimizer.beta2 && self.optimizer.beta2 < 1.0) {
            errors.push("optimizer.beta2 must be in (0, 1)".to_string());
        }
        if self.optimizer.epsilon <= 0.0 {
            errors.push("optimizer.epsilon must be greater than 0".to_string());
        }

        if self.adaptation.num_k == 0 {
            errors.push("adaptation.num_k must be greater than 0".to_string());
        }

        if self.runtime.interval == 0 {
            errors.push("runtime.interval must be greater than 0".to_string());
        }
        if self.runtime.max_epoch == 0 && !self.checkpoint.eval_only {
            errors.push("runtime.max_epoch must be greater than 0".to_string());
        }

        if self.checkpoint.directory.as_os_str().is_empty() {
            errors.push("checkpoint.directory must not be empty".to_string());
        }
        if self.checkpoint.save_epoch == 0 {
            errors.push("checkpoint.save_epoch must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.data.data_dir, base);
        absolutize_in_place(&mut self.checkpoint.directory, base);
        if let Some(dir) = self.runtime.record_dir.as_mut() {
            absolutize_in_place(dir, base);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_source")]
    pub source: String,
    #[serde(default = "default_target")]
    pub target: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Resize images to 32x32. Defaults to on when the source is SVHN.
    #[serde(default)]
    pub scale: Option<bool>,
    #[serde(default)]
    pub all_use: bool,
    #[serde(default = "default_subset_size")]
    pub subset_size: usize,
}

impl DataConfig {
    pub fn scale(&self) -> bool {
        self.scale
            .unwrap_or_else(|| self.source.eq_ignore_ascii_case("svhn"))
    }

    /// Upper bound on training samples per domain.
    pub fn sample_limit(&self) -> Option<usize> {
        if self.all_use {
            None
        } else {
            Some(self.subset_size)
        }
    }
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            source: default_source(),
            target: default_target(),
            data_dir: default_data_dir(),
            batch_size: default_batch_size(),
            scale: None,
            all_use: false,
            subset_size: default_subset_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default)]
    pub kind: OptimizerType,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_momentum")]
    pub momentum: f64,
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    #[serde(default = "default_adam_eps")]
    pub epsilon: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            kind: OptimizerType::default(),
            learning_rate: default_learning_rate(),
            momentum: default_momentum(),
            beta1: default_beta1(),
            beta2: default_beta2(),
            epsilon: default_adam_eps(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerType {
    Momentum,
    #[default]
    Adam,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptationConfig {
    #[serde(default = "default_num_k")]
    pub num_k: usize,
    #[serde(default)]
    pub entropy: bool,
    #[serde(default)]
    pub use_abs_diff: bool,
    #[serde(default)]
    pub second_head: SecondHead,
}

impl AdaptationConfig {
    pub fn discrepancy_mode(&self) -> DiscrepancyMode {
        DiscrepancyMode::from_flags(self.entropy, self.use_abs_diff)
    }
}

impl Default for AdaptationConfig {
    fn default() -> Self {
        Self {
            num_k: default_num_k(),
            entropy: false,
            use_abs_diff: false,
            second_head: SecondHead::default(),
        }
    }
}

/// Which head supplies the second target distribution in the adversarial
/// stages. `C1` runs C1 twice, relying on dropout to make the passes differ.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SecondHead {
    #[default]
    C1,
    C2,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_max_epoch")]
    pub max_epoch: usize,
    #[serde(default = "default_interval")]
    pub interval: usize,
    /// An epoch stops after processing a batch whose index exceeds this value.
    #[serde(default = "default_batch_index_limit")]
    pub batch_index_limit: Option<usize>,
    #[serde(default)]
    pub cpu: bool,
    #[serde(default)]
    pub record_dir: Option<PathBuf>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            max_epoch: default_max_epoch(),
            interval: default_interval(),
            batch_index_limit: default_batch_index_limit(),
            cpu: false,
            record_dir: None,
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_true")]
    pub enable_stdout: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enable_stdout: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_checkpoint_dir")]
    pub directory: PathBuf,
    #[serde(default = "default_save_epoch")]
    pub save_epoch: usize,
    #[serde(default)]
    pub save_model: bool,
    /// Restore G, C1 and C2 from `resume_epoch` and only evaluate.
    #[serde(default)]
    pub eval_only: bool,
    #[serde(default = "default_resume_epoch")]
    pub resume_epoch: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            directory: default_checkpoint_dir(),
            save_epoch: default_save_epoch(),
            save_model: false,
            eval_only: false,
            resume_epoch: default_resume_epoch(),
        }
    }
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_source() -> String {
    "svhn".to_string()
}

fn default_target() -> String {
    "mnist".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_batch_size() -> usize {
    128
}

fn default_subset_size() -> usize {
    25_000
}

fn default_learning_rate() -> f64 {
    2e-4
}

fn default_momentum() -> f64 {
    0.9
}

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.999
}

fn default_adam_eps() -> f64 {
    1e-8
}

fn default_num_k() -> usize {
    4
}

fn default_seed() -> u64 {
    1
}

fn default_max_epoch() -> usize {
    200
}

fn default_interval() -> usize {
    100
}

fn default_batch_index_limit() -> Option<usize> {
    Some(100)
}

fn default_true() -> bool {
    true
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("checkpoint")
}

fn default_save_epoch() -> usize {
    10
}

fn default_resume_epoch() -> usize {
    100
}

#[derive(Debug)]
pub enum TrainingError {
    Io(std::io::Error),
    ConfigFormat(String),
    Validation(Vec<String>),
    Initialization(String),
    Runtime(String),
    EmptyDataset(String),
}

impl TrainingError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }

    pub fn empty_dataset(message: impl Into<String>) -> Self {
        Self::EmptyDataset(message.into())
    }
}

impl fmt::Display for TrainingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainingError::Io(err) => write!(f, "i/o error: {}", err),
            TrainingError::ConfigFormat(err) => write!(f, "failed to parse config: {}", err),
            TrainingError::Validation(messages) => {
                write!(f, "invalid configuration: {}", messages.join("; "))
            }
            TrainingError::Initialization(msg) => {
                write!(f, "solver initialization failed: {}", msg)
            }
            TrainingError::Runtime(msg) => write!(f, "training failed: {}", msg),
            TrainingError::EmptyDataset(msg) => write!(f, "empty dataset: {}", msg),
        }
    }
}

impl std::error::Error for TrainingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TrainingError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TrainingError {
    fn from(value: std::io::Error) -> Self {
        TrainingError::Io(value)
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<candle_core::Error> for TrainingError {
    fn from(value: candle_core::Error) -> Self {
        TrainingError::Runtime(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_hyperparameters() {
        let config = SolverConfig::default();
        assert_eq!(config.data.batch_size, 128);
        assert!(config.data.scale());
        assert_eq!(config.optimizer.kind, OptimizerType::Adam);
        assert_eq!(config.adaptation.num_k, 4);
        assert_eq!(config.runtime.batch_index_limit, Some(100));
        assert_eq!(config.adaptation.discrepancy_mode(), DiscrepancyMode::SymmetricKl);
        config.validate().unwrap();
    }

    #[test]
    fn unknown_optimizer_kind_is_a_format_error() {
        let err = toml::from_str::<SolverConfig>("[optimizer]\nkind = \"rmsprop\"\n")
            .map_err(TrainingError::from)
            .unwrap_err();
        assert!(matches!(err, TrainingError::ConfigFormat(_)));
    }

    #[test]
    fn validation_collects_every_problem() {
        let mut config = SolverConfig::default();
        config.data.batch_size = 0;
        config.adaptation.num_k = 0;
        config.checkpoint.save_epoch = 0;

        match config.validate() {
            Err(TrainingError::Validation(messages)) => assert_eq!(messages.len(), 3),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn scale_follows_source_unless_overridden() {
        let mut data = DataConfig {
            source: "usps".into(),
            ..DataConfig::default()
        };
        assert!(!data.scale());
        data.scale = Some(true);
        assert!(data.scale());
        data.all_use = true;
        assert_eq!(data.sample_limit(), None);
    }
}

//! Experiment configuration loaded from YAML or JSON

use crate::error::{Error, Result};
use crate::trainer::{DEFAULT_MAX_DECODE_STEPS, TrainingConfig};
use crate::transition::TransitionConfig;
use crate::vocab::SentenceEncoder;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Everything needed to build and train a decoder from a dataset.
///
/// Every section is optional in the file; missing keys take their defaults.
///
/// ```yaml
/// model:
///   embed_dim: 32
///   hidden_dim: 64
///   feed_attention: true
/// decoding:
///   max_steps: 40
/// training:
///   learning_rate: 0.5
///   epochs: 20
///   batch_size: 10
///   max_grad_norm: 5.0
///   warmup_epochs: 2
///   cosine_cycles: 1
///   patience: 5
/// vocab:
///   min_freq: 2
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    #[serde(default)]
    pub model: TransitionConfig,
    #[serde(default)]
    pub decoding: DecodingConfig,
    #[serde(default)]
    pub training: TrainingConfig,
    #[serde(default)]
    pub vocab: VocabConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodingConfig {
    /// Step limit for free-running decoding
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
}

impl Default for DecodingConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
        }
    }
}

fn default_max_steps() -> usize {
    DEFAULT_MAX_DECODE_STEPS
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VocabConfig {
    /// Tokens seen fewer times in training are rare
    #[serde(default)]
    pub min_freq: usize,
    /// Prepend `@START@` to input sentences
    #[serde(default)]
    pub inp_start_token: bool,
    /// Append `@END@` to gold outputs
    #[serde(default = "default_true")]
    pub out_end_token: bool,
}

impl Default for VocabConfig {
    fn default() -> Self {
        Self {
            min_freq: 0,
            inp_start_token: false,
            out_end_token: true,
        }
    }
}

fn default_true() -> bool {
    true
}

impl VocabConfig {
    /// Fresh (unbuilt) input and output encoders with these settings.
    pub fn encoders(&self) -> (SentenceEncoder, SentenceEncoder) {
        (
            SentenceEncoder::new().with_start_token(self.inp_start_token),
            SentenceEncoder::new().with_end_token(self.out_end_token),
        )
    }
}

impl ExperimentConfig {
    pub fn validate(&self) -> Result<()> {
        self.model.validate()?;
        self.training.validate()?;
        if self.decoding.max_steps == 0 {
            return Err(Error::ConfigError {
                reason: "decoding.max_steps must be positive".to_string(),
            });
        }
        Ok(())
    }

    pub fn load_yaml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = read(path.as_ref())?;
        let config: Self = serde_yaml::from_str(&content).map_err(|e| Error::ConfigError {
            reason: format!("YAML parse error: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = read(path.as_ref())?;
        let config: Self = serde_json::from_str(&content).map_err(|e| Error::ConfigError {
            reason: format!("JSON parse error: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }
}

fn read(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| Error::ConfigError {
        reason: format!("cannot read {}: {e}", path.display()),
    })
}

//! Training configuration and metrics

use crate::error::{Error, Result};
use crate::eval::SeqAccuracies;
use crate::optimizer::LrSchedule;
use serde::{Deserialize, Serialize};

/// Training configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub learning_rate: f64,
    pub epochs: usize,
    pub batch_size: usize,
    /// Global gradient norm limit; `None` disables clipping
    pub max_grad_norm: Option<f64>,
    /// Epochs of linear learning-rate warmup
    pub warmup_epochs: u64,
    /// Cosine decay over the remaining epochs, restarting this many times
    pub cosine_cycles: Option<u32>,
    /// Floor of the cosine decay
    pub min_lr: f64,
    /// Stop after this many epochs without validation improvement
    pub patience: Option<usize>,
    /// Seed for the per-epoch shuffle of the training split
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.1,
            epochs: 10,
            batch_size: 16,
            max_grad_norm: Some(5.0),
            warmup_epochs: 0,
            cosine_cycles: None,
            min_lr: 0.0,
            patience: None,
            seed: 42,
        }
    }
}

impl TrainingConfig {
    pub fn with_lr(mut self, lr: f64) -> Self {
        self.learning_rate = lr;
        self
    }

    pub fn with_epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_max_grad_norm(mut self, norm: Option<f64>) -> Self {
        self.max_grad_norm = norm;
        self
    }

    pub fn with_warmup_epochs(mut self, epochs: u64) -> Self {
        self.warmup_epochs = epochs;
        self
    }

    pub fn with_cosine_cycles(mut self, cycles: Option<u32>) -> Self {
        self.cosine_cycles = cycles;
        self
    }

    pub fn with_min_lr(mut self, lr: f64) -> Self {
        self.min_lr = lr;
        self
    }

    pub fn with_patience(mut self, patience: Option<usize>) -> Self {
        self.patience = patience;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Per-epoch learning rate schedule described by this config.
    pub fn lr_schedule(&self) -> LrSchedule {
        let base_lr = self.learning_rate;
        match self.cosine_cycles {
            Some(cycles) => LrSchedule::CosineHardRestarts {
                base_lr,
                min_lr: self.min_lr,
                warmup_steps: self.warmup_epochs,
                total_steps: self.epochs as u64,
                cycles,
            },
            None if self.warmup_epochs > 0 => LrSchedule::LinearWarmup {
                base_lr,
                warmup_steps: self.warmup_epochs,
            },
            None => LrSchedule::Constant { lr: base_lr },
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::ConfigError {
                reason: "batch_size must be positive".to_string(),
            });
        }
        if self.epochs == 0 {
            return Err(Error::ConfigError {
                reason: "epochs must be positive".to_string(),
            });
        }
        if let Some(norm) = self.max_grad_norm {
            if norm <= 0.0 {
                return Err(Error::ConfigError {
                    reason: format!("max_grad_norm must be positive, got {norm}"),
                });
            }
        }
        if self.patience == Some(0) {
            return Err(Error::ConfigError {
                reason: "patience must be at least 1".to_string(),
            });
        }
        self.lr_schedule().validate()
    }
}

/// Metrics from one optimizer step
#[derive(Debug, Clone)]
pub struct TrainingMetrics {
    pub epoch: usize,
    pub step: u64,
    pub loss: f64,
    pub grad_norm: Option<f64>,
    pub lr: f64,
}

/// What one epoch produced; handed to every hook's `on_epoch_end`.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochSummary {
    pub epoch: usize,
    /// Mean teacher-forced loss over training batches
    pub train_loss: f64,
    /// Mean free-running loss over validation batches, if a validation split exists
    pub valid_loss: Option<f64>,
    pub valid_accuracies: Option<SeqAccuracies>,
    /// Learning rate used during the epoch
    pub lr: f64,
}

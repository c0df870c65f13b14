//! Learning rate schedules

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Learning rate as a function of a step counter.
///
/// The counter is whatever the caller advances: the trainer's schedule hook
/// uses epochs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LrSchedule {
    Constant { lr: f64 },
    /// Linear ramp from 0 to `base_lr`, then constant
    LinearWarmup { base_lr: f64, warmup_steps: u64 },
    /// Linear warmup, then one cosine decay from `base_lr` to `min_lr`
    CosineAnnealing {
        base_lr: f64,
        min_lr: f64,
        warmup_steps: u64,
        total_steps: u64,
    },
    /// Linear warmup, then `cycles` cosine decays, each restarting at `base_lr`
    CosineHardRestarts {
        base_lr: f64,
        min_lr: f64,
        warmup_steps: u64,
        total_steps: u64,
        cycles: u32,
    },
}

impl LrSchedule {
    pub fn get_lr(&self, step: u64) -> f64 {
        match *self {
            LrSchedule::Constant { lr } => lr,

            LrSchedule::LinearWarmup {
                base_lr,
                warmup_steps,
            } => warmup(base_lr, step, warmup_steps).unwrap_or(base_lr),

            LrSchedule::CosineAnnealing {
                base_lr,
                min_lr,
                warmup_steps,
                total_steps,
            } => {
                if let Some(lr) = warmup(base_lr, step, warmup_steps) {
                    return lr;
                }
                match decay_progress(step, warmup_steps, total_steps) {
                    Some(p) => cosine(base_lr, min_lr, p),
                    None => min_lr,
                }
            }

            LrSchedule::CosineHardRestarts {
                base_lr,
                min_lr,
                warmup_steps,
                total_steps,
                cycles,
            } => {
                if let Some(lr) = warmup(base_lr, step, warmup_steps) {
                    return lr;
                }
                match decay_progress(step, warmup_steps, total_steps) {
                    Some(p) => cosine(base_lr, min_lr, (cycles.max(1) as f64 * p).fract()),
                    None => min_lr,
                }
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        let (base, min, warm, total) = match *self {
            LrSchedule::Constant { lr } => (lr, 0.0, 0, 0),
            LrSchedule::LinearWarmup {
                base_lr,
                warmup_steps,
            } => (base_lr, 0.0, warmup_steps, warmup_steps),
            LrSchedule::CosineAnnealing {
                base_lr,
                min_lr,
                warmup_steps,
                total_steps,
            }
            | LrSchedule::CosineHardRestarts {
                base_lr,
                min_lr,
                warmup_steps,
                total_steps,
                ..
            } => (base_lr, min_lr, warmup_steps, total_steps),
        };
        if !(base.is_finite() && base >= 0.0 && min >= 0.0 && min <= base) {
            return Err(Error::ConfigError {
                reason: format!("learning rates must satisfy 0 <= min_lr <= base_lr, got {min} and {base}"),
            });
        }
        if warm > total {
            return Err(Error::ConfigError {
                reason: format!("warmup ({warm}) exceeds total steps ({total})"),
            });
        }
        Ok(())
    }
}

/// `Some(lr)` while still warming up.
fn warmup(base_lr: f64, step: u64, warmup_steps: u64) -> Option<f64> {
    (step < warmup_steps).then(|| base_lr * step as f64 / warmup_steps as f64)
}

/// Fraction of the decay phase elapsed, `None` once it is over.
fn decay_progress(step: u64, warmup_steps: u64, total_steps: u64) -> Option<f64> {
    if step >= total_steps {
        return None;
    }
    let span = (total_steps - warmup_steps) as f64;
    Some((step - warmup_steps) as f64 / span)
}

fn cosine(base_lr: f64, min_lr: f64, progress: f64) -> f64 {
    min_lr + (base_lr - min_lr) * 0.5 * (1.0 + (PI * progress).cos())
}

//! Training loop: configuration, hooks and the sequence trainer

pub mod config;
pub mod hooks;
pub mod seq;

pub use config::{EpochSummary, TrainingConfig, TrainingMetrics};
pub use hooks::{
    EarlyStoppingHook, GradClipHook, HookContext, HookSignal, LrScheduleHook, StopMetric,
    TrainingHook,
};
pub use seq::{DEFAULT_MAX_DECODE_STEPS, SeqTrainer};

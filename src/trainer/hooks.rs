//! Named extension points of the training loop

use crate::error::Result;
use crate::optimizer::{LrSchedule, clip_grad_norm};
use crate::trainer::config::EpochSummary;
use crate::transition::SeqClient;
use numr::autograd::GradStore;
use numr::dtype::DType;
use numr::runtime::Runtime;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Step-level context passed to [`TrainingHook::before_optimizer_step`].
///
/// Hooks may rewrite `lr` (it is handed to the optimizer after all hooks ran)
/// and record the gradient norm they measured.
pub struct HookContext<'a, R: Runtime> {
    pub client: &'a R::Client,
    pub epoch: usize,
    /// Optimizer steps taken before this one
    pub step: u64,
    pub lr: f64,
    pub grad_norm: Option<f64>,
}

/// Whether training continues after an epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookSignal {
    Continue,
    Stop,
}

/// Extension of the training loop.
///
/// Hooks run in the order they are passed to the trainer.
pub trait TrainingHook<R: Runtime<DType = DType>> {
    fn name(&self) -> &str;

    /// Inspect or rewrite gradients after backward, before the parameter update.
    fn before_optimizer_step(
        &mut self,
        _grads: &mut GradStore<R>,
        _ctx: &mut HookContext<'_, R>,
    ) -> Result<()> {
        Ok(())
    }

    fn on_epoch_end(&mut self, _summary: &EpochSummary) -> Result<HookSignal> {
        Ok(HookSignal::Continue)
    }
}

/// Clips gradients to a global L2 norm.
pub struct GradClipHook {
    max_norm: f64,
}

impl GradClipHook {
    pub fn new(max_norm: f64) -> Self {
        Self { max_norm }
    }
}

impl<R> TrainingHook<R> for GradClipHook
where
    R: Runtime<DType = DType>,
    R::Client: SeqClient<R>,
{
    fn name(&self) -> &str {
        "grad_clip"
    }

    fn before_optimizer_step(
        &mut self,
        grads: &mut GradStore<R>,
        ctx: &mut HookContext<'_, R>,
    ) -> Result<()> {
        let norm = clip_grad_norm(ctx.client, grads, self.max_norm)?;
        if norm > self.max_norm {
            debug!(step = ctx.step, norm, max_norm = self.max_norm, "clipped gradients");
        }
        ctx.grad_norm = Some(norm);
        Ok(())
    }
}

/// Sets the learning rate from a schedule indexed by epoch.
pub struct LrScheduleHook {
    schedule: LrSchedule,
}

impl LrScheduleHook {
    pub fn new(schedule: LrSchedule) -> Self {
        Self { schedule }
    }

    pub fn schedule(&self) -> &LrSchedule {
        &self.schedule
    }
}

impl<R: Runtime<DType = DType>> TrainingHook<R> for LrScheduleHook {
    fn name(&self) -> &str {
        "lr_schedule"
    }

    fn before_optimizer_step(
        &mut self,
        _grads: &mut GradStore<R>,
        ctx: &mut HookContext<'_, R>,
    ) -> Result<()> {
        ctx.lr = self.schedule.get_lr(ctx.epoch as u64);
        Ok(())
    }
}

/// Validation quantity watched by [`EarlyStoppingHook`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopMetric {
    /// Lower is better
    ValidLoss,
    ElementAccuracy,
    SequenceAccuracy,
}

impl StopMetric {
    fn read(self, summary: &EpochSummary) -> Option<f64> {
        match self {
            StopMetric::ValidLoss => summary.valid_loss,
            StopMetric::ElementAccuracy => summary.valid_accuracies.map(|a| a.element),
            StopMetric::SequenceAccuracy => summary.valid_accuracies.map(|a| a.sequence),
        }
    }

    fn improves(self, value: f64, best: f64) -> bool {
        match self {
            StopMetric::ValidLoss => value < best,
            _ => value > best,
        }
    }
}

/// Stops training once the watched metric has not improved for `patience` epochs.
///
/// Epochs without a validation result neither improve nor count against patience.
pub struct EarlyStoppingHook {
    metric: StopMetric,
    patience: usize,
    best: Option<f64>,
    best_epoch: Option<usize>,
    stale: usize,
}

impl EarlyStoppingHook {
    pub fn new(metric: StopMetric, patience: usize) -> Self {
        Self {
            metric,
            patience,
            best: None,
            best_epoch: None,
            stale: 0,
        }
    }

    pub fn best(&self) -> Option<f64> {
        self.best
    }

    pub fn best_epoch(&self) -> Option<usize> {
        self.best_epoch
    }
}

impl<R: Runtime<DType = DType>> TrainingHook<R> for EarlyStoppingHook {
    fn name(&self) -> &str {
        "early_stopping"
    }

    fn on_epoch_end(&mut self, summary: &EpochSummary) -> Result<HookSignal> {
        let Some(value) = self.metric.read(summary) else {
            return Ok(HookSignal::Continue);
        };
        match self.best {
            Some(best) if !self.metric.improves(value, best) => self.stale += 1,
            _ => {
                self.best = Some(value);
                self.best_epoch = Some(summary.epoch);
                self.stale = 0;
            }
        }
        if self.stale >= self.patience {
            info!(
                epoch = summary.epoch,
                best_epoch = ?self.best_epoch,
                best = ?self.best,
                "early stopping"
            );
            return Ok(HookSignal::Stop);
        }
        Ok(HookSignal::Continue)
    }
}

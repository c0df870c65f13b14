//! Optimizer trait abstraction

use crate::error::Result;
use numr::autograd::GradStore;
use numr::dtype::DType;
use numr::ops::{BinaryOps, ScalarOps};
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::{Tensor, TensorId};
use std::collections::HashMap;

/// Updates parameters from gradients.
///
/// Trainers only talk to this trait, so the update rule can be swapped
/// without touching the epoch loop.
pub trait Optimizer<R: Runtime<DType = DType>> {
    /// Apply one update to every parameter in `params` that has a gradient
    /// in `grads`. Parameters without gradients are left alone.
    fn step<C>(
        &mut self,
        client: &C,
        params: &mut HashMap<TensorId, Tensor<R>>,
        grads: &GradStore<R>,
    ) -> Result<()>
    where
        C: RuntimeClient<R> + BinaryOps<R> + ScalarOps<R>;

    fn set_lr(&mut self, lr: f64);

    fn lr(&self) -> f64;

    /// Drop any per-parameter state.
    fn reset(&mut self);
}

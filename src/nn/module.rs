//! Parameter access for trainable components

use numr::autograd::Var;
use numr::runtime::Runtime;
use numr::tensor::{Tensor, TensorId};
use std::collections::HashMap;

/// Anything holding trainable parameters.
///
/// Optimizers work on a `TensorId -> Tensor` map; [`Parameterized::parameter_map`]
/// exports it and [`Parameterized::load_parameters`] swaps updated tensors back
/// in under the same ids, so gradients computed on the next forward pass land
/// on the same keys.
pub trait Parameterized<R: Runtime> {
    /// Named parameters. Nested components use dot notation: `"cell.weight"`.
    fn named_parameters(&self) -> Vec<(String, &Var<R>)>;

    /// Replace parameter values by id. Ids missing from `params` are left alone.
    fn load_parameters(&mut self, params: &HashMap<TensorId, Tensor<R>>);

    fn parameters(&self) -> Vec<&Var<R>> {
        self.named_parameters().into_iter().map(|(_, v)| v).collect()
    }

    /// Trainable parameters keyed by their var id.
    fn parameter_map(&self) -> HashMap<TensorId, Tensor<R>> {
        self.parameters()
            .into_iter()
            .filter(|v| v.requires_grad())
            .map(|v| (v.id(), v.tensor().clone()))
            .collect()
    }

    /// Total number of scalar parameters.
    fn num_parameters(&self) -> usize {
        self.parameters().iter().map(|v| v.tensor().numel()).sum()
    }
}

/// Prefix every name of a nested component.
pub(crate) fn prefixed<'a, R: Runtime>(
    prefix: &str,
    params: Vec<(String, &'a Var<R>)>,
) -> Vec<(String, &'a Var<R>)> {
    params
        .into_iter()
        .map(|(name, v)| (format!("{prefix}.{name}"), v))
        .collect()
}

/// Swap in a new value for `var`, keeping its id and grad tracking.
pub(crate) fn reload<R: Runtime>(var: &mut Var<R>, params: &HashMap<TensorId, Tensor<R>>) {
    let id = var.id();
    if let Some(t) = params.get(&id) {
        *var = Var::with_id(t.clone(), id, var.requires_grad());
    }
}

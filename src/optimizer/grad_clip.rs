//! Global-norm gradient clipping

use crate::error::{Error, Result};
use numr::autograd::GradStore;
use numr::dtype::DType;
use numr::ops::{BinaryOps, ReduceOps, ScalarOps};
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::TensorId;

/// Global L2 norm over every gradient in the store.
pub fn grad_norm<R, C>(client: &C, grads: &GradStore<R>) -> Result<f64>
where
    R: Runtime<DType = DType>,
    C: RuntimeClient<R> + ReduceOps<R> + BinaryOps<R>,
{
    let mut sq_total = 0.0f64;
    for id in grads.keys() {
        let Some(grad) = grads.get(*id) else {
            continue;
        };
        if grad.numel() == 0 {
            continue;
        }
        let flat = grad.contiguous().reshape(&[grad.numel()])?;
        let sq = client.mul(&flat, &flat)?;
        let sum = client.sum(&sq, &[0], false)?;
        sq_total += sum.to_vec::<f32>()[0] as f64;
    }
    Ok(sq_total.sqrt())
}

/// Rescale gradients in place so their global norm is at most `max_norm`.
///
/// Returns the norm measured before clipping.
pub fn clip_grad_norm<R, C>(client: &C, grads: &mut GradStore<R>, max_norm: f64) -> Result<f64>
where
    R: Runtime<DType = DType>,
    C: RuntimeClient<R> + ReduceOps<R> + ScalarOps<R> + BinaryOps<R>,
{
    if max_norm <= 0.0 {
        return Err(Error::TrainingError {
            reason: format!("max_norm must be positive, got {max_norm}"),
        });
    }

    let total = grad_norm(client, grads)?;
    if total > max_norm {
        let scale = max_norm / (total + 1e-6);
        let ids: Vec<TensorId> = grads.keys().copied().collect();
        for id in ids {
            if let Some(grad) = grads.get(id) {
                let clipped = client.mul_scalar(grad, scale)?;
                grads.insert(id, clipped);
            }
        }
    }
    Ok(total)
}

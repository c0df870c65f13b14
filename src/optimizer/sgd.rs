//! Stochastic gradient descent

use crate::error::{Error, Result};
use crate::optimizer::traits::Optimizer;
use numr::autograd::GradStore;
use numr::dtype::DType;
use numr::ops::{BinaryOps, ScalarOps};
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::{Tensor, TensorId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::marker::PhantomData;

/// SGD configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SgdConfig {
    pub lr: f64,
    /// L2 penalty folded into the gradient: `grad + weight_decay * param`
    #[serde(default)]
    pub weight_decay: f64,
}

impl Default for SgdConfig {
    fn default() -> Self {
        Self {
            lr: 0.1,
            weight_decay: 0.0,
        }
    }
}

/// Plain SGD: `param = param - lr * (grad + weight_decay * param)`
pub struct Sgd<R: Runtime> {
    config: SgdConfig,
    _runtime: PhantomData<R>,
}

impl<R: Runtime<DType = DType>> Sgd<R> {
    pub fn new(config: SgdConfig) -> Result<Self> {
        if !(config.lr.is_finite() && config.lr >= 0.0) {
            return Err(Error::InvalidArgument {
                arg: "lr",
                reason: format!("must be finite and non-negative, got {}", config.lr),
            });
        }
        Ok(Self {
            config,
            _runtime: PhantomData,
        })
    }

    pub fn config(&self) -> &SgdConfig {
        &self.config
    }
}

impl<R: Runtime<DType = DType>> Optimizer<R> for Sgd<R> {
    fn step<C>(
        &mut self,
        client: &C,
        params: &mut HashMap<TensorId, Tensor<R>>,
        grads: &GradStore<R>,
    ) -> Result<()>
    where
        C: RuntimeClient<R> + BinaryOps<R> + ScalarOps<R>,
    {
        let lr = self.config.lr;
        let wd = self.config.weight_decay;

        for (id, param) in params.iter_mut() {
            let Some(grad) = grads.get(*id) else {
                continue;
            };
            if grad.shape() != param.shape() {
                return Err(Error::TrainingError {
                    reason: format!(
                        "gradient shape {:?} does not match parameter shape {:?}",
                        grad.shape(),
                        param.shape()
                    ),
                });
            }

            let grad = if wd != 0.0 {
                let decay = client.mul_scalar(param, wd)?;
                client.add(grad, &decay)?
            } else {
                grad.clone()
            };
            let update = client.mul_scalar(&grad, lr)?;
            *param = client.sub(param, &update)?;
        }
        Ok(())
    }

    fn set_lr(&mut self, lr: f64) {
        self.config.lr = lr;
    }

    fn lr(&self) -> f64 {
        self.config.lr
    }

    fn reset(&mut self) {}
}

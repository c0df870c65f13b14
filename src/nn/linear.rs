//! Dense linear layer

use super::init::{Init, SplitMix64};
use super::module::{Parameterized, reload};
use crate::error::{Error, Result};
use numr::autograd::{Var, var_add, var_matmul, var_reshape, var_transpose};
use numr::dtype::DType;
use numr::ops::TensorOps;
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::{Tensor, TensorId};
use std::collections::HashMap;

/// Dense linear layer: output = input @ weight^T + bias
///
/// weight: `[out_features, in_features]`, bias: `[out_features]`
pub struct Linear<R: Runtime> {
    weight: Var<R>,
    bias: Option<Var<R>>,
}

impl<R: Runtime<DType = DType>> Linear<R> {
    /// Create from existing tensors. `trainable` controls gradient tracking.
    pub fn new(weight: Tensor<R>, bias: Option<Tensor<R>>, trainable: bool) -> Self {
        Self {
            weight: Var::new(weight, trainable),
            bias: bias.map(|b| Var::new(b, trainable)),
        }
    }

    /// Trainable layer with PyTorch-style uniform weights and zero bias.
    pub fn init(
        in_features: usize,
        out_features: usize,
        bias: bool,
        rng: &mut SplitMix64,
        device: &R::Device,
    ) -> Self {
        let weight = Init::PyTorchLinear.tensor::<R>(&[out_features, in_features], rng, device);
        let bias = bias.then(|| Init::Zeros.tensor::<R>(&[out_features], rng, device));
        Self::new(weight, bias, true)
    }

    /// Forward: input @ weight^T + bias
    ///
    /// input: `[..., in_features]`, output: `[..., out_features]`
    ///
    /// Leading dims are folded into one before the matmul; a broadcast batched
    /// matmul would hand back a weight gradient with an extra batch dim.
    pub fn forward<C>(&self, client: &C, input: &Var<R>) -> Result<Var<R>>
    where
        C: RuntimeClient<R> + TensorOps<R>,
        R::Client: TensorOps<R>,
    {
        let shape = input.shape().to_vec();
        let flat = match shape.len() {
            0 | 1 => {
                return Err(Error::InvalidArgument {
                    arg: "input",
                    reason: format!("expected [..., {}], got {shape:?}", self.in_features()),
                });
            }
            2 => None,
            _ => {
                let rows: usize = shape[..shape.len() - 1].iter().product();
                Some(var_reshape(input, &[rows, shape[shape.len() - 1]]).map_err(Error::Numr)?)
            }
        };

        let w_t = var_transpose(&self.weight).map_err(Error::Numr)?;
        let output = var_matmul(flat.as_ref().unwrap_or(input), &w_t, client).map_err(Error::Numr)?;
        let output = match &self.bias {
            Some(bias) => var_add(&output, bias, client).map_err(Error::Numr)?,
            None => output,
        };
        if flat.is_none() {
            return Ok(output);
        }
        let mut out_shape = shape;
        if let Some(last) = out_shape.last_mut() {
            *last = self.out_features();
        }
        var_reshape(&output, &out_shape).map_err(Error::Numr)
    }

    pub fn weight(&self) -> &Var<R> {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Var<R>> {
        self.bias.as_ref()
    }

    pub fn in_features(&self) -> usize {
        self.weight.shape()[1]
    }

    pub fn out_features(&self) -> usize {
        self.weight.shape()[0]
    }
}

impl<R: Runtime> Parameterized<R> for Linear<R> {
    fn named_parameters(&self) -> Vec<(String, &Var<R>)> {
        let mut params = vec![("weight".to_string(), &self.weight)];
        if let Some(b) = &self.bias {
            params.push(("bias".to_string(), b));
        }
        params
    }

    fn load_parameters(&mut self, params: &HashMap<TensorId, Tensor<R>>) {
        reload(&mut self.weight, params);
        if let Some(b) = self.bias.as_mut() {
            reload(b, params);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::cpu_setup;
    use numr::autograd::{backward, var_sum};
    use numr::runtime::cpu::CpuRuntime;

    #[test]
    fn test_linear_with_bias() {
        let (client, device) = cpu_setup();
        let weight = Tensor::<CpuRuntime>::from_slice(&[1.0f32, 0.0, 0.0, 1.0], &[2, 2], &device);
        let bias = Tensor::<CpuRuntime>::from_slice(&[10.0f32, 20.0], &[2], &device);
        let linear = Linear::new(weight, Some(bias), false);

        let input = Var::new(
            Tensor::<CpuRuntime>::from_slice(&[1.0f32, 2.0], &[1, 2], &device),
            false,
        );
        let out = linear.forward(&client, &input).unwrap();
        let data: Vec<f32> = out.tensor().to_vec();
        // [1,2] @ I + [10,20]
        assert_eq!(data, vec![11.0, 22.0]);
    }

    #[test]
    fn test_linear_init_shapes() {
        let (client, device) = cpu_setup();
        let mut rng = SplitMix64::new(3);
        let linear = Linear::<CpuRuntime>::init(3, 5, true, &mut rng, &device);
        assert_eq!(linear.in_features(), 3);
        assert_eq!(linear.out_features(), 5);
        assert_eq!(linear.num_parameters(), 20);

        // [B, T, in] input, as used for encoder contexts
        let input = Var::new(
            Tensor::<CpuRuntime>::from_slice(&[0.1f32; 24], &[2, 4, 3], &device),
            false,
        );
        let out = linear.forward(&client, &input).unwrap();
        assert_eq!(out.shape(), &[2, 4, 5]);
    }

    #[test]
    fn test_batched_input_grads_match_parameter_shapes() {
        let (client, device) = cpu_setup();
        let linear = Linear::<CpuRuntime>::init(3, 5, true, &mut SplitMix64::new(1), &device);
        let input = Var::new(
            Tensor::<CpuRuntime>::from_slice(&[0.5f32; 24], &[2, 4, 3], &device),
            false,
        );

        let out = linear.forward(&client, &input).unwrap();
        let loss = var_sum(&out, &[0, 1, 2], false, &client).unwrap();
        let grads = backward(&loss, &client).unwrap();

        let gw = grads.get(linear.weight().id()).unwrap();
        assert_eq!(gw.shape(), &[5, 3]);
        // every weight sees 8 rows of 0.5
        assert!(gw.contiguous().to_vec::<f32>().iter().all(|g| (g - 4.0).abs() < 1e-5));
        let gb = grads.get(linear.bias().unwrap().id()).unwrap();
        assert_eq!(gb.shape(), &[5]);
    }

    #[test]
    fn test_rejects_vector_input() {
        let (client, device) = cpu_setup();
        let linear = Linear::<CpuRuntime>::init(2, 2, false, &mut SplitMix64::new(1), &device);
        let input = Var::new(Tensor::<CpuRuntime>::from_slice(&[1.0f32, 2.0], &[2], &device), false);
        assert!(linear.forward(&client, &input).is_err());
    }

    #[test]
    fn test_load_parameters_keeps_ids() {
        let (_client, device) = cpu_setup();
        let mut rng = SplitMix64::new(3);
        let mut linear = Linear::<CpuRuntime>::init(2, 1, false, &mut rng, &device);
        let id = linear.weight().id();

        let mut params = HashMap::new();
        params.insert(
            id,
            Tensor::<CpuRuntime>::from_slice(&[4.0f32, 5.0], &[1, 2], &device),
        );
        linear.load_parameters(&params);

        assert_eq!(linear.weight().id(), id);
        assert!(linear.weight().requires_grad());
        assert_eq!(linear.weight().tensor().to_vec::<f32>(), vec![4.0, 5.0]);
    }
}

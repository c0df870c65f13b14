//! Embedding layer: lookup table for token embeddings

use super::init::{Init, SplitMix64};
use super::module::{Parameterized, reload};
use crate::error::{Error, Result};
use numr::autograd::{Var, var_gather, var_reshape};
use numr::dtype::DType;
use numr::ops::IndexingOps;
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::{Tensor, TensorId};
use std::collections::HashMap;

/// Token embedding: maps integer indices to dense vectors.
///
/// weight: `[vocab_size, embed_dim]`
pub struct Embedding<R: Runtime> {
    weight: Var<R>,
}

impl<R: Runtime<DType = DType>> Embedding<R> {
    pub fn new(weight: Tensor<R>, trainable: bool) -> Self {
        Self {
            weight: Var::new(weight, trainable),
        }
    }

    /// Trainable table drawn from U(-1, 1).
    pub fn init(vocab_size: usize, embed_dim: usize, rng: &mut SplitMix64, device: &R::Device) -> Self {
        let weight = Init::PyTorchEmbedding.tensor::<R>(&[vocab_size, embed_dim], rng, device);
        Self::new(weight, true)
    }

    /// Lookup rows of the table.
    ///
    /// indices: `[...]` integer tensor, output: `[..., embed_dim]`
    pub fn forward<C>(&self, client: &C, indices: &Tensor<R>) -> Result<Var<R>>
    where
        C: RuntimeClient<R> + IndexingOps<R>,
        R::Client: IndexingOps<R>,
    {
        let idx_shape = indices.shape().to_vec();
        let embed_dim = self.embed_dim();
        let n: usize = idx_shape.iter().product();

        // gather along dim 0 needs [N, embed_dim] indices
        let flat_idx = indices.reshape(&[n]).map_err(Error::Numr)?;
        let expanded = flat_idx
            .unsqueeze(1)
            .map_err(Error::Numr)?
            .broadcast_to(&[n, embed_dim])
            .map_err(Error::Numr)?;

        let gathered = var_gather(&self.weight, 0, &expanded, client).map_err(Error::Numr)?;

        let mut out_shape = idx_shape;
        out_shape.push(embed_dim);
        var_reshape(&gathered, &out_shape).map_err(Error::Numr)
    }

    pub fn weight(&self) -> &Var<R> {
        &self.weight
    }

    pub fn vocab_size(&self) -> usize {
        self.weight.shape()[0]
    }

    pub fn embed_dim(&self) -> usize {
        self.weight.shape()[1]
    }
}

impl<R: Runtime> Parameterized<R> for Embedding<R> {
    fn named_parameters(&self) -> Vec<(String, &Var<R>)> {
        vec![("weight".to_string(), &self.weight)]
    }

    fn load_parameters(&mut self, params: &HashMap<TensorId, Tensor<R>>) {
        reload(&mut self.weight, params);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::cpu_setup;
    use numr::runtime::cpu::CpuRuntime;

    #[test]
    fn test_embedding_lookup() {
        let (client, device) = cpu_setup();
        #[rustfmt::skip]
        let weight = Tensor::<CpuRuntime>::from_slice(
            &[
                1.0f32, 2.0,   // token 0
                3.0, 4.0,      // token 1
                5.0, 6.0,      // token 2
            ],
            &[3, 2],
            &device,
        );
        let emb = Embedding::new(weight, false);

        let indices = Tensor::<CpuRuntime>::from_slice(&[2i64, 0], &[2], &device);
        let out = emb.forward(&client, &indices).unwrap();
        assert_eq!(out.shape(), &[2, 2]);
        assert_eq!(out.tensor().to_vec::<f32>(), vec![5.0, 6.0, 1.0, 2.0]);
    }

    #[test]
    fn test_embedding_batched_ids() {
        let (client, device) = cpu_setup();
        let emb = Embedding::<CpuRuntime>::init(5, 3, &mut SplitMix64::new(0), &device);

        let indices = Tensor::<CpuRuntime>::from_slice(&[0i64, 1, 4, 3], &[2, 2], &device);
        let out = emb.forward(&client, &indices).unwrap();
        assert_eq!(out.shape(), &[2, 2, 3]);
        assert_eq!(emb.num_parameters(), 15);
    }
}

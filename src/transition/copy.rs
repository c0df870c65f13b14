//! Pointer-generator output head over the recurrent model

use super::recurrent::{RecurrentTransition, TransitionConfig};
use super::{ScoreKind, SeqClient, TransitionModel};
use crate::error::{Error, Result};
use crate::nn::module::prefixed;
use crate::nn::{Linear, Parameterized, SplitMix64};
use crate::state::{DecoderState, share};
use crate::vocab::TokenEncoder;
use numr::autograd::{
    Var, var_add, var_matmul, var_mul, var_neg, var_reshape, var_sigmoid, var_softmax,
};
use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::{Tensor, TensorId};
use std::collections::HashMap;

// mstate cache key
const COPY_MAP: &str = "copy_map";

/// Recurrent model whose output distribution mixes generation and copying.
///
/// Every step computes
/// `p = g * softmax(W f) + (1 - g) * a M`, where `f` are the step features,
/// `g = sigmoid(w_g f + b_g)` is the generation gate, `a` the attention weights
/// over the input and `M` a one-hot `[Ti, V]` map from each input position to
/// the output id of its token. Input tokens the output vocabulary lacks map to
/// the unknown id. Scores are probabilities.
pub struct CopyTransition<R: Runtime> {
    base: RecurrentTransition<R>,
    gate: Linear<R>,
    copy_ids: Vec<i64>,
}

impl<R: Runtime<DType = DType>> CopyTransition<R> {
    pub fn for_encoders(
        config: TransitionConfig,
        inp: &dyn TokenEncoder,
        out: &dyn TokenEncoder,
        device: &R::Device,
    ) -> Result<Self> {
        if !config.attention {
            return Err(Error::ConfigError {
                reason: "copying requires attention".to_string(),
            });
        }
        let seed = config.seed.wrapping_add(1);
        let base = RecurrentTransition::for_encoders(config, inp, out, device)?;
        let mut rng = SplitMix64::new(seed);
        let gate = Linear::init(base.feature_dim(), 1, true, &mut rng, device);
        Ok(Self {
            base,
            gate,
            copy_ids: copy_ids(inp, out),
        })
    }

    pub fn config(&self) -> &TransitionConfig {
        self.base.config()
    }

    /// Output id reached by copying each input id.
    pub fn copy_ids(&self) -> &[i64] {
        &self.copy_ids
    }

    pub fn gate(&self) -> &Linear<R> {
        &self.gate
    }

    /// One-hot `[B, Ti, V]` map from input positions to output ids. Padding rows are zero.
    fn copy_map(&self, state: &DecoderState<R>, vocab: usize) -> Result<Tensor<R>> {
        let inp = state.inp_tensor()?.tensor();
        let pad = state.inp_encoder().pad_id();
        let unk = state.out_encoder().unk_id();
        let (b, t) = (inp.shape()[0], inp.shape()[1]);

        let mut map = vec![0.0f32; b * t * vocab];
        for (pos, id) in inp.contiguous().to_vec::<i64>().into_iter().enumerate() {
            if id == pad {
                continue;
            }
            let target = usize::try_from(id)
                .ok()
                .and_then(|i| self.copy_ids.get(i).copied())
                .unwrap_or(unk);
            let slot = usize::try_from(target)
                .ok()
                .filter(|&t| t < vocab)
                .ok_or_else(|| Error::InvalidArgument {
                    arg: "inp_tensor",
                    reason: format!("input id {id} maps to output id {target}, vocab size {vocab}"),
                })?;
            map[pos * vocab + slot] = 1.0;
        }
        Ok(Tensor::<R>::from_slice(&map, &[b, t, vocab], inp.device()))
    }
}

impl<R: Runtime<DType = DType>> TransitionModel<R> for CopyTransition<R> {
    fn score_kind(&self) -> ScoreKind {
        ScoreKind::Probs
    }

    fn apply<C>(&self, client: &C, state: &mut DecoderState<R>) -> Result<Var<R>>
    where
        C: SeqClient<R>,
        R::Client: SeqClient<R>,
    {
        let step = self.base.step_features(client, state)?;
        let attention = step.attention.ok_or_else(|| Error::ConfigError {
            reason: "copying requires attention".to_string(),
        })?;

        let logits = self.base.logits(client, &step.features)?;
        let (b, v) = (logits.shape()[0], logits.shape()[1]);
        let generated = var_softmax(&logits, -1, client).map_err(Error::Numr)?;

        if !state.mstate()?.contains(COPY_MAP) {
            let map = self.copy_map(state, v)?;
            state.mstate_mut()?.set(COPY_MAP, Var::new(map, false))?;
        }
        let map = share(state.mstate()?.tensor(COPY_MAP)?);
        let copied = var_matmul(&attention, &map, client).map_err(Error::Numr)?;
        let copied = var_reshape(&copied, &[b, v]).map_err(Error::Numr)?;

        // sigmoid(-z) == 1 - sigmoid(z)
        let z = self.gate.forward(client, &step.features)?;
        let p_gen = var_sigmoid(&z, client).map_err(Error::Numr)?;
        let p_copy = var_sigmoid(&var_neg(&z, client).map_err(Error::Numr)?, client)
            .map_err(Error::Numr)?;

        let generated = var_mul(&generated, &p_gen, client).map_err(Error::Numr)?;
        let copied = var_mul(&copied, &p_copy, client).map_err(Error::Numr)?;
        var_add(&generated, &copied, client).map_err(Error::Numr)
    }
}

impl<R: Runtime> Parameterized<R> for CopyTransition<R> {
    fn named_parameters(&self) -> Vec<(String, &Var<R>)> {
        let mut params = self.base.named_parameters();
        params.extend(prefixed("gate", self.gate.named_parameters()));
        params
    }

    fn load_parameters(&mut self, params: &HashMap<TensorId, Tensor<R>>) {
        self.base.load_parameters(params);
        self.gate.load_parameters(params);
    }
}

/// For every input id, the output id of the same token (unknown id when the
/// output vocabulary lacks it).
pub fn copy_ids(inp: &dyn TokenEncoder, out: &dyn TokenEncoder) -> Vec<i64> {
    (0..inp.vocab_size() as i64)
        .map(|id| match inp.token(id) {
            Some(token) => out.token_id(token),
            None => out.unk_id(),
        })
        .collect()
}

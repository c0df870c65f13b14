//! Transition models: score the next action for every example in a decoder state

mod copy;
mod recurrent;

pub use copy::{CopyTransition, copy_ids};
pub use recurrent::{RecurrentTransition, TransitionConfig};

use crate::error::{Error, Result};
use crate::state::{DecoderState, share};
use numr::autograd::{Var, var_log, var_log_softmax};
use numr::dtype::DType;
use numr::ops::{
    ActivationOps, BinaryOps, IndexingOps, ReduceOps, ScalarOps, ShapeOps, TensorOps, UnaryOps,
};
use numr::runtime::{Runtime, RuntimeClient};
use serde::{Deserialize, Serialize};

/// Trait alias for the client bounds needed by transition models, losses and drivers.
pub trait SeqClient<R: Runtime>:
    RuntimeClient<R>
    + TensorOps<R>
    + ScalarOps<R>
    + ReduceOps<R>
    + IndexingOps<R>
    + ShapeOps<R>
    + ActivationOps<R>
    + BinaryOps<R>
    + UnaryOps<R>
{
}

impl<R, C> SeqClient<R> for C
where
    R: Runtime,
    C: RuntimeClient<R>
        + TensorOps<R>
        + ScalarOps<R>
        + ReduceOps<R>
        + IndexingOps<R>
        + ShapeOps<R>
        + ActivationOps<R>
        + BinaryOps<R>
        + UnaryOps<R>,
{
}

/// What the numbers in a score tensor mean.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreKind {
    /// Unnormalized scores
    Logits,
    /// Log-probabilities
    LogProbs,
    /// Probabilities
    Probs,
}

impl ScoreKind {
    /// Convert `scores` of this kind to log-probabilities over the last dim.
    pub fn to_log_probs<R, C>(self, client: &C, scores: &Var<R>) -> Result<Var<R>>
    where
        R: Runtime<DType = DType>,
        C: SeqClient<R>,
        R::Client: SeqClient<R>,
    {
        match self {
            ScoreKind::LogProbs => Ok(share(scores)),
            ScoreKind::Logits => var_log_softmax(scores, -1, client).map_err(Error::Numr),
            ScoreKind::Probs => var_log(scores, client).map_err(Error::Numr),
        }
    }
}

/// A model that, given a decoder state, scores every possible next action.
///
/// `apply` returns `[B, V]` scores (V = output vocabulary size) of kind
/// [`TransitionModel::score_kind`]. The model may read any field of the state
/// but writes only to the state's `mstate` cache; gold data and decoding
/// bookkeeping are out of its reach.
pub trait TransitionModel<R: Runtime<DType = DType>> {
    fn score_kind(&self) -> ScoreKind;

    fn apply<C>(&self, client: &C, state: &mut DecoderState<R>) -> Result<Var<R>>
    where
        C: SeqClient<R>,
        R::Client: SeqClient<R>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::cpu_setup;
    use numr::autograd::{backward, var_sum};
    use numr::runtime::cpu::CpuRuntime;
    use numr::tensor::Tensor;

    #[test]
    fn test_logits_to_log_probs_normalize() {
        let (client, device) = cpu_setup();
        let logits = Var::new(
            Tensor::<CpuRuntime>::from_slice(&[1.0f32, 2.0, 3.0], &[1, 3], &device),
            false,
        );
        let lp = ScoreKind::Logits.to_log_probs(&client, &logits).unwrap();
        let total: f32 = lp.tensor().to_vec::<f32>().iter().map(|v| v.exp()).sum();
        assert!((total - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_probs_to_log_probs() {
        let (client, device) = cpu_setup();
        let probs = Var::new(
            Tensor::<CpuRuntime>::from_slice(&[0.25f32, 0.75], &[1, 2], &device),
            false,
        );
        let lp = ScoreKind::Probs.to_log_probs(&client, &probs).unwrap();
        let data = lp.tensor().to_vec::<f32>();
        assert!((data[0] - 0.25f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn test_log_probs_pass_through_keeps_gradient_path() {
        let (client, device) = cpu_setup();
        let scores = Var::new(
            Tensor::<CpuRuntime>::from_slice(&[0.5f32.ln(), 0.5f32.ln()], &[1, 2], &device),
            true,
        );
        let lp = ScoreKind::LogProbs.to_log_probs(&client, &scores).unwrap();
        assert_eq!(lp.id(), scores.id());

        let loss = var_sum(&lp, &[0, 1], false, &client).unwrap();
        let grads = backward(&loss, &client).unwrap();
        assert!(grads.get(scores.id()).is_some());
    }

    #[test]
    fn test_score_kind_serde_names() {
        let kind: ScoreKind = serde_json::from_str("\"log_probs\"").unwrap();
        assert_eq!(kind, ScoreKind::LogProbs);
    }
}

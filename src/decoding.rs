//! Decoding drivers: run a transition model step by step over a decoder state

use crate::error::{Error, Result};
use crate::state::{Action, DecoderState};
use crate::transition::{SeqClient, TransitionModel};
use numr::autograd::{Var, var_cat, var_reshape};
use numr::dtype::DType;
use numr::runtime::Runtime;
use serde::{Deserialize, Serialize};

/// How the next action is chosen at every step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodePolicy {
    /// Follow the gold sequence; runs exactly as many steps as the longest gold row
    TeacherForcing,
    /// Follow the model's best-scoring action until every example terminates
    /// or `max_steps` is reached
    FreeRunning { max_steps: usize },
}

/// Result of one decoding run.
pub struct DecodeOutput<R: Runtime> {
    /// Step scores stacked along dim 1: `[B, T, V]`
    pub scores: Var<R>,
    /// Best-scoring id per example and step, `B` rows of length `T`
    pub predictions: Vec<Vec<i64>>,
    /// Number of steps taken (`T`)
    pub steps: usize,
}

/// Drives a [`TransitionModel`] over a [`DecoderState`].
pub struct SeqDecoder<M> {
    model: M,
    policy: DecodePolicy,
}

impl<M> SeqDecoder<M> {
    pub fn new(model: M, policy: DecodePolicy) -> Self {
        Self { model, policy }
    }

    pub fn with_policy(mut self, policy: DecodePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn set_policy(&mut self, policy: DecodePolicy) {
        self.policy = policy;
    }

    pub fn policy(&self) -> DecodePolicy {
        self.policy
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }

    /// Start decoding `state` and run it to completion under the current policy.
    ///
    /// On return the state holds the full action history. Scores keep their
    /// autograd graph, so a loss over them can be backpropagated.
    pub fn decode<R, C>(&self, client: &C, state: &mut DecoderState<R>) -> Result<DecodeOutput<R>>
    where
        R: Runtime<DType = DType>,
        C: SeqClient<R>,
        R::Client: SeqClient<R>,
        M: TransitionModel<R>,
    {
        state.start_decoding()?;
        let limit = match self.policy {
            DecodePolicy::TeacherForcing => state.gold_len()?,
            DecodePolicy::FreeRunning { max_steps } => {
                if max_steps == 0 {
                    return Err(Error::InvalidArgument {
                        arg: "max_steps",
                        reason: "free-running decoding needs at least one step".to_string(),
                    });
                }
                max_steps
            }
        };

        let b = state.batch_size();
        let mut step_scores: Vec<Var<R>> = Vec::with_capacity(limit);
        let mut predictions: Vec<Vec<i64>> = vec![Vec::with_capacity(limit); b];

        for t in 0..limit {
            if matches!(self.policy, DecodePolicy::FreeRunning { .. }) && state.all_terminated() {
                break;
            }

            let scores = self.model.apply(client, state)?;
            let best = argmax_rows(&scores)?;
            for (row, id) in predictions.iter_mut().zip(&best) {
                row.push(*id);
            }

            let terminated = state.is_terminated()?;
            let chosen = match self.policy {
                DecodePolicy::TeacherForcing => state.gold_at(t)?,
                DecodePolicy::FreeRunning { .. } => best,
            };
            let actions: Vec<Action> = chosen
                .into_iter()
                .zip(terminated)
                .map(|(id, done)| if done { Action::Terminated } else { Action::Id(id) })
                .collect();
            state.step(&actions)?;

            let v = scores.shape()[1];
            step_scores.push(var_reshape(&scores, &[b, 1, v]).map_err(Error::Numr)?);
        }

        let steps = step_scores.len();
        let scores = match step_scores.len() {
            0 => {
                return Err(Error::InvalidArgument {
                    arg: "state",
                    reason: "decoding finished without taking a step".to_string(),
                });
            }
            1 => step_scores.remove(0),
            _ => {
                let refs: Vec<&Var<R>> = step_scores.iter().collect();
                var_cat(&refs, 1, client).map_err(Error::Numr)?
            }
        };

        Ok(DecodeOutput {
            scores,
            predictions,
            steps,
        })
    }
}

/// Index of the highest score in every row of a `[B, V]` float tensor.
fn argmax_rows<R: Runtime<DType = DType>>(scores: &Var<R>) -> Result<Vec<i64>> {
    let shape = scores.shape();
    if shape.len() != 2 || shape[1] == 0 {
        return Err(Error::InvalidArgument {
            arg: "scores",
            reason: format!("expected [B, V] step scores, got {shape:?}"),
        });
    }
    let tensor = scores.tensor().contiguous();
    let data: Vec<f64> = match tensor.dtype() {
        DType::F32 => tensor.to_vec::<f32>().into_iter().map(f64::from).collect(),
        DType::F64 => tensor.to_vec::<f64>(),
        other => {
            return Err(Error::InvalidArgument {
                arg: "scores",
                reason: format!("expected F32 or F64 step scores, got {other:?}"),
            });
        }
    };
    Ok(data
        .chunks(shape[1])
        .map(|row| {
            let mut best = 0;
            for (i, v) in row.iter().enumerate() {
                if *v > row[best] {
                    best = i;
                }
            }
            best as i64
        })
        .collect())
}

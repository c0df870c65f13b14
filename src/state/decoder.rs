//! Decoder state: a [`State`] with the fields a sequence decoder works on

use super::container::State;
use super::field::{Field, Item};
use super::selector::Selector;
use crate::error::{Error, Result};
use crate::vocab::TokenEncoder;
use numr::autograd::Var;
use numr::dtype::DType;
use numr::ops::TensorOps;
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::Tensor;
use std::sync::Arc;

const INP_STRINGS: &str = "inp_strings";
const GOLD_STRINGS: &str = "gold_strings";
const INP_TOKENS: &str = "inp_tokens";
const GOLD_TOKENS: &str = "gold_tokens";
const INP_TENSOR: &str = "inp_tensor";
const GOLD_TENSOR: &str = "gold_tensor";
const PREV_ACTIONS: &str = "prev_actions";
const FOLLOWED_ACTIONS: &str = "followed_actions";
const IS_TERMINATED: &str = "is_terminated";
const MSTATE: &str = "mstate";

const RESERVED_FIELDS: [&str; 10] = [
    INP_STRINGS,
    GOLD_STRINGS,
    INP_TOKENS,
    GOLD_TOKENS,
    INP_TENSOR,
    GOLD_TENSOR,
    PREV_ACTIONS,
    FOLLOWED_ACTIONS,
    IS_TERMINATED,
    MSTATE,
];

/// One example's action for a decoding step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Example already finished: keep the previous action, record padding
    Terminated,
    /// Output-vocabulary id
    Id(i64),
    /// Raw token, encoded with the output encoder (unknown tokens become unk)
    Token(String),
}

impl From<i64> for Action {
    fn from(id: i64) -> Self {
        Action::Id(id)
    }
}

impl From<&str> for Action {
    fn from(token: &str) -> Self {
        Action::Token(token.to_string())
    }
}

impl From<String> for Action {
    fn from(token: String) -> Self {
        Action::Token(token)
    }
}

/// Where a decoder state is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodingPhase {
    /// Built from data, `start_decoding` not called yet
    NotStarted,
    /// At least one example still running
    Decoding,
    /// Every example has emitted the end id
    Finished,
}

/// Batched state for sequence decoding.
///
/// Holds, per example: input and gold strings, their tokenizations, padded id
/// tensors (`[B, L]`, I64), the previous action (`[B]`), the history of
/// followed actions (`[B, t]`), a termination flag and a nested `mstate` that
/// transition models use as a cache. All of it lives in one [`State`], so
/// indexing, assignment and merging treat every field alike.
pub struct DecoderState<R: Runtime> {
    state: State<R>,
    inp_encoder: Arc<dyn TokenEncoder>,
    out_encoder: Arc<dyn TokenEncoder>,
    end_id: i64,
    phase: DecodingPhase,
}

impl<R: Runtime> Clone for DecoderState<R> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            inp_encoder: Arc::clone(&self.inp_encoder),
            out_encoder: Arc::clone(&self.out_encoder),
            end_id: self.end_id,
            phase: self.phase,
        }
    }
}

impl<R: Runtime> std::fmt::Debug for DecoderState<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecoderState")
            .field("batch_size", &self.batch_size())
            .field("phase", &self.phase)
            .field("end_id", &self.end_id)
            .field("state", &self.state)
            .finish()
    }
}

impl<R: Runtime<DType = DType>> DecoderState<R> {
    /// Build from parallel input/output strings.
    ///
    /// Both sides are tokenized and encoded with their encoder and padded with
    /// the pad id to the longest sequence in the batch.
    pub fn new<S: AsRef<str>>(
        inputs: &[S],
        outputs: &[S],
        inp_encoder: Arc<dyn TokenEncoder>,
        out_encoder: Arc<dyn TokenEncoder>,
        device: &R::Device,
    ) -> Result<Self> {
        if inputs.len() != outputs.len() {
            return Err(Error::LengthMismatch {
                inputs: inputs.len(),
                outputs: outputs.len(),
            });
        }
        if inputs.is_empty() {
            return Err(Error::InvalidArgument {
                arg: "inputs",
                reason: "a decoder state needs at least one example".to_string(),
            });
        }

        let (inp_tokens, inp_ids): (Vec<_>, Vec<_>) =
            inputs.iter().map(|s| inp_encoder.convert(s.as_ref())).unzip();
        let (gold_tokens, gold_ids): (Vec<_>, Vec<_>) =
            outputs.iter().map(|s| out_encoder.convert(s.as_ref())).unzip();

        let mut state = State::new();
        state.set(INP_STRINGS, Field::list(inputs.iter().map(|s| s.as_ref().to_string())))?;
        state.set(GOLD_STRINGS, Field::list(outputs.iter().map(|s| s.as_ref().to_string())))?;
        state.set(INP_TOKENS, Field::list(inp_tokens))?;
        state.set(GOLD_TOKENS, Field::list(gold_tokens))?;
        state.set(INP_TENSOR, id_matrix::<R>(&inp_ids, inp_encoder.pad_id(), None, device))?;
        state.set(GOLD_TENSOR, id_matrix::<R>(&gold_ids, out_encoder.pad_id(), None, device))?;
        state.set(IS_TERMINATED, Field::list(vec![false; inputs.len()]))?;
        state.set(MSTATE, State::new())?;

        let end_id = out_encoder.end_id();
        Ok(Self {
            state,
            inp_encoder,
            out_encoder,
            end_id,
            phase: DecodingPhase::NotStarted,
        })
    }

    /// Use `end_id` instead of the output encoder's end id as the terminating action.
    pub fn with_end_id(mut self, end_id: i64) -> Self {
        self.end_id = end_id;
        self
    }

    /// Begin (or restart) decoding.
    ///
    /// Every example gets the start id as its previous action, the action
    /// history is cleared, termination flags are reset and the model cache in
    /// `mstate` is emptied.
    pub fn start_decoding(&mut self) -> Result<()> {
        let b = self.batch_size();
        let anchor = self.anchor()?;
        let start = self.out_encoder.start_id();
        let prev = Tensor::<R>::from_slice(&vec![start; b], &[b], anchor.device());

        if self.state.contains(FOLLOWED_ACTIONS) {
            self.state.remove(FOLLOWED_ACTIONS)?;
        }
        self.state.set(PREV_ACTIONS, prev)?;
        self.state.set(IS_TERMINATED, Field::list(vec![false; b]))?;
        self.state.set(MSTATE, State::new())?;
        self.phase = DecodingPhase::Decoding;
        Ok(())
    }

    /// Record one action per example.
    ///
    /// A real action becomes the example's previous action and is appended to
    /// its history; emitting the end id marks the example terminated. Flags
    /// only ever go from false to true. [`Action::Terminated`] leaves the
    /// previous action alone and appends the pad id.
    pub fn step(&mut self, actions: &[Action]) -> Result<()> {
        if self.phase == DecodingPhase::NotStarted {
            return Err(Error::InvalidArgument {
                arg: "actions",
                reason: "step called before start_decoding".to_string(),
            });
        }
        let b = self.batch_size();
        if actions.len() != b {
            return Err(Error::BatchSizeMismatch {
                expected: b,
                got: actions.len(),
            });
        }

        let mut prev = self.prev_action_ids()?;
        let mut terminated = self.is_terminated()?;
        let mut history = self.followed_actions()?;
        let pad = self.out_encoder.pad_id();

        for (i, action) in actions.iter().enumerate() {
            let id = match action {
                Action::Terminated => {
                    history[i].push(pad);
                    continue;
                }
                Action::Id(id) => *id,
                Action::Token(token) => self.out_encoder.token_id(token),
            };
            prev[i] = id;
            history[i].push(id);
            terminated[i] = terminated[i] || id == self.end_id;
        }

        let anchor = self.anchor()?;
        let width = history.first().map_or(0, Vec::len);
        let flat: Vec<i64> = history.into_iter().flatten().collect();
        self.state.set(
            PREV_ACTIONS,
            Tensor::<R>::from_slice(&prev, &[b], anchor.device()),
        )?;
        self.state.set(
            FOLLOWED_ACTIONS,
            Tensor::<R>::from_slice(&flat, &[b, width], anchor.device()),
        )?;
        self.state.set(IS_TERMINATED, Field::list(terminated))?;
        self.refresh_phase();
        Ok(())
    }

    /// Termination flag per example.
    pub fn is_terminated(&self) -> Result<Vec<bool>> {
        self.state
            .list(IS_TERMINATED)?
            .iter()
            .map(|item| {
                item.as_flag().ok_or_else(|| Error::SchemaMismatch {
                    reason: format!("'{IS_TERMINATED}' holds a non-flag item"),
                })
            })
            .collect()
    }

    /// True when every example has terminated.
    pub fn all_terminated(&self) -> bool {
        self.is_terminated()
            .map(|flags| flags.iter().all(|&t| t))
            .unwrap_or(false)
    }

    /// Previous action per example, `[B]` I64. Present once decoding started.
    pub fn prev_actions(&self) -> Result<&Var<R>> {
        self.state.tensor(PREV_ACTIONS)
    }

    fn prev_action_ids(&self) -> Result<Vec<i64>> {
        Ok(host_ids(self.prev_actions()?))
    }

    /// Followed actions as a `[B, t]` tensor; `None` before the first step.
    pub fn followed_actions_tensor(&self) -> Option<&Var<R>> {
        self.state.tensor(FOLLOWED_ACTIONS).ok()
    }

    /// Followed actions per example. Rows are empty before the first step.
    pub fn followed_actions(&self) -> Result<Vec<Vec<i64>>> {
        match self.followed_actions_tensor() {
            Some(v) => Ok(rows_of(v)),
            None => Ok(vec![Vec::new(); self.batch_size()]),
        }
    }

    /// Gold id column `t` (`[B]`); examples shorter than `t + 1` give the pad id.
    pub fn gold_at(&self, t: usize) -> Result<Vec<i64>> {
        let gold = self.gold_tensor()?;
        let width = gold.shape()[1];
        let pad = self.out_encoder.pad_id();
        let data = host_ids(gold);
        Ok((0..self.batch_size())
            .map(|i| if t < width { data[i * width + t] } else { pad })
            .collect())
    }

    /// Padded gold id rows.
    pub fn gold_ids(&self) -> Result<Vec<Vec<i64>>> {
        Ok(rows_of(self.gold_tensor()?))
    }

    /// New state holding the selected examples.
    pub fn index<C>(&self, selector: impl Into<Selector>, client: &C) -> Result<Self>
    where
        C: RuntimeClient<R> + TensorOps<R>,
        R::Client: TensorOps<R>,
    {
        let mut out = self.with_state(self.state.index(selector, client)?);
        out.refresh_phase();
        Ok(out)
    }

    /// Overwrite the selected examples with those of `other`.
    ///
    /// Id tensors are right-padded so both sides agree on width first.
    pub fn assign<C>(
        &mut self,
        selector: impl Into<Selector>,
        other: &DecoderState<R>,
        client: &C,
    ) -> Result<()>
    where
        C: RuntimeClient<R> + TensorOps<R>,
        R::Client: TensorOps<R>,
    {
        let mut src = other.clone();
        let mut dst = self.state.clone();
        for name in [INP_TENSOR, GOLD_TENSOR] {
            let width = id_width(&dst, name)?.max(id_width(&src.state, name)?);
            pad_ids(&mut dst, name, width, self.pad_for(name))?;
            pad_ids(&mut src.state, name, width, self.pad_for(name))?;
        }
        dst.assign(selector, &src.state, client)?;
        self.state = dst;
        self.refresh_phase();
        Ok(())
    }

    /// Concatenate decoder states along the batch dimension.
    ///
    /// Input and gold id tensors are right-padded to the widest one. Encoders
    /// and the end id come from the first state; every state must be in the
    /// same phase.
    pub fn merge<C>(states: &[&DecoderState<R>], client: &C) -> Result<Self>
    where
        C: RuntimeClient<R> + TensorOps<R>,
        R::Client: TensorOps<R>,
    {
        let first = states.first().ok_or_else(|| Error::InvalidArgument {
            arg: "states",
            reason: "cannot merge an empty list of decoder states".to_string(),
        })?;
        let started = |p: DecodingPhase| p != DecodingPhase::NotStarted;
        if states.iter().any(|s| started(s.phase) != started(first.phase)) {
            return Err(Error::SchemaMismatch {
                reason: "cannot merge decoder states that are in different phases".to_string(),
            });
        }

        let mut padded: Vec<State<R>> = states.iter().map(|s| s.state.clone()).collect();
        for name in [INP_TENSOR, GOLD_TENSOR] {
            let mut width = 0;
            for s in &padded {
                width = width.max(id_width(s, name)?);
            }
            for s in padded.iter_mut() {
                pad_ids(s, name, width, first.pad_for(name))?;
            }
        }

        let refs: Vec<&State<R>> = padded.iter().collect();
        let mut out = first.with_state(State::merge(&refs, client)?);
        out.refresh_phase();
        Ok(out)
    }

    /// Copy with the same `detach`/`deep` semantics as [`State::copy`].
    pub fn copy(&self, detach: bool, deep: bool) -> Self {
        self.with_state(self.state.copy(detach, deep))
    }

    /// Attach an extra per-example field. Decoder-owned names are refused.
    pub fn set(&mut self, name: &str, value: impl Into<Field<R>>) -> Result<()> {
        if RESERVED_FIELDS.contains(&name) {
            return Err(Error::InvalidArgument {
                arg: "name",
                reason: format!("'{name}' is managed by the decoder state"),
            });
        }
        self.state.set(name, value)
    }

    fn pad_for(&self, name: &str) -> i64 {
        if name == INP_TENSOR {
            self.inp_encoder.pad_id()
        } else {
            self.out_encoder.pad_id()
        }
    }

    /// Any tensor of the state, for its device.
    fn anchor(&self) -> Result<Tensor<R>> {
        Ok(self.state.tensor(INP_TENSOR)?.tensor().clone())
    }
}

impl<R: Runtime> DecoderState<R> {
    pub fn batch_size(&self) -> usize {
        self.state.batch_size().unwrap_or(0)
    }

    pub fn phase(&self) -> DecodingPhase {
        self.phase
    }

    pub fn end_id(&self) -> i64 {
        self.end_id
    }

    /// Underlying container, read-only.
    pub fn state(&self) -> &State<R> {
        &self.state
    }

    pub fn inp_encoder(&self) -> &Arc<dyn TokenEncoder> {
        &self.inp_encoder
    }

    pub fn out_encoder(&self) -> &Arc<dyn TokenEncoder> {
        &self.out_encoder
    }

    /// Padded input ids, `[B, Li]` I64.
    pub fn inp_tensor(&self) -> Result<&Var<R>> {
        self.state.tensor(INP_TENSOR)
    }

    /// Padded gold ids, `[B, Lo]` I64.
    pub fn gold_tensor(&self) -> Result<&Var<R>> {
        self.state.tensor(GOLD_TENSOR)
    }

    /// Width of the gold id tensor: the longest gold sequence in the batch.
    pub fn gold_len(&self) -> Result<usize> {
        Ok(self.gold_tensor()?.shape()[1])
    }

    pub fn inp_strings(&self) -> Result<Vec<&str>> {
        strings(&self.state, INP_STRINGS)
    }

    pub fn gold_strings(&self) -> Result<Vec<&str>> {
        strings(&self.state, GOLD_STRINGS)
    }

    pub fn gold_tokens(&self) -> Result<Vec<&[String]>> {
        self.state
            .list(GOLD_TOKENS)?
            .iter()
            .map(|item| {
                item.as_tokens().ok_or_else(|| Error::SchemaMismatch {
                    reason: format!("'{GOLD_TOKENS}' holds a non-token item"),
                })
            })
            .collect()
    }

    /// Model cache. Transition models keep whatever they need between steps here.
    pub fn mstate(&self) -> Result<&State<R>> {
        self.state.state(MSTATE)
    }

    pub fn mstate_mut(&mut self) -> Result<&mut State<R>> {
        self.state.state_mut(MSTATE)
    }

    fn with_state(&self, state: State<R>) -> Self {
        Self {
            state,
            inp_encoder: Arc::clone(&self.inp_encoder),
            out_encoder: Arc::clone(&self.out_encoder),
            end_id: self.end_id,
            phase: self.phase,
        }
    }

    fn refresh_phase(&mut self) {
        if self.phase == DecodingPhase::NotStarted {
            return;
        }
        let flags: Vec<bool> = match self.state.list(IS_TERMINATED) {
            Ok(items) => items.iter().filter_map(Item::as_flag).collect(),
            Err(_) => return,
        };
        self.phase = if flags.iter().all(|&t| t) {
            DecodingPhase::Finished
        } else {
            DecodingPhase::Decoding
        };
    }
}

fn strings<'a, R: Runtime>(state: &'a State<R>, name: &str) -> Result<Vec<&'a str>> {
    state
        .list(name)?
        .iter()
        .map(|item| {
            item.as_text().ok_or_else(|| Error::SchemaMismatch {
                reason: format!("'{name}' holds a non-text item"),
            })
        })
        .collect()
}

/// `[B, width]` I64 tensor of `rows`, right-padded. Width defaults to the
/// longest row (at least 1).
fn id_matrix<R: Runtime<DType = DType>>(
    rows: &[Vec<i64>],
    pad: i64,
    width: Option<usize>,
    device: &R::Device,
) -> Tensor<R> {
    let width = width.unwrap_or_else(|| rows.iter().map(Vec::len).max().unwrap_or(0).max(1));
    let mut flat = Vec::with_capacity(rows.len() * width);
    for row in rows {
        flat.extend(row.iter().copied().take(width));
        flat.extend(std::iter::repeat_n(pad, width.saturating_sub(row.len())));
    }
    Tensor::<R>::from_slice(&flat, &[rows.len(), width], device)
}

fn host_ids<R: Runtime>(v: &Var<R>) -> Vec<i64> {
    v.tensor().contiguous().to_vec::<i64>()
}

fn rows_of<R: Runtime>(v: &Var<R>) -> Vec<Vec<i64>> {
    let shape = v.shape();
    let width = shape.get(1).copied().unwrap_or(0);
    let data = host_ids(v);
    if width == 0 {
        return vec![Vec::new(); shape[0]];
    }
    data.chunks(width).map(<[i64]>::to_vec).collect()
}

fn id_width<R: Runtime>(state: &State<R>, name: &str) -> Result<usize> {
    Ok(state.tensor(name)?.shape()[1])
}

fn pad_ids<R: Runtime<DType = DType>>(
    state: &mut State<R>,
    name: &str,
    width: usize,
    pad: i64,
) -> Result<()> {
    let current = state.tensor(name)?;
    if current.shape()[1] >= width {
        return Ok(());
    }
    let device = current.tensor().device().clone();
    let padded = id_matrix::<R>(&rows_of(current), pad, Some(width), &device);
    state.set(name, padded)
}

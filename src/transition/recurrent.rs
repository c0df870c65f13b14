//! Recurrent encoder-decoder transition model with optional attention

use super::{ScoreKind, SeqClient, TransitionModel};
use crate::error::{Error, Result};
use crate::nn::module::prefixed;
use crate::nn::{Embedding, Linear, Parameterized, SplitMix64};
use crate::state::{DecoderState, share};
use crate::vocab::TokenEncoder;
use numr::autograd::{
    Var, var_add, var_cat, var_log_softmax, var_matmul, var_reshape, var_sigmoid, var_softmax,
};
use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::{Tensor, TensorId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

// mstate cache keys
const CTX: &str = "ctx";
const CTX_MASK: &str = "ctx_mask";
const RNN_H: &str = "rnn_h";
const PREV_SUMMARY: &str = "prev_summ";

/// Additive mask value for padded input positions. Finite, so an all-padding
/// input still yields a uniform attention distribution instead of NaN.
const MASKED: f32 = -1e9;

/// Shape of a [`RecurrentTransition`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransitionConfig {
    /// Token embedding width (input and output side)
    pub embed_dim: usize,
    /// Recurrent state and encoder context width
    pub hidden_dim: usize,
    /// Attend over the encoded input at every step
    pub attention: bool,
    /// Feed the previous step's attention summary into the cell (needs `attention`)
    pub feed_attention: bool,
    /// Seed for parameter initialization
    pub seed: u64,
}

impl Default for TransitionConfig {
    fn default() -> Self {
        Self {
            embed_dim: 32,
            hidden_dim: 64,
            attention: true,
            feed_attention: false,
            seed: 0,
        }
    }
}

impl TransitionConfig {
    pub fn with_dims(mut self, embed_dim: usize, hidden_dim: usize) -> Self {
        self.embed_dim = embed_dim;
        self.hidden_dim = hidden_dim;
        self
    }

    pub fn with_attention(mut self, attention: bool) -> Self {
        self.attention = attention;
        self
    }

    pub fn with_feed_attention(mut self, feed: bool) -> Self {
        self.feed_attention = feed;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.embed_dim == 0 || self.hidden_dim == 0 {
            return Err(Error::ConfigError {
                reason: format!(
                    "embed_dim and hidden_dim must be positive, got {} and {}",
                    self.embed_dim, self.hidden_dim
                ),
            });
        }
        if self.feed_attention && !self.attention {
            return Err(Error::ConfigError {
                reason: "feed_attention requires attention".to_string(),
            });
        }
        Ok(())
    }
}

/// Reference transition model.
///
/// The input is embedded and projected once per decoding run into a context
/// `[B, Ti, H]`, cached in `mstate` with its padding mask. Each step embeds the
/// previous action, updates the hidden state
/// `h' = sigmoid(W_x x + W_h h + b)`, optionally attends over the context with
/// `h'` as query, and projects to log-probabilities over the output vocabulary.
/// Ids marked rare by an encoder are looked up as the unknown id.
pub struct RecurrentTransition<R: Runtime> {
    config: TransitionConfig,
    inp_emb: Embedding<R>,
    encoder: Linear<R>,
    out_emb: Embedding<R>,
    cell_x: Linear<R>,
    cell_h: Linear<R>,
    output: Linear<R>,
}

impl<R: Runtime<DType = DType>> RecurrentTransition<R> {
    pub fn new(
        config: TransitionConfig,
        inp_vocab_size: usize,
        out_vocab_size: usize,
        device: &R::Device,
    ) -> Result<Self> {
        config.validate()?;
        let (e, h) = (config.embed_dim, config.hidden_dim);
        let mut rng = SplitMix64::new(config.seed);

        let cell_in = if config.feed_attention { e + h } else { e };
        let out_in = if config.attention { 2 * h } else { h };

        Ok(Self {
            inp_emb: Embedding::init(inp_vocab_size, e, &mut rng, device),
            encoder: Linear::init(e, h, true, &mut rng, device),
            out_emb: Embedding::init(out_vocab_size, e, &mut rng, device),
            cell_x: Linear::init(cell_in, h, true, &mut rng, device),
            cell_h: Linear::init(h, h, false, &mut rng, device),
            output: Linear::init(out_in, out_vocab_size, true, &mut rng, device),
            config,
        })
    }

    /// Size the vocabularies from a pair of encoders.
    pub fn for_encoders(
        config: TransitionConfig,
        inp: &dyn TokenEncoder,
        out: &dyn TokenEncoder,
        device: &R::Device,
    ) -> Result<Self> {
        Self::new(config, inp.vocab_size(), out.vocab_size(), device)
    }

    pub fn config(&self) -> &TransitionConfig {
        &self.config
    }

    /// Context `[B, Ti, H]` and additive mask `[B, 1, Ti]` for the batch input.
    fn encode<C>(&self, client: &C, state: &DecoderState<R>) -> Result<(Var<R>, Var<R>)>
    where
        C: SeqClient<R>,
        R::Client: SeqClient<R>,
    {
        let inp = state.inp_tensor()?.tensor();
        let enc = state.inp_encoder();
        let ids = unk_rare(inp, enc.rare_ids(), enc.unk_id());

        let emb = self.inp_emb.forward(client, &ids)?;
        let ctx = self.encoder.forward(client, &emb)?;

        let pad = enc.pad_id();
        let (b, t) = (inp.shape()[0], inp.shape()[1]);
        let mask: Vec<f32> = inp
            .contiguous()
            .to_vec::<i64>()
            .into_iter()
            .map(|id| if id == pad { MASKED } else { 0.0 })
            .collect();
        let mask = Tensor::<R>::from_slice(&mask, &[b, 1, t], inp.device());
        Ok((ctx, Var::new(mask, false)))
    }

    /// Masked dot-product attention of `query` `[B, H]` over `ctx`.
    ///
    /// Returns the summary `[B, H]` and the attention weights `[B, 1, Ti]`.
    fn attend<C>(
        &self,
        client: &C,
        query: &Var<R>,
        ctx: &Var<R>,
        mask: &Var<R>,
    ) -> Result<(Var<R>, Var<R>)>
    where
        C: SeqClient<R>,
        R::Client: SeqClient<R>,
    {
        let (b, t, h) = (ctx.shape()[0], ctx.shape()[1], ctx.shape()[2]);
        let q = var_reshape(query, &[b, h, 1]).map_err(Error::Numr)?;
        let scores = var_matmul(ctx, &q, client).map_err(Error::Numr)?;
        let scores = var_reshape(&scores, &[b, 1, t]).map_err(Error::Numr)?;
        let scores = var_add(&scores, mask, client).map_err(Error::Numr)?;
        let weights = var_softmax(&scores, -1, client).map_err(Error::Numr)?;
        let summary = var_matmul(&weights, ctx, client).map_err(Error::Numr)?;
        let summary = var_reshape(&summary, &[b, h]).map_err(Error::Numr)?;
        Ok((summary, weights))
    }

    /// Run one decoder step up to the output projection.
    ///
    /// Fills the `mstate` cache on first use and advances the recurrent state.
    pub(super) fn step_features<C>(
        &self,
        client: &C,
        state: &mut DecoderState<R>,
    ) -> Result<StepFeatures<R>>
    where
        C: SeqClient<R>,
        R::Client: SeqClient<R>,
    {
        let b = state.batch_size();
        let hdim = self.config.hidden_dim;

        if !state.mstate()?.contains(CTX) {
            let (ctx, mask) = self.encode(client, state)?;
            let mstate = state.mstate_mut()?;
            mstate.set(CTX, ctx)?;
            mstate.set(CTX_MASK, mask)?;
        }

        let prev = state.prev_actions()?.tensor();
        let out_enc = state.out_encoder();
        let prev = unk_rare(prev, out_enc.rare_ids(), out_enc.unk_id());
        let zeros = || Var::new(Tensor::<R>::zeros(&[b, hdim], DType::F32, prev.device()), false);

        let mstate = state.mstate()?;
        let ctx = share(mstate.tensor(CTX)?);
        let mask = share(mstate.tensor(CTX_MASK)?);
        let h = match mstate.tensor(RNN_H) {
            Ok(v) => share(v),
            Err(_) => zeros(),
        };

        let mut x = self.out_emb.forward(client, &prev)?;
        if self.config.feed_attention {
            let prev_summary = match mstate.tensor(PREV_SUMMARY) {
                Ok(v) => share(v),
                Err(_) => zeros(),
            };
            x = var_cat(&[&x, &prev_summary], 1, client).map_err(Error::Numr)?;
        }

        let pre = var_add(
            &self.cell_x.forward(client, &x)?,
            &self.cell_h.forward(client, &h)?,
            client,
        )
        .map_err(Error::Numr)?;
        let h_new = var_sigmoid(&pre, client).map_err(Error::Numr)?;

        let (features, attention) = if self.config.attention {
            let (summary, weights) = self.attend(client, &h_new, &ctx, &mask)?;
            let features = var_cat(&[&h_new, &summary], 1, client).map_err(Error::Numr)?;
            if self.config.feed_attention {
                state.mstate_mut()?.set(PREV_SUMMARY, summary)?;
            }
            (features, Some(weights))
        } else {
            (share(&h_new), None)
        };

        state.mstate_mut()?.set(RNN_H, h_new)?;
        Ok(StepFeatures {
            features,
            attention,
        })
    }

    /// Output-vocabulary logits `[B, V]` from step features.
    pub(super) fn logits<C>(&self, client: &C, features: &Var<R>) -> Result<Var<R>>
    where
        C: SeqClient<R>,
        R::Client: SeqClient<R>,
    {
        self.output.forward(client, features)
    }

    /// Width of the step features fed to the output projection.
    pub(super) fn feature_dim(&self) -> usize {
        self.output.in_features()
    }
}

/// What one decoder step hands to an output head.
pub(super) struct StepFeatures<R: Runtime> {
    /// `[B, H]`, or `[B, 2H]` with attention
    pub features: Var<R>,
    /// Attention weights `[B, 1, Ti]`, when attention is enabled
    pub attention: Option<Var<R>>,
}

impl<R: Runtime<DType = DType>> TransitionModel<R> for RecurrentTransition<R> {
    fn score_kind(&self) -> ScoreKind {
        ScoreKind::LogProbs
    }

    fn apply<C>(&self, client: &C, state: &mut DecoderState<R>) -> Result<Var<R>>
    where
        C: SeqClient<R>,
        R::Client: SeqClient<R>,
    {
        let step = self.step_features(client, state)?;
        let logits = self.logits(client, &step.features)?;
        var_log_softmax(&logits, -1, client).map_err(Error::Numr)
    }
}

impl<R: Runtime> Parameterized<R> for RecurrentTransition<R> {
    fn named_parameters(&self) -> Vec<(String, &Var<R>)> {
        let mut params = prefixed("inp_emb", self.inp_emb.named_parameters());
        params.extend(prefixed("encoder", self.encoder.named_parameters()));
        params.extend(prefixed("out_emb", self.out_emb.named_parameters()));
        params.extend(prefixed("cell_x", self.cell_x.named_parameters()));
        params.extend(prefixed("cell_h", self.cell_h.named_parameters()));
        params.extend(prefixed("output", self.output.named_parameters()));
        params
    }

    fn load_parameters(&mut self, params: &HashMap<TensorId, Tensor<R>>) {
        self.inp_emb.load_parameters(params);
        self.encoder.load_parameters(params);
        self.out_emb.load_parameters(params);
        self.cell_x.load_parameters(params);
        self.cell_h.load_parameters(params);
        self.output.load_parameters(params);
    }
}

/// Copy of `ids` with every rare id replaced by `unk`.
fn unk_rare<R: Runtime<DType = DType>>(
    ids: &Tensor<R>,
    rare: &BTreeSet<i64>,
    unk: i64,
) -> Tensor<R> {
    if rare.is_empty() {
        return ids.clone();
    }
    let mapped: Vec<i64> = ids
        .contiguous()
        .to_vec::<i64>()
        .into_iter()
        .map(|id| if rare.contains(&id) { unk } else { id })
        .collect();
    Tensor::<R>::from_slice(&mapped, ids.shape(), ids.device())
}

//! # parseq
//!
//! **Batched decoder states and decoding drivers for neural semantic parsing, built on numr.**
//!
//! parseq keeps everything a sequence decoder needs about a batch of examples in one
//! container: input and gold output strings, their tokenizations and id tensors, the
//! running action history, termination flags and whatever the transition model wants
//! to cache between steps. Decoding drivers call the model once per step and feed the
//! chosen actions back into the state.
//!
//! ## Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  trainer  (epochs, hooks, grad clipping, LR schedules)   │
//! ├──────────────────────────────────────────────────────────┤
//! │  decoding (teacher forcing / free running)  eval  data   │
//! ├──────────────────────────────────────────────────────────┤
//! │  transition (model contract, recurrent and copy models)  │
//! ├──────────────────────────────────────────────────────────┤
//! │  state (State, DecoderState)          vocab (encoders)   │
//! ├──────────────────────────────────────────────────────────┤
//! │                          numr                            │
//! │            (tensors, runtime, autograd, ops)             │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design
//!
//! - **Field kinds**: tensors (autograd `Var`s), host lists and nested states, all sharing
//!   one batch dimension
//! - **Copy-on-write lists**: shallow copies share list storage until written
//! - **Replace, don't mutate**: tensor fields are swapped out, never written in place, so
//!   shallow copies never observe each other's writes

pub mod config;
pub mod data;
pub mod decoding;
pub mod error;
pub mod eval;
pub mod nn;
pub mod optimizer;
pub mod state;
pub mod trainer;
pub mod transition;
pub mod vocab;

pub use decoding::{DecodePolicy, DecodeOutput, SeqDecoder};
pub use error::{Error, Result};
pub use state::{Action, DecoderState, DecodingPhase, Field, Item, Selector, State};
pub use transition::{
    CopyTransition, RecurrentTransition, ScoreKind, TransitionConfig, TransitionModel,
};
pub use vocab::{SentenceEncoder, TokenEncoder, Vocab};

// Re-export numr types that users will commonly need
pub use numr::dtype::DType;
pub use numr::error::{Error as NumrError, Result as NumrResult};
pub use numr::runtime::{Runtime, RuntimeClient};
pub use numr::tensor::Tensor;

//! Batched state containers
//!
//! [`State`] is a schema-free map of named fields sharing one batch dimension.
//! [`DecoderState`] builds on it with the fixed field set a sequence decoder needs.

mod container;
mod decoder;
mod field;
mod selector;

pub use container::State;
pub use decoder::{Action, DecoderState, DecodingPhase};
pub use field::{Field, Item};
pub(crate) use field::share;
pub use selector::Selector;

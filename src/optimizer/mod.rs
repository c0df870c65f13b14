//! Parameter updates for training loops
//!
//! Plain SGD behind the [`Optimizer`] trait, global-norm gradient clipping and
//! learning-rate schedules. Parameters are addressed by the `TensorId` of the
//! `Var` that produced their gradients (see [`crate::nn::Parameterized`]).

pub mod grad_clip;
pub mod lr_schedule;
pub mod sgd;
pub mod traits;

pub use grad_clip::{clip_grad_norm, grad_norm};
pub use lr_schedule::LrSchedule;
pub use sgd::{Sgd, SgdConfig};
pub use traits::Optimizer;

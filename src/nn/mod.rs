pub mod embedding;
pub mod init;
pub mod linear;
pub mod module;

pub use embedding::Embedding;
pub use init::{Init, SplitMix64, shuffled_indices};
pub use linear::Linear;
pub use module::Parameterized;

//! Example storage and batching

pub mod example;
pub mod store;

pub use example::{Example, Split, load_examples};
pub use store::ExampleStore;

//! parseq error types

/// parseq result type
pub type Result<T> = std::result::Result<T, Error>;

/// parseq errors
///
/// Everything raised by the state and decoding core is a programming or data
/// error: nothing here is retried, callers are expected to abort the batch.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error from numr operations
    #[error("numr error: {0}")]
    Numr(#[from] numr::error::Error),

    /// A field's batch dimension disagrees with the rest of the state
    #[error("shape mismatch on field '{field}': expected batch size {expected}, got {got}")]
    ShapeMismatch {
        /// Field being written or combined
        field: String,
        /// Batch size (or trailing shape extent) the state requires
        expected: usize,
        /// What the offending value has
        got: usize,
    },

    /// Field lookup on a state that does not carry it
    #[error("field not found: '{name}'")]
    FieldNotFound {
        /// Requested field name
        name: String,
    },

    /// Selector addresses rows outside the batch
    #[error("index out of range: {index} for batch size {batch_size}")]
    IndexOutOfRange {
        /// Offending selector element, rendered for display
        index: String,
        /// Batch size of the indexed state
        batch_size: usize,
    },

    /// States with different field sets or field kinds were combined
    #[error("schema mismatch: {reason}")]
    SchemaMismatch {
        /// Description of the disagreement
        reason: String,
    },

    /// Parallel input/output collections differ in length
    #[error("length mismatch: {inputs} inputs vs {outputs} outputs")]
    LengthMismatch {
        /// Number of input strings
        inputs: usize,
        /// Number of output strings
        outputs: usize,
    },

    /// `step` received an action list of the wrong length
    #[error("batch size mismatch: state has {expected} examples, got {got} actions")]
    BatchSizeMismatch {
        /// Batch size of the decoder state
        expected: usize,
        /// Number of actions supplied
        got: usize,
    },

    /// Invalid argument to an operation
    #[error("invalid argument '{arg}': {reason}")]
    InvalidArgument {
        /// Argument name
        arg: &'static str,
        /// Why it's invalid
        reason: String,
    },

    /// Vocabulary construction or lookup error
    #[error("vocab error: {reason}")]
    VocabError {
        /// Description of what went wrong
        reason: String,
    },

    /// Dataset loading or batching error
    #[error("data error: {reason}")]
    DataError {
        /// Description of what went wrong
        reason: String,
    },

    /// Configuration loading or validation error
    #[error("config error: {reason}")]
    ConfigError {
        /// Description of what went wrong
        reason: String,
    },

    /// Training/optimizer error
    #[error("training error: {reason}")]
    TrainingError {
        /// Description of what went wrong
        reason: String,
    },
}

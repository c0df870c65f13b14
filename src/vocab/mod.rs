//! Vocabularies and sentence encoders
//!
//! Decoder states only talk to encoders through [`TokenEncoder`]; the concrete
//! [`SentenceEncoder`] builds its [`Vocab`] incrementally from training text.

mod encoder;
mod table;

pub use encoder::SentenceEncoder;
pub use table::Vocab;

use std::collections::BTreeSet;

/// Padding token; always id 0
pub const PAD_TOKEN: &str = "@PAD@";
/// Unknown-token placeholder; always id 1
pub const UNK_TOKEN: &str = "@UNK@";
/// Start-of-sequence token; always id 2
pub const START_TOKEN: &str = "@START@";
/// End-of-sequence token; always id 3
pub const END_TOKEN: &str = "@END@";

pub const PAD_ID: i64 = 0;
pub const UNK_ID: i64 = 1;
pub const START_ID: i64 = 2;
pub const END_ID: i64 = 3;

/// Reserved tokens, in id order.
pub const RESERVED_TOKENS: [&str; 4] = [PAD_TOKEN, UNK_TOKEN, START_TOKEN, END_TOKEN];

/// Converts between text, tokens and ids.
///
/// Implementations are shared between every copy of a decoder state, so they
/// are read-only once built.
pub trait TokenEncoder: Send + Sync {
    /// Split text into tokens, including any start/end markers the encoder adds.
    fn tokenize(&self, text: &str) -> Vec<String>;

    /// Id of a token; unknown tokens map to [`TokenEncoder::unk_id`].
    fn token_id(&self, token: &str) -> i64;

    /// Token for an id, if the id is in the vocabulary.
    fn token(&self, id: i64) -> Option<&str>;

    /// Number of ids, reserved ones included.
    fn vocab_size(&self) -> usize;

    /// Ids seen fewer times than the minimum frequency while building.
    fn rare_ids(&self) -> &BTreeSet<i64>;

    fn pad_id(&self) -> i64 {
        PAD_ID
    }

    fn unk_id(&self) -> i64 {
        UNK_ID
    }

    fn start_id(&self) -> i64 {
        START_ID
    }

    fn end_id(&self) -> i64 {
        END_ID
    }

    fn encode(&self, tokens: &[String]) -> Vec<i64> {
        tokens.iter().map(|t| self.token_id(t)).collect()
    }

    /// Tokens and ids of `text` in one go.
    fn convert(&self, text: &str) -> (Vec<String>, Vec<i64>) {
        let tokens = self.tokenize(text);
        let ids = self.encode(&tokens);
        (tokens, ids)
    }

    /// Tokens for `ids`, stopping at the end token and skipping padding.
    /// Unknown ids come back as the unknown token.
    fn decode(&self, ids: &[i64]) -> Vec<String> {
        let mut out = Vec::new();
        for &id in ids {
            if id == self.end_id() {
                break;
            }
            if id == self.pad_id() {
                continue;
            }
            out.push(self.token(id).unwrap_or(UNK_TOKEN).to_string());
        }
        out
    }
}

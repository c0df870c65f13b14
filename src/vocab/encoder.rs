//! Sentence encoder: tokenizer plus vocabulary

use super::table::Vocab;
use super::{END_TOKEN, START_TOKEN, TokenEncoder};
use crate::error::Result;
use std::collections::BTreeSet;
use std::sync::Arc;

type Tokenizer = Arc<dyn Fn(&str) -> Vec<String> + Send + Sync>;

/// Tokenizes sentences and maps tokens to ids.
///
/// Build the vocabulary with [`SentenceEncoder::inc_build_vocab`] over the
/// training data, then call [`SentenceEncoder::finalize_vocab`] once.
///
/// ```ignore
/// let mut enc = SentenceEncoder::new().with_end_token(true);
/// for ex in &train {
///     enc.inc_build_vocab(&ex.output, true)?;
/// }
/// enc.finalize_vocab(1)?;
/// let enc: Arc<dyn TokenEncoder> = Arc::new(enc);
/// ```
#[derive(Clone)]
pub struct SentenceEncoder {
    vocab: Vocab,
    tokenizer: Tokenizer,
    add_start_token: bool,
    add_end_token: bool,
}

impl Default for SentenceEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SentenceEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SentenceEncoder")
            .field("vocab_size", &self.vocab.len())
            .field("add_start_token", &self.add_start_token)
            .field("add_end_token", &self.add_end_token)
            .finish()
    }
}

impl SentenceEncoder {
    /// Whitespace tokenizer, no start/end markers.
    pub fn new() -> Self {
        Self {
            vocab: Vocab::new(),
            tokenizer: Arc::new(|s: &str| s.split_whitespace().map(str::to_string).collect()),
            add_start_token: false,
            add_end_token: false,
        }
    }

    pub fn with_tokenizer<F>(mut self, tokenizer: F) -> Self
    where
        F: Fn(&str) -> Vec<String> + Send + Sync + 'static,
    {
        self.tokenizer = Arc::new(tokenizer);
        self
    }

    pub fn with_start_token(mut self, add: bool) -> Self {
        self.add_start_token = add;
        self
    }

    pub fn with_end_token(mut self, add: bool) -> Self {
        self.add_end_token = add;
        self
    }

    /// Start from an existing vocabulary, e.g. one loaded from disk.
    pub fn with_vocab(mut self, vocab: Vocab) -> Self {
        self.vocab = vocab;
        self
    }

    /// Count the tokens of `text`. `seen` is false for text outside the
    /// training split: its tokens get ids but do not count as seen.
    pub fn inc_build_vocab(&mut self, text: &str, seen: bool) -> Result<Vec<String>> {
        let tokens = self.tokenize(text);
        for t in &tokens {
            self.vocab.add_token(t, seen)?;
        }
        Ok(tokens)
    }

    /// Register a single token without running the tokenizer.
    pub fn add_token(&mut self, token: &str, seen: bool) -> Result<()> {
        self.vocab.add_token(token, seen)
    }

    pub fn finalize_vocab(&mut self, min_freq: usize) -> Result<()> {
        self.vocab.finalize(min_freq)
    }

    pub fn vocab(&self) -> &Vocab {
        &self.vocab
    }
}

impl TokenEncoder for SentenceEncoder {
    fn tokenize(&self, text: &str) -> Vec<String> {
        let mut tokens = Vec::new();
        if self.add_start_token {
            tokens.push(START_TOKEN.to_string());
        }
        tokens.extend((self.tokenizer)(text));
        if self.add_end_token {
            tokens.push(END_TOKEN.to_string());
        }
        tokens
    }

    fn token_id(&self, token: &str) -> i64 {
        self.vocab.id(token)
    }

    fn token(&self, id: i64) -> Option<&str> {
        self.vocab.token(id)
    }

    fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    fn rare_ids(&self) -> &BTreeSet<i64> {
        self.vocab.rare_ids()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vocab::{END_ID, UNK_ID};

    fn built(texts: &[&str], end: bool) -> SentenceEncoder {
        let mut enc = SentenceEncoder::new().with_end_token(end);
        for t in texts {
            enc.inc_build_vocab(t, true).unwrap();
        }
        enc.finalize_vocab(0).unwrap();
        enc
    }

    #[test]
    fn test_alphabetical_ids_for_equal_counts() {
        let enc = built(
            &["i went to chocolate", "awesome is", "the meaning of life"],
            false,
        );
        assert_eq!(enc.token_id("awesome"), 4);
        assert_eq!(enc.token_id("chocolate"), 5);
        assert_eq!(enc.token_id("i"), 6);
        assert_eq!(enc.token_id("is"), 7);
        assert_eq!(enc.token_id("went"), 13);
        assert_eq!(enc.vocab_size(), 14);
    }

    #[test]
    fn test_end_token_appended() {
        let enc = built(&["a b"], true);
        let (tokens, ids) = enc.convert("a b");
        assert_eq!(tokens, vec!["a", "b", "@END@"]);
        assert_eq!(*ids.last().unwrap(), END_ID);
    }

    #[test]
    fn test_unknown_and_decode() {
        let enc = built(&["a b"], true);
        assert_eq!(enc.token_id("zzz"), UNK_ID);

        let ids = vec![enc.token_id("b"), 0, enc.token_id("a"), END_ID, enc.token_id("a")];
        assert_eq!(enc.decode(&ids), vec!["b", "a"]);
    }

    #[test]
    fn test_custom_tokenizer() {
        let mut enc = SentenceEncoder::new()
            .with_tokenizer(|s| s.split(',').map(|t| t.trim().to_string()).collect());
        let tokens = enc.inc_build_vocab("x, y", true).unwrap();
        assert_eq!(tokens, vec!["x", "y"]);
    }

    #[test]
    fn test_add_token_skips_tokenizer() {
        let mut enc = SentenceEncoder::new();
        enc.inc_build_vocab("a", true).unwrap();
        enc.add_token("two words", false).unwrap();
        enc.finalize_vocab(1).unwrap();
        assert_ne!(enc.token_id("two words"), UNK_ID);
        assert!(enc.rare_ids().contains(&enc.token_id("two words")));
        assert!(enc.add_token("late", true).is_err());
    }
}

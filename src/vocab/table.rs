//! Token/id table built from frequency counts

use super::{RESERVED_TOKENS, UNK_ID};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Token vocabulary.
///
/// Tokens are counted with [`Vocab::add_token`] and receive ids at
/// [`Vocab::finalize`]: reserved tokens first, then by descending count with
/// ties broken lexicographically, so the same corpus always yields the same ids.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Vocab {
    counts: HashMap<String, usize>,
    token_to_id: HashMap<String, i64>,
    id_to_token: Vec<String>,
    rare_tokens: BTreeSet<String>,
    rare_ids: BTreeSet<i64>,
    finalized: bool,
}

impl Vocab {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a token. Only `seen` occurrences count towards its frequency;
    /// unseen tokens still get an id, with count zero.
    ///
    /// Reserved tokens are ignored. Errors after [`Vocab::finalize`].
    pub fn add_token(&mut self, token: &str, seen: bool) -> Result<()> {
        if self.finalized {
            return Err(Error::VocabError {
                reason: format!("cannot add '{token}' to a finalized vocabulary"),
            });
        }
        if RESERVED_TOKENS.contains(&token) {
            return Ok(());
        }
        let count = self.counts.entry(token.to_string()).or_insert(0);
        if seen {
            *count += 1;
        }
        Ok(())
    }

    /// Assign ids. Tokens counted fewer than `min_freq` times are marked rare
    /// but still get an id.
    pub fn finalize(&mut self, min_freq: usize) -> Result<()> {
        if self.finalized {
            return Err(Error::VocabError {
                reason: "vocabulary already finalized".to_string(),
            });
        }

        let mut ordered: Vec<(&String, &usize)> = self.counts.iter().collect();
        ordered.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));

        let mut id_to_token: Vec<String> = RESERVED_TOKENS.iter().map(|t| t.to_string()).collect();
        id_to_token.extend(ordered.iter().map(|(t, _)| (*t).clone()));

        self.token_to_id = id_to_token
            .iter()
            .enumerate()
            .map(|(i, t)| (t.clone(), i as i64))
            .collect();
        self.rare_tokens = ordered
            .iter()
            .filter(|(_, c)| **c < min_freq)
            .map(|(t, _)| (*t).clone())
            .collect();
        self.rare_ids = self
            .rare_tokens
            .iter()
            .filter_map(|t| self.token_to_id.get(t).copied())
            .collect();
        self.id_to_token = id_to_token;
        self.finalized = true;
        Ok(())
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Id of `token`, or the unknown id. Before finalization only reserved
    /// tokens have ids.
    pub fn id(&self, token: &str) -> i64 {
        if let Some(&id) = self.token_to_id.get(token) {
            return id;
        }
        RESERVED_TOKENS
            .iter()
            .position(|t| *t == token)
            .map_or(UNK_ID, |p| p as i64)
    }

    pub fn token(&self, id: i64) -> Option<&str> {
        if !self.finalized {
            return usize::try_from(id)
                .ok()
                .and_then(|i| RESERVED_TOKENS.get(i).copied());
        }
        usize::try_from(id)
            .ok()
            .and_then(|i| self.id_to_token.get(i))
            .map(String::as_str)
    }

    /// Number of ids, including the reserved ones.
    pub fn len(&self) -> usize {
        if self.finalized {
            self.id_to_token.len()
        } else {
            RESERVED_TOKENS.len()
        }
    }

    /// True while only the reserved tokens are present.
    pub fn is_empty(&self) -> bool {
        self.len() == RESERVED_TOKENS.len()
    }

    /// Registered tokens, reserved ones excluded, in no particular order.
    pub fn tokens(&self) -> impl Iterator<Item = &str> {
        self.counts.keys().map(String::as_str)
    }

    /// How often `token` was seen.
    pub fn count(&self, token: &str) -> usize {
        self.counts.get(token).copied().unwrap_or(0)
    }

    pub fn rare_tokens(&self) -> &BTreeSet<String> {
        &self.rare_tokens
    }

    pub fn rare_ids(&self) -> &BTreeSet<i64> {
        &self.rare_ids
    }
}

//! Raw input/output examples and dataset splits

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Dataset split an example belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Train,
    Valid,
    Test,
}

impl std::fmt::Display for Split {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Split::Train => "train",
            Split::Valid => "valid",
            Split::Test => "test",
        };
        f.write_str(name)
    }
}

/// One input sentence paired with its gold output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Example {
    pub input: String,
    pub output: String,
    pub split: Split,
}

impl Example {
    pub fn new(input: impl Into<String>, output: impl Into<String>, split: Split) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            split,
        }
    }
}

/// Load examples from a JSON file.
///
/// Accepts either a JSON array of examples or one example object per line.
pub fn load_examples<P: AsRef<Path>>(path: P) -> Result<Vec<Example>> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path).map_err(|e| Error::DataError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;

    if contents.trim_start().starts_with('[') {
        return serde_json::from_str(&contents).map_err(|e| Error::DataError {
            reason: format!("failed to parse {}: {e}", path.display()),
        });
    }

    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line).map_err(|e| Error::DataError {
                reason: format!("{}:{}: {e}", path.display(), i + 1),
            })
        })
        .collect()
}

//! Per-split example store producing batched decoder states

use super::example::{Example, Split};
use crate::error::{Error, Result};
use crate::nn::shuffled_indices;
use crate::state::DecoderState;
use crate::vocab::{SentenceEncoder, TokenEncoder};
use numr::dtype::DType;
use numr::ops::TensorOps;
use numr::runtime::{Runtime, RuntimeClient};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Single-example decoder states grouped by split, plus the encoders that built them.
///
/// ```ignore
/// let store = ExampleStore::build(&examples, inp_enc, out_enc, 1, &device)?;
/// for epoch in 0..epochs {
///     for batch in store.batches(Split::Train, 16, Some(seed + epoch), &client)? {
///         // batch: DecoderState with up to 16 examples
///     }
/// }
/// ```
pub struct ExampleStore<R: Runtime> {
    splits: BTreeMap<Split, Vec<DecoderState<R>>>,
    inp_encoder: Arc<dyn TokenEncoder>,
    out_encoder: Arc<dyn TokenEncoder>,
}

impl<R: Runtime<DType = DType>> ExampleStore<R> {
    /// Build vocabularies and per-example states.
    ///
    /// Tokens from the train split count towards vocabulary frequencies; tokens
    /// from other splits get ids but are not counted as seen, so with
    /// `min_freq > 0` they end up rare. Every input token is also registered,
    /// unseen, in the output vocabulary so copying models can emit it.
    pub fn build(
        examples: &[Example],
        mut inp_encoder: SentenceEncoder,
        mut out_encoder: SentenceEncoder,
        min_freq: usize,
        device: &R::Device,
    ) -> Result<Self> {
        for ex in examples {
            let seen = ex.split == Split::Train;
            inp_encoder.inc_build_vocab(&ex.input, seen)?;
            out_encoder.inc_build_vocab(&ex.output, seen)?;
        }
        let inp_tokens: Vec<String> = inp_encoder.vocab().tokens().map(str::to_string).collect();
        for token in &inp_tokens {
            out_encoder.add_token(token, false)?;
        }
        inp_encoder.finalize_vocab(min_freq)?;
        out_encoder.finalize_vocab(min_freq)?;
        debug!(
            inp_vocab = inp_encoder.vocab_size(),
            out_vocab = out_encoder.vocab_size(),
            rare_out = out_encoder.rare_ids().len(),
            "vocabularies finalized"
        );

        let inp_encoder: Arc<dyn TokenEncoder> = Arc::new(inp_encoder);
        let out_encoder: Arc<dyn TokenEncoder> = Arc::new(out_encoder);
        Self::from_encoders(examples, inp_encoder, out_encoder, device)
    }

    /// Build per-example states with ready-made encoders.
    pub fn from_encoders(
        examples: &[Example],
        inp_encoder: Arc<dyn TokenEncoder>,
        out_encoder: Arc<dyn TokenEncoder>,
        device: &R::Device,
    ) -> Result<Self> {
        let mut splits: BTreeMap<Split, Vec<DecoderState<R>>> = BTreeMap::new();
        for ex in examples {
            let state = DecoderState::new(
                &[ex.input.as_str()],
                &[ex.output.as_str()],
                Arc::clone(&inp_encoder),
                Arc::clone(&out_encoder),
                device,
            )?;
            splits.entry(ex.split).or_default().push(state);
        }
        for (split, states) in &splits {
            debug!(%split, examples = states.len(), "split loaded");
        }
        Ok(Self {
            splits,
            inp_encoder,
            out_encoder,
        })
    }

    /// Batches of `split`, in order or shuffled.
    ///
    /// Only the train split is shuffled, and only when `shuffle_seed` is set.
    /// Every example is deep-copied and detached before merging, so batches
    /// never share storage or autograd history with the store. The last batch
    /// may be smaller than `batch_size`.
    pub fn batches<C>(
        &self,
        split: Split,
        batch_size: usize,
        shuffle_seed: Option<u64>,
        client: &C,
    ) -> Result<Vec<DecoderState<R>>>
    where
        C: RuntimeClient<R> + TensorOps<R>,
        R::Client: TensorOps<R>,
    {
        if batch_size == 0 {
            return Err(Error::InvalidArgument {
                arg: "batch_size",
                reason: "must be positive".to_string(),
            });
        }
        let states = self.split(split);
        if states.is_empty() {
            return Err(Error::DataError {
                reason: format!("split '{split}' has no examples"),
            });
        }

        let order = match (split, shuffle_seed) {
            (Split::Train, Some(seed)) => shuffled_indices(states.len(), seed),
            _ => (0..states.len()).collect(),
        };

        let mut batches = Vec::with_capacity(order.len().div_ceil(batch_size));
        for chunk in order.chunks(batch_size) {
            let copies: Vec<DecoderState<R>> =
                chunk.iter().map(|&i| states[i].copy(true, true)).collect();
            let refs: Vec<&DecoderState<R>> = copies.iter().collect();
            batches.push(DecoderState::merge(&refs, client)?);
        }
        debug!(%split, batch_size, batches = batches.len(), "batched split");
        Ok(batches)
    }
}

impl<R: Runtime> ExampleStore<R> {
    /// States of one split; empty when the split has no examples.
    pub fn split(&self, split: Split) -> &[DecoderState<R>] {
        self.splits.get(&split).map_or(&[], Vec::as_slice)
    }

    pub fn len(&self, split: Split) -> usize {
        self.split(split).len()
    }

    pub fn is_empty(&self) -> bool {
        self.splits.values().all(Vec::is_empty)
    }

    pub fn inp_encoder(&self) -> &Arc<dyn TokenEncoder> {
        &self.inp_encoder
    }

    pub fn out_encoder(&self) -> &Arc<dyn TokenEncoder> {
        &self.out_encoder
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::cpu_setup;
    use numr::runtime::cpu::{CpuDevice, CpuRuntime};

    fn examples() -> Vec<Example> {
        let mut out: Vec<Example> = (0..5)
            .map(|i| Example::new(format!("in {i}"), format!("out {i}"), Split::Train))
            .collect();
        out.push(Example::new("in x", "out unseen", Split::Test));
        out
    }

    fn store(device: &CpuDevice) -> ExampleStore<CpuRuntime> {
        ExampleStore::build(
            &examples(),
            SentenceEncoder::new(),
            SentenceEncoder::new().with_end_token(true),
            1,
            device,
        )
        .unwrap()
    }

    #[test]
    fn test_build_splits_and_rare_tokens() {
        let (_client, device) = cpu_setup();
        let s = store(&device);
        assert_eq!(s.len(Split::Train), 5);
        assert_eq!(s.len(Split::Test), 1);
        assert_eq!(s.len(Split::Valid), 0);

        // test-only token has an id but is rare
        let unseen = s.out_encoder().token_id("unseen");
        assert!(s.out_encoder().rare_ids().contains(&unseen));
        assert!(!s.out_encoder().rare_ids().contains(&s.out_encoder().token_id("out")));
    }

    #[test]
    fn test_input_tokens_join_output_vocab_unseen() {
        let (_client, device) = cpu_setup();
        let s = store(&device);
        let out = s.out_encoder();

        // "in" and "x" only ever occur on the input side
        for token in ["in", "x"] {
            let id = out.token_id(token);
            assert_ne!(id, out.unk_id(), "{token} missing from output vocab");
            assert!(out.rare_ids().contains(&id));
        }
        // digits are also train outputs, so the unseen registration leaves them common
        assert!(!out.rare_ids().contains(&out.token_id("3")));
        assert_eq!(out.token(out.token_id("x")), Some("x"));
    }

    #[test]
    fn test_batches_keep_last_partial() {
        let (client, device) = cpu_setup();
        let s = store(&device);
        let batches = s.batches(Split::Train, 2, None, &client).unwrap();
        let sizes: Vec<usize> = batches.iter().map(|b| b.batch_size()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(batches[0].inp_strings().unwrap(), vec!["in 0", "in 1"]);
    }

    #[test]
    fn test_shuffle_is_seeded_and_train_only() {
        let (client, device) = cpu_setup();
        let s = store(&device);
        let order = |seed| -> Vec<String> {
            s.batches(Split::Train, 5, Some(seed), &client).unwrap()[0]
                .inp_strings()
                .unwrap()
                .into_iter()
                .map(str::to_string)
                .collect()
        };
        assert_eq!(order(11), order(11));

        let mut sorted = order(11);
        sorted.sort();
        assert_eq!(sorted, vec!["in 0", "in 1", "in 2", "in 3", "in 4"]);

        let test = s.batches(Split::Test, 4, Some(11), &client).unwrap();
        assert_eq!(test[0].inp_strings().unwrap(), vec!["in x"]);
    }

    #[test]
    fn test_batches_errors() {
        let (client, device) = cpu_setup();
        let s = store(&device);
        assert!(s.batches(Split::Train, 0, None, &client).is_err());
        assert!(matches!(
            s.batches(Split::Valid, 2, None, &client),
            Err(Error::DataError { .. })
        ));
    }
}

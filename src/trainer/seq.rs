//! Epoch loop for sequence decoders
//!
//! Training epochs decode each batch with teacher forcing, backpropagate the
//! masked cross-entropy, let hooks adjust gradients and the learning rate, and
//! hand the update back to the model. Validation epochs decode free-running
//! and report loss plus sequence accuracies.

use std::marker::PhantomData;

use crate::data::{ExampleStore, Split};
use crate::decoding::{DecodePolicy, SeqDecoder};
use crate::error::{Error, Result};
use crate::eval::{SeqAccuracies, sequence_accuracies, sequence_ce_loss};
use crate::nn::Parameterized;
use crate::optimizer::Optimizer;
use crate::state::DecoderState;
use crate::trainer::config::{EpochSummary, TrainingConfig, TrainingMetrics};
use crate::trainer::hooks::{
    EarlyStoppingHook, GradClipHook, HookContext, HookSignal, LrScheduleHook, StopMetric,
    TrainingHook,
};
use crate::transition::{SeqClient, TransitionModel};
use numr::autograd::{Var, backward};
use numr::dtype::DType;
use numr::runtime::Runtime;
use tracing::{debug, info, instrument};

/// Default step limit for free-running validation.
pub const DEFAULT_MAX_DECODE_STEPS: usize = 50;

/// Trainer for [`SeqDecoder`]s over [`TransitionModel`]s with parameters.
///
/// # Usage
///
/// ```ignore
/// let mut trainer = SeqTrainer::new(config, Sgd::new(SgdConfig::default())?)?;
/// let mut hooks = trainer.default_hooks();
/// let summaries = trainer.fit(&client, &mut decoder, &store, &mut hooks)?;
/// ```
pub struct SeqTrainer<R: Runtime, O> {
    optimizer: O,
    config: TrainingConfig,
    max_decode_steps: usize,
    global_step: u64,
    _runtime: PhantomData<R>,
}

impl<R, O> SeqTrainer<R, O>
where
    R: Runtime<DType = DType>,
    R::Client: SeqClient<R>,
    O: Optimizer<R>,
{
    pub fn new(config: TrainingConfig, mut optimizer: O) -> Result<Self> {
        config.validate()?;
        optimizer.set_lr(config.learning_rate);
        Ok(Self {
            optimizer,
            config,
            max_decode_steps: DEFAULT_MAX_DECODE_STEPS,
            global_step: 0,
            _runtime: PhantomData,
        })
    }

    pub fn with_max_decode_steps(mut self, steps: usize) -> Self {
        self.max_decode_steps = steps;
        self
    }

    /// Hooks implied by the config: LR schedule, then gradient clipping when
    /// `max_grad_norm` is set, then early stopping on validation loss when
    /// `patience` is set.
    pub fn default_hooks(&self) -> Vec<Box<dyn TrainingHook<R>>> {
        let mut hooks: Vec<Box<dyn TrainingHook<R>>> =
            vec![Box::new(LrScheduleHook::new(self.config.lr_schedule()))];
        if let Some(norm) = self.config.max_grad_norm {
            hooks.push(Box::new(GradClipHook::new(norm)));
        }
        if let Some(patience) = self.config.patience {
            hooks.push(Box::new(EarlyStoppingHook::new(StopMetric::ValidLoss, patience)));
        }
        hooks
    }

    /// One teacher-forced update on `batch`.
    pub fn train_step<M>(
        &mut self,
        client: &R::Client,
        decoder: &mut SeqDecoder<M>,
        batch: &mut DecoderState<R>,
        epoch: usize,
        hooks: &mut [Box<dyn TrainingHook<R>>],
    ) -> Result<TrainingMetrics>
    where
        M: TransitionModel<R> + Parameterized<R>,
    {
        decoder.set_policy(DecodePolicy::TeacherForcing);
        let out = decoder.decode(client, batch)?;
        let gold = batch.gold_tensor()?.tensor().clone();
        let pad_id = batch.out_encoder().pad_id();
        let loss = sequence_ce_loss(client, &out.scores, decoder.model().score_kind(), &gold, pad_id)?;
        let loss_value = scalar(&loss)?;

        let mut grads = backward(&loss, client)?;
        let mut ctx = HookContext {
            client,
            epoch,
            step: self.global_step,
            lr: self.optimizer.lr(),
            grad_norm: None,
        };
        for hook in hooks.iter_mut() {
            hook.before_optimizer_step(&mut grads, &mut ctx)?;
        }
        let (lr, grad_norm) = (ctx.lr, ctx.grad_norm);

        self.optimizer.set_lr(lr);
        let mut params = decoder.model().parameter_map();
        self.optimizer.step(client, &mut params, &grads)?;
        decoder.model_mut().load_parameters(&params);
        self.global_step += 1;

        Ok(TrainingMetrics {
            epoch,
            step: self.global_step,
            loss: loss_value,
            grad_norm,
            lr,
        })
    }

    /// Train on every batch once; returns the mean loss.
    #[instrument(skip_all, fields(epoch = epoch, batches = batches.len()))]
    pub fn train_epoch<M>(
        &mut self,
        client: &R::Client,
        decoder: &mut SeqDecoder<M>,
        batches: Vec<DecoderState<R>>,
        epoch: usize,
        hooks: &mut [Box<dyn TrainingHook<R>>],
    ) -> Result<f64>
    where
        M: TransitionModel<R> + Parameterized<R>,
    {
        if batches.is_empty() {
            return Err(Error::TrainingError {
                reason: "no training batches".to_string(),
            });
        }
        let count = batches.len();
        let mut total = 0.0;
        for mut batch in batches {
            let metrics = self.train_step(client, decoder, &mut batch, epoch, hooks)?;
            debug!(
                step = metrics.step,
                loss = metrics.loss,
                lr = metrics.lr,
                grad_norm = ?metrics.grad_norm,
                "train step"
            );
            total += metrics.loss;
        }
        Ok(total / count as f64)
    }

    /// Free-running decode of every batch; returns the mean loss and the
    /// accuracies over all examples. The decoder's policy is restored afterwards.
    #[instrument(skip_all, fields(batches = batches.len()))]
    pub fn evaluate<M>(
        &self,
        client: &R::Client,
        decoder: &mut SeqDecoder<M>,
        batches: Vec<DecoderState<R>>,
    ) -> Result<(f64, SeqAccuracies)>
    where
        M: TransitionModel<R>,
    {
        if batches.is_empty() {
            return Err(Error::TrainingError {
                reason: "no evaluation batches".to_string(),
            });
        }
        let previous = decoder.policy();
        decoder.set_policy(DecodePolicy::FreeRunning {
            max_steps: self.max_decode_steps,
        });
        let result = self.evaluate_batches(client, decoder, batches);
        decoder.set_policy(previous);
        result
    }

    fn evaluate_batches<M>(
        &self,
        client: &R::Client,
        decoder: &SeqDecoder<M>,
        batches: Vec<DecoderState<R>>,
    ) -> Result<(f64, SeqAccuracies)>
    where
        M: TransitionModel<R>,
    {
        let count = batches.len();
        let mut total = 0.0;
        let mut predicted = Vec::new();
        let mut gold = Vec::new();
        let (mut pad_id, mut end_id) = (0, 0);

        for mut batch in batches {
            let out = decoder.decode(client, &mut batch)?;
            let gold_tensor = batch.gold_tensor()?.tensor().clone();
            pad_id = batch.out_encoder().pad_id();
            end_id = batch.end_id();
            let loss = sequence_ce_loss(
                client,
                &out.scores,
                decoder.model().score_kind(),
                &gold_tensor,
                pad_id,
            )?;
            total += scalar(&loss)?;
            predicted.extend(out.predictions);
            gold.extend(batch.gold_ids()?);
        }

        let accuracies = sequence_accuracies(&predicted, &gold, pad_id, end_id)?;
        Ok((total / count as f64, accuracies))
    }

    /// Run up to `config.epochs` epochs over the store's train split, validating
    /// on the valid split when it has examples. Stops early when any hook
    /// returns [`HookSignal::Stop`]; every hook still sees the epoch summary.
    pub fn fit<M>(
        &mut self,
        client: &R::Client,
        decoder: &mut SeqDecoder<M>,
        store: &ExampleStore<R>,
        hooks: &mut [Box<dyn TrainingHook<R>>],
    ) -> Result<Vec<EpochSummary>>
    where
        M: TransitionModel<R> + Parameterized<R>,
    {
        let batch_size = self.config.batch_size;
        let mut summaries = Vec::with_capacity(self.config.epochs);

        for epoch in 0..self.config.epochs {
            let seed = self.config.seed.wrapping_add(epoch as u64);
            let batches = store.batches(Split::Train, batch_size, Some(seed), client)?;
            let train_loss = self.train_epoch(client, decoder, batches, epoch, hooks)?;

            let (valid_loss, valid_accuracies) = if store.len(Split::Valid) > 0 {
                let batches = store.batches(Split::Valid, batch_size, None, client)?;
                let (loss, acc) = self.evaluate(client, decoder, batches)?;
                (Some(loss), Some(acc))
            } else {
                (None, None)
            };

            let summary = EpochSummary {
                epoch,
                train_loss,
                valid_loss,
                valid_accuracies,
                lr: self.optimizer.lr(),
            };
            info!(
                epoch,
                train_loss,
                valid_loss = ?valid_loss,
                valid_seq_acc = ?valid_accuracies.map(|a| a.sequence),
                lr = summary.lr,
                "epoch finished"
            );

            let mut stop = false;
            for hook in hooks.iter_mut() {
                if hook.on_epoch_end(&summary)? == HookSignal::Stop {
                    debug!(hook = hook.name(), "stop requested");
                    stop = true;
                }
            }
            summaries.push(summary);
            if stop {
                break;
            }
        }
        Ok(summaries)
    }

    pub fn global_step(&self) -> u64 {
        self.global_step
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn optimizer(&self) -> &O {
        &self.optimizer
    }

    pub fn optimizer_mut(&mut self) -> &mut O {
        &mut self.optimizer
    }
}

/// Host value of a one-element loss.
fn scalar<R: Runtime>(loss: &Var<R>) -> Result<f64> {
    let value = loss.tensor().contiguous().to_vec::<f32>();
    match value.first() {
        Some(v) if v.is_finite() => Ok(*v as f64),
        Some(v) => Err(Error::TrainingError {
            reason: format!("non-finite loss {v}"),
        }),
        None => Err(Error::TrainingError {
            reason: "empty loss tensor".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Example;
    use crate::optimizer::{Sgd, SgdConfig};
    use crate::test_utils::cpu_setup;
    use crate::transition::{RecurrentTransition, TransitionConfig};
    use crate::vocab::SentenceEncoder;
    use numr::runtime::cpu::{CpuDevice, CpuRuntime};

    fn store(device: &CpuDevice) -> ExampleStore<CpuRuntime> {
        let examples = vec![
            Example::new("a b", "x y", Split::Train),
            Example::new("b a", "y x", Split::Train),
            Example::new("a a", "x x", Split::Train),
            Example::new("b b", "y y", Split::Valid),
        ];
        ExampleStore::build(
            &examples,
            SentenceEncoder::new(),
            SentenceEncoder::new().with_end_token(true),
            0,
            device,
        )
        .unwrap()
    }

    fn decoder(
        store: &ExampleStore<CpuRuntime>,
        device: &CpuDevice,
    ) -> SeqDecoder<RecurrentTransition<CpuRuntime>> {
        let model = RecurrentTransition::for_encoders(
            TransitionConfig::default().with_dims(4, 8).with_seed(3),
            store.inp_encoder().as_ref(),
            store.out_encoder().as_ref(),
            device,
        )
        .unwrap();
        SeqDecoder::new(model, DecodePolicy::TeacherForcing)
    }

    fn trainer(config: TrainingConfig) -> SeqTrainer<CpuRuntime, Sgd<CpuRuntime>> {
        SeqTrainer::new(config, Sgd::new(SgdConfig::default()).unwrap())
            .unwrap()
            .with_max_decode_steps(5)
    }

    #[test]
    fn test_train_step_updates_parameters() {
        let (client, device) = cpu_setup();
        let store = store(&device);
        let mut dec = decoder(&store, &device);
        let mut t = trainer(TrainingConfig::default().with_lr(0.5));
        let mut hooks = t.default_hooks();

        let before = dec.model().parameter_map();
        let mut batch = store
            .batches(Split::Train, 3, None, &client)
            .unwrap()
            .remove(0);
        let metrics = t.train_step(&client, &mut dec, &mut batch, 0, &mut hooks).unwrap();

        assert!(metrics.loss.is_finite() && metrics.loss > 0.0);
        assert_eq!(metrics.step, 1);
        assert!(metrics.grad_norm.is_some());
        assert_eq!(metrics.lr, 0.5);

        let after = dec.model().parameter_map();
        assert_eq!(before.len(), after.len());
        let changed = before.iter().any(|(id, t)| {
            let old = t.to_vec::<f32>();
            let new = after[id].to_vec::<f32>();
            old.iter().zip(&new).any(|(a, b)| (a - b).abs() > 0.0)
        });
        assert!(changed);
    }

    #[test]
    fn test_evaluate_restores_policy() {
        let (client, device) = cpu_setup();
        let store = store(&device);
        let mut dec = decoder(&store, &device);
        let t = trainer(TrainingConfig::default());

        let batches = store.batches(Split::Valid, 4, None, &client).unwrap();
        let (loss, acc) = t.evaluate(&client, &mut dec, batches).unwrap();
        assert!(loss.is_finite());
        assert!((0.0..=1.0).contains(&acc.element));
        assert!((0.0..=1.0).contains(&acc.sequence));
        assert_eq!(dec.policy(), DecodePolicy::TeacherForcing);
    }

    #[test]
    fn test_fit_runs_every_epoch_with_validation() {
        let (client, device) = cpu_setup();
        let store = store(&device);
        let mut dec = decoder(&store, &device);
        let mut t = trainer(TrainingConfig::default().with_epochs(2).with_batch_size(2));
        let mut hooks = t.default_hooks();

        let summaries = t.fit(&client, &mut dec, &store, &mut hooks).unwrap();
        assert_eq!(summaries.len(), 2);
        assert!(summaries.iter().all(|s| s.valid_loss.is_some()));
        // 3 train examples in batches of 2
        assert_eq!(t.global_step(), 4);
    }

    struct StopAfterFirst;

    impl TrainingHook<CpuRuntime> for StopAfterFirst {
        fn name(&self) -> &str {
            "stop_after_first"
        }

        fn on_epoch_end(&mut self, _summary: &EpochSummary) -> Result<HookSignal> {
            Ok(HookSignal::Stop)
        }
    }

    #[test]
    fn test_hook_stops_training() {
        let (client, device) = cpu_setup();
        let store = store(&device);
        let mut dec = decoder(&store, &device);
        let mut t = trainer(TrainingConfig::default().with_epochs(5));
        let mut hooks: Vec<Box<dyn TrainingHook<CpuRuntime>>> = vec![Box::new(StopAfterFirst)];

        let summaries = t.fit(&client, &mut dec, &store, &mut hooks).unwrap();
        assert_eq!(summaries.len(), 1);
    }
}

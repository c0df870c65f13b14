use std::io::Write;

use numr::runtime::cpu::{CpuClient, CpuDevice, CpuRuntime};
use parseq::config::ExperimentConfig;
use parseq::data::{Example, ExampleStore, Split, load_examples};
use parseq::optimizer::{Sgd, SgdConfig};
use parseq::trainer::{
    EarlyStoppingHook, GradClipHook, SeqTrainer, StopMetric, TrainingConfig, TrainingHook,
};
use parseq::{
    CopyTransition, DecodePolicy, RecurrentTransition, SentenceEncoder, SeqDecoder,
    TransitionConfig,
};

fn cpu_setup() -> (CpuClient, CpuDevice) {
    let device = CpuDevice::new();
    let client = CpuClient::new(device.clone());
    (client, device)
}

fn tiny_store(device: &CpuDevice) -> ExampleStore<CpuRuntime> {
    let examples = vec![
        Example::new("what is a", "ans a", Split::Train),
        Example::new("what is b", "ans b", Split::Train),
        Example::new("what is c", "ans c", Split::Train),
        Example::new("what is b", "ans b", Split::Valid),
    ];
    ExampleStore::build(
        &examples,
        SentenceEncoder::new(),
        SentenceEncoder::new().with_end_token(true),
        0,
        device,
    )
    .expect("store")
}

fn decoder(
    store: &ExampleStore<CpuRuntime>,
    device: &CpuDevice,
) -> SeqDecoder<RecurrentTransition<CpuRuntime>> {
    let model = RecurrentTransition::for_encoders(
        TransitionConfig::default().with_dims(8, 16).with_seed(5),
        store.inp_encoder().as_ref(),
        store.out_encoder().as_ref(),
        device,
    )
    .expect("model");
    SeqDecoder::new(model, DecodePolicy::TeacherForcing)
}

#[test]
fn test_training_loss_decreases() {
    let (client, device) = cpu_setup();
    let store = tiny_store(&device);
    let mut dec = decoder(&store, &device);

    let config = TrainingConfig::default()
        .with_lr(0.5)
        .with_epochs(30)
        .with_batch_size(3)
        .with_max_grad_norm(Some(5.0));
    let mut trainer = SeqTrainer::new(config, Sgd::new(SgdConfig::default()).expect("sgd"))
        .expect("trainer")
        .with_max_decode_steps(5);
    let mut hooks = trainer.default_hooks();

    let summaries = trainer
        .fit(&client, &mut dec, &store, &mut hooks)
        .expect("fit");
    assert_eq!(summaries.len(), 30);

    let first = summaries.first().unwrap().train_loss;
    let last = summaries.last().unwrap().train_loss;
    assert!(last < first, "loss went from {first} to {last}");
    assert!(summaries.iter().all(|s| s.valid_accuracies.is_some()));
}

#[test]
fn test_copy_model_trains() {
    let (client, device) = cpu_setup();
    let store = tiny_store(&device);
    let model = CopyTransition::for_encoders(
        TransitionConfig::default().with_dims(8, 16).with_seed(5),
        store.inp_encoder().as_ref(),
        store.out_encoder().as_ref(),
        &device,
    )
    .expect("copy model");
    let mut dec = SeqDecoder::new(model, DecodePolicy::TeacherForcing);

    let config = TrainingConfig::default()
        .with_lr(0.5)
        .with_epochs(20)
        .with_batch_size(3)
        .with_max_grad_norm(Some(5.0));
    let mut trainer = SeqTrainer::new(config, Sgd::new(SgdConfig::default()).expect("sgd"))
        .expect("trainer")
        .with_max_decode_steps(5);
    let mut hooks = trainer.default_hooks();

    let summaries = trainer
        .fit(&client, &mut dec, &store, &mut hooks)
        .expect("fit");
    let first = summaries.first().unwrap().train_loss;
    let last = summaries.last().unwrap().train_loss;
    assert!(last.is_finite());
    assert!(last < first, "loss went from {first} to {last}");
}

#[test]
fn test_explicit_hooks_and_early_stopping() {
    let (client, device) = cpu_setup();
    let store = tiny_store(&device);
    let mut dec = decoder(&store, &device);

    // zero learning rate: validation never improves after the first epoch
    let config = TrainingConfig::default()
        .with_lr(0.0)
        .with_epochs(10)
        .with_batch_size(2)
        .with_max_grad_norm(None);
    let mut trainer = SeqTrainer::new(config, Sgd::new(SgdConfig::default()).expect("sgd"))
        .expect("trainer")
        .with_max_decode_steps(4);
    let mut hooks: Vec<Box<dyn TrainingHook<CpuRuntime>>> = vec![
        Box::new(GradClipHook::new(1.0)),
        Box::new(EarlyStoppingHook::new(StopMetric::ValidLoss, 2)),
    ];

    let summaries = trainer
        .fit(&client, &mut dec, &store, &mut hooks)
        .expect("fit");
    assert_eq!(summaries.len(), 3);
    assert_eq!(hooks[0].name(), "grad_clip");
    assert_eq!(trainer.global_step(), 6);
}

#[test]
fn test_pipeline_from_files() {
    let (client, device) = cpu_setup();
    let dir = tempfile::tempdir().expect("tempdir");

    let data_path = dir.path().join("data.jsonl");
    let mut data = std::fs::File::create(&data_path).expect("data file");
    writeln!(data, r#"{{"input": "list cities", "output": "city ( all )", "split": "train"}}"#).unwrap();
    writeln!(data, r#"{{"input": "list rivers", "output": "river ( all )", "split": "train"}}"#).unwrap();
    writeln!(data, r#"{{"input": "list states", "output": "state ( all )", "split": "test"}}"#).unwrap();

    let config_path = dir.path().join("config.yaml");
    std::fs::write(
        &config_path,
        "model:\n  embed_dim: 4\n  hidden_dim: 8\ntraining:\n  epochs: 2\n  batch_size: 2\n  warmup_epochs: 1\n  cosine_cycles: 1\nvocab:\n  min_freq: 1\n",
    )
    .expect("config file");

    let config = ExperimentConfig::load_yaml(&config_path).expect("config");
    let examples = load_examples(&data_path).expect("examples");
    assert_eq!(examples.len(), 3);

    let (inp, out) = config.vocab.encoders();
    let store = ExampleStore::<CpuRuntime>::build(&examples, inp, out, config.vocab.min_freq, &device)
        .expect("store");
    // "state" appears only in the test split
    let state_id = store.out_encoder().token_id("state");
    assert!(store.out_encoder().rare_ids().contains(&state_id));

    let model = RecurrentTransition::for_encoders(
        config.model.clone(),
        store.inp_encoder().as_ref(),
        store.out_encoder().as_ref(),
        &device,
    )
    .expect("model");
    let mut dec = SeqDecoder::new(model, DecodePolicy::TeacherForcing);
    let mut trainer = SeqTrainer::new(
        config.training.clone(),
        Sgd::new(SgdConfig::default()).expect("sgd"),
    )
    .expect("trainer")
    .with_max_decode_steps(config.decoding.max_steps);
    let mut hooks = trainer.default_hooks();

    let summaries = trainer
        .fit(&client, &mut dec, &store, &mut hooks)
        .expect("fit");
    assert_eq!(summaries.len(), 2);
    // warmup: first epoch runs at lr 0
    assert_eq!(summaries[0].lr, 0.0);
    assert!(summaries.iter().all(|s| s.valid_loss.is_none()));

    let test = store.batches(Split::Test, 4, None, &client).expect("test batches");
    let (loss, acc) = trainer.evaluate(&client, &mut dec, test).expect("evaluate");
    assert!(loss.is_finite());
    assert!(acc.sequence <= 1.0);
}

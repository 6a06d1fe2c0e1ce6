use std::{path::Path, sync::Arc};

use burn::{
    backend::{Autodiff, NdArray},
    data::dataset::InMemDataset,
    module::{AutodiffModule, Module},
    optim::{momentum::MomentumConfig, GradientsParams, Optimizer, SgdConfig},
    record::{FullPrecisionSettings, Record},
    tensor::{backend::AutodiffBackend, Tensor},
};
use image::{Rgb, RgbImage};
use mutual_guide::{
    checkpoint::{self, checkpoint_path, Checkpoint, CheckpointTag, RecordItem},
    config::{DatasetKind, Precision, RunConfig},
    data::{Annotation, DetectionItem},
    dataset::SharedTrainDataset,
    error::HarnessError,
    loss::MultiBoxLoss,
    model::{AnchorDetector, AnchorDetectorConfig, Detector},
    prior::PriorBox,
    training::train,
};

type InnerBackend = NdArray<f32>;
type TrainBackend = Autodiff<InnerBackend>;

fn items(n: usize) -> Vec<DetectionItem> {
    (0..n)
        .map(|i| {
            let image = RgbImage::from_pixel(32, 32, Rgb([40 * i as u8, 90, 200]));
            DetectionItem::new(image, vec![Annotation::new([0.1, 0.2, 0.6, 0.7], i % 2)])
        })
        .collect()
}

fn dataset(n: usize) -> SharedTrainDataset {
    Arc::new(InMemDataset::new(items(n)))
}

fn config(save_folder: &Path, max_epoch: usize) -> RunConfig {
    RunConfig::new()
        .with_dataset(DatasetKind::Voc)
        .with_image_size(32)
        .with_anchor_size(16.0)
        .with_batch_size(2)
        .with_max_epoch(max_epoch)
        .with_warm_iter(1)
        .with_log_interval(1)
        .with_precision(Precision::Full)
        .with_save_folder(save_folder.to_string_lossy().into_owned())
}

fn run(config: &RunConfig, resume: Option<&Path>) -> anyhow::Result<mutual_guide::training::TrainReport> {
    let device = Default::default();
    let model = AnchorDetectorConfig::new(2).with_width(8).init::<TrainBackend>(&device);
    let optimizer = SgdConfig::new().init::<TrainBackend, AnchorDetector<TrainBackend>>();
    let loss = MultiBoxLoss::new(config.loss_mode);
    let priors = PriorBox::new(config.anchor_size, config.image_size);
    train(config, dataset(4), model, optimizer, &loss, &priors, resume, &device)
}

fn iterations(report: &mutual_guide::training::TrainReport) -> Vec<usize> {
    report.checkpoints.iter().map(|(it, _)| *it).collect()
}

#[test]
fn checkpoints_at_every_epoch_boundary_and_at_the_end() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), 2);

    let report = run(&config, None).unwrap();
    assert_eq!(report.start_iter, 0);
    assert_eq!(report.end_iter, 4);
    assert_eq!(iterations(&report), vec![0, 2, 4]);
    assert!(dir.path().join("config.json").exists());
    assert!(checkpoint_path(&config, CheckpointTag::Ckpt).exists());
    assert!(checkpoint_path(&config, CheckpointTag::Final).exists());
}

#[test]
fn resume_continues_from_stored_iteration() {
    let dir = tempfile::tempdir().unwrap();
    run(&config(dir.path(), 2), None).unwrap();

    // the periodic checkpoint holds the last boundary of the first run
    let longer = config(dir.path(), 3);
    let ckpt = checkpoint_path(&longer, CheckpointTag::Ckpt);
    let report = run(&longer, Some(&ckpt)).unwrap();

    assert_eq!(report.start_iter, 2);
    assert_eq!(report.end_iter, 6);
    assert_eq!(iterations(&report), vec![4, 6]);
}

#[test]
fn dataset_smaller_than_a_batch_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), 1).with_batch_size(8);

    let err = run(&config, None).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<HarnessError>(),
        Some(HarnessError::EmptyEpoch { len: 4, batch_size: 8 })
    ));
}

#[test]
fn final_weights_load_into_a_fresh_model() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), 1);
    run(&config, None).unwrap();

    let device = Default::default();
    let path = checkpoint_path(&config, CheckpointTag::Final);
    let images = Tensor::<InnerBackend, 4>::ones([1, 3, 32, 32], &device);

    let (first, iteration) = checkpoint::load_weights(
        AnchorDetectorConfig::new(2).with_width(8).init::<InnerBackend>(&device),
        &path,
        &device,
    )
    .unwrap();
    let (second, _) = checkpoint::load_weights(
        AnchorDetectorConfig::new(2).with_width(8).init::<InnerBackend>(&device),
        &path,
        &device,
    )
    .unwrap();
    assert_eq!(iteration, 2);

    let a = first.deploy().forward(images.clone()).conf.into_data().convert::<f32>().value;
    let b = second.deploy().forward(images).conf.into_data().convert::<f32>().value;
    assert_eq!(a, b);
}

fn record_values<B, M, O>(model: &M, optimizer: &O) -> (serde_json::Value, serde_json::Value)
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    let model = serde_json::to_value(model.clone().into_record().into_item::<FullPrecisionSettings>()).unwrap();
    let optimizer = serde_json::to_value(optimizer.to_record().into_item::<FullPrecisionSettings>()).unwrap();
    (model, optimizer)
}

fn restore<B, M, O>(model: M, optimizer: O, path: &Path, device: &B::Device) -> (M, O)
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    let restored: Checkpoint<RecordItem<B, M::Record>, RecordItem<B, O::Record>> = checkpoint::load(path).unwrap();
    let model = model.load_record(<M::Record as Record<B>>::from_item::<FullPrecisionSettings>(restored.model, device));
    let optimizer =
        optimizer.load_record(<O::Record as Record<B>>::from_item::<FullPrecisionSettings>(restored.optimizer, device));
    (model, optimizer)
}

#[test]
fn weights_and_momentum_survive_a_checkpoint_bit_for_bit() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    let device = Default::default();
    let images = Tensor::<TrainBackend, 4>::ones([2, 3, 32, 32], &device);

    let sgd = SgdConfig::new().with_momentum(Some(
        MomentumConfig::new().with_momentum(0.9).with_dampening(0.0).with_nesterov(true),
    ));
    let mut model = AnchorDetectorConfig::new(2).with_width(8).init::<TrainBackend>(&device);
    let mut optimizer = sgd.init::<TrainBackend, AnchorDetector<TrainBackend>>();
    for _ in 0..2 {
        let output = model.forward(images.clone());
        let loss = (output.loc.clone() * output.loc).mean() + output.conf.mean();
        let grads = GradientsParams::from_grads(loss.backward(), &model);
        model = optimizer.step(0.1, model, grads);
    }

    let saved = Checkpoint {
        model: model.clone().into_record().into_item::<FullPrecisionSettings>(),
        optimizer: optimizer.to_record().into_item::<FullPrecisionSettings>(),
        iteration: 2,
    };
    checkpoint::write_atomic(&path, saved).unwrap();

    let fresh = AnchorDetectorConfig::new(2).with_width(8).init::<TrainBackend>(&device);
    let (loaded, loaded_optimizer) =
        restore::<TrainBackend, _, _>(fresh, sgd.init::<TrainBackend, AnchorDetector<TrainBackend>>(), &path, &device);

    let (model_before, optimizer_before) = record_values::<TrainBackend, _, _>(&model, &optimizer);
    let (model_after, optimizer_after) = record_values::<TrainBackend, _, _>(&loaded, &loaded_optimizer);
    assert_eq!(model_before, model_after);
    assert_eq!(optimizer_before, optimizer_after);

    let bits = |m: &AnchorDetector<TrainBackend>| -> Vec<u32> {
        let input = Tensor::<InnerBackend, 4>::ones([1, 3, 32, 32], &device);
        m.valid().forward(input).conf.into_data().convert::<f32>().value.iter().map(|v| v.to_bits()).collect()
    };
    assert_eq!(bits(&model), bits(&loaded));
}

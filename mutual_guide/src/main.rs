use std::path::PathBuf;

use anyhow::Context;
use burn::{
    module::Module,
    optim::{decay::WeightDecayConfig, momentum::MomentumConfig, SgdConfig},
    tensor::backend::AutodiffBackend,
};
use clap::{Parser, Subcommand};
use env_logger::Env;
use mutual_guide::{
    backend::{self, Device, InnerBackend, MixedTrainBackend, TrainBackend},
    checkpoint,
    config::{Precision, RunConfig},
    dataset::{open_eval_dataset, open_train_dataset},
    evaluation::{evaluate, trained_model_path},
    loss::MultiBoxLoss,
    model::{AnchorDetector, AnchorDetectorConfig, Detector},
    prior::PriorBox,
    training::{seeded_detector, train},
};

#[derive(Parser, Debug)]
#[command(name = "mutual_guide", about = "Train and evaluate anchor-based object detectors")]
struct Cli {
    /// JSON run configuration
    #[arg(long, default_value = "config.json")]
    config: PathBuf,

    /// Dataset override (COCO, VOC or XML)
    #[arg(long)]
    dataset: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the optimization schedule
    Train {
        /// Checkpoint to resume model, optimizer and iteration from
        #[arg(long, value_name = "PATH")]
        resume_ckpt: Option<PathBuf>,
    },
    /// Evaluate a trained model on the evaluation split
    Eval {
        /// Weights to load; defaults to the run's Final checkpoint
        #[arg(long, value_name = "PATH")]
        trained_model: Option<PathBuf>,
    },
}

fn run_train<B: AutodiffBackend<Device = Device>>(config: &RunConfig, resume: Option<PathBuf>) -> anyhow::Result<()> {
    let device = backend::default_device();
    let dataset = open_train_dataset(config).context("Failed to open training dataset")?;
    let detector = AnchorDetectorConfig::new(dataset.class_names.len());
    let model = seeded_detector::<B>(config, &detector, &device);
    log::info!(
        "Model has {} parameters, {:.2} GFLOPs at {}x{}",
        model.num_params(),
        model.flops(config.image_size) as f64 / 1e9,
        config.image_size,
        config.image_size
    );

    let optimizer = SgdConfig::new()
        .with_momentum(Some(
            MomentumConfig::new()
                .with_momentum(config.momentum)
                .with_dampening(0.0)
                .with_nesterov(true),
        ))
        .with_weight_decay(Some(WeightDecayConfig::new(config.weight_decay)))
        .init::<B, AnchorDetector<B>>();
    let loss = MultiBoxLoss::new(config.loss_mode);
    let priors = PriorBox::new(config.anchor_size, config.image_size);

    let report = train(config, dataset.items, model, optimizer, &loss, &priors, resume.as_deref(), &device)?;
    for (iteration, path) in &report.checkpoints {
        log::info!("Checkpoint at iteration {iteration}: {}", path.display());
    }
    Ok(())
}

fn run_eval(config: &RunConfig, trained_model: Option<PathBuf>) -> anyhow::Result<()> {
    let device = backend::default_device();
    let dataset = open_eval_dataset(config).context("Failed to open evaluation dataset")?;
    let path = trained_model_path(config, trained_model);
    log::info!("Loading weights from {}", path.display());

    let model = AnchorDetectorConfig::new(dataset.num_classes()).init::<InnerBackend>(&device);
    let (model, iteration) = checkpoint::load_weights(model, &path, &device)
        .with_context(|| format!("Failed to load {}", path.display()))?;
    let model = model.deploy();
    log::info!(
        "Model has {} parameters, {:.2} GFLOPs, trained for {iteration} iterations",
        model.num_params(),
        model.flops(config.image_size) as f64 / 1e9
    );

    let priors = PriorBox::new(config.anchor_size, config.image_size);
    let summary = evaluate::<InnerBackend, _, _>(config, &model, dataset.as_ref(), &priors, &device)?;
    for class in &summary.classes {
        log::info!("{:>16}: {} detections in {} images", class.name, class.detections, class.images);
    }
    for file in &summary.result_files {
        log::info!("Results written to {}", file.display());
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = RunConfig::resolve(&cli.config, cli.dataset.as_deref())?;

    match cli.command {
        Command::Train { resume_ckpt } => match config.precision {
            Precision::Mixed if backend::reduced_precision_available() => {
                run_train::<MixedTrainBackend>(&config, resume_ckpt)
            }
            Precision::Mixed => {
                log::warn!("Backend has no half precision element, mixed precision trains in f32 with loss scaling");
                run_train::<TrainBackend>(&config, resume_ckpt)
            }
            Precision::Full => run_train::<TrainBackend>(&config, resume_ckpt),
        },
        Command::Eval { trained_model } => run_eval(&config, trained_model),
    }
}

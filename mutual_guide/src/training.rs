use std::path::{Path, PathBuf};

use anyhow::Context;
use burn::{config::Config, data::dataset::Dataset, module::{AutodiffModule, Module}, optim::{GradientsParams, Optimizer}, record::{FullPrecisionSettings, Record}, tensor::{backend::{AutodiffBackend, Backend}, ElementConversion}};

use crate::{
    checkpoint::{self, Checkpoint, CheckpointTag, RecordItem},
    config::RunConfig,
    data::{DetectionBatch, DetectionBatcher, EpochSampler},
    dataset::SharedTrainDataset,
    ema::ModelEma,
    error::HarnessError,
    loss::DetectionLoss,
    model::{AnchorDetector, AnchorDetectorConfig, Detector},
    prefetch::DataPrefetcher,
    prior::PriorBox,
    scaler::{GradScaler, StepOutcome},
    schedule::LrSchedule,
    timer::Timer,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainState {
    Warmup,
    Steady,
    Done,
}

impl TrainState {
    pub fn at(iteration: usize, warm_iter: usize, end_iter: usize) -> Self {
        if iteration >= end_iter {
            TrainState::Done
        } else if iteration < warm_iter {
            TrainState::Warmup
        } else {
            TrainState::Steady
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainReport {
    pub start_iter: usize,
    pub end_iter: usize,
    /// Steps dropped because the scaled gradients overflowed.
    pub skipped_steps: usize,
    /// Every checkpoint written, with the iteration stored in it.
    pub checkpoints: Vec<(usize, PathBuf)>,
}

/// Seeds the backend with `config.seed` and builds the detector, so weight
/// initialization is reproducible across runs.
pub fn seeded_detector<B: Backend>(
    config: &RunConfig,
    detector: &AnchorDetectorConfig,
    device: &B::Device,
) -> AnchorDetector<B> {
    B::seed(config.seed);
    detector.init(device)
}

fn epoch_prefetcher<B: AutodiffBackend>(
    dataset: &SharedTrainDataset,
    batcher: &DetectionBatcher<B>,
    config: &RunConfig,
    epoch: usize,
) -> DataPrefetcher<DetectionBatch<B>> {
    let sampler = EpochSampler::new(dataset.clone(), config.batch_size, config.seed + epoch as u64);
    DataPrefetcher::new(sampler, batcher.clone())
}

fn save_ema<B, M, O>(
    config: &RunConfig,
    tag: CheckpointTag,
    ema: &ModelEma<B::InnerBackend, M::InnerModule>,
    optimizer: &O,
    iteration: usize,
) -> anyhow::Result<PathBuf>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    let checkpoint = Checkpoint {
        model: ema.ema().clone().into_record().into_item::<FullPrecisionSettings>(),
        optimizer: optimizer.to_record().into_item::<FullPrecisionSettings>(),
        iteration,
    };
    let path = checkpoint::save(config, tag, checkpoint)?;
    Ok(path)
}

/// Runs the whole optimization schedule and returns what happened.
///
/// One epoch is `len / batch_size` full batches and the run ends after
/// `max_epoch` of them. Every epoch boundary writes a `CKPT` checkpoint of the
/// averaged weights before the first step of the epoch; the end of the run
/// writes `Final`. `resume` restores model, optimizer and iteration from a
/// checkpoint, and the boundary it was written at is not written again.
#[allow(clippy::too_many_arguments)]
pub fn train<B, M, O, L>(
    config: &RunConfig,
    dataset: SharedTrainDataset,
    model: M,
    optimizer: O,
    loss: &L,
    priors: &PriorBox,
    resume: Option<&Path>,
    device: &B::Device,
) -> anyhow::Result<TrainReport>
where
    B: AutodiffBackend,
    M: Detector<B> + AutodiffModule<B>,
    O: Optimizer<M, B>,
    L: DetectionLoss<B>,
{
    config.validate()?;
    let epoch_size = dataset.len() / config.batch_size;
    if epoch_size == 0 {
        return Err(HarnessError::EmptyEpoch {
            len: dataset.len(),
            batch_size: config.batch_size,
        }
        .into());
    }
    let end_iter = epoch_size * config.max_epoch;

    std::fs::create_dir_all(&config.save_folder)
        .with_context(|| format!("Failed to create {}", config.save_folder))?;
    config
        .save(Path::new(&config.save_folder).join("config.json"))
        .context("Failed to save config")?;

    let (mut model, mut optimizer, start_iter) = match resume {
        Some(path) => {
            log::info!("Resuming checkpoint from {}", path.display());
            let restored: Checkpoint<RecordItem<B, M::Record>, RecordItem<B, O::Record>> = checkpoint::load(path)?;
            let model = model.load_record(<M::Record as Record<B>>::from_item::<FullPrecisionSettings>(restored.model, device));
            let optimizer =
                optimizer.load_record(<O::Record as Record<B>>::from_item::<FullPrecisionSettings>(restored.optimizer, device));
            (model, optimizer, restored.iteration)
        }
        None => (model, optimizer, 0),
    };

    let schedule = LrSchedule::new(config.lr, config.warmup_lr, config.min_lr, config.warm_iter, end_iter);
    let mut ema = ModelEma::new(model.valid(), config.ema_decay, config.ema_tau).with_updates(start_iter);
    let mut scaler = GradScaler::new(config.precision);
    let batcher = DetectionBatcher::<B>::new(device.clone(), config.image_size);
    let mut prefetcher: Option<DataPrefetcher<DetectionBatch<B>>> = None;
    let mut timer = Timer::new();
    let mut state = TrainState::at(start_iter, config.warm_iter, end_iter);

    let mut report = TrainReport {
        start_iter,
        end_iter,
        skipped_steps: 0,
        checkpoints: Vec::new(),
    };

    log::info!(
        "Training {}-{}-{} on {} with {} images",
        config.loss_mode.tag(),
        config.neck,
        config.backbone,
        config.dataset,
        dataset.len()
    );

    for iteration in start_iter..end_iter {
        let epoch = iteration / epoch_size;
        let boundary = iteration % epoch_size == 0;

        if boundary && !(resume.is_some() && iteration == start_iter) {
            let path = save_ema::<B, M, O>(config, CheckpointTag::Ckpt, &ema, &optimizer, iteration)?;
            report.checkpoints.push((iteration, path));
        }
        if boundary || prefetcher.is_none() {
            // stop the previous epoch's worker before starting the next one
            drop(prefetcher.take());
            prefetcher = Some(epoch_prefetcher(&dataset, &batcher, config, epoch));
            log::info!("Epoch {}/{}: training mode", epoch + 1, config.max_epoch);
        }

        let next = TrainState::at(iteration, config.warm_iter, end_iter);
        if next != state {
            log::info!("Iteration {iteration}: {state:?} -> {next:?}");
            state = next;
        }

        timer.tic();
        let lr = schedule.lr_at(iteration);
        let batch = match prefetcher.as_mut().and_then(|p| p.next()) {
            Some(batch) => batch,
            None => {
                log::warn!("Epoch {} ran out of batches at iteration {iteration}, restarting it", epoch + 1);
                drop(prefetcher.take());
                let mut fresh = epoch_prefetcher(&dataset, &batcher, config, epoch);
                let batch = fresh.next().ok_or(HarnessError::EmptyEpoch {
                    len: dataset.len(),
                    batch_size: config.batch_size,
                })?;
                prefetcher = Some(fresh);
                batch
            }
        };

        let output = model.forward(batch.images);
        let loss_value = loss.compute(output, priors, &batch.targets);
        let grads = GradientsParams::from_grads(scaler.scale(loss_value.clone()).backward(), &model);
        let (stepped, outcome) = scaler.step::<B, M, O>(lr, model, grads, &mut optimizer);
        model = stepped;
        if outcome == StepOutcome::Skipped {
            report.skipped_steps += 1;
            log::debug!("Iteration {iteration}: gradient overflow, step skipped, loss scale now {}", scaler.scale_factor());
        }
        ema.update(&model.valid());
        let iter_time = timer.toc();

        if iteration % config.log_interval == 0 {
            let loss_scalar: f64 = loss_value.into_scalar().elem();
            log::info!(
                "iter {}/{}, lr {:.6}, loss {:.2}, time {:.2}s, eta {:.2}h",
                iteration,
                end_iter,
                lr,
                loss_scalar,
                iter_time,
                iter_time * (end_iter - iteration) as f64 / 3600.0
            );
            timer.clear();
        }
    }
    drop(prefetcher);

    let path = save_ema::<B, M, O>(config, CheckpointTag::Final, &ema, &optimizer, end_iter)?;
    report.checkpoints.push((end_iter, path));
    log::info!(
        "Training done: {} iterations, {} skipped steps",
        end_iter.saturating_sub(start_iter),
        report.skipped_steps
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_follows_iteration() {
        assert_eq!(TrainState::at(0, 10, 100), TrainState::Warmup);
        assert_eq!(TrainState::at(10, 10, 100), TrainState::Steady);
        assert_eq!(TrainState::at(99, 10, 100), TrainState::Steady);
        assert_eq!(TrainState::at(100, 10, 100), TrainState::Done);
        assert_eq!(TrainState::at(0, 0, 5), TrainState::Steady);
    }
}

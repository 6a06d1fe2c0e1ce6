use std::path::{Path, PathBuf};

use anyhow::Context;
use burn::tensor::backend::Backend;

use crate::{
    backend::{device_name, synchronize},
    checkpoint::{checkpoint_path, CheckpointTag},
    config::{MatchingMode, RunConfig},
    data::image_tensor,
    dataset::EvalDataset,
    detections::DetectionSet,
    matcher::SeqBoxMatcher,
    model::Detector,
    postprocess::post_process,
    prior::PriorBox,
    timer::Timer,
    visualize::Visualizer,
};

/// The weights to evaluate: `explicit` when given, otherwise the `Final`
/// checkpoint the same configuration trains to.
pub fn trained_model_path(config: &RunConfig, explicit: Option<PathBuf>) -> PathBuf {
    explicit.unwrap_or_else(|| checkpoint_path(config, CheckpointTag::Final))
}

/// Images between two timing reports; never zero.
pub fn report_interval(num_images: usize) -> usize {
    (num_images / 10).max(1)
}

/// Runs the detector over every image of `dataset` and returns the dataset's
/// own scoring of the accumulated detections.
///
/// Per image: resize and normalize, a timed forward pass between two device
/// synchronizations, then timed decoding with suppression, optional sequential
/// smoothing and per-class thresholding. With `vis` enabled an annotated copy
/// of the image is written to `{vis_folder}/{dataset}/{index}.jpg`.
pub fn evaluate<B, M, D>(
    config: &RunConfig,
    model: &M,
    dataset: &D,
    priors: &PriorBox,
    device: &B::Device,
) -> anyhow::Result<D::Metrics>
where
    B: Backend,
    M: Detector<B>,
    D: EvalDataset + ?Sized,
{
    let num_images = dataset.len();
    let mut detections = DetectionSet::new(dataset.num_classes(), num_images);
    let mut matcher = match config.matching {
        MatchingMode::Sequential => {
            let matcher_config = config.matcher.clone().with_score_thresh(config.eval_thresh);
            Some(SeqBoxMatcher::new(matcher_config))
        }
        MatchingMode::Independent => None,
    };
    let visualizer = match config.vis {
        true => Some(Visualizer::new(dataset.class_names().to_vec(), config.font_path.as_deref())?),
        false => None,
    };
    let vis_dir = Path::new(&config.vis_folder).join(config.dataset.name());
    let device_label = device_name::<B>(device);

    let mut detect_timer = Timer::new();
    let mut nms_timer = Timer::new();
    let interval = report_interval(num_images);

    log::info!("Start evaluation on {} ({} images)", dataset.name(), num_images);
    for i in 0..num_images {
        let image = dataset
            .pull_image(i)
            .with_context(|| format!("Failed to load image {i} of {}", dataset.name()))?;
        let (width, height) = image.dimensions();
        let scale = [width as f32, height as f32, width as f32, height as f32];
        let input = image_tensor::<B>(&image, config.image_size, device);

        synchronize::<B>(device);
        detect_timer.tic();
        let output = model.forward(input);
        synchronize::<B>(device);
        let detect_time = detect_timer.toc();

        nms_timer.tic();
        let (boxes, scores) = post_process(output, priors, scale, config.eval_thresh, config.nms_thresh);
        let (boxes, scores) = match matcher.as_mut() {
            Some(matcher) => matcher.update(boxes.view(), scores.view()),
            None => (boxes, scores),
        };
        detections.accumulate(i, boxes.view(), scores.view(), config.eval_thresh);
        let nms_time = nms_timer.toc();

        if let Some(visualizer) = &visualizer {
            let mut canvas = image;
            visualizer.draw_detections(&mut canvas, &detections, i);
            let caption = format!(
                "MutualGuide ({s}x{s}) : {:.2}ms on {}",
                detect_time * 1000.0,
                device_label,
                s = config.image_size
            );
            visualizer.draw_caption(&mut canvas, &caption);
            Visualizer::save(&canvas, &vis_dir.join(format!("{i}.jpg")))?;
        }

        if i > 0 && i % interval == 0 {
            log::info!(
                "[{}/{}] model inference = {:.2}ms, post process = {:.2}ms",
                i,
                num_images,
                detect_time * 1000.0,
                nms_time * 1000.0
            );
            detect_timer.clear();
            nms_timer.clear();
        }
    }

    log::info!("Evaluating {} detections", detections.total());
    dataset.evaluate_detections(&detections)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_interval_is_never_zero() {
        assert_eq!(report_interval(0), 1);
        assert_eq!(report_interval(3), 1);
        assert_eq!(report_interval(25), 2);
        assert_eq!(report_interval(5000), 500);
    }

    #[test]
    fn missing_weights_fall_back_to_final_checkpoint() {
        let config = RunConfig::new().with_save_folder("runs".into());
        let derived = trained_model_path(&config, None);
        assert_eq!(derived, Path::new("runs").join("COCO_fpn_resnet18_size320_anchor24.0_MG_Final.json"));

        let explicit = trained_model_path(&config, Some(PathBuf::from("w.json")));
        assert_eq!(explicit, PathBuf::from("w.json"));
    }
}

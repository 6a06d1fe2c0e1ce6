//! Datasets the harness trains and evaluates on.
//!
//! Training goes through burn's [`Dataset`] of [`DetectionItem`]s. Evaluation
//! goes through [`EvalDataset`], which hands out raw images one at a time and
//! scores the accumulated [`DetectionSet`] at the end.

mod coco;
mod voc;

use std::{path::{Path, PathBuf}, sync::Arc};

use burn::data::dataset::Dataset;
use image::RgbImage;

pub use self::{coco::CocoDataset, voc::{parse_voc_annotation, VocAnnotation, VocDataset, VocObject, OBJ_CLASSES}};
use crate::{config::{DatasetKind, RunConfig}, data::DetectionItem, detections::DetectionSet};

pub trait EvalDataset {
    type Metrics: std::fmt::Debug;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Original, unresized image `index`.
    fn pull_image(&self, index: usize) -> anyhow::Result<RgbImage>;

    fn class_names(&self) -> &[String];

    fn num_classes(&self) -> usize {
        self.class_names().len()
    }

    fn name(&self) -> &str;

    fn evaluate_detections(&self, detections: &DetectionSet) -> anyhow::Result<Self::Metrics>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassSummary {
    pub name: String,
    pub detections: usize,
    pub images: usize,
}

/// What the reference datasets report after writing their result files.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionSummary {
    pub dataset: String,
    pub classes: Vec<ClassSummary>,
    pub result_files: Vec<PathBuf>,
}

impl DetectionSummary {
    pub(crate) fn new(dataset: &str, class_names: &[String], detections: &DetectionSet) -> Self {
        let classes = class_names
            .iter()
            .enumerate()
            .map(|(class, name)| ClassSummary {
                name: name.clone(),
                detections: detections.class(class).iter().map(|d| d.nrows()).sum(),
                images: detections.class(class).iter().filter(|d| d.nrows() > 0).count(),
            })
            .collect();
        Self {
            dataset: dataset.to_string(),
            classes,
            result_files: Vec::new(),
        }
    }

    pub fn total(&self) -> usize {
        self.classes.iter().map(|c| c.detections).sum()
    }
}

pub type SharedTrainDataset = Arc<dyn Dataset<DetectionItem>>;
pub type BoxedEvalDataset = Box<dyn EvalDataset<Metrics = DetectionSummary>>;

fn result_dir(config: &RunConfig) -> PathBuf {
    Path::new(&config.save_folder).join("results")
}

/// Training items together with the class names their labels index into.
pub struct TrainDataset {
    pub items: SharedTrainDataset,
    pub class_names: Vec<String>,
}

impl TrainDataset {
    fn new<D: Dataset<DetectionItem> + EvalDataset + 'static>(dataset: D) -> Self {
        let class_names = dataset.class_names().to_vec();
        Self {
            items: Arc::new(dataset),
            class_names,
        }
    }
}

pub fn open_train_dataset(config: &RunConfig) -> anyhow::Result<TrainDataset> {
    let root = Path::new(&config.data_root);
    let dataset = match config.dataset {
        DatasetKind::Coco => TrainDataset::new(CocoDataset::new(root, "train", "2017")?),
        DatasetKind::Voc => TrainDataset::new(VocDataset::voc(root, &[("2007", "trainval"), ("2012", "trainval")])?),
        DatasetKind::Xml => TrainDataset::new(VocDataset::xml(root, "train")?),
    };
    Ok(dataset)
}

pub fn open_eval_dataset(config: &RunConfig) -> anyhow::Result<BoxedEvalDataset> {
    let root = Path::new(&config.data_root);
    let dataset: BoxedEvalDataset = match config.dataset {
        DatasetKind::Coco => Box::new(CocoDataset::new(root, "val", "2017")?.with_result_dir(result_dir(config))),
        DatasetKind::Voc => Box::new(VocDataset::voc(root, &[("2007", "test")])?.with_result_dir(result_dir(config))),
        DatasetKind::Xml => Box::new(VocDataset::xml(root, "val")?.with_result_dir(result_dir(config))),
    };
    Ok(dataset)
}

/// Normalizes a pixel-space corner box by the image size, clamped to `[0, 1]`.
pub(crate) fn normalize(bbox: [f32; 4], width: u32, height: u32) -> [f32; 4] {
    let (w, h) = (width.max(1) as f32, height.max(1) as f32);
    [
        (bbox[0] / w).clamp(0.0, 1.0),
        (bbox[1] / h).clamp(0.0, 1.0),
        (bbox[2] / w).clamp(0.0, 1.0),
        (bbox[3] / h).clamp(0.0, 1.0),
    ]
}

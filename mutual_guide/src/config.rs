use std::{fmt::Display, path::Path, str::FromStr};

use burn::config::Config;
use serde::{Deserialize, Serialize};

use crate::{error::HarnessError, matcher::SeqMatcherConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DatasetKind {
    Coco,
    Voc,
    Xml,
}

impl DatasetKind {
    pub fn name(&self) -> &'static str {
        match self {
            DatasetKind::Coco => "COCO",
            DatasetKind::Voc => "VOC",
            DatasetKind::Xml => "XML",
        }
    }
}

impl Display for DatasetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DatasetKind {
    type Err = HarnessError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_uppercase().as_str() {
            "COCO" => Ok(DatasetKind::Coco),
            "VOC" => Ok(DatasetKind::Voc),
            "XML" => Ok(DatasetKind::Xml),
            _ => Err(HarnessError::UnknownDataset(value.to_string())),
        }
    }
}

/// Target assignment used by the multibox loss. Part of every checkpoint name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LossMode {
    Retina,
    MutualGuide,
}

impl LossMode {
    pub fn tag(&self) -> &'static str {
        match self {
            LossMode::Retina => "Retina",
            LossMode::MutualGuide => "MG",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchingMode {
    /// Every image is post-processed on its own.
    Independent,
    /// Detections are carried across consecutive images by [`crate::matcher::SeqBoxMatcher`].
    Sequential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Precision {
    Full,
    /// Dynamic loss scaling with overflow skipping.
    Mixed,
}

#[derive(Config)]
pub struct RunConfig {
    #[config(default = "DatasetKind::Coco")]
    pub dataset: DatasetKind,
    #[config(default = "String::from(\"datasets\")")]
    pub data_root: String,
    #[config(default = 320)]
    pub image_size: usize,
    #[config(default = "String::from(\"resnet18\")")]
    pub backbone: String,
    #[config(default = "String::from(\"fpn\")")]
    pub neck: String,
    #[config(default = 24.0)]
    pub anchor_size: f32,
    #[config(default = 32)]
    pub batch_size: usize,
    #[config(default = 0.01)]
    pub lr: f64,
    #[config(default = 1.0e-6)]
    pub warmup_lr: f64,
    #[config(default = 1.0e-6)]
    pub min_lr: f64,
    #[config(default = 500)]
    pub warm_iter: usize,
    #[config(default = 70)]
    pub max_epoch: usize,
    #[config(default = 0.9)]
    pub momentum: f64,
    #[config(default = 5.0e-4)]
    pub weight_decay: f64,
    #[config(default = 0.05)]
    pub eval_thresh: f32,
    #[config(default = 0.5)]
    pub nms_thresh: f32,
    #[config(default = "String::from(\"weights\")")]
    pub save_folder: String,
    #[config(default = "LossMode::MutualGuide")]
    pub loss_mode: LossMode,
    #[config(default = "MatchingMode::Independent")]
    pub matching: MatchingMode,
    #[config(default = "SeqMatcherConfig::new()")]
    pub matcher: SeqMatcherConfig,
    #[config(default = false)]
    pub vis: bool,
    #[config(default = "String::from(\"vis\")")]
    pub vis_folder: String,
    /// TTF/OTF font used for label text on visualizations; tags are drawn without text when absent.
    pub font_path: Option<String>,
    #[config(default = "Precision::Mixed")]
    pub precision: Precision,
    #[config(default = 0.9998)]
    pub ema_decay: f64,
    #[config(default = 2000.0)]
    pub ema_tau: f64,
    #[config(default = 100)]
    pub log_interval: usize,
    #[config(default = 0)]
    pub seed: u64,
}

impl RunConfig {
    /// Loads a JSON run configuration and applies the command line dataset override.
    pub fn resolve(path: impl AsRef<Path>, dataset: Option<&str>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let mut config = Self::load(path)
            .map_err(|e| anyhow::anyhow!("Failed to load config {}: {}", path.display(), e))?;
        if let Some(dataset) = dataset {
            config.dataset = dataset.parse()?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), HarnessError> {
        if self.batch_size == 0 {
            return Err(HarnessError::Config("batch_size must be positive".into()));
        }
        if self.image_size == 0 {
            return Err(HarnessError::Config("image_size must be positive".into()));
        }
        if self.anchor_size <= 0.0 {
            return Err(HarnessError::Config("anchor_size must be positive".into()));
        }
        if !(0.0..1.0).contains(&self.eval_thresh) || !(0.0..=1.0).contains(&self.nms_thresh) {
            return Err(HarnessError::Config(format!(
                "thresholds out of range: eval_thresh={}, nms_thresh={}",
                self.eval_thresh, self.nms_thresh
            )));
        }
        if !(0.0..1.0).contains(&self.ema_decay) {
            return Err(HarnessError::Config(format!("ema_decay {} not in [0, 1)", self.ema_decay)));
        }
        if self.log_interval == 0 {
            return Err(HarnessError::Config("log_interval must be positive".into()));
        }
        Ok(())
    }
}

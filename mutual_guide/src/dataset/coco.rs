use std::{collections::HashMap, fs::{self, File}, io::{BufReader, BufWriter}, path::{Path, PathBuf}};

use anyhow::Context;
use burn::data::dataset::Dataset;
use image::RgbImage;
use serde::{Deserialize, Serialize};

use super::{normalize, DetectionSummary, EvalDataset};
use crate::{data::{Annotation, DetectionItem}, detections::DetectionSet};

#[derive(Debug, Deserialize)]
struct Instances {
    images: Vec<ImageInfo>,
    #[serde(default)]
    annotations: Vec<InstanceAnnotation>,
    categories: Vec<Category>,
}

#[derive(Debug, Clone, Deserialize)]
struct ImageInfo {
    id: u64,
    file_name: String,
}

#[derive(Debug, Deserialize)]
struct InstanceAnnotation {
    image_id: u64,
    /// `[x, y, width, height]` in pixels.
    bbox: [f32; 4],
    category_id: u64,
    #[serde(default)]
    iscrowd: u8,
}

#[derive(Debug, Deserialize)]
struct Category {
    id: u64,
    name: String,
}

#[derive(Debug, Serialize)]
struct DetectionResult {
    image_id: u64,
    category_id: u64,
    bbox: [f32; 4],
    score: f32,
}

/// COCO `instances_{split}{year}.json` with images under `images/{split}{year}`.
#[derive(Debug, Clone)]
pub struct CocoDataset {
    name: String,
    image_dir: PathBuf,
    images: Vec<ImageInfo>,
    /// Corner boxes in pixels and contiguous labels, per image.
    objects: Vec<Vec<([f32; 4], usize)>>,
    class_names: Vec<String>,
    category_ids: Vec<u64>,
    result_dir: PathBuf,
}

impl CocoDataset {
    pub fn new(root: &Path, split: &str, year: &str) -> anyhow::Result<Self> {
        let base = root.join("coco");
        let path = base.join("annotations").join(format!("instances_{split}{year}.json"));
        let reader = BufReader::new(File::open(&path).with_context(|| format!("Failed to open {}", path.display()))?);
        let instances: Instances =
            serde_json::from_reader(reader).with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(Self::from_instances(instances, base.join("images").join(format!("{split}{year}")), format!("COCO{split}{year}")))
    }

    fn from_instances(instances: Instances, image_dir: PathBuf, name: String) -> Self {
        let mut categories = instances.categories;
        categories.sort_by_key(|c| c.id);
        let label_of: HashMap<u64, usize> = categories.iter().enumerate().map(|(label, c)| (c.id, label)).collect();
        let row_of: HashMap<u64, usize> = instances.images.iter().enumerate().map(|(row, image)| (image.id, row)).collect();

        let mut objects = vec![Vec::new(); instances.images.len()];
        for annotation in instances.annotations.iter().filter(|a| a.iscrowd == 0) {
            let (Some(row), Some(label)) = (row_of.get(&annotation.image_id), label_of.get(&annotation.category_id)) else {
                log::warn!("Dropping annotation for image {} / category {}", annotation.image_id, annotation.category_id);
                continue;
            };
            let [x, y, w, h] = annotation.bbox;
            if w < 1.0 || h < 1.0 {
                continue;
            }
            objects[*row].push(([x, y, x + w, y + h], *label));
        }

        Self {
            name,
            image_dir,
            images: instances.images,
            objects,
            class_names: categories.iter().map(|c| c.name.clone()).collect(),
            category_ids: categories.iter().map(|c| c.id).collect(),
            result_dir: PathBuf::from("results"),
        }
    }

    pub fn with_result_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.result_dir = dir.into();
        self
    }

    fn load(&self, index: usize) -> anyhow::Result<DetectionItem> {
        let image = self.pull_image(index)?;
        let annotations = self.objects[index]
            .iter()
            .map(|(bbox, label)| Annotation::new(normalize(*bbox, image.width(), image.height()), *label))
            .collect();
        Ok(DetectionItem::new(image, annotations))
    }
}

impl Dataset<DetectionItem> for CocoDataset {
    fn get(&self, index: usize) -> Option<DetectionItem> {
        match self.load(index) {
            Ok(item) => Some(item),
            Err(err) => {
                log::warn!("Skipping {}[{index}]: {err:#}", self.name);
                None
            }
        }
    }

    fn len(&self) -> usize {
        self.images.len()
    }
}

impl EvalDataset for CocoDataset {
    type Metrics = DetectionSummary;

    fn len(&self) -> usize {
        self.images.len()
    }

    fn pull_image(&self, index: usize) -> anyhow::Result<RgbImage> {
        let info = self.images.get(index).with_context(|| format!("Index {index} out of range"))?;
        let path = self.image_dir.join(&info.file_name);
        let image = image::open(&path).with_context(|| format!("Failed to decode {}", path.display()))?;
        Ok(image.to_rgb8())
    }

    fn class_names(&self) -> &[String] {
        &self.class_names
    }

    fn name(&self) -> &str {
        &self.name
    }

    /// Writes the detections as a COCO results JSON (`[x, y, w, h]` boxes).
    fn evaluate_detections(&self, detections: &DetectionSet) -> anyhow::Result<DetectionSummary> {
        let mut results = Vec::new();
        for (class, category_id) in self.category_ids.iter().enumerate() {
            for (info, dets) in self.images.iter().zip(detections.class(class)) {
                for row in dets.rows() {
                    results.push(DetectionResult {
                        image_id: info.id,
                        category_id: *category_id,
                        bbox: [row[0], row[1], row[2] - row[0], row[3] - row[1]],
                        score: row[4],
                    });
                }
            }
        }

        fs::create_dir_all(&self.result_dir)?;
        let path = self.result_dir.join(format!("detections_{}_results.json", self.name));
        serde_json::to_writer(BufWriter::new(File::create(&path)?), &results)?;
        log::info!("Wrote {} detections to {}", results.len(), path.display());

        let mut summary = DetectionSummary::new(&self.name, &self.class_names, detections);
        summary.result_files.push(path);
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use image::Rgb;
    use ndarray::array;

    use super::*;

    const INSTANCES: &str = r#"{
        "images": [{"id": 7, "file_name": "a.jpg", "width": 50, "height": 20}],
        "annotations": [
            {"image_id": 7, "bbox": [5, 2, 20, 8], "category_id": 18, "iscrowd": 0},
            {"image_id": 7, "bbox": [0, 0, 50, 20], "category_id": 1, "iscrowd": 1},
            {"image_id": 9, "bbox": [0, 0, 5, 5], "category_id": 1, "iscrowd": 0}
        ],
        "categories": [{"id": 18, "name": "dog"}, {"id": 1, "name": "person"}]
    }"#;

    fn coco_root() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("coco");
        fs::create_dir_all(base.join("annotations")).unwrap();
        fs::create_dir_all(base.join("images/val2017")).unwrap();
        fs::write(base.join("annotations/instances_val2017.json"), INSTANCES).unwrap();
        RgbImage::from_pixel(50, 20, Rgb([1, 2, 3])).save(base.join("images/val2017/a.jpg")).unwrap();
        dir
    }

    #[test]
    fn categories_map_to_contiguous_labels() {
        let root = coco_root();
        let dataset = CocoDataset::new(root.path(), "val", "2017").unwrap();
        assert_eq!(dataset.name(), "COCOval2017");
        assert_eq!(dataset.class_names(), &["person".to_string(), "dog".to_string()]);

        let item = dataset.get(0).unwrap();
        assert_eq!(item.annotations, vec![Annotation::new([0.1, 0.1, 0.5, 0.5], 1)]);
    }

    #[test]
    fn results_are_written_in_coco_format() {
        let root = coco_root();
        let out = root.path().join("results");
        let dataset = CocoDataset::new(root.path(), "val", "2017").unwrap().with_result_dir(&out);

        let mut detections = DetectionSet::new(2, 1);
        detections.accumulate(0, array![[5.0f32, 2.0, 25.0, 10.0]].view(), array![[0.0f32, 0.75]].view(), 0.05);
        let summary = dataset.evaluate_detections(&detections).unwrap();
        assert_eq!(summary.total(), 1);

        let written: serde_json::Value = serde_json::from_str(&fs::read_to_string(&summary.result_files[0]).unwrap()).unwrap();
        assert_eq!(written[0]["category_id"], 18);
        assert_eq!(written[0]["image_id"], 7);
        assert_eq!(written[0]["bbox"], serde_json::json!([5.0, 2.0, 20.0, 8.0]));
    }
}

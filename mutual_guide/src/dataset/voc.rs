use std::{fs::{self, File}, io::{BufReader, BufWriter, Write}, path::{Path, PathBuf}};

use anyhow::{bail, Context};
use burn::data::dataset::Dataset;
use image::RgbImage;
use xml::{reader::XmlEvent, ParserConfig};

use super::{normalize, DetectionSummary, EvalDataset};
use crate::{data::{Annotation, DetectionItem}, detections::DetectionSet};

pub const OBJ_CLASSES: [&str; 20] = [
    "aeroplane", "bicycle", "bird", "boat", "bottle",
    "bus", "car", "cat", "chair", "cow",
    "diningtable", "dog", "horse", "motorbike", "person",
    "pottedplant", "sheep", "sofa", "train", "tvmonitor",
];

#[derive(Debug, Clone, PartialEq)]
pub struct VocObject {
    pub name: String,
    /// `[xmin, ymin, xmax, ymax]` in pixels.
    pub bbox: [f32; 4],
    pub difficult: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct VocAnnotation {
    pub filename: String,
    pub width: u32,
    pub height: u32,
    pub objects: Vec<VocObject>,
}

/// Reads a Pascal VOC annotation file.
pub fn parse_voc_annotation(path: &Path) -> anyhow::Result<VocAnnotation> {
    let file = File::open(path).with_context(|| format!("Failed to open annotation {}", path.display()))?;
    let reader = ParserConfig::default()
        .trim_whitespace(true)
        .create_reader(BufReader::new(file));

    let mut annotation = VocAnnotation::default();
    let mut stack: Vec<String> = Vec::new();

    for event in reader {
        match event.with_context(|| format!("Malformed annotation {}", path.display()))? {
            XmlEvent::StartElement { name, .. } => {
                if name.local_name == "object" && stack.last().map(String::as_str) == Some("annotation") {
                    annotation.objects.push(VocObject {
                        name: String::new(),
                        bbox: [0.0; 4],
                        difficult: false,
                    });
                }
                stack.push(name.local_name);
            }
            XmlEvent::EndElement { .. } => {
                stack.pop();
            }
            XmlEvent::Characters(data) => {
                let path: Vec<&str> = stack.iter().rev().take(3).map(String::as_str).collect();
                match path.as_slice() {
                    ["filename", "annotation", ..] => annotation.filename = data,
                    ["width", "size", ..] => annotation.width = data.parse().unwrap_or(0),
                    ["height", "size", ..] => annotation.height = data.parse().unwrap_or(0),
                    ["name", "object", ..] => {
                        if let Some(object) = annotation.objects.last_mut() {
                            object.name = data.to_lowercase();
                        }
                    }
                    ["difficult", "object", ..] => {
                        if let Some(object) = annotation.objects.last_mut() {
                            object.difficult = data == "1";
                        }
                    }
                    [coord, "bndbox", "object"] => {
                        let slot = match *coord {
                            "xmin" => 0,
                            "ymin" => 1,
                            "xmax" => 2,
                            "ymax" => 3,
                            _ => continue,
                        };
                        if let Some(object) = annotation.objects.last_mut() {
                            object.bbox[slot] = data.parse().unwrap_or(0.0);
                        }
                    }
                    _ => {}
                }
            }
            XmlEvent::EndDocument => break,
            _ => {}
        }
    }
    Ok(annotation)
}

#[derive(Debug, Clone)]
struct VocEntry {
    id: String,
    image: PathBuf,
    annotation: PathBuf,
}

/// Pascal VOC style data: JPEG images plus one XML annotation per image.
///
/// Covers the `VOCdevkit` layout and the flat custom `xml` layout, which
/// differ only in how images are listed and where class names come from.
#[derive(Debug, Clone)]
pub struct VocDataset {
    name: String,
    entries: Vec<VocEntry>,
    class_names: Vec<String>,
    result_dir: PathBuf,
}

impl VocDataset {
    /// `{root}/VOCdevkit/VOC{year}/ImageSets/Main/{split}.txt` for every `(year, split)`.
    pub fn voc(root: &Path, sets: &[(&str, &str)]) -> anyhow::Result<Self> {
        let mut entries = Vec::new();
        for (year, split) in sets {
            let base = root.join("VOCdevkit").join(format!("VOC{year}"));
            let list = base.join("ImageSets").join("Main").join(format!("{split}.txt"));
            let ids = fs::read_to_string(&list).with_context(|| format!("Failed to read image set {}", list.display()))?;
            entries.extend(ids.lines().map(str::trim).filter(|id| !id.is_empty()).map(|id| VocEntry {
                id: id.to_string(),
                image: base.join("JPEGImages").join(format!("{id}.jpg")),
                annotation: base.join("Annotations").join(format!("{id}.xml")),
            }));
        }
        let name = sets.iter().map(|(year, split)| format!("{year}_{split}")).collect::<Vec<_>>().join("+");

        Ok(Self {
            name: format!("VOC{name}"),
            entries,
            class_names: OBJ_CLASSES.iter().map(|c| c.to_string()).collect(),
            result_dir: root.join("results"),
        })
    }

    /// `{root}/xml/{split}/JPEGImages/*.jpg` with annotations in the sibling
    /// `Annotations` folder and class names, one per line, in `{root}/xml/classes.txt`.
    pub fn xml(root: &Path, split: &str) -> anyhow::Result<Self> {
        let base = root.join("xml");
        let classes = base.join("classes.txt");
        let class_names: Vec<String> = fs::read_to_string(&classes)
            .with_context(|| format!("Failed to read class list {}", classes.display()))?
            .lines()
            .map(|line| line.trim().to_lowercase())
            .filter(|line| !line.is_empty())
            .collect();
        if class_names.is_empty() {
            bail!("No classes listed in {}", classes.display());
        }

        let image_dir = base.join(split).join("JPEGImages");
        let annotation_dir = base.join(split).join("Annotations");
        let mut entries: Vec<VocEntry> = fs::read_dir(&image_dir)
            .with_context(|| format!("Failed to list {}", image_dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().and_then(|ext| ext.to_str()).map_or(false, |ext| ext.eq_ignore_ascii_case("jpg")))
            .filter_map(|image| {
                let id = image.file_stem()?.to_str()?.to_string();
                let annotation = annotation_dir.join(format!("{id}.xml"));
                Some(VocEntry { id, image, annotation })
            })
            .collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));

        Ok(Self {
            name: format!("XML_{split}"),
            entries,
            class_names,
            result_dir: root.join("results"),
        })
    }

    pub fn with_result_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.result_dir = dir.into();
        self
    }

    pub fn image_id(&self, index: usize) -> Option<&str> {
        self.entries.get(index).map(|e| e.id.as_str())
    }

    fn class_index(&self, name: &str) -> Option<usize> {
        self.class_names.iter().position(|c| c == name)
    }

    fn load(&self, index: usize) -> anyhow::Result<DetectionItem> {
        let entry = self.entries.get(index).with_context(|| format!("Index {index} out of range"))?;
        let image = self.pull_image(index)?;
        let annotation = parse_voc_annotation(&entry.annotation)?;

        let annotations = annotation
            .objects
            .iter()
            .filter(|object| !object.difficult)
            .filter_map(|object| match self.class_index(&object.name) {
                Some(label) => Some(Annotation::new(normalize(object.bbox, image.width(), image.height()), label)),
                None => {
                    log::warn!("{}: unknown class \"{}\"", entry.annotation.display(), object.name);
                    None
                }
            })
            .collect();
        Ok(DetectionItem::new(image, annotations))
    }
}

impl Dataset<DetectionItem> for VocDataset {
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
        self.entries.len()
    }
}

impl EvalDataset for VocDataset {
    type Metrics = DetectionSummary;

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn pull_image(&self, index: usize) -> anyhow::Result<RgbImage> {
        let entry = self.entries.get(index).with_context(|| format!("Index {index} out of range"))?;
        let image = image::open(&entry.image).with_context(|| format!("Failed to decode {}", entry.image.display()))?;
        Ok(image.to_rgb8())
    }

    fn class_names(&self) -> &[String] {
        &self.class_names
    }

    fn name(&self) -> &str {
        &self.name
    }

    /// Writes one `det_{dataset}_{class}.txt` per class in the devkit format:
    /// `image_id score xmin ymin xmax ymax` with 1-based pixel coordinates.
    fn evaluate_detections(&self, detections: &DetectionSet) -> anyhow::Result<DetectionSummary> {
        fs::create_dir_all(&self.result_dir)?;
        let mut summary = DetectionSummary::new(&self.name, &self.class_names, detections);

        for (class, class_name) in self.class_names.iter().enumerate() {
            let path = self.result_dir.join(format!("det_{}_{class_name}.txt", self.name));
            let mut writer = BufWriter::new(File::create(&path)?);
            for (entry, dets) in self.entries.iter().zip(detections.class(class)) {
                for row in dets.rows() {
                    writeln!(
                        writer,
                        "{} {:.3} {:.1} {:.1} {:.1} {:.1}",
                        entry.id,
                        row[4],
                        row[0] + 1.0,
                        row[1] + 1.0,
                        row[2] + 1.0,
                        row[3] + 1.0
                    )?;
                }
            }
            writer.flush()?;
            summary.result_files.push(path);
        }
        log::info!("Wrote {} result files to {}", summary.result_files.len(), self.result_dir.display());
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use image::Rgb;
    use ndarray::array;

    use super::*;

    const ANNOTATION: &str = r#"<annotation>
    <folder>VOC2007</folder>
    <filename>000001.jpg</filename>
    <size><width>40</width><height>20</height><depth>3</depth></size>
    <object>
        <name>dog</name>
        <difficult>0</difficult>
        <bndbox><xmin>4</xmin><ymin>2</ymin><xmax>20</xmax><ymax>10</ymax></bndbox>
    </object>
    <object>
        <name>person</name>
        <difficult>1</difficult>
        <bndbox><xmin>0</xmin><ymin>0</ymin><xmax>40</xmax><ymax>20</ymax></bndbox>
        <part><name>head</name><bndbox><xmin>1</xmin><ymin>1</ymin><xmax>2</xmax><ymax>2</ymax></bndbox></part>
    </object>
</annotation>"#;

    fn voc_root() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("VOCdevkit").join("VOC2007");
        for sub in ["Annotations", "JPEGImages", "ImageSets/Main"] {
            fs::create_dir_all(base.join(sub)).unwrap();
        }
        fs::write(base.join("ImageSets/Main/test.txt"), "000001\n000002\n").unwrap();
        for id in ["000001", "000002"] {
            fs::write(base.join("Annotations").join(format!("{id}.xml")), ANNOTATION).unwrap();
            RgbImage::from_pixel(40, 20, Rgb([10, 200, 30]))
                .save(base.join("JPEGImages").join(format!("{id}.jpg")))
                .unwrap();
        }
        dir
    }

    #[test]
    fn parses_objects_and_ignores_parts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.xml");
        fs::write(&path, ANNOTATION).unwrap();

        let annotation = parse_voc_annotation(&path).unwrap();
        assert_eq!(annotation.filename, "000001.jpg");
        assert_eq!((annotation.width, annotation.height), (40, 20));
        assert_eq!(annotation.objects.len(), 2);
        assert_eq!(annotation.objects[0].name, "dog");
        assert_eq!(annotation.objects[0].bbox, [4.0, 2.0, 20.0, 10.0]);
        assert!(annotation.objects[1].difficult);
        assert_eq!(annotation.objects[1].bbox, [0.0, 0.0, 40.0, 20.0]);
    }

    #[test]
    fn training_items_are_normalized_and_skip_difficult() {
        let root = voc_root();
        let dataset = VocDataset::voc(root.path(), &[("2007", "test")]).unwrap();
        assert_eq!(Dataset::len(&dataset), 2);

        let item = dataset.get(0).unwrap();
        assert_eq!(item.image.dimensions(), (40, 20));
        assert_eq!(item.annotations, vec![Annotation::new([0.1, 0.1, 0.5, 0.5], 11)]);
    }

    #[test]
    fn missing_files_are_skipped() {
        let root = voc_root();
        fs::remove_file(root.path().join("VOCdevkit/VOC2007/JPEGImages/000002.jpg")).unwrap();
        let dataset = VocDataset::voc(root.path(), &[("2007", "test")]).unwrap();
        assert!(dataset.get(1).is_none());
        assert!(dataset.pull_image(1).is_err());
    }

    #[test]
    fn result_files_follow_devkit_format() {
        let root = voc_root();
        let results = root.path().join("out");
        let dataset = VocDataset::voc(root.path(), &[("2007", "test")]).unwrap().with_result_dir(&results);

        let mut detections = DetectionSet::new(20, 2);
        detections.accumulate(1, array![[1.0f32, 2.0, 3.0, 4.0]].view(), ndarray::Array2::from_elem((1, 20), 0.5).view(), 0.05);
        let summary = dataset.evaluate_detections(&detections).unwrap();

        assert_eq!(summary.result_files.len(), 20);
        assert_eq!(summary.total(), 20);
        let dog = fs::read_to_string(results.join("det_VOC2007_test_dog.txt")).unwrap();
        assert_eq!(dog, "000002 0.500 2.0 3.0 4.0 5.0\n");
    }

    #[test]
    fn xml_layout_reads_class_list() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("xml");
        fs::create_dir_all(base.join("val/JPEGImages")).unwrap();
        fs::create_dir_all(base.join("val/Annotations")).unwrap();
        fs::write(base.join("classes.txt"), "Person\ndog\n").unwrap();
        fs::write(base.join("val/Annotations/b.xml"), ANNOTATION).unwrap();
        RgbImage::new(40, 20).save(base.join("val/JPEGImages/b.jpg")).unwrap();

        let dataset = VocDataset::xml(dir.path(), "val").unwrap();
        assert_eq!(dataset.class_names(), &["person".to_string(), "dog".to_string()]);
        assert_eq!(dataset.image_id(0), Some("b"));
        assert_eq!(dataset.get(0).unwrap().annotations[0].label, 1);
    }
}

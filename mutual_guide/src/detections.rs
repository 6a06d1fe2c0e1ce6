use ndarray::{concatenate, s, Array2, ArrayView2, Axis};

/// Detections of a whole evaluation run, indexed `[class][image]`.
///
/// Each entry is an `(n, 5)` matrix of `[x1, y1, x2, y2, score]` rows in pixel
/// coordinates. An image without detections for a class holds an explicit
/// `(0, 5)` matrix, never a missing entry.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionSet {
    all_boxes: Vec<Vec<Array2<f32>>>,
}

impl DetectionSet {
    pub fn new(num_classes: usize, num_images: usize) -> Self {
        Self {
            all_boxes: vec![vec![Array2::zeros((0, 5)); num_images]; num_classes],
        }
    }

    pub fn num_classes(&self) -> usize {
        self.all_boxes.len()
    }

    pub fn num_images(&self) -> usize {
        self.all_boxes.first().map_or(0, |images| images.len())
    }

    /// Stores the rows of `boxes` `[N, 4]` whose class score in `scores`
    /// `[N, C]` is strictly above `thresh`, for every class.
    pub fn accumulate(&mut self, image: usize, boxes: ArrayView2<f32>, scores: ArrayView2<f32>, thresh: f32) {
        for (class, images) in self.all_boxes.iter_mut().enumerate() {
            let keep: Vec<usize> = scores
                .column(class)
                .iter()
                .enumerate()
                .filter(|(_, score)| **score > thresh)
                .map(|(row, _)| row)
                .collect();

            images[image] = if keep.is_empty() {
                Array2::zeros((0, 5))
            } else {
                let kept_boxes = boxes.select(Axis(0), &keep);
                let kept_scores = scores.slice(s![.., class..class + 1]).select(Axis(0), &keep);
                concatenate![Axis(1), kept_boxes, kept_scores]
            };
        }
    }

    pub fn get(&self, class: usize, image: usize) -> &Array2<f32> {
        &self.all_boxes[class][image]
    }

    pub fn class(&self, class: usize) -> &[Array2<f32>] {
        &self.all_boxes[class]
    }

    pub fn total(&self) -> usize {
        self.all_boxes.iter().flatten().map(|dets| dets.nrows()).sum()
    }
}

use std::sync::Arc;

use burn::{data::{dataloader::batcher::Batcher, dataset::Dataset}, tensor::{backend::Backend, Data, Shape, Tensor}};
use derive_new::new;
use image::{imageops::FilterType, RgbImage};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};

const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const STD: [f32; 3] = [0.229, 0.224, 0.225];

/// One ground truth object, corners normalized to `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, new)]
pub struct Annotation {
    pub bbox: [f32; 4],
    pub label: usize,
}

#[derive(Debug, Clone, new)]
pub struct DetectionItem {
    pub image: RgbImage,
    pub annotations: Vec<Annotation>,
}

#[derive(Debug, Clone)]
pub struct DetectionBatch<B: Backend> {
    /// `[batch, 3, image_size, image_size]`
    pub images: Tensor<B, 4>,
    pub targets: Vec<Vec<Annotation>>,
}

/// Resizes to a square input and normalizes channels, CHW order.
pub fn preprocess(image: &RgbImage, image_size: usize) -> Vec<f32> {
    let size = image_size as u32;
    let resized = if image.width() != size || image.height() != size {
        image::imageops::resize(image, size, size, FilterType::Triangle)
    } else {
        image.clone()
    };

    let plane = image_size * image_size;
    let mut chw = vec![0f32; 3 * plane];
    for (x, y, pixel) in resized.enumerate_pixels() {
        let offset = y as usize * image_size + x as usize;
        for c in 0..3 {
            chw[c * plane + offset] = (pixel.0[c] as f32 / 255.0 - MEAN[c]) / STD[c];
        }
    }
    chw
}

pub fn image_tensor<B: Backend>(image: &RgbImage, image_size: usize, device: &B::Device) -> Tensor<B, 4> {
    let data = Data::new(preprocess(image, image_size), Shape::new([1, 3, image_size, image_size]));
    Tensor::from_data(data.convert(), device)
}

#[derive(Clone, new)]
pub struct DetectionBatcher<B: Backend> {
    device: B::Device,
    image_size: usize,
}

impl<B: Backend> Batcher<DetectionItem, DetectionBatch<B>> for DetectionBatcher<B> {
    fn batch(&self, items: Vec<DetectionItem>) -> DetectionBatch<B> {
        let size = self.image_size;
        let pixels = items
            .par_iter()
            .map(|item| preprocess(&item.image, size))
            .collect::<Vec<Vec<f32>>>()
            .concat();
        let data = Data::new(pixels, Shape::new([items.len(), 3, size, size]));
        let images = Tensor::<B, 4>::from_data(data.convert(), &self.device);

        let targets = items.into_iter().map(|item| item.annotations).collect();

        DetectionBatch { images, targets }
    }
}

/// Shuffled pass over a dataset that yields only full batches, so one epoch is
/// exactly `len / batch_size` batches.
pub struct EpochSampler<D: Dataset<DetectionItem> + ?Sized> {
    dataset: Arc<D>,
    indices: Vec<usize>,
    batch_size: usize,
    position: usize,
}

impl<D: Dataset<DetectionItem> + ?Sized> EpochSampler<D> {
    pub fn new(dataset: Arc<D>, batch_size: usize, seed: u64) -> Self {
        let mut indices: Vec<usize> = (0..dataset.len()).collect();
        let mut rng = StdRng::seed_from_u64(seed);
        indices.shuffle(&mut rng);

        Self {
            dataset,
            indices,
            batch_size: batch_size.max(1),
            position: 0,
        }
    }

    pub fn num_batches(&self) -> usize {
        self.indices.len() / self.batch_size
    }
}

impl<D: Dataset<DetectionItem> + ?Sized> Iterator for EpochSampler<D> {
    type Item = Vec<DetectionItem>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.position + self.batch_size <= self.indices.len() {
            let chunk = &self.indices[self.position..self.position + self.batch_size];
            self.position += self.batch_size;

            let items: Vec<DetectionItem> = chunk.iter().filter_map(|i| self.dataset.get(*i)).collect();
            if items.is_empty() {
                log::warn!("skipping batch: no item of {:?} could be loaded", chunk);
                continue;
            }
            return Some(items);
        }
        None
    }
}

use burn::{config::Config, module::Module, nn::{conv::{Conv2d, Conv2dConfig}, BatchNorm, BatchNormConfig, PaddingConfig2d, ReLU}, tensor::{backend::Backend, Tensor}};

use crate::prior::{feature_size, STRIDES};

/// Raw, undecoded head outputs for every prior of every image in a batch.
#[derive(Debug, Clone)]
pub struct DetectorOutput<B: Backend> {
    /// `[batch, num_priors, 4]` box offsets relative to the priors.
    pub loc: Tensor<B, 3>,
    /// `[batch, num_priors, num_classes]` class logits.
    pub conf: Tensor<B, 3>,
}

/// The network the harness trains and evaluates.
pub trait Detector<B: Backend> {
    fn forward(&self, images: Tensor<B, 4>) -> DetectorOutput<B>;

    /// Fixes the model for inference-only use.
    fn deploy(self) -> Self
    where
        Self: Sized,
    {
        self
    }
}

#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    conv: Conv2d<B>,
    norm: BatchNorm<B, 2>,
    activation: ReLU,
}

impl<B: Backend> ConvBlock<B> {
    fn new(channels: [usize; 2], device: &B::Device) -> Self {
        Self {
            conv: Conv2dConfig::new(channels, [3, 3])
                .with_stride([2, 2])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device),
            norm: BatchNormConfig::new(channels[1]).init(device),
            activation: ReLU::new(),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.norm.forward(x);
        self.activation.forward(x)
    }
}

/// Small five-level anchor detector: three stride-2 stem blocks reach stride 8,
/// four more produce strides 16 to 128, and two heads shared across levels
/// predict offsets and class logits for one anchor per cell.
#[derive(Module, Debug)]
pub struct AnchorDetector<B: Backend> {
    stem: Vec<ConvBlock<B>>,
    pyramid: Vec<ConvBlock<B>>,
    loc_head: Conv2d<B>,
    conf_head: Conv2d<B>,
    num_classes: usize,
    width: usize,
}

#[derive(Config, Debug)]
pub struct AnchorDetectorConfig {
    num_classes: usize,
    #[config(default = 64)]
    width: usize,
}

fn stem_channels(width: usize) -> [usize; 4] {
    [3, (width / 4).max(1), (width / 2).max(1), width]
}

impl AnchorDetectorConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> AnchorDetector<B> {
        let stem = stem_channels(self.width)
            .windows(2)
            .map(|pair| ConvBlock::new([pair[0], pair[1]], device))
            .collect();
        let pyramid = (1..STRIDES.len())
            .map(|_| ConvBlock::new([self.width, self.width], device))
            .collect();
        let head = |out: usize| {
            Conv2dConfig::new([self.width, out], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device)
        };

        AnchorDetector {
            stem,
            pyramid,
            loc_head: head(4),
            conf_head: head(self.num_classes),
            num_classes: self.num_classes,
            width: self.width,
        }
    }
}

impl<B: Backend> AnchorDetector<B> {
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Floating point operations of one forward pass on a square
    /// `image_size` input: convolution multiply-accumulates, two each.
    pub fn flops(&self, image_size: usize) -> u64 {
        let conv = |cells: usize, inputs: usize, outputs: usize| (cells * cells * 9 * inputs * outputs) as u64;

        let stem: u64 = stem_channels(self.width)
            .windows(2)
            .zip([2, 4, 8])
            .map(|(pair, stride)| conv(feature_size(image_size, stride), pair[0], pair[1]))
            .sum();
        let pyramid: u64 = STRIDES[1..]
            .iter()
            .map(|&stride| conv(feature_size(image_size, stride), self.width, self.width))
            .sum();
        let heads: u64 = STRIDES
            .iter()
            .map(|&stride| conv(feature_size(image_size, stride), self.width, 4 + self.num_classes))
            .sum();

        2 * (stem + pyramid + heads)
    }

    // [b, a, h, w] -> [b, h * w, a], row-major over cells like the prior set
    fn flatten(x: Tensor<B, 4>) -> Tensor<B, 3> {
        let [batch, channels, height, width] = x.dims();
        x.swap_dims(1, 2)
            .swap_dims(2, 3)
            .reshape([batch, height * width, channels])
    }
}

impl<B: Backend> Detector<B> for AnchorDetector<B> {
    fn forward(&self, images: Tensor<B, 4>) -> DetectorOutput<B> {
        let mut x = images;
        for block in &self.stem {
            x = block.forward(x);
        }

        let mut features = vec![x.clone()];
        for block in &self.pyramid {
            x = block.forward(x);
            features.push(x.clone());
        }

        let (locs, confs): (Vec<_>, Vec<_>) = features
            .into_iter()
            .map(|feature| {
                let loc = Self::flatten(self.loc_head.forward(feature.clone()));
                let conf = Self::flatten(self.conf_head.forward(feature));
                (loc, conf)
            })
            .unzip();

        DetectorOutput {
            loc: Tensor::cat(locs, 1),
            conf: Tensor::cat(confs, 1),
        }
    }
}

use crate::error::{CaptionError, Result};
use burn::{
    nn::{
        Linear, LinearConfig, PaddingConfig2d,
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
    },
    prelude::*,
    record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder},
    tensor::activation::relu,
};
use std::path::Path;
use tracing::info;

/// Pretrained backbone weights are stored at full precision.
pub type BackboneRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

/// Convolutional feature extractor. It is kept frozen: parameters are
/// excluded from gradient tracking and the output is detached.
#[derive(Module, Debug)]
pub struct Backbone<B: Backend> {
    stem: Conv2d<B>,
    stem_pool: MaxPool2d,
    stages: Vec<Conv2d<B>>,
    pool: AdaptiveAvgPool2d,
}

impl<B: Backend> Backbone<B> {
    pub fn new(channels: usize, grid_size: usize, device: &B::Device) -> Self {
        let stem = Conv2dConfig::new([3, channels / 4], [7, 7])
            .with_stride([2, 2])
            .with_padding(PaddingConfig2d::Explicit(3, 3))
            .init(device);
        let stem_pool = MaxPool2dConfig::new([3, 3])
            .with_strides([2, 2])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init();

        let widths = [channels / 4, channels / 2, channels, channels];
        let stages = widths
            .windows(2)
            .map(|pair| {
                Conv2dConfig::new([pair[0], pair[1]], [3, 3])
                    .with_stride([2, 2])
                    .with_padding(PaddingConfig2d::Explicit(1, 1))
                    .init(device)
            })
            .collect();

        let pool = AdaptiveAvgPool2dConfig::new([grid_size, grid_size]).init();

        Self {
            stem,
            stem_pool,
            stages,
            pool,
        }
        .no_grad()
    }

    /// `[N, 3, H, W]` -> `[N, channels, grid, grid]`
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = relu(self.stem.forward(images));
        x = self.stem_pool.forward(x);
        for stage in &self.stages {
            x = relu(stage.forward(x));
        }
        self.pool.forward(x).detach()
    }
}

/// Frozen backbone followed by a trainable projection.
#[derive(Module, Debug)]
pub struct ImageEncoder<B: Backend> {
    backbone: Backbone<B>,
    projection: Linear<B>,
    grid_size: usize,
}

impl<B: Backend> ImageEncoder<B> {
    pub fn new(
        backbone_channels: usize,
        encoder_dim: usize,
        grid_size: usize,
        device: &B::Device,
    ) -> Self {
        Self {
            backbone: Backbone::new(backbone_channels, grid_size, device),
            projection: LinearConfig::new(backbone_channels, encoder_dim).init(device),
            grid_size,
        }
    }

    pub fn regions(&self) -> usize {
        self.grid_size * self.grid_size
    }

    /// `[N, 3, H, W]` -> `[N, encoder_dim]`, the grid averaged to one vector.
    pub fn encode_global(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let features = self.backbone.forward(images);
        let [batch, channels, _, _] = features.dims();
        let pooled = features.mean_dim(3).mean_dim(2).reshape([batch, channels]);
        self.projection.forward(pooled)
    }

    /// `[N, 3, H, W]` -> `[N, grid * grid, encoder_dim]`
    pub fn encode_spatial(&self, images: Tensor<B, 4>) -> Tensor<B, 3> {
        let features = self.backbone.forward(images);
        let [batch, channels, height, width] = features.dims();
        let regions = features
            .reshape([batch, channels, height * width])
            .swap_dims(1, 2);
        self.projection.forward(regions)
    }

    /// Replaces the backbone weights with a burn record saved by
    /// [`BackboneRecorder`]. The backbone stays frozen.
    pub fn load_backbone(mut self, path: &Path, device: &B::Device) -> Result<Self> {
        let record = BackboneRecorder::new()
            .load(path.to_path_buf(), device)
            .map_err(|e| CaptionError::Checkpoint(format!("{}: {e}", path.display())))?;
        self.backbone = self.backbone.load_record(record).no_grad();
        info!(path = %path.display(), "backbone weights loaded");
        Ok(self)
    }
}

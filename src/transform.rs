//! Image preprocessing pipelines.
//!
//! Training applies a random resized crop and an optional horizontal flip;
//! evaluation resizes the shorter side and takes a center crop. Both end in a
//! CHW float buffer normalized with the ImageNet channel statistics.

use crate::error::{CaptionError, Result};
use image::{
    ImageError, RgbImage,
    imageops::{self, FilterType},
};
use rand::Rng;
use std::path::Path;

pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

const CROP_ATTEMPTS: usize = 10;

#[derive(Clone, Debug, PartialEq)]
pub enum Preprocess {
    Training {
        size: u32,
        scale: (f64, f64),
        ratio: (f64, f64),
        flip_probability: f64,
    },
    Evaluation {
        resize: u32,
        crop: u32,
    },
}

impl Preprocess {
    pub fn training(flip_probability: f64) -> Self {
        Self::Training {
            size: 224,
            scale: (0.08, 1.0),
            ratio: (3.0 / 4.0, 4.0 / 3.0),
            flip_probability: flip_probability.clamp(0.0, 1.0),
        }
    }

    pub fn evaluation() -> Self {
        Self::Evaluation {
            resize: 256,
            crop: 224,
        }
    }

    /// Side length of the square images this pipeline produces.
    pub fn output_size(&self) -> u32 {
        match self {
            Self::Training { size, .. } => *size,
            Self::Evaluation { crop, .. } => *crop,
        }
    }

    pub fn apply<R: Rng + ?Sized>(&self, image: &RgbImage, rng: &mut R) -> RgbImage {
        match self {
            Self::Training {
                size,
                scale,
                ratio,
                flip_probability,
            } => {
                let cropped = random_resized_crop(image, *size, *scale, *ratio, rng);
                if rng.random_bool(*flip_probability) {
                    imageops::flip_horizontal(&cropped)
                } else {
                    cropped
                }
            }
            Self::Evaluation { resize, crop } => {
                let resized = resize_shorter_side(image, *resize);
                center_crop(&resized, *crop)
            }
        }
    }

    /// Runs the pipeline and returns the normalized CHW buffer.
    pub fn to_tensor_data<R: Rng + ?Sized>(&self, image: &RgbImage, rng: &mut R) -> Vec<f32> {
        normalize_chw(&self.apply(image, rng))
    }
}

pub fn load_rgb(path: &Path) -> Result<RgbImage> {
    match image::open(path) {
        Ok(image) => Ok(image.to_rgb8()),
        Err(ImageError::IoError(err)) => Err(CaptionError::io(path, err)),
        Err(err) => Err(CaptionError::image(path, err)),
    }
}

/// Crops a random region covering `scale` of the area with an aspect ratio
/// drawn log-uniformly from `ratio`, then resizes it to `size x size`.
pub fn random_resized_crop<R: Rng + ?Sized>(
    image: &RgbImage,
    size: u32,
    scale: (f64, f64),
    ratio: (f64, f64),
    rng: &mut R,
) -> RgbImage {
    let (width, height) = image.dimensions();
    let area = f64::from(width) * f64::from(height);
    let (log_lo, log_hi) = (ratio.0.ln(), ratio.1.ln());

    for _ in 0..CROP_ATTEMPTS {
        let target_area = area * rng.random_range(scale.0..=scale.1);
        let aspect = rng.random_range(log_lo..=log_hi).exp();
        let crop_w = (target_area * aspect).sqrt().round() as u32;
        let crop_h = (target_area / aspect).sqrt().round() as u32;

        if crop_w > 0 && crop_h > 0 && crop_w <= width && crop_h <= height {
            let x = rng.random_range(0..=width - crop_w);
            let y = rng.random_range(0..=height - crop_h);
            let region = imageops::crop_imm(image, x, y, crop_w, crop_h).to_image();
            return imageops::resize(&region, size, size, FilterType::Triangle);
        }
    }

    // Fallback: central crop clamped to the allowed aspect ratios.
    let in_ratio = f64::from(width) / f64::from(height.max(1));
    let (crop_w, crop_h) = if in_ratio < ratio.0 {
        (width, (f64::from(width) / ratio.0).round() as u32)
    } else if in_ratio > ratio.1 {
        ((f64::from(height) * ratio.1).round() as u32, height)
    } else {
        (width, height)
    };
    let region = center_crop_rect(image, crop_w.max(1), crop_h.max(1));
    imageops::resize(&region, size, size, FilterType::Triangle)
}

/// Resizes so that the shorter side equals `target`, keeping the aspect ratio.
pub fn resize_shorter_side(image: &RgbImage, target: u32) -> RgbImage {
    let (width, height) = image.dimensions();
    let (new_w, new_h) = if width <= height {
        let h = (u64::from(target) * u64::from(height) / u64::from(width.max(1))) as u32;
        (target, h.max(1))
    } else {
        let w = (u64::from(target) * u64::from(width) / u64::from(height.max(1))) as u32;
        (w.max(1), target)
    };
    imageops::resize(image, new_w, new_h, FilterType::Triangle)
}

pub fn center_crop(image: &RgbImage, size: u32) -> RgbImage {
    let (width, height) = image.dimensions();
    if width < size || height < size {
        return imageops::resize(image, size, size, FilterType::Triangle);
    }
    center_crop_rect(image, size, size)
}

fn center_crop_rect(image: &RgbImage, crop_w: u32, crop_h: u32) -> RgbImage {
    let (width, height) = image.dimensions();
    let crop_w = crop_w.min(width);
    let crop_h = crop_h.min(height);
    let x = (width - crop_w) / 2;
    let y = (height - crop_h) / 2;
    imageops::crop_imm(image, x, y, crop_w, crop_h).to_image()
}

/// Converts to `[3, H, W]` floats in `[0, 1]`, then normalizes per channel.
pub fn normalize_chw(image: &RgbImage) -> Vec<f32> {
    let (width, height) = image.dimensions();
    let plane = (width * height) as usize;
    let mut data = vec![0.0f32; 3 * plane];

    for (x, y, pixel) in image.enumerate_pixels() {
        let offset = (y * width + x) as usize;
        for channel in 0..3 {
            let value = f32::from(pixel[channel]) / 255.0;
            data[channel * plane + offset] =
                (value - IMAGENET_MEAN[channel]) / IMAGENET_STD[channel];
        }
    }
    data
}

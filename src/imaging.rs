//! Image decoding and the transform pipeline.
//!
//! Raw bytes out of a shard cell (or a file on disk) are decoded once into
//! an 8-bit RGB buffer; a transform then produces the CHW f32 tensor the
//! model consumes. Transforms take the caller's rng so augmentation stays
//! seedable and `apply` can run concurrently from worker threads.

use std::path::Path;

use image::imageops::{self, FilterType};
use image::RgbImage;
use rand::prelude::*;
use rand::rngs::SmallRng;

use crate::error::FetchError;

/// Channel means the stock transforms normalize with.
pub const NORM_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
/// Channel standard deviations the stock transforms normalize with.
pub const NORM_STD: [f32; 3] = [0.268_629_54, 0.261_302_58, 0.275_777_11];

// ============================================================================
// Decoding
// ============================================================================

/// Decode an encoded image blob into 8-bit RGB.
pub fn decode_bytes(bytes: &[u8]) -> Result<RgbImage, image::ImageError> {
    Ok(image::load_from_memory(bytes)?.to_rgb8())
}

/// Read and decode an image file. A read failure is a missing-image error,
/// a decode failure a decode error.
pub fn load_path(path: &Path) -> Result<RgbImage, FetchError> {
    let bytes = std::fs::read(path).map_err(|source| FetchError::MissingImage {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(decode_bytes(&bytes)?)
}

// ============================================================================
// Tensors
// ============================================================================

/// A single transformed image in CHW layout.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor {
    pub data: Vec<f32>,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl ImageTensor {
    pub fn shape(&self) -> (usize, usize, usize) {
        (self.channels, self.height, self.width)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Convert 8-bit RGB to a normalized CHW f32 tensor.
pub fn to_chw_tensor(image: &RgbImage, mean: [f32; 3], std: [f32; 3]) -> ImageTensor {
    let (width, height) = image.dimensions();
    let plane = (width * height) as usize;
    let mut data = vec![0.0f32; 3 * plane];
    for (i, pixel) in image.pixels().enumerate() {
        for c in 0..3 {
            data[c * plane + i] = (pixel.0[c] as f32 / 255.0 - mean[c]) / std[c];
        }
    }
    ImageTensor {
        data,
        channels: 3,
        height: height as usize,
        width: width as usize,
    }
}

// ============================================================================
// Transforms
// ============================================================================

/// Decoded image to model-ready tensor. Implementations must be shareable
/// across worker threads; all randomness comes from the passed rng.
pub trait ImageTransform: Send + Sync {
    fn apply(&self, image: &RgbImage, rng: &mut SmallRng) -> ImageTensor;
}

/// Training augmentation: random resized crop with scale jitter, horizontal
/// flip, then normalization.
#[derive(Debug, Clone)]
pub struct TrainAugment {
    pub size: u32,
    pub scale: (f32, f32),
    pub hflip_prob: f32,
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl TrainAugment {
    pub fn new(size: u32) -> Self {
        Self {
            size,
            scale: (0.5, 1.0),
            hflip_prob: 0.5,
            mean: NORM_MEAN,
            std: NORM_STD,
        }
    }

    /// Crop a random region covering `scale` of the source area with mild
    /// aspect jitter, falling back to a center square when the draw does
    /// not fit.
    fn random_crop(&self, image: &RgbImage, rng: &mut SmallRng) -> RgbImage {
        let (width, height) = image.dimensions();
        let area = (width * height) as f32;
        let log_ratio = ((3.0f32 / 4.0).ln(), (4.0f32 / 3.0).ln());

        for _ in 0..10 {
            let target_area = area * rng.random_range(self.scale.0..=self.scale.1);
            let ratio = rng.random_range(log_ratio.0..=log_ratio.1).exp();
            let crop_w = (target_area * ratio).sqrt().round() as u32;
            let crop_h = (target_area / ratio).sqrt().round() as u32;
            if crop_w >= 1 && crop_w <= width && crop_h >= 1 && crop_h <= height {
                let x = rng.random_range(0..=width - crop_w);
                let y = rng.random_range(0..=height - crop_h);
                return imageops::crop_imm(image, x, y, crop_w, crop_h).to_image();
            }
        }

        let side = width.min(height);
        let x = (width - side) / 2;
        let y = (height - side) / 2;
        imageops::crop_imm(image, x, y, side, side).to_image()
    }
}

impl ImageTransform for TrainAugment {
    fn apply(&self, image: &RgbImage, rng: &mut SmallRng) -> ImageTensor {
        let cropped = self.random_crop(image, rng);
        let mut view = imageops::resize(&cropped, self.size, self.size, FilterType::Triangle);
        if rng.random::<f32>() < self.hflip_prob {
            imageops::flip_horizontal_in_place(&mut view);
        }
        to_chw_tensor(&view, self.mean, self.std)
    }
}

/// Deterministic eval transform: resize to a square and normalize.
#[derive(Debug, Clone)]
pub struct EvalResize {
    pub size: u32,
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl EvalResize {
    pub fn new(size: u32) -> Self {
        Self {
            size,
            mean: NORM_MEAN,
            std: NORM_STD,
        }
    }
}

impl ImageTransform for EvalResize {
    fn apply(&self, image: &RgbImage, _rng: &mut SmallRng) -> ImageTensor {
        let view = imageops::resize(image, self.size, self.size, FilterType::Triangle);
        to_chw_tensor(&view, self.mean, self.std)
    }
}

// ============================================================================
// Test helpers
// ============================================================================

/// Encode a solid-color PNG for fixtures.
#[cfg(test)]
pub(crate) fn tiny_png(width: u32, height: u32, rgb: [u8; 3]) -> Vec<u8> {
    let img = RgbImage::from_pixel(width, height, image::Rgb(rgb));
    let mut bytes = Vec::new();
    img.write_to(
        &mut std::io::Cursor::new(&mut bytes),
        image::ImageFormat::Png,
    )
    .unwrap();
    bytes
}

/// Transform that records an rng draw instead of touching pixels, so tests
/// can observe independent transform invocations.
#[cfg(test)]
pub(crate) struct ProbeTransform;

#[cfg(test)]
impl ImageTransform for ProbeTransform {
    fn apply(&self, _image: &RgbImage, rng: &mut SmallRng) -> ImageTensor {
        ImageTensor {
            data: vec![rng.random::<f32>()],
            channels: 1,
            height: 1,
            width: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_bytes_roundtrip() {
        let bytes = tiny_png(4, 3, [10, 200, 30]);
        let img = decode_bytes(&bytes).unwrap();
        assert_eq!(img.dimensions(), (4, 3));
        assert_eq!(img.get_pixel(0, 0).0, [10, 200, 30]);
    }

    #[test]
    fn test_decode_bytes_rejects_garbage() {
        assert!(decode_bytes(b"not an image").is_err());
    }

    #[test]
    fn test_load_path_missing_file() {
        let err = load_path(Path::new("/nonexistent/image.png")).unwrap_err();
        assert!(matches!(err, FetchError::MissingImage { .. }));
    }

    #[test]
    fn test_load_path_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.png");
        std::fs::write(&path, b"garbage").unwrap();
        let err = load_path(&path).unwrap_err();
        assert!(matches!(err, FetchError::Decode(_)));
    }

    #[test]
    fn test_to_chw_tensor_layout() {
        let mut img = RgbImage::new(2, 1);
        img.put_pixel(0, 0, image::Rgb([255, 0, 0]));
        img.put_pixel(1, 0, image::Rgb([0, 255, 0]));
        let t = to_chw_tensor(&img, [0.0; 3], [1.0; 3]);
        assert_eq!(t.shape(), (3, 1, 2));
        // red channel plane first, then green, then blue
        assert_eq!(t.data, vec![1.0, 0.0, 0.0, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_train_augment_shape_and_determinism() {
        let bytes = tiny_png(32, 24, [128, 128, 128]);
        let img = decode_bytes(&bytes).unwrap();
        let aug = TrainAugment::new(16);

        let mut rng_a = SmallRng::seed_from_u64(7);
        let mut rng_b = SmallRng::seed_from_u64(7);
        let a = aug.apply(&img, &mut rng_a);
        let b = aug.apply(&img, &mut rng_b);
        assert_eq!(a.shape(), (3, 16, 16));
        assert_eq!(a, b);
    }

    #[test]
    fn test_eval_resize_shape() {
        let bytes = tiny_png(10, 20, [1, 2, 3]);
        let img = decode_bytes(&bytes).unwrap();
        let t = EvalResize::new(8).apply(&img, &mut SmallRng::seed_from_u64(0));
        assert_eq!(t.shape(), (3, 8, 8));
        assert_eq!(t.len(), 3 * 8 * 8);
    }
}

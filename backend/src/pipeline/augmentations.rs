//! Fingerprint normalization: the fixed transform chain the classifier was
//! trained on. Order and parameters must not change independently of the
//! weights.

use image::{ImageBuffer, Rgb, RgbImage};
use ndarray::{Array2, Array4, ArrayView2};

use super::clahe::Clahe;
use super::filter::{gaussian_blur_3x3, sharpen};
use super::resize::resize_area;

pub const MODEL_INPUT_SIZE: usize = 224;
pub const MODEL_INPUT_CHANNELS: usize = 3;

const NORMALIZE_MEAN: f32 = 0.5;
const NORMALIZE_STD: f32 = 0.5;

#[derive(Debug, thiserror::Error)]
pub enum PreprocessError {
    #[error("Failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("Image has no pixels")]
    EmptyImage,
}

/// Output of [`FingerprintPreprocessor::normalize`].
#[derive(Debug, Clone)]
pub struct Preprocessed {
    /// `(1, 3, H, W)` model input in `[-1, 1]`, every channel identical.
    pub tensor: Array4<f32>,
    /// Enhanced raster replicated to RGB for display.
    pub visual: RgbImage,
}

#[derive(Debug, Clone)]
pub struct FingerprintPreprocessor {
    size: usize,
    clahe: Clahe,
}

impl Default for FingerprintPreprocessor {
    fn default() -> Self {
        Self {
            size: MODEL_INPUT_SIZE,
            clahe: Clahe::default(),
        }
    }
}

impl FingerprintPreprocessor {
    /// Decodes any supported container into an RGB raster. Alpha is dropped.
    pub fn decode(image_bytes: &[u8]) -> Result<RgbImage, PreprocessError> {
        let image = image::load_from_memory(image_bytes)?.to_rgb8();
        if image.width() == 0 || image.height() == 0 {
            return Err(PreprocessError::EmptyImage);
        }
        Ok(image)
    }

    pub fn normalize(&self, image: &RgbImage) -> Preprocessed {
        let gray = to_grayscale(image);
        let enhanced = self.enhance(gray.view());
        log::debug!(
            "Normalized {}x{} image to {}x{}",
            image.width(),
            image.height(),
            self.size,
            self.size
        );
        Preprocessed {
            tensor: to_model_tensor(enhanced.view()),
            visual: to_visual(enhanced.view()),
        }
    }

    /// Resize, CLAHE, blur and sharpen on the grayscale raster.
    pub fn enhance(&self, gray: ArrayView2<u8>) -> Array2<u8> {
        let resized = resize_area(gray, self.size, self.size);
        let equalized = self.clahe.apply(resized.view());
        let smoothed = gaussian_blur_3x3(equalized.view());
        sharpen(smoothed.view())
    }
}

/// ITU-R 601-2 luma in 16-bit fixed point.
pub fn to_grayscale(image: &RgbImage) -> Array2<u8> {
    let (width, height) = image.dimensions();
    Array2::from_shape_fn((height as usize, width as usize), |(y, x)| {
        let Rgb([r, g, b]) = *image.get_pixel(x as u32, y as u32);
        ((r as u32 * 19595 + g as u32 * 38470 + b as u32 * 7471 + 0x8000) >> 16) as u8
    })
}

/// Scales to `[0, 1]`, applies `(x - 0.5) / 0.5`, then replicates the plane
/// into three channels behind a batch axis.
pub fn to_model_tensor(enhanced: ArrayView2<u8>) -> Array4<f32> {
    let plane = enhanced.mapv(|v| (v as f32 / 255.0 - NORMALIZE_MEAN) / NORMALIZE_STD);
    let (height, width) = plane.dim();
    Array4::from_shape_fn((1, MODEL_INPUT_CHANNELS, height, width), |(_, _, y, x)| {
        plane[[y, x]]
    })
}

pub fn to_visual(enhanced: ArrayView2<u8>) -> RgbImage {
    let (height, width) = enhanced.dim();
    ImageBuffer::from_fn(width as u32, height as u32, |x, y| {
        let v = enhanced[[y as usize, x as usize]];
        Rgb([v, v, v])
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, GrayImage, ImageFormat, Luma, Rgba, RgbaImage};
    use ndarray::Axis;
    use std::io::Cursor;

    fn encode_png(image: DynamicImage) -> Vec<u8> {
        let mut bytes = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn fingerprint_like(width: u32, height: u32) -> RgbImage {
        ImageBuffer::from_fn(width, height, |x, y| {
            let ridge = (((x as f32 * 0.35).sin() + (y as f32 * 0.2).cos()) * 60.0 + 128.0) as u8;
            Rgb([ridge, ridge.wrapping_add(10), ridge.wrapping_sub(5)])
        })
    }

    #[test]
    fn grayscale_uses_601_luma() {
        let image = ImageBuffer::from_fn(3, 1, |x, _| match x {
            0 => Rgb([255, 0, 0]),
            1 => Rgb([0, 255, 0]),
            _ => Rgb([0, 0, 255]),
        });
        let gray = to_grayscale(&image);
        assert_eq!(gray.row(0).to_vec(), vec![76u8, 150, 29]);
    }

    #[test]
    fn solid_gray_square_becomes_model_input() {
        let image = RgbImage::from_pixel(100, 100, Rgb([128, 128, 128]));
        let out = FingerprintPreprocessor::default().normalize(&image);

        assert_eq!(out.tensor.shape(), &[1, 3, 224, 224]);
        assert_eq!(out.visual.dimensions(), (224, 224));
        assert!(out.visual.pixels().all(|p| *p == Rgb([130, 130, 130])));

        let expected = (130.0f32 / 255.0 - 0.5) / 0.5;
        assert!(out.tensor.iter().all(|&v| (v - expected).abs() < 1e-6));
    }

    #[test]
    fn tensor_channels_are_identical_and_bounded() {
        let image = fingerprint_like(317, 245);
        let out = FingerprintPreprocessor::default().normalize(&image);

        assert_eq!(out.tensor.shape(), &[1, 3, 224, 224]);
        let red = out.tensor.index_axis(Axis(1), 0);
        for c in 1..3 {
            assert_eq!(out.tensor.index_axis(Axis(1), c), red);
        }
        assert!(out.tensor.iter().all(|&v| (-1.0..=1.0).contains(&v)));
    }

    #[test]
    fn visual_matches_tensor_source() {
        let image = fingerprint_like(224, 224);
        let out = FingerprintPreprocessor::default().normalize(&image);
        for (x, y, pixel) in out.visual.enumerate_pixels() {
            let Rgb([r, g, b]) = *pixel;
            assert_eq!(r, g);
            assert_eq!(g, b);
            let expected = (r as f32 / 255.0 - 0.5) / 0.5;
            let actual = out.tensor[[0, 0, y as usize, x as usize]];
            assert!((actual - expected).abs() < 1e-6);
        }
    }

    #[test]
    fn normalization_is_deterministic() {
        let image = fingerprint_like(150, 400);
        let preprocessor = FingerprintPreprocessor::default();
        let first = preprocessor.normalize(&image);
        let second = preprocessor.normalize(&image);
        assert_eq!(first.tensor, second.tensor);
        assert_eq!(first.visual, second.visual);
    }

    #[test]
    fn decodes_grayscale_and_alpha_sources() {
        let gray = DynamicImage::ImageLuma8(GrayImage::from_pixel(40, 30, Luma([90])));
        let decoded = FingerprintPreprocessor::decode(&encode_png(gray)).unwrap();
        assert_eq!(decoded.dimensions(), (40, 30));
        assert_eq!(to_grayscale(&decoded)[[0, 0]], 90);

        let rgba = DynamicImage::ImageRgba8(RgbaImage::from_pixel(8, 8, Rgba([10, 20, 30, 0])));
        let decoded = FingerprintPreprocessor::decode(&encode_png(rgba)).unwrap();
        assert_eq!(*decoded.get_pixel(0, 0), Rgb([10, 20, 30]));
    }

    #[test]
    fn rejects_malformed_bytes() {
        let err = FingerprintPreprocessor::decode(b"definitely not an image").unwrap_err();
        assert!(matches!(err, PreprocessError::Decode(_)));

        let mut truncated = encode_png(DynamicImage::ImageRgb8(fingerprint_like(32, 32)));
        truncated.truncate(truncated.len() / 2);
        assert!(FingerprintPreprocessor::decode(&truncated).is_err());
    }
}

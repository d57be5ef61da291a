//! Frame type and the scene statistics used for adaptive tolerance.

use image::DynamicImage;
use std::path::PathBuf;

/// A grayscale frame handed to the embedders.
#[derive(Clone)]
pub struct Frame {
    /// Grayscale pixel data (width * height bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// File the frame was decoded from, when it came from disk.
    pub source: Option<PathBuf>,
}

impl Frame {
    /// Wrap raw grayscale bytes, checking the buffer covers `width * height`.
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Result<Self, FrameError> {
        let expected = width as usize * height as usize;
        if data.len() < expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
            source: None,
        })
    }

    /// Convert a decoded image to 8-bit luma.
    pub fn from_image(image: &DynamicImage) -> Self {
        let gray = image.to_luma8();
        let (width, height) = gray.dimensions();
        Self {
            data: gray.into_raw(),
            width,
            height,
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<PathBuf>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Average pixel brightness (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().map(|&b| b as f32).sum::<f32>() / self.data.len() as f32
    }

    /// Population variance of pixel intensities.
    ///
    /// Flat or badly lit scenes score low; textured, well lit scenes score
    /// in the high hundreds to thousands. Fed to the matcher as the scene
    /// variance signal.
    pub fn variance(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        let n = self.data.len() as f64;
        let mut sum = 0u64;
        let mut sum_sq = 0u64;
        for &p in &self.data {
            let p = p as u64;
            sum += p;
            sum_sq += p * p;
        }
        let mean = sum as f64 / n;
        ((sum_sq as f64 / n) - mean * mean).max(0.0) as f32
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid frame length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};

    #[test]
    fn test_new_rejects_short_buffer() {
        let result = Frame::new(vec![0u8; 3], 2, 2);
        assert!(matches!(
            result,
            Err(FrameError::InvalidLength { expected: 4, actual: 3 })
        ));
    }

    #[test]
    fn test_variance_uniform_is_zero() {
        let frame = Frame::new(vec![128u8; 100], 10, 10).unwrap();
        assert_eq!(frame.variance(), 0.0);
        assert!((frame.avg_brightness() - 128.0).abs() < 1e-6);
    }

    #[test]
    fn test_variance_two_levels() {
        // Half 0, half 200 → mean 100, variance 100^2
        let mut data = vec![0u8; 50];
        data.extend(vec![200u8; 50]);
        let frame = Frame::new(data, 10, 10).unwrap();
        assert!((frame.variance() - 10_000.0).abs() < 1e-2);
    }

    #[test]
    fn test_variance_empty() {
        let frame = Frame::new(vec![], 0, 0).unwrap();
        assert_eq!(frame.variance(), 0.0);
        assert_eq!(frame.avg_brightness(), 0.0);
    }

    #[test]
    fn test_from_image_luma() {
        let img = GrayImage::from_fn(4, 2, |x, _| Luma([(x * 10) as u8]));
        let frame = Frame::from_image(&DynamicImage::ImageLuma8(img)).with_source("a.png");
        assert_eq!(frame.width, 4);
        assert_eq!(frame.height, 2);
        assert_eq!(frame.data, vec![0, 10, 20, 30, 0, 10, 20, 30]);
        assert_eq!(frame.source.as_deref(), Some(std::path::Path::new("a.png")));
    }
}

//! Lossy recompression of fetched images.

use std::io::Cursor;

use async_trait::async_trait;
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;

use crate::error::{ImgBatchError, Result};

#[async_trait]
pub trait ImageTransformer: Send + Sync {
    /// Re-encode `input`, returning the new bytes.
    async fn transform(&self, input: Bytes) -> Result<Bytes>;

    /// File extension of the produced format, without the dot.
    fn extension(&self) -> &'static str;
}

/// Re-encodes any supported input format as baseline JPEG at a fixed quality.
///
/// Decoding and encoding are CPU-bound and run on the blocking pool. The
/// input is bounded by the fetcher's size limit, so the decoded image is too.
#[derive(Debug, Clone, Copy)]
pub struct JpegRecompressor {
    quality: u8,
}

impl JpegRecompressor {
    /// `quality` is clamped to 1..=100.
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    fn recompress(quality: u8, input: &[u8]) -> Result<Vec<u8>> {
        let decoded = image::load_from_memory(input)
            .map_err(|e| ImgBatchError::Transform(format!("Failed to decode image: {e}")))?;

        let mut out = Cursor::new(Vec::with_capacity(input.len() / 2));
        decoded
            .to_rgb8()
            .write_with_encoder(JpegEncoder::new_with_quality(&mut out, quality))
            .map_err(|e| ImgBatchError::Transform(format!("Failed to encode JPEG: {e}")))?;
        Ok(out.into_inner())
    }
}

impl Default for JpegRecompressor {
    fn default() -> Self {
        Self::new(50)
    }
}

#[async_trait]
impl ImageTransformer for JpegRecompressor {
    async fn transform(&self, input: Bytes) -> Result<Bytes> {
        let quality = self.quality;
        let output = tokio::task::spawn_blocking(move || Self::recompress(quality, &input))
            .await
            .map_err(|e| ImgBatchError::Transform(format!("Transform task failed: {e}")))??;
        Ok(Bytes::from(output))
    }

    fn extension(&self) -> &'static str {
        "jpg"
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, RgbImage};

    /// A small noisy PNG, so quality actually changes the output size.
    pub(crate) fn sample_png() -> Vec<u8> {
        let img = RgbImage::from_fn(64, 64, |x, y| {
            Rgb([
                (x * 7 + y * 13) as u8,
                (x * y) as u8,
                (x ^ y).wrapping_mul(31) as u8,
            ])
        });
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[tokio::test]
    async fn test_recompresses_png_to_jpeg() {
        let jpeg = JpegRecompressor::default()
            .transform(Bytes::from(sample_png()))
            .await
            .unwrap();

        // JPEG SOI marker
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (64, 64));
    }

    #[tokio::test]
    async fn test_lower_quality_is_smaller() {
        let input = Bytes::from(sample_png());
        let low = JpegRecompressor::new(10).transform(input.clone()).await.unwrap();
        let high = JpegRecompressor::new(95).transform(input).await.unwrap();
        assert!(low.len() < high.len());
    }

    #[tokio::test]
    async fn test_rejects_garbage() {
        let err = JpegRecompressor::default()
            .transform(Bytes::from_static(b"definitely not an image"))
            .await
            .unwrap_err();
        assert!(matches!(err, ImgBatchError::Transform(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn quality_is_clamped() {
        assert_eq!(JpegRecompressor::new(0).quality(), 1);
        assert_eq!(JpegRecompressor::new(200).quality(), 100);
    }
}

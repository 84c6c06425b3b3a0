//! Adaptive JPEG compression to a byte budget
//!
//! 1. Decode once, applying the source orientation (pixels come out upright)
//! 2. Downscale so neither edge exceeds `max_dimension` (fast_image_resize, Lanczos3)
//! 3. Bisect the encoder quality until the output lands in `[target, target * tolerance]`
//! 4. Re-embed the source EXIF block with orientation forced to 1
//!
//! The search is an explicit bounded loop that remembers the largest result
//! under the ceiling and the smallest result over it, so whatever stops the
//! loop, the returned buffer is never larger than the best candidate seen.

use fast_image_resize as fr;
use fr::images::Image as FrImage;
use image::codecs::jpeg::JpegEncoder;
use image::metadata::Orientation;
use image::{DynamicImage, ExtendedColorType, ImageDecoder, ImageReader, RgbImage};
use serde::Serialize;
use std::io::Cursor;
use tracing::{debug, warn};

use crate::config::CompressionConfig;
use crate::error::{AssetError, Result};
use crate::metadata::{EmbeddedMetadata, MetadataCodec};

pub const JPEG_MIME: &str = "image/jpeg";

/// Why the quality search stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchStop {
    /// Output landed inside the accepted window
    Accepted,
    /// Successive qualities moved less than `convergence_delta`
    Converged,
    /// `max_attempts` reached
    AttemptCap,
}

/// Result of a quality search
#[derive(Debug, Clone)]
pub struct QualitySearch {
    pub data: Vec<u8>,
    pub quality: f32,
    pub attempts: u32,
    pub stop: SearchStop,
}

/// Output of `AdaptiveCompressor::compress`
#[derive(Debug, Clone, Serialize)]
pub struct CompressedImage {
    #[serde(skip)]
    pub data: Vec<u8>,
    pub original_size: usize,
    pub width: u32,
    pub height: u32,
    pub quality: f32,
    pub attempts: u32,
    pub stop: SearchStop,
    /// Source EXIF was carried into the output
    pub metadata_preserved: bool,
}

impl CompressedImage {
    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn mime_type(&self) -> &'static str {
        JPEG_MIME
    }
}

struct Candidate {
    data: Vec<u8>,
    quality: f32,
}

#[derive(Debug, Clone)]
pub struct AdaptiveCompressor {
    config: CompressionConfig,
}

impl AdaptiveCompressor {
    pub fn new(config: CompressionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }

    /// Compress `source` to roughly `target_size_bytes`
    pub fn compress(&self, source: &[u8], target_size_bytes: u64) -> Result<CompressedImage> {
        let metadata = MetadataCodec::extract(source);
        if let Some(meta) = &metadata {
            debug!(orientation = ?meta.orientation, captured_at = ?meta.captured_at, "Source metadata found");
        }

        let image = decode_upright(source)?;
        let rgb = self.downscale(image)?;
        let (width, height) = rgb.dimensions();

        let mut embed = metadata;
        let mut metadata_preserved = embed.is_some();
        let search = self.search_quality(target_size_bytes, |quality| {
            let encoded = encode_jpeg(&rgb, quality)?;
            match embed.as_ref().and_then(|meta| with_metadata(&encoded, meta)) {
                Some(tagged) => Ok(tagged),
                None => {
                    // Injection failures are sticky: stop retrying for later attempts
                    if embed.take().is_some() {
                        metadata_preserved = false;
                    }
                    Ok(encoded)
                }
            }
        })?;

        debug!(
            original = source.len(),
            output = search.data.len(),
            quality = search.quality,
            attempts = search.attempts,
            stop = ?search.stop,
            "Compression finished"
        );

        Ok(CompressedImage {
            original_size: source.len(),
            width,
            height,
            quality: search.quality,
            attempts: search.attempts,
            stop: search.stop,
            metadata_preserved,
            data: search.data,
        })
    }

    /// Bisect encoder quality against a monotonic size function.
    ///
    /// `encode` is called once per attempt with a quality in
    /// `[min_quality, max_quality]`.
    pub fn search_quality<F>(&self, target_size_bytes: u64, mut encode: F) -> Result<QualitySearch>
    where
        F: FnMut(f32) -> Result<Vec<u8>>,
    {
        let cfg = &self.config;
        let target = target_size_bytes as f64;
        let ceiling = target * cfg.tolerance;

        let (mut low, mut high) = if cfg.min_quality <= cfg.max_quality {
            (cfg.min_quality, cfg.max_quality)
        } else {
            (cfg.max_quality, cfg.min_quality)
        };
        let mut quality = cfg.initial_quality.max(low).min(high);

        // Largest output that fits under the ceiling / smallest output that doesn't
        let mut best_fit: Option<Candidate> = None;
        let mut best_over: Option<Candidate> = None;
        let mut attempts = 0;

        let stop = loop {
            attempts += 1;
            let data = encode(quality)?;
            let size = data.len() as f64;
            debug!(attempt = attempts, quality, size = data.len(), target = target_size_bytes, "Encode attempt");

            if size >= target && size <= ceiling {
                return Ok(QualitySearch {
                    data,
                    quality,
                    attempts,
                    stop: SearchStop::Accepted,
                });
            }

            let too_large = size > ceiling;
            let candidate = Candidate { data, quality };
            if too_large {
                if best_over.as_ref().map_or(true, |b| candidate.data.len() < b.data.len()) {
                    best_over = Some(candidate);
                }
            } else if best_fit.as_ref().map_or(true, |b| candidate.data.len() > b.data.len()) {
                best_fit = Some(candidate);
            }

            if attempts >= cfg.max_attempts {
                break SearchStop::AttemptCap;
            }

            let next = if too_large {
                high = quality;
                (low + quality) / 2.0
            } else {
                low = quality;
                (quality + high) / 2.0
            };

            if (next - quality).abs() < cfg.convergence_delta {
                break SearchStop::Converged;
            }
            quality = next;
        };

        let chosen = best_fit
            .or(best_over)
            .ok_or_else(|| AssetError::Encode("quality search produced no candidate".to_string()))?;

        Ok(QualitySearch {
            data: chosen.data,
            quality: chosen.quality,
            attempts,
            stop,
        })
    }

    fn downscale(&self, image: DynamicImage) -> Result<RgbImage> {
        let rgb = image.into_rgb8();
        let (width, height) = rgb.dimensions();
        let (dst_width, dst_height) = fit_within(width, height, self.config.max_dimension);
        if (dst_width, dst_height) == (width, height) {
            return Ok(rgb);
        }

        let src_image = FrImage::from_vec_u8(width, height, rgb.into_raw(), fr::PixelType::U8x3)
            .map_err(|e| AssetError::Encode(format!("Failed to create source image: {:?}", e)))?;
        let mut dst_image = FrImage::new(dst_width, dst_height, src_image.pixel_type());

        let mut resizer = fr::Resizer::new();
        resizer
            .resize(&src_image, &mut dst_image, None)
            .map_err(|e| AssetError::Encode(format!("Resize failed: {:?}", e)))?;

        RgbImage::from_raw(dst_width, dst_height, dst_image.buffer().to_vec())
            .ok_or_else(|| AssetError::Encode("Failed to create image from resized data".to_string()))
    }
}

impl Default for AdaptiveCompressor {
    fn default() -> Self {
        Self::new(CompressionConfig::default())
    }
}

/// Decode `source`, applying its EXIF orientation exactly once
pub fn decode_upright(source: &[u8]) -> Result<DynamicImage> {
    let reader = ImageReader::new(Cursor::new(source))
        .with_guessed_format()
        .map_err(|e| AssetError::Decode(e.to_string()))?;
    let mut decoder = reader
        .into_decoder()
        .map_err(|e| AssetError::Decode(e.to_string()))?;
    let orientation = decoder.orientation().unwrap_or(Orientation::NoTransforms);

    let mut image = DynamicImage::from_decoder(decoder).map_err(|e| AssetError::Decode(e.to_string()))?;
    image.apply_orientation(orientation);
    Ok(image)
}

fn encode_jpeg(rgb: &RgbImage, quality: f32) -> Result<Vec<u8>> {
    let q = (quality * 100.0).round().clamp(1.0, 100.0) as u8;
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, q)
        .encode(rgb.as_raw(), rgb.width(), rgb.height(), ExtendedColorType::Rgb8)
        .map_err(|e| AssetError::Encode(e.to_string()))?;
    Ok(out)
}

fn with_metadata(encoded: &[u8], metadata: &EmbeddedMetadata) -> Option<Vec<u8>> {
    match MetadataCodec::inject(encoded, metadata) {
        Ok(tagged) => Some(tagged),
        Err(e) => {
            warn!("Metadata injection failed, emitting without metadata: {}", e);
            None
        }
    }
}

/// Scale `(width, height)` so the longest edge is at most `max`, keeping aspect ratio
fn fit_within(width: u32, height: u32, max: u32) -> (u32, u32) {
    if width <= max && height <= max {
        return (width, height);
    }
    if width >= height {
        let scaled = (height as f64 * max as f64 / width as f64).round() as u32;
        (max, scaled.max(1))
    } else {
        let scaled = (width as f64 * max as f64 / height as f64).round() as u32;
        (scaled.max(1), max)
    }
}

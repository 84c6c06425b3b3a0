//! Dominant color extraction
//!
//! Averages a strided sample of pixels from an already-decoded image. The image
//! is first reduced to at most `max_sample_dimension` per edge on the blocking
//! pool; the sweep then runs on the caller's task in `chunk_pixels` slices,
//! yielding between slices so long sweeps never hog the executor.
//!
//! Sample positions are absolute pixel indices (`i % stride == 0`), so chunked
//! and single-pass sweeps see exactly the same pixels.

use image::{DynamicImage, RgbaImage};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::cache::{CacheStore, StyleEntry};
use crate::compressor::decode_upright;
use crate::config::ColorConfig;
use crate::metrics::Metrics;
use crate::payload::BinaryPayload;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DominantColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl DominantColor {
    /// Fallback when nothing can be sampled
    pub const NEUTRAL: DominantColor = DominantColor { r: 128, g: 128, b: 128 };

    pub fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Perceived brightness (ITU-R BT.601 weights)
    pub fn luminance(&self) -> f32 {
        0.299 * self.r as f32 + 0.587 * self.g as f32 + 0.114 * self.b as f32
    }

    pub fn is_bright(&self, threshold: f32) -> bool {
        self.luminance() > threshold
    }

    /// Derived display strings; a pure function of the triple
    pub fn style(&self, brightness_threshold: f32) -> DisplayStyle {
        let DominantColor { r, g, b } = *self;
        let bright = self.is_bright(brightness_threshold);
        let darken = |c: u8| (c as f32 * 0.85).floor() as u8;

        DisplayStyle {
            title_background: format!("rgba({}, {}, {}, 0.85)", r, g, b),
            text_color: if bright { "#1a1a1a" } else { "#ffffff" }.to_string(),
            border_color: if bright {
                "rgba(0, 0, 0, 0.25)"
            } else {
                "rgba(255, 255, 255, 0.25)"
            }
            .to_string(),
            description_background: format!("rgba({}, {}, {}, 0.95)", darken(r), darken(g), darken(b)),
        }
    }
}

/// CSS-style color strings derived from a `DominantColor`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayStyle {
    pub title_background: String,
    pub text_color: String,
    pub border_color: String,
    pub description_background: String,
}

#[derive(Default)]
struct Accumulator {
    r: u64,
    g: u64,
    b: u64,
    count: u64,
}

impl Accumulator {
    /// Sample every `stride`-th pixel with index in `[start, end)`
    fn sweep(&mut self, rgba: &[u8], start: usize, end: usize, stride: usize) {
        let first = start.div_ceil(stride) * stride;
        for i in (first..end).step_by(stride) {
            let px = &rgba[i * 4..i * 4 + 3];
            self.r += px[0] as u64;
            self.g += px[1] as u64;
            self.b += px[2] as u64;
            self.count += 1;
        }
    }

    fn finish(&self) -> DominantColor {
        if self.count == 0 {
            return DominantColor::NEUTRAL;
        }
        DominantColor {
            r: (self.r / self.count) as u8,
            g: (self.g / self.count) as u8,
            b: (self.b / self.count) as u8,
        }
    }
}

#[derive(Clone)]
pub struct DominantColorExtractor {
    config: ColorConfig,
    cache: Option<CacheStore>,
    metrics: Option<Arc<Metrics>>,
}

impl DominantColorExtractor {
    pub fn new(config: ColorConfig) -> Self {
        Self {
            config,
            cache: None,
            metrics: None,
        }
    }

    /// Memoize derived styles in the cache's style tier
    pub fn with_cache(mut self, cache: CacheStore) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &ColorConfig {
        &self.config
    }

    /// Average color of a decoded image
    pub async fn extract(&self, image: DynamicImage) -> DominantColor {
        let max = self.config.max_sample_dimension;
        let sample = if image.width() > max || image.height() > max {
            match tokio::task::spawn_blocking(move || image.thumbnail(max, max).into_rgba8()).await {
                Ok(sample) => sample,
                Err(e) => {
                    warn!("Color sampling task failed: {}", e);
                    return DominantColor::NEUTRAL;
                }
            }
        } else {
            image.into_rgba8()
        };
        self.average(&sample).await
    }

    /// Decode `bytes` and extract; undecodable input yields `NEUTRAL`
    pub async fn extract_bytes(&self, bytes: &[u8]) -> DominantColor {
        let owned = bytes.to_vec();
        let max = self.config.max_sample_dimension;
        let decoded = tokio::task::spawn_blocking(move || {
            decode_upright(&owned).map(|image| {
                if image.width() > max || image.height() > max {
                    image.thumbnail(max, max).into_rgba8()
                } else {
                    image.into_rgba8()
                }
            })
        })
        .await;

        match decoded {
            Ok(Ok(sample)) => self.average(&sample).await,
            Ok(Err(e)) => {
                warn!("Color extraction fell back to neutral: {}", e);
                DominantColor::NEUTRAL
            }
            Err(e) => {
                warn!("Color sampling task failed: {}", e);
                DominantColor::NEUTRAL
            }
        }
    }

    /// Color and style for an asset, memoized by `(asset_id, signature)`
    pub async fn extract_for(
        &self,
        asset_id: &str,
        signature: Option<&str>,
        payload: &BinaryPayload,
    ) -> StyleEntry {
        if let Some(cached) = self.cache.as_ref().and_then(|c| c.style(asset_id, signature)) {
            debug!(asset_id, "Style tier hit");
            return cached;
        }

        let color = self.extract_bytes(payload.bytes()).await;
        let style = color.style(self.config.brightness_threshold);

        match &self.cache {
            Some(cache) => cache.put_style(asset_id, signature, color, style),
            None => StyleEntry {
                signature: signature.map(str::to_string),
                handle: None,
                color,
                style,
            },
        }
    }

    async fn average(&self, sample: &RgbaImage) -> DominantColor {
        let rgba = sample.as_raw();
        let total = rgba.len() / 4;
        let stride = self.config.sample_stride.max(1);
        let chunk = self.config.chunk_pixels.max(1);

        let mut acc = Accumulator::default();
        if total <= chunk {
            acc.sweep(rgba, 0, total, stride);
        } else {
            let mut start = 0;
            while start < total {
                let end = (start + chunk).min(total);
                acc.sweep(rgba, start, end, stride);
                start = end;
                tokio::task::yield_now().await;
            }
        }

        if let Some(metrics) = &self.metrics {
            Metrics::incr(&metrics.color_extractions);
        }
        let color = acc.finish();
        debug!(r = color.r, g = color.g, b = color.b, samples = acc.count, "Dominant color");
        color
    }
}

impl Default for DominantColorExtractor {
    fn default() -> Self {
        Self::new(ColorConfig::default())
    }
}

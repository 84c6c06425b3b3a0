//! Integration tests for the soma_assets pipeline

use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, RgbImage};
use img_parts::jpeg::Jpeg;
use img_parts::{Bytes, ImageEXIF};
use serde_json::json;
use soma_assets::organ::{AssetOrgan, Organ, Stimulus};
use soma_assets::*;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const KIB: u64 = 1024;

/// Deterministic xorshift noise
struct Noise(u32);

impl Noise {
    fn next(&mut self) -> u32 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.0 = x;
        x
    }

    fn jitter(&mut self, amplitude: i32) -> i32 {
        (self.next() % (2 * amplitude as u32 + 1)) as i32 - amplitude
    }
}

/// Gradient with per-channel noise; JPEG size tracks quality smoothly
fn textured_jpeg(width: u32, height: u32, quality: u8, seed: u32) -> Vec<u8> {
    let mut noise = Noise(seed);
    let img = RgbImage::from_fn(width, height, |x, y| {
        let base = [
            (x * 255 / width) as i32,
            (y * 255 / height) as i32,
            (((x + y) / 7) % 256) as i32,
        ];
        let mut px = [0u8; 3];
        for (c, b) in base.iter().enumerate() {
            px[c] = (b + noise.jitter(12)).clamp(0, 255) as u8;
        }
        image::Rgb(px)
    });

    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality)
        .encode(img.as_raw(), width, height, ExtendedColorType::Rgb8)
        .unwrap();
    out
}

/// Offset of the orientation value inside `exif_block`
const ORIENTATION_VALUE_AT: usize = 18;

/// Little-endian TIFF: IFD0 {Orientation, Make, ExifIFD}, ExifIFD {DateTimeOriginal}
fn exif_block(orientation: u16, make: &str, datetime: &str) -> Vec<u8> {
    let make = format!("{}\0", make);
    let datetime = format!("{}\0", datetime);
    let ifd0_len = 2 + 3 * 12 + 4;
    let make_at = 8 + ifd0_len;
    let make_pad = make.len() % 2;
    let exif_ifd_at = make_at + make.len() + make_pad;
    let datetime_at = exif_ifd_at + 2 + 12 + 4;

    let mut t = Vec::new();
    t.extend_from_slice(b"II");
    t.extend_from_slice(&42u16.to_le_bytes());
    t.extend_from_slice(&8u32.to_le_bytes());

    t.extend_from_slice(&3u16.to_le_bytes());
    // Orientation SHORT
    t.extend_from_slice(&0x0112u16.to_le_bytes());
    t.extend_from_slice(&3u16.to_le_bytes());
    t.extend_from_slice(&1u32.to_le_bytes());
    t.extend_from_slice(&orientation.to_le_bytes());
    t.extend_from_slice(&[0, 0]);
    // Make ASCII
    t.extend_from_slice(&0x010Fu16.to_le_bytes());
    t.extend_from_slice(&2u16.to_le_bytes());
    t.extend_from_slice(&(make.len() as u32).to_le_bytes());
    t.extend_from_slice(&(make_at as u32).to_le_bytes());
    // ExifIFD pointer
    t.extend_from_slice(&0x8769u16.to_le_bytes());
    t.extend_from_slice(&4u16.to_le_bytes());
    t.extend_from_slice(&1u32.to_le_bytes());
    t.extend_from_slice(&(exif_ifd_at as u32).to_le_bytes());
    t.extend_from_slice(&0u32.to_le_bytes());

    t.extend_from_slice(make.as_bytes());
    t.extend(std::iter::repeat(0).take(make_pad));

    t.extend_from_slice(&1u16.to_le_bytes());
    t.extend_from_slice(&0x9003u16.to_le_bytes());
    t.extend_from_slice(&2u16.to_le_bytes());
    t.extend_from_slice(&(datetime.len() as u32).to_le_bytes());
    t.extend_from_slice(&(datetime_at as u32).to_le_bytes());
    t.extend_from_slice(&0u32.to_le_bytes());

    t.extend_from_slice(datetime.as_bytes());
    t
}

fn with_exif(jpeg: Vec<u8>, tiff: Vec<u8>) -> Vec<u8> {
    let mut container = Jpeg::from_bytes(Bytes::from(jpeg)).unwrap();
    container.set_exif(Some(Bytes::from(tiff)));
    container.encoder().bytes().to_vec()
}

fn compressor(target: u64) -> AdaptiveCompressor {
    AdaptiveCompressor::new(CompressionConfig {
        target_size_bytes: target,
        ..CompressionConfig::default()
    })
}

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

/// Fetcher that counts calls and the widest overlap it saw
struct CountingFetcher {
    calls: Mutex<HashMap<String, usize>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    delay: Duration,
    body: Vec<u8>,
}

impl CountingFetcher {
    fn new(delay: Duration, body: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(HashMap::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            delay,
            body,
        })
    }

    fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl AssetFetcher for CountingFetcher {
    async fn fetch_asset(&self, asset_id: &str) -> Result<BinaryPayload> {
        *self.calls.lock().unwrap().entry(asset_id.to_string()).or_default() += 1;
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(BinaryPayload::sniffed(self.body.clone()))
    }
}

/// Uploader that fails chosen indices and rejects undecodable images
struct ScriptedUploader {
    fail_indices: HashSet<usize>,
    attempts: Mutex<HashMap<String, usize>>,
    sizes: Mutex<HashMap<String, usize>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl ScriptedUploader {
    fn new(fail_indices: &[usize]) -> Arc<Self> {
        Arc::new(Self {
            fail_indices: fail_indices.iter().copied().collect(),
            attempts: Mutex::new(HashMap::new()),
            sizes: Mutex::new(HashMap::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl FileUploader for ScriptedUploader {
    async fn upload_file(
        &self,
        payload: BinaryPayload,
        metadata: &FileMetadata,
    ) -> std::result::Result<UploadResult, UploadError> {
        *self.attempts.lock().unwrap().entry(metadata.file_name.clone()).or_default() += 1;
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);

        if self.fail_indices.contains(&metadata.index) {
            return Err(UploadError::from_status(503, Some("Service unavailable".to_string())));
        }
        if payload.is_image() && decode_upright(payload.bytes()).is_err() {
            return Err(UploadError::from_status(
                422,
                Some(format!("{}: image could not be decoded", metadata.file_name)),
            ));
        }

        self.sizes
            .lock()
            .unwrap()
            .insert(metadata.file_name.clone(), payload.len());
        Ok(UploadResult {
            asset_id: format!("srv-{}", metadata.index),
            file_name: metadata.file_name.clone(),
            size: payload.len() as u64,
        })
    }
}

fn thumbnail_loader(fetcher: Arc<CountingFetcher>) -> (Arc<MemoryHandles>, ThumbnailLoader) {
    let handles = Arc::new(MemoryHandles::new());
    let cache = CacheStore::new(handles.clone());
    let queue = LoadQueue::new(&LoaderConfig {
        max_concurrent_loads: 2,
        redispatch_delay_ms: 1,
    });
    (handles, ThumbnailLoader::new(cache, queue, fetcher))
}

// ---------------------------------------------------------------------------
// Compression
// ---------------------------------------------------------------------------

#[test]
fn test_bisection_converges_within_cap() {
    let source = textured_jpeg(900, 600, 95, 7);
    for target_kb in [60u64, 120, 200] {
        let target = target_kb * KIB;
        if target >= source.len() as u64 {
            continue;
        }
        let result = compressor(target).compress(&source, target).unwrap();
        assert!(result.attempts <= 10);
        assert!(
            result.size() as f64 <= target as f64 * 1.1,
            "target {} KiB produced {} bytes",
            target_kb,
            result.size()
        );
    }
}

#[test]
fn test_metadata_round_trip_resets_orientation_only() {
    let tiff = exif_block(3, "Acme Cam", "2022:05:06 07:08:09");
    let source = with_exif(textured_jpeg(640, 480, 92, 11), tiff.clone());

    let result = compressor(20 * KIB).compress(&source, 20 * KIB).unwrap();
    assert!(result.metadata_preserved);

    let meta = MetadataCodec::extract(&result.data).expect("output carries EXIF");
    assert_eq!(meta.orientation, Some(1));
    assert_eq!(
        meta.captured_at.unwrap().format("%Y:%m:%d %H:%M:%S").to_string(),
        "2022:05:06 07:08:09"
    );

    let out = meta.exif_bytes();
    assert_eq!(out.len(), tiff.len());
    for (i, (a, b)) in tiff.iter().zip(out.iter()).enumerate() {
        if i != ORIENTATION_VALUE_AT && i != ORIENTATION_VALUE_AT + 1 {
            assert_eq!(a, b, "EXIF byte {} changed", i);
        }
    }
}

#[test]
fn test_compress_rejects_non_image() {
    let err = compressor(10 * KIB).compress(b"definitely not an image", 10 * KIB).unwrap_err();
    assert!(matches!(err, AssetError::Decode(_)));
}

// ---------------------------------------------------------------------------
// Loading and caching
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_single_flight_per_asset() {
    let fetcher = CountingFetcher::new(Duration::from_millis(20), textured_jpeg(32, 32, 80, 1));
    let (_, loader) = thumbnail_loader(fetcher.clone());
    let asset = AssetRef::new("asset-1").with_file_name("one.jpg");
    let hint = DisplayHint::thumbnail("field-1");

    assert_eq!(loader.load(&asset, &hint), LoadOutcome::Enqueued);
    assert_eq!(loader.load(&asset, &hint), LoadOutcome::AlreadyInFlight);
    loader.queue().wait_idle().await;

    assert_eq!(fetcher.total_calls(), 1);
    assert!(loader.cache().get("asset-1", Some("field-1")).is_some());
}

#[tokio::test]
async fn test_global_concurrency_bound() {
    let fetcher = CountingFetcher::new(Duration::from_millis(10), textured_jpeg(16, 16, 80, 2));
    let (_, loader) = thumbnail_loader(fetcher.clone());

    for i in 0..9 {
        loader.load(&AssetRef::new(format!("asset-{}", i)), &DisplayHint::default());
    }
    assert!(loader.queue().in_flight() <= 2);
    loader.queue().wait_idle().await;

    assert_eq!(fetcher.total_calls(), 9);
    assert!(fetcher.max_active.load(Ordering::SeqCst) <= 2);
    assert_eq!(loader.queue().peak_in_flight(), 2);
}

#[tokio::test]
async fn test_resurrection_without_fetch() {
    let fetcher = CountingFetcher::new(Duration::from_millis(1), textured_jpeg(16, 16, 80, 3));
    let (handles, loader) = thumbnail_loader(fetcher.clone());
    let asset = AssetRef::new("asset-r");
    let hint = DisplayHint::thumbnail("sig");

    loader.load(&asset, &hint);
    loader.queue().wait_idle().await;
    let stale = loader.cache().get("asset-r", Some("sig")).unwrap().handle;

    handles.revoke(&stale);

    let fresh = loader.cache().get("asset-r", Some("sig")).unwrap().handle;
    assert_ne!(fresh, stale);
    assert!(handles.is_live(&fresh));
    assert_eq!(loader.load(&asset, &hint), LoadOutcome::Cached);
    assert_eq!(fetcher.total_calls(), 1);
    assert_eq!(loader.cache().stats().resurrections, 1);
}

#[tokio::test]
async fn test_cleanup_releases_unkept_handles() {
    let fetcher = CountingFetcher::new(Duration::from_millis(1), textured_jpeg(16, 16, 80, 4));
    let (handles, loader) = thumbnail_loader(fetcher);

    for id in ["keep", "drop-a", "drop-b"] {
        loader.load(&AssetRef::new(id), &DisplayHint::thumbnail("s"));
    }
    loader.queue().wait_idle().await;
    assert_eq!(handles.live_count(), 3);

    let keep: HashSet<String> = ["keep".to_string()].into_iter().collect();
    let report = loader.cache().cleanup(&keep);
    assert_eq!(report.evicted, 2);
    assert_eq!(handles.live_count(), 1);
}

// ---------------------------------------------------------------------------
// Dominant color
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_color_is_deterministic() {
    let bytes = textured_jpeg(500, 300, 90, 5);
    let image = decode_upright(&bytes).unwrap();
    let extractor = DominantColorExtractor::default();

    let first = extractor.extract(image.clone()).await;
    let second = extractor.extract(image).await;
    assert_eq!(first, second);
    assert_eq!(first.style(160.0), second.style(160.0));
}

#[tokio::test]
async fn test_loader_memoizes_style_for_thumbnails() {
    let fetcher = CountingFetcher::new(Duration::from_millis(1), textured_jpeg(64, 64, 85, 6));
    let (_, loader) = thumbnail_loader(fetcher);
    let colors = DominantColorExtractor::default().with_cache(loader.cache().clone());
    let loader = loader.with_colors(colors);

    loader.load(&AssetRef::new("styled"), &DisplayHint::thumbnail("v1"));
    loader.queue().wait_idle().await;

    let mut style = None;
    for _ in 0..200 {
        style = loader.cache().style("styled", Some("v1"));
        if style.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let style = style.expect("style memoized after load");
    assert!(style.style.title_background.starts_with("rgba("));

    let entry = loader.cache().get("styled", Some("v1")).unwrap();
    assert_eq!(entry.color, Some(style.color));
    assert!(loader.cache().get("styled", Some("v2")).unwrap().color.is_none());
}

// ---------------------------------------------------------------------------
// Batch upload
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_batch_partial_failure() {
    let uploader = ScriptedUploader::new(&[3, 7]);
    let scheduler = BatchUploadScheduler::new(AdaptiveCompressor::default(), uploader.clone(), UploadConfig::default());

    let items: Vec<UploadItem> = (0..12)
        .map(|i| UploadItem::new(format!("doc-{:02}.txt", i), BinaryPayload::new(vec![b'a'; 64], "text/plain")))
        .collect();
    let report = scheduler.submit(items).await;

    assert_eq!(report.success_count, 10);
    assert_eq!(report.failed_count, 2);
    assert_eq!(report.errors.len(), 2);
    assert_eq!(report.errors[0].file_name, "doc-03.txt");
    assert_eq!(report.errors[1].file_name, "doc-07.txt");
    assert_eq!(report.errors[0].message, "Service unavailable");
    assert_eq!(report.outcome(), BatchOutcome::Partial);

    let attempts = uploader.attempts.lock().unwrap();
    assert_eq!(attempts.len(), 12);
    assert!(attempts.values().all(|&n| n == 1));
    assert!(uploader.max_active.load(Ordering::SeqCst) <= 10);
}

#[tokio::test]
async fn test_photo_and_corrupt_file_batch() {
    let tiff = exif_block(6, "Acme Cam", "2023:08:19 18:45:12");
    let photo = with_exif(textured_jpeg(2400, 1600, 95, 42), tiff);
    assert!(photo.len() as u64 > 600 * KIB);

    // Standalone compression check
    let result = AdaptiveCompressor::default().compress(&photo, 300 * KIB).unwrap();
    assert!(result.size() as u64 <= 330 * KIB, "got {} bytes", result.size());
    assert!(result.attempts <= 10);
    assert_eq!((result.width, result.height), (1280, 1920));
    let meta = MetadataCodec::extract(&result.data).unwrap();
    assert_eq!(meta.orientation, Some(1));
    assert_eq!(
        meta.captured_at.unwrap().format("%Y-%m-%d %H:%M:%S").to_string(),
        "2023-08-19 18:45:12"
    );

    // Corrupt file first, valid photo queued after it
    let mut corrupt = vec![0xFF, 0xD8, 0xFF, 0xE0];
    corrupt.extend(std::iter::repeat(0x42).take(400 * 1024));

    let uploader = ScriptedUploader::new(&[]);
    let scheduler = BatchUploadScheduler::new(AdaptiveCompressor::default(), uploader.clone(), UploadConfig::default());
    let report = scheduler
        .submit(vec![
            UploadItem::from_bytes("corrupt.jpg", corrupt),
            UploadItem::from_bytes("photo.jpg", photo),
        ])
        .await;

    assert_eq!(report.success_count, 1);
    assert_eq!(report.failed_count, 1);
    assert_eq!(report.errors[0].file_name, "corrupt.jpg");
    assert_eq!(report.errors[0].kind, UploadErrorKind::Validation);
    assert!(report.errors[0].message.contains("decoded"));
    assert_eq!(report.uploaded[0].file_name, "photo.jpg");
    assert_eq!(report.compressed_count, 1);
    assert!(report.summary().contains("corrupt.jpg:"));

    let sizes = uploader.sizes.lock().unwrap();
    assert!(sizes["photo.jpg"] as u64 <= 330 * KIB);
}

// ---------------------------------------------------------------------------
// Organ surface
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_organ_compress_and_upload() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.jpg");
    let output = dir.path().join("out.jpg");
    std::fs::write(&input, textured_jpeg(800, 600, 95, 9)).unwrap();

    let organ = AssetOrgan::new();
    let response = organ
        .stimulate(Stimulus {
            op: "asset.compress".to_string(),
            input: json!({"input_path": input, "output_path": output, "target_kb": 80}),
            context: HashMap::new(),
        })
        .await
        .unwrap();
    assert!(response.ok);
    assert!(response.output["size_bytes"].as_u64().unwrap() <= 88 * KIB);
    assert!(output.exists());

    let dest = dir.path().join("store");
    let response = organ
        .stimulate(Stimulus {
            op: "asset.upload_batch".to_string(),
            input: json!({"files": [input, output], "dest_dir": dest}),
            context: HashMap::new(),
        })
        .await
        .unwrap();
    assert!(response.ok);
    assert_eq!(response.output["success_count"], 2);
    assert_eq!(response.output["outcome"], "all_succeeded");
    assert!(dest.join("in.jpg").exists());
    assert!(dest.join("out.jpg").exists());

    let snapshot = organ.metrics().snapshot();
    assert_eq!(snapshot.operations.compress, 1);
    assert_eq!(snapshot.pipeline.uploads_succeeded, 2);
}

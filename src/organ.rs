//! UMA Organ Interface for soma_assets
//!
//! Exposes the asset pipeline through the Universal Module Architecture (UMA)
//! stimulus/response surface so orchestrators can discover and invoke it.
//!
//! ## Available Operations
//!
//! 1. `asset.compress` - Compress an image file to a byte budget
//! 2. `asset.dominant_color` - Dominant color and derived display style
//! 3. `asset.upload_batch` - Compress and upload a set of files into a directory
//! 4. `asset.capabilities` - Capability card query
//! 5. `metrics` - Counter snapshot
//!
//! ## Example
//!
//! ```rust,no_run
//! use soma_assets::organ::{AssetOrgan, Organ, Stimulus};
//! use serde_json::json;
//! use std::collections::HashMap;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let organ = AssetOrgan::new();
//!
//! let response = organ.stimulate(Stimulus {
//!     op: "asset.compress".to_string(),
//!     input: json!({"input_path": "photo.jpg", "output_path": "/tmp/photo.jpg", "target_kb": 300}),
//!     context: HashMap::new(),
//! }).await?;
//! println!("{}", response.output);
//! # Ok(())
//! # }
//! ```

use crate::compressor::AdaptiveCompressor;
use crate::color::DominantColorExtractor;
use crate::config::PipelineConfig;
use crate::error::AssetError;
use crate::local::DirectoryUploader;
use crate::metrics::Metrics;
use crate::scheduler::{BatchUploadScheduler, UploadItem};
use crate::validation::validate_input;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// UMA Stimulus - input to organ operations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stimulus {
    pub op: String,
    pub input: Value,
    #[serde(default)]
    pub context: HashMap<String, String>,
}

/// UMA Response - output from organ operations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    pub output: Value,
    pub latency_ms: u64,
    pub cost: Option<f64>,
}

/// Organ trait - all SOMA organs implement this
#[async_trait]
pub trait Organ: Send + Sync {
    async fn stimulate(&self, stimulus: Stimulus) -> Result<Response, OrganError>;
    fn describe(&self) -> OrganCard;
}

/// Organ-level errors
#[derive(Debug, Error)]
pub enum OrganError {
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Processing error: {0}")]
    ProcessingError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error(transparent)]
    Asset(#[from] AssetError),
}

/// Organ capability card
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrganCard {
    pub name: String,
    pub version: String,
    pub description: String,
    pub division: String,
    pub subsystem: String,
    pub tags: Vec<String>,
    pub execution_modes: Vec<String>,
    pub functions: Vec<FunctionCard>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
}

/// Function capability card
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCard {
    pub name: String,
    pub description: String,
    pub tags: Vec<String>,
    pub examples: Vec<String>,
    pub idempotent: bool,
    pub side_effects: Vec<String>,
    pub input_schema: Option<Value>,
    pub output_schema: Value,
}

const OPERATIONS: [&str; 5] = [
    "asset.compress",
    "asset.dominant_color",
    "asset.upload_batch",
    "asset.capabilities",
    "metrics",
];

/// Media asset pipeline organ
pub struct AssetOrgan {
    config: PipelineConfig,
    metrics: Arc<Metrics>,
}

impl AssetOrgan {
    pub fn new() -> Self {
        Self::with_config(PipelineConfig::default())
    }

    pub fn with_config(config: PipelineConfig) -> Self {
        Self {
            config,
            metrics: Metrics::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    fn input_schema(&self, op: &str) -> Option<Value> {
        function_cards()
            .into_iter()
            .find(|card| card.name == op)
            .and_then(|card| card.input_schema)
    }

    /// Handle asset.compress operation
    async fn handle_compress(&self, input: Value) -> Result<Value, OrganError> {
        let input_path = required_str(&input, "input_path")?.to_string();
        let output_path = required_str(&input, "output_path")?.to_string();

        let mut config = self.config.compression.clone();
        if let Some(kb) = input["target_kb"].as_u64() {
            config.target_size_bytes = kb
                .checked_mul(1024)
                .ok_or_else(|| OrganError::InvalidInput(format!("target_kb {} is too large", kb)))?;
        }
        if let Some(max) = input["max_dimension"].as_u64() {
            config.max_dimension = u32::try_from(max)
                .map_err(|_| OrganError::InvalidInput(format!("max_dimension {} is too large", max)))?;
        }
        config
            .validate()
            .map_err(|e| OrganError::InvalidInput(e.to_string()))?;
        let target = config.target_size_bytes;

        let source = tokio::fs::read(&input_path)
            .await
            .map_err(|e| OrganError::ProcessingError(format!("Failed to read {}: {}", input_path, e)))?;

        let compressor = AdaptiveCompressor::new(config);
        let compressed = tokio::task::spawn_blocking(move || compressor.compress(&source, target))
            .await
            .map_err(|e| OrganError::ProcessingError(format!("Compression task failed: {}", e)))??;

        tokio::fs::write(&output_path, &compressed.data)
            .await
            .map_err(|e| OrganError::ProcessingError(format!("Failed to write {}: {}", output_path, e)))?;
        Metrics::incr(&self.metrics.compressions);

        let mut output = serde_json::to_value(&compressed)?;
        output["output_path"] = json!(output_path);
        output["size_bytes"] = json!(compressed.size());
        output["target_bytes"] = json!(target);
        Ok(output)
    }

    /// Handle asset.dominant_color operation
    async fn handle_dominant_color(&self, input: Value) -> Result<Value, OrganError> {
        let input_path = required_str(&input, "input_path")?;
        let bytes = tokio::fs::read(input_path)
            .await
            .map_err(|e| OrganError::ProcessingError(format!("Failed to read {}: {}", input_path, e)))?;

        let extractor = DominantColorExtractor::new(self.config.color.clone()).with_metrics(self.metrics());
        let color = extractor.extract_bytes(&bytes).await;
        let style = color.style(self.config.color.brightness_threshold);

        Ok(json!({
            "r": color.r,
            "g": color.g,
            "b": color.b,
            "bright": color.is_bright(self.config.color.brightness_threshold),
            "style": style,
        }))
    }

    /// Handle asset.upload_batch operation
    async fn handle_upload_batch(&self, input: Value) -> Result<Value, OrganError> {
        let dest_dir = required_str(&input, "dest_dir")?;
        let files = input["files"]
            .as_array()
            .ok_or_else(|| OrganError::InvalidInput("Missing files".to_string()))?;

        let mut items = Vec::with_capacity(files.len());
        for file in files {
            let path = file
                .as_str()
                .ok_or_else(|| OrganError::InvalidInput("files must be paths".to_string()))?;
            let bytes = tokio::fs::read(path)
                .await
                .map_err(|e| OrganError::ProcessingError(format!("Failed to read {}: {}", path, e)))?;
            let name = Path::new(path)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.to_string());
            items.push(UploadItem::from_bytes(name, bytes));
        }

        self.config
            .validate()
            .map_err(|e| OrganError::InvalidInput(e.to_string()))?;

        let mut compression = self.config.compression.clone();
        if let Some(enabled) = input["compress"].as_bool() {
            compression.enabled = enabled;
        }

        let scheduler = BatchUploadScheduler::new(
            AdaptiveCompressor::new(compression),
            Arc::new(DirectoryUploader::new(dest_dir)),
            self.config.upload.clone(),
        )
        .with_metrics(self.metrics());

        let report = scheduler.submit(items).await;
        let mut output = serde_json::to_value(&report)?;
        output["outcome"] = serde_json::to_value(report.outcome())?;
        output["summary"] = json!(report.summary());
        Ok(output)
    }

    /// Handle asset.capabilities operation
    fn handle_capabilities(&self) -> Result<Value, OrganError> {
        let card = self.describe();
        serde_json::to_value(&card).map_err(OrganError::SerializationError)
    }

    async fn dispatch(&self, op: &str, input: Value) -> Result<Value, OrganError> {
        if let Some(schema) = self.input_schema(op) {
            validate_input(&input, &schema)?;
        }

        match op {
            "asset.compress" => self.handle_compress(input).await,
            "asset.dominant_color" => self.handle_dominant_color(input).await,
            "asset.upload_batch" => self.handle_upload_batch(input).await,
            "asset.capabilities" => self.handle_capabilities(),
            "metrics" => Ok(json!(self.metrics.snapshot())),
            other => Err(OrganError::UnsupportedOperation(other.to_string())),
        }
    }
}

impl Default for AssetOrgan {
    fn default() -> Self {
        Self::new()
    }
}

fn required_str<'a>(input: &'a Value, field: &str) -> Result<&'a str, OrganError> {
    input[field]
        .as_str()
        .ok_or_else(|| OrganError::InvalidInput(format!("Missing {}", field)))
}

#[async_trait]
impl Organ for AssetOrgan {
    async fn stimulate(&self, stimulus: Stimulus) -> Result<Response, OrganError> {
        let start = Instant::now();
        let op = stimulus.op;

        match self.dispatch(&op, stimulus.input).await {
            Ok(output) => {
                let latency = start.elapsed().as_millis() as u64;
                self.metrics.record_request(&op, true, latency);
                Ok(Response {
                    ok: true,
                    output,
                    latency_ms: latency,
                    cost: None,
                })
            }
            Err(OrganError::UnsupportedOperation(_)) => {
                let latency = start.elapsed().as_millis() as u64;
                self.metrics.record_request(&op, false, latency);
                Ok(Response {
                    ok: false,
                    output: json!({
                        "error": "UnsupportedOperation",
                        "op": op,
                        "available_operations": OPERATIONS,
                    }),
                    latency_ms: latency,
                    cost: None,
                })
            }
            Err(e) => {
                let latency = start.elapsed().as_millis() as u64;
                self.metrics.record_request(&op, false, latency);
                Err(e)
            }
        }
    }

    fn describe(&self) -> OrganCard {
        OrganCard {
            name: "soma_assets".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            description: "Media asset pipeline: budgeted JPEG compression with EXIF carry-over, dominant color styling and batched uploads".to_string(),
            division: "media".to_string(),
            subsystem: "assets".to_string(),
            tags: vec![
                "media".to_string(),
                "image".to_string(),
                "compression".to_string(),
                "exif".to_string(),
                "upload".to_string(),
                "thumbnail".to_string(),
                "color".to_string(),
            ],
            execution_modes: vec![
                "embedded".to_string(),
                "sidecar".to_string(),
                "server".to_string(),
            ],
            author: Some("SOMA Media Team".to_string()),
            repository: None,
            functions: function_cards(),
        }
    }
}

fn function_cards() -> Vec<FunctionCard> {
    vec![
        FunctionCard {
            name: "asset.compress".to_string(),
            description: "Downscale to at most 1920px and bisect JPEG quality until the output fits the byte budget; EXIF is kept with orientation reset to 1".to_string(),
            tags: vec!["image".to_string(), "compression".to_string(), "jpeg".to_string()],
            examples: vec![
                "Shrink a 4MB phone photo to about 300KB before upload".to_string(),
                "Compress a PNG screenshot into a JPEG under 150KB".to_string(),
            ],
            idempotent: true,
            side_effects: vec!["writes image file".to_string()],
            input_schema: Some(json!({
                "type": "object",
                "properties": {
                    "input_path": { "type": "string", "description": "Path to source image" },
                    "output_path": { "type": "string", "description": "Path to write the JPEG" },
                    "target_kb": { "type": "integer", "minimum": 1, "description": "Byte budget in KiB (default: 300)" },
                    "max_dimension": { "type": "integer", "minimum": 1, "description": "Longest edge (default: 1920)" }
                },
                "required": ["input_path", "output_path"]
            })),
            output_schema: json!({
                "type": "object",
                "properties": {
                    "output_path": { "type": "string" },
                    "original_size": { "type": "integer" },
                    "size_bytes": { "type": "integer" },
                    "quality": { "type": "number" },
                    "attempts": { "type": "integer" },
                    "stop": { "type": "string", "enum": ["accepted", "converged", "attempt_cap"] },
                    "metadata_preserved": { "type": "boolean" }
                }
            }),
        },
        FunctionCard {
            name: "asset.dominant_color".to_string(),
            description: "Average color of an image (sampled every 20th pixel of a 200px preview) with derived display colors".to_string(),
            tags: vec!["image".to_string(), "color".to_string(), "style".to_string()],
            examples: vec!["Pick a card background color for a thumbnail".to_string()],
            idempotent: true,
            side_effects: vec![],
            input_schema: Some(json!({
                "type": "object",
                "properties": {
                    "input_path": { "type": "string", "description": "Path to image" }
                },
                "required": ["input_path"]
            })),
            output_schema: json!({
                "type": "object",
                "properties": {
                    "r": { "type": "integer" },
                    "g": { "type": "integer" },
                    "b": { "type": "integer" },
                    "bright": { "type": "boolean" },
                    "style": { "type": "object" }
                }
            }),
        },
        FunctionCard {
            name: "asset.upload_batch".to_string(),
            description: "Upload files into a directory in batches of 10, compressing large images first; per-file failures are reported, not fatal".to_string(),
            tags: vec!["upload".to_string(), "batch".to_string(), "compression".to_string()],
            examples: vec!["Copy a camera roll into an asset store with compression".to_string()],
            idempotent: false,
            side_effects: vec!["writes files".to_string()],
            input_schema: Some(json!({
                "type": "object",
                "properties": {
                    "files": { "type": "array", "items": { "type": "string" }, "description": "Source file paths" },
                    "dest_dir": { "type": "string", "description": "Destination directory" },
                    "compress": { "type": "boolean", "description": "Compress large images first (default: true)" }
                },
                "required": ["files", "dest_dir"]
            })),
            output_schema: json!({
                "type": "object",
                "properties": {
                    "success_count": { "type": "integer" },
                    "failed_count": { "type": "integer" },
                    "errors": { "type": "array" },
                    "outcome": { "type": "string" },
                    "summary": { "type": "string" }
                }
            }),
        },
        FunctionCard {
            name: "asset.capabilities".to_string(),
            description: "Return organ capability card with all available functions and metadata".to_string(),
            tags: vec!["metadata".to_string(), "discovery".to_string(), "mcp".to_string()],
            examples: vec!["Discover available asset operations".to_string()],
            idempotent: true,
            side_effects: vec![],
            input_schema: None,
            output_schema: json!({
                "type": "object",
                "properties": {
                    "name": { "type": "string" },
                    "version": { "type": "string" },
                    "functions": { "type": "array" }
                }
            }),
        },
    ]
}

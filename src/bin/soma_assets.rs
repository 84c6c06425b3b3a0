// soma_assets - media asset pipeline CLI and daemon
// One-shot compress/color/upload commands, or an organ served over a Unix Domain Socket

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use soma_assets::organ::{AssetOrgan, Organ, Response, Stimulus};
use soma_assets::{
    AdaptiveCompressor, BatchUploadScheduler, DirectoryUploader, DominantColorExtractor, MemoryUploadLog,
    PipelineConfig, ProgressPhase, UploadItem, UploadLogFollower,
};

/// Largest request frame accepted on the socket
const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

#[derive(Parser)]
#[command(name = "soma_assets", version, about = "SOMA Assets - media asset pipeline")]
struct Args {
    /// JSON pipeline config (defaults to $SOMA_ASSETS_CONFIG, then built-in defaults)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compress one image to a byte budget
    Compress {
        input: PathBuf,
        output: PathBuf,
        /// Target size in KiB
        #[arg(long)]
        target_kb: Option<u64>,
        /// Longest edge after downscaling
        #[arg(long)]
        max_dimension: Option<u32>,
    },
    /// Print the dominant color and derived style of an image
    Color { input: PathBuf },
    /// Upload files into a directory in batches
    Upload {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Destination directory
        #[arg(long)]
        dest: PathBuf,
        #[arg(long)]
        batch_size: Option<usize>,
        /// Upload originals without compressing
        #[arg(long)]
        no_compress: bool,
    },
    /// Serve the asset organ on a Unix socket
    Serve {
        /// Unix socket path for UDS server
        #[arg(long, default_value = "/tmp/soma_assets.sock")]
        socket_path: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info"))
        )
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => PipelineConfig::from_env().context("Failed to load config from environment")?,
    };

    match args.command {
        Command::Compress { input, output, target_kb, max_dimension } => {
            compress(config, input, output, target_kb, max_dimension).await
        }
        Command::Color { input } => color(config, input).await,
        Command::Upload { files, dest, batch_size, no_compress } => {
            upload(config, files, dest, batch_size, no_compress).await
        }
        Command::Serve { socket_path } => serve(config, socket_path).await,
    }
}

async fn compress(
    mut config: PipelineConfig,
    input: PathBuf,
    output: PathBuf,
    target_kb: Option<u64>,
    max_dimension: Option<u32>,
) -> Result<()> {
    if let Some(kb) = target_kb {
        config.compression.target_size_bytes = kb
            .checked_mul(1024)
            .with_context(|| format!("--target-kb {} is too large", kb))?;
    }
    if let Some(max) = max_dimension {
        config.compression.max_dimension = max;
    }
    config.validate()?;

    let source = tokio::fs::read(&input)
        .await
        .with_context(|| format!("Failed to read {}", input.display()))?;
    let target = config.compression.target_size_bytes;
    let compressor = AdaptiveCompressor::new(config.compression);

    let result = tokio::task::spawn_blocking(move || compressor.compress(&source, target))
        .await
        .context("Compression task panicked")??;

    tokio::fs::write(&output, &result.data)
        .await
        .with_context(|| format!("Failed to write {}", output.display()))?;

    info!(
        "{} -> {}: {} KiB -> {} KiB ({}x{}, quality {:.2}, {} attempts, {:?}{})",
        input.display(),
        output.display(),
        result.original_size / 1024,
        result.size() / 1024,
        result.width,
        result.height,
        result.quality,
        result.attempts,
        result.stop,
        if result.metadata_preserved { ", EXIF kept" } else { "" }
    );
    Ok(())
}

async fn color(config: PipelineConfig, input: PathBuf) -> Result<()> {
    let bytes = tokio::fs::read(&input)
        .await
        .with_context(|| format!("Failed to read {}", input.display()))?;

    let threshold = config.color.brightness_threshold;
    let color = DominantColorExtractor::new(config.color).extract_bytes(&bytes).await;
    let out = serde_json::json!({
        "r": color.r,
        "g": color.g,
        "b": color.b,
        "style": color.style(threshold),
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

async fn upload(
    mut config: PipelineConfig,
    files: Vec<PathBuf>,
    dest: PathBuf,
    batch_size: Option<usize>,
    no_compress: bool,
) -> Result<()> {
    if let Some(size) = batch_size {
        config.upload.batch_size = size;
    }
    if no_compress {
        config.compression.enabled = false;
    }
    config.validate()?;

    let mut items = Vec::with_capacity(files.len());
    for path in &files {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        items.push(UploadItem::from_bytes(name, bytes));
    }

    let session = format!("cli-{}", std::process::id());
    let log = Arc::new(MemoryUploadLog::new());
    let uploader = DirectoryUploader::new(&dest).with_log(log.clone(), session.clone());

    let (progress_tx, mut progress_rx) = tokio::sync::mpsc::unbounded_channel();
    let scheduler = BatchUploadScheduler::new(
        AdaptiveCompressor::new(config.compression),
        Arc::new(uploader),
        config.upload,
    )
    .with_progress(progress_tx);

    let progress = tokio::spawn(async move {
        while let Some(event) = progress_rx.recv().await {
            let verb = match event.phase {
                ProgressPhase::Compressing => "Compressing",
                ProgressPhase::Uploading => "Uploading",
            };
            info!("{} {} of {} ({} active)", verb, event.current, event.total, event.active);
        }
    });

    let (mut log_rx, follower) = UploadLogFollower::new(log, session)
        .with_interval(Duration::from_millis(200))
        .follow();
    let narration = tokio::spawn(async move {
        while let Some(line) = log_rx.recv().await {
            info!("  {}", line);
        }
    });

    let report = scheduler.submit(items).await;
    drop(scheduler);

    follower.stop().await;
    if let Err(e) = progress.await {
        warn!("Progress reporter failed: {}", e);
    }
    if let Err(e) = narration.await {
        warn!("Log narration failed: {}", e);
    }

    println!("{}", report.summary());
    if report.failed_count > 0 {
        bail!("{} of {} file(s) failed", report.failed_count, report.total);
    }
    Ok(())
}

async fn serve(config: PipelineConfig, socket_path: String) -> Result<()> {
    info!("Starting SOMA Assets Daemon");
    info!("   Socket: {}", socket_path);

    let start_time = std::time::Instant::now();
    let organ = Arc::new(AssetOrgan::with_config(config));

    // Remove old socket if exists
    let path = PathBuf::from(&socket_path);
    if path.exists() {
        std::fs::remove_file(&path).context("Failed to remove old socket")?;
    }

    let listener = UnixListener::bind(&path).context("Failed to bind Unix socket")?;

    let card = organ.describe();
    info!("   {} v{} listening", card.name, card.version);
    for func in &card.functions {
        info!("      • {} - {}", func.name, func.description);
    }

    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let organ = Arc::clone(&organ);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, organ, start_time).await {
                        error!("Connection error: {}", e);
                    }
                });
            }
            Err(e) => {
                error!("Accept error: {}", e);
            }
        }
    }
}

/// Handle a single UDS connection (4-byte big-endian length + JSON body, both directions)
async fn handle_connection(
    mut stream: UnixStream,
    organ: Arc<AssetOrgan>,
    start_time: std::time::Instant,
) -> Result<()> {
    let mut buffer = vec![0u8; 65536];

    loop {
        let mut len_buf = [0u8; 4];
        match stream.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!("Client disconnected");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_FRAME_BYTES {
            bail!("Request frame of {} bytes exceeds {} byte limit", len, MAX_FRAME_BYTES);
        }
        if len > buffer.len() {
            buffer.resize(len, 0);
        }

        stream.read_exact(&mut buffer[..len]).await?;

        let stimulus: Stimulus = serde_json::from_slice(&buffer[..len])
            .context("Failed to parse stimulus")?;

        debug!("Received: op={}", stimulus.op);

        let response = if stimulus.op == "health" || stimulus.op == "health.check" {
            Response {
                ok: true,
                output: serde_json::json!({
                    "status": "healthy",
                    "organ": "soma_assets",
                    "version": env!("CARGO_PKG_VERSION"),
                    "uptime_ms": start_time.elapsed().as_millis() as u64,
                }),
                latency_ms: 0,
                cost: None,
            }
        } else {
            match organ.stimulate(stimulus).await {
                Ok(resp) => resp,
                Err(e) => {
                    warn!("Stimulate error: {}", e);
                    Response {
                        ok: false,
                        output: serde_json::json!({ "error": e.to_string() }),
                        latency_ms: 0,
                        cost: None,
                    }
                }
            }
        };

        let response_bytes = serde_json::to_vec(&response)
            .context("Failed to serialize response")?;

        let len_bytes = (response_bytes.len() as u32).to_be_bytes();
        stream.write_all(&len_bytes).await?;
        stream.write_all(&response_bytes).await?;
        stream.flush().await?;

        debug!("Sent: ok={}, latency={}ms", response.ok, response.latency_ms);
    }
}

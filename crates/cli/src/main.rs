use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use face_analyser_core::detection::domain::face_detector::FaceDetector;
use face_analyser_core::detection::infrastructure::onnx_blazeface_detector::OnnxBlazefaceDetector;
use face_analyser_core::pipeline::admission::Admission;
use face_analyser_core::pipeline::face_result::{FaceCrop, FaceResultConsumer};
use face_analyser_core::pipeline::frame_analyser::{AnalyserComponents, FrameAnalyser};
use face_analyser_core::pipeline::gallery_analyser::GalleryAnalyser;
use face_analyser_core::pipeline::infrastructure::saving_result_consumer::SavingResultConsumer;
use face_analyser_core::pipeline::main_context::MainLoop;
use face_analyser_core::pipeline::pipeline_logger::StdoutPipelineLogger;
use face_analyser_core::recognition::domain::face_embedder::FaceEmbedder;
use face_analyser_core::recognition::domain::identity_gallery::IdentityGallery;
use face_analyser_core::recognition::infrastructure::onnx_face_embedder::{
    OnnxFaceEmbedder, FACENET_EMBEDDING_DIM,
};
use face_analyser_core::recognition::infrastructure::onnx_mask_classifier::OnnxMaskClassifier;
use face_analyser_core::shared::config::{AnalyserConfig, LensFacing, Resolution};
use face_analyser_core::shared::constants::{
    BLAZEFACE_MODEL_NAME, FACENET_MODEL_NAME, IMAGE_EXTENSIONS, MASK_MODEL_NAME,
};
use face_analyser_core::shared::model_resolver;
use face_analyser_core::video::domain::frame_source::FrameSource;
use face_analyser_core::video::infrastructure::ffmpeg_frame_source::FfmpegFrameSource;
use face_analyser_core::video::infrastructure::image_file_reader::ImageFileReader;
use face_analyser_core::video::infrastructure::image_file_writer::ImageFileWriter;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Real-time face detection, recognition and mask classification.
#[derive(Parser)]
#[command(name = "face-analyser")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    options: Options,
}

#[derive(Subcommand)]
enum Command {
    /// Analyse a video file as a live camera feed (frames arriving while busy are dropped).
    Stream {
        video: PathBuf,

        /// Decode as fast as possible instead of at the video's frame rate.
        #[arg(long)]
        unpaced: bool,
    },
    /// Analyse a single still image.
    Image { file: PathBuf },
}

#[derive(Args)]
struct Options {
    /// JSON config file; flags below override its values.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Skip mask classification.
    #[arg(long, global = true)]
    no_mask: bool,

    /// Camera the frames come from: front or back.
    #[arg(long, global = true)]
    lens_facing: Option<LensFacing>,

    /// Analysis resolution, e.g. 480x640.
    #[arg(long, global = true)]
    target_resolution: Option<Resolution>,

    /// Save every face crop to this directory.
    #[arg(long, global = true)]
    output_dir: Option<PathBuf>,

    /// JSON file mapping names to reference embeddings.
    #[arg(long, global = true)]
    identities: Option<PathBuf>,

    /// Stall watchdog in milliseconds (0 disables).
    #[arg(long, global = true)]
    watchdog_ms: Option<u64>,

    /// Face detection confidence threshold (0.0-1.0).
    #[arg(long, global = true)]
    confidence: Option<f64>,

    /// Directory searched for model files before downloading.
    #[arg(long, global = true)]
    models_dir: Option<PathBuf>,

    /// Base URL to download missing model files from (`<url>/<model file>`).
    #[arg(long, global = true)]
    models_url: Option<String>,
}

fn main() {
    env_logger::init();

    if let Err(e) = run() {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = build_config(&cli.options)?;
    let input = match &cli.command {
        Command::Stream { video, .. } => video,
        Command::Image { file } => file,
    };
    validate(input, &cli.command)?;

    let (components, saved) = build_components(&cli.options, &config)?;
    let main_loop = MainLoop::new();
    let analyser = FrameAnalyser::new(components, &config, main_loop.context())?;

    let result = match &cli.command {
        Command::Stream { video, unpaced } => {
            run_stream(video, *unpaced, &config, &analyser, &main_loop)
        }
        Command::Image { file } => run_image(file, &analyser, &main_loop),
    };

    report_overlay(&analyser);
    analyser.shutdown();
    if let (Some(dir), Some(saved)) = (&cli.options.output_dir, saved) {
        log::info!(
            "Saved {} face crops to {}",
            saved.load(Ordering::Relaxed),
            dir.display()
        );
    }
    result
}

fn run_stream(
    video: &Path,
    unpaced: bool,
    config: &AnalyserConfig,
    analyser: &FrameAnalyser,
    main_loop: &MainLoop,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut source = FfmpegFrameSource::new(Some(config.target_resolution));
    if unpaced {
        source = source.unpaced();
    }
    let info = source.open(video)?;
    log::info!(
        "Streaming {} ({}x{} @ {:.1} fps, {} frames, rotation {}°)",
        video.display(),
        info.width,
        info.height,
        info.fps,
        info.total_frames,
        info.rotation.degrees()
    );

    // The feeder plays the camera; this thread is the main context.
    let (offered, admitted) = std::thread::scope(|s| {
        let source = &mut source;
        let feeder = s.spawn(move || feed(source, analyser, info.total_frames));
        while !main_loop.run_until(|| feeder.is_finished() && !analyser.is_busy(), POLL_INTERVAL)
        {}
        feeder
            .join()
            .unwrap_or_else(|_| Err("frame feeder panicked".to_string()))
    })?;
    eprintln!();

    let leaked = source.outstanding_leases();
    if leaked > 0 {
        log::warn!("{leaked} frame lease(s) still outstanding after analysis");
    }
    source.close();

    log::info!(
        "{admitted} of {offered} frames analysed, {} dropped while busy",
        offered - admitted
    );
    Ok(())
}

fn feed(
    source: &mut FfmpegFrameSource,
    analyser: &FrameAnalyser,
    total: usize,
) -> Result<(usize, usize), String> {
    let mut offered = 0;
    let mut admitted = 0;
    for frame in source.frames() {
        let frame = frame.map_err(|e| e.to_string())?;
        offered += 1;
        if analyser.submit(frame).is_admitted() {
            admitted += 1;
        }
        eprint!("\rFrame {offered}/{total} ({admitted} analysed)");
    }
    Ok((offered, admitted))
}

fn run_image(
    file: &Path,
    analyser: &FrameAnalyser,
    main_loop: &MainLoop,
) -> Result<(), Box<dyn std::error::Error>> {
    let gallery = GalleryAnalyser::new(analyser, Box::new(ImageFileReader::new()));
    if gallery.process_image(file)? == Admission::Rejected {
        return Err("analyser busy, image dropped".into());
    }
    while !main_loop.run_until(|| !analyser.is_busy(), POLL_INTERVAL) {}
    log::info!("Analysed {}", file.display());
    Ok(())
}

fn report_overlay(analyser: &FrameAnalyser) {
    let overlay = analyser.overlay();
    let overlay = overlay.lock().unwrap_or_else(PoisonError::into_inner);
    let Some((width, height)) = overlay.frame_size() else {
        log::info!("No frame analysed");
        return;
    };
    let boxes = overlay.display_boxes(width, height);
    log::info!("Last analysed frame: {} face(s)", boxes.len());
    for b in boxes {
        let label = if b.label.is_empty() { "-" } else { b.label.as_str() };
        log::info!(
            "  [{:.0}, {:.0}, {:.0}x{:.0}] {label}",
            b.x,
            b.y,
            b.width,
            b.height
        );
    }
}

fn build_config(options: &Options) -> Result<AnalyserConfig, Box<dyn std::error::Error>> {
    let mut config = match &options.config {
        Some(path) => AnalyserConfig::load(path)?,
        None => AnalyserConfig::default(),
    };
    if options.no_mask {
        config.mask_detection_enabled = false;
    }
    if let Some(lens_facing) = options.lens_facing {
        config.lens_facing = lens_facing;
    }
    if let Some(resolution) = options.target_resolution {
        config.target_resolution = resolution;
    }
    if let Some(ms) = options.watchdog_ms {
        config.watchdog_timeout_ms = (ms > 0).then_some(ms);
    }
    if let Some(confidence) = options.confidence {
        config.detection_confidence = confidence;
    }
    config.validate()?;
    Ok(config)
}

type SavedCounter = Option<Arc<AtomicUsize>>;

fn build_components(
    options: &Options,
    config: &AnalyserConfig,
) -> Result<(AnalyserComponents, SavedCounter), Box<dyn std::error::Error>> {
    let detector_path = resolve_model(BLAZEFACE_MODEL_NAME, options)?;
    let detector: Box<dyn FaceDetector> = Box::new(OnnxBlazefaceDetector::new(
        &detector_path,
        config.detection_confidence,
    )?);

    let embedder_path = resolve_model(FACENET_MODEL_NAME, options)?;
    let embedder: Arc<dyn FaceEmbedder> = Arc::new(OnnxFaceEmbedder::new(
        &embedder_path,
        FACENET_EMBEDDING_DIM,
    )?);

    let mut saved = None;
    let consumer: Box<dyn FaceResultConsumer> = match &options.output_dir {
        Some(dir) => {
            let consumer = SavingResultConsumer::new(dir, Box::new(ImageFileWriter::new()));
            saved = Some(consumer.saved_counter());
            Box::new(consumer)
        }
        None => Box::new(|crops: Vec<FaceCrop>| {
            log::debug!("{} face(s) delivered", crops.len());
        }),
    };

    let mut components = AnalyserComponents::new(detector, embedder, consumer)
        .with_logger(Box::new(StdoutPipelineLogger::default()));

    if config.mask_detection_enabled {
        let mask_path = resolve_model(MASK_MODEL_NAME, options)?;
        components = components.with_mask_classifier(Arc::new(OnnxMaskClassifier::new(&mask_path)?));
    }

    if let Some(path) = &options.identities {
        let gallery = IdentityGallery::load(path, config.identity_threshold)?;
        if gallery.dimension().is_some_and(|d| d != FACENET_EMBEDDING_DIM) {
            return Err(format!(
                "Identity embeddings in {} must have {FACENET_EMBEDDING_DIM} values",
                path.display()
            )
            .into());
        }
        components = components.with_gallery(gallery);
    }

    Ok((components, saved))
}

fn resolve_model(name: &str, options: &Options) -> Result<PathBuf, Box<dyn std::error::Error>> {
    log::info!("Resolving model: {name}");
    let url = options
        .models_url
        .as_deref()
        .map(|base| format!("{}/{name}", base.trim_end_matches('/')));
    let path = model_resolver::resolve(
        name,
        url.as_deref(),
        options.models_dir.as_deref(),
        Some(Box::new(download_progress)),
    )?;
    Ok(path)
}

fn validate(input: &Path, command: &Command) -> Result<(), Box<dyn std::error::Error>> {
    if !input.exists() {
        return Err(format!("Input file not found: {}", input.display()).into());
    }
    if let Command::Image { file } = command {
        if !is_image(file) {
            return Err(format!(
                "Unsupported image type: {} (expected one of {})",
                file.display(),
                IMAGE_EXTENSIONS.join(", ")
            )
            .into());
        }
    }
    Ok(())
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

fn download_progress(downloaded: u64, total: u64) {
    if total > 0 {
        let pct = (downloaded as f64 / total as f64 * 100.0) as u32;
        eprint!("\rDownloading model... {pct}%");
    } else {
        eprint!("\rDownloading model... {downloaded} bytes");
    }
}

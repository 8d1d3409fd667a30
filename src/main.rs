use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facematch::session::{self, FrameSource, RecognitionSession, StillImage};
use facematch::{config, query, Camera, FaceStore, Pipeline};
use log::info;

/// Detector score at which registration stops looking for a better frame.
const GOOD_FACE_SCORE: f32 = 0.8;

#[derive(Parser)]
#[command(name = "facematch")]
#[command(version, about = "Register faces and recognize them from a camera")]
struct Cli {
    /// Config file (defaults to the installed location)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a new person from the camera or an image file
    Register {
        /// Display name of the person
        #[arg(short, long)]
        name: String,
        /// Read the face from this image instead of the camera
        #[arg(short, long)]
        image: Option<PathBuf>,
    },
    /// Label every face seen by the camera or in an image file
    Recognize {
        /// Read a single frame from this image instead of the camera
        #[arg(short, long)]
        image: Option<PathBuf>,
        /// Frames to scan before giving up (defaults to config)
        #[arg(short, long)]
        frames: Option<u32>,
    },
    /// Match a descriptor (JSON array of numbers, `-` for stdin) against known faces
    Match {
        /// File holding the query descriptor
        #[arg(short, long)]
        query: PathBuf,
        /// Override the configured distance threshold
        #[arg(short, long)]
        threshold: Option<f32>,
    },
    /// List known faces
    List,
    /// Delete a known face by id
    Delete {
        /// Id printed by `list`
        id: String,
    },
    /// Open config file in editor
    Config,
}

fn main() -> Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .format_target(false)
        .format_timestamp(None)
        .parse_default_env()
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(cli.config.as_deref())?;
    let store = FaceStore::open(&cfg.store_dir);

    match cli.command {
        Commands::Register { name, image } => register(&cfg, &store, &name, image.as_deref()),
        Commands::Recognize { image, frames } => recognize(&cfg, &store, image.as_deref(), frames),
        Commands::Match { query, threshold } => match_query(&cfg, &store, &query, threshold),
        Commands::List => list(&store),
        Commands::Delete { id } => delete(&store, &id),
        Commands::Config => open_config(cli.config.as_deref()),
    }
}

fn pipeline(cfg: &config::Config) -> Result<Pipeline> {
    Ok(Pipeline::from_paths(&cfg.detector_model, &cfg.encoder_model)
        .context("Failed to initialize face recognition pipeline")?
        .with_thresholds(cfg.detection_score, cfg.nms_iou))
}

fn still(path: &Path) -> Result<StillImage> {
    let img = image::open(path).with_context(|| format!("reading image {}", path.display()))?;
    Ok(StillImage(img.to_rgb8()))
}

fn register(
    cfg: &config::Config,
    store: &FaceStore,
    name: &str,
    image: Option<&Path>,
) -> Result<()> {
    info!("Registering: {}", name);
    let mut pipeline = pipeline(cfg)?;

    let captured = match image {
        Some(path) => capture(&mut still(path)?, &mut pipeline, cfg.max_frames)?,
        None => {
            info!("Opening camera: {}", cfg.camera);
            let mut camera = Camera::open(&cfg.camera).context("Failed to open camera")?;
            let (w, h) = camera.dimensions();
            info!("Camera opened at {}x{}. Capturing frames...", w, h);
            capture(&mut camera, &mut pipeline, cfg.max_frames)?
        }
    };

    let Some((frame, face)) = captured else {
        anyhow::bail!("No face detected. Make sure your face is visible and well-lit.");
    };
    info!("Best face: score {:.3}", face.detection.score);

    let thumbnail = session::thumbnail_png(&frame, &face.detection)?;
    let record = store
        .register(name, face.descriptor, thumbnail)
        .context("Failed to register face")?;

    info!("✓ Registered {} (id {})", record.name, record.id);
    Ok(())
}

fn capture<S: FrameSource>(
    source: &mut S,
    pipeline: &mut Pipeline,
    max_frames: u32,
) -> Result<Option<(image::RgbImage, facematch::FaceSample)>> {
    session::capture_best_face(source, pipeline, max_frames, GOOD_FACE_SCORE)
}

fn recognize(
    cfg: &config::Config,
    store: &FaceStore,
    image: Option<&Path>,
    frames: Option<u32>,
) -> Result<()> {
    let known = store.list().context("Failed to load known faces")?;
    if known.is_empty() {
        log::warn!("No faces registered yet. Every face will be Unknown.");
    } else {
        info!("Known faces: {}", known.len());
    }

    let mut session = RecognitionSession::new(pipeline(cfg)?, known, cfg.threshold);
    let max_frames = frames.unwrap_or(cfg.max_frames);

    let found = match image {
        Some(path) => session.run(&mut still(path)?, max_frames)?,
        None => {
            info!("Opening camera: {}", cfg.camera);
            let mut camera = Camera::open(&cfg.camera).context("Failed to open camera")?;
            let (w, h) = camera.dimensions();
            info!("Camera opened at {}x{}. Scanning up to {} frames...", w, h, max_frames);
            session.run(&mut camera, max_frames)?
        }
    };

    match found {
        Some(faces) => {
            for face in faces.iter().filter(|f| f.result.matched) {
                info!("✓ Recognized {}", face.label());
            }
            Ok(())
        }
        None => anyhow::bail!("No known face recognized"),
    }
}

fn match_query(
    cfg: &config::Config,
    store: &FaceStore,
    query_path: &Path,
    threshold: Option<f32>,
) -> Result<()> {
    let descriptor = query::read_descriptor(query_path, std::io::stdin())?;
    let threshold = threshold.unwrap_or(cfg.threshold);

    let result = query::match_stored(store, &descriptor, threshold)?;
    info!("{} (distance {:.3}, threshold {:.3})", result.label(), result.distance, threshold);
    println!("{}", query::render(&result)?);
    Ok(())
}

fn list(store: &FaceStore) -> Result<()> {
    let records = store.list().context("Failed to load known faces")?;
    if records.is_empty() {
        info!("No faces registered yet.");
        return Ok(());
    }
    for r in &records {
        println!(
            "{}\t{}\tadded {}\t{} dims",
            r.id,
            r.name,
            r.created_at,
            r.descriptor.len()
        );
    }
    info!("{} face(s) in {}", records.len(), store.dir().display());
    Ok(())
}

fn delete(store: &FaceStore, id: &str) -> Result<()> {
    if !store.delete(id).context("Failed to delete face")? {
        anyhow::bail!("No face with id {}", id);
    }
    info!("✓ Deleted {}", id);
    Ok(())
}

fn open_config(path: Option<&Path>) -> Result<()> {
    let config_path = path.unwrap_or(&config::CONFIG_PATH);
    if !config_path.exists() {
        config::save_config(&config::Config::default(), Some(config_path))
            .context("Failed to write default config")?;
    }
    let editor = env::var("EDITOR").unwrap_or_else(|_| "vi".to_string());

    info!("Opening config file: {}", config_path.display());

    let status = std::process::Command::new(editor)
        .arg(config_path)
        .status()
        .context("Failed to open editor")?;

    if !status.success() {
        anyhow::bail!("Editor exited with non-zero status");
    }

    Ok(())
}

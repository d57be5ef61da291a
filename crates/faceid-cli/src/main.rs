use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use faceid_core::{
    DetectionOrchestrator, Embedding, EnrollmentAggregator, EnrollmentPolicy, Event, Frame,
    Gallery, MatchDecision, MatchEngine, MatchError, Notifier, TracingNotifier,
};
use faceid_store::{
    FileBackend, GalleryDocument, GalleryKey, GalleryStore, Persistence, SqliteBackend,
};
use serde::Deserialize;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod sidecar;

use config::{Backend, Config};
use engine::EngineHandle;
use sidecar::SidecarEmbedder;

#[derive(Parser)]
#[command(
    name = "faceid",
    version,
    about = "Enroll faces and recognize them against an encrypted identity gallery"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a new gallery key
    Keygen {
        /// Where to write the key (default: configured key path)
        #[arg(long)]
        out: Option<PathBuf>,
        /// Overwrite an existing key file
        #[arg(long)]
        force: bool,
    },
    /// Enroll an identity from a burst of images
    Enroll {
        /// Display name
        #[arg(short, long)]
        name: String,
        /// Explicit identity id (default: random UUID)
        #[arg(long)]
        id: Option<String>,
        /// Re-enroll the existing identity with this id
        #[arg(long, requires = "id")]
        replace: bool,
        /// Image files, one per captured frame
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Recognize every face in a batch of images
    Recognize {
        #[arg(required = true)]
        images: Vec<PathBuf>,
        /// Print one JSON object per face
        #[arg(long)]
        json: bool,
    },
    /// Match a raw embedding (JSON array) against the gallery
    Match {
        /// JSON file holding the embedding
        #[arg(long)]
        embedding: PathBuf,
        /// Scene variance of the frame the embedding came from
        #[arg(long)]
        scene_variance: Option<f32>,
        /// Print every identity ranked by distance
        #[arg(long)]
        rank: bool,
    },
    /// List enrolled identities
    List,
    /// Remove an identity by id
    Remove { id: String },
    /// Show gallery statistics
    Stats,
    /// Write the gallery as plaintext JSON (fixtures only)
    Export {
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Import identities from a plaintext JSON export
    Import { path: PathBuf },
    /// Write an encrypted backup of the gallery
    Backup {
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;
    tracing::debug!(
        gallery = %config.gallery_path.display(),
        backend = ?config.backend,
        "configuration loaded"
    );

    match cli.command {
        Commands::Keygen { out, force } => {
            let path = out.unwrap_or_else(|| config.key_path.clone());
            if path.exists() && !force {
                bail!("{} already exists (use --force to overwrite)", path.display());
            }
            GalleryKey::generate()
                .save(&path)
                .with_context(|| format!("writing key to {}", path.display()))?;
            println!("wrote new gallery key to {}", path.display());
        }
        Commands::Enroll {
            name,
            id,
            replace,
            images,
        } => {
            let store = open_store(&config)?;
            let engine = start_engine(&config)?;
            enroll(&config, &store, &engine, name, id, replace, images).await?;
        }
        Commands::Recognize { images, json } => {
            let store = open_store(&config)?;
            let engine = start_engine(&config)?;
            let notifier: Arc<dyn Notifier> = Arc::new(TracingNotifier);
            let matcher = MatchEngine::new(config.matcher.clone());
            let summary = recognize(&store, &engine, &matcher, notifier.as_ref(), &images, json).await;
            println!("{summary}");
        }
        Commands::Match {
            embedding,
            scene_variance,
            rank,
        } => {
            let store = open_store(&config)?;
            let query = read_embedding(&embedding)?;
            let matcher = MatchEngine::new(config.matcher.clone());
            let gallery = store.snapshot();
            if rank {
                let candidates = matcher.rank(&query, &gallery, scene_variance)?;
                println!("{}", serde_json::to_string_pretty(&candidates)?);
            } else {
                let decision = decide(&matcher, &query, &gallery, scene_variance)?;
                println!("{}", serde_json::to_string_pretty(&decision)?);
            }
        }
        Commands::List => {
            let store = open_store(&config)?;
            let gallery = store.snapshot();
            if gallery.is_empty() {
                println!("No identities enrolled");
            }
            for identity in gallery.iter() {
                println!(
                    "{}  {:<24}  quality {:.2}  enrolled {}",
                    identity.id,
                    identity.display_name,
                    identity.quality_score,
                    identity.created_at.format("%Y-%m-%d %H:%M")
                );
            }
            for identity in store.quarantined() {
                println!("{}  {:<24}  [quarantined]", identity.id, identity.display_name);
            }
        }
        Commands::Remove { id } => {
            let store = open_store(&config)?;
            if !store.remove(&id)? {
                bail!("no identity with id {id}");
            }
            println!("removed {id}");
        }
        Commands::Stats => {
            let store = open_store(&config)?;
            println!("{}", serde_json::to_string_pretty(&store.stats())?);
        }
        Commands::Export { out } => {
            let store = open_store(&config)?;
            let json = store.export()?.to_json_pretty()?;
            tracing::warn!("exporting gallery in plaintext");
            match out {
                Some(path) => std::fs::write(&path, json)
                    .with_context(|| format!("writing {}", path.display()))?,
                None => {
                    let mut stdout = std::io::stdout().lock();
                    stdout.write_all(json.as_bytes())?;
                    stdout.write_all(b"\n")?;
                }
            }
        }
        Commands::Import { path } => {
            let store = open_store(&config)?;
            let bytes =
                std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
            let doc = GalleryDocument::from_json(&bytes)
                .with_context(|| format!("parsing {}", path.display()))?;
            let report = store.import(doc)?;
            for violation in &report.rejected {
                eprintln!(
                    "skipped {} ({}): {}",
                    violation.identity_id, violation.display_name, violation.reason
                );
            }
            println!(
                "imported {} identities, rejected {}",
                report.imported,
                report.rejected.len()
            );
        }
        Commands::Backup { dir } => {
            let store = open_store(&config)?;
            let dir = dir.unwrap_or_else(|| config.backup_dir());
            let path = store.backup(&dir)?;
            println!("backup written to {}", path.display());
        }
    }

    Ok(())
}

fn gallery_key(config: &Config) -> Result<GalleryKey> {
    if let Some(hex) = &config.key_hex {
        return GalleryKey::from_hex(hex).context("FACEID_KEY is not a valid key");
    }
    GalleryKey::load(&config.key_path).with_context(|| {
        format!(
            "loading gallery key from {} (run `faceid keygen` first)",
            config.key_path.display()
        )
    })
}

fn open_store(config: &Config) -> Result<GalleryStore> {
    let key = gallery_key(config)?;
    let backend: Box<dyn Persistence> = match config.backend {
        Backend::File => Box::new(FileBackend::new(config.gallery_path.clone())),
        Backend::Sqlite => Box::new(
            SqliteBackend::open(&config.gallery_path)
                .with_context(|| format!("opening {}", config.gallery_path.display()))?,
        ),
    };

    let (store, report) = GalleryStore::open(backend, key, Arc::new(TracingNotifier))
        .with_context(|| format!("loading gallery {}", config.gallery_path.display()))?;

    for violation in &report.violations {
        eprintln!(
            "warning: identity {} ({}) quarantined: {}",
            violation.identity_id, violation.display_name, violation.reason
        );
    }
    Ok(store)
}

fn start_engine(config: &Config) -> Result<EngineHandle> {
    let orchestrator = DetectionOrchestrator::primary_with_fallback(
        Box::new(SidecarEmbedder::primary()),
        Box::new(SidecarEmbedder::fallback()),
        config.detection.clone(),
    );
    Ok(engine::spawn_engine(orchestrator)?)
}

fn load_frame(path: &Path) -> Result<Frame> {
    let image = image::open(path).with_context(|| format!("decoding {}", path.display()))?;
    Ok(Frame::from_image(&image).with_source(path))
}

async fn enroll(
    config: &Config,
    store: &GalleryStore,
    engine: &EngineHandle,
    name: String,
    id: Option<String>,
    replace: bool,
    mut images: Vec<PathBuf>,
) -> Result<()> {
    if images.len() > config.enrollment.requested_frames {
        tracing::info!(
            supplied = images.len(),
            used = config.enrollment.requested_frames,
            "more images than FACEID_ENROLL_FRAMES; extra images ignored"
        );
        images.truncate(config.enrollment.requested_frames);
    }

    // Every image is one requested capture; unreadable ones count as misses.
    let policy = EnrollmentPolicy {
        requested_frames: images.len(),
        ..config.enrollment.clone()
    };

    let mut frames = Vec::with_capacity(images.len());
    for path in &images {
        match load_frame(path) {
            Ok(frame) => frames.push(frame),
            Err(e) => tracing::warn!(error = %format!("{e:#}"), "enroll: skipping frame"),
        }
    }

    let capture = engine.enroll(frames).await?;
    let enrollment = EnrollmentAggregator::new(policy)
        .aggregate(&capture.samples)
        .with_context(|| format!("enrollment of {name:?} rejected"))?;

    let identity = match (id, replace) {
        (Some(id), true) => store.reenroll(&id, enrollment)?,
        (Some(id), false) => store.enroll_with_id(id, name, enrollment)?,
        (None, _) => store.enroll(name, enrollment)?,
    };

    println!(
        "enrolled {} ({}) quality {:.2} from {}/{} frames",
        identity.display_name,
        identity.id,
        identity.quality_score,
        capture.samples.len(),
        images.len()
    );
    Ok(())
}

/// Counts for one `recognize` batch.
#[derive(Debug, Default, Clone, PartialEq)]
struct BatchSummary {
    processed: usize,
    matched: usize,
    unknown: usize,
    no_face: usize,
    errors: usize,
}

impl fmt::Display for BatchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "processed {} frames: {} matched, {} unknown, {} without a face, {} errors",
            self.processed, self.matched, self.unknown, self.no_face, self.errors
        )
    }
}

async fn recognize(
    store: &GalleryStore,
    engine: &EngineHandle,
    matcher: &MatchEngine,
    notifier: &dyn Notifier,
    images: &[PathBuf],
    json: bool,
) -> BatchSummary {
    let mut summary = BatchSummary::default();

    for path in images {
        summary.processed += 1;

        let frame = match load_frame(path) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %format!("{e:#}"), "recognize: skipping frame");
                summary.errors += 1;
                continue;
            }
        };

        let found = match engine.detect(frame).await {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(image = %path.display(), error = %e, "recognize: detection failed");
                summary.errors += 1;
                continue;
            }
        };

        if found.detections.is_empty() {
            summary.no_face += 1;
            if !json {
                println!("{}: no face", path.display());
            }
            continue;
        }

        // One snapshot per frame; concurrent enrollments land on the next one.
        let gallery = store.snapshot();
        for (face, detection) in found.detections.iter().enumerate() {
            let decision = match decide(
                matcher,
                &detection.embedding,
                &gallery,
                Some(found.scene_variance),
            ) {
                Ok(decision) => decision,
                Err(e) => {
                    tracing::warn!(image = %path.display(), face, error = %e, "recognize: match failed");
                    summary.errors += 1;
                    continue;
                }
            };

            if decision.is_match() {
                summary.matched += 1;
            } else {
                summary.unknown += 1;
                notifier.notify(&Event::unknown_detected(decision.identity_id.clone()));
            }

            if json {
                let row = serde_json::json!({
                    "image": path,
                    "face": face,
                    "detectorSource": detection.detector_source,
                    "detectorConfidence": detection.detector_confidence,
                    "sceneVariance": found.scene_variance,
                    "decision": decision,
                });
                println!("{row}");
            } else {
                println!("{}", describe(path, face, &decision));
            }
        }
    }

    summary
}

/// Match at the base tolerance, retrying at the relaxed tolerance when the
/// first pass found a candidate but did not accept it.
fn decide(
    matcher: &MatchEngine,
    query: &Embedding,
    gallery: &Gallery,
    scene_variance: Option<f32>,
) -> Result<MatchDecision, MatchError> {
    let decision = matcher.match_query(query, gallery, scene_variance)?;
    if decision.is_match() || decision.identity_id.is_none() {
        return Ok(decision);
    }
    let relaxed = matcher.rematch_relaxed(query, gallery, scene_variance)?;
    if relaxed.is_match() {
        tracing::debug!(
            identity = relaxed.identity_id.as_deref().unwrap_or("-"),
            confidence = relaxed.confidence,
            "accepted on relaxed re-query"
        );
        return Ok(relaxed);
    }
    Ok(decision)
}

fn describe(path: &Path, face: usize, decision: &MatchDecision) -> String {
    let name = decision.display_name.as_deref().unwrap_or("-");
    if decision.is_match() {
        format!(
            "{} [face {face}]: {name} ({}) distance {:.3} cosine {:.3} confidence {:.2}",
            path.display(),
            decision.identity_id.as_deref().unwrap_or("-"),
            decision.distance,
            decision.cosine_similarity,
            decision.confidence
        )
    } else if decision.identity_id.is_some() {
        format!(
            "{} [face {face}]: unknown (closest {name}, distance {:.3}, confidence {:.2})",
            path.display(),
            decision.distance,
            decision.confidence
        )
    } else {
        format!("{} [face {face}]: unknown (gallery empty)", path.display())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum EmbeddingInput {
    Values(Vec<f32>),
    Full(Embedding),
}

fn read_embedding(path: &Path) -> Result<Embedding> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let input: EmbeddingInput = serde_json::from_slice(&bytes)
        .with_context(|| format!("{} is not an embedding", path.display()))?;
    let embedding = match input {
        EmbeddingInput::Values(values) => Embedding::new(values),
        EmbeddingInput::Full(embedding) => embedding,
    };
    if !embedding.is_finite() || embedding.dimension() == 0 {
        bail!("{} holds an empty or non-finite embedding", path.display());
    }
    Ok(embedding)
}

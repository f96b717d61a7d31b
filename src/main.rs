use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use broxeen_scene::config::{self, AppConfig};
use broxeen_scene::logging::init_logging;
use broxeen_scene::narration::{LlmNarrator, NarrationMode, SceneNarrationCache};
use broxeen_scene::semantic::{SemanticFilter, SemanticMatcher};
use broxeen_scene::store::{open_store, SceneStore};
use broxeen_scene::{
    CategoryFilter, DetectionPipeline, EntityTracker, FrameReport, HttpEmbedder, NarrationReport, PacedFrames,
    ReplayDetector,
};

#[derive(Parser)]
#[command(name = "broxeen-scene", version)]
#[command(about = "Detection tracking and LLM scene narration over a detector stream")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the pipeline over recorded detections (JSON Lines)
    Run {
        #[arg(long)] replay:    PathBuf,
        #[arg(long, default_value = "5")] fps: f64,
        /// Still JPEG attached to every frame (needed for prompt filtering and narration images)
        #[arg(long)] image:     Option<PathBuf>,
        /// Keep detections matching this text prompt
        #[arg(long)] prompt:    Option<String>,
        /// Narrate scenes with the configured LLM
        #[arg(long)] narrate:   bool,
        /// Pace frames at --fps instead of replaying as fast as possible
        #[arg(long)] realtime:  bool,
        #[arg(long)] camera_id: Option<String>,
    },

    /// Show stored scene narrations
    Scenes {
        #[arg(short, long, default_value = "20")] limit: u32,
        #[arg(long)] json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (mut cfg, load_err) = match config::load_config() {
        Ok(cfg) => (cfg, None),
        Err(e) => (config::default_config(), Some(e)),
    };
    init_logging(&cfg.logging);
    if let Some(e) = load_err {
        warn!("Config load failed ({}), using defaults", e);
    }

    match cli.command {
        Command::Run { replay, fps, image, prompt, narrate, realtime, camera_id } => {
            if let Some(id) = camera_id {
                cfg.camera.camera_id = id;
            }
            if let Some(p) = prompt {
                cfg.semantic.enabled = true;
                cfg.semantic.prompt = p;
            }
            if narrate {
                cfg.narration.enabled = true;
            }
            run(cfg, replay, fps, image, realtime).await?;
        }

        Command::Scenes { limit, json } => {
            let store = open_store(&cfg.store).context("opening scene store")?;
            let scenes = store.query(0, limit).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&scenes)?);
            } else if scenes.is_empty() {
                println!("No scenes stored.");
            } else {
                println!("{:<6} {:<20} {:<30} {}", "ID", "Time", "Objects", "Narration");
                println!("{}", "─".repeat(90));
                for s in scenes {
                    println!(
                        "{:<6} {:<20} {:<30} {}",
                        s.id.map(|i| i.to_string()).unwrap_or_else(|| "-".into()),
                        s.created_at
                            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                            .unwrap_or_default(),
                        s.key(),
                        s.narration
                    );
                }
            }
        }
    }

    Ok(())
}

async fn run(cfg: AppConfig, replay: PathBuf, fps: f64, image: Option<PathBuf>, realtime: bool) -> Result<()> {
    let detector = ReplayDetector::from_file(&replay)?;
    let mut frames = PacedFrames::new(Utc::now(), fps, Some(detector.remaining() as u64)).realtime(realtime);
    if let Some(path) = image {
        let jpeg = std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
        frames = frames.with_image(jpeg)?;
    }

    let semantic = if cfg.semantic.enabled {
        let embedder = HttpEmbedder::new(&cfg.semantic.embed_url, cfg.semantic.region_max_px)?;
        let matcher = SemanticMatcher::with_relaxation(
            Arc::new(embedder),
            cfg.semantic.relax_above,
            cfg.semantic.relax_factor,
        );
        info!("Semantic filter on: \"{}\" (threshold {})", cfg.semantic.prompt, cfg.semantic.threshold);
        SemanticFilter::Enabled {
            matcher: Arc::new(matcher),
            prompt: cfg.semantic.prompt.clone(),
            threshold: cfg.semantic.threshold,
        }
    } else {
        SemanticFilter::Disabled
    };

    let mode = if cfg.narration.enabled {
        NarrationMode::Enabled(Arc::new(LlmNarrator::from_config(&cfg.narration)?))
    } else {
        NarrationMode::Disabled
    };
    let store = open_store(&cfg.store).context("opening scene store")?;
    let cache = SceneNarrationCache::new(mode, store)
        .with_min_interval(Duration::milliseconds(cfg.narration.min_interval_ms))
        .with_lookup_limit(cfg.store.query_limit);

    let (report_tx, report_rx) = flume::unbounded::<FrameReport>();
    let (narration_tx, narration_rx) = flume::unbounded::<NarrationReport>();

    let pipeline = DetectionPipeline::new(
        detector,
        CategoryFilter::new(cfg.detector.score_threshold, cfg.detector.categories.clone()),
        semantic,
        EntityTracker::new(Duration::milliseconds(cfg.tracker.absence_window_ms)),
    )
    .with_narration(cache, Some(narration_tx));

    let handle = pipeline.start(frames, &cfg.camera.camera_id, Some(report_tx));

    loop {
        tokio::select! {
            report = report_rx.recv_async() => match report {
                Ok(report) => print_report(&report),
                Err(_) => break,
            },
            Ok(narration) = narration_rx.recv_async() => print_narration(&narration),
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C, stopping pipeline");
                handle.stop();
                break;
            }
        }
    }

    let stats = handle.join().await;
    for narration in narration_rx.drain() {
        print_narration(&narration);
    }
    info!(
        "Done: {} frames, {} detector errors, {} rejected",
        stats.frames, stats.detector_errors, stats.rejected_frames
    );
    Ok(())
}

fn print_report(report: &FrameReport) {
    let entities: Vec<String> = report
        .entities
        .iter()
        .map(|e| {
            let mark = if e.is_active() { "" } else { "~" };
            format!("{}{}×{}", mark, e.class, e.consecutive_frames)
        })
        .collect();
    println!("[{:>5}] {}", report.frame_index, entities.join("  "));
}

fn print_narration(report: &NarrationReport) {
    if let Some(text) = report.outcome.text() {
        println!("        ── {}", text);
    }
}

use anyhow::{Context, Result};
use rollcall_attendance::{AttendanceSessionManager, DeadlineScheduler, SqliteLedger, StaticAuthorizer, StaticRoster};
use rollcall_core::{GalleryStore, NearestMatcher, OnnxExtractor};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod capture;
mod config;
mod engine;
mod recognition;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");
    let cfg = config::Config::load()?;

    let store = Arc::new(
        GalleryStore::open(&cfg.gallery_dir, cfg.engine.retain_versions)
            .with_context(|| format!("opening gallery at {}", cfg.gallery_dir.display()))?,
    );
    let backbone = cfg.engine.detector_backbone;
    let extractor = OnnxExtractor::load(&cfg.model_dir, &[backbone], cfg.engine.max_image_dimension)
        .with_context(|| format!("loading models from {}", cfg.model_dir.display()))?;
    let engine = engine::spawn_engine(extractor, NearestMatcher::new(&cfg.engine), Arc::clone(&store), backbone)?;

    if let Some(parent) = cfg.ledger_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let ledger = Arc::new(
        SqliteLedger::open(&cfg.ledger_path)
            .with_context(|| format!("opening ledger {}", cfg.ledger_path.display()))?,
    );
    let roster = Arc::new(
        StaticRoster::load(&cfg.roster_path)
            .with_context(|| format!("reading roster {}", cfg.roster_path.display()))?,
    );
    // The daemon only records; edits come through the CLI.
    let manager = Arc::new(AttendanceSessionManager::new(
        cfg.session.clone(),
        ledger,
        roster,
        Arc::new(StaticAuthorizer::new()),
    )?);

    let cancel = CancellationToken::new();
    let scheduler = tokio::spawn(
        DeadlineScheduler::new(Arc::clone(&manager), cfg.deadline_check_interval).run(cancel.clone()),
    );

    std::fs::create_dir_all(&cfg.frame_dir)?;
    let source = capture::DirectoryFrameSource::new(&cfg.frame_dir);
    let recognition = tokio::spawn(
        recognition::RecognitionLoop::new(
            Box::new(source),
            engine,
            manager,
            cfg.class_id.clone(),
            cfg.frame_sample_interval,
        )
        .run(cancel.clone()),
    );

    tracing::info!(
        class_id = %cfg.class_id,
        gallery_version = store.current().version,
        "rollcalld ready"
    );

    let mut hangup = signal(SignalKind::hangup())?;
    let mut terminate = signal(SignalKind::terminate())?;
    loop {
        tokio::select! {
            _ = hangup.recv() => match store.reload() {
                Ok(model) => tracing::info!(version = model.version, "gallery reloaded on SIGHUP"),
                Err(e) => tracing::error!(error = %e, "gallery reload failed; keeping current snapshot"),
            },
            _ = terminate.recv() => break,
            res = tokio::signal::ctrl_c() => {
                res?;
                break;
            }
        }
    }

    tracing::info!("rollcalld shutting down");
    cancel.cancel();
    let _ = recognition.await;
    let _ = scheduler.await;

    Ok(())
}

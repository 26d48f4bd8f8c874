use anyhow::{bail, Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use rollcall_attendance::{
    AttendanceLedger, AttendanceRecord, AttendanceSessionManager, AttendanceStatus, AuditInfo, ObserveOutcome, RecordQuery,
    SessionConfig, SessionKey, SessionSummary, Slot, SqliteLedger, StaticAuthorizer, StaticRoster,
};
use rollcall_core::{
    extractor, DetectorBackbone, EngineConfig, EnrollmentImage, GalleryStore, Matcher, NearestMatcher, OnnxExtractor,
    Trainer,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall face attendance CLI")]
struct Cli {
    /// Data directory holding models, gallery and ledger
    #[arg(long, global = true, env = "ROLLCALL_DATA_DIR")]
    data_dir: Option<PathBuf>,
    /// Print JSON instead of text
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train the gallery from a folder with one sub-folder of images per student
    Train {
        /// Enrollment root (e.g. photos/S1/*.jpg, photos/S2/*.jpg)
        root: PathBuf,
        /// Retrain only this student, keeping everyone else
        #[arg(long)]
        identity: Option<String>,
        /// Valid face images a student needs
        #[arg(long, default_value_t = rollcall_core::config::DEFAULT_MIN_IMAGES_PER_IDENTITY)]
        min_images: usize,
        /// Detector backbone (fast|accurate)
        #[arg(long, default_value = "accurate")]
        backbone: DetectorBackbone,
    },
    /// Recognize every face in an image against the current gallery
    Recognize {
        image: PathBuf,
        /// Detector backbone (fast|accurate)
        #[arg(long, default_value = "fast")]
        backbone: DetectorBackbone,
        /// Minimum confidence to accept a match
        #[arg(long, default_value_t = rollcall_core::config::DEFAULT_CONFIDENCE_THRESHOLD)]
        threshold: f32,
    },
    /// Inspect or roll back gallery versions
    Gallery {
        #[command(subcommand)]
        action: GalleryAction,
    },
    /// List effective attendance records
    Report {
        #[arg(long)]
        class: Option<String>,
        /// First session date (YYYY-MM-DD)
        #[arg(long)]
        from: Option<NaiveDate>,
        /// Last session date (YYYY-MM-DD)
        #[arg(long)]
        to: Option<NaiveDate>,
        #[arg(long)]
        identity: Option<String>,
    },
    /// Show a record with all its amendments
    History { record: Uuid },
    /// Amend an attendance record
    Edit {
        record: Uuid,
        /// New status (present|late|absent|excused)
        #[arg(long)]
        status: AttendanceStatus,
        #[arg(long)]
        reason: String,
        /// Who is making the change
        #[arg(long, env = "USER")]
        actor: String,
    },
    /// Record a student by hand in the class's session for that slot
    Mark {
        class: String,
        date: NaiveDate,
        slot: Slot,
        identity: String,
        /// present|late|excused
        #[arg(long, default_value = "present")]
        status: AttendanceStatus,
        #[arg(long)]
        reason: String,
        #[arg(long, env = "USER")]
        actor: String,
    },
    /// Close a session now, marking unrecorded students absent
    Close {
        class: String,
        date: NaiveDate,
        slot: Slot,
    },
    /// Attendance counts for one session
    Summary {
        class: String,
        date: NaiveDate,
        slot: Slot,
    },
}

#[derive(Subcommand)]
enum GalleryAction {
    /// List persisted versions
    List,
    /// Show identities and statistics of a version (default: current)
    Show {
        #[arg(long)]
        version: Option<u64>,
    },
    /// Serve the previous version again
    Rollback,
}

/// File locations, from `--data-dir` with per-file environment overrides.
struct Paths {
    models: PathBuf,
    gallery: PathBuf,
    ledger: PathBuf,
    roster: PathBuf,
    editors: PathBuf,
    /// TOML file shared with the daemon.
    config: Option<PathBuf>,
}

/// The part of the daemon's config file the CLI needs.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    session: SessionConfig,
}

impl Paths {
    fn resolve(data_dir: Option<PathBuf>, var: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = data_dir.unwrap_or_else(rollcall_core::default_data_dir);
        let path = |key: &str, name: &str| var(key).map(PathBuf::from).unwrap_or_else(|| data_dir.join(name));
        Self {
            models: path("ROLLCALL_MODEL_DIR", "models"),
            gallery: path("ROLLCALL_GALLERY_DIR", "gallery"),
            ledger: path("ROLLCALL_LEDGER_PATH", "attendance.db"),
            roster: path("ROLLCALL_ROSTER_PATH", "roster.json"),
            editors: path("ROLLCALL_EDITORS_PATH", "editors.json"),
            config: var("ROLLCALL_CONFIG").map(PathBuf::from),
        }
    }

    /// Session settings the daemon would use: config file, then environment.
    fn session_config(&self, var: impl Fn(&str) -> Option<String>) -> Result<SessionConfig> {
        let file = match &self.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
                toml::from_str::<FileConfig>(&raw).with_context(|| format!("parsing {}", path.display()))?
            }
            None => FileConfig::default(),
        };
        Ok(file.session.with_overrides(var))
    }

    fn store(&self) -> Result<Arc<GalleryStore>> {
        let store = GalleryStore::open(&self.gallery, EngineConfig::default().retain_versions)
            .with_context(|| format!("opening gallery at {}", self.gallery.display()))?;
        Ok(Arc::new(store))
    }

    fn ledger(&self) -> Result<Arc<SqliteLedger>> {
        if let Some(parent) = self.ledger.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let ledger = SqliteLedger::open(&self.ledger)
            .with_context(|| format!("opening ledger {}", self.ledger.display()))?;
        Ok(Arc::new(ledger))
    }

    fn manager(&self) -> Result<AttendanceSessionManager> {
        let roster = StaticRoster::load(&self.roster)
            .with_context(|| format!("reading roster {}", self.roster.display()))?;
        let editors = if self.editors.exists() {
            StaticAuthorizer::load(&self.editors)
                .with_context(|| format!("reading editors {}", self.editors.display()))?
        } else {
            StaticAuthorizer::new()
        };
        let config = self.session_config(|key: &str| std::env::var(key).ok())?;
        let manager = AttendanceSessionManager::new(config, self.ledger()?, Arc::new(roster), Arc::new(editors))?;
        Ok(manager)
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let paths = Paths::resolve(cli.data_dir, |key: &str| std::env::var(key).ok());
    let json = cli.json;
    tracing::debug!(
        gallery = %paths.gallery.display(),
        ledger = %paths.ledger.display(),
        models = %paths.models.display(),
        "paths resolved"
    );

    match cli.command {
        Commands::Train {
            root,
            identity,
            min_images,
            backbone,
        } => cmd_train(&paths, &root, identity.as_deref(), min_images, backbone, json),
        Commands::Recognize {
            image,
            backbone,
            threshold,
        } => cmd_recognize(&paths, &image, backbone, threshold, json),
        Commands::Gallery { action } => cmd_gallery(&paths, action, json),
        Commands::Report {
            class,
            from,
            to,
            identity,
        } => {
            let query = RecordQuery {
                class_id: class,
                from,
                to,
                identity,
            };
            let records = paths.ledger()?.query(&query)?;
            print_records(&records, json)
        }
        Commands::History { record } => {
            let chain = paths.ledger()?.history(record)?;
            if chain.is_empty() {
                bail!("no attendance record {record}");
            }
            print_records(&chain, json)
        }
        Commands::Edit {
            record,
            status,
            reason,
            actor,
        } => {
            let amendment = paths
                .manager()?
                .edit(record, status, AuditInfo { actor, reason }, Local::now().naive_local())?;
            print_records(std::slice::from_ref(&amendment), json)
        }
        Commands::Mark {
            class,
            date,
            slot,
            identity,
            status,
            reason,
            actor,
        } => {
            let manager = paths.manager()?;
            let session = manager.ensure_open(SessionKey::new(class, date, slot), None)?;
            let outcome = manager.mark(
                session.id,
                &identity,
                status,
                AuditInfo { actor, reason },
                Local::now().naive_local(),
            )?;
            match outcome {
                ObserveOutcome::Recorded(record) => print_records(std::slice::from_ref(&record), json),
                _ => {
                    println!("{identity} already recorded in {}", session.key);
                    Ok(())
                }
            }
        }
        Commands::Close { class, date, slot } => {
            let manager = paths.manager()?;
            let session = find_session(&manager, SessionKey::new(class, date, slot))?;
            let summary = manager.close(session, Local::now().naive_local())?;
            print_summary(&summary, json)
        }
        Commands::Summary { class, date, slot } => {
            let manager = paths.manager()?;
            let session = find_session(&manager, SessionKey::new(class, date, slot))?;
            print_summary(&manager.summary(session)?, json)
        }
    }
}

fn find_session(manager: &AttendanceSessionManager, key: SessionKey) -> Result<rollcall_attendance::SessionId> {
    match manager.find(&key) {
        Some(info) => Ok(info.id),
        None => bail!("no session for {key}"),
    }
}

fn cmd_train(
    paths: &Paths,
    root: &Path,
    identity: Option<&str>,
    min_images: usize,
    backbone: DetectorBackbone,
    json: bool,
) -> Result<()> {
    let config = EngineConfig {
        min_images_per_identity: min_images,
        ..EngineConfig::default()
    };
    let extractor = OnnxExtractor::load(&paths.models, &[backbone], config.max_image_dimension)
        .with_context(|| format!("loading models from {}", paths.models.display()))?;
    let mut trainer = Trainer::new(extractor, config, paths.store()?).with_backbone(backbone);

    match identity {
        Some(identity) => {
            let folder = root.join(identity);
            let mut files: Vec<PathBuf> = std::fs::read_dir(&folder)
                .with_context(|| format!("reading {}", folder.display()))?
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| {
                    p.extension()
                        .and_then(|e| e.to_str())
                        .is_some_and(|e| rollcall_core::trainer::SUPPORTED_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                })
                .collect();
            files.sort();
            let images: Vec<EnrollmentImage> = files.iter().map(|p| EnrollmentImage::from_path(p)).collect();
            let outcome = trainer.train(identity, &images)?;
            if json {
                return print_json(&outcome);
            }
            for skipped in &outcome.skipped {
                println!("  skipped {}: {}", skipped.label, skipped.reason);
            }
            println!("{}", outcome.message);
            if !outcome.ok {
                bail!("training {identity} failed");
            }
        }
        None => {
            let summary = trainer.train_directory(root)?;
            if json {
                return print_json(&summary);
            }
            for skipped in &summary.skipped {
                println!("  skipped {}/{}: {}", skipped.identity, skipped.label, skipped.reason);
            }
            for person in &summary.trained {
                println!("  ok    {}", person.message);
            }
            for person in &summary.failed {
                println!("  FAIL  {}", person.message);
            }
            println!("{}", summary.message);
            if let Some(version) = summary.version {
                println!("gallery version {version}, {} encodings", summary.total_encodings);
            }
        }
    }
    Ok(())
}

fn cmd_recognize(paths: &Paths, image: &Path, backbone: DetectorBackbone, threshold: f32, json: bool) -> Result<()> {
    let config = EngineConfig {
        confidence_threshold: threshold,
        ..EngineConfig::default()
    }
    .sanitized();
    let mut extractor = OnnxExtractor::load(&paths.models, &[backbone], config.max_image_dimension)
        .with_context(|| format!("loading models from {}", paths.models.display()))?;
    let gray = extractor::load_gray(image).with_context(|| format!("reading {}", image.display()))?;

    let faces = rollcall_core::EncodingExtractor::extract(&mut extractor, &gray, backbone)?;
    let gallery = paths.store()?.current();
    let results = NearestMatcher::new(&config).compare_all(&faces, &gallery);

    if json {
        return print_json(&results);
    }
    if results.is_empty() {
        println!("no face detected");
    }
    for (i, r) in results.iter().enumerate() {
        println!(
            "face {i}: {} confidence={:.3} verdict={:?} box=({:.0},{:.0} {:.0}x{:.0})",
            r.identity, r.confidence, r.verdict, r.bbox.x, r.bbox.y, r.bbox.width, r.bbox.height
        );
    }
    println!("gallery version {}", gallery.version);
    Ok(())
}

fn cmd_gallery(paths: &Paths, action: GalleryAction, json: bool) -> Result<()> {
    let store = paths.store()?;
    match action {
        GalleryAction::List => {
            let versions = store.versions()?;
            let current = store.current().version;
            if json {
                return print_json(&serde_json::json!({ "current": current, "versions": versions }));
            }
            if versions.is_empty() {
                println!("no gallery trained yet");
            }
            for v in versions {
                let marker = if v == current { "*" } else { " " };
                println!("{marker} {v}");
            }
        }
        GalleryAction::Show { version } => {
            let model = match version {
                Some(v) => Arc::new(store.load_version(v)?),
                None => store.current(),
            };
            let stats = model.stats();
            if json {
                return print_json(&stats);
            }
            println!(
                "version {} created {}: {} persons, {} encodings",
                stats.version,
                model.created_at.format("%Y-%m-%d %H:%M:%S"),
                stats.unique_persons,
                stats.total_encodings
            );
            for (identity, refs) in model.entries() {
                let source = model.source_image_counts.get(identity).copied().unwrap_or(0);
                println!("  {identity:<16} {} encodings from {source} images", refs.len());
            }
        }
        GalleryAction::Rollback => {
            let model = store.rollback()?;
            if json {
                return print_json(&model.stats());
            }
            println!("now serving gallery version {}", model.version);
        }
    }
    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_records(records: &[AttendanceRecord], json: bool) -> Result<()> {
    if json {
        return print_json(records);
    }
    for r in records {
        println!("{}", format_record(r));
    }
    Ok(())
}

fn format_record(r: &AttendanceRecord) -> String {
    let confidence = r.confidence.map(|c| format!("{c:.2}")).unwrap_or_else(|| "-".into());
    let mut line = format!(
        "{} {} {:<12} {:<8} conf={confidence} src={}",
        r.id,
        r.timestamp.format("%Y-%m-%d %H:%M"),
        r.identity,
        r.status,
        r.source.as_str()
    );
    if let Some(audit) = &r.audit {
        line.push_str(&format!(" by={} reason={:?}", audit.actor, audit.reason));
    }
    line
}

fn print_summary(s: &SessionSummary, json: bool) -> Result<()> {
    if json {
        return print_json(s);
    }
    println!(
        "{} [{}]: {} students, present {}, late {}, absent {}, excused {}, pending {} ({:.1}% present)",
        s.key,
        s.state.as_str(),
        s.total_students,
        s.present,
        s.late,
        s.absent,
        s.excused,
        s.pending,
        s.attendance_rate
    );
    Ok(())
}

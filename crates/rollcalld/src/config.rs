use anyhow::{Context, Result};
use rollcall_attendance::SessionConfig;
use rollcall_core::EngineConfig;
use serde::Deserialize;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Optional TOML file named by `ROLLCALL_CONFIG`. Environment variables win over it.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub engine: EngineConfig,
    pub session: SessionConfig,
}

impl FileConfig {
    pub fn parse(raw: &str) -> Result<Self> {
        toml::from_str(raw).context("invalid config file")
    }
}

/// Daemon configuration.
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Versioned gallery snapshots.
    pub gallery_dir: PathBuf,
    /// SQLite attendance ledger.
    pub ledger_path: PathBuf,
    /// Spool directory the camera writes frames into.
    pub frame_dir: PathBuf,
    /// JSON class → student list.
    pub roster_path: PathBuf,
    /// Class the camera is installed in.
    pub class_id: String,
    /// How often a frame is taken from the spool.
    pub frame_sample_interval: Duration,
    /// How often expired sessions are closed.
    pub deadline_check_interval: Duration,
    pub engine: EngineConfig,
    pub session: SessionConfig,
}

impl Config {
    /// Load `ROLLCALL_CONFIG` (if set), then apply `ROLLCALL_*` environment variables.
    pub fn load() -> Result<Self> {
        let file = match std::env::var("ROLLCALL_CONFIG") {
            Ok(path) => {
                let raw = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
                FileConfig::parse(&raw).with_context(|| format!("parsing {path}"))?
            }
            Err(_) => FileConfig::default(),
        };
        Ok(Self::from_vars(file, |key: &str| std::env::var(key).ok()))
    }

    /// Build from a file config and a variable lookup.
    pub fn from_vars(file: FileConfig, var: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = var("ROLLCALL_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(rollcall_core::default_data_dir);

        let mut engine = file.engine;
        if let Some(b) = parse_var(&var, "ROLLCALL_DETECTOR_BACKBONE") {
            engine.detector_backbone = b;
        }
        if let Some(t) = parse_var(&var, "ROLLCALL_CONFIDENCE_THRESHOLD") {
            engine.confidence_threshold = t;
        }
        if let Some(e) = parse_var(&var, "ROLLCALL_TIE_EPSILON") {
            engine.tie_epsilon = e;
        }
        if let Some(n) = parse_var(&var, "ROLLCALL_MIN_IMAGES_PER_IDENTITY") {
            engine.min_images_per_identity = n;
        }
        if let Some(d) = parse_var(&var, "ROLLCALL_MAX_IMAGE_DIMENSION") {
            engine.max_image_dimension = d;
        }
        if let Some(r) = parse_var(&var, "ROLLCALL_RETAIN_VERSIONS") {
            engine.retain_versions = r;
        }

        let session = file.session.with_overrides(&var);

        let path = |key: &str, default: PathBuf| var(key).map(PathBuf::from).unwrap_or(default);

        Self {
            model_dir: path("ROLLCALL_MODEL_DIR", data_dir.join("models")),
            gallery_dir: path("ROLLCALL_GALLERY_DIR", data_dir.join("gallery")),
            ledger_path: path("ROLLCALL_LEDGER_PATH", data_dir.join("attendance.db")),
            frame_dir: path("ROLLCALL_FRAME_DIR", data_dir.join("frames")),
            roster_path: path("ROLLCALL_ROSTER_PATH", data_dir.join("roster.json")),
            class_id: var("ROLLCALL_CLASS_ID").unwrap_or_else(|| "default".to_string()),
            frame_sample_interval: Duration::from_millis(parse_var(&var, "ROLLCALL_FRAME_SAMPLE_MS").unwrap_or(1000)),
            deadline_check_interval: Duration::from_secs(parse_var(&var, "ROLLCALL_DEADLINE_CHECK_SECS").unwrap_or(30)),
            engine: engine.sanitized(),
            session,
        }
    }
}

fn parse_var<T: FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = var(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable config value");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::DetectorBackbone;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let cfg = Config::from_vars(FileConfig::default(), vars(&[("ROLLCALL_DATA_DIR", "/srv/rc")]));
        assert_eq!(cfg.gallery_dir, PathBuf::from("/srv/rc/gallery"));
        assert_eq!(cfg.ledger_path, PathBuf::from("/srv/rc/attendance.db"));
        assert_eq!(cfg.frame_sample_interval, Duration::from_secs(1));
        assert_eq!(cfg.deadline_check_interval, Duration::from_secs(30));
        assert_eq!(cfg.engine.confidence_threshold, 0.6);
        assert_eq!(cfg.engine.detector_backbone, DetectorBackbone::Fast);
        assert_eq!(cfg.class_id, "default");
    }

    #[test]
    fn test_env_overrides_file() {
        let file = FileConfig::parse(
            r#"
            [engine]
            confidence_threshold = 0.7
            detector_backbone = "accurate"

            [session]
            session_grace_period = 300
            "#,
        )
        .unwrap();
        let cfg = Config::from_vars(
            file,
            vars(&[
                ("ROLLCALL_CONFIDENCE_THRESHOLD", "0.65"),
                ("ROLLCALL_CLASS_ID", "7A"),
                ("ROLLCALL_FRAME_SAMPLE_MS", "250"),
                ("ROLLCALL_MIN_CONFIDENCE", "not-a-number"),
            ]),
        );
        assert_eq!(cfg.engine.confidence_threshold, 0.65);
        assert_eq!(cfg.engine.detector_backbone, DetectorBackbone::Accurate);
        assert_eq!(cfg.session.session_grace_period, Duration::from_secs(300));
        assert_eq!(cfg.session.min_confidence, 0.6);
        assert_eq!(cfg.class_id, "7A");
        assert_eq!(cfg.frame_sample_interval, Duration::from_millis(250));
    }

    #[test]
    fn test_bad_file_is_an_error() {
        assert!(FileConfig::parse("[engine]\nconfidence_threshold = \"high\"").is_err());
    }
}

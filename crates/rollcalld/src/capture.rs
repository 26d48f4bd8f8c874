//! Frame sources for the recognition loop.
//!
//! The camera collaborator drops still frames into a spool directory; the
//! daemon samples the newest one each tick and skips whatever arrived in
//! between.

use chrono::{DateTime, Local, NaiveDateTime};
use image::GrayImage;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

const FRAME_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];
/// Fraction of near-black pixels above which a frame is treated as dark.
const DARK_FRAME_THRESHOLD: f32 = 0.95;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("frame directory {path}: {source}")]
    Directory {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("undecodable frame {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: image::ImageError,
    },
}

/// A sampled grayscale frame.
pub struct Frame {
    pub image: GrayImage,
    pub captured_at: NaiveDateTime,
    pub sequence: u64,
    /// Where the frame came from, kept as the attendance snapshot reference.
    pub origin: Option<PathBuf>,
}

impl Frame {
    /// Average pixel brightness (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        let data = self.image.as_raw();
        if data.is_empty() {
            return 0.0;
        }
        data.iter().map(|&b| b as f32).sum::<f32>() / data.len() as f32
    }

    /// True if more than 95% of pixels fall in the darkest eighth of the range.
    pub fn is_dark(&self) -> bool {
        let data = self.image.as_raw();
        if data.is_empty() {
            return true;
        }
        let dark = data.iter().filter(|&&p| p < 32).count();
        (dark as f32 / data.len() as f32) > DARK_FRAME_THRESHOLD
    }
}

pub trait FrameSource: Send {
    /// Newest frame not yet returned, or `None` if nothing new arrived.
    fn latest(&mut self) -> Result<Option<Frame>, CaptureError>;
}

/// Reads frames written into a directory, ordered by file name.
pub struct DirectoryFrameSource {
    dir: PathBuf,
    seen: HashSet<PathBuf>,
    sequence: u64,
}

impl DirectoryFrameSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            seen: HashSet::new(),
            sequence: 0,
        }
    }

    fn pending(&self) -> Result<Vec<PathBuf>, CaptureError> {
        let entries = fs::read_dir(&self.dir).map_err(|source| CaptureError::Directory {
            path: self.dir.display().to_string(),
            source,
        })?;
        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| is_frame_file(p) && !self.seen.contains(p))
            .collect();
        files.sort();
        Ok(files)
    }
}

fn is_frame_file(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| FRAME_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}

fn modified_at(path: &Path) -> NaiveDateTime {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .map(|t| DateTime::<Local>::from(t).naive_local())
        .unwrap_or_else(|_| Local::now().naive_local())
}

impl FrameSource for DirectoryFrameSource {
    fn latest(&mut self) -> Result<Option<Frame>, CaptureError> {
        let pending = self.pending()?;
        let Some(newest) = pending.last().cloned() else {
            return Ok(None);
        };
        if pending.len() > 1 {
            tracing::trace!(skipped = pending.len() - 1, "sampling newest frame");
        }
        self.seen.extend(pending);

        let image = image::open(&newest)
            .map_err(|source| CaptureError::Decode {
                path: newest.display().to_string(),
                source,
            })?
            .into_luma8();
        self.sequence += 1;
        Ok(Some(Frame {
            image,
            captured_at: modified_at(&newest),
            sequence: self.sequence,
            origin: Some(newest),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn write(dir: &Path, name: &str, value: u8) {
        GrayImage::from_pixel(8, 8, Luma([value])).save(dir.join(name)).unwrap();
    }

    #[test]
    fn test_latest_samples_newest_and_skips_backlog() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "0001.png", 10);
        write(dir.path(), "0002.png", 20);
        write(dir.path(), "0003.png", 200);
        fs::write(dir.path().join("notes.txt"), b"x").unwrap();

        let mut source = DirectoryFrameSource::new(dir.path());
        let frame = source.latest().unwrap().unwrap();
        assert_eq!(frame.image.get_pixel(0, 0).0[0], 200);
        assert_eq!(frame.sequence, 1);
        assert!(frame.origin.unwrap().ends_with("0003.png"));

        assert!(source.latest().unwrap().is_none());

        write(dir.path(), "0004.png", 90);
        let next = source.latest().unwrap().unwrap();
        assert_eq!(next.image.get_pixel(0, 0).0[0], 90);
        assert_eq!(next.sequence, 2);
    }

    #[test]
    fn test_undecodable_frame_is_reported_once() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("bad.jpg"), b"not a jpeg").unwrap();
        let mut source = DirectoryFrameSource::new(dir.path());
        assert!(matches!(source.latest(), Err(CaptureError::Decode { .. })));
        assert!(source.latest().unwrap().is_none());
    }

    #[test]
    fn test_missing_directory() {
        let mut source = DirectoryFrameSource::new("/nonexistent/rollcall/frames");
        assert!(matches!(source.latest(), Err(CaptureError::Directory { .. })));
    }

    #[test]
    fn test_dark_frame_detection() {
        let frame = |v| Frame {
            image: GrayImage::from_pixel(10, 10, Luma([v])),
            captured_at: Local::now().naive_local(),
            sequence: 0,
            origin: None,
        };
        assert!(frame(5).is_dark());
        assert!(!frame(120).is_dark());
        assert_eq!(frame(120).avg_brightness(), 120.0);
    }
}

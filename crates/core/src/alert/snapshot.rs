use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use thiserror::Error;

use crate::shared::frame::Frame;

/// JPEG quality for both event and monitoring snapshots.
pub const JPEG_QUALITY: u8 = 95;

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("failed to create snapshot directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode snapshot: {0}")]
    Encode(#[from] image::ImageError),
    #[error("failed to write snapshot to {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Encodes a frame as JPEG at quality 95.
pub fn encode_jpeg(frame: &Frame) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, JPEG_QUALITY).encode(
        frame.color(),
        frame.width(),
        frame.height(),
        ExtendedColorType::Rgb8,
    )?;
    Ok(buf)
}

/// Writes an event snapshot as `snapshot_<YYYYmmdd_HHMMSS>_<track_id>.jpg`.
pub fn save_event_snapshot(
    frame: &Frame,
    dir: &Path,
    track_id: u64,
    at: DateTime<Utc>,
) -> Result<PathBuf, SnapshotError> {
    let name = format!("snapshot_{}_{track_id}.jpg", at.format("%Y%m%d_%H%M%S"));
    save(frame, dir, &name)
}

/// Writes a monitoring snapshot as
/// `monitoring_snapshot_<device_id>_<YYYYmmdd_HHMMSS>.jpg`.
pub fn save_monitoring_snapshot(
    frame: &Frame,
    dir: &Path,
    device_id: &str,
    at: DateTime<Utc>,
) -> Result<PathBuf, SnapshotError> {
    let name = format!(
        "monitoring_snapshot_{device_id}_{}.jpg",
        at.format("%Y%m%d_%H%M%S")
    );
    save(frame, dir, &name)
}

fn save(frame: &Frame, dir: &Path, name: &str) -> Result<PathBuf, SnapshotError> {
    fs::create_dir_all(dir).map_err(|e| SnapshotError::CreateDir {
        path: dir.to_path_buf(),
        source: e,
    })?;
    let bytes = encode_jpeg(frame)?;
    let path = dir.join(name);
    fs::write(&path, bytes).map_err(|e| SnapshotError::Write {
        path: path.clone(),
        source: e,
    })?;
    Ok(path)
}

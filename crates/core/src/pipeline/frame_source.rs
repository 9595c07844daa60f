use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::shared::frame::Frame;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp"];

/// Abstracts frame ingestion so the pipeline can run off any
/// depth-capable camera or recorded sequence.
pub trait FrameSource: Send {
    /// Next frame, or `None` when the source is exhausted.
    fn next_frame(&mut self) -> Result<Option<Frame>, Box<dyn std::error::Error>>;

    /// Health predicate; the embedding application restarts unhealthy
    /// producers.
    fn is_available(&self) -> bool {
        true
    }
}

/// Replays a directory of still images, sorted by file name, as a frame
/// sequence. Frames carry no depth plane, so depth-dependent features
/// degrade the same way they do when the depth sensor is down.
pub struct ImageSequenceSource {
    files: Vec<PathBuf>,
    next: usize,
}

impl ImageSequenceSource {
    pub fn open(dir: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            })
            .collect();
        if files.is_empty() {
            return Err(format!("no image files in {}", dir.display()).into());
        }
        files.sort();
        Ok(Self { files, next: 0 })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl FrameSource for ImageSequenceSource {
    fn next_frame(&mut self) -> Result<Option<Frame>, Box<dyn std::error::Error>> {
        let Some(path) = self.files.get(self.next) else {
            return Ok(None);
        };
        let index = self.next as u64;
        self.next += 1;

        let rgb = image::open(path)?.into_rgb8();
        let (width, height) = rgb.dimensions();
        Ok(Some(Frame::new(
            rgb.into_raw(),
            Vec::new(),
            width,
            height,
            index,
            Utc::now(),
        )))
    }
}

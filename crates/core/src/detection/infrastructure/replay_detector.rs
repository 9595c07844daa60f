use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::detection::domain::vehicle_detector::{Detection, VehicleClass, VehicleDetector};
use crate::shared::bbox::BBox;
use crate::shared::frame::Frame;

/// One recorded detection in the sidecar file.
#[derive(Debug, Deserialize)]
struct RecordedDetection {
    /// `[x1, y1, x2, y2]` in absolute pixels.
    bbox: [f64; 4],
    score: f64,
    class_id: u8,
}

/// Replays previously recorded detections from a JSON sidecar keyed by
/// frame index, letting recorded sequences run through the full pipeline
/// without the GPU inference engine.
///
/// Sidecar format:
/// ```json
/// { "0": [ { "bbox": [10, 10, 60, 60], "score": 0.9, "class_id": 0 } ] }
/// ```
pub struct ReplayDetector {
    detections: HashMap<u64, Vec<Detection>>,
}

impl ReplayDetector {
    pub fn from_json_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let text = fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let raw: HashMap<String, Vec<RecordedDetection>> = serde_json::from_str(text)?;
        let mut detections = HashMap::with_capacity(raw.len());
        for (frame, recorded) in raw {
            let index: u64 = frame
                .parse()
                .map_err(|_| format!("invalid frame index key: {frame:?}"))?;
            let mut converted = Vec::with_capacity(recorded.len());
            for r in recorded {
                let class = VehicleClass::from_id(r.class_id)
                    .ok_or_else(|| format!("unknown class id {} at frame {index}", r.class_id))?;
                converted.push(Detection {
                    bbox: BBox::new(r.bbox[0], r.bbox[1], r.bbox[2], r.bbox[3]),
                    score: r.score,
                    class,
                });
            }
            detections.insert(index, converted);
        }
        Ok(Self { detections })
    }
}

impl VehicleDetector for ReplayDetector {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, Box<dyn std::error::Error>> {
        Ok(self
            .detections
            .get(&frame.index())
            .cloned()
            .unwrap_or_default())
    }
}

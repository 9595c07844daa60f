//! Best-frame selection for licence-plate recognition.
//!
//! Recognition is expensive, so it runs at most a handful of times per
//! vehicle: each frame's crop is scored for quality, and recognition
//! triggers either when quality clears the threshold or when the track
//! has waited long enough that the best crop seen so far will have to do.

use std::collections::{HashMap, HashSet};

use crate::config::BestFrameConfig;
use crate::lpr::domain::plate_recognizer::RoiImage;
use crate::shared::bbox::BBox;

/// Bbox/frame area ratio at which the size term saturates.
const AREA_SATURATION: f64 = 0.25;

/// Distance (metres) below which the proximity term saturates.
const DISTANCE_SATURATION: f64 = 3.0;

/// Weights of the quality terms: size, centering, proximity, confidence.
const WEIGHTS: [f64; 4] = [0.35, 0.25, 0.2, 0.2];

/// Scores how promising a crop is for plate recognition, in [0, 1].
///
/// Combines relative bbox size (larger is better, saturating at 25 % of
/// the frame), centering, proximity (closer is better, saturating below
/// 3 m) and detection confidence.
pub fn frame_quality(
    bbox: &BBox,
    confidence: f64,
    frame_width: u32,
    frame_height: u32,
    distance_m: Option<f64>,
) -> f64 {
    let size = (bbox.area_ratio(frame_width, frame_height) / AREA_SATURATION).min(1.0);

    let (cx, cy) = bbox.center();
    let (fx, fy) = (frame_width as f64 / 2.0, frame_height as f64 / 2.0);
    let max_offset = (fx * fx + fy * fy).sqrt();
    let offset = ((cx - fx).powi(2) + (cy - fy).powi(2)).sqrt();
    let centering = if max_offset > 0.0 {
        1.0 - (offset / max_offset).min(1.0)
    } else {
        0.0
    };

    let proximity = match distance_m {
        Some(d) if d > 0.0 => (DISTANCE_SATURATION / d).min(1.0),
        // No depth: neutral middle score rather than penalising.
        _ => 0.5,
    };

    WEIGHTS[0] * size
        + WEIGHTS[1] * centering
        + WEIGHTS[2] * proximity
        + WEIGHTS[3] * confidence.clamp(0.0, 1.0)
}

#[derive(Default)]
struct TrackSelection {
    best_quality: f64,
    best_roi: Option<RoiImage>,
    waited_frames: u32,
    pending: bool,
    result: Option<(String, f64)>,
    /// Recognition ran and returned no plate (or failed); with
    /// reuse_result set this stops retriggering.
    exhausted: bool,
}

/// Per-track best-frame state machine. At most one recognition task is
/// in flight per track.
pub struct BestFrameSelector {
    enabled: bool,
    quality_threshold: f64,
    max_wait_frames: u32,
    reuse_result: bool,
    tracks: HashMap<u64, TrackSelection>,
}

impl BestFrameSelector {
    pub fn new(config: &BestFrameConfig) -> Self {
        Self {
            enabled: config.enabled,
            quality_threshold: config.quality_threshold,
            max_wait_frames: config.max_wait_frames,
            reuse_result: config.reuse_result,
            tracks: HashMap::new(),
        }
    }

    /// Offers this frame's crop for a track. Returns the ROI to
    /// recognise when recognition should trigger now.
    #[allow(clippy::too_many_arguments)]
    pub fn should_trigger(
        &mut self,
        track_id: u64,
        bbox: &BBox,
        roi: RoiImage,
        confidence: f64,
        frame_width: u32,
        frame_height: u32,
        distance_m: Option<f64>,
    ) -> Option<RoiImage> {
        if !self.enabled {
            return None;
        }
        let quality_threshold = self.quality_threshold;
        let max_wait_frames = self.max_wait_frames;
        let reuse_result = self.reuse_result;

        let state = self.tracks.entry(track_id).or_default();
        if state.pending || (reuse_result && (state.result.is_some() || state.exhausted)) {
            return None;
        }

        let quality = frame_quality(bbox, confidence, frame_width, frame_height, distance_m);

        if quality >= quality_threshold {
            state.pending = true;
            state.best_quality = quality;
            state.best_roi = None;
            return Some(roi);
        }

        if quality > state.best_quality || state.best_roi.is_none() {
            state.best_quality = quality;
            state.best_roi = Some(roi);
        }
        state.waited_frames += 1;

        if state.waited_frames >= max_wait_frames {
            if let Some(best) = state.best_roi.take() {
                state.pending = true;
                state.waited_frames = 0;
                return Some(best);
            }
        }
        None
    }

    /// Clears the in-flight marker without recording an outcome, e.g.
    /// when the worker queue rejected the job. The track may trigger
    /// again on a later frame.
    pub fn cancel_pending(&mut self, track_id: u64) {
        if let Some(state) = self.tracks.get_mut(&track_id) {
            state.pending = false;
        }
    }

    /// Records a completed recognition for the track and clears its
    /// in-flight marker.
    pub fn on_complete(&mut self, track_id: u64, result: Option<(String, f64)>) {
        let state = self.tracks.entry(track_id).or_default();
        state.pending = false;
        match result {
            Some(r) => state.result = Some(r),
            None => state.exhausted = true,
        }
    }

    pub fn result(&self, track_id: u64) -> Option<&(String, f64)> {
        self.tracks.get(&track_id).and_then(|s| s.result.as_ref())
    }

    pub fn has_pending(&self, track_id: u64) -> bool {
        self.tracks.get(&track_id).is_some_and(|s| s.pending)
    }

    pub fn reset(&mut self, track_id: u64) {
        self.tracks.remove(&track_id);
    }

    pub fn cleanup(&mut self, active_ids: &HashSet<u64>) {
        self.tracks.retain(|id, _| active_ids.contains(id));
    }
}

//! Loitering detection.
//!
//! A vehicle merely passing the gate is not worth an alert; one that
//! stays close to the camera without meaningful motion is. Loitering is
//! a pure function of the recorded position history.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::config::LoiteringConfig;
use crate::shared::bbox::BBox;

/// Positions examined by the loitering predicate.
const RECENT_WINDOW: usize = 10;

/// Bounded per-track history length.
const MAX_POSITIONS: usize = 100;

/// Reference frame width (pixels) for normalising displacement.
const REFERENCE_WIDTH: f64 = 1920.0;

#[derive(Clone, Copy, Debug)]
struct TrackPosition {
    timestamp: DateTime<Utc>,
    center: (f64, f64),
    area_ratio: f64,
}

pub struct LoiteringDetector {
    enabled: bool,
    min_duration_s: f64,
    min_area_ratio: f64,
    min_movement_ratio: f64,
    entered: HashMap<u64, DateTime<Utc>>,
    positions: HashMap<u64, Vec<TrackPosition>>,
}

impl LoiteringDetector {
    pub fn new(config: &LoiteringConfig) -> Self {
        Self {
            enabled: config.enabled,
            min_duration_s: config.min_duration,
            min_area_ratio: config.min_area_ratio,
            min_movement_ratio: config.min_movement_ratio,
            entered: HashMap::new(),
            positions: HashMap::new(),
        }
    }

    /// Records one observation for a track.
    pub fn update(
        &mut self,
        track_id: u64,
        bbox: &BBox,
        frame_width: u32,
        frame_height: u32,
        now: DateTime<Utc>,
    ) {
        self.entered.entry(track_id).or_insert(now);
        let positions = self.positions.entry(track_id).or_default();
        positions.push(TrackPosition {
            timestamp: now,
            center: bbox.center(),
            area_ratio: bbox.area_ratio(frame_width, frame_height),
        });
        if positions.len() > MAX_POSITIONS {
            positions.remove(0);
        }
    }

    /// True when the track has been present for `min_duration`, covers
    /// enough of the frame, and its centre barely moved over the recent
    /// window.
    pub fn is_loitering(&self, track_id: u64, now: DateTime<Utc>) -> bool {
        if !self.enabled {
            return false;
        }
        let Some(entered) = self.entered.get(&track_id) else {
            return false;
        };
        let elapsed = (now - *entered).as_seconds_f64();
        if elapsed < self.min_duration_s {
            return false;
        }

        let Some(positions) = self.positions.get(&track_id) else {
            return false;
        };
        if positions.len() < RECENT_WINDOW {
            return false;
        }
        let recent = &positions[positions.len() - RECENT_WINDOW..];

        let mean_area =
            recent.iter().map(|p| p.area_ratio).sum::<f64>() / recent.len() as f64;
        if mean_area < self.min_area_ratio {
            return false;
        }

        let xs = recent.iter().map(|p| p.center.0);
        let ys = recent.iter().map(|p| p.center.1);
        let dx = span(xs);
        let dy = span(ys);
        let displacement = (dx * dx + dy * dy).sqrt() / REFERENCE_WIDTH;
        displacement < self.min_movement_ratio
    }

    /// Seconds since the track was first observed.
    pub fn duration(&self, track_id: u64, now: DateTime<Utc>) -> f64 {
        self.entered
            .get(&track_id)
            .map(|entered| (now - *entered).as_seconds_f64())
            .unwrap_or(0.0)
    }

    pub fn reset(&mut self, track_id: u64) {
        self.entered.remove(&track_id);
        self.positions.remove(&track_id);
    }

    pub fn cleanup(&mut self, active_ids: &HashSet<u64>) {
        self.entered.retain(|id, _| active_ids.contains(id));
        self.positions.retain(|id, _| active_ids.contains(id));
    }
}

fn span(values: impl Iterator<Item = f64>) -> f64 {
    let (mut min, mut max) = (f64::INFINITY, f64::NEG_INFINITY);
    for v in values {
        min = min.min(v);
        max = max.max(v);
    }
    if min.is_finite() && max.is_finite() {
        max - min
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    const FRAME_W: u32 = 1920;
    const FRAME_H: u32 = 1080;

    fn detector() -> LoiteringDetector {
        LoiteringDetector::new(&LoiteringConfig {
            enabled: true,
            min_duration: 10.0,
            min_area_ratio: 0.05,
            min_movement_ratio: 0.1,
            apply_to_unregistered_only: true,
        })
    }

    /// ~6 % of the frame.
    fn big_box(offset: f64) -> BBox {
        BBox::new(600.0 + offset, 400.0, 1000.0 + offset, 711.0)
    }

    fn feed(
        detector: &mut LoiteringDetector,
        track_id: u64,
        start: DateTime<Utc>,
        frames: usize,
        step_s: f64,
        bbox_fn: impl Fn(usize) -> BBox,
    ) -> DateTime<Utc> {
        let mut now = start;
        for i in 0..frames {
            detector.update(track_id, &bbox_fn(i), FRAME_W, FRAME_H, now);
            now += TimeDelta::milliseconds((step_s * 1000.0) as i64);
        }
        now
    }

    #[test]
    fn test_stationary_vehicle_loiters_after_min_duration() {
        let mut d = detector();
        let start = Utc::now();
        // 12 s of a near-stationary large vehicle, one update per second.
        let end = feed(&mut d, 1, start, 13, 1.0, |i| big_box((i % 3) as f64 * 20.0));
        assert!(d.is_loitering(1, end));
    }

    #[test]
    fn test_not_loitering_before_min_duration() {
        let mut d = detector();
        let start = Utc::now();
        let end = feed(&mut d, 1, start, 12, 0.5, |_| big_box(0.0));
        // Only 6 s elapsed; plenty of positions but too early.
        assert!(!d.is_loitering(1, end));
    }

    #[test]
    fn test_too_few_positions_blocks() {
        let mut d = detector();
        let start = Utc::now();
        let end = feed(&mut d, 1, start, 5, 3.0, |_| big_box(0.0));
        assert!(!d.is_loitering(1, end));
    }

    #[test]
    fn test_small_vehicle_never_loiters() {
        let mut d = detector();
        let start = Utc::now();
        // Tiny edge box, well under min_area_ratio.
        let end = feed(&mut d, 1, start, 15, 1.0, |_| {
            BBox::new(10.0, 10.0, 110.0, 80.0)
        });
        assert!(!d.is_loitering(1, end));
    }

    #[test]
    fn test_moving_vehicle_never_loiters() {
        let mut d = detector();
        let start = Utc::now();
        // Large displacement: 60 px per frame over the recent window.
        let end = feed(&mut d, 1, start, 15, 1.0, |i| big_box(i as f64 * 60.0));
        assert!(!d.is_loitering(1, end));
    }

    #[test]
    fn test_loitering_is_pure_function_of_history() {
        let mut d = detector();
        let start = Utc::now();
        let end = feed(&mut d, 1, start, 13, 1.0, |_| big_box(0.0));
        assert_eq!(d.is_loitering(1, end), d.is_loitering(1, end));
    }

    #[test]
    fn test_unknown_track_is_not_loitering() {
        let d = detector();
        assert!(!d.is_loitering(99, Utc::now()));
    }

    #[test]
    fn test_duration_reporting() {
        let mut d = detector();
        let start = Utc::now();
        d.update(1, &big_box(0.0), FRAME_W, FRAME_H, start);
        let later = start + TimeDelta::seconds(42);
        assert!((d.duration(1, later) - 42.0).abs() < 1e-6);
        assert_eq!(d.duration(2, later), 0.0);
    }

    #[test]
    fn test_cleanup_drops_absent_tracks() {
        let mut d = detector();
        let start = Utc::now();
        feed(&mut d, 1, start, 13, 1.0, |_| big_box(0.0));
        d.cleanup(&HashSet::new());
        assert!(!d.is_loitering(1, start + TimeDelta::seconds(60)));
    }

    #[test]
    fn test_disabled_detector_never_reports() {
        let mut d = LoiteringDetector::new(&LoiteringConfig {
            enabled: false,
            ..LoiteringConfig::default()
        });
        let start = Utc::now();
        let end = feed(&mut d, 1, start, 15, 2.0, |_| big_box(0.0));
        assert!(!d.is_loitering(1, end));
    }

    #[test]
    fn test_history_is_bounded() {
        let mut d = detector();
        let start = Utc::now();
        feed(&mut d, 1, start, MAX_POSITIONS + 50, 0.1, |_| big_box(0.0));
        assert!(d.positions[&1].len() <= MAX_POSITIONS);
    }
}

//! Alert admission: temporal consistency then deduplication.
//!
//! Fusion proposes a candidate every frame a vehicle's classification
//! warrants an alert. The gate admits one only after the track has been
//! classified identically for N consecutive frames, and then suppresses
//! near-duplicates of the same identity at roughly the same spot.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::alert::event::AlertStatus;
use crate::config::DedupConfig;
use crate::detection::domain::vehicle_detector::VehicleClass;
use crate::shared::bbox::BBox;

/// Consecutive identical classifications required before admission.
pub const DEFAULT_CONSISTENT_FRAMES: usize = 5;

/// Pixel pitch of the coarse dedup grid.
const CELL_SIZE: f64 = 100.0;

/// A proposed alert for one track on one frame.
#[derive(Clone, Debug)]
pub struct AlertCandidate {
    pub track_id: u64,
    pub class: VehicleClass,
    pub bbox: BBox,
    pub status: AlertStatus,
    pub registered: bool,
    pub beacon_mac: Option<String>,
    pub plate: Option<(String, f64)>,
    pub distance_m: Option<f64>,
    pub confidence: f64,
    pub company: Option<String>,
    pub environment_code: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl AlertCandidate {
    /// Stable identity for deduplication: plate, else beacon MAC, else
    /// the track id.
    fn identity(&self) -> String {
        if let Some((plate, _)) = &self.plate {
            return format!("plate:{plate}");
        }
        if let Some(mac) = &self.beacon_mac {
            return format!("mac:{mac}");
        }
        format!("track:{}", self.track_id)
    }

    fn dedup_key(&self) -> DedupKey {
        let (cx, cy) = self.bbox.center();
        DedupKey {
            identity: self.identity(),
            cell: ((cx / CELL_SIZE).floor() as i64, (cy / CELL_SIZE).floor() as i64),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct DedupKey {
    identity: String,
    cell: (i64, i64),
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct Classification {
    status: AlertStatus,
    registered: bool,
}

struct EmittedRecord {
    at: DateTime<Utc>,
    bbox: BBox,
}

pub struct AlertGate {
    consistent_frames: usize,
    time_window_s: f64,
    iou_threshold: f64,
    position_time_window_s: f64,
    streaks: HashMap<u64, (Classification, usize)>,
    emitted: HashMap<DedupKey, EmittedRecord>,
}

impl AlertGate {
    pub fn new(dedup: &DedupConfig, consistent_frames: usize) -> Self {
        Self {
            consistent_frames: consistent_frames.max(1),
            time_window_s: dedup.time_window,
            iou_threshold: dedup.iou_threshold,
            position_time_window_s: dedup.position_time_window,
            streaks: HashMap::new(),
            emitted: HashMap::new(),
        }
    }

    /// Feeds a candidate; `true` means an alert should be emitted now.
    pub fn admit(&mut self, candidate: &AlertCandidate) -> bool {
        if !self.consistent(candidate) {
            return false;
        }
        if self.is_duplicate(candidate) {
            return false;
        }
        self.record(candidate);
        true
    }

    fn consistent(&mut self, candidate: &AlertCandidate) -> bool {
        let classification = Classification {
            status: candidate.status,
            registered: candidate.registered,
        };
        let entry = self
            .streaks
            .entry(candidate.track_id)
            .or_insert((classification, 0));
        if entry.0 == classification {
            entry.1 += 1;
        } else {
            *entry = (classification, 1);
        }
        entry.1 >= self.consistent_frames
    }

    fn is_duplicate(&mut self, candidate: &AlertCandidate) -> bool {
        self.prune(candidate.timestamp);
        let Some(record) = self.emitted.get(&candidate.dedup_key()) else {
            return false;
        };
        let dt = (candidate.timestamp - record.at).as_seconds_f64();
        if dt < self.time_window_s {
            return true;
        }
        dt < self.position_time_window_s && candidate.bbox.iou(&record.bbox) > self.iou_threshold
    }

    fn record(&mut self, candidate: &AlertCandidate) {
        self.emitted.insert(
            candidate.dedup_key(),
            EmittedRecord {
                at: candidate.timestamp,
                bbox: candidate.bbox,
            },
        );
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let horizon = self.time_window_s.max(self.position_time_window_s);
        self.emitted
            .retain(|_, r| (now - r.at).as_seconds_f64() < horizon);
    }

    /// Drops consistency streaks for dead tracks.
    pub fn cleanup(&mut self, active_ids: &HashSet<u64>) {
        self.streaks.retain(|id, _| active_ids.contains(id));
    }
}

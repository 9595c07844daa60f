//! Multi-object tracker with two-stage detection association.
//!
//! Follows the ByteTrack association strategy: high-confidence detections
//! match first, then low-confidence detections are offered to the tracks
//! left unmatched, which recovers occluded or weakly-detected vehicles.
//! Each vehicle class is tracked independently so a loader can never
//! steal an excavator's identity.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::config::TrackingConfig;
use crate::detection::domain::vehicle_detector::{Detection, VehicleClass};
use crate::shared::assignment::min_cost_assignment;
use crate::shared::bbox::BBox;

/// Track lifecycle states. `Removed` tracks never appear in output.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackState {
    /// Freshly born, not yet re-confirmed by a second match.
    Tentative,
    Tracked,
    Lost,
    Removed,
}

/// Per-track view handed to fusion each frame.
#[derive(Clone, Debug)]
pub struct TrackSnapshot {
    pub track_id: u64,
    pub bbox: BBox,
    pub class: VehicleClass,
    pub score: f64,
    pub hits: u32,
    pub processed: bool,
}

#[derive(Clone, Debug)]
struct TrackEntry {
    id: u64,
    class: VehicleClass,
    bbox: BBox,
    score: f64,
    state: TrackState,
    hits: u32,
    time_since_update: u32,
    last_seen_frame: u64,
    processed: bool,
}

impl TrackEntry {
    fn apply(&mut self, det: &Detection, frame_id: u64) {
        self.bbox = det.bbox;
        self.score = det.score;
        self.state = TrackState::Tracked;
        self.hits += 1;
        self.time_since_update = 0;
        self.last_seen_frame = frame_id;
    }
}

/// Two-stage IoU tracker with per-class association.
///
/// Track ids increase monotonically and are never reused; a track's class
/// is fixed at birth.
pub struct ByteTracker {
    track_thresh: f64,
    high_thresh: f64,
    match_thresh: f64,
    track_buffer: u32,
    tracks: Vec<TrackEntry>,
    next_id: u64,
}

impl ByteTracker {
    pub fn new(config: &TrackingConfig) -> Self {
        Self {
            track_thresh: config.track_thresh,
            high_thresh: config.high_thresh,
            match_thresh: config.match_thresh,
            track_buffer: config.track_buffer,
            tracks: Vec::new(),
            next_id: 1,
        }
    }

    /// Processes one frame of detections and returns the currently
    /// tracked vehicles keyed by track id. An empty detection set still
    /// ages every live track.
    pub fn update(
        &mut self,
        detections: &[Detection],
        frame_id: u64,
    ) -> BTreeMap<u64, TrackSnapshot> {
        // Split detections into high / low confidence; discard the rest.
        let mut high: Vec<usize> = Vec::new();
        let mut low: Vec<usize> = Vec::new();
        for (i, det) in detections.iter().enumerate() {
            if det.score >= self.high_thresh {
                high.push(i);
            } else if det.score >= self.track_thresh {
                low.push(i);
            }
        }

        let classes: BTreeSet<VehicleClass> = self
            .tracks
            .iter()
            .filter(|t| t.state != TrackState::Removed)
            .map(|t| t.class)
            .chain(high.iter().chain(low.iter()).map(|&i| detections[i].class))
            .collect();

        for class in classes {
            self.update_class(class, detections, &high, &low, frame_id);
        }

        self.tracks.retain(|t| t.state != TrackState::Removed);

        self.tracks
            .iter()
            .filter(|t| t.time_since_update == 0 && t.state != TrackState::Removed)
            .map(|t| {
                (
                    t.id,
                    TrackSnapshot {
                        track_id: t.id,
                        bbox: t.bbox,
                        class: t.class,
                        score: t.score,
                        hits: t.hits,
                        processed: t.processed,
                    },
                )
            })
            .collect()
    }

    fn update_class(
        &mut self,
        class: VehicleClass,
        detections: &[Detection],
        high: &[usize],
        low: &[usize],
        frame_id: u64,
    ) {
        // Track indices are in insertion order, i.e. ascending track id,
        // which keeps equal-cost assignment deterministic.
        let track_indices: Vec<usize> = self
            .tracks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.class == class && t.state != TrackState::Removed)
            .map(|(i, _)| i)
            .collect();
        let high_indices: Vec<usize> = high
            .iter()
            .copied()
            .filter(|&i| detections[i].class == class)
            .collect();
        let low_indices: Vec<usize> = low
            .iter()
            .copied()
            .filter(|&i| detections[i].class == class)
            .collect();

        // Stage 1: high-confidence detections against all live tracks.
        let (matched_tracks, matched_high) =
            self.associate(&track_indices, &high_indices, detections, frame_id);

        // Stage 2: low-confidence detections against the leftovers. This
        // recovers occluded vehicles without letting weak detections
        // start tracks of their own.
        let remaining: Vec<usize> = track_indices
            .iter()
            .copied()
            .filter(|i| !matched_tracks.contains(i))
            .collect();
        let (matched_tracks_low, _) = self.associate(&remaining, &low_indices, detections, frame_id);

        // Tracks unmatched after both stages age toward removal.
        for &ti in &remaining {
            if matched_tracks_low.contains(&ti) {
                continue;
            }
            let track = &mut self.tracks[ti];
            track.state = TrackState::Lost;
            track.time_since_update += 1;
            if track.time_since_update > self.track_buffer {
                track.state = TrackState::Removed;
            }
        }

        // Unmatched high-confidence detections give birth to new tracks.
        for &di in &high_indices {
            if matched_high.contains(&di) {
                continue;
            }
            let det = &detections[di];
            self.tracks.push(TrackEntry {
                id: self.next_id,
                class: det.class,
                bbox: det.bbox,
                score: det.score,
                state: TrackState::Tentative,
                hits: 1,
                time_since_update: 0,
                last_seen_frame: frame_id,
                processed: false,
            });
            self.next_id += 1;
        }
    }

    /// IoU association between a set of track indices and a set of
    /// detection indices. Returns the matched members of each set.
    fn associate(
        &mut self,
        track_indices: &[usize],
        det_indices: &[usize],
        detections: &[Detection],
        frame_id: u64,
    ) -> (HashSet<usize>, HashSet<usize>) {
        let mut matched_tracks = HashSet::new();
        let mut matched_dets = HashSet::new();
        if track_indices.is_empty() || det_indices.is_empty() {
            return (matched_tracks, matched_dets);
        }

        let costs: Vec<Vec<f64>> = track_indices
            .iter()
            .map(|&ti| {
                det_indices
                    .iter()
                    .map(|&di| 1.0 - self.tracks[ti].bbox.iou(&detections[di].bbox))
                    .collect()
            })
            .collect();

        let max_cost = 1.0 - self.match_thresh;
        for (row, col) in min_cost_assignment(&costs, max_cost) {
            let ti = track_indices[row];
            let di = det_indices[col];
            self.tracks[ti].apply(&detections[di], frame_id);
            matched_tracks.insert(ti);
            matched_dets.insert(di);
        }
        (matched_tracks, matched_dets)
    }

    pub fn mark_processed(&mut self, track_id: u64) {
        if let Some(track) = self.tracks.iter_mut().find(|t| t.id == track_id) {
            track.processed = true;
        }
    }

    /// Ids of all live (non-removed) tracks, including lost ones still
    /// inside the buffer window. Per-track state tables are cleaned
    /// against this set.
    pub fn live_track_ids(&self) -> HashSet<u64> {
        self.tracks
            .iter()
            .filter(|t| t.state != TrackState::Removed)
            .map(|t| t.id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(track_buffer: u32) -> TrackingConfig {
        TrackingConfig {
            track_thresh: 0.3,
            high_thresh: 0.6,
            match_thresh: 0.3,
            track_buffer,
            min_track_confidence: 0.3,
        }
    }

    fn det(x1: f64, y1: f64, x2: f64, y2: f64, score: f64, class: VehicleClass) -> Detection {
        Detection {
            bbox: BBox::new(x1, y1, x2, y2),
            score,
            class,
        }
    }

    fn excavator(x1: f64, y1: f64, x2: f64, y2: f64, score: f64) -> Detection {
        det(x1, y1, x2, y2, score, VehicleClass::Excavator)
    }

    #[test]
    fn test_new_detections_get_unique_monotonic_ids() {
        let mut tracker = ByteTracker::new(&config(5));
        let tracks = tracker.update(
            &[
                excavator(0.0, 0.0, 50.0, 50.0, 0.9),
                excavator(100.0, 100.0, 150.0, 150.0, 0.8),
            ],
            1,
        );
        assert_eq!(tracks.len(), 2);
        let ids: Vec<u64> = tracks.keys().copied().collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_consistent_id_across_frames() {
        let mut tracker = ByteTracker::new(&config(5));
        let t1 = tracker.update(&[excavator(10.0, 10.0, 60.0, 60.0, 0.9)], 1);
        let id = *t1.keys().next().unwrap();

        let t2 = tracker.update(&[excavator(12.0, 12.0, 62.0, 62.0, 0.9)], 2);
        assert_eq!(t2.len(), 1);
        assert!(t2.contains_key(&id));
        assert_eq!(t2[&id].hits, 2);
    }

    #[test]
    fn test_lost_track_removed_after_buffer() {
        let mut tracker = ByteTracker::new(&config(2));
        tracker.update(&[excavator(10.0, 10.0, 60.0, 60.0, 0.9)], 1);

        for frame in 2..=4 {
            let out = tracker.update(&[], frame);
            assert!(out.is_empty());
        }
        // time_since_update exceeded track_buffer=2 on the third miss.
        assert!(tracker.live_track_ids().is_empty());
    }

    #[test]
    fn test_track_survives_within_buffer_and_reattaches() {
        let mut tracker = ByteTracker::new(&config(3));
        let t1 = tracker.update(&[excavator(10.0, 10.0, 60.0, 60.0, 0.9)], 1);
        let id = *t1.keys().next().unwrap();

        tracker.update(&[], 2);
        tracker.update(&[], 3);

        let t2 = tracker.update(&[excavator(12.0, 12.0, 62.0, 62.0, 0.9)], 4);
        assert_eq!(t2.len(), 1);
        assert!(t2.contains_key(&id));
    }

    #[test]
    fn test_low_confidence_matches_existing_track() {
        let mut tracker = ByteTracker::new(&config(5));
        let t1 = tracker.update(&[excavator(10.0, 10.0, 60.0, 60.0, 0.9)], 1);
        let id = *t1.keys().next().unwrap();

        // Second stage recovers the track from a weak detection.
        let t2 = tracker.update(&[excavator(12.0, 12.0, 62.0, 62.0, 0.4)], 2);
        assert_eq!(t2.len(), 1);
        assert!(t2.contains_key(&id));
    }

    #[test]
    fn test_low_confidence_does_not_start_new_track() {
        let mut tracker = ByteTracker::new(&config(5));
        let t = tracker.update(&[excavator(10.0, 10.0, 60.0, 60.0, 0.4)], 1);
        assert!(t.is_empty());
    }

    #[test]
    fn test_below_track_thresh_discarded_entirely() {
        let mut tracker = ByteTracker::new(&config(5));
        tracker.update(&[excavator(10.0, 10.0, 60.0, 60.0, 0.9)], 1);
        // 0.2 < track_thresh: not even usable for stage 2.
        let t = tracker.update(&[excavator(12.0, 12.0, 62.0, 62.0, 0.2)], 2);
        assert!(t.is_empty());
    }

    #[test]
    fn test_classes_tracked_independently() {
        let mut tracker = ByteTracker::new(&config(5));
        let t1 = tracker.update(
            &[
                excavator(10.0, 10.0, 60.0, 60.0, 0.9),
                det(10.0, 10.0, 60.0, 60.0, 0.9, VehicleClass::Car),
            ],
            1,
        );
        // Same box, different classes: two tracks.
        assert_eq!(t1.len(), 2);

        // A car detection at the excavator's position must not steal it.
        let t2 = tracker.update(&[det(11.0, 11.0, 61.0, 61.0, 0.9, VehicleClass::Car)], 2);
        assert_eq!(t2.len(), 1);
        assert_eq!(t2.values().next().unwrap().class, VehicleClass::Car);
    }

    #[test]
    fn test_class_fixed_at_birth() {
        let mut tracker = ByteTracker::new(&config(5));
        let t1 = tracker.update(&[excavator(0.0, 0.0, 50.0, 50.0, 0.9)], 1);
        let id = *t1.keys().next().unwrap();
        for frame in 2..10 {
            let out = tracker.update(&[excavator(0.0, 0.0, 50.0, 50.0, 0.9)], frame);
            assert_eq!(out[&id].class, VehicleClass::Excavator);
        }
    }

    #[test]
    fn test_optimal_association_prefers_global_minimum() {
        let mut tracker = ByteTracker::new(&config(5));
        tracker.update(
            &[
                excavator(0.0, 0.0, 100.0, 100.0, 0.9),
                excavator(80.0, 0.0, 180.0, 100.0, 0.9),
            ],
            1,
        );
        // Both detections overlap both tracks; each must keep its own.
        let t2 = tracker.update(
            &[
                excavator(5.0, 0.0, 105.0, 100.0, 0.9),
                excavator(85.0, 0.0, 185.0, 100.0, 0.9),
            ],
            2,
        );
        assert_eq!(t2.len(), 2);
        let boxes: Vec<f64> = t2.values().map(|t| t.bbox.x1).collect();
        assert!(boxes.contains(&5.0) && boxes.contains(&85.0));
    }

    #[test]
    fn test_mark_processed_round_trip() {
        let mut tracker = ByteTracker::new(&config(5));
        let t1 = tracker.update(&[excavator(0.0, 0.0, 50.0, 50.0, 0.9)], 1);
        let id = *t1.keys().next().unwrap();
        assert!(!t1[&id].processed);

        tracker.mark_processed(id);
        let t2 = tracker.update(&[excavator(1.0, 1.0, 51.0, 51.0, 0.9)], 2);
        assert!(t2[&id].processed);
    }

    #[test]
    fn test_ids_never_reused_after_removal() {
        let mut tracker = ByteTracker::new(&config(1));
        tracker.update(&[excavator(0.0, 0.0, 50.0, 50.0, 0.9)], 1);
        tracker.update(&[], 2);
        tracker.update(&[], 3);
        assert!(tracker.live_track_ids().is_empty());

        let t = tracker.update(&[excavator(0.0, 0.0, 50.0, 50.0, 0.9)], 4);
        let new_id = *t.keys().next().unwrap();
        assert!(new_id > 1);
    }

    #[test]
    fn test_lost_track_not_in_output_while_buffered() {
        let mut tracker = ByteTracker::new(&config(10));
        tracker.update(&[excavator(0.0, 0.0, 50.0, 50.0, 0.9)], 1);
        let out = tracker.update(&[], 2);
        assert!(out.is_empty());
        // Still live, just lost.
        assert_eq!(tracker.live_track_ids().len(), 1);
    }
}

//! Per-frame fusion of tracks, depth, beacons and plate recognition.
//!
//! The engine owns every per-track state table (depth history, beacon
//! locks, best-frame state, position history, vehicle state) and is
//! driven single-threadedly by the pipeline. Recognition work leaves as
//! ROI requests; results come back through `apply_plate_result`.

use std::collections::{BTreeMap, HashMap, HashSet};

use log::debug;

use crate::alert::event::AlertStatus;
use crate::alert::gate::AlertCandidate;
use crate::beacon::domain::scanner::BeaconReading;
use crate::beacon::match_tracker::BeaconMatchTracker;
use crate::beacon::matcher::{BeaconMatcher, VehicleObservation};
use crate::beacon::whitelist::Whitelist;
use crate::config::Config;
use crate::depth::domain::depth_reader::DepthReader;
use crate::depth::smoother::DepthSmoother;
use crate::detection::domain::vehicle_detector::ClassGroup;
use crate::detection::infrastructure::byte_tracker::TrackSnapshot;
use crate::fusion::loitering::LoiteringDetector;
use crate::fusion::vehicle_state::VehicleState;
use crate::lpr::best_frame::BestFrameSelector;
use crate::lpr::domain::plate_recognizer::RoiImage;
use crate::shared::frame::Frame;

/// What one fused frame produced.
#[derive(Default)]
pub struct FrameOutcome {
    /// Alert proposals for the gate, in ascending track order.
    pub candidates: Vec<AlertCandidate>,
    /// Plate-recognition jobs to hand to the worker pool.
    pub roi_requests: Vec<(u64, RoiImage)>,
}

pub struct FusionEngine {
    min_track_confidence: f64,
    loiter_enabled: bool,
    loiter_unregistered_only: bool,
    smoothing_enabled: bool,
    depth_smoother: DepthSmoother,
    matcher: BeaconMatcher,
    lock_tracker: BeaconMatchTracker,
    best_frame: BestFrameSelector,
    loitering: LoiteringDetector,
    states: HashMap<u64, VehicleState>,
}

impl FusionEngine {
    pub fn new(config: &Config) -> Self {
        Self {
            min_track_confidence: config.tracking.min_track_confidence,
            loiter_enabled: config.alert.loitering.enabled,
            loiter_unregistered_only: config.alert.loitering.apply_to_unregistered_only,
            smoothing_enabled: config.depth.smoothing.enabled,
            depth_smoother: DepthSmoother::new(&config.depth.smoothing),
            matcher: BeaconMatcher::new(&config.beacon_match.multi_target),
            lock_tracker: BeaconMatchTracker::new(&config.beacon_match.temporal_consistency),
            best_frame: BestFrameSelector::new(&config.lpr.best_frame_selection),
            loitering: LoiteringDetector::new(&config.alert.loitering),
            states: HashMap::new(),
        }
    }

    /// Fuses one frame. Tracks arrive from the tracker, readings from
    /// the beacon scanner, and the whitelist is the current cloud
    /// snapshot.
    pub fn process_frame(
        &mut self,
        tracks: &BTreeMap<u64, TrackSnapshot>,
        frame: &Frame,
        readings: &[BeaconReading],
        whitelist: &Whitelist,
        depth_reader: &dyn DepthReader,
    ) -> FrameOutcome {
        let now = frame.captured_at();
        let mut outcome = FrameOutcome::default();

        // Per-track bookkeeping: positions and depth.
        for (&track_id, track) in tracks {
            if track.score < self.min_track_confidence {
                continue;
            }
            self.loitering
                .update(track_id, &track.bbox, frame.width(), frame.height(), now);

            let raw = depth_reader.measure(frame, &track.bbox).map(|s| s.raw_m);
            let smoothed = if self.smoothing_enabled {
                self.depth_smoother.update(track_id, raw)
            } else {
                raw
            };

            let state = self
                .states
                .entry(track_id)
                .or_insert_with(|| VehicleState::new(track_id, track.class, now));
            state.confidence = track.score;
            if smoothed.is_some() {
                state.distance_m = smoothed;
            }
        }

        self.match_beacons(tracks, readings, whitelist);
        self.run_best_frame(tracks, frame, &mut outcome);
        self.emit_candidates(tracks, now, &mut outcome);
        outcome
    }

    /// Class-partitioned beacon assignment with the lock tracker on top.
    fn match_beacons(
        &mut self,
        tracks: &BTreeMap<u64, TrackSnapshot>,
        readings: &[BeaconReading],
        whitelist: &Whitelist,
    ) {
        self.matcher.observe(readings);

        let mut unlocked: Vec<VehicleObservation> = Vec::new();
        let mut locked: Vec<u64> = Vec::new();
        for (&track_id, track) in tracks {
            if track.class.group() != ClassGroup::Construction
                || track.score < self.min_track_confidence
            {
                continue;
            }
            if self.lock_tracker.is_locked(track_id) {
                locked.push(track_id);
            } else {
                unlocked.push(VehicleObservation {
                    track_id,
                    class: track.class,
                    depth_m: self
                        .states
                        .get(&track_id)
                        .and_then(|s| s.distance_m),
                });
            }
        }

        // Locked tracks keep their beacon regardless of this frame.
        for track_id in locked {
            let mac = self.lock_tracker.update(track_id, None, None, None);
            self.apply_lock(track_id, mac, whitelist);
        }

        for result in self.matcher.match_vehicles(&unlocked, readings, whitelist) {
            let (mac, distance, cost) = match &result.matched {
                Some(m) => (Some(m.mac.as_str()), Some(m.distance_m), Some(m.cost)),
                None => (None, None, None),
            };
            let locked_mac = self
                .lock_tracker
                .update(result.track_id, mac, distance, cost);
            self.apply_lock(result.track_id, locked_mac, whitelist);
        }
    }

    fn apply_lock(&mut self, track_id: u64, mac: Option<String>, whitelist: &Whitelist) {
        let Some(mac) = mac else {
            return;
        };
        let Some(state) = self.states.get_mut(&track_id) else {
            return;
        };
        if state.beacon_mac.as_deref() == Some(mac.as_str()) && state.registered {
            return;
        }
        match whitelist.get(&mac) {
            Some(entry) => {
                debug!("track {track_id} registered via beacon {mac}");
                state.beacon_mac = Some(mac);
                state.registered = true;
                state.company = entry.equipment_owner.clone();
                state.environment_code = Some(entry.environment_code.clone());
            }
            None => {
                // Locked to a beacon that has since left the whitelist:
                // keep the lock, but registration no longer holds.
                state.beacon_mac = Some(mac);
                state.registered = false;
            }
        }
    }

    /// Offers civilian crops to the best-frame selector.
    fn run_best_frame(
        &mut self,
        tracks: &BTreeMap<u64, TrackSnapshot>,
        frame: &Frame,
        outcome: &mut FrameOutcome,
    ) {
        for (&track_id, track) in tracks {
            if track.class.group() != ClassGroup::Civilian
                || track.score < self.min_track_confidence
            {
                continue;
            }
            let b = &track.bbox;
            let Some((data, w, h)) = frame.crop(
                b.x1.max(0.0) as u32,
                b.y1.max(0.0) as u32,
                b.width() as u32,
                b.height() as u32,
            ) else {
                continue;
            };
            let roi = RoiImage {
                data,
                width: w,
                height: h,
            };
            let distance = self.states.get(&track_id).and_then(|s| s.distance_m);
            if let Some(selected) = self.best_frame.should_trigger(
                track_id,
                b,
                roi,
                track.score,
                frame.width(),
                frame.height(),
                distance,
            ) {
                outcome.roi_requests.push((track_id, selected));
            }
        }
    }

    fn emit_candidates(
        &mut self,
        tracks: &BTreeMap<u64, TrackSnapshot>,
        now: chrono::DateTime<chrono::Utc>,
        outcome: &mut FrameOutcome,
    ) {
        for (&track_id, track) in tracks {
            if track.score < self.min_track_confidence {
                continue;
            }
            let Some(state) = self.states.get(&track_id) else {
                continue;
            };

            let status = match track.class.group() {
                ClassGroup::Construction => {
                    if state.registered {
                        AlertStatus::Registered
                    } else {
                        AlertStatus::Unregistered
                    }
                }
                ClassGroup::Civilian => {
                    if state.plate.is_some() {
                        AlertStatus::Identified
                    } else {
                        continue; // alerts only once a plate is read
                    }
                }
            };

            if state.reported_status == Some(status) {
                continue;
            }

            if track.class.group() == ClassGroup::Construction {
                let needs_loiter = self.loiter_enabled
                    && (status == AlertStatus::Unregistered || !self.loiter_unregistered_only);
                if needs_loiter && !self.loitering.is_loitering(track_id, now) {
                    continue;
                }
            }

            let distance_m = state
                .distance_m
                .or_else(|| self.lock_tracker.locked_distance(track_id));
            outcome.candidates.push(AlertCandidate {
                track_id,
                class: track.class,
                bbox: track.bbox,
                status,
                registered: state.registered,
                beacon_mac: state.beacon_mac.clone(),
                plate: state.plate.clone(),
                distance_m,
                confidence: state.confidence,
                company: state.company.clone(),
                environment_code: state.environment_code.clone(),
                timestamp: now,
            });
        }
    }

    /// The worker pool rejected a recognition job (queue full); allow
    /// the track to trigger again later.
    pub fn plate_job_dropped(&mut self, track_id: u64) {
        self.best_frame.cancel_pending(track_id);
    }

    /// Applies a completed plate recognition from the worker pool.
    pub fn apply_plate_result(&mut self, track_id: u64, plate: Option<(String, f64)>) {
        self.best_frame.on_complete(track_id, plate.clone());
        if let Some(state) = self.states.get_mut(&track_id) {
            if plate.is_some() {
                state.plate = plate;
            }
        }
    }

    /// Marks a status as reported so the track stops proposing it.
    pub fn mark_reported(&mut self, track_id: u64, status: AlertStatus) {
        if let Some(state) = self.states.get_mut(&track_id) {
            state.reported_status = Some(status);
        }
    }

    /// Records where a track's latest snapshot landed on disk.
    pub fn record_snapshot(&mut self, track_id: u64, path: String) {
        if let Some(state) = self.states.get_mut(&track_id) {
            state.last_snapshot_path = Some(path);
        }
    }

    pub fn state(&self, track_id: u64) -> Option<&VehicleState> {
        self.states.get(&track_id)
    }

    /// Drops every per-track table entry whose track is gone.
    pub fn cleanup(&mut self, live_ids: &HashSet<u64>) {
        self.depth_smoother.cleanup(live_ids);
        self.lock_tracker.cleanup(live_ids);
        self.best_frame.cleanup(live_ids);
        self.loitering.cleanup(live_ids);
        self.states.retain(|id, _| live_ids.contains(id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beacon::whitelist::WhitelistEntry;
    use crate::depth::domain::depth_reader::DepthSample;
    use crate::detection::domain::vehicle_detector::VehicleClass;
    use crate::shared::bbox::BBox;
    use chrono::Utc;
    use std::time::Instant;

    const MAC_1: &str = "AA:BB:CC:DD:EE:01";
    const MAC_2: &str = "AA:BB:CC:DD:EE:02";
    const W: u32 = 192;
    const H: u32 = 108;

    /// Depth keyed off the bbox's left edge, letting one stub serve
    /// several tracks at known distances.
    struct EdgeKeyedDepth(Vec<(f64, f64)>);

    impl DepthReader for EdgeKeyedDepth {
        fn measure(&self, _frame: &Frame, bbox: &BBox) -> Option<DepthSample> {
            self.0
                .iter()
                .find(|(x1, _)| (bbox.x1 - x1).abs() < 1.0)
                .map(|(_, depth)| DepthSample {
                    raw_m: *depth,
                    confidence: 1.0,
                })
        }
    }

    fn frame(index: u64) -> Frame {
        Frame::new(vec![100u8; (W * H * 3) as usize], Vec::new(), W, H, index, Utc::now())
    }

    fn track(track_id: u64, class: VehicleClass, x1: f64) -> (u64, TrackSnapshot) {
        (
            track_id,
            TrackSnapshot {
                track_id,
                bbox: BBox::new(x1, 20.0, x1 + 60.0, 80.0),
                class,
                score: 0.9,
                hits: 3,
                processed: false,
            },
        )
    }

    fn reading(mac: &str, distance_m: f64) -> BeaconReading {
        BeaconReading {
            mac: mac.into(),
            rssi: -65.0,
            distance_m,
            observed_at: Instant::now(),
        }
    }

    fn whitelist(macs: &[&str]) -> Whitelist {
        Whitelist::from_entries(
            macs.iter()
                .enumerate()
                .map(|(i, mac)| WhitelistEntry {
                    id: i as i64 + 1,
                    beacon_number: i as i64 + 1,
                    mac_address: (*mac).into(),
                    machine_type: "excavator".into(),
                    environment_code: "E-1".into(),
                    registration_date: "2025-01-01".into(),
                    equipment_owner: Some("Acme".into()),
                })
                .collect(),
        )
    }

    fn engine_without_loitering() -> FusionEngine {
        let mut config = Config::default();
        config.alert.loitering.enabled = false;
        FusionEngine::new(&config)
    }

    #[test]
    fn test_two_excavators_one_beacon() {
        let mut engine = engine_without_loitering();
        let wl = whitelist(&[MAC_1]);
        let depth = EdgeKeyedDepth(vec![(10.0, 5.10), (110.0, 9.80)]);
        let tracks: BTreeMap<u64, TrackSnapshot> = [
            track(1, VehicleClass::Excavator, 10.0),
            track(2, VehicleClass::Excavator, 110.0),
        ]
        .into_iter()
        .collect();
        let readings = [reading(MAC_1, 5.05)];

        let mut last = FrameOutcome::default();
        for i in 0..5 {
            last = engine.process_frame(&tracks, &frame(i), &readings, &wl, &depth);
        }

        // The nearer excavator locked the beacon on the fifth frame.
        let registered: Vec<_> = last
            .candidates
            .iter()
            .filter(|c| c.status == AlertStatus::Registered)
            .collect();
        assert_eq!(registered.len(), 1);
        assert_eq!(registered[0].track_id, 1);
        assert_eq!(registered[0].beacon_mac.as_deref(), Some(MAC_1));
        assert_eq!(registered[0].environment_code.as_deref(), Some("E-1"));

        let unregistered: Vec<_> = last
            .candidates
            .iter()
            .filter(|c| c.status == AlertStatus::Unregistered)
            .collect();
        assert_eq!(unregistered.len(), 1);
        assert_eq!(unregistered[0].track_id, 2);
    }

    #[test]
    fn test_flicker_robust_lock() {
        let mut engine = engine_without_loitering();
        let wl = whitelist(&[MAC_1, MAC_2]);
        let depth = EdgeKeyedDepth(vec![(10.0, 5.1)]);
        let tracks: BTreeMap<u64, TrackSnapshot> =
            [track(1, VehicleClass::Excavator, 10.0)].into_iter().collect();

        // Alternating beacons: no lock may form.
        for i in 0..10 {
            let readings = if i % 2 == 0 {
                [reading(MAC_1, 5.0)]
            } else {
                [reading(MAC_2, 7.0)]
            };
            engine.process_frame(&tracks, &frame(i), &readings, &wl, &depth);
        }
        assert!(!engine.state(1).unwrap().registered);

        // Five clean frames of the near beacon lock it.
        for i in 10..15 {
            engine.process_frame(&tracks, &frame(i), &[reading(MAC_1, 5.0)], &wl, &depth);
        }
        let state = engine.state(1).unwrap();
        assert!(state.registered);
        assert_eq!(state.beacon_mac.as_deref(), Some(MAC_1));

        // A complete scanner miss still reports the locked beacon.
        let out = engine.process_frame(&tracks, &frame(15), &[], &wl, &depth);
        let candidate = out
            .candidates
            .iter()
            .find(|c| c.track_id == 1)
            .expect("registered candidate");
        assert_eq!(candidate.beacon_mac.as_deref(), Some(MAC_1));
        assert_eq!(candidate.status, AlertStatus::Registered);
    }

    #[test]
    fn test_registered_candidate_stops_after_mark_reported() {
        let mut engine = engine_without_loitering();
        let wl = whitelist(&[MAC_1]);
        let depth = EdgeKeyedDepth(vec![(10.0, 5.0)]);
        let tracks: BTreeMap<u64, TrackSnapshot> =
            [track(1, VehicleClass::Excavator, 10.0)].into_iter().collect();

        for i in 0..6 {
            engine.process_frame(&tracks, &frame(i), &[reading(MAC_1, 5.0)], &wl, &depth);
        }
        engine.mark_reported(1, AlertStatus::Registered);
        let out = engine.process_frame(&tracks, &frame(6), &[reading(MAC_1, 5.0)], &wl, &depth);
        assert!(out.candidates.is_empty());
    }

    #[test]
    fn test_civilian_best_frame_reuse_and_identified_alert() {
        let mut engine = engine_without_loitering();
        let wl = whitelist(&[]);
        let depth = EdgeKeyedDepth(vec![(66.0, 2.5), (5.0, 9.0)]);

        // Small corner box: low quality, recognition waits.
        let far: BTreeMap<u64, TrackSnapshot> = [(
            1u64,
            TrackSnapshot {
                track_id: 1,
                bbox: BBox::new(5.0, 5.0, 20.0, 15.0),
                class: VehicleClass::Car,
                score: 0.6,
                hits: 2,
                processed: false,
            },
        )]
        .into_iter()
        .collect();
        let out = engine.process_frame(&far, &frame(0), &[], &wl, &depth);
        assert!(out.roi_requests.is_empty());
        assert!(out.candidates.is_empty());

        // Large centred box: quality clears the threshold, one job.
        let near: BTreeMap<u64, TrackSnapshot> = [(
            1u64,
            TrackSnapshot {
                track_id: 1,
                bbox: BBox::new(66.0, 24.0, 146.0, 84.0),
                class: VehicleClass::Car,
                score: 0.9,
                hits: 5,
                processed: false,
            },
        )]
        .into_iter()
        .collect();
        let out = engine.process_frame(&near, &frame(1), &[], &wl, &depth);
        assert_eq!(out.roi_requests.len(), 1);
        assert_eq!(out.roi_requests[0].0, 1);

        // While pending, later frames do not re-trigger.
        let out = engine.process_frame(&near, &frame(2), &[], &wl, &depth);
        assert!(out.roi_requests.is_empty());

        engine.apply_plate_result(1, Some(("京A12345".into(), 0.95)));

        // Result reused, no new jobs; identified candidate appears.
        let out = engine.process_frame(&near, &frame(3), &[], &wl, &depth);
        assert!(out.roi_requests.is_empty());
        assert_eq!(out.candidates.len(), 1);
        let c = &out.candidates[0];
        assert_eq!(c.status, AlertStatus::Identified);
        assert_eq!(c.plate.as_ref().unwrap().0, "京A12345");
    }

    #[test]
    fn test_unregistered_requires_loitering_when_enabled() {
        let mut config = Config::default();
        config.alert.loitering.min_duration = 3600.0; // effectively never
        let mut engine = FusionEngine::new(&config);
        let wl = whitelist(&[]);
        let depth = EdgeKeyedDepth(vec![(10.0, 5.0)]);
        let tracks: BTreeMap<u64, TrackSnapshot> =
            [track(1, VehicleClass::Excavator, 10.0)].into_iter().collect();

        for i in 0..20 {
            let out = engine.process_frame(&tracks, &frame(i), &[], &wl, &depth);
            assert!(out.candidates.is_empty());
        }
    }

    #[test]
    fn test_cleanup_clears_dead_tracks() {
        let mut engine = engine_without_loitering();
        let wl = whitelist(&[MAC_1]);
        let depth = EdgeKeyedDepth(vec![(10.0, 5.0)]);
        let tracks: BTreeMap<u64, TrackSnapshot> =
            [track(1, VehicleClass::Excavator, 10.0)].into_iter().collect();
        for i in 0..5 {
            engine.process_frame(&tracks, &frame(i), &[reading(MAC_1, 5.0)], &wl, &depth);
        }
        assert!(engine.state(1).is_some());

        engine.cleanup(&HashSet::new());
        assert!(engine.state(1).is_none());
    }
}

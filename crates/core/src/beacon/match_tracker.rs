//! Temporal-consistency lock-in for vehicle-beacon pairings.
//!
//! A single good frame is not enough to call a vehicle registered:
//! radio flicker would produce blinking identities. A beacon only locks
//! to a track after `min_consistent_frames` consecutive accepted matches
//! name the same MAC with a bounded distance spread, and once locked the
//! pairing holds for the track's remaining life.

use std::collections::{HashMap, HashSet};

use log::info;

use crate::config::TemporalConsistencyConfig;

/// EMA coefficient for refreshing the locked distance.
const DISTANCE_ALPHA: f64 = 0.7;

#[derive(Clone, Debug)]
struct MatchRecord {
    mac: String,
    distance_m: Option<f64>,
}

#[derive(Clone, Debug, Default)]
struct MatchHistory {
    records: Vec<MatchRecord>,
    locked_mac: Option<String>,
    locked_distance_m: Option<f64>,
}

/// Per-track beacon match tracker.
pub struct BeaconMatchTracker {
    min_consistent_frames: usize,
    max_distance_error: f64,
    reset_on_track_end: bool,
    histories: HashMap<u64, MatchHistory>,
}

impl BeaconMatchTracker {
    pub fn new(config: &TemporalConsistencyConfig) -> Self {
        Self {
            min_consistent_frames: config.min_consistent_frames.max(1),
            max_distance_error: config.max_distance_error,
            reset_on_track_end: config.reset_on_track_end,
            histories: HashMap::new(),
        }
    }

    /// Feeds this frame's match outcome for a track and returns the
    /// locked MAC, if any.
    ///
    /// Once locked, the locked MAC is returned regardless of the current
    /// match — including complete misses. Unlocked tracks accumulate
    /// accepted matches (misses are skipped) until the lock condition
    /// holds.
    pub fn update(
        &mut self,
        track_id: u64,
        mac: Option<&str>,
        distance_m: Option<f64>,
        _cost: Option<f64>,
    ) -> Option<String> {
        let max_records = (self.min_consistent_frames * 4).max(20);
        let history = self.histories.entry(track_id).or_default();

        if let Some(locked) = history.locked_mac.clone() {
            if mac == Some(locked.as_str()) {
                if let Some(d) = distance_m {
                    history.locked_distance_m = Some(match history.locked_distance_m {
                        Some(prev) => DISTANCE_ALPHA * prev + (1.0 - DISTANCE_ALPHA) * d,
                        None => d,
                    });
                }
            }
            return Some(locked);
        }

        let mac = mac?;
        history.records.push(MatchRecord {
            mac: mac.to_string(),
            distance_m,
        });
        if history.records.len() > max_records {
            history.records.remove(0);
        }

        if let Some((mac, distance)) = self.consistent_match(track_id) {
            let history = self.histories.entry(track_id).or_default();
            history.locked_mac = Some(mac.clone());
            history.locked_distance_m = distance;
            info!(
                "track {track_id} locked beacon {mac} after {} consistent frames",
                self.min_consistent_frames
            );
            return Some(mac);
        }
        None
    }

    /// Checks the lock condition on the most recent records: the last
    /// `min_consistent_frames` must all name one MAC and their known
    /// distances must span at most `max_distance_error` metres. Returns
    /// the MAC and the mean of the known distances.
    fn consistent_match(&self, track_id: u64) -> Option<(String, Option<f64>)> {
        let history = self.histories.get(&track_id)?;
        if history.records.len() < self.min_consistent_frames {
            return None;
        }
        let window = &history.records[history.records.len() - self.min_consistent_frames..];

        let mac = &window[0].mac;
        if window.iter().any(|r| &r.mac != mac) {
            return None;
        }

        let distances: Vec<f64> = window.iter().filter_map(|r| r.distance_m).collect();
        if distances.len() > 1 {
            let min = distances.iter().cloned().fold(f64::INFINITY, f64::min);
            let max = distances.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            if max - min > self.max_distance_error {
                return None;
            }
        }
        let mean = if distances.is_empty() {
            None
        } else {
            Some(distances.iter().sum::<f64>() / distances.len() as f64)
        };
        Some((mac.clone(), mean))
    }

    pub fn locked_mac(&self, track_id: u64) -> Option<&str> {
        self.histories
            .get(&track_id)
            .and_then(|h| h.locked_mac.as_deref())
    }

    pub fn locked_distance(&self, track_id: u64) -> Option<f64> {
        self.histories.get(&track_id).and_then(|h| h.locked_distance_m)
    }

    pub fn is_locked(&self, track_id: u64) -> bool {
        self.locked_mac(track_id).is_some()
    }

    pub fn reset(&mut self, track_id: u64) {
        self.histories.remove(&track_id);
    }

    /// Drops state for tracks no longer alive.
    pub fn cleanup(&mut self, active_ids: &HashSet<u64>) {
        if !self.reset_on_track_end {
            return;
        }
        self.histories.retain(|id, _| active_ids.contains(id));
    }
}

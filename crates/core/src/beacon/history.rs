use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::beacon::domain::scanner::BeaconReading;

/// Max samples retained per beacon.
const HISTORY_SIZE: usize = 100;

/// RSSI standard deviation (dBm) at which a beacon counts as fully
/// unstable.
const RSSI_STD_CEILING: f64 = 10.0;

/// Distance standard deviation (metres) at which a beacon counts as
/// fully unstable.
const DISTANCE_STD_CEILING: f64 = 2.0;

#[derive(Clone, Copy, Debug)]
struct Sample {
    at: Instant,
    rssi: f64,
    distance_m: f64,
}

/// Bounded per-beacon RSSI/distance history used to penalise flickering
/// signals during vehicle-beacon assignment.
#[derive(Default)]
pub struct BeaconHistoryTable {
    samples: HashMap<String, VecDeque<Sample>>,
}

impl BeaconHistoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one scanner snapshot.
    pub fn observe(&mut self, readings: &[BeaconReading]) {
        for reading in readings {
            let history = self.samples.entry(reading.mac.clone()).or_default();
            history.push_back(Sample {
                at: reading.observed_at,
                rssi: reading.rssi,
                distance_m: reading.distance_m,
            });
            if history.len() > HISTORY_SIZE {
                history.pop_front();
            }
        }
    }

    /// Time-stability penalty in [0, 1] over the recent `window`.
    ///
    /// The penalty is the larger of the normalised RSSI and distance
    /// standard deviations; a spread above 10 dBm or 2 m saturates to
    /// 1.0. Beacons with fewer than two samples in the window are not
    /// penalised.
    pub fn stability_penalty(&self, mac: &str, window: Duration) -> f64 {
        let Some(history) = self.samples.get(mac) else {
            return 0.0;
        };
        let now = Instant::now();
        let recent: Vec<&Sample> = history
            .iter()
            .filter(|s| now.duration_since(s.at) <= window)
            .collect();
        if recent.len() < 2 {
            return 0.0;
        }

        let rssi_std = std_dev(recent.iter().map(|s| s.rssi));
        let rssi_penalty = (rssi_std / RSSI_STD_CEILING).min(1.0);

        let distances: Vec<f64> = recent
            .iter()
            .map(|s| s.distance_m)
            .filter(|d| *d > 0.0)
            .collect();
        let dist_penalty = if distances.len() < 2 {
            0.0
        } else {
            (std_dev(distances.iter().copied()) / DISTANCE_STD_CEILING).min(1.0)
        };

        rssi_penalty.max(dist_penalty)
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

fn std_dev(values: impl Iterator<Item = f64>) -> f64 {
    let values: Vec<f64> = values.collect();
    let n = values.len() as f64;
    if n < 2.0 {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    variance.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn reading(mac: &str, rssi: f64, distance_m: f64) -> BeaconReading {
        BeaconReading {
            mac: mac.into(),
            rssi,
            distance_m,
            observed_at: Instant::now(),
        }
    }

    const WINDOW: Duration = Duration::from_secs(3);

    #[test]
    fn test_unknown_mac_not_penalised() {
        let table = BeaconHistoryTable::new();
        assert_relative_eq!(table.stability_penalty("AA:BB:CC:DD:EE:01", WINDOW), 0.0);
    }

    #[test]
    fn test_single_sample_not_penalised() {
        let mut table = BeaconHistoryTable::new();
        table.observe(&[reading("AA:BB:CC:DD:EE:01", -60.0, 5.0)]);
        assert_relative_eq!(table.stability_penalty("AA:BB:CC:DD:EE:01", WINDOW), 0.0);
    }

    #[test]
    fn test_steady_signal_has_low_penalty() {
        let mut table = BeaconHistoryTable::new();
        for _ in 0..5 {
            table.observe(&[reading("AA:BB:CC:DD:EE:01", -60.0, 5.0)]);
        }
        assert_relative_eq!(table.stability_penalty("AA:BB:CC:DD:EE:01", WINDOW), 0.0);
    }

    #[test]
    fn test_wild_rssi_saturates_to_one() {
        let mut table = BeaconHistoryTable::new();
        for rssi in [-40.0, -80.0, -45.0, -85.0] {
            table.observe(&[reading("AA:BB:CC:DD:EE:01", rssi, 5.0)]);
        }
        assert_relative_eq!(table.stability_penalty("AA:BB:CC:DD:EE:01", WINDOW), 1.0);
    }

    #[test]
    fn test_unstable_distance_penalised() {
        let mut table = BeaconHistoryTable::new();
        for d in [2.0, 9.0, 2.5, 8.5] {
            table.observe(&[reading("AA:BB:CC:DD:EE:01", -60.0, d)]);
        }
        assert_relative_eq!(table.stability_penalty("AA:BB:CC:DD:EE:01", WINDOW), 1.0);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut table = BeaconHistoryTable::new();
        for i in 0..(HISTORY_SIZE + 50) {
            table.observe(&[reading("AA:BB:CC:DD:EE:01", -60.0 - (i % 3) as f64, 5.0)]);
        }
        assert!(table.samples["AA:BB:CC:DD:EE:01"].len() <= HISTORY_SIZE);
    }
}

use std::time::{Duration, Instant};

/// Transmit power (dBm at 1 m) assumed for fleet beacons.
pub const DEFAULT_TX_POWER: f64 = -59.0;

/// Outdoor path-loss exponent.
pub const DEFAULT_PATH_LOSS_EXPONENT: f64 = 2.5;

/// One Bluetooth beacon observation.
#[derive(Clone, Debug)]
pub struct BeaconReading {
    /// Canonical uppercase colon-separated MAC.
    pub mac: String,
    /// Received signal strength in dBm.
    pub rssi: f64,
    /// Estimated distance in metres, derived from RSSI.
    pub distance_m: f64,
    pub observed_at: Instant,
}

/// Domain interface over the Bluetooth scanner.
///
/// `snapshot` returns the readings observed within `max_age`; an
/// unavailable scanner returns an empty snapshot and vehicles correctly
/// degrade to "unregistered".
pub trait BeaconScanner: Send {
    fn snapshot(&self, max_age: Duration) -> Vec<BeaconReading>;

    fn is_available(&self) -> bool {
        true
    }
}

/// Estimates distance from RSSI with the log-distance path-loss model:
/// `d = 10 ^ ((tx_power - rssi) / (10 * n))`.
///
/// Returns `None` for an RSSI of zero, which scanners report when no
/// measurement exists.
pub fn rssi_to_distance(rssi: f64, tx_power: f64, path_loss_exponent: f64) -> Option<f64> {
    if rssi == 0.0 {
        return None;
    }
    Some(10f64.powf((tx_power - rssi) / (10.0 * path_loss_exponent)))
}

/// A fixed set of readings, refreshed on every snapshot. Serves replay
/// runs and tests; the production SSE scanner lives in the embedding
/// application.
pub struct StaticBeaconScanner {
    readings: Vec<(String, f64)>,
}

impl StaticBeaconScanner {
    /// Takes `(mac, rssi)` pairs; macs must already be canonical.
    pub fn new(readings: Vec<(String, f64)>) -> Self {
        Self { readings }
    }
}

impl BeaconScanner for StaticBeaconScanner {
    fn snapshot(&self, _max_age: Duration) -> Vec<BeaconReading> {
        let now = Instant::now();
        self.readings
            .iter()
            .filter_map(|(mac, rssi)| {
                let distance_m = rssi_to_distance(*rssi, DEFAULT_TX_POWER, DEFAULT_PATH_LOSS_EXPONENT)?;
                Some(BeaconReading {
                    mac: mac.clone(),
                    rssi: *rssi,
                    distance_m,
                    observed_at: now,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_distance_at_tx_power_is_one_metre() {
        let d = rssi_to_distance(-59.0, DEFAULT_TX_POWER, DEFAULT_PATH_LOSS_EXPONENT).unwrap();
        assert_relative_eq!(d, 1.0);
    }

    #[test]
    fn test_weaker_signal_is_farther() {
        let near = rssi_to_distance(-60.0, DEFAULT_TX_POWER, DEFAULT_PATH_LOSS_EXPONENT).unwrap();
        let far = rssi_to_distance(-80.0, DEFAULT_TX_POWER, DEFAULT_PATH_LOSS_EXPONENT).unwrap();
        assert!(far > near);
    }

    #[test]
    fn test_known_value() {
        // (−59 − (−84)) / 25 = 1 → 10 m.
        let d = rssi_to_distance(-84.0, -59.0, 2.5).unwrap();
        assert_relative_eq!(d, 10.0, epsilon = 1e-9);
    }

    #[test]
    fn test_zero_rssi_has_no_distance() {
        assert!(rssi_to_distance(0.0, DEFAULT_TX_POWER, DEFAULT_PATH_LOSS_EXPONENT).is_none());
    }

    #[test]
    fn test_static_scanner_snapshot() {
        let scanner =
            StaticBeaconScanner::new(vec![("AA:BB:CC:DD:EE:01".into(), -59.0)]);
        let readings = scanner.snapshot(Duration::from_secs(5));
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].mac, "AA:BB:CC:DD:EE:01");
        assert_relative_eq!(readings[0].distance_m, 1.0);
    }
}

use chrono::{DateTime, Utc};

use crate::alert::event::AlertStatus;
use crate::detection::domain::vehicle_detector::VehicleClass;

/// Fused per-vehicle state, mirroring the lifetime of its track. Owned
/// exclusively by the pipeline thread; workers receive copies.
#[derive(Clone, Debug)]
pub struct VehicleState {
    pub track_id: u64,
    pub class: VehicleClass,
    /// Canonical MAC of the locked beacon, once a lock exists.
    pub beacon_mac: Option<String>,
    /// Confirmed registration: locked to a whitelisted beacon.
    pub registered: bool,
    /// Equipment owner from the whitelist entry.
    pub company: Option<String>,
    /// Environment code from the whitelist entry.
    pub environment_code: Option<String>,
    /// Recognised plate and its score, for civilian vehicles.
    pub plate: Option<(String, f64)>,
    /// Smoothed distance in metres.
    pub distance_m: Option<f64>,
    /// Latest detection confidence.
    pub confidence: f64,
    pub first_seen: DateTime<Utc>,
    /// Status an alert has already been emitted for; emission for the
    /// same status is not repeated.
    pub reported_status: Option<AlertStatus>,
    pub last_snapshot_path: Option<String>,
}

impl VehicleState {
    pub fn new(track_id: u64, class: VehicleClass, first_seen: DateTime<Utc>) -> Self {
        Self {
            track_id,
            class,
            beacon_mac: None,
            registered: false,
            company: None,
            environment_code: None,
            plate: None,
            distance_m: None,
            confidence: 0.0,
            first_seen,
            reported_status: None,
            last_snapshot_path: None,
        }
    }
}

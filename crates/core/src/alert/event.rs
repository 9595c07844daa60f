use std::path::PathBuf;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Serialize, Serializer};

use crate::detection::domain::vehicle_detector::{ClassGroup, VehicleClass};
use crate::shared::bbox::BBox;

/// Wire value of the vehicle category.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VehicleKind {
    Construction,
    Civilian,
}

impl VehicleKind {
    pub fn from_group(group: ClassGroup) -> Self {
        match group {
            ClassGroup::Construction => VehicleKind::Construction,
            ClassGroup::Civilian => VehicleKind::Civilian,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VehicleKind::Construction => "construction_vehicle",
            VehicleKind::Civilian => "social_vehicle",
        }
    }
}

impl Serialize for VehicleKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Alert lifecycle status as the cloud understands it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlertStatus {
    Registered,
    Unregistered,
    Identifying,
    Identified,
    Failed,
    Processing,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Registered => "registered",
            AlertStatus::Unregistered => "unregistered",
            AlertStatus::Identifying => "identifying",
            AlertStatus::Identified => "identified",
            AlertStatus::Failed => "failed",
            AlertStatus::Processing => "processing",
        }
    }
}

impl Serialize for AlertStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Serialize)]
pub struct BBoxJson {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl From<BBox> for BBoxJson {
    fn from(b: BBox) -> Self {
        Self {
            x1: b.x1,
            y1: b.y1,
            x2: b.x2,
            y2: b.y2,
        }
    }
}

fn serialize_utc_z<S: Serializer>(
    value: &DateTime<Utc>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&value.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// One alert as POSTed to `/api/alerts`.
///
/// Serialisation contract: `timestamp` is UTC with a `Z` suffix;
/// `snapshot_path` and `image_path` are explicit JSON nulls; `bbox` is an
/// object or null; every other absent optional is omitted; integer
/// fields are plain JSON integers.
#[derive(Clone, Debug, Serialize)]
pub struct AlertEvent {
    #[serde(serialize_with = "serialize_utc_z")]
    pub timestamp: DateTime<Utc>,
    pub vehicle_type: VehicleKind,
    pub detected_class: &'static str,
    pub status: AlertStatus,
    pub is_registered: bool,
    pub track_id: i64,
    pub bbox: Option<BBoxJson>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub beacon_mac: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plate_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_url: Option<String>,
    /// Device-local paths never reach the cloud; the contract pins both
    /// of these to null.
    pub snapshot_path: Option<String>,
    pub image_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,

    /// Local snapshot file backing the image upload. Never serialised.
    #[serde(skip)]
    pub local_snapshot: Option<PathBuf>,
}

impl AlertEvent {
    /// Builds a minimal event; callers fill the optional fields.
    pub fn new(
        timestamp: DateTime<Utc>,
        class: VehicleClass,
        status: AlertStatus,
        is_registered: bool,
        track_id: u64,
        bbox: Option<BBox>,
    ) -> Self {
        Self {
            timestamp,
            vehicle_type: VehicleKind::from_group(class.group()),
            detected_class: class.label(),
            status,
            is_registered,
            // u64 track ids are well inside i64 range in practice; the
            // cloud contract wants a plain signed integer.
            track_id: track_id as i64,
            bbox: bbox.map(BBoxJson::from),
            confidence: None,
            distance: None,
            beacon_mac: None,
            company: None,
            environment_code: None,
            plate_number: None,
            snapshot_url: None,
            snapshot_path: None,
            image_path: None,
            metadata: None,
            local_snapshot: None,
        }
    }
}

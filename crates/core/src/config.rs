use std::fs;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

fn invalid(field: &'static str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        message: message.into(),
    }
}

/// Top-level configuration, loaded once at startup and passed by
/// reference into constructors. The core never reads configuration from
/// globals at runtime.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub detection: DetectionConfig,
    pub tracking: TrackingConfig,
    pub depth: DepthConfig,
    pub beacon_match: BeaconMatchConfig,
    pub alert: AlertConfig,
    pub lpr: LprConfig,
    pub cloud: CloudConfig,
    pub data_retention: DataRetentionConfig,
    pub paths: PathsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub conf_threshold: f64,
    pub iou_threshold: f64,
    /// Detector input resolution as `[width, height]`.
    pub input_resolution: [u32; 2],
    pub model_path: String,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            conf_threshold: 0.5,
            iou_threshold: 0.4,
            input_resolution: [640, 640],
            model_path: "models/vehicle_yolo.onnx".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Detections below this score are discarded entirely.
    pub track_thresh: f64,
    /// Score splitting high- from low-confidence detections.
    pub high_thresh: f64,
    /// Minimum IoU for a track/detection association.
    pub match_thresh: f64,
    /// Frames a track may stay lost before removal.
    pub track_buffer: u32,
    /// Minimum track score for a track to enter fusion.
    pub min_track_confidence: f64,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            track_thresh: 0.5,
            high_thresh: 0.6,
            match_thresh: 0.8,
            track_buffer: 30,
            min_track_confidence: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DepthMethod {
    Median,
    Mean,
    Min,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DepthConfig {
    /// Usable depth range in metres.
    pub min_range: f64,
    pub max_range: f64,
    pub method: DepthMethod,
    /// Raw sensor values at or outside these bounds are invalid.
    pub invalid_min: u16,
    pub invalid_max: u16,
    pub smoothing: SmoothingConfig,
}

impl Default for DepthConfig {
    fn default() -> Self {
        Self {
            min_range: 0.1,
            max_range: 10.0,
            method: DepthMethod::Median,
            invalid_min: 0,
            invalid_max: 65535,
            smoothing: SmoothingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmoothingMethod {
    Ema,
    Median,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SmoothingConfig {
    pub enabled: bool,
    pub method: SmoothingMethod,
    pub alpha: f64,
    pub window_size: usize,
    pub min_samples: usize,
}

impl Default for SmoothingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            method: SmoothingMethod::Ema,
            alpha: 0.7,
            window_size: 5,
            min_samples: 3,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BeaconMatchConfig {
    pub temporal_consistency: TemporalConsistencyConfig,
    pub multi_target: MultiTargetConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TemporalConsistencyConfig {
    pub enabled: bool,
    /// Consecutive identical matches required before a beacon locks.
    pub min_consistent_frames: usize,
    /// Maximum distance spread (metres) within the consistency window.
    pub max_distance_error: f64,
    pub reset_on_track_end: bool,
}

impl Default for TemporalConsistencyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_consistent_frames: 5,
            max_distance_error: 1.0,
            reset_on_track_end: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MultiTargetConfig {
    pub enabled: bool,
    /// Assignments costlier than this are rejected.
    pub match_cost_threshold: f64,
    pub time_stability_weight: f64,
    /// Seconds of beacon history considered for the stability penalty.
    pub stability_window: f64,
}

impl Default for MultiTargetConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            match_cost_threshold: 5.0,
            time_stability_weight: 0.3,
            stability_window: 3.0,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub loitering: LoiteringConfig,
    pub dedup: DedupConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoiteringConfig {
    pub enabled: bool,
    /// Minimum presence duration in seconds.
    pub min_duration: f64,
    /// Minimum mean bbox/frame area ratio.
    pub min_area_ratio: f64,
    /// Maximum normalised centre displacement to still count as loitering.
    pub min_movement_ratio: f64,
    /// When true, registered vehicles alert immediately and only
    /// unregistered ones must loiter first.
    pub apply_to_unregistered_only: bool,
}

impl Default for LoiteringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_duration: 10.0,
            min_area_ratio: 0.05,
            min_movement_ratio: 0.1,
            apply_to_unregistered_only: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Seconds an identical dedup key suppresses re-emission.
    pub time_window: f64,
    /// IoU above which two events count as the same position.
    pub iou_threshold: f64,
    /// Seconds the same-position suppression applies.
    pub position_time_window: f64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            time_window: 30.0,
            iou_threshold: 0.5,
            position_time_window: 10.0,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LprConfig {
    pub best_frame_selection: BestFrameConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BestFrameConfig {
    pub enabled: bool,
    /// Quality score triggering recognition immediately.
    pub quality_threshold: f64,
    /// Frames to wait for a better frame before settling.
    pub max_wait_frames: u32,
    /// Reuse a completed recognition result instead of re-triggering.
    pub reuse_result: bool,
}

impl Default for BestFrameConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            quality_threshold: 0.6,
            max_wait_frames: 10,
            reuse_result: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    pub enabled: bool,
    pub api_base_url: String,
    pub api_key: String,
    pub retry_attempts: u32,
    /// Base retry delay in seconds; attempt k waits `retry_delay * (k+1)`.
    pub retry_delay: f64,
    /// Whitelist poll interval in seconds.
    pub upload_interval: f64,
    pub max_image_size_mb: f64,
    pub enable_image_upload: bool,
    pub enable_alert_upload: bool,
    pub save_snapshots: bool,
    pub monitoring_snapshot_interval: f64,
    pub enable_monitoring_snapshot: bool,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_base_url: String::new(),
            api_key: String::new(),
            retry_attempts: 3,
            retry_delay: 5.0,
            upload_interval: 300.0,
            max_image_size_mb: 5.0,
            enable_image_upload: true,
            enable_alert_upload: true,
            save_snapshots: true,
            monitoring_snapshot_interval: 600.0,
            enable_monitoring_snapshot: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DataRetentionConfig {
    pub database: DatabaseRetentionConfig,
    pub snapshots: SnapshotRetentionConfig,
    pub monitoring_snapshots: MonitoringRetentionConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseRetentionConfig {
    pub max_records: u64,
    pub retention_days: u32,
    pub cleanup_interval_hours: f64,
}

impl Default for DatabaseRetentionConfig {
    fn default() -> Self {
        Self {
            max_records: 10_000,
            retention_days: 30,
            cleanup_interval_hours: 24.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SnapshotRetentionConfig {
    pub max_count: usize,
    pub max_size_mb: f64,
    pub retention_days: u32,
    pub cleanup_interval_hours: f64,
}

impl Default for SnapshotRetentionConfig {
    fn default() -> Self {
        Self {
            max_count: 1000,
            max_size_mb: 500.0,
            retention_days: 7,
            cleanup_interval_hours: 6.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitoringRetentionConfig {
    pub max_count: usize,
    pub max_size_mb: f64,
    pub retention_days: u32,
    pub cleanup_interval_hours: f64,
}

impl Default for MonitoringRetentionConfig {
    fn default() -> Self {
        Self {
            max_count: 500,
            max_size_mb: 200.0,
            retention_days: 3,
            cleanup_interval_hours: 12.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory where event and monitoring snapshots are written.
    pub snapshot_dir: String,
    pub database_path: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            snapshot_dir: "snapshots".into(),
            database_path: "detections.db".into(),
        }
    }
}

impl Config {
    /// Loads and validates a YAML config file. Missing sections fall back
    /// to defaults; validation failures are fatal.
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        let config: Config = serde_yaml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let unit = |v: f64| (0.0..=1.0).contains(&v);

        if !unit(self.detection.conf_threshold) {
            return Err(invalid("detection.conf_threshold", "must be in 0.0-1.0"));
        }
        if !unit(self.detection.iou_threshold) {
            return Err(invalid("detection.iou_threshold", "must be in 0.0-1.0"));
        }
        if self.detection.input_resolution.iter().any(|&d| d == 0) {
            return Err(invalid("detection.input_resolution", "must be non-zero"));
        }

        if !unit(self.tracking.track_thresh) || !unit(self.tracking.high_thresh) {
            return Err(invalid(
                "tracking.track_thresh",
                "thresholds must be in 0.0-1.0",
            ));
        }
        if self.tracking.track_thresh > self.tracking.high_thresh {
            return Err(invalid(
                "tracking.track_thresh",
                "must not exceed tracking.high_thresh",
            ));
        }
        if !unit(self.tracking.match_thresh) {
            return Err(invalid("tracking.match_thresh", "must be in 0.0-1.0"));
        }
        if self.tracking.track_buffer == 0 {
            return Err(invalid("tracking.track_buffer", "must be >= 1"));
        }

        if self.depth.min_range >= self.depth.max_range {
            return Err(invalid(
                "depth.min_range",
                "must be strictly below depth.max_range",
            ));
        }
        if self.depth.invalid_min >= self.depth.invalid_max {
            return Err(invalid(
                "depth.invalid_min",
                "must be strictly below depth.invalid_max",
            ));
        }
        let s = &self.depth.smoothing;
        if !(0.0..=1.0).contains(&s.alpha) || s.alpha == 0.0 {
            return Err(invalid("depth.smoothing.alpha", "must be in (0.0, 1.0]"));
        }
        if s.window_size == 0 || s.min_samples == 0 {
            return Err(invalid(
                "depth.smoothing.window_size",
                "window_size and min_samples must be >= 1",
            ));
        }

        let tc = &self.beacon_match.temporal_consistency;
        if tc.min_consistent_frames == 0 {
            return Err(invalid(
                "beacon_match.temporal_consistency.min_consistent_frames",
                "must be >= 1",
            ));
        }
        if tc.max_distance_error < 0.0 {
            return Err(invalid(
                "beacon_match.temporal_consistency.max_distance_error",
                "must be >= 0",
            ));
        }
        let mt = &self.beacon_match.multi_target;
        if mt.match_cost_threshold <= 0.0 {
            return Err(invalid(
                "beacon_match.multi_target.match_cost_threshold",
                "must be > 0",
            ));
        }
        if !unit(mt.time_stability_weight) {
            return Err(invalid(
                "beacon_match.multi_target.time_stability_weight",
                "must be in 0.0-1.0",
            ));
        }

        if self.alert.loitering.min_duration <= 0.0 {
            return Err(invalid("alert.loitering.min_duration", "must be > 0"));
        }
        if !unit(self.alert.loitering.min_area_ratio) {
            return Err(invalid("alert.loitering.min_area_ratio", "must be in 0.0-1.0"));
        }
        if !unit(self.alert.dedup.iou_threshold) {
            return Err(invalid("alert.dedup.iou_threshold", "must be in 0.0-1.0"));
        }
        if self.alert.dedup.time_window < 0.0 || self.alert.dedup.position_time_window < 0.0 {
            return Err(invalid("alert.dedup.time_window", "windows must be >= 0"));
        }

        if !unit(self.lpr.best_frame_selection.quality_threshold) {
            return Err(invalid(
                "lpr.best_frame_selection.quality_threshold",
                "must be in 0.0-1.0",
            ));
        }

        if self.cloud.enabled {
            if self.cloud.api_base_url.is_empty() {
                return Err(invalid("cloud.api_base_url", "required when cloud.enabled"));
            }
            if self.cloud.api_key.is_empty() {
                return Err(invalid("cloud.api_key", "required when cloud.enabled"));
            }
        }
        if self.cloud.retry_attempts == 0 {
            return Err(invalid("cloud.retry_attempts", "must be >= 1"));
        }
        if self.cloud.retry_delay < 0.0 {
            return Err(invalid("cloud.retry_delay", "must be >= 0"));
        }
        if self.cloud.max_image_size_mb <= 0.0 {
            return Err(invalid("cloud.max_image_size_mb", "must be > 0"));
        }

        Ok(())
    }
}

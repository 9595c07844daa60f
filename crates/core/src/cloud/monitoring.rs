//! Periodic monitoring-snapshot worker.
//!
//! Proof-of-life for the installation: every interval the current frame
//! is encoded at JPEG-95 and uploaded with `image_type=monitoring_snapshot`
//! so operators can confirm the camera still points at the gate.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::Utc;
use log::{debug, warn};

use crate::alert::snapshot::save_monitoring_snapshot;
use crate::cloud::client::{CloudClient, MONITORING_SIZE_MULTIPLIER};
use crate::cloud::heartbeat::sleep_while_running;
use crate::shared::frame::Frame;

/// Default capture period.
pub const MONITORING_INTERVAL: Duration = Duration::from_secs(600);

/// Supplies the most recent frame, or `None` when capture is down.
pub type FrameFn = Arc<dyn Fn() -> Option<Frame> + Send + Sync>;

pub struct MonitoringWorkerConfig {
    pub device_id: String,
    pub interval: Duration,
    /// Keep snapshots under `snapshot_dir`; otherwise write to a temp
    /// path and remove after upload.
    pub save_snapshots: bool,
    pub snapshot_dir: PathBuf,
}

pub fn spawn(
    client: Arc<CloudClient>,
    config: MonitoringWorkerConfig,
    frame_fn: FrameFn,
    running: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        while running.load(Ordering::Relaxed) {
            sleep_while_running(config.interval, &running);
            if !running.load(Ordering::Relaxed) {
                break;
            }
            capture_and_upload(&client, &config, &frame_fn);
        }
    })
}

fn capture_and_upload(
    client: &CloudClient,
    config: &MonitoringWorkerConfig,
    frame_fn: &FrameFn,
) {
    let Some(frame) = frame_fn() else {
        warn!("no frame available, skipping monitoring snapshot");
        return;
    };

    let dir = if config.save_snapshots {
        config.snapshot_dir.clone()
    } else {
        std::env::temp_dir()
    };
    let path = match save_monitoring_snapshot(&frame, &dir, &config.device_id, Utc::now()) {
        Ok(path) => path,
        Err(e) => {
            warn!("failed to save monitoring snapshot: {e}");
            return;
        }
    };

    match client.upload_image(
        &path,
        None,
        Some("monitoring_snapshot"),
        Some(&config.device_id),
        MONITORING_SIZE_MULTIPLIER,
    ) {
        Ok(Some(url)) => debug!("monitoring snapshot uploaded: {url}"),
        Ok(None) => debug!("monitoring snapshot upload disabled"),
        Err(e) => warn!("monitoring snapshot upload failed: {e}"),
    }

    if !config.save_snapshots {
        if let Err(e) = std::fs::remove_file(&path) {
            debug!("failed to remove temp snapshot {}: {e}", path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CloudConfig;
    use tempfile::TempDir;

    fn offline_client() -> Arc<CloudClient> {
        Arc::new(
            CloudClient::new(&CloudConfig {
                enabled: true,
                api_base_url: "http://127.0.0.1:1".into(),
                api_key: "k".into(),
                retry_attempts: 1,
                retry_delay: 0.0,
                ..CloudConfig::default()
            })
            .unwrap(),
        )
    }

    fn frame() -> Frame {
        Frame::new(vec![50u8; 8 * 8 * 3], Vec::new(), 8, 8, 0, Utc::now())
    }

    #[test]
    fn test_snapshot_kept_when_saving_enabled() {
        let tmp = TempDir::new().unwrap();
        let config = MonitoringWorkerConfig {
            device_id: "gate-01".into(),
            interval: Duration::from_secs(600),
            save_snapshots: true,
            snapshot_dir: tmp.path().to_path_buf(),
        };
        let frame_fn: FrameFn = Arc::new(|| Some(frame()));
        capture_and_upload(&offline_client(), &config, &frame_fn);

        let files: Vec<_> = std::fs::read_dir(tmp.path()).unwrap().collect();
        assert_eq!(files.len(), 1);
        let name = files[0].as_ref().unwrap().file_name();
        assert!(name
            .to_string_lossy()
            .starts_with("monitoring_snapshot_gate-01_"));
    }

    #[test]
    fn test_temp_snapshot_removed_when_saving_disabled() {
        let tmp = TempDir::new().unwrap();
        let config = MonitoringWorkerConfig {
            device_id: "gate-02-unique".into(),
            interval: Duration::from_secs(600),
            save_snapshots: false,
            snapshot_dir: tmp.path().to_path_buf(),
        };
        let frame_fn: FrameFn = Arc::new(|| Some(frame()));
        capture_and_upload(&offline_client(), &config, &frame_fn);

        // Nothing in the snapshot dir, and the temp file is gone again.
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
        let leftovers = std::fs::read_dir(std::env::temp_dir())
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .contains("gate-02-unique")
            })
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_missing_frame_is_skipped() {
        let tmp = TempDir::new().unwrap();
        let config = MonitoringWorkerConfig {
            device_id: "gate-03".into(),
            interval: Duration::from_secs(600),
            save_snapshots: true,
            snapshot_dir: tmp.path().to_path_buf(),
        };
        let frame_fn: FrameFn = Arc::new(|| None);
        capture_and_upload(&offline_client(), &config, &frame_fn);
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }
}

//! Asynchronous alert delivery.
//!
//! A bounded queue decouples the pipeline thread from the network: the
//! pipeline enqueues admitted alerts and a single worker uploads them
//! FIFO. Each item uploads its snapshot first, then the alert, then
//! re-binds the image to the returned alert id. One item failing never
//! blocks the next.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use log::{info, warn};

use crate::alert::event::AlertEvent;
use crate::cloud::client::CloudClient;

/// Queue capacity; overflow drops the newest alert.
pub const QUEUE_CAPACITY: usize = 100;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Shutdown join deadline.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Default)]
pub struct UploaderCounters {
    pub dropped: AtomicU64,
    pub uploaded: AtomicU64,
    pub failed: AtomicU64,
}

pub struct Uploader {
    tx: Sender<AlertEvent>,
    running: Arc<AtomicBool>,
    counters: Arc<UploaderCounters>,
    handle: Option<JoinHandle<()>>,
}

impl Uploader {
    pub fn spawn(client: Arc<CloudClient>) -> Self {
        let (tx, rx) = crossbeam_channel::bounded::<AlertEvent>(QUEUE_CAPACITY);
        let running = Arc::new(AtomicBool::new(true));
        let counters = Arc::new(UploaderCounters::default());

        let worker_running = running.clone();
        let worker_counters = counters.clone();
        let handle = std::thread::spawn(move || {
            upload_worker(&rx, &client, &worker_running, &worker_counters);
        });

        Self {
            tx,
            running,
            counters,
            handle: Some(handle),
        }
    }

    /// Enqueues an alert; a full queue drops it (newest-drop) with a
    /// counter so the pipeline never blocks.
    pub fn enqueue(&self, event: AlertEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("upload queue full, dropping alert");
                false
            }
        }
    }

    pub fn queue_len(&self) -> usize {
        self.tx.len()
    }

    pub fn counters(&self) -> &UploaderCounters {
        &self.counters
    }

    /// Cooperative stop: the worker finishes its in-flight item, then
    /// exits; waiting is bounded by the shutdown deadline, after which
    /// the worker is left to die with the process.
    pub fn stop(mut self) {
        self.running.store(false, Ordering::Relaxed);
        drop(self.tx);
        if let Some(handle) = self.handle.take() {
            let deadline = std::time::Instant::now() + SHUTDOWN_DEADLINE;
            while !handle.is_finished() && std::time::Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(20));
            }
            if handle.is_finished() {
                let _ = handle.join();
            }
        }
    }
}

fn upload_worker(
    rx: &Receiver<AlertEvent>,
    client: &CloudClient,
    running: &AtomicBool,
    counters: &UploaderCounters,
) {
    loop {
        let event = match rx.recv_timeout(POLL_INTERVAL) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => {
                if running.load(Ordering::Relaxed) {
                    continue;
                }
                break;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        };
        process_event(event, client, counters);
        if !running.load(Ordering::Relaxed) {
            break;
        }
    }
}

fn process_event(mut event: AlertEvent, client: &CloudClient, counters: &UploaderCounters) {
    // Image first: the alert carries the returned relative path.
    let snapshot = event
        .local_snapshot
        .clone()
        .filter(|p| p.exists());
    if let Some(path) = &snapshot {
        match client.upload_image(path, None, None, None, 1.0) {
            Ok(url) => event.snapshot_url = url,
            Err(e) => warn!("snapshot upload failed for track {}: {e}", event.track_id),
        }
    }

    let alert_id = match client.send_alert(&event) {
        Ok(id) => id,
        Err(e) => {
            // The alert is dropped after bounded retries; the system
            // keeps running.
            warn!("alert upload failed for track {}: {e}", event.track_id);
            counters.failed.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };

    // Re-bind the uploaded image to the alert the cloud just assigned.
    if let (Some(path), Some(id), Some(_)) = (&snapshot, alert_id, &event.snapshot_url) {
        if let Err(e) = client.upload_image(path, Some(id), None, None, 1.0) {
            warn!("image re-bind failed for alert {id}: {e}");
        }
    }
    counters.uploaded.fetch_add(1, Ordering::Relaxed);
    info!(
        "alert for track {} delivered (id {:?})",
        event.track_id, alert_id
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::event::AlertStatus;
    use crate::config::CloudConfig;
    use crate::detection::domain::vehicle_detector::VehicleClass;
    use chrono::Utc;

    fn offline_client(retry_attempts: u32, retry_delay: f64) -> Arc<CloudClient> {
        Arc::new(
            CloudClient::new(&CloudConfig {
                enabled: true,
                api_base_url: "http://127.0.0.1:1".into(),
                api_key: "k".into(),
                retry_attempts,
                retry_delay,
                ..CloudConfig::default()
            })
            .unwrap(),
        )
    }

    fn event() -> AlertEvent {
        AlertEvent::new(
            Utc::now(),
            VehicleClass::Excavator,
            AlertStatus::Unregistered,
            false,
            1,
            None,
        )
    }

    #[test]
    fn test_failed_upload_counts_and_keeps_running() {
        let uploader = Uploader::spawn(offline_client(1, 0.0));
        assert!(uploader.enqueue(event()));
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while uploader.counters().failed.load(Ordering::Relaxed) == 0
            && std::time::Instant::now() < deadline
        {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(uploader.counters().failed.load(Ordering::Relaxed), 1);
        uploader.stop();
    }

    #[test]
    fn test_overflow_drops_newest() {
        // Slow retries pin the worker on its first item so the queue
        // genuinely fills.
        let uploader = Uploader::spawn(offline_client(3, 0.5));
        let mut accepted = 0;
        for _ in 0..(QUEUE_CAPACITY + 20) {
            if uploader.enqueue(event()) {
                accepted += 1;
            }
        }
        assert!(accepted <= QUEUE_CAPACITY + 2);
        assert!(uploader.counters().dropped.load(Ordering::Relaxed) >= 18);
        uploader.stop();
    }

    #[test]
    fn test_stop_is_bounded() {
        let uploader = Uploader::spawn(offline_client(1, 0.0));
        let start = std::time::Instant::now();
        uploader.stop();
        assert!(start.elapsed() < Duration::from_secs(6));
    }
}

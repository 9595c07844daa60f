//! Periodic heartbeat worker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, warn};

use crate::cloud::client::CloudClient;
use crate::cloud::system_status;

/// Heartbeat period.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(300);

/// Granularity of the cooperative sleep.
const SLEEP_STEP: Duration = Duration::from_millis(250);

/// Provides the pipeline's statistics snapshot for the heartbeat body.
pub type StatsFn = Arc<dyn Fn() -> serde_json::Value + Send + Sync>;

/// Spawns the heartbeat worker. It sends immediately on start, then
/// every `interval` until `running` clears.
pub fn spawn(
    client: Arc<CloudClient>,
    device_id: String,
    stats: StatsFn,
    interval: Duration,
    running: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        while running.load(Ordering::Relaxed) {
            let system = system_status::gather();
            match client.send_heartbeat(&device_id, system, stats()) {
                Ok(()) => debug!("heartbeat sent"),
                Err(e) => warn!("heartbeat failed: {e}"),
            }
            sleep_while_running(interval, &running);
        }
    })
}

pub(crate) fn sleep_while_running(total: Duration, running: &AtomicBool) {
    let mut remaining = total;
    while !remaining.is_zero() && running.load(Ordering::Relaxed) {
        let step = remaining.min(SLEEP_STEP);
        std::thread::sleep(step);
        remaining = remaining.saturating_sub(step);
    }
}

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Instant;

use serde_json::json;

#[derive(Default)]
struct StatsInner {
    frame_count: u64,
    alert_count: u64,
    dropped_alerts: u64,
    per_class: BTreeMap<&'static str, u64>,
}

/// Pipeline counters shared with the heartbeat worker.
pub struct PipelineStats {
    started: Instant,
    inner: Mutex<StatsInner>,
}

impl Default for PipelineStats {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineStats {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            inner: Mutex::new(StatsInner::default()),
        }
    }

    pub fn frame_processed(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.frame_count += 1;
        }
    }

    pub fn alert_emitted(&self, detected_class: &'static str) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.alert_count += 1;
            *inner.per_class.entry(detected_class).or_default() += 1;
        }
    }

    pub fn alert_dropped(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.dropped_alerts += 1;
        }
    }

    /// JSON snapshot for the heartbeat `stats` field.
    pub fn snapshot(&self) -> serde_json::Value {
        let uptime = self.started.elapsed().as_secs_f64();
        let Ok(inner) = self.inner.lock() else {
            return json!({});
        };
        let fps = if uptime > 0.0 {
            inner.frame_count as f64 / uptime
        } else {
            0.0
        };
        json!({
            "uptime_seconds": uptime,
            "frame_count": inner.frame_count,
            "fps": fps,
            "alert_count": inner.alert_count,
            "dropped_alerts": inner.dropped_alerts,
            "alerts_by_class": inner.per_class,
        })
    }
}

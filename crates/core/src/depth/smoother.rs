use std::collections::HashMap;

use crate::config::{SmoothingConfig, SmoothingMethod};

/// Temporal smoothing of per-track depth measurements.
///
/// EMA method: the first smoothed value is the median of the first
/// `min_samples` raw values; afterwards
/// `s = alpha * raw + (1 - alpha) * s_prev` where `s_prev` is the
/// smoother's remembered smoothed value, never a raw history entry.
/// Median method: median of the last `window_size` raw values.
pub struct DepthSmoother {
    method: SmoothingMethod,
    alpha: f64,
    window_size: usize,
    min_samples: usize,
    history: HashMap<u64, Vec<f64>>,
    smoothed: HashMap<u64, f64>,
}

impl DepthSmoother {
    pub fn new(config: &SmoothingConfig) -> Self {
        Self {
            method: config.method,
            alpha: config.alpha,
            window_size: config.window_size,
            min_samples: config.min_samples,
            history: HashMap::new(),
            smoothed: HashMap::new(),
        }
    }

    /// Feeds one raw measurement (or a miss) and returns the smoothed
    /// depth. A missing raw value returns the last remembered smoothed
    /// value without touching any state.
    pub fn update(&mut self, track_id: u64, raw: Option<f64>) -> Option<f64> {
        let Some(raw) = raw else {
            return self.smoothed.get(&track_id).copied();
        };

        let history = self.history.entry(track_id).or_default();
        history.push(raw);
        let max_history = (self.window_size * 2).max(20);
        if history.len() > max_history {
            history.remove(0);
        }

        if history.len() < self.min_samples {
            return Some(raw);
        }

        let smoothed = match self.method {
            SmoothingMethod::Ema => {
                if let Some(&prev) = self.smoothed.get(&track_id) {
                    self.alpha * raw + (1.0 - self.alpha) * prev
                } else {
                    // Seed with the median of the first min_samples values.
                    median(&history[..self.min_samples])
                }
            }
            SmoothingMethod::Median => {
                let start = history.len().saturating_sub(self.window_size);
                median(&history[start..])
            }
        };

        self.smoothed.insert(track_id, smoothed);
        Some(smoothed)
    }

    /// Last smoothed value without feeding a new sample.
    pub fn current(&self, track_id: u64) -> Option<f64> {
        self.smoothed.get(&track_id).copied()
    }

    pub fn reset(&mut self, track_id: u64) {
        self.history.remove(&track_id);
        self.smoothed.remove(&track_id);
    }

    pub fn cleanup(&mut self, active_ids: &std::collections::HashSet<u64>) {
        self.history.retain(|id, _| active_ids.contains(id));
        self.smoothed.retain(|id, _| active_ids.contains(id));
    }
}

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

use crate::config::{DepthConfig, DepthMethod};
use crate::depth::domain::depth_reader::{DepthReader, DepthSample};
use crate::shared::bbox::BBox;
use crate::shared::frame::Frame;

/// Half-size of the square sampling window around the bbox bottom
/// midpoint, in pixels.
const WINDOW_RADIUS: i64 = 5;

/// IQR multiplier for outlier rejection.
const OUTLIER_THRESHOLD: f64 = 2.0;

/// Measures vehicle distance from the frame's aligned depth plane.
///
/// Samples a small window centred on the bbox's bottom midpoint (where
/// the vehicle meets the ground), drops invalid pixels and IQR outliers,
/// then reduces with the configured statistic. Confidence is the valid
/// fraction of the window.
pub struct FrameDepthReader {
    min_range_mm: f64,
    max_range_mm: f64,
    invalid_min: u16,
    invalid_max: u16,
    method: DepthMethod,
}

impl FrameDepthReader {
    pub fn new(config: &DepthConfig) -> Self {
        Self {
            min_range_mm: config.min_range * 1000.0,
            max_range_mm: config.max_range * 1000.0,
            invalid_min: config.invalid_min,
            invalid_max: config.invalid_max,
            method: config.method,
        }
    }

    fn is_valid(&self, raw: u16) -> bool {
        raw > self.invalid_min
            && raw < self.invalid_max
            && (raw as f64) >= self.min_range_mm
            && (raw as f64) <= self.max_range_mm
    }
}

impl DepthReader for FrameDepthReader {
    fn measure(&self, frame: &Frame, bbox: &BBox) -> Option<DepthSample> {
        if !frame.has_depth() {
            return None;
        }

        let (cx, cy) = bbox.bottom_midpoint();
        let cx = cx.round() as i64;
        let cy = cy.round() as i64;

        let mut valid: Vec<f64> = Vec::new();
        let mut window_pixels = 0usize;
        for dy in -WINDOW_RADIUS..=WINDOW_RADIUS {
            for dx in -WINDOW_RADIUS..=WINDOW_RADIUS {
                let (x, y) = (cx + dx, cy + dy);
                if x < 0 || y < 0 {
                    continue;
                }
                let Some(raw) = frame.depth_at(x as u32, y as u32) else {
                    continue;
                };
                window_pixels += 1;
                if self.is_valid(raw) {
                    valid.push(raw as f64);
                }
            }
        }

        if valid.is_empty() || window_pixels == 0 {
            return None;
        }
        let confidence = valid.len() as f64 / window_pixels as f64;

        valid.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let filtered = reject_outliers(&valid);

        let depth_mm = match self.method {
            DepthMethod::Median => median_sorted(filtered),
            DepthMethod::Mean => filtered.iter().sum::<f64>() / filtered.len() as f64,
            DepthMethod::Min => filtered[0],
        };

        Some(DepthSample {
            raw_m: depth_mm / 1000.0,
            confidence,
        })
    }
}

/// Keeps values within `[q1 - k*iqr, q3 + k*iqr]`. Input must be sorted.
/// Falls back to the full slice when filtering would discard everything.
fn reject_outliers(sorted: &[f64]) -> &[f64] {
    if sorted.len() < 4 {
        return sorted;
    }
    let q1 = percentile_sorted(sorted, 25.0);
    let q3 = percentile_sorted(sorted, 75.0);
    let iqr = q3 - q1;
    let lower = q1 - OUTLIER_THRESHOLD * iqr;
    let upper = q3 + OUTLIER_THRESHOLD * iqr;

    let start = sorted.partition_point(|&v| v < lower);
    let end = sorted.partition_point(|&v| v <= upper);
    if start >= end {
        sorted
    } else {
        &sorted[start..end]
    }
}

fn median_sorted(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

fn percentile_sorted(sorted: &[f64], pct: f64) -> f64 {
    let rank = pct / 100.0 * (sorted.len() - 1) as f64;
    let low = rank.floor() as usize;
    let high = rank.ceil() as usize;
    if low == high {
        sorted[low]
    } else {
        let frac = rank - low as f64;
        sorted[low] * (1.0 - frac) + sorted[high] * frac
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::Utc;

    const W: u32 = 64;
    const H: u32 = 64;

    fn frame_with_depth(fill_mm: u16) -> Frame {
        Frame::new(
            vec![0u8; (W * H * 3) as usize],
            vec![fill_mm; (W * H) as usize],
            W,
            H,
            0,
            Utc::now(),
        )
    }

    fn reader() -> FrameDepthReader {
        FrameDepthReader::new(&DepthConfig::default())
    }

    #[test]
    fn test_uniform_depth_returns_median() {
        let frame = frame_with_depth(5000);
        let bbox = BBox::new(20.0, 10.0, 44.0, 40.0);
        let sample = reader().measure(&frame, &bbox).unwrap();
        assert_relative_eq!(sample.raw_m, 5.0);
        assert_relative_eq!(sample.confidence, 1.0);
    }

    #[test]
    fn test_invalid_pixels_lower_confidence() {
        let mut depth = vec![5000u16; (W * H) as usize];
        // Zero out roughly half the window around the bottom midpoint
        // of the bbox below (midpoint at x=32, y=40).
        for y in 35..=45 {
            for x in 27..=32 {
                depth[y * W as usize + x] = 0;
            }
        }
        let frame = Frame::new(vec![0u8; (W * H * 3) as usize], depth, W, H, 0, Utc::now());
        let bbox = BBox::new(20.0, 10.0, 44.0, 40.0);
        let sample = reader().measure(&frame, &bbox).unwrap();
        assert_relative_eq!(sample.raw_m, 5.0);
        assert!(sample.confidence < 1.0);
        assert!(sample.confidence > 0.3);
    }

    #[test]
    fn test_all_invalid_returns_none() {
        let frame = frame_with_depth(0);
        let bbox = BBox::new(20.0, 10.0, 44.0, 40.0);
        assert!(reader().measure(&frame, &bbox).is_none());
    }

    #[test]
    fn test_out_of_range_values_are_invalid() {
        // 15 m exceeds the default 10 m max range.
        let frame = frame_with_depth(15_000);
        let bbox = BBox::new(20.0, 10.0, 44.0, 40.0);
        assert!(reader().measure(&frame, &bbox).is_none());
    }

    #[test]
    fn test_no_depth_plane_returns_none() {
        let frame = Frame::new(vec![0u8; (W * H * 3) as usize], Vec::new(), W, H, 0, Utc::now());
        let bbox = BBox::new(20.0, 10.0, 44.0, 40.0);
        assert!(reader().measure(&frame, &bbox).is_none());
    }

    #[test]
    fn test_outliers_rejected_from_median() {
        let mut depth = vec![5000u16; (W * H) as usize];
        // A handful of far outliers inside the window.
        for x in 30..33 {
            depth[40 * W as usize + x] = 9900;
        }
        let frame = Frame::new(vec![0u8; (W * H * 3) as usize], depth, W, H, 0, Utc::now());
        let bbox = BBox::new(20.0, 10.0, 44.0, 40.0);
        let sample = reader().measure(&frame, &bbox).unwrap();
        assert_relative_eq!(sample.raw_m, 5.0);
    }

    #[test]
    fn test_window_clamped_at_frame_edge() {
        let frame = frame_with_depth(4000);
        // Bottom midpoint sits on the frame border.
        let bbox = BBox::new(0.0, 0.0, 10.0, 63.0);
        let sample = reader().measure(&frame, &bbox).unwrap();
        assert_relative_eq!(sample.raw_m, 4.0);
    }

    #[test]
    fn test_reject_outliers_keeps_tight_cluster() {
        let sorted = vec![4.9, 5.0, 5.0, 5.1, 5.1, 5.2, 50.0];
        let kept = reject_outliers(&sorted);
        assert!(!kept.contains(&50.0));
    }
}

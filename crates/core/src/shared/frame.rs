use chrono::{DateTime, Utc};

/// A single camera frame with color pixels and an aligned depth plane.
///
/// Color data is contiguous RGB bytes in row-major order; depth is one
/// 16-bit millimetre value per pixel, aligned to the color image. The
/// core treats pixel data as opaque — format conversion happens at I/O
/// boundaries only.
#[derive(Clone, Debug)]
pub struct Frame {
    color: Vec<u8>,
    depth: Vec<u16>,
    width: u32,
    height: u32,
    index: u64,
    captured_at: DateTime<Utc>,
}

impl Frame {
    pub fn new(
        color: Vec<u8>,
        depth: Vec<u16>,
        width: u32,
        height: u32,
        index: u64,
        captured_at: DateTime<Utc>,
    ) -> Self {
        debug_assert_eq!(
            color.len(),
            (width as usize) * (height as usize) * 3,
            "color length must equal width * height * 3"
        );
        debug_assert!(
            depth.is_empty() || depth.len() == (width as usize) * (height as usize),
            "depth plane must be empty or one value per pixel"
        );
        Self {
            color,
            depth,
            width,
            height,
            index,
            captured_at,
        }
    }

    pub fn color(&self) -> &[u8] {
        &self.color
    }

    /// Aligned depth plane in millimetres. Empty when the source has no
    /// depth sensor.
    pub fn depth(&self) -> &[u16] {
        &self.depth
    }

    pub fn has_depth(&self) -> bool {
        !self.depth.is_empty()
    }

    /// Depth value at pixel coordinates, or `None` when out of bounds or
    /// the frame carries no depth plane.
    pub fn depth_at(&self, x: u32, y: u32) -> Option<u16> {
        if !self.has_depth() || x >= self.width || y >= self.height {
            return None;
        }
        self.depth
            .get((y as usize) * (self.width as usize) + (x as usize))
            .copied()
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    /// Copies the pixels inside `(x, y, w, h)` into a new RGB buffer.
    /// The rectangle is clamped to the frame bounds; returns `None` when
    /// the clamped region is empty.
    pub fn crop(&self, x: u32, y: u32, w: u32, h: u32) -> Option<(Vec<u8>, u32, u32)> {
        let x1 = x.min(self.width);
        let y1 = y.min(self.height);
        let x2 = x.saturating_add(w).min(self.width);
        let y2 = y.saturating_add(h).min(self.height);
        if x2 <= x1 || y2 <= y1 {
            return None;
        }
        let (cw, ch) = (x2 - x1, y2 - y1);
        let mut out = Vec::with_capacity((cw as usize) * (ch as usize) * 3);
        for row in y1..y2 {
            let start = ((row as usize) * (self.width as usize) + (x1 as usize)) * 3;
            let end = start + (cw as usize) * 3;
            out.extend_from_slice(&self.color[start..end]);
        }
        Some((out, cw, ch))
    }
}

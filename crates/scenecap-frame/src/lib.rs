#![warn(missing_docs)]
//! # scenecap-frame
//!
//! ## Purpose
//! An immutable view over one captured screen image — a row-contiguous BGR
//! pixel buffer with a timestamp — plus the letterboxing-aware mapping from
//! anchored fractional coordinates (see `scenecap-geometry`) to absolute
//! pixel coordinates.
//!
//! ## Responsibilities
//! - Validate and own a BGR8 pixel buffer ([`Frame`]).
//! - Compute the "intersection rectangle" for a given design aspect ratio
//!   ([`FrameGeometry`]) and resolve anchored points/lines against it.
//! - Sample a single pixel or scan a line for the longest color-matching
//!   prefix ratio ([`Frame::length_in`]).
//!
//! ## Data flow
//! A [`Frame`] is produced once per captured image and handed by reference
//! (or cheap clone of the `Arc`-free owned buffer, per the orchestrator's
//! choice) through the event substrate to every downstream stage; nothing in
//! this crate mutates a frame after construction.
//!
//! ## Ownership and lifetimes
//! `Frame` owns its pixel buffer outright. `FrameGeometry` is a small `Copy`
//! value recomputed per frame (or cached when frame dimensions are stable
//! across a session).
//!
//! ## Error model
//! [`FrameError`] covers buffer-shape mismatches at construction. Sampling
//! outside the frame's bounds returns `None` rather than erroring, since
//! scan loops legitimately walk past the frame edge when a resolved line
//! extends beyond it.
//!
//! ## Example
//! ```
//! use scenecap_frame::Frame;
//!
//! let bgr = vec![10u8; 4 * 3 * 2]; // 4x2 frame, 3 channels
//! let frame = Frame::new(4, 2, 1_000, bgr).unwrap();
//! assert_eq!(frame.width(), 4);
//! assert_eq!(frame.sample_nearest(0.0, 0.0).unwrap().r, 10);
//! ```

use scenecap_geometry::{Color, ColorRange, LayoutAnchor, Line, Point, Rect};

/// Errors constructing a [`Frame`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    /// The pixel buffer length did not match `width * height * 3`.
    #[error("invalid pixel buffer length: expected {expected}, got {actual}")]
    InvalidBufferLength {
        /// Required buffer length.
        expected: usize,
        /// Actual buffer length supplied.
        actual: usize,
    },
    /// `width * height * 3` overflowed `usize`.
    #[error("frame dimensions overflow buffer length computation")]
    DimensionOverflow,
}

fn required_len(width: u32, height: u32) -> Result<usize, FrameError> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|area| area.checked_mul(3))
        .ok_or(FrameError::DimensionOverflow)
}

/// An immutable captured frame: a row-contiguous BGR8 pixel buffer with a
/// monotonic millisecond timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    width: u32,
    height: u32,
    timestamp_ms: u64,
    bgr: Vec<u8>,
}

impl Frame {
    /// Builds a frame, validating that `bgr.len() == width * height * 3`.
    pub fn new(width: u32, height: u32, timestamp_ms: u64, bgr: Vec<u8>) -> Result<Self, FrameError> {
        let expected = required_len(width, height)?;
        if bgr.len() != expected {
            return Err(FrameError::InvalidBufferLength {
                expected,
                actual: bgr.len(),
            });
        }
        Ok(Self {
            width,
            height,
            timestamp_ms,
            bgr,
        })
    }

    /// Frame width in pixels.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Frame height in pixels.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Capture timestamp, host-chosen milliseconds, monotonic within a
    /// session.
    pub fn timestamp_ms(&self) -> u64 {
        self.timestamp_ms
    }

    /// Raw row-contiguous BGR8 pixel buffer.
    pub fn pixels(&self) -> &[u8] {
        &self.bgr
    }

    /// Samples the pixel nearest to the given floating-point pixel
    /// coordinates. Returns `None` if the rounded coordinates fall outside
    /// the frame.
    pub fn sample_nearest(&self, x: f64, y: f64) -> Option<Color> {
        if x < 0.0 || y < 0.0 {
            return None;
        }
        let px = x.round() as i64;
        let py = y.round() as i64;
        if px < 0 || py < 0 || px as u32 >= self.width || py as u32 >= self.height {
            return None;
        }
        let offset = (py as usize * self.width as usize + px as usize) * 3;
        let b = *self.bgr.get(offset)?;
        let g = *self.bgr.get(offset + 1)?;
        let r = *self.bgr.get(offset + 2)?;
        Some(Color::from_bgr_bytes(b, g, r))
    }

    /// Resolves `point` against `geometry` and samples it. `None` if the
    /// resolved coordinate falls outside the frame.
    pub fn color_at(&self, geometry: &FrameGeometry, point: &Point<f64>) -> Option<Color> {
        let (x, y) = geometry.resolve_point(point);
        self.sample_nearest(x, y)
    }

    /// `true` iff [`Frame::color_at`] yields a color and it is inside
    /// `range`.
    pub fn is_in(&self, geometry: &FrameGeometry, range: &ColorRange, point: &Point<f64>) -> bool {
        self.color_at(geometry, point)
            .is_some_and(|color| range.contains(&color))
    }

    /// Scans along `line` (resolved against `geometry`) from `p1` toward
    /// `p2`, returning the longest prefix ratio `[0, 1]` over which sampled
    /// pixels stay within `range`. Stops at the first out-of-range or
    /// out-of-bounds sample. A zero-length resolved line yields `0.0`
    /// ("empty line = length 0 = not met", per the distilled spec's §4.1
    /// edge-case policy).
    pub fn length_in(&self, geometry: &FrameGeometry, range: &ColorRange, line: &Line<f64>) -> f64 {
        let (p1, p2) = geometry.resolve_line(line);
        let pixel_length = ((p2.0 - p1.0).powi(2) + (p2.1 - p1.1).powi(2)).sqrt().round() as i64;
        if pixel_length <= 0 {
            return 0.0;
        }
        let steps = pixel_length as usize;
        let mut last_good_ratio = 0.0_f64;
        for i in 0..=steps {
            let ratio = i as f64 / steps as f64;
            let x = p1.0 + (p2.0 - p1.0) * ratio;
            let y = p1.1 + (p2.1 - p1.1) * ratio;
            match self.sample_nearest(x, y) {
                Some(color) if range.contains(&color) => last_good_ratio = ratio,
                _ => break,
            }
        }
        last_good_ratio
    }
}

/// The letterboxing-aware mapping from anchored fractional coordinates to
/// absolute pixel coordinates for one frame size and design aspect ratio.
///
/// The "intersection rectangle" is the maximal sub-rectangle matching the
/// design aspect ratio, centered inside the frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameGeometry {
    screen_width: f64,
    screen_height: f64,
    intersect_offset_x: f64,
    intersect_offset_y: f64,
    intersect_width: f64,
    intersect_height: f64,
}

impl FrameGeometry {
    /// Computes the geometry for a frame of `frame_width` x `frame_height`
    /// pixels, given the design's `design_width` x `design_height` aspect
    /// ratio.
    pub fn build(frame_width: u32, frame_height: u32, design_width: f64, design_height: f64) -> Self {
        let frame_w = frame_width as f64;
        let frame_h = frame_height as f64;
        let design_ratio = design_width / design_height;
        let frame_ratio = frame_w / frame_h;

        let (intersect_width, intersect_height) = if frame_ratio > design_ratio {
            (frame_h * design_ratio, frame_h)
        } else {
            (frame_w, frame_w / design_ratio)
        };

        Self {
            screen_width: frame_w,
            screen_height: frame_h,
            intersect_offset_x: (frame_w - intersect_width) / 2.0,
            intersect_offset_y: (frame_h - intersect_height) / 2.0,
            intersect_width,
            intersect_height,
        }
    }

    fn resolve_axis(&self, fraction: f64, tag: LayoutAnchor, screen_size: f64, intersect_offset: f64, intersect_size: f64) -> f64 {
        match tag {
            LayoutAnchor::ScreenStart => fraction * screen_size,
            LayoutAnchor::ScreenLogicalEnd => screen_size - fraction * screen_size,
            LayoutAnchor::ScreenPixelEnd => (screen_size - 1.0) - fraction * (screen_size - 1.0),
            LayoutAnchor::IntersectStart => intersect_offset + fraction * intersect_size,
            LayoutAnchor::IntersectLogicalEnd => intersect_offset + intersect_size - fraction * intersect_size,
            LayoutAnchor::IntersectPixelEnd => {
                intersect_offset + (intersect_size - 1.0) - fraction * (intersect_size - 1.0)
            }
        }
    }

    /// Resolves an anchored point to `(x, y)` pixel coordinates.
    pub fn resolve_point(&self, point: &Point<f64>) -> (f64, f64) {
        let x = self.resolve_axis(
            point.x,
            point.anchor.horizontal,
            self.screen_width,
            self.intersect_offset_x,
            self.intersect_width,
        );
        let y = self.resolve_axis(
            point.y,
            point.anchor.vertical,
            self.screen_height,
            self.intersect_offset_y,
            self.intersect_height,
        );
        (x, y)
    }

    /// Resolves a line's two endpoints to pixel coordinates.
    pub fn resolve_line(&self, line: &Line<f64>) -> ((f64, f64), (f64, f64)) {
        (self.resolve_point(&line.p1), self.resolve_point(&line.p2))
    }

    /// Resolves a rectangle's corners to a pixel-space `(left, top, right,
    /// bottom)` tuple.
    pub fn resolve_rect(&self, rect: &Rect<f64>) -> (f64, f64, f64, f64) {
        let (left, top) = self.resolve_point(&rect.top_left);
        let (right, bottom) = self.resolve_point(&rect.bottom_right);
        (left, top, right, bottom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scenecap_geometry::Anchor;

    fn screen_anchor() -> Anchor {
        Anchor::uniform(LayoutAnchor::ScreenStart)
    }

    #[test]
    fn frame_new_rejects_mismatched_buffer_length() {
        let error = Frame::new(2, 2, 0, vec![0u8; 5]).unwrap_err();
        assert_eq!(
            error,
            FrameError::InvalidBufferLength {
                expected: 12,
                actual: 5
            }
        );
    }

    #[test]
    fn sample_nearest_reads_bgr_in_row_major_order() {
        // 2x1 frame: pixel 0 is red (255,0,0) stored BGR, pixel 1 is green.
        let bgr = vec![0, 0, 255, 0, 255, 0];
        let frame = Frame::new(2, 1, 0, bgr).unwrap();
        assert_eq!(frame.sample_nearest(0.0, 0.0), Some(Color::new(255, 0, 0)));
        assert_eq!(frame.sample_nearest(1.0, 0.0), Some(Color::new(0, 255, 0)));
        assert_eq!(frame.sample_nearest(2.0, 0.0), None);
    }

    #[test]
    fn geometry_letterboxes_wider_frame_on_horizontal_axis() {
        // Frame is wider than the 9:16 design ratio -> letterbox left/right.
        let geometry = FrameGeometry::build(1600, 900, 1080.0, 1920.0);
        let point = Point::new(0.0, 0.0, Anchor::uniform(LayoutAnchor::IntersectStart));
        let (x, y) = geometry.resolve_point(&point);
        assert!(x > 0.0, "expected a positive horizontal margin, got {x}");
        assert_eq!(y, 0.0);
    }

    #[test]
    fn length_in_returns_zero_for_zero_length_line() {
        let bgr = vec![10u8; 4 * 2 * 3];
        let frame = Frame::new(4, 2, 0, bgr).unwrap();
        let geometry = FrameGeometry::build(4, 2, 4.0, 2.0);
        let point = Point::new(0.0, 0.0, screen_anchor());
        let line = Line::new(point, point);
        let range = ColorRange::around(Color::new(10, 10, 10), 2);
        assert_eq!(frame.length_in(&geometry, &range, &line), 0.0);
    }

    #[test]
    fn length_in_stops_at_first_out_of_range_sample() {
        // 5x1 frame: first 3 pixels match the range, last 2 do not.
        let mut bgr = Vec::new();
        for i in 0..5u8 {
            let value = if i < 3 { 100 } else { 0 };
            bgr.extend_from_slice(&[value, value, value]);
        }
        let frame = Frame::new(5, 1, 0, bgr).unwrap();
        let geometry = FrameGeometry::build(5, 1, 5.0, 1.0);
        let p1 = Point::new(0.0, 0.0, screen_anchor());
        let p2 = Point::new(1.0, 0.0, screen_anchor());
        let line = Line::new(p1, p2);
        let range = ColorRange::around(Color::new(100, 100, 100), 5);
        let ratio = frame.length_in(&geometry, &range, &line);
        // pixel_length = 5 steps across a 5-pixel-wide line; sample 3 (pixel
        // index 3) is the first out-of-range pixel, so the longest good
        // prefix ratio is step 2 of 5.
        assert!((ratio - 0.4).abs() < 1e-9, "unexpected ratio: {ratio}");
    }
}

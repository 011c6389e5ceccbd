//! A minimal stand-in for `scenecap_frame::FrameGeometry` sized for static
//! images rather than live capture frames.
//!
//! Stitching never letterboxes: every image it touches (the base frame, the
//! vertically concatenated scroll area, the final canvas) is already at its
//! own native resolution, so the "design" and "frame" dimensions an anchor
//! resolves against are always equal. This type exists so [`Rect`] and
//! [`Point`] values keep resolving through the same anchor arithmetic used
//! everywhere else in the workspace, without pulling in `scenecap-frame`'s
//! BGR pixel-sampling machinery that stitching has no use for.

use scenecap_geometry::{LayoutAnchor, Point, Rect};

/// Anchor-resolution geometry for an image with no letterboxing margin.
pub(crate) struct CanvasGeometry {
    width: f64,
    height: f64,
}

impl CanvasGeometry {
    /// Builds a geometry whose screen and intersection rectangles both equal
    /// the full `width` x `height` image.
    pub(crate) fn square(width: u32, height: u32) -> Self {
        Self {
            width: width as f64,
            height: height as f64,
        }
    }

    fn resolve_axis(&self, fraction: f64, tag: LayoutAnchor, size: f64) -> f64 {
        match tag {
            LayoutAnchor::ScreenStart | LayoutAnchor::IntersectStart => fraction * size,
            LayoutAnchor::ScreenLogicalEnd | LayoutAnchor::IntersectLogicalEnd => size - fraction * size,
            LayoutAnchor::ScreenPixelEnd | LayoutAnchor::IntersectPixelEnd => (size - 1.0) - fraction * (size - 1.0),
        }
    }

    pub(crate) fn resolve_point(&self, point: &Point<f64>) -> (f64, f64) {
        let x = self.resolve_axis(point.x, point.anchor.horizontal, self.width);
        let y = self.resolve_axis(point.y, point.anchor.vertical, self.height);
        (x, y)
    }

    pub(crate) fn resolve_rect(&self, rect: &Rect<f64>) -> (f64, f64, f64, f64) {
        let (left, top) = self.resolve_point(&rect.top_left);
        let (right, bottom) = self.resolve_point(&rect.bottom_right);
        (left, top, right, bottom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scenecap_geometry::Anchor;

    #[test]
    fn screen_start_resolves_as_a_fraction_of_the_full_image() {
        let geometry = CanvasGeometry::square(200, 100);
        let point = Point::new(0.5, 0.25, Anchor::uniform(LayoutAnchor::ScreenStart));
        assert_eq!(geometry.resolve_point(&point), (100.0, 25.0));
    }

    #[test]
    fn intersect_and_screen_anchors_agree_with_no_letterboxing() {
        let geometry = CanvasGeometry::square(200, 100);
        let screen = Point::new(0.5, 0.5, Anchor::uniform(LayoutAnchor::ScreenStart));
        let intersect = Point::new(0.5, 0.5, Anchor::uniform(LayoutAnchor::IntersectStart));
        assert_eq!(geometry.resolve_point(&screen), geometry.resolve_point(&intersect));
    }
}

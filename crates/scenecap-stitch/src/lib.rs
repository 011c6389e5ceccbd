//! Per-tab scroll-capture stitching.
//!
//! A completed scrape session leaves behind a base frame and, per tab, a
//! tab-button crop and an ordered run of scroll-area fragments on disk. This
//! crate composes each tab's fragments back into one tall image: the
//! scroll-bar thumb is erased, the base frame is stretched to make room for
//! the extra content, and the fragments are pasted into the gap.

use std::fs;
use std::path::{Path, PathBuf};

use image::{ImageBuffer, Rgb, RgbImage};
use scenecap_geometry::{Color, Line, Rect};
#[cfg(feature = "serde")]
use serde::Deserialize;

mod geometry_bridge;

use geometry_bridge::CanvasGeometry;

/// The three tabs a stitched session produces, in persisted-artifact order.
pub const TAB_NAMES: [&str; 3] = ["skill", "factor", "campaign"];

/// Errors produced while stitching a session.
#[derive(Debug, thiserror::Error)]
pub enum StitchError {
    /// Filesystem or PNG codec failure.
    #[error("io error stitching {path}: {source}")]
    Io {
        /// The path being read or written when the error occurred.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
    /// PNG decode/encode failure.
    #[error("image error stitching {path}: {source}")]
    Image {
        /// The path being decoded or encoded when the error occurred.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: image::ImageError,
    },
    /// A tab directory had no `scroll_area_*.png` fragments.
    #[error("tab {tab} has no scroll area fragments in {dir}")]
    NoFragments {
        /// The tab name.
        tab: String,
        /// The directory that was scanned.
        dir: PathBuf,
    },
    /// The configured stretch range does not lie within the base image.
    #[error("stretch range ({p1_y}, {p2_y}) is outside base image height {base_height}")]
    StretchRangeOutOfBounds {
        /// Resolved top of the stretch band.
        p1_y: f64,
        /// Resolved bottom of the stretch band.
        p2_y: f64,
        /// Height of the base image.
        base_height: u32,
    },
}

/// Per-tab layout configuration, mirroring the persisted artifact's fixed
/// regions of interest.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Deserialize))]
pub struct StitcherConfig {
    /// Vertical band of the base image that gets stretched to absorb the
    /// scroll area's extra height. Horizontal coordinates are ignored.
    pub stretch_range: Line<f64>,
    /// The region of the *base* image that the scroll area replaces, used to
    /// compute how much extra height the canvas needs.
    pub scroll_area_cropping_rect: Rect<f64>,
    /// Horizontal placement of the pasted scroll area within the canvas.
    pub scroll_area_rect: Rect<f64>,
    /// Region within the raw scroll-area image to flood-fill with the
    /// background color, erasing the scroll-bar thumb.
    pub scroll_bar_fill_rect: Rect<f64>,
    /// Seam at the top edge of the pasted scroll area, filled with the
    /// background color to erase capture artifacts.
    pub scroll_area_upper_fill_rect: Rect<f64>,
    /// Seam at the bottom edge of the pasted scroll area.
    pub scroll_area_lower_fill_rect: Rect<f64>,
    /// Placement of the tab-button crop within the canvas.
    pub tab_button_rect: Rect<f64>,
}

/// Stitches every tab of `session_dir` into `<out_dir>/<tab>.png`, then
/// removes `session_dir`.
///
/// `session_dir` must contain `base.png` and, per tab in [`TAB_NAMES`], a
/// `<tab>/tab_button.png` and one or more `<tab>/scroll_area_*.png`
/// fragments in filename order. A tab with no fragments is skipped (not all
/// tabs are necessarily scrollable).
pub fn stitch_session(session_dir: &Path, out_dir: &Path, config: &StitcherConfig) -> Result<Vec<String>, StitchError> {
    let base_path = session_dir.join("base.png");
    let base = load_rgb(&base_path)?;

    fs::create_dir_all(out_dir).map_err(|source| io_err(out_dir, source))?;

    let mut stitched = Vec::new();
    for tab in TAB_NAMES {
        let tab_dir = session_dir.join(tab);
        if !tab_dir.is_dir() {
            continue;
        }
        let fragments = fragment_paths(&tab_dir, tab)?;
        if fragments.is_empty() {
            continue;
        }
        let canvas = stitch_tab(&base, &tab_dir, &fragments, config)?;
        let out_path = out_dir.join(format!("{tab}.png"));
        canvas.save(&out_path).map_err(|source| image_err(&out_path, source))?;
        tracing::info!(tab, fragments = fragments.len(), path = %out_path.display(), "stitched tab");
        stitched.push(tab.to_string());
    }

    fs::remove_dir_all(session_dir).map_err(|source| io_err(session_dir, source))?;
    tracing::info!(session_dir = %session_dir.display(), tabs = stitched.len(), "stitch session complete");
    Ok(stitched)
}

fn fragment_paths(tab_dir: &Path, tab: &str) -> Result<Vec<PathBuf>, StitchError> {
    let mut paths: Vec<PathBuf> = fs::read_dir(tab_dir)
        .map_err(|source| io_err(tab_dir, source))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with("scroll_area_") && name.ends_with(".png"))
        })
        .collect();
    paths.sort();
    if paths.is_empty() {
        return Err(StitchError::NoFragments {
            tab: tab.to_string(),
            dir: tab_dir.to_path_buf(),
        });
    }
    Ok(paths)
}

fn stitch_tab(base: &RgbImage, tab_dir: &Path, fragments: &[PathBuf], config: &StitcherConfig) -> Result<RgbImage, StitchError> {
    let scroll_area = vconcat(fragments)?;
    let background = sample_top_center(&scroll_area);

    let base_geometry = CanvasGeometry::square(base.width(), base.height());
    let (.., cropping_top, .., cropping_bottom) = base_geometry.resolve_rect(&config.scroll_area_cropping_rect);
    let base_scroll_height = (cropping_bottom - cropping_top).max(0.0);
    let extra_height = (scroll_area.height() as f64 - base_scroll_height).max(0.0).round() as u32;

    let canvas_width = base.width();
    let canvas_height = base.height() + extra_height;

    let (_, p1_y) = base_geometry.resolve_point(&config.stretch_range.p1);
    let (_, p2_y) = base_geometry.resolve_point(&config.stretch_range.p2);
    if p1_y < 0.0 || p2_y > base.height() as f64 || p1_y > p2_y {
        return Err(StitchError::StretchRangeOutOfBounds {
            p1_y,
            p2_y,
            base_height: base.height(),
        });
    }

    let mut canvas: RgbImage = ImageBuffer::new(canvas_width, canvas_height);
    paste_stretched_base(&mut canvas, base, p1_y, p2_y, extra_height);

    let scroll_area_geometry = CanvasGeometry::square(scroll_area.width(), scroll_area.height());
    let mut scroll_area = scroll_area;
    fill_rect(&mut scroll_area, &scroll_area_geometry, &config.scroll_bar_fill_rect, background);

    let (scroll_left, _, scroll_right, _) = base_geometry.resolve_rect(&config.scroll_area_rect);
    paste(&mut canvas, &scroll_area, scroll_left.round() as i64, p1_y.round() as i64, scroll_right - scroll_left);

    let tab_button_path = tab_dir.join("tab_button.png");
    if tab_button_path.is_file() {
        let tab_button = load_rgb(&tab_button_path)?;
        let (tb_left, tb_top, tb_right, _) = base_geometry.resolve_rect(&config.tab_button_rect);
        paste(&mut canvas, &tab_button, tb_left.round() as i64, tb_top.round() as i64, tb_right - tb_left);
    }

    let canvas_geometry = CanvasGeometry::square(canvas_width, canvas_height);
    fill_rect(&mut canvas, &canvas_geometry, &config.scroll_area_upper_fill_rect, background);
    fill_rect(&mut canvas, &canvas_geometry, &config.scroll_area_lower_fill_rect, background);

    Ok(canvas)
}

/// Copies the unstretched top and bottom bands verbatim and fills the
/// stretch band by nearest-neighbor row sampling, matching the manual
/// row-copy composition idiom used elsewhere in this workspace.
fn paste_stretched_base(canvas: &mut RgbImage, base: &RgbImage, p1_y: f64, p2_y: f64, extra_height: u32) {
    let width = base.width();
    let top_rows = p1_y.round() as u32;
    for y in 0..top_rows.min(base.height()) {
        copy_row(canvas, base, y, y, width);
    }

    let bottom_rows = base.height().saturating_sub(p2_y.round() as u32);
    for row in 0..bottom_rows {
        let src_y = base.height() - bottom_rows + row;
        let dst_y = canvas.height() - bottom_rows + row;
        copy_row(canvas, base, src_y, dst_y, width);
    }

    let src_band_height = (p2_y - p1_y).max(0.0);
    let dst_band_height = src_band_height + extra_height as f64;
    if dst_band_height <= 0.0 {
        return;
    }
    let dst_band_rows = dst_band_height.round() as u32;
    for row in 0..dst_band_rows {
        let ratio = row as f64 / dst_band_height;
        let src_y = (p1_y + ratio * src_band_height).round() as u32;
        let src_y = src_y.min(base.height().saturating_sub(1));
        let dst_y = top_rows + row;
        copy_row(canvas, base, src_y, dst_y, width);
    }
}

fn copy_row(canvas: &mut RgbImage, src: &RgbImage, src_y: u32, dst_y: u32, width: u32) {
    if src_y >= src.height() || dst_y >= canvas.height() {
        return;
    }
    for x in 0..width.min(canvas.width()) {
        canvas.put_pixel(x, dst_y, *src.get_pixel(x, src_y));
    }
}

/// Pastes `src` into `dst` at `(left, top)`, clamped to `max_width` columns
/// and to both images' bounds.
fn paste(dst: &mut RgbImage, src: &RgbImage, left: i64, top: i64, max_width: f64) {
    let max_width = max_width.max(0.0).round() as u32;
    for y in 0..src.height() {
        let dst_y = top + y as i64;
        if dst_y < 0 || dst_y as u32 >= dst.height() {
            continue;
        }
        for x in 0..src.width().min(max_width) {
            let dst_x = left + x as i64;
            if dst_x < 0 || dst_x as u32 >= dst.width() {
                continue;
            }
            dst.put_pixel(dst_x as u32, dst_y as u32, *src.get_pixel(x, y));
        }
    }
}

fn fill_rect(image: &mut RgbImage, geometry: &CanvasGeometry, rect: &Rect<f64>, color: Color) {
    let (left, top, right, bottom) = geometry.resolve_rect(rect);
    let pixel = color_to_rgb(color);
    let x0 = left.max(0.0).round() as u32;
    let x1 = right.max(0.0).round() as u32;
    let y0 = top.max(0.0).round() as u32;
    let y1 = bottom.max(0.0).round() as u32;
    for y in y0..y1.min(image.height()) {
        for x in x0..x1.min(image.width()) {
            image.put_pixel(x, y, pixel);
        }
    }
}

fn sample_top_center(image: &RgbImage) -> Color {
    let x = image.width() / 2;
    let pixel = image.get_pixel(x, 0);
    Color::new(pixel[0] as i32, pixel[1] as i32, pixel[2] as i32)
}

fn color_to_rgb(color: Color) -> Rgb<u8> {
    let clamped = color.clamp();
    Rgb([clamped.r as u8, clamped.g as u8, clamped.b as u8])
}

fn vconcat(fragments: &[PathBuf]) -> Result<RgbImage, StitchError> {
    let images: Vec<RgbImage> = fragments.iter().map(|path| load_rgb(path)).collect::<Result<_, _>>()?;
    let width = images[0].width();
    let total_height: u32 = images.iter().map(|image| image.height()).sum();
    let mut out: RgbImage = ImageBuffer::new(width, total_height);
    let mut y_offset = 0;
    for image in &images {
        for y in 0..image.height() {
            for x in 0..width.min(image.width()) {
                out.put_pixel(x, y_offset + y, *image.get_pixel(x, y));
            }
        }
        y_offset += image.height();
    }
    Ok(out)
}

fn load_rgb(path: &Path) -> Result<RgbImage, StitchError> {
    Ok(image::open(path).map_err(|source| image_err(path, source))?.to_rgb8())
}

fn io_err(path: &Path, source: std::io::Error) -> StitchError {
    StitchError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn image_err(path: &Path, source: image::ImageError) -> StitchError {
    StitchError::Image {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scenecap_geometry::{Anchor, LayoutAnchor, Point};
    use std::sync::atomic::{AtomicUsize, Ordering};

    static TEST_DIR_COUNTER: AtomicUsize = AtomicUsize::new(0);

    fn unique_test_dir() -> PathBuf {
        let n = TEST_DIR_COUNTER.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!("scenecap-stitch-test-{}-{n}", std::process::id()))
    }

    fn anchor() -> Anchor {
        Anchor::uniform(LayoutAnchor::ScreenStart)
    }

    fn point(x: f64, y: f64) -> Point<f64> {
        Point::new(x, y, anchor())
    }

    fn rect(left: f64, top: f64, right: f64, bottom: f64) -> Rect<f64> {
        Rect::new(point(left, top), point(right, bottom))
    }

    fn write_png(path: &Path, width: u32, height: u32, color: [u8; 3]) {
        let image: RgbImage = ImageBuffer::from_fn(width, height, |_, _| Rgb(color));
        image.save(path).expect("write test fixture png");
    }

    fn sample_config() -> StitcherConfig {
        StitcherConfig {
            stretch_range: Line::new(point(0.0, 20.0), point(0.0, 80.0)),
            scroll_area_cropping_rect: rect(0.0, 20.0, 100.0, 80.0),
            scroll_area_rect: rect(0.0, 20.0, 100.0, 80.0),
            scroll_bar_fill_rect: rect(90.0, 0.0, 100.0, 1_000.0),
            scroll_area_upper_fill_rect: rect(0.0, 19.0, 100.0, 21.0),
            scroll_area_lower_fill_rect: rect(0.0, 1_000.0, 100.0, 1_000.0),
            tab_button_rect: rect(0.0, 0.0, 20.0, 10.0),
        }
    }

    fn write_session(dir: &Path, fragment_heights: &[u32]) {
        fs::create_dir_all(dir).unwrap();
        write_png(&dir.join("base.png"), 100, 100, [10, 20, 30]);
        let tab_dir = dir.join("skill");
        fs::create_dir_all(&tab_dir).unwrap();
        write_png(&tab_dir.join("tab_button.png"), 20, 10, [200, 200, 200]);
        for (index, height) in fragment_heights.iter().enumerate() {
            let name = format!("scroll_area_{index:05}.png");
            write_png(&tab_dir.join(name), 100, *height, [40, 50, 60]);
        }
    }

    #[test]
    fn stitch_session_writes_only_tabs_with_fragments() {
        let root = unique_test_dir();
        let session_dir = root.join("session");
        let out_dir = root.join("out");
        write_session(&session_dir, &[60, 60]);

        let stitched = stitch_session(&session_dir, &out_dir, &sample_config()).expect("stitch succeeds");
        assert_eq!(stitched, vec!["skill".to_string()]);
        assert!(out_dir.join("skill.png").is_file());
        assert!(!session_dir.exists(), "session dir should be cleaned up");

        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn stitched_canvas_grows_by_extra_scroll_height() {
        let root = unique_test_dir();
        let session_dir = root.join("session");
        let out_dir = root.join("out");
        // base scroll region is 60px tall (20..80); fragments sum to 150px,
        // so the canvas should grow by 90px over the 100px base.
        write_session(&session_dir, &[80, 70]);

        stitch_session(&session_dir, &out_dir, &sample_config()).expect("stitch succeeds");
        let canvas = image::open(out_dir.join("skill.png")).unwrap().to_rgb8();
        assert_eq!(canvas.width(), 100);
        assert_eq!(canvas.height(), 190);

        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn missing_fragments_is_an_error_when_forced_directly() {
        let root = unique_test_dir();
        fs::create_dir_all(root.join("empty_tab")).unwrap();
        let error = fragment_paths(&root.join("empty_tab"), "skill").unwrap_err();
        assert!(matches!(error, StitchError::NoFragments { .. }));
        fs::remove_dir_all(&root).ok();
    }
}

//! Persisted-artifact layout and PNG writing (distilled spec §6 "Persisted
//! artifacts per session").
//!
//! `scraping_dir/<uuid>/base.png`, `scraping_dir/<uuid>/<tab>/tab_button.png`,
//! and `scraping_dir/<uuid>/<tab>/scroll_area_<5-digit>.png` are written
//! incrementally as the scrape engine's catchers and page boxes produce new
//! content; `storage_dir/<uuid>/<tab>.png` is written once, by
//! `scenecap_stitch::stitch_session`.

use std::path::{Path, PathBuf};

use image::{ImageBuffer, Rgb, RgbImage};
use scenecap_frame::Frame;
use scenecap_scrape::Fragment;

/// Tab directory names, matching `scenecap_stitch::TAB_NAMES`.
pub(crate) const TAB_NAMES: [&str; 3] = scenecap_stitch::TAB_NAMES;

/// Zero-padded fragment filename width (distilled spec §6: "padded to
/// width 5").
const FRAGMENT_DIGITS: usize = 5;

pub(crate) fn session_dir(scraping_dir: &Path, session_id: &str) -> PathBuf {
    scraping_dir.join(session_id)
}

pub(crate) fn tab_dir(scraping_dir: &Path, session_id: &str, tab: usize) -> PathBuf {
    session_dir(scraping_dir, session_id).join(TAB_NAMES[tab])
}

pub(crate) fn base_path(scraping_dir: &Path, session_id: &str) -> PathBuf {
    session_dir(scraping_dir, session_id).join("base.png")
}

pub(crate) fn tab_button_path(scraping_dir: &Path, session_id: &str, tab: usize) -> PathBuf {
    tab_dir(scraping_dir, session_id, tab).join("tab_button.png")
}

pub(crate) fn fragment_path(scraping_dir: &Path, session_id: &str, tab: usize, index: usize) -> PathBuf {
    tab_dir(scraping_dir, session_id, tab).join(format!("scroll_area_{index:0width$}.png", width = FRAGMENT_DIGITS))
}

/// Errors writing a captured frame/fragment to disk.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    /// Directory creation failed.
    #[error("failed creating directory {path}: {source}")]
    CreateDir {
        /// The directory that could not be created.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
    /// PNG encoding failed.
    #[error("failed writing png {path}: {source}")]
    Encode {
        /// The file that could not be written.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: image::ImageError,
    },
}

fn write_rgb(image: &RgbImage, path: &Path) -> Result<(), PersistError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| PersistError::CreateDir {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    image.save(path).map_err(|source| PersistError::Encode {
        path: path.to_path_buf(),
        source,
    })
}

fn fragment_to_rgb_image(fragment: &Fragment) -> RgbImage {
    ImageBuffer::from_fn(fragment.width(), fragment.height(), |x, y| {
        let color = fragment.color_at(x, y).unwrap_or(scenecap_geometry::Color::new(0, 0, 0));
        Rgb([color.r as u8, color.g as u8, color.b as u8])
    })
}

fn frame_to_rgb_image(frame: &Frame) -> RgbImage {
    let bgr = frame.pixels();
    ImageBuffer::from_fn(frame.width(), frame.height(), |x, y| {
        let offset = (y as usize * frame.width() as usize + x as usize) * 3;
        Rgb([bgr[offset + 2], bgr[offset + 1], bgr[offset]])
    })
}

/// Writes a captured [`Fragment`] as a new `scroll_area_<index>.png`.
pub(crate) fn write_fragment(scraping_dir: &Path, session_id: &str, tab: usize, index: usize, fragment: &Fragment) -> Result<(), PersistError> {
    let path = fragment_path(scraping_dir, session_id, tab, index);
    write_rgb(&fragment_to_rgb_image(fragment), &path)
}

/// Writes a tab's `tab_button.png` crop.
pub(crate) fn write_tab_button(scraping_dir: &Path, session_id: &str, tab: usize, fragment: &Fragment) -> Result<(), PersistError> {
    let path = tab_button_path(scraping_dir, session_id, tab);
    write_rgb(&fragment_to_rgb_image(fragment), &path)
}

/// Writes the session's stationary `base.png`.
pub(crate) fn write_base(scraping_dir: &Path, session_id: &str, frame: &Frame) -> Result<(), PersistError> {
    let path = base_path(scraping_dir, session_id);
    write_rgb(&frame_to_rgb_image(frame), &path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragment_paths_are_zero_padded_to_five_digits() {
        let path = fragment_path(Path::new("/tmp/scrape"), "abc", 0, 3);
        assert_eq!(path.file_name().unwrap().to_str().unwrap(), "scroll_area_00003.png");
    }

    #[test]
    fn tab_dir_uses_tab_name_not_index() {
        let path = tab_dir(Path::new("/tmp/scrape"), "abc", 1);
        assert!(path.ends_with("abc/factor"));
    }
}

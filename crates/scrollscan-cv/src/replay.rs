//! Offline frame source replaying recorded screenshots.
//!
//! Each scroll advances to the next screenshot regardless of the requested
//! amount. Past the last screenshot the scroll is still accepted and the
//! last image keeps coming back, like a feed that has hit its bottom.

use crate::session::{CaptureError, ScrollDirection};
use crate::traits::FrameSource;
use crate::utils::ImageUtils;
use crate::Result;
use image::RgbaImage;
use std::path::{Path, PathBuf};

enum Frames {
    Files(Vec<PathBuf>),
    Memory(Vec<RgbaImage>),
}

/// Replays a directory (or list) of screenshots in order.
pub struct ReplaySource {
    frames: Frames,
    position: usize,
    captures: usize,
}

impl ReplaySource {
    /// Every image directly inside `dir`, in file name order.
    pub fn from_dir<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let paths = ImageUtils::list_images(&dir)?;
        if paths.is_empty() {
            anyhow::bail!("No screenshots found in {:?}", dir.as_ref());
        }
        log::info!("replaying {} screenshots from {:?}", paths.len(), dir.as_ref());
        Ok(Self::from_paths(paths))
    }

    pub fn from_paths(paths: Vec<PathBuf>) -> Self {
        Self {
            frames: Frames::Files(paths),
            position: 0,
            captures: 0,
        }
    }

    pub fn from_images(images: Vec<RgbaImage>) -> Self {
        Self {
            frames: Frames::Memory(images),
            position: 0,
            captures: 0,
        }
    }

    pub fn len(&self) -> usize {
        match &self.frames {
            Frames::Files(paths) => paths.len(),
            Frames::Memory(images) => images.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Index of the screenshot the next capture returns
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn captures(&self) -> usize {
        self.captures
    }

    pub fn at_end(&self) -> bool {
        self.position + 1 >= self.len()
    }
}

impl FrameSource for ReplaySource {
    fn capture_frame(&mut self) -> std::result::Result<RgbaImage, CaptureError> {
        self.captures += 1;
        match &self.frames {
            Frames::Files(paths) => {
                let path = paths.get(self.position).ok_or(CaptureError::NoImage)?;
                ImageUtils::load_rgba(path).map_err(|e| CaptureError::Primitive(format!("{:#}", e)))
            }
            Frames::Memory(images) => images
                .get(self.position)
                .cloned()
                .ok_or(CaptureError::NoImage),
        }
    }

    fn scroll(&mut self, amount: u32, direction: ScrollDirection) -> bool {
        if !self.at_end() {
            self.position += 1;
        }
        log::trace!(
            "replay scroll {} by {} px -> screenshot {}",
            direction,
            amount,
            self.position
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn shade(value: u8) -> RgbaImage {
        RgbaImage::from_pixel(6, 4, image::Rgba([value, value, value, 255]))
    }

    #[test]
    fn test_scroll_advances_and_sticks_at_end() -> std::result::Result<(), CaptureError> {
        let mut source = ReplaySource::from_images(vec![shade(10), shade(20)]);

        assert_eq!(source.capture_frame()?.get_pixel(0, 0)[0], 10);
        assert!(source.scroll(300, ScrollDirection::Down));
        assert_eq!(source.capture_frame()?.get_pixel(0, 0)[0], 20);

        assert!(source.scroll(300, ScrollDirection::Down));
        assert_eq!(source.position(), 1);
        assert_eq!(source.capture_frame()?.get_pixel(0, 0)[0], 20);
        assert_eq!(source.captures(), 3);
        Ok(())
    }

    #[test]
    fn test_empty_source_reports_no_image() {
        let mut source = ReplaySource::from_images(Vec::new());
        assert!(matches!(source.capture_frame(), Err(CaptureError::NoImage)));
    }

    #[test]
    fn test_from_dir_reads_in_name_order() -> Result<()> {
        let dir = tempdir()?;
        shade(90).save(dir.path().join("b.png"))?;
        shade(30).save(dir.path().join("a.png"))?;

        let mut source = ReplaySource::from_dir(dir.path())?;
        assert_eq!(source.len(), 2);
        assert_eq!(source.capture_frame()?.get_pixel(0, 0)[0], 30);
        Ok(())
    }

    #[test]
    fn test_from_empty_dir_fails() -> Result<()> {
        let dir = tempdir()?;
        assert!(ReplaySource::from_dir(dir.path()).is_err());
        Ok(())
    }
}

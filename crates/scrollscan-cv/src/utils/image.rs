//! Image loading and saving helpers

use crate::Result;
use anyhow::Context;
use image::{GrayImage, RgbaImage};
use std::path::{Path, PathBuf};

/// Extensions recognized when scanning directories for images.
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp"];

/// Image utility functions
pub struct ImageUtils;

impl ImageUtils {
    /// Load image as RGBA
    pub fn load_rgba<P: AsRef<Path>>(path: P) -> Result<RgbaImage> {
        let img = image::open(&path)
            .with_context(|| format!("Failed to open image: {:?}", path.as_ref()))?;
        Ok(img.to_rgba8())
    }

    /// Load image as grayscale
    pub fn load_grayscale<P: AsRef<Path>>(path: P) -> Result<GrayImage> {
        let img = image::open(&path)
            .with_context(|| format!("Failed to open image: {:?}", path.as_ref()))?;
        Ok(img.to_luma8())
    }

    /// Save an RGBA image; the format follows the file extension
    pub fn save_image<P: AsRef<Path>>(image: &RgbaImage, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }

        image
            .save(path)
            .with_context(|| format!("Failed to save image: {:?}", path))?;

        Ok(())
    }

    pub fn is_image_path(path: &Path) -> bool {
        path.extension()
            .map(|ext| {
                let ext = ext.to_string_lossy().to_lowercase();
                IMAGE_EXTENSIONS.contains(&ext.as_str())
            })
            .unwrap_or(false)
    }

    /// Image files directly inside `dir`, sorted by file name
    pub fn list_images<P: AsRef<Path>>(dir: P) -> Result<Vec<PathBuf>> {
        let dir = dir.as_ref();
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read directory: {:?}", dir))?
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && Self::is_image_path(path))
            .collect();

        paths.sort();
        Ok(paths)
    }
}

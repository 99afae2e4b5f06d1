use std::fs;
use std::path::{Path, PathBuf};

use image::{ImageFormat, RgbImage};

use crate::errors::{PipelineError, Result};

pub const IMAGE_FILE: &str = "image.jpg";
pub const MASK_FILE: &str = "mask.jpg";
pub const INPAINT_FILE: &str = "image_inpaint.jpg";
pub const PROMPT_FILE: &str = "prompt.txt";
pub const COMBINED_FILE: &str = "combined_image.jpg";

/// Fixed file names every run writes directly under its output directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLayout {
    root: PathBuf,
}

impl OutputLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Creates the directory (and its parents) if it is missing.
    pub fn create(root: impl Into<PathBuf>) -> Result<Self> {
        let layout = Self::new(root);
        fs::create_dir_all(&layout.root)
            .map_err(|e| PipelineError::file_system(&layout.root, "output directory creation", e))?;
        Ok(layout)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn image(&self) -> PathBuf {
        self.root.join(IMAGE_FILE)
    }

    pub fn mask(&self) -> PathBuf {
        self.root.join(MASK_FILE)
    }

    pub fn inpainted(&self) -> PathBuf {
        self.root.join(INPAINT_FILE)
    }

    pub fn prompt(&self) -> PathBuf {
        self.root.join(PROMPT_FILE)
    }

    pub fn combined(&self) -> PathBuf {
        self.root.join(COMBINED_FILE)
    }
}

/// Images of one run together with where they were written.
#[derive(Debug, Clone)]
pub struct StageArtifacts {
    pub image: RgbImage,
    pub mask: RgbImage,
    pub inpainted: RgbImage,
    pub layout: OutputLayout,
}

/// Saves `image` as JPEG, replacing whatever is at `path`.
pub fn save_jpeg(image: &RgbImage, path: &Path) -> Result<()> {
    image
        .save_with_format(path, ImageFormat::Jpeg)
        .map_err(|e| PipelineError::ImageProcessing {
            path: path.display().to_string(),
            operation: "jpeg save".to_string(),
            source: Box::new(e),
        })
}

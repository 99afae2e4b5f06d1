use crate::errors::Result;
use image::{GrayImage, ImageBuffer, Luma, RgbImage};

/// Per-pixel category scores produced by a segmentation model.
pub type CategoryMask = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Text-to-image model.
///
/// Stages only depend on these traits, so the pipeline runs the same against
/// ONNX exports and the mocks used in tests.
pub trait ImageGenerator {
    /// Produces one image for `prompt`. The same seed yields the same image.
    fn generate(&self, prompt: &str, seed: u64) -> Result<RgbImage>;
}

/// Image segmentation model.
pub trait ImageSegmentationModel {
    /// Returns a category score for every pixel of `image`, at the image's
    /// own resolution. Scores above the configured threshold are foreground.
    fn category_mask(&self, image: &RgbImage) -> Result<CategoryMask>;
}

/// Prompt-guided inpainting model.
pub trait InpaintingModel {
    /// Regenerates the white region of `mask` following `prompt` and keeps
    /// the rest of `image`. Both inputs have the same square size.
    fn inpaint(
        &self,
        prompt: &str,
        image: &RgbImage,
        mask: &GrayImage,
        seed: u64,
    ) -> Result<RgbImage>;
}

use std::path::Path;

use image::{Rgb, RgbImage};
use tracing::debug;

use crate::{
    config::PipelineConfig,
    errors::{PipelineError, Result, Stage},
    imageops_ai::{binarize, resize_to_fit},
    traits::ImageSegmentationModel,
};

/// Turns a segmentation model's category scores into the black/white mask the
/// inpainter consumes.
pub struct Segmenter<S: ImageSegmentationModel> {
    model: S,
    threshold: f32,
    mask_color: Rgb<u8>,
    background_color: Rgb<u8>,
    bound: u32,
}

impl<S: ImageSegmentationModel> Segmenter<S> {
    pub fn new(model: S, config: &PipelineConfig) -> Self {
        Self {
            model,
            threshold: config.category_threshold,
            mask_color: Rgb(config.mask_color),
            background_color: Rgb(config.background_color),
            bound: config.image_size,
        }
    }

    /// Foreground in the mask colour, background in the background colour,
    /// resized so the longer side equals the configured bound.
    pub fn segment(&self, image: &RgbImage) -> Result<RgbImage> {
        let category = self
            .model
            .category_mask(image)
            .map_err(|e| e.in_stage(Stage::Segmenter))?;
        if category.dimensions() != image.dimensions() {
            return Err(PipelineError::model(
                Stage::Segmenter,
                "category mask check",
                format!(
                    "mask is {:?} but the image is {:?}",
                    category.dimensions(),
                    image.dimensions()
                ),
            ));
        }

        let mask = binarize(
            &category,
            self.threshold,
            self.mask_color,
            self.background_color,
        );
        let mask = resize_to_fit(&mask, self.bound);
        debug!(dimensions = ?mask.dimensions(), "segmentation mask ready");
        Ok(mask)
    }

    /// Same as [`Segmenter::segment`] for an image on disk.
    pub fn segment_file(&self, image_path: &Path) -> Result<RgbImage> {
        if !image_path.is_file() {
            return Err(PipelineError::file_system(
                image_path,
                "segmentation input lookup",
                std::io::Error::new(std::io::ErrorKind::NotFound, "image file does not exist"),
            ));
        }
        let image = image::open(image_path)
            .map_err(|e| PipelineError::ImageProcessing {
                path: image_path.display().to_string(),
                operation: "image load".to_string(),
                source: Box::new(e),
            })?
            .into_rgb8();
        self.segment(&image)
    }
}

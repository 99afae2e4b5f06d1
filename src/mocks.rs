use std::cell::RefCell;

use image::{GrayImage, ImageBuffer, Luma, Rgb, RgbImage};

use crate::errors::{PipelineError, Result, Stage};
use crate::traits::{CategoryMask, ImageGenerator, ImageSegmentationModel, InpaintingModel};

/// Test generator: a gradient whose blue channel encodes the seed.
#[derive(Debug, Default)]
pub struct MockGenerator {
    pub width: u32,
    pub height: u32,
    pub prompts: RefCell<Vec<String>>,
}

impl MockGenerator {
    pub fn new(image_size: u32) -> Self {
        Self::with_dimensions(image_size, image_size)
    }

    /// A generator whose output is not the square size the inpainter needs.
    pub fn with_dimensions(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            prompts: RefCell::new(Vec::new()),
        }
    }
}

impl ImageGenerator for MockGenerator {
    fn generate(&self, prompt: &str, seed: u64) -> Result<RgbImage> {
        self.prompts.borrow_mut().push(prompt.to_string());
        Ok(RgbImage::from_fn(self.width, self.height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, (seed % 256) as u8])
        }))
    }
}

#[derive(Debug, Clone, Copy)]
enum MockMask {
    LeftHalf,
    Uniform(f32),
    Failing,
}

/// Test segmentation model with a fixed score layout.
#[derive(Debug, Clone)]
pub struct MockSegmentationModel {
    mask: MockMask,
}

impl MockSegmentationModel {
    /// Left half of the image is foreground (category 1).
    pub const fn left_half() -> Self {
        Self {
            mask: MockMask::LeftHalf,
        }
    }

    pub const fn uniform(score: f32) -> Self {
        Self {
            mask: MockMask::Uniform(score),
        }
    }

    /// Every call fails like a broken model file would.
    pub const fn failing() -> Self {
        Self {
            mask: MockMask::Failing,
        }
    }
}

impl ImageSegmentationModel for MockSegmentationModel {
    fn category_mask(&self, image: &RgbImage) -> Result<CategoryMask> {
        let (width, height) = image.dimensions();
        match self.mask {
            MockMask::LeftHalf => Ok(ImageBuffer::from_fn(width, height, |x, _| {
                Luma([if x < width / 2 { 1.0 } else { 0.0 }])
            })),
            MockMask::Uniform(score) => Ok(ImageBuffer::from_pixel(width, height, Luma([score]))),
            MockMask::Failing => Err(PipelineError::model(
                Stage::Generator,
                "mock inference",
                "mock segmentation model failure",
            )),
        }
    }
}

/// Test inpainter: paints the masked region with `fill` and keeps the rest.
/// Records the prompt and the image and mask sizes of every call.
#[derive(Debug)]
pub struct MockInpainter {
    pub fill: Rgb<u8>,
    pub prompts: RefCell<Vec<String>>,
    pub input_sizes: RefCell<Vec<((u32, u32), (u32, u32))>>,
}

impl MockInpainter {
    pub fn new(fill: Rgb<u8>) -> Self {
        Self {
            fill,
            prompts: RefCell::new(Vec::new()),
            input_sizes: RefCell::new(Vec::new()),
        }
    }
}

impl InpaintingModel for MockInpainter {
    fn inpaint(
        &self,
        prompt: &str,
        image: &RgbImage,
        mask: &GrayImage,
        _seed: u64,
    ) -> Result<RgbImage> {
        self.input_sizes
            .borrow_mut()
            .push((image.dimensions(), mask.dimensions()));
        if image.dimensions() != mask.dimensions() {
            return Err(PipelineError::Validation {
                field: "mask".to_string(),
                reason: "does not match the image size".to_string(),
            });
        }
        self.prompts.borrow_mut().push(prompt.to_string());

        let mut output = image.clone();
        for (pixel, Luma([m])) in output.pixels_mut().zip(mask.pixels()) {
            if *m >= 128 {
                *pixel = self.fill;
            }
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_generator_is_seeded() -> Result<()> {
        let generator = MockGenerator::new(16);
        let a = generator.generate("a cat", 1024)?;
        let b = generator.generate("a cat", 1024)?;
        assert_eq!(a, b);
        assert_eq!(a.dimensions(), (16, 16));
        assert_eq!(
            MockGenerator::with_dimensions(20, 10)
                .generate("a cat", 1)?
                .dimensions(),
            (20, 10)
        );
        assert_eq!(generator.prompts.borrow().len(), 2);
        Ok(())
    }

    #[test]
    fn test_mock_inpainter_fills_mask() -> Result<()> {
        let inpainter = MockInpainter::new(Rgb([1, 2, 3]));
        let image = RgbImage::new(4, 4);
        let mask = GrayImage::from_fn(4, 4, |x, _| Luma([if x == 0 { 255 } else { 0 }]));

        let output = inpainter.inpaint("red hair", &image, &mask, 0)?;
        assert_eq!(output.get_pixel(0, 2), &Rgb([1, 2, 3]));
        assert_eq!(output.get_pixel(3, 2), &Rgb([0, 0, 0]));
        Ok(())
    }

    #[test]
    fn test_mock_segmentation_uniform() -> Result<()> {
        let mask = MockSegmentationModel::uniform(0.5).category_mask(&RgbImage::new(3, 2))?;
        assert_eq!(mask.dimensions(), (3, 2));
        assert!(mask.pixels().all(|p| p[0] == 0.5));
        Ok(())
    }
}

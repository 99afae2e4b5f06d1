pub mod artifacts;
pub mod config;
pub mod diffusion;
pub mod errors;
pub mod generator;
pub mod imageops_ai;
pub mod inpainter;
pub mod model;
pub mod report;
pub mod scheduler;
pub mod segmenter;
pub mod session;
pub mod traits;

pub mod mocks;

use std::time::Instant;

use tracing::info;

pub use artifacts::{save_jpeg, OutputLayout, StageArtifacts};
pub use config::{Cli, PipelineConfig, SegmentationMode};
pub use errors::{PipelineError, Result, Stage};
pub use generator::OnnxTextToImage;
pub use inpainter::OnnxInpainter;
pub use model::OnnxSegmenter;
pub use report::{plot_images, write_strings_to_file, ReportOutcome};
pub use segmenter::Segmenter;
pub use traits::*;

use imageops_ai::{resize_square, to_gray_mask};

/// Generate → segment → inpaint, one stage after the other.
///
/// Stages hand images to each other in memory; each result is also written
/// to its fixed file under the output directory as soon as it exists, so a
/// failing stage leaves the earlier artifacts behind.
pub struct StoryPipeline<G, S, I>
where
    G: ImageGenerator,
    S: ImageSegmentationModel,
    I: InpaintingModel,
{
    generator: G,
    segmenter: Segmenter<S>,
    inpainter: I,
    config: PipelineConfig,
}

impl<G, S, I> StoryPipeline<G, S, I>
where
    G: ImageGenerator,
    S: ImageSegmentationModel,
    I: InpaintingModel,
{
    pub fn new(generator: G, segmentation_model: S, inpainter: I, config: PipelineConfig) -> Self {
        Self {
            generator,
            segmenter: Segmenter::new(segmentation_model, &config),
            inpainter,
            config,
        }
    }

    pub fn run(
        &self,
        prompt: &str,
        prompt_inpaint: &str,
        layout: &OutputLayout,
    ) -> Result<StageArtifacts> {
        self.config.validate()?;
        check_prompt("prompt", prompt)?;
        check_prompt("prompt_inpaint", prompt_inpaint)?;
        let size = self.config.image_size;

        let started = Instant::now();
        let image = self
            .generator
            .generate(prompt, self.config.seed)
            .map_err(|e| e.in_stage(Stage::Generator))?;
        save_jpeg(&image, &layout.image())?;
        info!(stage = %Stage::Generator, elapsed = ?started.elapsed(), "image generated");

        let started = Instant::now();
        let mask = self.segmenter.segment(&image)?;
        save_jpeg(&mask, &layout.mask())?;
        info!(stage = %Stage::Segmenter, elapsed = ?started.elapsed(), "mask created");

        // The mask is already fitted to the bound; both inputs still go
        // through a square resize since the inpainter needs exact squares.
        let square_image = resize_square(&image, size);
        let square_mask = to_gray_mask(&resize_square(&mask, size));

        let started = Instant::now();
        let inpainted = self
            .inpainter
            .inpaint(prompt_inpaint, &square_image, &square_mask, self.config.seed)
            .map_err(|e| e.in_stage(Stage::Inpainter))?;
        save_jpeg(&inpainted, &layout.inpainted())?;
        info!(stage = %Stage::Inpainter, elapsed = ?started.elapsed(), "image inpainted");

        Ok(StageArtifacts {
            image,
            mask,
            inpainted,
            layout: layout.clone(),
        })
    }
}

// ONNX-backed pipeline as used by the binary
impl StoryPipeline<OnnxTextToImage, OnnxSegmenter, OnnxInpainter> {
    pub fn with_onnx_models(config: PipelineConfig, mode: SegmentationMode) -> Result<Self> {
        config.validate()?;
        let settings = diffusion::DiffusionSettings::from(&config);
        let tokenizer = config.tokenizer.as_deref();

        let generator = OnnxTextToImage::new(&config.generator_model, tokenizer, settings.clone())?;
        let segmentation_model =
            OnnxSegmenter::new(config.segmentation_model(mode), mode, config.device_id)?;
        let inpainter = OnnxInpainter::new(&config.inpaint_model, tokenizer, settings)?;

        Ok(Self::new(generator, segmentation_model, inpainter, config))
    }
}

fn check_prompt(field: &str, prompt: &str) -> Result<()> {
    if prompt.is_empty() {
        return Err(PipelineError::Validation {
            field: field.to_string(),
            reason: "must not be empty".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{MockGenerator, MockInpainter, MockSegmentationModel};
    use image::Rgb;
    use tempfile::TempDir;

    fn mock_pipeline(
        segmentation: MockSegmentationModel,
    ) -> StoryPipeline<MockGenerator, MockSegmentationModel, MockInpainter> {
        StoryPipeline::new(
            MockGenerator::new(512),
            segmentation,
            MockInpainter::new(Rgb([0, 255, 0])),
            PipelineConfig::default(),
        )
    }

    #[test]
    fn test_run_writes_stage_artifacts() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let layout = OutputLayout::new(temp_dir.path());
        let pipeline = mock_pipeline(MockSegmentationModel::left_half());

        let artifacts = pipeline.run("a wizard", "a red hat", &layout)?;
        assert!(layout.image().is_file());
        assert!(layout.mask().is_file());
        assert!(layout.inpainted().is_file());
        assert_eq!(artifacts.image.dimensions(), (512, 512));
        assert_eq!(artifacts.mask.dimensions(), (512, 512));
        // left half repainted, right half untouched
        assert_eq!(artifacts.inpainted.get_pixel(10, 10), &Rgb([0, 255, 0]));
        assert_eq!(artifacts.inpainted.get_pixel(500, 10), artifacts.image.get_pixel(500, 10));
        Ok(())
    }

    #[test]
    fn test_run_passes_prompts_and_seed() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let layout = OutputLayout::new(temp_dir.path());
        let pipeline = mock_pipeline(MockSegmentationModel::uniform(0.0));

        let artifacts = pipeline.run("a wizard", "a red hat", &layout)?;
        assert_eq!(pipeline.generator.prompts.borrow().as_slice(), ["a wizard"]);
        assert_eq!(pipeline.inpainter.prompts.borrow().as_slice(), ["a red hat"]);
        // mock generator stores the seed in the blue channel
        assert_eq!(artifacts.image.get_pixel(0, 0)[2], (1024 % 256) as u8);
        Ok(())
    }

    #[test]
    fn test_empty_prompt_is_rejected_before_any_stage() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let layout = OutputLayout::new(temp_dir.path());
        let pipeline = mock_pipeline(MockSegmentationModel::left_half());

        let result = pipeline.run("", "a red hat", &layout);
        assert!(matches!(result, Err(PipelineError::Validation { .. })));
        assert!(!layout.image().exists());
        Ok(())
    }

    #[test]
    fn test_whitespace_prompt_is_accepted() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let layout = OutputLayout::new(temp_dir.path());
        let pipeline = mock_pipeline(MockSegmentationModel::left_half());

        pipeline.run("  ", "a red hat", &layout)?;
        assert_eq!(pipeline.generator.prompts.borrow().as_slice(), ["  "]);
        Ok(())
    }

    #[test]
    fn test_invalid_config_is_rejected_before_any_stage() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let layout = OutputLayout::new(temp_dir.path());
        let config = PipelineConfig {
            image_size: 500,
            ..PipelineConfig::default()
        };
        let pipeline = StoryPipeline::new(
            MockGenerator::new(500),
            MockSegmentationModel::left_half(),
            MockInpainter::new(Rgb([0, 255, 0])),
            config,
        );

        let result = pipeline.run("a wizard", "a red hat", &layout);
        assert!(matches!(result, Err(PipelineError::Configuration { .. })));
        assert!(!layout.image().exists());
        Ok(())
    }

    #[test]
    fn test_non_square_image_is_squared_before_inpainting() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let layout = OutputLayout::new(temp_dir.path());
        let pipeline = StoryPipeline::new(
            MockGenerator::with_dimensions(640, 480),
            MockSegmentationModel::left_half(),
            MockInpainter::new(Rgb([0, 255, 0])),
            PipelineConfig::default(),
        );

        let artifacts = pipeline.run("a wizard", "a red hat", &layout)?;
        assert_eq!(artifacts.image.dimensions(), (640, 480));
        assert_eq!(artifacts.mask.dimensions(), (512, 384));
        assert_eq!(image::image_dimensions(layout.mask())?, (512, 384));
        assert_eq!(
            pipeline.inpainter.input_sizes.borrow().as_slice(),
            [((512, 512), (512, 512))]
        );
        assert_eq!(artifacts.inpainted.dimensions(), (512, 512));
        Ok(())
    }

    #[test]
    fn test_segmenter_failure_keeps_generated_image() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let layout = OutputLayout::new(temp_dir.path());
        let pipeline = mock_pipeline(MockSegmentationModel::failing());

        let err = pipeline.run("a wizard", "a red hat", &layout).unwrap_err();
        assert_eq!(err.stage(), Some(Stage::Segmenter));
        assert!(layout.image().is_file());
        assert!(!layout.mask().exists());
        assert!(!layout.inpainted().exists());
        Ok(())
    }
}

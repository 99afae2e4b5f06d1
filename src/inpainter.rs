use std::path::Path;

use image::{GrayImage, RgbImage};
use ndarray::{concatenate, prelude::*};
use tracing::info;

use crate::{
    diffusion::{image_to_tensor, mask_to_tensor, Component, DiffusionSettings, StableDiffusion},
    errors::{PipelineError, Result, Stage},
    traits::InpaintingModel,
};

/// Prompt-guided inpainting with a Stable Diffusion inpainting ONNX export.
///
/// The UNet of these checkpoints takes nine channels: the noisy latents, the
/// mask at latent resolution, and the latents of the image with the masked
/// region blanked out.
pub struct OnnxInpainter {
    diffusion: StableDiffusion,
}

impl OnnxInpainter {
    pub fn new(
        model_dir: &Path,
        tokenizer: Option<&Path>,
        settings: DiffusionSettings,
    ) -> Result<Self> {
        let diffusion = StableDiffusion::open(
            model_dir,
            tokenizer,
            &[
                Component::TextEncoder,
                Component::Unet,
                Component::VaeDecoder,
                Component::VaeEncoder,
            ],
            settings,
            Stage::Inpainter,
        )?;
        Ok(Self { diffusion })
    }

    fn run(
        &self,
        prompt: &str,
        image: &RgbImage,
        mask: &GrayImage,
        seed: u64,
    ) -> Result<RgbImage> {
        let (width, height) = image.dimensions();
        let side = self.diffusion.latent_side() as u32;

        let image_tensor = image_to_tensor(image);
        let full_mask = mask_to_tensor(mask, width, height);
        let masked_image = &image_tensor * &full_mask.mapv(|m| 1.0 - m);
        let masked_latents = self.diffusion.encode_image(&masked_image)?;

        let latent_mask = mask_to_tensor(mask, side, side);
        let conditioning = concatenate(Axis(1), &[latent_mask.view(), masked_latents.view()])?;
        let conditioning = concatenate(Axis(0), &[conditioning.view(), conditioning.view()])?;

        let embeddings = self.diffusion.encode_prompt(prompt)?;
        let latents = self.diffusion.initial_latents(seed);
        let latents = self
            .diffusion
            .denoise(&embeddings, latents, Some(&conditioning))?;
        self.diffusion.decode(&latents)
    }
}

impl InpaintingModel for OnnxInpainter {
    fn inpaint(
        &self,
        prompt: &str,
        image: &RgbImage,
        mask: &GrayImage,
        seed: u64,
    ) -> Result<RgbImage> {
        let size = self.diffusion.settings().image_size;
        check_square(image.dimensions(), size, "image")?;
        check_square(mask.dimensions(), size, "mask")?;

        info!(seed, size, "inpainting masked region");
        self.run(prompt, image, mask, seed)
            .map_err(|e| e.in_stage(Stage::Inpainter))
    }
}

/// Inpainting inputs must already be `size`×`size`.
pub fn check_square(dimensions: (u32, u32), size: u32, field: &str) -> Result<()> {
    if dimensions != (size, size) {
        return Err(PipelineError::Validation {
            field: field.to_string(),
            reason: format!(
                "must be {}x{} before inpainting, got {}x{}",
                size, size, dimensions.0, dimensions.1
            ),
        });
    }
    Ok(())
}

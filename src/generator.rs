use std::path::Path;

use image::RgbImage;
use tracing::info;

use crate::{
    diffusion::{Component, DiffusionSettings, StableDiffusion},
    errors::{Result, Stage},
    traits::ImageGenerator,
};

/// Text-to-image generation with a Stable Diffusion v1 ONNX export.
pub struct OnnxTextToImage {
    diffusion: StableDiffusion,
}

impl OnnxTextToImage {
    pub fn new(
        model_dir: &Path,
        tokenizer: Option<&Path>,
        settings: DiffusionSettings,
    ) -> Result<Self> {
        let diffusion = StableDiffusion::open(
            model_dir,
            tokenizer,
            &[Component::TextEncoder, Component::Unet, Component::VaeDecoder],
            settings,
            Stage::Generator,
        )?;
        Ok(Self { diffusion })
    }

    fn run(&self, prompt: &str, seed: u64) -> Result<RgbImage> {
        let embeddings = self.diffusion.encode_prompt(prompt)?;
        let latents = self.diffusion.initial_latents(seed);
        let latents = self.diffusion.denoise(&embeddings, latents, None)?;
        self.diffusion.decode(&latents)
    }
}

impl ImageGenerator for OnnxTextToImage {
    fn generate(&self, prompt: &str, seed: u64) -> Result<RgbImage> {
        info!(seed, size = self.diffusion.settings().image_size, "generating image");
        self.run(prompt, seed)
            .map_err(|e| e.in_stage(Stage::Generator))
    }
}

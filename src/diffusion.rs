//! Stable Diffusion v1 driven through its diffusers-layout ONNX export.
//!
//! An export directory holds one `model.onnx` per component
//! (`text_encoder`, `unet`, `vae_decoder`, and `vae_encoder` for inpainting)
//! plus the CLIP tokenizer. Models are expected in fp32. Each component is
//! opened only for the part of the run that needs it.

use std::path::{Path, PathBuf};

use image::{imageops, imageops::FilterType, GrayImage, Rgb, RgbImage};
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::{concatenate, prelude::*};
use nshare::AsNdarray3;
use ort::{session::Session, tensor::TensorElementType, value::TensorRef};
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg32;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::{
    config::{PipelineConfig, VAE_FACTOR},
    errors::{PipelineError, Result, Stage},
    scheduler::DdimScheduler,
    session::{first_output_name, input_element_type, load_session},
};

/// Scale between VAE latents and the space the UNet was trained on.
pub const LATENT_SCALE: f32 = 0.18215;
/// CLIP context length.
pub const MAX_TOKENS: usize = 77;
const LATENT_CHANNELS: usize = 4;
const END_OF_TEXT: &str = "<|endoftext|>";

/// Sampling parameters shared by generation and inpainting.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffusionSettings {
    pub steps: usize,
    pub guidance_scale: f32,
    pub image_size: u32,
    pub device_id: i32,
}

impl From<&PipelineConfig> for DiffusionSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            steps: config.num_inference_steps,
            guidance_scale: config.guidance_scale,
            image_size: config.image_size,
            device_id: config.device_id,
        }
    }
}

/// Component of an ONNX export directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    TextEncoder,
    Unet,
    VaeDecoder,
    VaeEncoder,
}

impl Component {
    const fn dir_name(self) -> &'static str {
        match self {
            Self::TextEncoder => "text_encoder",
            Self::Unet => "unet",
            Self::VaeDecoder => "vae_decoder",
            Self::VaeEncoder => "vae_encoder",
        }
    }
}

/// Loaded-on-demand view of one Stable Diffusion export.
pub struct StableDiffusion {
    model_dir: PathBuf,
    tokenizer_path: PathBuf,
    settings: DiffusionSettings,
    stage: Stage,
}

impl StableDiffusion {
    /// Checks that `components` and the tokenizer exist under `model_dir`
    /// without loading anything.
    pub fn open(
        model_dir: &Path,
        tokenizer: Option<&Path>,
        components: &[Component],
        settings: DiffusionSettings,
        stage: Stage,
    ) -> Result<Self> {
        if settings.image_size == 0 || settings.image_size % VAE_FACTOR != 0 {
            return Err(PipelineError::Configuration {
                message: format!(
                    "image_size must be a positive multiple of {}, got {}",
                    VAE_FACTOR, settings.image_size
                ),
            });
        }

        let tokenizer_path = tokenizer
            .map(Path::to_path_buf)
            .unwrap_or_else(|| model_dir.join("tokenizer").join("tokenizer.json"));
        let required = components
            .iter()
            .map(|component| component_path(model_dir, *component))
            .chain(std::iter::once(tokenizer_path.clone()));
        for path in required {
            if !path.is_file() {
                return Err(PipelineError::file_system(
                    path,
                    "diffusion model lookup",
                    std::io::Error::new(std::io::ErrorKind::NotFound, "model file does not exist"),
                ));
            }
        }

        Ok(Self {
            model_dir: model_dir.to_path_buf(),
            tokenizer_path,
            settings,
            stage,
        })
    }

    pub const fn settings(&self) -> &DiffusionSettings {
        &self.settings
    }

    pub const fn latent_side(&self) -> usize {
        (self.settings.image_size / VAE_FACTOR) as usize
    }

    fn session(&self, component: Component) -> Result<Session> {
        load_session(
            &component_path(&self.model_dir, component),
            self.settings.device_id,
            self.stage,
        )
    }

    /// Embeds `[""; prompt]` for classifier-free guidance, unconditional first.
    pub fn encode_prompt(&self, prompt: &str) -> Result<Array3<f32>> {
        let tokenizer = Tokenizer::from_file(&self.tokenizer_path)
            .map_err(|e| PipelineError::model(self.stage, "tokenizer load", e))?;
        let ids = [
            token_ids(&tokenizer, "").map_err(|e| e.in_stage(self.stage))?,
            token_ids(&tokenizer, prompt).map_err(|e| e.in_stage(self.stage))?,
        ];

        let mut session = self.session(Component::TextEncoder)?;
        let output_name = first_output_name(&session, self.stage)?;
        let shape = (ids.len(), MAX_TOKENS);
        let outputs = match input_element_type(&session, "input_ids") {
            Some(TensorElementType::Int64) => {
                let input_ids = Array2::from_shape_fn(shape, |(b, i)| i64::from(ids[b][i]));
                session.run(ort::inputs!["input_ids" => TensorRef::from_array_view(&input_ids)?])
            }
            _ => {
                let input_ids = Array2::from_shape_fn(shape, |(b, i)| ids[b][i] as i32);
                session.run(ort::inputs!["input_ids" => TensorRef::from_array_view(&input_ids)?])
            }
        }
        .map_err(|e| PipelineError::model(self.stage, "text encoder run", e))?;

        let embeddings = outputs[output_name.as_str()]
            .try_extract_array::<f32>()
            .map_err(|e| PipelineError::model(self.stage, "text encoder output", e))?
            .into_dimensionality::<Ix3>()
            .map_err(|e| PipelineError::model(self.stage, "text encoder output", e))?
            .to_owned();
        debug!(shape = ?embeddings.shape(), "prompt encoded");
        Ok(embeddings)
    }

    /// Runs the guided DDIM loop from `latents`.
    ///
    /// `conditioning` is appended to the UNet input along the channel axis on
    /// every step (mask and masked-image latents for inpainting).
    pub fn denoise(
        &self,
        embeddings: &Array3<f32>,
        mut latents: Array4<f32>,
        conditioning: Option<&Array4<f32>>,
    ) -> Result<Array4<f32>> {
        let scheduler = DdimScheduler::new(self.settings.steps);
        let mut unet = self.session(Component::Unet)?;
        let output_name = first_output_name(&unet, self.stage)?;
        let timestep_type = input_element_type(&unet, "timestep");
        let guidance = self.settings.guidance_scale;

        let progress = progress_bar(scheduler.timesteps().len() as u64);
        info!(steps = scheduler.timesteps().len(), guidance, "denoising");
        for &timestep in scheduler.timesteps() {
            let doubled = concatenate(Axis(0), &[latents.view(), latents.view()])?;
            let model_input = match conditioning {
                Some(extra) => concatenate(Axis(1), &[doubled.view(), extra.view()])?,
                None => doubled,
            };

            let noise = run_unet(
                &mut unet,
                &output_name,
                &model_input,
                timestep,
                timestep_type,
                embeddings,
            )
            .map_err(|e| e.in_stage(self.stage))?;

            let uncond = noise.slice(s![0..1, .., .., ..]);
            let cond = noise.slice(s![1..2, .., .., ..]);
            let guided = &uncond + &((&cond - &uncond) * guidance);
            latents = scheduler.step(&guided, timestep, &latents);
            progress.inc(1);
        }
        progress.finish_and_clear();

        Ok(latents)
    }

    /// Decodes latents into an RGB image.
    pub fn decode(&self, latents: &Array4<f32>) -> Result<RgbImage> {
        let mut session = self.session(Component::VaeDecoder)?;
        let output_name = first_output_name(&session, self.stage)?;
        let scaled = latents / LATENT_SCALE;
        let outputs = session
            .run(ort::inputs!["latent_sample" => TensorRef::from_array_view(&scaled)?])
            .map_err(|e| PipelineError::model(self.stage, "vae decoder run", e))?;
        let decoded = outputs[output_name.as_str()]
            .try_extract_array::<f32>()
            .map_err(|e| PipelineError::model(self.stage, "vae decoder output", e))?
            .into_dimensionality::<Ix4>()
            .map_err(|e| PipelineError::model(self.stage, "vae decoder output", e))?
            .to_owned();
        tensor_to_image(decoded.view()).map_err(|e| e.in_stage(self.stage))
    }

    /// Encodes an image into scaled UNet latents.
    pub fn encode_image(&self, image: &Array4<f32>) -> Result<Array4<f32>> {
        let mut session = self.session(Component::VaeEncoder)?;
        let output_name = first_output_name(&session, self.stage)?;
        let outputs = session
            .run(ort::inputs!["sample" => TensorRef::from_array_view(image)?])
            .map_err(|e| PipelineError::model(self.stage, "vae encoder run", e))?;
        let latents = outputs[output_name.as_str()]
            .try_extract_array::<f32>()
            .map_err(|e| PipelineError::model(self.stage, "vae encoder output", e))?
            .into_dimensionality::<Ix4>()
            .map_err(|e| PipelineError::model(self.stage, "vae encoder output", e))?
            .to_owned();
        Ok(latents * LATENT_SCALE)
    }

    /// Seeded starting latents for a batch of one.
    pub fn initial_latents(&self, seed: u64) -> Array4<f32> {
        let side = self.latent_side();
        let sigma = DdimScheduler::new(self.settings.steps).init_noise_sigma();
        gaussian_noise(seed, (1, LATENT_CHANNELS, side, side)) * sigma
    }
}

fn component_path(model_dir: &Path, component: Component) -> PathBuf {
    model_dir.join(component.dir_name()).join("model.onnx")
}

fn run_unet(
    unet: &mut Session,
    output_name: &str,
    model_input: &Array4<f32>,
    timestep: usize,
    timestep_type: Option<TensorElementType>,
    embeddings: &Array3<f32>,
) -> Result<Array4<f32>> {
    let outputs = match timestep_type {
        Some(TensorElementType::Int64) => {
            let t = Array1::from_elem(1, timestep as i64);
            unet.run(ort::inputs![
                "sample" => TensorRef::from_array_view(model_input)?,
                "timestep" => TensorRef::from_array_view(&t)?,
                "encoder_hidden_states" => TensorRef::from_array_view(embeddings)?
            ])
        }
        _ => {
            let t = Array1::from_elem(1, timestep as f32);
            unet.run(ort::inputs![
                "sample" => TensorRef::from_array_view(model_input)?,
                "timestep" => TensorRef::from_array_view(&t)?,
                "encoder_hidden_states" => TensorRef::from_array_view(embeddings)?
            ])
        }
    }?;

    Ok(outputs[output_name]
        .try_extract_array::<f32>()?
        .into_dimensionality::<Ix4>()?
        .to_owned())
}

/// Token ids padded (or truncated) to exactly [`MAX_TOKENS`] entries, the
/// padding being the end-of-text token as CLIP expects.
pub fn token_ids(tokenizer: &Tokenizer, prompt: &str) -> Result<Vec<u32>> {
    let pad = tokenizer.token_to_id(END_OF_TEXT).ok_or_else(|| {
        PipelineError::model(
            Stage::Generator,
            "tokenizer lookup",
            format!("tokenizer has no {} token", END_OF_TEXT),
        )
    })?;
    let encoding = tokenizer
        .encode(prompt, true)
        .map_err(|e| PipelineError::model(Stage::Generator, "prompt tokenization", e))?;
    Ok(pad_tokens(encoding.get_ids(), pad))
}

pub fn pad_tokens(ids: &[u32], pad: u32) -> Vec<u32> {
    let mut ids = ids.to_vec();
    if ids.len() > MAX_TOKENS {
        ids.truncate(MAX_TOKENS - 1);
        ids.push(pad);
    }
    ids.resize(MAX_TOKENS, pad);
    ids
}

/// Standard normal samples from a PCG stream seeded with `seed`.
pub fn gaussian_noise(seed: u64, shape: (usize, usize, usize, usize)) -> Array4<f32> {
    let mut rng = Pcg32::seed_from_u64(seed);
    Array4::from_shape_simple_fn(shape, || {
        // Box-Muller; u1 is kept away from zero so ln stays finite
        let u1: f64 = rng.gen::<f64>().max(f64::MIN_POSITIVE);
        let u2: f64 = rng.gen();
        ((-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()) as f32
    })
}

/// RGB image to a `[1, 3, H, W]` tensor in `[-1, 1]`.
pub fn image_to_tensor(image: &RgbImage) -> Array4<f32> {
    image
        .as_ndarray3()
        .map(|&v| f32::from(v) / 127.5 - 1.0)
        .insert_axis(Axis(0))
}

/// Mask to a `[1, 1, H, W]` tensor of zeros and ones, resized to
/// `width`×`height` first.
pub fn mask_to_tensor(mask: &GrayImage, width: u32, height: u32) -> Array4<f32> {
    let resized = imageops::resize(mask, width, height, FilterType::Nearest);
    Array4::from_shape_fn((1, 1, height as usize, width as usize), |(_, _, y, x)| {
        if resized.get_pixel(x as u32, y as u32)[0] >= 128 {
            1.0
        } else {
            0.0
        }
    })
}

/// `[1, 3, H, W]` tensor in `[-1, 1]` back to an RGB image.
pub fn tensor_to_image(tensor: ArrayView4<f32>) -> Result<RgbImage> {
    let (batch, channels, height, width) = tensor.dim();
    if batch < 1 || channels != 3 {
        return Err(PipelineError::model(
            Stage::Generator,
            "image decoding",
            format!("expected a [1, 3, H, W] tensor, got {:?}", tensor.shape()),
        ));
    }

    let to_u8 = |v: f32| ((v / 2.0 + 0.5).clamp(0.0, 1.0) * 255.0).round() as u8;
    Ok(RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let (x, y) = (x as usize, y as usize);
        Rgb([
            to_u8(tensor[[0, 0, y, x]]),
            to_u8(tensor[[0, 1, y, x]]),
            to_u8(tensor[[0, 2, y, x]]),
        ])
    }))
}

fn progress_bar(len: u64) -> ProgressBar {
    let progress_bar = ProgressBar::new(len);
    progress_bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-"),
    );
    progress_bar
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;
    use tempfile::TempDir;

    #[test]
    fn test_pad_tokens_pads_with_end_of_text() {
        let ids = pad_tokens(&[49406, 320, 49407], 49407);
        assert_eq!(ids.len(), MAX_TOKENS);
        assert_eq!(&ids[..3], &[49406, 320, 49407]);
        assert!(ids[3..].iter().all(|&id| id == 49407));
    }

    #[test]
    fn test_pad_tokens_truncates_long_prompts() {
        let long: Vec<u32> = (0..100).collect();
        let ids = pad_tokens(&long, 7);
        assert_eq!(ids.len(), MAX_TOKENS);
        assert_eq!(ids[75], 75);
        assert_eq!(ids[76], 7);
    }

    #[test]
    fn test_gaussian_noise_is_seeded() {
        let a = gaussian_noise(1024, (1, 4, 8, 8));
        let b = gaussian_noise(1024, (1, 4, 8, 8));
        let c = gaussian_noise(1025, (1, 4, 8, 8));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_gaussian_noise_moments() {
        let noise = gaussian_noise(7, (1, 4, 64, 64));
        let n = noise.len() as f32;
        let mean = noise.sum() / n;
        let variance = noise.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
        assert!(mean.abs() < 0.05, "mean {}", mean);
        assert!((variance - 1.0).abs() < 0.1, "variance {}", variance);
    }

    #[test]
    fn test_image_tensor_conversion() -> Result<()> {
        let image = RgbImage::from_fn(4, 2, |x, _| Rgb([0, 255, (x * 60) as u8]));
        let tensor = image_to_tensor(&image);
        assert_eq!(tensor.shape(), &[1, 3, 2, 4]);
        assert_eq!(tensor[[0, 0, 0, 0]], -1.0);
        assert_eq!(tensor[[0, 1, 1, 3]], 1.0);

        let back = tensor_to_image(tensor.view())?;
        assert_eq!(back, image);
        Ok(())
    }

    #[test]
    fn test_tensor_to_image_rejects_wrong_channels() {
        let tensor = Array4::<f32>::zeros((1, 4, 2, 2));
        assert!(tensor_to_image(tensor.view()).is_err());
    }

    #[test]
    fn test_mask_to_tensor_downsamples() {
        let mask = GrayImage::from_fn(16, 16, |x, _| Luma([if x < 8 { 255 } else { 0 }]));
        let tensor = mask_to_tensor(&mask, 2, 2);
        assert_eq!(tensor.shape(), &[1, 1, 2, 2]);
        assert_eq!(tensor[[0, 0, 0, 0]], 1.0);
        assert_eq!(tensor[[0, 0, 1, 1]], 0.0);
    }

    #[test]
    fn test_open_reports_missing_components() {
        let temp_dir = TempDir::new().unwrap();
        let settings = DiffusionSettings::from(&PipelineConfig::default());
        let result = StableDiffusion::open(
            temp_dir.path(),
            None,
            &[Component::TextEncoder, Component::Unet, Component::VaeDecoder],
            settings,
            Stage::Generator,
        );
        assert!(matches!(result, Err(PipelineError::FileSystem { .. })));
    }
}

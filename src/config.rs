use clap::Parser;
use std::path::PathBuf;

use crate::errors::{PipelineError, Result};

/// Side of the square Stable Diffusion v1 works at.
pub const DEFAULT_IMAGE_SIZE: u32 = 512;
pub const DEFAULT_SEED: u64 = 1024;
pub const DEFAULT_CATEGORY_THRESHOLD: f32 = 0.2;
pub const DEFAULT_STEPS: usize = 50;
pub const DEFAULT_GUIDANCE_SCALE: f32 = 7.5;
pub const DEFAULT_DEVICE_ID: i32 = 0;
pub const MAX_STEPS: usize = 1000;

pub const DEFAULT_GENERATOR_MODEL: &str = "models/stable-diffusion-v1-5";
pub const DEFAULT_INPAINT_MODEL: &str = "models/stable-diffusion-inpainting";
pub const DEFAULT_HAIR_MODEL: &str = "models/hair_segmenter.onnx";
pub const DEFAULT_BACKGROUND_MODEL: &str = "models/deeplab_v3.onnx";

/// Latent downsampling of the Stable Diffusion VAE.
pub const VAE_FACTOR: u32 = 8;

/// Which segmentation model produces the inpainting mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentationMode {
    /// Hair segmentation: repaint the hair style.
    Hair,
    /// Foreground/background segmentation: repaint the character.
    Background,
}

impl SegmentationMode {
    /// Maps the interactive selector to a mode. Only `"1"` picks the hair
    /// model; every other answer falls back to background segmentation.
    pub fn from_selector(selector: &str) -> Self {
        match selector {
            "1" => Self::Hair,
            _ => Self::Background,
        }
    }

    /// Input range the model expects its pixels in.
    pub const fn normalization(self) -> Normalization {
        match self {
            Self::Hair => Normalization::ZeroToOne,
            Self::Background => Normalization::MinusOneToOne,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Normalization {
    ZeroToOne,
    MinusOneToOne,
}

impl Normalization {
    pub fn apply(self, value: u8) -> f32 {
        let v = f32::from(value) / 255.0;
        match self {
            Self::ZeroToOne => v,
            Self::MinusOneToOne => v * 2.0 - 1.0,
        }
    }
}

/// Everything the pipeline driver needs to know, passed in at construction.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub seed: u64,
    pub generator_model: PathBuf,
    pub inpaint_model: PathBuf,
    pub hair_segmentation_model: PathBuf,
    pub background_segmentation_model: PathBuf,
    /// CLIP `tokenizer.json`; defaults to `<model>/tokenizer/tokenizer.json`.
    pub tokenizer: Option<PathBuf>,
    pub mask_color: [u8; 3],
    pub background_color: [u8; 3],
    pub category_threshold: f32,
    pub image_size: u32,
    pub num_inference_steps: usize,
    pub guidance_scale: f32,
    pub device_id: i32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            seed: DEFAULT_SEED,
            generator_model: PathBuf::from(DEFAULT_GENERATOR_MODEL),
            inpaint_model: PathBuf::from(DEFAULT_INPAINT_MODEL),
            hair_segmentation_model: PathBuf::from(DEFAULT_HAIR_MODEL),
            background_segmentation_model: PathBuf::from(DEFAULT_BACKGROUND_MODEL),
            tokenizer: None,
            mask_color: [255, 255, 255],
            background_color: [0, 0, 0],
            category_threshold: DEFAULT_CATEGORY_THRESHOLD,
            image_size: DEFAULT_IMAGE_SIZE,
            num_inference_steps: DEFAULT_STEPS,
            guidance_scale: DEFAULT_GUIDANCE_SCALE,
            device_id: DEFAULT_DEVICE_ID,
        }
    }
}

impl PipelineConfig {
    pub fn segmentation_model(&self, mode: SegmentationMode) -> &PathBuf {
        match mode {
            SegmentationMode::Hair => &self.hair_segmentation_model,
            SegmentationMode::Background => &self.background_segmentation_model,
        }
    }

    /// Rejects settings no stage can run with.
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: String| Err(PipelineError::Configuration { message });

        if self.image_size == 0 || self.image_size % VAE_FACTOR != 0 {
            return invalid(format!(
                "image_size must be a positive multiple of {}, got {}",
                VAE_FACTOR, self.image_size
            ));
        }
        if !(1..=MAX_STEPS).contains(&self.num_inference_steps) {
            return invalid(format!(
                "num_inference_steps must be between 1 and {}, got {}",
                MAX_STEPS, self.num_inference_steps
            ));
        }
        if !self.category_threshold.is_finite() {
            return invalid(format!(
                "category_threshold must be finite, got {}",
                self.category_threshold
            ));
        }
        if !self.guidance_scale.is_finite() {
            return invalid(format!(
                "guidance_scale must be finite, got {}",
                self.guidance_scale
            ));
        }
        Ok(())
    }
}

/// Command line of the `storycraft` binary.
#[derive(Parser, Clone, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Directory the generated artifacts are written to
    pub output_directory: PathBuf,

    #[arg(long, default_value = DEFAULT_GENERATOR_MODEL)]
    pub generator_model: PathBuf,

    #[arg(long, default_value = DEFAULT_INPAINT_MODEL)]
    pub inpaint_model: PathBuf,

    #[arg(long, default_value = DEFAULT_HAIR_MODEL)]
    pub hair_model: PathBuf,

    #[arg(long, default_value = DEFAULT_BACKGROUND_MODEL)]
    pub background_model: PathBuf,

    #[arg(long)]
    pub tokenizer: Option<PathBuf>,

    /// TrueType font used for the comparison figure titles
    #[arg(long)]
    pub font: Option<PathBuf>,

    #[arg(short, long, default_value_t = DEFAULT_SEED)]
    pub seed: u64,

    #[arg(long, default_value_t = DEFAULT_STEPS, value_parser = check_steps)]
    pub steps: usize,

    #[arg(short, long, default_value_t = DEFAULT_GUIDANCE_SCALE)]
    pub guidance_scale: f32,

    #[arg(short, long, default_value_t = DEFAULT_DEVICE_ID)]
    pub device_id: i32,
}

impl Cli {
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            seed: self.seed,
            generator_model: self.generator_model.clone(),
            inpaint_model: self.inpaint_model.clone(),
            hair_segmentation_model: self.hair_model.clone(),
            background_segmentation_model: self.background_model.clone(),
            tokenizer: self.tokenizer.clone(),
            num_inference_steps: self.steps,
            guidance_scale: self.guidance_scale,
            device_id: self.device_id,
            ..PipelineConfig::default()
        }
    }
}

fn check_steps(s: &str) -> std::result::Result<usize, String> {
    let steps: usize = s
        .parse()
        .map_err(|_| format!("{} is not a number of steps", s))?;
    if !(1..=MAX_STEPS).contains(&steps) {
        return Err(format!("steps must be between 1 and {}, got {}", MAX_STEPS, steps));
    }
    Ok(steps)
}

//! Post-run artifacts: the prompt file and the side-by-side comparison figure.
//!
//! Both steps skip with a warning when their inputs are missing instead of
//! failing the run.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use ab_glyph::{FontArc, FontVec, PxScale};
use image::{imageops, ImageFormat, Rgb, RgbImage};
use imageproc::drawing::{draw_text_mut, text_size};
use tracing::{info, warn};

use crate::{
    errors::{PipelineError, Result},
    imageops_ai::padding::fit_into_cell,
    OutputLayout,
};

pub const PANEL_TITLES: [&str; 3] = ["Original Image", "Mask", "Inpainted Image"];
const PANEL_WIDTH: u32 = 400;
const FIGURE_HEIGHT: u32 = 400;
const TITLE_HEIGHT: u32 = 48;
const MARGIN: u32 = 12;
const TITLE_SCALE: f32 = 24.0;
const WHITE: Rgb<u8> = Rgb([255, 255, 255]);
const BLACK: Rgb<u8> = Rgb([0, 0, 0]);

/// DejaVu Sans, shipped with the crate so titles never depend on system fonts.
static EMBEDDED_FONT: &[u8] = include_bytes!("../assets/fonts/DejaVuSans.ttf");

/// What a reporting step did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportOutcome {
    Written(PathBuf),
    Skipped(String),
}

impl ReportOutcome {
    fn skipped(reason: String) -> Self {
        warn!("{}", reason);
        Self::Skipped(reason)
    }
}

/// Writes `first` and `second` to `file_path`, one per line.
pub fn write_strings_to_file(
    first: &str,
    second: &str,
    file_path: &Path,
) -> Result<ReportOutcome> {
    if let Some(parent) = file_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.is_dir() {
            return Ok(ReportOutcome::skipped(format!(
                "Output directory '{}' does not exist.",
                parent.display()
            )));
        }
    }

    let mut file = fs::File::create(file_path)
        .map_err(|e| PipelineError::file_system(file_path, "prompt file creation", e))?;
    writeln!(file, "{}", first)
        .and_then(|_| writeln!(file, "{}", second))
        .map_err(|e| PipelineError::file_system(file_path, "prompt file write", e))?;

    info!(path = %file_path.display(), "prompts written");
    Ok(ReportOutcome::Written(file_path.to_path_buf()))
}

/// Lays the original image, the mask and the inpainted image out as three
/// titled panels and saves them as `combined_image.jpg`.
///
/// Titles use `font` when it parses and the embedded DejaVu Sans otherwise.
pub fn plot_images(output_directory: &Path, font: Option<&Path>) -> Result<ReportOutcome> {
    if !output_directory.is_dir() {
        return Ok(ReportOutcome::skipped(format!(
            "Output directory '{}' does not exist.",
            output_directory.display()
        )));
    }

    let layout = OutputLayout::new(output_directory);
    let sources = [layout.image(), layout.mask(), layout.inpainted()];
    if sources.iter().any(|path| !path.is_file()) {
        return Ok(ReportOutcome::skipped(
            "One or more image files not found.".to_string(),
        ));
    }

    let panels = sources
        .iter()
        .map(|path| load_rgb(path))
        .collect::<Result<Vec<_>>>()?;
    let font = load_font(font)?;
    let figure = compose_figure(&panels, &font);

    let combined_path = layout.combined();
    figure
        .save_with_format(&combined_path, ImageFormat::Jpeg)
        .map_err(|e| PipelineError::ImageProcessing {
            path: combined_path.display().to_string(),
            operation: "comparison figure save".to_string(),
            source: Box::new(e),
        })?;

    info!(path = %combined_path.display(), "comparison figure written");
    Ok(ReportOutcome::Written(combined_path))
}

/// Draws one white cell per panel with its title above it. Axes are never
/// drawn.
pub fn compose_figure(panels: &[RgbImage], font: &FontArc) -> RgbImage {
    let width = PANEL_WIDTH * panels.len().max(1) as u32;
    let mut figure = RgbImage::from_pixel(width, FIGURE_HEIGHT, WHITE);
    let cell_width = PANEL_WIDTH - 2 * MARGIN;
    let cell_height = FIGURE_HEIGHT - TITLE_HEIGHT - MARGIN;

    for (index, (panel, title)) in panels.iter().zip(PANEL_TITLES).enumerate() {
        let left = PANEL_WIDTH * index as u32;
        let cell = fit_into_cell(panel, cell_width, cell_height, WHITE);
        imageops::overlay(
            &mut figure,
            &cell,
            i64::from(left + MARGIN),
            i64::from(TITLE_HEIGHT),
        );

        let scale = PxScale::from(TITLE_SCALE);
        let (text_width, text_height) = text_size(scale, font, title);
        let x = left + PANEL_WIDTH.saturating_sub(text_width) / 2;
        let y = TITLE_HEIGHT.saturating_sub(text_height) / 2;
        draw_text_mut(&mut figure, BLACK, x as i32, y as i32, scale, font, title);
    }

    figure
}

fn load_rgb(path: &Path) -> Result<RgbImage> {
    image::open(path)
        .map(|image| image.into_rgb8())
        .map_err(|e| PipelineError::ImageProcessing {
            path: path.display().to_string(),
            operation: "image load".to_string(),
            source: Box::new(e),
        })
}

/// The embedded title font.
pub fn embedded_font() -> Result<FontArc> {
    FontArc::try_from_slice(EMBEDDED_FONT).map_err(|e| PipelineError::Configuration {
        message: format!("embedded title font is invalid: {}", e),
    })
}

/// Loads `explicit` when given and usable, otherwise the embedded font.
fn load_font(explicit: Option<&Path>) -> Result<FontArc> {
    if let Some(path) = explicit {
        match fs::read(path).map(FontVec::try_from_vec) {
            Ok(Ok(font)) => return Ok(FontArc::new(font)),
            Ok(Err(e)) => {
                warn!(path = %path.display(), error = %e, "font could not be parsed")
            }
            Err(e) => warn!(path = %path.display(), error = %e, "font could not be read"),
        }
    }
    embedded_font()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_strings_to_file() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("prompt.txt");

        let outcome = write_strings_to_file("A", "B", &path)?;
        assert_eq!(outcome, ReportOutcome::Written(path.clone()));
        assert_eq!(fs::read_to_string(&path)?, "A\nB\n");
        Ok(())
    }

    #[test]
    fn test_write_strings_to_file_overwrites() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("prompt.txt");
        fs::write(&path, "old\ncontent\nhere\n")?;

        write_strings_to_file("a knight", "golden armour", &path)?;
        assert_eq!(fs::read_to_string(&path)?, "a knight\ngolden armour\n");
        Ok(())
    }

    #[test]
    fn test_write_strings_skips_missing_directory() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("missing").join("prompt.txt");

        let outcome = write_strings_to_file("A", "B", &path)?;
        assert!(matches!(outcome, ReportOutcome::Skipped(_)));
        assert!(!path.exists());
        Ok(())
    }

    #[test]
    fn test_plot_images_skips_missing_directory() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let outcome = plot_images(&temp_dir.path().join("nope"), None)?;
        assert!(matches!(outcome, ReportOutcome::Skipped(_)));
        Ok(())
    }

    #[test]
    fn test_plot_images_skips_when_an_image_is_missing() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let layout = OutputLayout::new(temp_dir.path());
        RgbImage::new(8, 8).save_with_format(layout.image(), ImageFormat::Jpeg)?;
        RgbImage::new(8, 8).save_with_format(layout.mask(), ImageFormat::Jpeg)?;

        let outcome = plot_images(temp_dir.path(), None)?;
        assert_eq!(
            outcome,
            ReportOutcome::Skipped("One or more image files not found.".to_string())
        );
        assert!(!layout.combined().exists());
        Ok(())
    }

    #[test]
    fn test_plot_images_writes_combined_figure() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let layout = OutputLayout::new(temp_dir.path());
        RgbImage::from_pixel(512, 512, Rgb([200, 10, 10]))
            .save_with_format(layout.image(), ImageFormat::Jpeg)?;
        RgbImage::from_pixel(512, 341, WHITE).save_with_format(layout.mask(), ImageFormat::Jpeg)?;
        RgbImage::from_pixel(512, 512, Rgb([10, 10, 200]))
            .save_with_format(layout.inpainted(), ImageFormat::Jpeg)?;

        let missing_font = temp_dir.path().join("no-font.ttf");
        let outcome = plot_images(temp_dir.path(), Some(&missing_font))?;
        assert_eq!(outcome, ReportOutcome::Written(layout.combined()));

        let figure = image::open(layout.combined())?.into_rgb8();
        assert_eq!(figure.dimensions(), (1200, 400));
        // an unreadable font falls back to the embedded one
        for panel in 0..3 {
            assert!(has_title(&figure, panel), "panel {} has no title", panel);
        }
        Ok(())
    }

    fn has_title(figure: &RgbImage, panel: u32) -> bool {
        (0..TITLE_HEIGHT).any(|y| {
            (panel * PANEL_WIDTH..(panel + 1) * PANEL_WIDTH)
                .any(|x| figure.get_pixel(x, y).0.iter().all(|&c| c < 128))
        })
    }

    #[test]
    fn test_compose_figure_places_panels_side_by_side() -> Result<()> {
        let panels = [
            RgbImage::from_pixel(64, 64, Rgb([255, 0, 0])),
            RgbImage::from_pixel(64, 64, BLACK),
            RgbImage::from_pixel(64, 64, Rgb([0, 0, 255])),
        ];
        let figure = compose_figure(&panels, &embedded_font()?);

        assert_eq!(figure.dimensions(), (1200, 400));
        assert_eq!(figure.get_pixel(200, 200), &Rgb([255, 0, 0]));
        assert_eq!(figure.get_pixel(600, 200), &BLACK);
        assert_eq!(figure.get_pixel(1000, 200), &Rgb([0, 0, 255]));
        Ok(())
    }

    #[test]
    fn test_compose_figure_draws_every_title() -> Result<()> {
        let panels = [
            RgbImage::from_pixel(64, 64, WHITE),
            RgbImage::from_pixel(64, 64, WHITE),
            RgbImage::from_pixel(64, 64, WHITE),
        ];
        let figure = compose_figure(&panels, &embedded_font()?);

        for panel in 0..3 {
            assert!(has_title(&figure, panel), "panel {} has no title", panel);
        }
        // nothing is drawn in the margin between the title band and the panels
        assert_eq!(figure.get_pixel(5, 200), &WHITE);
        Ok(())
    }
}

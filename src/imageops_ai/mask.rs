use image::{GrayImage, Luma, Rgb, RgbImage};
use imageproc::map::map_colors;

use crate::traits::CategoryMask;

/// Paints every pixel whose category score is above `threshold` with
/// `foreground` and the rest with `background`.
pub fn binarize(
    category: &CategoryMask,
    threshold: f32,
    foreground: Rgb<u8>,
    background: Rgb<u8>,
) -> RgbImage {
    map_colors(category, |Luma([score])| {
        if score > threshold {
            foreground
        } else {
            background
        }
    })
}

/// Collapses an RGB mask into a strict black/white single channel mask.
///
/// JPEG round trips leave grey fringes around the mask edges; anything at or
/// above mid grey counts as masked.
pub fn to_gray_mask(mask: &RgbImage) -> GrayImage {
    map_colors(mask, |pixel: Rgb<u8>| {
        let Rgb([r, g, b]) = pixel;
        let luma = (u16::from(r) + u16::from(g) + u16::from(b)) / 3;
        Luma([if luma >= 128 { 255 } else { 0 }])
    })
}

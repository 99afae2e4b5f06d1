use image::{imageops, imageops::FilterType, ImageBuffer, Pixel, RgbImage};

/// Output size that fits `(width, height)` into a `bound`-sided box while
/// keeping the aspect ratio.
///
/// Landscape images are anchored on the width, everything else on the
/// height; the other side is floored. Sides never collapse below one pixel.
pub fn fit_dimensions(width: u32, height: u32, bound: u32) -> (u32, u32) {
    let (w, h, b) = (f64::from(width), f64::from(height), f64::from(bound));
    if height < width {
        (bound, ((h / (w / b)).floor() as u32).max(1))
    } else {
        (((w / (h / b)).floor() as u32).max(1), bound)
    }
}

/// Resizes a mask so its longer side equals `bound`.
pub fn resize_to_fit(image: &RgbImage, bound: u32) -> RgbImage {
    let (width, height) = fit_dimensions(image.width(), image.height(), bound);
    imageops::resize(image, width, height, FilterType::Triangle)
}

/// Stretches an image to a `size`×`size` square, the shape the diffusion
/// models work on.
pub fn resize_square<P>(
    image: &ImageBuffer<P, Vec<P::Subpixel>>,
    size: u32,
) -> ImageBuffer<P, Vec<P::Subpixel>>
where
    P: Pixel + 'static,
    P::Subpixel: 'static,
{
    if image.dimensions() == (size, size) {
        return image.clone();
    }
    imageops::resize(image, size, size, FilterType::CatmullRom)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Rgb};

    #[test]
    fn test_landscape_anchors_width() {
        assert_eq!(fit_dimensions(300, 200, 512), (512, 341));
        assert_eq!(fit_dimensions(1024, 512, 512), (512, 256));
    }

    #[test]
    fn test_portrait_and_square_anchor_height() {
        assert_eq!(fit_dimensions(200, 300, 512), (341, 512));
        assert_eq!(fit_dimensions(512, 512, 512), (512, 512));
        assert_eq!(fit_dimensions(257, 257, 512), (512, 512));
    }

    #[test]
    fn test_extreme_aspect_keeps_one_pixel() {
        assert_eq!(fit_dimensions(4096, 1, 512), (512, 1));
        assert_eq!(fit_dimensions(1, 4096, 512), (1, 512));
    }

    #[test]
    fn test_resize_to_fit_output_size() {
        let image = RgbImage::from_pixel(640, 480, Rgb([255, 255, 255]));
        let resized = resize_to_fit(&image, 512);
        assert_eq!(resized.dimensions(), (512, 384));
    }

    #[test]
    fn test_resize_square() {
        let mask = GrayImage::new(512, 384);
        assert_eq!(resize_square(&mask, 512).dimensions(), (512, 512));

        let image = RgbImage::new(512, 512);
        assert_eq!(resize_square(&image, 512).dimensions(), (512, 512));
    }
}

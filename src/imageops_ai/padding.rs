use image::{imageops, imageops::FilterType, GenericImageView, ImageBuffer, Pixel};

/// Offset that centres a `width`×`height` image inside a
/// `pad_width`×`pad_height` canvas, or `None` if it does not fit.
pub fn to_position(width: u32, height: u32, pad_width: u32, pad_height: u32) -> Option<(i64, i64)> {
    if width > pad_width || height > pad_height {
        return None;
    }

    let x = (pad_width - width) / 2;
    let y = (pad_height - height) / 2;
    Some((i64::from(x), i64::from(y)))
}

pub fn padding<I, P>(
    image: &I,
    pad_width: u32,
    pad_height: u32,
    color: P,
) -> Option<ImageBuffer<P, Vec<P::Subpixel>>>
where
    I: GenericImageView<Pixel = P>,
    P: Pixel,
{
    let (width, height) = image.dimensions();

    to_position(width, height, pad_width, pad_height).map(|(x, y)| {
        let mut canvas = ImageBuffer::from_pixel(pad_width, pad_height, color);
        imageops::overlay(&mut canvas, image, x, y);
        canvas
    })
}

/// Shrinks `image` to fit a `cell_width`×`cell_height` cell, keeping its aspect
/// ratio, and pads the rest of the cell with `color` around the centred image.
pub fn fit_into_cell<I, P>(
    image: &I,
    cell_width: u32,
    cell_height: u32,
    color: P,
) -> ImageBuffer<P, Vec<P::Subpixel>>
where
    I: GenericImageView<Pixel = P>,
    P: Pixel + 'static,
    P::Subpixel: 'static,
{
    let (width, height) = image.dimensions();
    let scale = f64::min(
        f64::from(cell_width) / f64::from(width.max(1)),
        f64::from(cell_height) / f64::from(height.max(1)),
    );
    let target_width = ((f64::from(width) * scale).floor() as u32).clamp(1, cell_width);
    let target_height = ((f64::from(height) * scale).floor() as u32).clamp(1, cell_height);

    let resized = imageops::resize(image, target_width, target_height, FilterType::CatmullRom);
    padding(&resized, cell_width, cell_height, color)
        .unwrap_or_else(|| ImageBuffer::from_pixel(cell_width, cell_height, color))
}

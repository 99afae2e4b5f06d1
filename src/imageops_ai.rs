//! Image helpers shared by the pipeline stages and the report.
pub mod mask;
pub mod padding;
pub mod resize;

pub use mask::{binarize, to_gray_mask};
pub use resize::{fit_dimensions, resize_square, resize_to_fit};

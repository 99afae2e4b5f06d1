use std::path::{Path, PathBuf};

use image::{imageops, imageops::FilterType, ImageBuffer, RgbImage};
use ndarray::prelude::*;
use nshare::AsNdarray3;
use ort::value::TensorRef;
use tracing::debug;

use crate::{
    config::{Normalization, SegmentationMode, DEFAULT_IMAGE_SIZE},
    errors::{PipelineError, Result, Stage},
    session::{first_input_shape, first_output_name, load_session},
    traits::{CategoryMask, ImageSegmentationModel},
};

/// Memory order of the model's image tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    Nchw,
    Nhwc,
}

/// Input geometry read from the model: layout, channel count, height, width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputSpec {
    pub layout: Layout,
    pub channels: usize,
    pub height: u32,
    pub width: u32,
}

impl InputSpec {
    /// Reads the geometry from a rank-4 input shape. Channel counts of 3 or
    /// 4 identify the layout; dynamic spatial axes fall back to 512.
    pub fn from_shape(shape: &[i64]) -> Option<Self> {
        let [_, a, b, c] = shape else {
            return None;
        };
        let side = |v: i64| {
            if v > 0 {
                v as u32
            } else {
                DEFAULT_IMAGE_SIZE
            }
        };
        match (*a, *c) {
            (3 | 4, _) => Some(Self {
                layout: Layout::Nchw,
                channels: *a as usize,
                height: side(*b),
                width: side(*c),
            }),
            (_, 3 | 4) => Some(Self {
                layout: Layout::Nhwc,
                channels: *c as usize,
                height: side(*a),
                width: side(*b),
            }),
            _ => None,
        }
    }
}

/// Segmentation model exported to ONNX (DeepLab v3 or the hair segmenter).
///
/// The session is opened for each call and released afterwards.
pub struct OnnxSegmenter {
    model_path: PathBuf,
    normalization: Normalization,
    device_id: i32,
}

impl OnnxSegmenter {
    pub fn new(model_path: &Path, mode: SegmentationMode, device_id: i32) -> Result<Self> {
        if !model_path.is_file() {
            return Err(PipelineError::file_system(
                model_path,
                "segmentation model lookup",
                std::io::Error::new(std::io::ErrorKind::NotFound, "model file does not exist"),
            ));
        }
        Ok(Self {
            model_path: model_path.to_path_buf(),
            normalization: mode.normalization(),
            device_id,
        })
    }

    fn predict(&self, image: &RgbImage) -> Result<Array2<f32>> {
        let mut session = load_session(&self.model_path, self.device_id, Stage::Segmenter)?;
        let shape = first_input_shape(&session, Stage::Segmenter)?;
        let spec = InputSpec::from_shape(&shape).ok_or_else(|| {
            PipelineError::model(
                Stage::Segmenter,
                "model input layout detection",
                format!("unsupported input shape {:?}", shape),
            )
        })?;
        let input_name = session.inputs[0].name.clone();
        let output_name = first_output_name(&session, Stage::Segmenter)?;

        let tensor = preprocess(image, &spec, self.normalization);
        debug!(?spec, "running segmentation model");
        let outputs = session.run(
            ort::inputs![input_name.as_str() => TensorRef::from_array_view(&tensor)?],
        )?;
        let scores = outputs[output_name.as_str()]
            .try_extract_array::<f32>()?
            .to_owned();

        categories(scores.view(), spec.layout)
    }
}

impl ImageSegmentationModel for OnnxSegmenter {
    fn category_mask(&self, image: &RgbImage) -> Result<CategoryMask> {
        let categories = self
            .predict(image)
            .map_err(|e| e.in_stage(Stage::Segmenter))?;
        let (height, width) = categories.dim();
        let mask: CategoryMask =
            ImageBuffer::from_raw(width as u32, height as u32, categories.iter().copied().collect())
                .ok_or_else(|| {
                    PipelineError::model(
                        Stage::Segmenter,
                        "category mask assembly",
                        "output does not match its own shape",
                    )
                })?;

        let (width, height) = image.dimensions();
        Ok(imageops::resize(&mask, width, height, FilterType::Nearest))
    }
}

/// Resizes the image to the model input and lays it out as a batch of one.
/// A fourth channel, when the model asks for one, is fully opaque alpha.
pub fn preprocess(
    image: &RgbImage,
    spec: &InputSpec,
    normalization: Normalization,
) -> Array4<f32> {
    let resized = imageops::resize(image, spec.width, spec.height, FilterType::Triangle);
    let chw = resized.as_ndarray3();
    let value = |c: usize, y: usize, x: usize| {
        if c < 3 {
            normalization.apply(chw[[c, y, x]])
        } else {
            normalization.apply(u8::MAX)
        }
    };

    let (h, w) = (spec.height as usize, spec.width as usize);
    match spec.layout {
        Layout::Nchw => {
            Array4::from_shape_fn((1, spec.channels, h, w), |(_, c, y, x)| value(c, y, x))
        }
        Layout::Nhwc => {
            Array4::from_shape_fn((1, h, w, spec.channels), |(_, y, x, c)| value(c, y, x))
        }
    }
}

/// Reduces raw model output to one score per pixel.
///
/// Multi-class outputs become the arg-max class index, so anything but class
/// 0 (background) scores at least 1. Single-channel and rank-3 outputs are
/// taken as scores directly.
pub fn categories(scores: ArrayViewD<f32>, layout: Layout) -> Result<Array2<f32>> {
    match scores.ndim() {
        3 => Ok(scores
            .into_dimensionality::<Ix3>()?
            .index_axis_move(Axis(0), 0)
            .to_owned()),
        4 => {
            let scores = scores.into_dimensionality::<Ix4>()?.index_axis_move(Axis(0), 0);
            let class_axis = match layout {
                Layout::Nchw => Axis(0),
                Layout::Nhwc => Axis(2),
            };
            Ok(scores.map_axis(class_axis, |lane| {
                if lane.len() == 1 {
                    return lane[0];
                }
                lane.iter()
                    .enumerate()
                    .fold((0usize, f32::NEG_INFINITY), |best, (index, &score)| {
                        if score > best.1 {
                            (index, score)
                        } else {
                            best
                        }
                    })
                    .0 as f32
            }))
        }
        n => Err(PipelineError::model(
            Stage::Segmenter,
            "output decoding",
            format!("unexpected output rank {}", n),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_input_spec_detects_layout() {
        assert_eq!(
            InputSpec::from_shape(&[1, 257, 257, 3]),
            Some(InputSpec {
                layout: Layout::Nhwc,
                channels: 3,
                height: 257,
                width: 257
            })
        );
        assert_eq!(
            InputSpec::from_shape(&[1, 4, 512, 512]),
            Some(InputSpec {
                layout: Layout::Nchw,
                channels: 4,
                height: 512,
                width: 512
            })
        );
        assert_eq!(
            InputSpec::from_shape(&[-1, 3, -1, -1]).map(|s| (s.height, s.width)),
            Some((512, 512))
        );
        assert_eq!(InputSpec::from_shape(&[1, 512, 512]), None);
    }

    #[test]
    fn test_preprocess_nhwc_with_alpha() {
        let image = RgbImage::from_pixel(8, 4, Rgb([255, 0, 255]));
        let spec = InputSpec {
            layout: Layout::Nhwc,
            channels: 4,
            height: 2,
            width: 2,
        };
        let tensor = preprocess(&image, &spec, Normalization::ZeroToOne);

        assert_eq!(tensor.shape(), &[1, 2, 2, 4]);
        assert_eq!(tensor[[0, 1, 1, 0]], 1.0);
        assert_eq!(tensor[[0, 1, 1, 1]], 0.0);
        assert_eq!(tensor[[0, 1, 1, 3]], 1.0);
    }

    #[test]
    fn test_preprocess_nchw_signed_range() {
        let image = RgbImage::from_pixel(4, 4, Rgb([0, 255, 0]));
        let spec = InputSpec {
            layout: Layout::Nchw,
            channels: 3,
            height: 4,
            width: 4,
        };
        let tensor = preprocess(&image, &spec, Normalization::MinusOneToOne);

        assert_eq!(tensor.shape(), &[1, 3, 4, 4]);
        assert_eq!(tensor[[0, 0, 0, 0]], -1.0);
        assert_eq!(tensor[[0, 1, 0, 0]], 1.0);
    }

    #[test]
    fn test_categories_argmax_nhwc() -> Result<()> {
        // 1x1x2 image with 3 classes; pixel 0 is class 0, pixel 1 is class 2
        let scores = Array4::from_shape_vec((1, 1, 2, 3), vec![0.9, 0.05, 0.05, 0.1, 0.2, 0.7])?;
        let map = categories(scores.into_dyn().view(), Layout::Nhwc)?;
        assert_eq!(map, array![[0.0f32, 2.0]]);
        Ok(())
    }

    #[test]
    fn test_categories_single_channel_passthrough() -> Result<()> {
        let scores = Array4::from_shape_vec((1, 1, 1, 2), vec![0.1, 0.8])?;
        let map = categories(scores.into_dyn().view(), Layout::Nchw)?;
        assert_eq!(map, array![[0.1f32, 0.8]]);
        Ok(())
    }
}

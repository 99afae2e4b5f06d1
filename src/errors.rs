use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Pipeline stage an external-model failure originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Generator,
    Segmenter,
    Inpainter,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Generator => "generator",
            Self::Segmenter => "segmenter",
            Self::Inpainter => "inpainter",
        };
        f.write_str(name)
    }
}

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Structured error types for the generate/segment/inpaint pipeline.
///
/// Configuration and filesystem problems are kept apart from inference
/// failures: every error raised while loading or running a model is reported
/// as [`PipelineError::ExternalModel`] together with the [`Stage`] it came
/// from, so callers can tell the two apart without parsing messages.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Filesystem error: {operation} failed for {path:?}")]
    FileSystem {
        path: PathBuf,
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Image processing error: {operation} failed (file: {path})")]
    ImageProcessing {
        path: String,
        operation: String,
        #[source]
        source: BoxError,
    },

    #[error("External model failure in {stage}: {operation} failed")]
    ExternalModel {
        stage: Stage,
        operation: String,
        #[source]
        source: BoxError,
    },

    #[error("Validation error: {field} {reason}")]
    Validation { field: String, reason: String },
}

pub type Result<T> = std::result::Result<T, PipelineError>;

impl PipelineError {
    pub fn model(stage: Stage, operation: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::ExternalModel {
            stage,
            operation: operation.into(),
            source: source.into(),
        }
    }

    pub fn file_system(
        path: impl Into<PathBuf>,
        operation: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Self::FileSystem {
            path: path.into(),
            operation: operation.into(),
            source,
        }
    }

    /// Re-labels a model error raised by shared code with the stage that ran it.
    pub fn in_stage(self, stage: Stage) -> Self {
        match self {
            Self::ExternalModel {
                operation, source, ..
            } => Self::ExternalModel {
                stage,
                operation,
                source,
            },
            other => other,
        }
    }

    pub const fn stage(&self) -> Option<Stage> {
        match self {
            Self::ExternalModel { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

/// Convert I/O errors to filesystem errors.
///
/// Call sites that know the path and operation should build
/// [`PipelineError::FileSystem`] directly; this is the fallback for the rest.
impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        Self::FileSystem {
            path: PathBuf::from("unknown"),
            operation: "unknown".to_string(),
            source: err,
        }
    }
}

/// Convert image crate errors to image processing errors.
impl From<image::ImageError> for PipelineError {
    fn from(err: image::ImageError) -> Self {
        Self::ImageProcessing {
            path: "unknown".to_string(),
            operation: "image processing".to_string(),
            source: Box::new(err),
        }
    }
}

/// Convert ONNX Runtime errors to model errors.
///
/// Shared session code has no stage of its own, so the generator is assumed
/// here and the calling stage re-labels it with [`PipelineError::in_stage`].
impl From<ort::Error> for PipelineError {
    fn from(err: ort::Error) -> Self {
        Self::model(Stage::Generator, "ort operation", err)
    }
}

/// Convert ndarray shape errors to model errors.
///
/// Shape errors only happen while assembling or unpacking model tensors, so
/// they belong with the inference failures.
impl From<ndarray::ShapeError> for PipelineError {
    fn from(err: ndarray::ShapeError) -> Self {
        Self::model(Stage::Generator, "tensor shape conversion", err)
    }
}

use std::path::Path;

use ort::{
    execution_providers::{CUDAExecutionProvider, TensorRTExecutionProvider},
    session::{builder::SessionBuilder, Session},
    tensor::TensorElementType,
};
use tracing::debug;

use crate::errors::{PipelineError, Result, Stage};

/// Opens an ONNX model, preferring TensorRT and CUDA on `device_id` when the
/// runtime was built with them and falling back to the CPU otherwise.
pub fn load_session(model_path: &Path, device_id: i32, stage: Stage) -> Result<Session> {
    if !model_path.is_file() {
        return Err(PipelineError::file_system(
            model_path,
            "model file lookup",
            std::io::Error::new(std::io::ErrorKind::NotFound, "model file does not exist"),
        ));
    }

    debug!(model = %model_path.display(), %stage, "loading onnx session");
    let session = SessionBuilder::new()
        .map_err(|e| PipelineError::model(stage, "session builder init", e))?
        .with_execution_providers([
            TensorRTExecutionProvider::default()
                .with_device_id(device_id)
                .build(),
            CUDAExecutionProvider::default()
                .with_device_id(device_id)
                .build(),
        ])
        .map_err(|e| PipelineError::model(stage, "execution provider setup", e))?
        .with_memory_pattern(true)
        .map_err(|e| PipelineError::model(stage, "memory pattern setup", e))?
        .commit_from_file(model_path)
        .map_err(|e| {
            PipelineError::model(
                stage,
                format!("model load: {}", model_path.display()),
                e,
            )
        })?;

    Ok(session)
}

/// Element type of the named session input, if the model declares one.
pub fn input_element_type(session: &Session, name: &str) -> Option<TensorElementType> {
    session
        .inputs
        .iter()
        .find(|input| input.name == name)
        .and_then(|input| input.input_type.tensor_type())
}

/// Name of the first session output; exporters disagree on output names.
pub fn first_output_name(session: &Session, stage: Stage) -> Result<String> {
    session
        .outputs
        .first()
        .map(|output| output.name.clone())
        .ok_or_else(|| PipelineError::model(stage, "model output lookup", "model has no output"))
}

/// Static shape of the first session input. Dynamic axes come back negative.
pub fn first_input_shape(session: &Session, stage: Stage) -> Result<Vec<i64>> {
    let shape = session
        .inputs
        .first()
        .and_then(|input| input.input_type.tensor_shape())
        .ok_or_else(|| {
            PipelineError::model(
                stage,
                "model input shape lookup",
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "model has no tensor input",
                ),
            )
        })?;
    Ok(shape.iter().copied().collect())
}

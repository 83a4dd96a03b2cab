use thiserror::Error;

use crate::types::DType;

#[derive(Error, Debug)]
pub enum PagodaError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("Shape mismatch for {what}: expected {expected} elements, got {got}")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("Block id {block_id} out of range (num_blocks={num_blocks})")]
    BlockOutOfRange { block_id: usize, num_blocks: usize },

    #[error("Layer {layer} out of range (num_layers={num_layers})")]
    LayerOutOfRange { layer: usize, num_layers: usize },

    #[error("Sequence not found: {0}")]
    SeqNotFound(u64),

    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    #[error("Unsupported dtype: {0:?}")]
    UnsupportedDtype(DType),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PagodaError>;

/// Fails with [`PagodaError::ShapeMismatch`] unless `got` is at least `expected`.
pub fn ensure_len(what: &'static str, expected: usize, got: usize) -> Result<()> {
    if got < expected {
        return Err(PagodaError::ShapeMismatch {
            what,
            expected,
            got,
        });
    }
    Ok(())
}

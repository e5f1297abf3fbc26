//! Error taxonomy for self-supervised training.
//!
//! Misconfiguration is never masked: unknown names, bad indices and
//! unimplemented schedule settings all surface as distinct variants.

/// Errors raised by models, optimizers, schedules, callbacks and checkpoints.
#[derive(Debug, thiserror::Error)]
pub enum TrainingError {
    /// Optimizer index outside the module's optimizer list.
    #[error("Optimizer index {index} out of range ({len} optimizers configured)")]
    OptimizerIndexOutOfRange { index: usize, len: usize },
    /// Index outside a list (or past the single element of a singleton).
    #[error("Index {index} out of range for list of length {len}")]
    IndexOutOfRange { index: usize, len: usize },
    /// A schedule frequency other than 1 was requested.
    #[error("Learning rate schedule frequency {0} is not implemented (only 1 is supported)")]
    UnsupportedFrequency(usize),
    /// A schedule interval string other than `step` or `epoch`.
    #[error("Unrecognized learning rate schedule interval: {0:?}")]
    UnrecognizedInterval(String),
    /// Encoder name not in the recognized set.
    #[error("Unknown encoder name: {0:?}")]
    UnknownEncoder(String),
    /// Two configuration flags that cannot be combined.
    #[error("Incompatible configuration: {0}")]
    IncompatibleConfig(String),
    /// Training-type tag other than `SimCLR` or `BYOL`.
    #[error("Unknown SSL training type: {0:?}")]
    UnknownSslType(String),
    /// Data-module tag other than `encoder` or `linear_head`.
    #[error("Unknown SSL data module type: {0:?}")]
    UnknownDataModuleType(String),
    /// Keyed batch is missing the requested sub-batch.
    #[error("Batch has no entry for data module {0}")]
    MissingSubBatch(String),
    /// Tensor dimensions disagree with a configured width.
    #[error("Shape mismatch in {context}: expected {expected}, got {actual}")]
    ShapeMismatch {
        context: String,
        expected: usize,
        actual: usize,
    },
    /// Lifecycle hook invoked out of order or more than once.
    #[error("Lifecycle violation: {0}")]
    Lifecycle(String),
    /// Optimizer list has the wrong length for this module.
    #[error("Expected {expected} optimizers, got {actual}")]
    OptimizerCount { expected: String, actual: usize },
    /// Filesystem failure while reading or writing a checkpoint.
    #[error("Checkpoint I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// Failure inside burn's recorder (module or optimizer records).
    #[error("Record error at {path}: {message}")]
    Record { path: String, message: String },
    /// JSON (de)serialization failure for checkpoint metadata.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Failure inside a collective operation across workers.
    #[error("Distributed error: {0}")]
    Distributed(String),
    /// Tensor data could not be converted to host values.
    #[error("Tensor data error: {0}")]
    TensorData(String),
}

impl TrainingError {
    pub(crate) fn io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        TrainingError::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }

    pub(crate) fn record(path: impl AsRef<std::path::Path>, err: impl std::fmt::Display) -> Self {
        TrainingError::Record {
            path: path.as_ref().display().to_string(),
            message: err.to_string(),
        }
    }
}

/// Result alias used across the crate.
pub type Result<T, E = TrainingError> = std::result::Result<T, E>;

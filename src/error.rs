//! Error type shared by the training pipeline

use std::path::PathBuf;

use ndarray_npy::ReadNpzError;
use thiserror::Error;

use crate::training::pipeline::Stage;

/// Everything that can end a training run. None of these are retried.
#[derive(Error, Debug)]
pub enum TrainError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to open sample archive {path}: {source}")]
    Archive {
        path: PathBuf,
        #[source]
        source: ReadNpzError,
    },

    #[error("sample archive is missing array `{0}`")]
    MissingArray(String),

    #[error("failed to decode array `{name}`: {source}")]
    Decode {
        name: String,
        #[source]
        source: ReadNpzError,
    },

    #[error("sample archive contains no samples")]
    EmptyBatch,

    #[error("array `{name}` has {len} elements, which does not reshape into {shape:?}")]
    Shape {
        name: String,
        len: usize,
        shape: Vec<usize>,
    },

    #[error("input `{name}` has shape {actual:?}, expected {expected:?}")]
    InputShape {
        name: String,
        actual: Vec<usize>,
        expected: Vec<usize>,
    },

    #[error("invalid training configuration: {0}")]
    Config(String),

    #[error("training diverged: non-finite loss {loss} at epoch {epoch}, batch {batch}")]
    Diverged { epoch: usize, batch: usize, loss: f32 },

    #[error("model record error at {path}: {reason}")]
    Record { path: PathBuf, reason: String },

    #[error("model export failed: {0}")]
    Export(String),

    #[error("illegal stage transition {from} -> {to}")]
    StageTransition { from: Stage, to: Stage },
}

impl TrainError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TrainError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn record(path: impl Into<PathBuf>, reason: impl std::fmt::Debug) -> Self {
        TrainError::Record {
            path: path.into(),
            reason: format!("{reason:?}"),
        }
    }
}

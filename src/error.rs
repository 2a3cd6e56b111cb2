use std::path::PathBuf;
use thiserror::Error;

/// Typed failures raised by architecture construction, input validation and
/// configuration loading. Library entry points return `anyhow::Result`, so
/// callers that care can `downcast_ref::<LivenetError>()`.
#[derive(Error, Debug)]
pub enum LivenetError {
    #[error("{arch} needs windows of at least {minimum} samples, got dimension {dimension}")]
    DimensionTooSmall {
        arch: &'static str,
        dimension: usize,
        minimum: usize,
    },

    #[error("{input} input has shape {got:?}, expected {expected:?}")]
    InputShape {
        input: &'static str,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("{arch} fuses an rPPG branch but the batch carries no ppg signal")]
    MissingRppg { arch: &'static str },

    #[error("{arch} is RGB-only but the batch carries a ppg signal")]
    UnexpectedRppg { arch: &'static str },

    #[error("labels have shape {got:?}, expected [{batch}, 2] one-hot rows")]
    LabelShape { batch: usize, got: Vec<usize> },

    #[error("label {index} has class id {class}, expected < {num_classes}")]
    InvalidLabel {
        index: usize,
        class: u32,
        num_classes: usize,
    },

    #[error("label row {index} sums to {sum}, expected a one-hot or probability row")]
    LabelRow { index: usize, sum: f32 },

    #[error("rgb batch has {rgb} windows but ppg batch has {ppg}")]
    BatchMismatch { rgb: usize, ppg: usize },

    #[error("empty batch")]
    EmptyBatch,

    #[error("unknown architecture: {0}")]
    UnknownArchitecture(String),

    #[error("failed to read config file: {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

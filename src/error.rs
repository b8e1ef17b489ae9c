use thiserror::Error;

/// Errors raised while building, decoding or scoring charts.
#[derive(Debug, Error)]
pub enum Error {
    /// Sentence is longer than the supported position table.
    #[error("sentence of length {length} exceeds the maximum supported length of {max}")]
    LengthExceeded { length: usize, max: usize },

    /// Two nodes claim the same span with different labels.
    #[error("span [{start}, {end}) already labeled {existing}, cannot relabel as {new}")]
    InconsistentTree {
        start: usize,
        end: usize,
        existing: i32,
        new: i32,
    },

    #[error("invalid chart: {0}")]
    InvalidChart(String),

    #[error("cannot decode an empty sentence")]
    EmptySentence,

    #[error("unknown label: '{0}'")]
    UnknownLabel(String),

    #[error("invalid vocabulary: {0}")]
    InvalidVocabulary(String),

    #[error("invalid tree: {0}")]
    InvalidTree(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// A sub-batch call returned a different number of outputs than it received.
    #[error("sub-batch returned {got} outputs for {expected} inputs")]
    SubbatchMismatch { expected: usize, got: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

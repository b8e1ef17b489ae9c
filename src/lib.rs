//! Chart decoding for span-based constituency parsing.
//!
//! A scorer assigns every span of a sentence a score per label; this crate
//! turns gold trees into label charts, finds the best tree of a score chart
//! with CKY, computes the structured margin loss used in training and splits
//! work into sub-batches bounded by a token budget.

pub mod chart;
pub mod config;
mod dataset;
mod error;
pub mod evaluation;
pub mod heads;
pub mod quark;
pub mod subbatch;
pub mod tree;
pub mod vocab;

pub use chart::{
    pad_charts, ChartDecoder, CompressedOutput, Decoded, GoldCharts, LabelChart, MarginOutcome, Reduction,
    ScoreChart, ScoreTensor, SpanMarginLoss, IGNORE_INDEX,
};
pub use config::{HParams, Heads, ParserConfig, ParserConfigBuilder};
pub use dataset::Treebank;
pub use error::{Error, Result};
pub use evaluation::Evaluation;
pub use subbatch::SubbatchMeta;
pub use tree::{Span, Tree};
pub use vocab::{LabelVocabulary, SymbolVocabulary};

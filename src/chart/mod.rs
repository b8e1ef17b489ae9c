//! Dense span charts.
//!
//! Every chart is indexed by `[start][end - 1]` for a span `[start, end)`, so a
//! sentence of `n` tokens uses an `n × n` grid whose upper triangle (diagonal
//! included) holds the spans.

pub(crate) mod context;
pub mod decoder;
pub mod loss;

use serde::{Deserialize, Serialize};

use crate::tree::{Span, Tree};
use crate::vocab::{LabelVocabulary, SymbolVocabulary, EMPTY_LABEL};
use crate::{Error, Result};

pub use decoder::{ChartDecoder, Decoded, GoldCharts};
pub use loss::{MarginOutcome, Reduction, SpanMarginLoss};

/// Marks cells that never correspond to a span (below the diagonal, padding).
pub const IGNORE_INDEX: i32 = -100;

pub type Float = f64;

/// Per-label scores for every span of one sentence: `[n][n][L]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreChart {
    len: usize,
    num_labels: usize,
    scores: Vec<Float>,
}

impl ScoreChart {
    pub fn new(len: usize, num_labels: usize) -> Self {
        Self {
            len,
            num_labels,
            scores: vec![0.0; len * len * num_labels],
        }
    }

    pub fn from_vec(len: usize, num_labels: usize, scores: Vec<Float>) -> Result<Self> {
        if num_labels == 0 {
            return Err(Error::InvalidChart("missing label-0 column".to_string()));
        }
        if scores.len() != len * len * num_labels {
            return Err(Error::InvalidChart(format!(
                "expected {len}x{len}x{num_labels} scores, got {}",
                scores.len()
            )));
        }
        Ok(Self {
            len,
            num_labels,
            scores,
        })
    }

    /// Builds a chart from a nested `[n][n][L]` array.
    pub fn from_nested(nested: &[Vec<Vec<Float>>]) -> Result<Self> {
        let len = nested.len();
        let num_labels = nested.first().and_then(|row| row.first()).map_or(0, Vec::len);
        let mut scores = Vec::with_capacity(len * len * num_labels);
        for row in nested {
            if row.len() != len {
                return Err(Error::InvalidChart(format!("row of width {} in a chart of length {len}", row.len())));
            }
            for cell in row {
                if cell.len() != num_labels {
                    return Err(Error::InvalidChart(format!(
                        "cell with {} labels in a chart of {num_labels} labels",
                        cell.len()
                    )));
                }
                scores.extend_from_slice(cell);
            }
        }
        Self::from_vec(len, num_labels, scores)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn num_labels(&self) -> usize {
        self.num_labels
    }

    #[inline]
    fn offset(&self, start: usize, end: usize) -> usize {
        debug_assert!(start < end && end <= self.len, "span [{start}, {end}) out of range");
        (start * self.len + (end - 1)) * self.num_labels
    }

    /// All label scores of span `[start, end)`.
    #[inline]
    pub fn cell(&self, start: usize, end: usize) -> &[Float] {
        let o = self.offset(start, end);
        &self.scores[o..o + self.num_labels]
    }

    #[inline]
    pub fn cell_mut(&mut self, start: usize, end: usize) -> &mut [Float] {
        let o = self.offset(start, end);
        let l = self.num_labels;
        &mut self.scores[o..o + l]
    }

    #[inline]
    pub fn get(&self, start: usize, end: usize, label: usize) -> Float {
        self.cell(start, end)[label]
    }

    pub fn set(&mut self, start: usize, end: usize, label: usize, score: Float) {
        self.cell_mut(start, end)[label] = score;
    }

    /// Shifts every cell so that the empty label scores exactly 0.
    pub fn normalize(&mut self) {
        for cell in self.scores.chunks_mut(self.num_labels.max(1)) {
            let base = cell[0];
            for s in cell.iter_mut() {
                *s -= base;
            }
        }
    }

    pub fn normalized(&self) -> ScoreChart {
        let mut chart = self.clone();
        chart.normalize();
        chart
    }
}

/// Padded batch of score charts: `[B][T][T][L]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreTensor {
    batch: usize,
    max_len: usize,
    num_labels: usize,
    scores: Vec<Float>,
}

impl ScoreTensor {
    pub fn new(batch: usize, max_len: usize, num_labels: usize, scores: Vec<Float>) -> Result<Self> {
        if num_labels == 0 {
            return Err(Error::InvalidChart("missing label-0 column".to_string()));
        }
        if scores.len() != batch * max_len * max_len * num_labels {
            return Err(Error::InvalidChart(format!(
                "expected {batch}x{max_len}x{max_len}x{num_labels} scores, got {}",
                scores.len()
            )));
        }
        Ok(Self {
            batch,
            max_len,
            num_labels,
            scores,
        })
    }

    /// Pads a list of charts with zeros to the longest one.
    pub fn from_charts(charts: &[ScoreChart]) -> Result<Self> {
        let max_len = charts.iter().map(ScoreChart::len).max().unwrap_or(0);
        let num_labels = charts.first().map_or(1, ScoreChart::num_labels);
        let mut tensor = Self::new(
            charts.len(),
            max_len,
            num_labels,
            vec![0.0; charts.len() * max_len * max_len * num_labels],
        )?;
        for (b, chart) in charts.iter().enumerate() {
            if chart.num_labels() != num_labels {
                return Err(Error::InvalidChart(format!(
                    "chart {b} has {} labels, expected {num_labels}",
                    chart.num_labels()
                )));
            }
            for start in 0..chart.len() {
                for end in start + 1..=chart.len() {
                    let o = tensor.offset(b, start, end);
                    tensor.scores[o..o + num_labels].copy_from_slice(chart.cell(start, end));
                }
            }
        }
        Ok(tensor)
    }

    pub fn batch_size(&self) -> usize {
        self.batch
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    pub fn num_labels(&self) -> usize {
        self.num_labels
    }

    #[inline]
    fn offset(&self, b: usize, start: usize, end: usize) -> usize {
        ((b * self.max_len + start) * self.max_len + (end - 1)) * self.num_labels
    }

    /// Copies the unpadded `[length][length][L]` block of example `b`.
    pub fn example(&self, b: usize, length: usize) -> Result<ScoreChart> {
        if b >= self.batch {
            return Err(Error::InvalidChart(format!("example {b} out of range for batch of {}", self.batch)));
        }
        if length > self.max_len {
            return Err(Error::InvalidChart(format!(
                "length {length} exceeds padded length {}",
                self.max_len
            )));
        }
        let mut chart = ScoreChart::new(length, self.num_labels);
        for start in 0..length {
            for end in start + 1..=length {
                let o = self.offset(b, start, end);
                chart
                    .cell_mut(start, end)
                    .copy_from_slice(&self.scores[o..o + self.num_labels]);
            }
        }
        Ok(chart)
    }
}

/// One label id per span: `[n][n]` with [`IGNORE_INDEX`] below the diagonal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LabelChart {
    len: usize,
    cells: Vec<i32>,
}

impl LabelChart {
    pub fn new(len: usize) -> Self {
        let mut cells = vec![EMPTY_LABEL as i32; len * len];
        for row in 0..len {
            for col in 0..row {
                cells[row * len + col] = IGNORE_INDEX;
            }
        }
        Self { len, cells }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn get(&self, start: usize, end: usize) -> i32 {
        self.cells[start * self.len + (end - 1)]
    }

    #[inline]
    pub fn set(&mut self, start: usize, end: usize, id: i32) {
        self.cells[start * self.len + (end - 1)] = id;
    }

    /// Records a constituent, refusing to overwrite a different label.
    pub fn assign(&mut self, span: Span, id: usize) -> Result<()> {
        let existing = self.get(span.start, span.end);
        let id = id as i32;
        if existing != EMPTY_LABEL as i32 && existing != id {
            return Err(Error::InconsistentTree {
                start: span.start,
                end: span.end,
                existing,
                new: id,
            });
        }
        self.set(span.start, span.end, id);
        Ok(())
    }

    /// Spans holding a non-empty label, row by row.
    pub fn labeled_spans(&self) -> impl Iterator<Item = (Span, usize)> + '_ {
        (0..self.len).flat_map(move |start| {
            (start + 1..=self.len).filter_map(move |end| {
                let id = self.get(start, end);
                (id > EMPTY_LABEL as i32).then(|| (Span { start, end }, id as usize))
            })
        })
    }

    pub fn as_slice(&self) -> &[i32] {
        &self.cells
    }

    pub fn to_nested(&self) -> Vec<Vec<i32>> {
        self.cells.chunks(self.len.max(1)).take(self.len).map(<[i32]>::to_vec).collect()
    }
}

/// Pads label charts into one `[B][T][T]` buffer; returns it with `T`.
pub fn pad_charts(charts: &[LabelChart], padding_value: i32) -> (Vec<i32>, usize) {
    let max_len = charts.iter().map(LabelChart::len).max().unwrap_or(0);
    let mut out = vec![padding_value; charts.len() * max_len * max_len];
    for (b, chart) in charts.iter().enumerate() {
        for row in 0..chart.len() {
            let src = &chart.cells[row * chart.len()..(row + 1) * chart.len()];
            let dst = (b * max_len + row) * max_len;
            out[dst..dst + chart.len()].copy_from_slice(src);
        }
    }
    (out, max_len)
}

/// A decoded parse as preorder `(start, end, label)` triples.
///
/// Holds every single-token span, the root span and every labeled span.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressedOutput {
    pub starts: Vec<usize>,
    pub ends: Vec<usize>,
    pub labels: Vec<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<usize>>,
}

impl CompressedOutput {
    pub fn from_chart(chart: &LabelChart) -> Self {
        let n = chart.len();
        let mut spans = Vec::new();
        for start in 0..n {
            for end in start + 1..=n {
                let id = chart.get(start, end);
                let keep = id > EMPTY_LABEL as i32 || end - start == 1 || (start == 0 && end == n);
                if keep {
                    spans.push((start, end, id.max(0) as usize));
                }
            }
        }
        spans.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));
        Self {
            starts: spans.iter().map(|s| s.0).collect(),
            ends: spans.iter().map(|s| s.1).collect(),
            labels: spans.iter().map(|s| s.2).collect(),
            tags: None,
        }
    }

    pub fn with_tags(mut self, tags: Vec<usize>) -> Self {
        self.tags = Some(tags);
        self
    }

    pub fn len(&self) -> usize {
        self.starts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.starts.is_empty()
    }

    /// Pairs `words` with the attached tag ids, if any.
    pub fn leaves(&self, words: &[String], tag_vocab: &SymbolVocabulary) -> Result<Vec<(String, String)>> {
        let tags = self
            .tags
            .as_ref()
            .ok_or_else(|| Error::InvalidChart("no tags attached".to_string()))?;
        if tags.len() != words.len() {
            return Err(Error::InvalidChart(format!("{} tags for {} words", tags.len(), words.len())));
        }
        words
            .iter()
            .zip(tags)
            .map(|(w, &t)| {
                let tag = tag_vocab
                    .symbol(t)
                    .ok_or_else(|| Error::InvalidChart(format!("tag id {t} out of range")))?;
                Ok((w.clone(), tag.to_string()))
            })
            .collect()
    }

    /// Rebuilds the tree; chain labels become nested single-label nodes.
    pub fn to_tree(&self, leaves: &[(String, String)], vocab: &LabelVocabulary) -> Result<Tree> {
        let n = self.ends.first().copied().unwrap_or(0);
        if self.is_empty() || self.starts[0] != 0 {
            return Err(Error::EmptySentence);
        }
        if leaves.len() != n {
            return Err(Error::InvalidChart(format!("{} leaves for a chart of length {n}", leaves.len())));
        }
        let (_, mut children) = self.build(0, leaves, vocab)?;
        if children.len() == 1 {
            Ok(children.remove(0))
        } else {
            Ok(Tree::Internal {
                labels: Vec::new(),
                children,
            })
        }
    }

    fn build(&self, idx: usize, leaves: &[(String, String)], vocab: &LabelVocabulary) -> Result<(usize, Vec<Tree>)> {
        let (start, end, label) = (self.starts[idx], self.ends[idx], self.labels[idx]);
        let mut idx = idx + 1;
        let mut children = Vec::new();
        if end - start == 1 {
            let (word, tag) = &leaves[start];
            children.push(Tree::leaf(word, tag));
        } else {
            while idx < self.len() && self.starts[idx] < end {
                let (next, sub) = self.build(idx, leaves, vocab)?;
                children.extend(sub);
                idx = next;
            }
        }
        for sub_label in vocab.chain(label)?.into_iter().rev() {
            children = vec![Tree::Internal {
                labels: vec![sub_label],
                children,
            }];
        }
        Ok((idx, children))
    }
}

//! Targets and losses of the auxiliary heads.
//!
//! The heads themselves live with the external scorer; this module prepares
//! their gold targets (with negative sampling where the targets are sparse)
//! and folds their scores into one loss record.

use std::{collections::BTreeMap, fmt::Display};

use rand::{seq::index, Rng};
use serde::{Deserialize, Serialize};

use crate::{
    chart::{ChartDecoder, GoldCharts, LabelChart, Reduction, IGNORE_INDEX},
    config::{Heads, ParserConfig},
    subbatch::SubbatchMeta,
    tree::{Span, Tree},
    vocab::{LabelVocabulary, SymbolVocabulary, EMPTY_LABEL},
    Error, Result,
};

/// `label -> neighbouring label -> count`.
pub type CooccurrenceCounts = BTreeMap<String, BTreeMap<String, usize>>;

/// How often each label appears next to each sibling label in a treebank.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiblingStats {
    pub left: CooccurrenceCounts,
    pub right: CooccurrenceCounts,
}

impl SiblingStats {
    /// Counts sibling pairs over the gold charts of `trees`. A missing
    /// sibling is counted under the empty label.
    pub fn from_trees(trees: &[Tree], decoder: &ChartDecoder) -> Result<Self> {
        let vocab = decoder.label_vocab();
        let mut stats = Self::default();
        for tree in trees {
            let gold = decoder.chart_from_tree(tree)?;
            for (span, id) in gold.labels.labeled_spans() {
                let label = vocab.label(id)?;
                let left = vocab.label(gold.left_siblings.get(span.start, span.end) as usize)?;
                let right = vocab.label(gold.right_siblings.get(span.start, span.end) as usize)?;
                *stats
                    .left
                    .entry(label.to_string())
                    .or_default()
                    .entry(left.to_string())
                    .or_default() += 1;
                *stats
                    .right
                    .entry(label.to_string())
                    .or_default()
                    .entry(right.to_string())
                    .or_default() += 1;
            }
        }
        Ok(stats)
    }
}

/// Tag id per token.
pub fn tag_targets(leaves: &[(String, String)], tag_vocab: &SymbolVocabulary) -> Result<Vec<i32>> {
    leaves
        .iter()
        .map(|(_, tag)| {
            tag_vocab
                .id(tag)
                .map(|id| id as i32)
                .ok_or_else(|| Error::UnknownLabel(tag.clone()))
        })
        .collect()
}

/// Pattern id per span.
///
/// Spans with a known non-empty pattern are positives. When positives are
/// plentiful (at least twice the sentence length) up to `num_negative` random
/// spans per positive become negatives (id 0) and the rest stay ignored;
/// otherwise every span without a pattern is a negative.
pub fn pattern_targets<R: Rng>(
    len: usize,
    patterns: &[(Span, String)],
    pattern_vocab: &SymbolVocabulary,
    num_negative: usize,
    rng: &mut R,
) -> Result<LabelChart> {
    if len == 0 {
        return Err(Error::EmptySentence);
    }
    let mut chart = LabelChart::new(len);
    for start in 0..len {
        for end in start + 1..=len {
            chart.set(start, end, IGNORE_INDEX);
        }
    }

    let mut positive = 0;
    for (span, pattern) in patterns {
        if span.end > len || span.start >= span.end {
            return Err(Error::InvalidChart(format!(
                "pattern span {span} outside a sentence of length {len}"
            )));
        }
        match pattern_vocab.id(pattern) {
            Some(id) if id != EMPTY_LABEL => {
                chart.set(span.start, span.end, id as i32);
                positive += 1;
            }
            Some(_) => {}
            None => log::debug!("skipping unknown pattern '{pattern}' at {span}"),
        }
    }

    let per_positive = (positive / len) as isize - 1;
    let num_negative = per_positive.min(num_negative as isize);
    if num_negative > 0 {
        for _ in 0..positive * num_negative as usize {
            let a = rng.random_range(0..len);
            let b = rng.random_range(0..len);
            let (start, end) = (a.min(b), a.max(b) + 1);
            if chart.get(start, end) == IGNORE_INDEX {
                chart.set(start, end, EMPTY_LABEL as i32);
            }
        }
    } else {
        for start in 0..len {
            for end in start + 1..=len {
                if chart.get(start, end) == IGNORE_INDEX {
                    chart.set(start, end, EMPTY_LABEL as i32);
                }
            }
        }
    }
    Ok(chart)
}

/// Binary compatibility targets: 1 for observed pairs, [`IGNORE_INDEX`]
/// for unobserved ones until sampled as negatives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompatibilityMatrix {
    rows: usize,
    cols: usize,
    cells: Vec<i32>,
    num_positive: usize,
}

impl CompatibilityMatrix {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            cells: vec![IGNORE_INDEX; rows * cols],
            num_positive: 0,
        }
    }

    fn mark(&mut self, row: usize, col: usize) {
        let cell = &mut self.cells[row * self.cols + col];
        if *cell != 1 {
            *cell = 1;
            self.num_positive += 1;
        }
    }

    /// Pattern (row) against non-empty label (column `id - 1`).
    pub fn pattern_labels(
        pattern_vocab: &SymbolVocabulary,
        label_vocab: &LabelVocabulary,
        children: &BTreeMap<String, Vec<String>>,
    ) -> Self {
        let mut m = Self::new(pattern_vocab.len(), label_vocab.len().saturating_sub(1));
        for (pattern, labels) in children {
            let Some(row) = pattern_vocab.id(pattern) else {
                log::warn!("pattern '{pattern}' is not in the pattern vocabulary");
                continue;
            };
            for label in labels {
                match label_vocab.id(label) {
                    Ok(id) if id != EMPTY_LABEL => m.mark(row, id - 1),
                    _ => log::debug!("skipping label '{label}' under pattern '{pattern}'"),
                }
            }
        }
        log::info!(
            "pattern compatibility: {} positive of {}",
            m.num_positive,
            m.cells.len()
        );
        m
    }

    /// Non-empty label (row `id - 1`) against sibling label (column), for
    /// pairs seen at least `threshold` times.
    pub fn siblings(label_vocab: &LabelVocabulary, counts: &CooccurrenceCounts, threshold: usize) -> Self {
        let mut m = Self::new(label_vocab.len().saturating_sub(1), label_vocab.len());
        for (label, siblings) in counts {
            let row = match label_vocab.id(label) {
                Ok(id) if id != EMPTY_LABEL => id - 1,
                _ => {
                    log::warn!("label '{label}' is not in the label vocabulary");
                    continue;
                }
            };
            for (sibling, &count) in siblings {
                if count < threshold {
                    continue;
                }
                if let Ok(col) = label_vocab.id(sibling) {
                    m.mark(row, col);
                }
            }
        }
        log::info!(
            "sibling compatibility: {} positive of {}",
            m.num_positive,
            m.cells.len()
        );
        m
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn num_positive(&self) -> usize {
        self.num_positive
    }

    pub fn get(&self, row: usize, col: usize) -> i32 {
        self.cells[row * self.cols + col]
    }

    pub fn as_slice(&self) -> &[i32] {
        &self.cells
    }

    /// Copy with `num_negative` negatives per positive drawn from the
    /// unobserved pairs, or with every unobserved pair a negative when the
    /// matrix is too dense for that.
    pub fn sample_negatives<R: Rng>(&self, num_negative: usize, rng: &mut R) -> Self {
        let mut m = self.clone();
        let total = m.cells.len();
        let wanted = m.num_positive * num_negative;
        if m.num_positive > 0 && wanted < total {
            for i in index::sample(rng, total, wanted).iter() {
                if m.cells[i] == IGNORE_INDEX {
                    m.cells[i] = 0;
                }
            }
        } else {
            for cell in m.cells.iter_mut().filter(|c| **c == IGNORE_INDEX) {
                *cell = 0;
            }
        }
        m
    }
}

/// Per-example targets of the span classifier and the per-span heads.
#[derive(Debug, Clone, PartialEq)]
pub struct Targets {
    pub gold: GoldCharts,
    pub tags: Option<Vec<i32>>,
    pub patterns: Option<LabelChart>,
}

/// Targets shared by every example of a batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchTargets {
    pub compatibility: Option<CompatibilityMatrix>,
    pub left_sibling_compatibility: Option<CompatibilityMatrix>,
    pub right_sibling_compatibility: Option<CompatibilityMatrix>,
}

/// Builds the targets every active head of a configuration trains on.
#[derive(Debug, Clone)]
pub struct TargetEncoder {
    config: ParserConfig,
    decoder: ChartDecoder,
    compatibility: Option<CompatibilityMatrix>,
    sibling_compatibility: Option<(CompatibilityMatrix, CompatibilityMatrix)>,
}

impl TargetEncoder {
    pub fn new(config: &ParserConfig) -> Self {
        let label_vocab = config.label_vocab();
        let compatibility = match (config.pattern_vocab(), config.pattern_children()) {
            (Some(patterns), Some(children)) if config.heads().contains(Heads::COMPATIBILITY) => {
                Some(CompatibilityMatrix::pattern_labels(patterns, label_vocab, children))
            }
            _ => None,
        };
        let sibling_compatibility = match config.sibling_stats() {
            Some(stats) if config.heads().contains(Heads::SIBLING_COMPATIBILITY) => {
                let threshold = config.hparams().sibling_compatible_threshold;
                Some((
                    CompatibilityMatrix::siblings(label_vocab, &stats.left, threshold),
                    CompatibilityMatrix::siblings(label_vocab, &stats.right, threshold),
                ))
            }
            _ => None,
        };
        Self {
            config: config.clone(),
            decoder: config.decoder(),
            compatibility,
            sibling_compatibility,
        }
    }

    pub fn decoder(&self) -> &ChartDecoder {
        &self.decoder
    }

    /// Targets of one tree; `patterns` are the pattern occurrences found in it.
    pub fn encode<R: Rng>(&self, tree: &Tree, patterns: &[(Span, String)], rng: &mut R) -> Result<Targets> {
        let gold = self.decoder.chart_from_tree(tree)?;
        let tags = match self.config.tag_vocab() {
            Some(vocab) if self.config.heads().contains(Heads::TAGGING) => Some(tag_targets(&tree.pos(), vocab)?),
            _ => None,
        };
        let patterns = match self.config.pattern_vocab() {
            Some(vocab) if self.config.heads().contains(Heads::PATTERN) => Some(pattern_targets(
                tree.len(),
                patterns,
                vocab,
                self.config.hparams().pattern_num_negative,
                rng,
            )?),
            _ => None,
        };
        Ok(Targets { gold, tags, patterns })
    }

    /// Freshly sampled compatibility targets for one batch.
    pub fn batch_targets<R: Rng>(&self, rng: &mut R) -> BatchTargets {
        let hparams = self.config.hparams();
        let compatibility = self
            .compatibility
            .as_ref()
            .map(|m| m.sample_negatives(hparams.compatible_num_negative, rng));
        let (left_sibling_compatibility, right_sibling_compatibility) = match &self.sibling_compatibility {
            Some((left, right)) => (
                Some(left.sample_negatives(hparams.sibling_compatible_num_negative, rng)),
                Some(right.sample_negatives(hparams.sibling_compatible_num_negative, rng)),
            ),
            None => (None, None),
        };
        BatchTargets {
            compatibility,
            left_sibling_compatibility,
            right_sibling_compatibility,
        }
    }
}

/// Row-major `[N][C]` scores of one head with one target per row.
#[derive(Debug, Clone, Copy)]
pub struct Logits<'a> {
    scores: &'a [f64],
    num_classes: usize,
    targets: &'a [i32],
}

impl<'a> Logits<'a> {
    pub fn new(scores: &'a [f64], num_classes: usize, targets: &'a [i32]) -> Result<Self> {
        if num_classes == 0 || scores.len() != targets.len() * num_classes {
            return Err(Error::InvalidChart(format!(
                "{} scores for {} targets of {num_classes} classes",
                scores.len(),
                targets.len()
            )));
        }
        if let Some(&t) = targets
            .iter()
            .find(|&&t| t != IGNORE_INDEX && (t < 0 || t as usize >= num_classes))
        {
            return Err(Error::InvalidChart(format!("target {t} out of range for {num_classes} classes")));
        }
        Ok(Self {
            scores,
            num_classes,
            targets,
        })
    }

    fn rows(&self) -> impl Iterator<Item = (&'a [f64], usize)> + '_ {
        self.scores
            .chunks(self.num_classes)
            .zip(self.targets)
            .filter(|&(_, &t)| t != IGNORE_INDEX)
            .map(|(row, &t)| (row, t as usize))
    }
}

fn reduce(losses: impl Iterator<Item = f64>, reduction: Reduction) -> f64 {
    let (sum, n) = losses.fold((0.0, 0usize), |(s, n), l| (s + l, n + 1));
    match reduction {
        Reduction::Sum => sum,
        Reduction::Mean if n == 0 => 0.0,
        Reduction::Mean => sum / n as f64,
    }
}

/// Softmax cross-entropy over unnormalized scores, skipping ignored rows.
pub fn cross_entropy(logits: &Logits, reduction: Reduction) -> f64 {
    reduce(
        logits.rows().map(|(row, t)| {
            let max = row.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            let log_z = max + row.iter().map(|s| (s - max).exp()).sum::<f64>().ln();
            log_z - row[t]
        }),
        reduction,
    )
}

/// Negative log-likelihood over log-probabilities, skipping ignored rows.
pub fn nll_loss(log_probs: &Logits, reduction: Reduction) -> f64 {
    reduce(log_probs.rows().map(|(row, t)| -row[t]), reduction)
}

/// Scores the external heads produced for one sub-batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeadScores<'a> {
    pub tags: Option<Logits<'a>>,
    pub patterns: Option<Logits<'a>>,
    /// Log-probabilities of the two compatibility classes.
    pub compatibility: Option<Logits<'a>>,
    pub left_siblings: Option<Logits<'a>>,
    pub right_siblings: Option<Logits<'a>>,
    pub left_sibling_compatibility: Option<Logits<'a>>,
    pub right_sibling_compatibility: Option<Logits<'a>>,
}

/// Loss of each head; an inactive head has no entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LossBreakdown {
    pub label: f64,
    pub tag: Option<f64>,
    pub pattern: Option<f64>,
    pub compatible: Option<f64>,
    pub sibling: Option<f64>,
    pub sibling_compatible: Option<f64>,
}

fn required(heads: Heads, head: Heads, logits: Option<Logits<'_>>) -> Result<Option<Logits<'_>>> {
    match (heads.contains(head), logits) {
        (false, _) => Ok(None),
        (true, Some(l)) => Ok(Some(l)),
        (true, None) => Err(Error::InvalidConfig(format!("no scores for the active {head:?} head"))),
    }
}

impl LossBreakdown {
    /// Combines the span loss (summed over the sub-batch) with the scaled
    /// losses of the active heads. Span and tag losses are normalized by the
    /// size of the whole batch, not of the sub-batch.
    pub fn compute(config: &ParserConfig, span_loss: f64, scores: &HeadScores, meta: SubbatchMeta) -> Result<Self> {
        let heads = config.heads();
        let h = config.hparams();
        let need = |head, logits| required(heads, head, logits);

        let tag = need(Heads::TAGGING, scores.tags)?.map(|l| {
            h.tag_loss_scale * cross_entropy(&l, Reduction::Sum) / meta.batch_num_tokens.max(1) as f64
        });
        let pattern = need(Heads::PATTERN, scores.patterns)?
            .map(|l| h.pattern_loss_scale * cross_entropy(&l, Reduction::Mean));
        let compatible = need(Heads::COMPATIBILITY, scores.compatibility)?
            .map(|l| h.compatible_loss_scale * nll_loss(&l, Reduction::Mean));
        let sibling = match (
            need(Heads::SIBLING, scores.left_siblings)?,
            need(Heads::SIBLING, scores.right_siblings)?,
        ) {
            (Some(left), Some(right)) => Some(
                h.sibling_loss_scale * cross_entropy(&left, Reduction::Mean)
                    + h.sibling_loss_scale * cross_entropy(&right, Reduction::Mean),
            ),
            _ => None,
        };
        let sibling_compatible = match (
            need(Heads::SIBLING_COMPATIBILITY, scores.left_sibling_compatibility)?,
            need(Heads::SIBLING_COMPATIBILITY, scores.right_sibling_compatibility)?,
        ) {
            (Some(left), Some(right)) => Some(
                h.sibling_compatible_loss_scale * nll_loss(&left, Reduction::Mean)
                    + h.sibling_compatible_loss_scale * nll_loss(&right, Reduction::Mean),
            ),
            _ => None,
        };

        Ok(Self {
            label: span_loss / meta.batch_size.max(1) as f64,
            tag,
            pattern,
            compatible,
            sibling,
            sibling_compatible,
        })
    }

    pub fn total(&self) -> f64 {
        self.label
            + [self.tag, self.pattern, self.compatible, self.sibling, self.sibling_compatible]
                .iter()
                .flatten()
                .sum::<f64>()
    }
}

impl Display for LossBreakdown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "label {:.4}", self.label)?;
        let parts = [
            ("tag", self.tag),
            ("pattern", self.pattern),
            ("compatible", self.compatible),
            ("sibling", self.sibling),
            ("sibling_compatible", self.sibling_compatible),
        ];
        for (name, loss) in parts {
            if let Some(loss) = loss {
                write!(f, ", {name} {loss:.4}")?;
            }
        }
        write!(f, " (total {:.4})", self.total())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn labels() -> LabelVocabulary {
        LabelVocabulary::new(["NP", "S", "VP"]).unwrap()
    }

    #[test]
    fn tags_by_id() {
        let vocab = SymbolVocabulary::new(["DT", "NN"]);
        let leaves = vec![("the".to_string(), "DT".to_string()), ("dog".to_string(), "NN".to_string())];
        assert_eq!(tag_targets(&leaves, &vocab).unwrap(), vec![0, 1]);
        let unknown = vec![("ran".to_string(), "VBD".to_string())];
        assert!(matches!(tag_targets(&unknown, &vocab), Err(Error::UnknownLabel(t)) if t == "VBD"));
    }

    #[test]
    fn sparse_patterns_make_every_span_negative() {
        let vocab = SymbolVocabulary::new(["", "A", "B"]);
        let patterns = vec![(Span::new(0, 2), "A".to_string()), (Span::new(1, 3), "C".to_string())];
        let mut rng = StdRng::seed_from_u64(7);
        let chart = pattern_targets(3, &patterns, &vocab, 3, &mut rng).unwrap();
        assert_eq!(chart.get(0, 2), 1);
        assert_eq!(chart.get(1, 3), 0);
        assert_eq!(chart.get(0, 3), 0);
        assert_eq!(chart.to_nested()[2][0], IGNORE_INDEX);
    }

    #[test]
    fn dense_patterns_sample_negatives() {
        let vocab = SymbolVocabulary::new(["", "A"]);
        let patterns: Vec<(Span, String)> = (0..2)
            .flat_map(|s| (s + 1..=2).map(move |e| (Span::new(s, e), "A".to_string())))
            .chain(std::iter::once((Span::new(0, 1), "A".to_string())))
            .collect();
        let mut a = StdRng::seed_from_u64(11);
        let mut b = StdRng::seed_from_u64(11);
        let first = pattern_targets(2, &patterns, &vocab, 1, &mut a).unwrap();
        let second = pattern_targets(2, &patterns, &vocab, 1, &mut b).unwrap();
        assert_eq!(first, second);
        assert!(first.labeled_spans().all(|(_, id)| id == 1));
    }

    #[test]
    fn compatibility_from_children() {
        let patterns = SymbolVocabulary::new(["", "x", "y"]);
        let mut children = BTreeMap::new();
        children.insert("x".to_string(), vec!["NP".to_string(), "VP".to_string()]);
        children.insert("zz".to_string(), vec!["S".to_string()]);
        let m = CompatibilityMatrix::pattern_labels(&patterns, &labels(), &children);
        assert_eq!((m.rows(), m.cols()), (3, 3));
        assert_eq!(m.num_positive(), 2);
        assert_eq!(m.get(1, 0), 1);
        assert_eq!(m.get(1, 2), 1);
        assert_eq!(m.get(1, 1), IGNORE_INDEX);
    }

    #[test]
    fn negatives_are_reproducible() {
        let mut counts = CooccurrenceCounts::new();
        counts.entry("NP".to_string()).or_default().insert("VP".to_string(), 3);
        counts.entry("VP".to_string()).or_default().insert("NP".to_string(), 1);
        let m = CompatibilityMatrix::siblings(&labels(), &counts, 2);
        assert_eq!(m.num_positive(), 1);
        let v = labels();
        assert_eq!(m.get(v.id("NP").unwrap() - 1, v.id("VP").unwrap()), 1);

        let first = m.sample_negatives(2, &mut StdRng::seed_from_u64(3));
        let second = m.sample_negatives(2, &mut StdRng::seed_from_u64(3));
        assert_eq!(first, second);
        assert_eq!(first.as_slice().iter().filter(|&&c| c == 1).count(), 1);
        let negatives = first.as_slice().iter().filter(|&&c| c == 0).count();
        assert!(negatives <= 2);
    }

    #[test]
    fn cross_entropy_ignores_padding() {
        let scores = [0.0, 0.0, 5.0, 1.0];
        let logits = Logits::new(&scores, 2, &[1, IGNORE_INDEX]).unwrap();
        let loss = cross_entropy(&logits, Reduction::Mean);
        assert!((loss - std::f64::consts::LN_2).abs() < 1e-12);
        assert!(Logits::new(&scores, 2, &[2, 0]).is_err());
    }

    #[test]
    fn breakdown_follows_heads() {
        let config = ParserConfig::builder(labels())
            .tagging(SymbolVocabulary::new(["DT", "NN"]))
            .build()
            .unwrap();
        let tag_scores = [0.0, 0.0, 0.0, 0.0];
        let scores = HeadScores {
            tags: Some(Logits::new(&tag_scores, 2, &[0, 1]).unwrap()),
            ..Default::default()
        };
        let loss = LossBreakdown::compute(&config, 4.0, &scores, SubbatchMeta::new(2, 4)).unwrap();
        assert_eq!(loss.label, 2.0);
        let tag = loss.tag.unwrap();
        assert!((tag - 5.0 * 2.0 * std::f64::consts::LN_2 / 4.0).abs() < 1e-12);
        assert!(loss.pattern.is_none() && loss.sibling.is_none());
        assert!((loss.total() - (2.0 + tag)).abs() < 1e-12);

        let missing = LossBreakdown::compute(&config, 4.0, &HeadScores::default(), SubbatchMeta::new(2, 4));
        assert!(matches!(missing, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn sibling_stats_from_treebank() {
        let tree: Tree = "(S (NP (DT a) (NN b)) (VP (VB c)))".parse().unwrap();
        let vocab = LabelVocabulary::new(["NP", "S", "VP"]).unwrap();
        let decoder = ChartDecoder::new(vocab);
        let stats = SiblingStats::from_trees(&[tree], &decoder).unwrap();
        assert_eq!(stats.right["NP"]["VP"], 1);
        assert_eq!(stats.left["VP"]["NP"], 1);
        assert_eq!(stats.left["S"][""], 1);
    }
}

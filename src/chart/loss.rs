use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::context::CkyContext;
use super::{Float, LabelChart, ScoreChart};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reduction {
    #[default]
    Sum,
    Mean,
}

/// Per-sentence outcome of cost-augmented decoding.
#[derive(Debug, Clone, PartialEq)]
pub struct MarginOutcome {
    pub loss: Float,
    /// Score of the best tree under the augmented chart.
    pub augmented_score: Float,
    /// Score of the gold tree under the unaugmented chart.
    pub gold_score: Float,
    /// Spans and labels of the best augmented tree.
    pub predicted: LabelChart,
}

/// Structured hinge loss over span charts with a Hamming margin.
#[derive(Debug, Clone)]
pub struct SpanMarginLoss {
    reduction: Reduction,
    force_root_constituent: bool,
}

impl Default for SpanMarginLoss {
    fn default() -> Self {
        Self::new(Reduction::Sum, true)
    }
}

impl SpanMarginLoss {
    pub fn new(reduction: Reduction, force_root_constituent: bool) -> Self {
        Self {
            reduction,
            force_root_constituent,
        }
    }

    fn check(scores: &ScoreChart, gold: &LabelChart) -> Result<()> {
        if gold.is_empty() {
            return Err(Error::EmptySentence);
        }
        if scores.num_labels() == 0 {
            return Err(Error::InvalidChart("missing label-0 column".to_string()));
        }
        if gold.len() > scores.len() {
            return Err(Error::InvalidChart(format!(
                "gold chart of length {} for a score chart of length {}",
                gold.len(),
                scores.len()
            )));
        }
        let num_labels = scores.num_labels();
        if let Some((span, id)) = gold.labeled_spans().find(|&(_, id)| id >= num_labels) {
            return Err(Error::InvalidChart(format!(
                "gold label {id} at {span} out of range for {num_labels} labels"
            )));
        }
        Ok(())
    }

    /// Normalized scores plus one for every label that differs from gold.
    ///
    /// Always returns a fresh chart sized to the gold sentence.
    pub fn augment(&self, scores: &ScoreChart, gold: &LabelChart) -> Result<ScoreChart> {
        Self::check(scores, gold)?;
        let n = gold.len();
        let mut augmented = ScoreChart::new(n, scores.num_labels());
        for start in 0..n {
            for end in start + 1..=n {
                let g = gold.get(start, end) as usize;
                let src = scores.cell(start, end);
                let base = src[0];
                for (l, (dst, &s)) in augmented.cell_mut(start, end).iter_mut().zip(src).enumerate() {
                    *dst = s - base + if l == g { 0.0 } else { 1.0 };
                }
            }
        }
        Ok(augmented)
    }

    /// Sum of the normalized gold-label scores over gold constituents.
    pub fn gold_score(scores: &ScoreChart, gold: &LabelChart) -> Float {
        gold.labeled_spans()
            .map(|(span, id)| {
                let cell = scores.cell(span.start, span.end);
                cell[id] - cell[0]
            })
            .sum()
    }

    fn sentence_loss_with(&self, ctx: &mut CkyContext, scores: &ScoreChart, gold: &LabelChart) -> Result<MarginOutcome> {
        let augmented = self.augment(scores, gold)?;
        let augmented_score = ctx.cky(&augmented, gold.len(), self.force_root_constituent);
        let gold_score = Self::gold_score(scores, gold);
        Ok(MarginOutcome {
            loss: (augmented_score - gold_score).max(0.0),
            augmented_score,
            gold_score,
            predicted: ctx.backtrace(),
        })
    }

    pub fn sentence_loss(&self, scores: &ScoreChart, gold: &LabelChart) -> Result<MarginOutcome> {
        let mut ctx = CkyContext::default();
        self.sentence_loss_with(&mut ctx, scores, gold)
    }

    /// Batch loss, reduced by sum or by mean over sentences.
    pub fn forward(&self, scores: &[ScoreChart], gold: &[LabelChart]) -> Result<Float> {
        if scores.len() != gold.len() {
            return Err(Error::InvalidChart(format!(
                "{} score charts for {} gold charts",
                scores.len(),
                gold.len()
            )));
        }
        if scores.is_empty() {
            return Ok(0.0);
        }
        let losses: Vec<Float> = scores
            .par_iter()
            .zip(gold)
            .map_init(CkyContext::default, |ctx, (s, g)| {
                self.sentence_loss_with(ctx, s, g).map(|o| o.loss)
            })
            .collect::<Result<_>>()?;
        let total: Float = losses.iter().sum();
        Ok(match self.reduction {
            Reduction::Sum => total,
            Reduction::Mean => total / losses.len() as Float,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::Span;

    #[test]
    fn augment_leaves_input_untouched() {
        let mut scores = ScoreChart::new(2, 3);
        scores.set(0, 2, 0, 1.0);
        scores.set(0, 2, 2, 3.0);
        let before = scores.clone();
        let mut gold = LabelChart::new(2);
        gold.assign(Span::new(0, 2), 2).unwrap();

        let loss = SpanMarginLoss::default();
        let augmented = loss.augment(&scores, &gold).unwrap();
        assert_eq!(scores, before);
        assert_eq!(augmented.cell(0, 2), &[1.0, 0.0, 2.0]);
        assert_eq!(augmented.cell(0, 1), &[0.0, 1.0, 1.0]);
        assert_eq!(SpanMarginLoss::gold_score(&scores, &gold), 2.0);
    }

    #[test]
    fn out_of_range_gold_label() {
        let scores = ScoreChart::new(2, 2);
        let mut gold = LabelChart::new(2);
        gold.set(0, 2, 5);
        let loss = SpanMarginLoss::default();
        assert!(matches!(loss.sentence_loss(&scores, &gold), Err(Error::InvalidChart(_))));
    }

    #[test]
    fn mean_reduction() {
        let charts = vec![ScoreChart::new(2, 2), ScoreChart::new(3, 2)];
        let mut g1 = LabelChart::new(2);
        g1.set(0, 2, 1);
        let mut g2 = LabelChart::new(3);
        g2.set(0, 3, 1);
        let sum = SpanMarginLoss::new(Reduction::Sum, true).forward(&charts, &[g1.clone(), g2.clone()]).unwrap();
        let mean = SpanMarginLoss::new(Reduction::Mean, true).forward(&charts, &[g1, g2]).unwrap();
        // Every non-root span can take label 1 for a margin of one each.
        assert_eq!(sum, 2.0 + 4.0);
        assert_eq!(mean, 3.0);
    }
}

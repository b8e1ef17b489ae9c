use rayon::prelude::*;

use super::context::CkyContext;
use super::{CompressedOutput, Float, LabelChart, ScoreChart, ScoreTensor};
use crate::tree::{Span, Tree};
use crate::vocab::{LabelVocabulary, CHAIN_SEPARATOR, EMPTY_LABEL};
use crate::{Error, Result};

/// Gold targets derived from a tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoldCharts {
    pub labels: LabelChart,
    /// Label of the sibling immediately to the left of each constituent.
    pub left_siblings: LabelChart,
    /// Label of the sibling immediately to the right of each constituent.
    pub right_siblings: LabelChart,
}

/// Result of decoding one sentence.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    /// Label ids of the spans of the best binary tree, empty elsewhere.
    pub chart: LabelChart,
    pub score: Float,
}

/// Converts between trees and charts and finds the best tree of a chart.
#[derive(Debug, Clone)]
pub struct ChartDecoder {
    label_vocab: LabelVocabulary,
    force_root_constituent: bool,
    max_len: Option<usize>,
}

impl ChartDecoder {
    pub fn new(label_vocab: LabelVocabulary) -> Self {
        Self {
            label_vocab,
            force_root_constituent: true,
            max_len: None,
        }
    }

    pub fn with_force_root(mut self, force_root_constituent: bool) -> Self {
        self.force_root_constituent = force_root_constituent;
        self
    }

    /// Rejects sentences longer than `max_len` tokens.
    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = Some(max_len);
        self
    }

    pub fn label_vocab(&self) -> &LabelVocabulary {
        &self.label_vocab
    }

    pub fn force_root_constituent(&self) -> bool {
        self.force_root_constituent
    }

    pub fn check_length(&self, length: usize) -> Result<()> {
        match self.max_len {
            Some(max) if length > max => Err(Error::LengthExceeded { length, max }),
            _ => Ok(()),
        }
    }

    /// Builds the gold label chart and the sibling charts of `tree`.
    pub fn chart_from_tree(&self, tree: &Tree) -> Result<GoldCharts> {
        tree.validate()?;
        let n = tree.len();
        self.check_length(n)?;
        let tree = tree.clone().collapse_unary();
        let mut charts = GoldCharts {
            labels: LabelChart::new(n),
            left_siblings: LabelChart::new(n),
            right_siblings: LabelChart::new(n),
        };
        self.fill(&tree, 0, true, &mut charts)?;
        Ok(charts)
    }

    fn fill(&self, node: &Tree, start: usize, is_root: bool, charts: &mut GoldCharts) -> Result<usize> {
        let (labels, children) = match node {
            Tree::Leaf { .. } => return Ok(start + 1),
            Tree::Internal { labels, children } => (labels, children),
        };

        let mut effective = Vec::with_capacity(children.len());
        let mut end = start;
        for child in children {
            end = self.flatten(child, end, &mut effective)?;
        }

        if !labels.is_empty() {
            let id = self.label_vocab.id(&labels.join(CHAIN_SEPARATOR))?;
            charts.labels.assign(Span { start, end }, id)?;
        }

        if !labels.is_empty() || is_root {
            for (k, &(span, id)) in effective.iter().enumerate() {
                if id == EMPTY_LABEL {
                    continue;
                }
                let left = if k > 0 { effective[k - 1].1 } else { EMPTY_LABEL };
                let right = effective.get(k + 1).map_or(EMPTY_LABEL, |c| c.1);
                charts.left_siblings.set(span.start, span.end, left as i32);
                charts.right_siblings.set(span.start, span.end, right as i32);
            }
        }

        let mut pos = start;
        for child in children {
            pos = self.fill(child, pos, false, charts)?;
        }
        Ok(end)
    }

    /// Lists the children a constituent sees once transparent nodes are
    /// dissolved: `(span, label id)` with id 0 for bare tokens.
    fn flatten(&self, node: &Tree, start: usize, out: &mut Vec<(Span, usize)>) -> Result<usize> {
        match node {
            Tree::Leaf { .. } => {
                out.push((Span { start, end: start + 1 }, EMPTY_LABEL));
                Ok(start + 1)
            }
            Tree::Internal { labels, children } if labels.is_empty() => {
                let mut end = start;
                for child in children {
                    end = self.flatten(child, end, out)?;
                }
                Ok(end)
            }
            Tree::Internal { labels, .. } => {
                let end = start + node.len();
                let id = self.label_vocab.id(&labels.join(CHAIN_SEPARATOR))?;
                out.push((Span { start, end }, id));
                Ok(end)
            }
        }
    }

    fn validate(&self, chart: &ScoreChart, length: usize) -> Result<()> {
        if length == 0 {
            return Err(Error::EmptySentence);
        }
        self.check_length(length)?;
        if chart.num_labels() == 0 {
            return Err(Error::InvalidChart("missing label-0 column".to_string()));
        }
        if chart.num_labels() > self.label_vocab.len() {
            return Err(Error::InvalidChart(format!(
                "{} label columns for a vocabulary of {}",
                chart.num_labels(),
                self.label_vocab.len()
            )));
        }
        if length > chart.len() {
            return Err(Error::InvalidChart(format!(
                "length {length} exceeds chart length {}",
                chart.len()
            )));
        }
        Ok(())
    }

    fn decode_with(&self, ctx: &mut CkyContext, chart: &ScoreChart, length: usize) -> Result<Decoded> {
        self.validate(chart, length)?;
        let score = ctx.cky(chart, length, self.force_root_constituent);
        Ok(Decoded {
            chart: ctx.backtrace(),
            score,
        })
    }

    /// Finds the best labeled binary bracketing of the first `length` tokens.
    pub fn decode(&self, chart: &ScoreChart, length: usize) -> Result<Decoded> {
        let mut ctx = CkyContext::default();
        self.decode_with(&mut ctx, chart, length)
    }

    /// Decodes straight to a tree over `leaves`.
    pub fn decode_tree(&self, chart: &ScoreChart, leaves: &[(String, String)]) -> Result<(Tree, Float)> {
        let decoded = self.decode(chart, leaves.len())?;
        let tree = self.tree_from_chart(&decoded.chart, leaves)?;
        Ok((tree, decoded.score))
    }

    /// Decodes every example of a padded batch, in parallel.
    ///
    /// Scores are shifted so the empty label scores 0 before decoding; cells
    /// past an example's length are never read.
    pub fn charts_from_scores_batched(&self, scores: &ScoreTensor, lengths: &[usize]) -> Result<Vec<Decoded>> {
        if lengths.len() != scores.batch_size() {
            return Err(Error::InvalidChart(format!(
                "{} lengths for a batch of {}",
                lengths.len(),
                scores.batch_size()
            )));
        }
        if let Some(&length) = lengths.iter().max() {
            self.check_length(length)?;
        }
        log::debug!(
            "decoding batch (B: {}, T: {}, L: {})",
            scores.batch_size(),
            scores.max_len(),
            scores.num_labels()
        );
        lengths
            .par_iter()
            .enumerate()
            .map_init(CkyContext::default, |ctx, (b, &length)| {
                let mut chart = scores.example(b, length)?;
                chart.normalize();
                self.decode_with(ctx, &chart, length)
            })
            .collect()
    }

    pub fn compressed_output_from_chart(&self, chart: &LabelChart) -> CompressedOutput {
        CompressedOutput::from_chart(chart)
    }

    pub fn tree_from_chart(&self, chart: &LabelChart, leaves: &[(String, String)]) -> Result<Tree> {
        self.compressed_output_from_chart(chart)
            .to_tree(leaves, &self.label_vocab)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vocab() -> LabelVocabulary {
        LabelVocabulary::new(["S", "NP", "VP", "S::VP"]).unwrap()
    }

    fn leaves(words: &[&str]) -> Vec<(String, String)> {
        words.iter().map(|w| (w.to_string(), "X".to_string())).collect()
    }

    #[test]
    fn gold_chart_spans() {
        let decoder = ChartDecoder::new(vocab());
        let tree: Tree = "(S (NP (DT the) (NN dog)) (VP (VBZ barks)))".parse().unwrap();
        let gold = decoder.chart_from_tree(&tree).unwrap();
        let np = vocab().id("NP").unwrap() as i32;
        let s = vocab().id("S").unwrap() as i32;
        let vp = vocab().id("VP").unwrap() as i32;
        assert_eq!(
            gold.labels.to_nested(),
            vec![vec![0, np, s], vec![-100, 0, 0], vec![-100, -100, vp]]
        );
        // NP's right sibling is VP and vice versa; the root has none.
        assert_eq!(gold.right_siblings.get(0, 2), vp);
        assert_eq!(gold.left_siblings.get(0, 2), 0);
        assert_eq!(gold.left_siblings.get(2, 3), np);
        assert_eq!(gold.right_siblings.get(2, 3), 0);
        assert_eq!(gold.left_siblings.get(0, 3), 0);
    }

    #[test]
    fn gold_chart_unknown_label() {
        let decoder = ChartDecoder::new(vocab());
        let tree: Tree = "(S (PP (IN in) (NN it)))".parse().unwrap();
        assert!(matches!(decoder.chart_from_tree(&tree), Err(Error::UnknownLabel(l)) if l == "S::PP"));
    }

    #[test]
    fn unary_chain_round_trip() {
        let decoder = ChartDecoder::new(vocab());
        let tree: Tree = "(S (VP (VB go)))".parse().unwrap();
        let gold = decoder.chart_from_tree(&tree).unwrap();
        assert_eq!(gold.labels.get(0, 1), vocab().id("S::VP").unwrap() as i32);
        let rebuilt = decoder.tree_from_chart(&gold.labels, &tree.pos()).unwrap();
        assert_eq!(rebuilt, tree);
    }

    #[test]
    fn single_token_without_root_label() {
        let decoder = ChartDecoder::new(vocab()).with_force_root(false);
        let chart = ScoreChart::new(1, vocab().len());
        let (tree, score) = decoder.decode_tree(&chart, &leaves(&["hi"])).unwrap();
        assert_eq!(tree, Tree::leaf("hi", "X"));
        assert_eq!(score, 0.0);
    }

    #[test]
    fn single_token_forced_root() {
        let v = vocab();
        let decoder = ChartDecoder::new(v.clone());
        let mut chart = ScoreChart::new(1, v.len());
        // The empty label wins unless the root is forced.
        for (label, score) in [("NP", -3.0), ("S", -1.0), ("VP", -4.0), ("S::VP", -2.0)] {
            chart.set(0, 1, v.id(label).unwrap(), score);
        }
        let (tree, score) = decoder.decode_tree(&chart, &leaves(&["hi"])).unwrap();
        assert_eq!(
            tree,
            Tree::Internal {
                labels: vec!["S".to_string()],
                children: vec![Tree::leaf("hi", "X")],
            }
        );
        assert_eq!(score, -1.0);

        let (tree, score) = decoder.with_force_root(false).decode_tree(&chart, &leaves(&["hi"])).unwrap();
        assert_eq!(tree, Tree::leaf("hi", "X"));
        assert_eq!(score, 0.0);
    }

    #[test]
    fn forced_root_with_only_the_empty_label() {
        let v = LabelVocabulary::new([]).unwrap();
        assert_eq!(v.len(), 1);
        let decoder = ChartDecoder::new(v.clone());
        let mut chart = ScoreChart::new(2, v.len());
        chart.set(0, 2, 0, 1.5);
        let decoded = decoder.decode(&chart, 2).unwrap();
        assert_eq!(decoded.score, 1.5);
        assert_eq!(decoded.chart.get(0, 2), 0);
        let tree = decoder.tree_from_chart(&decoded.chart, &leaves(&["a", "b"])).unwrap();
        assert_eq!(
            tree,
            Tree::Internal {
                labels: Vec::new(),
                children: vec![Tree::leaf("a", "X"), Tree::leaf("b", "X")],
            }
        );
    }

    #[test]
    fn rejects_bad_input() {
        let decoder = ChartDecoder::new(vocab()).with_max_len(2);
        let chart = ScoreChart::new(3, vocab().len());
        assert!(matches!(decoder.decode(&chart, 0), Err(Error::EmptySentence)));
        assert!(matches!(
            decoder.decode(&chart, 3),
            Err(Error::LengthExceeded { length: 3, max: 2 })
        ));
        let wide = ScoreChart::new(2, vocab().len() + 1);
        assert!(matches!(decoder.decode(&wide, 2), Err(Error::InvalidChart(_))));
        let short = ScoreChart::new(1, vocab().len());
        assert!(matches!(decoder.decode(&short, 2), Err(Error::InvalidChart(_))));
    }
}

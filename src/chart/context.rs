use super::{Float, LabelChart, ScoreChart};
use crate::vocab::EMPTY_LABEL;

/// Workspace of the CKY recurrence, reusable across sentences.
#[derive(Debug, Default)]
pub(crate) struct CkyContext {
    /// Number of tokens (n) of the current sentence.
    num_items: usize,

    /// Number of tokens the buffers are sized for.
    cap_items: usize,

    /**
     * Best scores.
     *  This is a [n+1][n+1] matrix whose element [i][j] holds the best
     *  score of span [i, j) optimally labeled and optimally split.
     */
    best: Vec<Float>,

    /**
     * Best split points.
     *  This is a [n+1][n+1] matrix whose element [i][j] is the k that
     *  yields the maximum of best[i][k] + best[k][j].
     */
    split: Vec<usize>,

    /**
     * Best labels.
     *  This is a [n+1][n+1] matrix whose element [i][j] is the label id
     *  chosen for span [i, j).
     */
    label: Vec<usize>,
}

impl CkyContext {
    pub fn set_num_items(&mut self, n: usize) {
        self.num_items = n;
        if self.cap_items < n {
            let size = (n + 1) * (n + 1);
            self.best.resize(size, 0.0);
            self.split.resize(size, 0);
            self.label.resize(size, EMPTY_LABEL);
            self.cap_items = n;
        }
    }

    #[inline]
    fn at(&self, i: usize, j: usize) -> usize {
        i * (self.cap_items + 1) + j
    }

    /// Runs the recurrence over the first `n` tokens of `chart` and returns
    /// the score of the best tree. With `force_root`, the root span is
    /// labeled with a non-empty label whenever the chart has one.
    pub fn cky(&mut self, chart: &ScoreChart, n: usize, force_root: bool) -> Float {
        self.set_num_items(n);
        let num_labels = chart.num_labels();

        for width in 1..=n {
            for i in 0..=n - width {
                let j = i + width;
                let restrict = force_root && width == n && num_labels > 1;
                let (label, label_score) = best_label(chart.cell(i, j), restrict);

                let mut score = label_score;
                let mut argmax = i;
                if width > 1 {
                    /* Ties go to the smallest split point. */
                    let mut max_score = Float::NEG_INFINITY;
                    argmax = i + 1;
                    for k in i + 1..j {
                        let s = self.best[self.at(i, k)] + self.best[self.at(k, j)];
                        if s > max_score {
                            max_score = s;
                            argmax = k;
                        }
                    }
                    score += max_score;
                }
                let at = self.at(i, j);
                self.best[at] = score;
                self.split[at] = argmax;
                self.label[at] = label;
            }
        }
        self.best[self.at(0, n)]
    }

    /// Replays the stored choices from the root into a label chart.
    pub fn backtrace(&self) -> LabelChart {
        let n = self.num_items;
        let mut chart = LabelChart::new(n);
        if n == 0 {
            return chart;
        }
        let mut stack = vec![(0, n)];
        while let Some((i, j)) = stack.pop() {
            let at = self.at(i, j);
            chart.set(i, j, self.label[at] as i32);
            if j - i > 1 {
                let k = self.split[at];
                stack.push((k, j));
                stack.push((i, k));
            }
        }
        chart
    }
}

/// Highest-scoring label of one cell; ties go to the smallest id.
#[inline]
fn best_label(cell: &[Float], non_empty: bool) -> (usize, Float) {
    let first = if non_empty { EMPTY_LABEL + 1 } else { EMPTY_LABEL };
    let mut argmax = first;
    let mut max_score = cell[first];
    for (l, &s) in cell.iter().enumerate().skip(first + 1) {
        if s > max_score {
            max_score = s;
            argmax = l;
        }
    }
    (argmax, max_score)
}

use std::{collections::BTreeMap, fmt::Display};

use crate::tree::Tree;
use crate::vocab::CHAIN_SEPARATOR;
use crate::{Error, Result};

/// Label-wise bracket counts.
#[derive(Debug, Default)]
struct LabelMeasure {
    /** Number of predicted brackets that match a gold bracket. */
    num_correct: usize,
    /** Number of brackets with the label in the gold trees. */
    num_observation: usize,
    /** Number of predicted brackets with the label. */
    num_prediction: usize,
}

impl LabelMeasure {
    fn estimation(&self) -> Estimation {
        Estimation::new(self.num_correct, self.num_prediction, self.num_observation)
    }
}

/// Precision, recall and F1 of a set of brackets.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Estimation {
    pub precision: f64,
    pub recall: f64,
    pub fmeasure: f64,
}

impl Estimation {
    fn new(num_correct: usize, num_prediction: usize, num_observation: usize) -> Self {
        let mut precision = 0.0;
        let mut recall = 0.0;
        let mut fmeasure = 0.0;
        if num_prediction > 0 {
            precision = num_correct as f64 / num_prediction as f64;
        }
        if num_observation > 0 {
            recall = num_correct as f64 / num_observation as f64;
        }
        if precision + recall > 0.0 {
            fmeasure = precision * recall * 2.0 / (precision + recall);
        }
        Self {
            precision,
            recall,
            fmeasure,
        }
    }
}

/// Labeled bracket scores accumulated over a test set.
///
/// Every constituent is a bracket; a collapsed chain such as `S::VP` counts
/// as one bracket per sub-label. Leaves are not brackets.
#[derive(Debug, Default)]
pub struct Evaluation {
    tbl: BTreeMap<String, LabelMeasure>,

    /** Number of matching brackets. */
    total_correct: usize,
    /** Number of gold brackets. */
    total_observation: usize,
    /** Number of predicted brackets. */
    total_prediction: usize,

    /** Number of sentences whose brackets all match. */
    inst_total_correct: usize,
    /** Number of sentences. */
    inst_total_num: usize,
}

type Brackets = BTreeMap<(usize, usize, String), usize>;

fn brackets(tree: &Tree) -> Brackets {
    let mut out = Brackets::new();
    for s in tree.labeled_spans() {
        for label in s.label.split(CHAIN_SEPARATOR) {
            *out.entry((s.span.start, s.span.end, label.to_string())).or_default() += 1;
        }
    }
    out
}

impl Evaluation {
    /// Scores `prediction` against `reference`; both must cover the same words.
    pub fn accumulate(&mut self, reference: &Tree, prediction: &Tree) -> Result<()> {
        if reference.words() != prediction.words() {
            return Err(Error::InvalidTree(format!(
                "prediction does not cover the reference sentence ({} vs {} tokens)",
                prediction.len(),
                reference.len()
            )));
        }
        let gold = brackets(reference);
        let pred = brackets(prediction);

        let mut matched = 0;
        for ((_, _, label), &n) in &gold {
            let lev = self.tbl.entry(label.clone()).or_default();
            lev.num_observation += n;
            self.total_observation += n;
        }
        for (key, &n) in &pred {
            let lev = self.tbl.entry(key.2.clone()).or_default();
            lev.num_prediction += n;
            self.total_prediction += n;
            let m = n.min(gold.get(key).copied().unwrap_or(0));
            lev.num_correct += m;
            matched += m;
        }
        self.total_correct += matched;

        if gold == pred {
            self.inst_total_correct += 1;
        }
        self.inst_total_num += 1;
        Ok(())
    }

    /// Micro-averaged scores over all brackets seen so far.
    pub fn evaluate(&self) -> Estimation {
        Estimation::new(self.total_correct, self.total_prediction, self.total_observation)
    }

    /// Share of sentences predicted exactly.
    pub fn complete_match(&self) -> f64 {
        if self.inst_total_num == 0 {
            return 0.0;
        }
        self.inst_total_correct as f64 / self.inst_total_num as f64
    }
}

impl Display for Evaluation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Performance by label (#match, #model, #ref) (precision, recall, F1):")?;
        for (label, lev) in &self.tbl {
            if lev.num_observation == 0 {
                writeln!(
                    f,
                    "\t{}: ({}, {}, {}) (******, ******, ******)",
                    label, lev.num_correct, lev.num_prediction, lev.num_observation
                )?;
            } else {
                let e = lev.estimation();
                writeln!(
                    f,
                    "\t{}: ({}, {}, {}) ({:.4}, {:.4}, {:.4})",
                    label, lev.num_correct, lev.num_prediction, lev.num_observation, e.precision, e.recall, e.fmeasure
                )?;
            }
        }
        let e = self.evaluate();
        writeln!(
            f,
            "Bracketing precision, recall, F1: ({:.4}, {:.4}, {:.4})",
            e.precision, e.recall, e.fmeasure
        )?;
        write!(
            f,
            "Complete match: {}/{} => {:.4}",
            self.inst_total_correct,
            self.inst_total_num,
            self.complete_match()
        )
    }
}

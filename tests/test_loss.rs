extern crate chartparse;

use chartparse::{ChartDecoder, LabelChart, LabelVocabulary, Reduction, ScoreChart, SpanMarginLoss, Tree};
use rand::{rngs::StdRng, Rng, SeedableRng};

const TREES: [&str; 3] = [
    "(S (NP (DT the) (NN dog)) (VP (VBZ barks)))",
    "(S (NP (PRP it)) (VP (VBD rained) (ADVP (RB hard))))",
    "(S (NP (NNP Ann)) (VP (VBD saw) (NP (DT a) (JJ red) (NN fox))))",
];

fn gold_charts() -> (LabelVocabulary, Vec<LabelChart>) {
    let trees: Vec<Tree> = TREES.iter().map(|t| t.parse().unwrap()).collect();
    let vocab = LabelVocabulary::from_trees(&trees).unwrap();
    let decoder = ChartDecoder::new(vocab.clone());
    let charts = trees.iter().map(|t| decoder.chart_from_tree(t).unwrap().labels).collect();
    (vocab, charts)
}

fn random_chart(len: usize, num_labels: usize, rng: &mut StdRng) -> ScoreChart {
    let mut chart = ScoreChart::new(len, num_labels);
    for start in 0..len {
        for end in start + 1..=len {
            for l in 0..num_labels {
                chart.set(start, end, l, rng.random_range(-3.0..3.0));
            }
        }
    }
    chart
}

#[test]
fn test_margin_is_non_negative() {
    let (vocab, gold) = gold_charts();
    let loss = SpanMarginLoss::default();
    let mut rng = StdRng::seed_from_u64(42);
    for _ in 0..20 {
        for g in &gold {
            let scores = random_chart(g.len(), vocab.len(), &mut rng);
            let outcome = loss.sentence_loss(&scores, g).unwrap();
            assert!(outcome.loss >= 0.0);
            // The gold tree itself is a candidate of the augmented search.
            assert!(outcome.augmented_score >= outcome.gold_score - 1e-9);
            assert_eq!(outcome.predicted.len(), g.len());
        }
    }
}

#[test]
fn test_zero_loss_when_gold_wins_by_margin() {
    let (vocab, gold) = gold_charts();
    let loss = SpanMarginLoss::default();
    for g in &gold {
        let mut scores = ScoreChart::new(g.len(), vocab.len());
        for start in 0..g.len() {
            for end in start + 1..=g.len() {
                let gold_id = g.get(start, end) as usize;
                for l in 1..vocab.len() {
                    let s = if l == gold_id { 2.0 } else { -2.0 };
                    scores.set(start, end, l, s);
                }
            }
        }
        let outcome = loss.sentence_loss(&scores, g).unwrap();
        assert_eq!(outcome.loss, 0.0);
        assert_eq!(outcome.predicted, *g);
    }
}

#[test]
fn test_forward_reductions() {
    let (vocab, gold) = gold_charts();
    let mut rng = StdRng::seed_from_u64(5);
    let scores: Vec<ScoreChart> = gold.iter().map(|g| random_chart(g.len(), vocab.len(), &mut rng)).collect();

    let per_sentence: Vec<f64> = scores
        .iter()
        .zip(&gold)
        .map(|(s, g)| SpanMarginLoss::default().sentence_loss(s, g).unwrap().loss)
        .collect();
    let sum = SpanMarginLoss::new(Reduction::Sum, true).forward(&scores, &gold).unwrap();
    let mean = SpanMarginLoss::new(Reduction::Mean, true).forward(&scores, &gold).unwrap();
    let expected: f64 = per_sentence.iter().sum();
    assert!((sum - expected).abs() < 1e-9);
    assert!((mean - expected / 3.0).abs() < 1e-9);

    assert!(SpanMarginLoss::default().forward(&scores[..2], &gold).is_err());
}

#[test]
fn test_loss_reads_a_padded_chart() {
    let (vocab, gold) = gold_charts();
    let mut rng = StdRng::seed_from_u64(9);
    let g = &gold[0];
    let exact = random_chart(g.len(), vocab.len(), &mut rng);
    let mut padded = ScoreChart::new(g.len() + 2, vocab.len());
    for start in 0..g.len() {
        for end in start + 1..=g.len() {
            padded.cell_mut(start, end).copy_from_slice(exact.cell(start, end));
        }
    }
    let loss = SpanMarginLoss::default();
    let a = loss.sentence_loss(&exact, g).unwrap();
    let b = loss.sentence_loss(&padded, g).unwrap();
    assert_eq!(a, b);
}

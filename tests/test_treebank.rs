extern crate chartparse;

use chartparse::{
    heads::{SiblingStats, TargetEncoder},
    subbatch, ChartDecoder, Evaluation, Heads, ParserConfig, ScoreChart, Treebank, Tree,
};
use rand::{rngs::StdRng, SeedableRng};

fn init() {
    let _ = env_logger::builder().is_test(true).filter_level(log::LevelFilter::Debug).try_init();
}

fn sample() -> Treebank {
    Treebank::open("tests/data/sample.trees", true).unwrap()
}

fn config(treebank: &Treebank) -> ParserConfig {
    let labels = treebank.label_vocab().unwrap();
    let stats = SiblingStats::from_trees(&treebank.v, &ChartDecoder::new(labels.clone())).unwrap();
    ParserConfig::builder(labels)
        .tagging(treebank.tag_vocab())
        .sibling()
        .sibling_compatibility(stats)
        .build()
        .unwrap()
}

/// Puts a score of 10 on every gold label.
fn oracle_scores(decoder: &ChartDecoder, tree: &Tree) -> ScoreChart {
    let gold = decoder.chart_from_tree(tree).unwrap();
    let mut chart = ScoreChart::new(tree.len(), decoder.label_vocab().len());
    for (span, id) in gold.labels.labeled_spans() {
        chart.set(span.start, span.end, id, 10.0);
    }
    chart
}

#[test]
fn test_read_sample() {
    init();
    let treebank = sample();
    assert_eq!(treebank.len(), 5);
    assert_eq!(treebank.lengths(), vec![4, 4, 6, 1, 6]);
    let labels = treebank.label_vocab().unwrap();
    assert!(labels.id("FRAG::INTJ").is_ok());
    assert!(labels.id("TOP").is_err());
}

#[test]
fn test_config_save_and_load() {
    init();
    let treebank = sample();
    let config = config(&treebank);
    assert_eq!(
        config.heads(),
        Heads::TAGGING | Heads::SIBLING | Heads::SIBLING_COMPATIBILITY
    );
    let path = std::env::temp_dir().join("chartparse-test-config.json");
    config.save(&path).unwrap();
    let loaded = ParserConfig::load(&path).unwrap();
    assert_eq!(loaded, config);
    let _ = std::fs::remove_file(&path);
}

#[test]
fn test_oracle_decoding_scores_perfectly() {
    init();
    let treebank = sample();
    let config = config(&treebank);
    let decoder = config.decoder();

    let predicted = subbatch::par_map(
        |group: &[&Tree]| -> chartparse::Result<Vec<Tree>> {
            group
                .iter()
                .map(|t| decoder.decode_tree(&oracle_scores(&decoder, t), &t.pos()).map(|(tree, _)| tree))
                .collect()
        },
        &treebank.v,
        &treebank.lengths(),
        8,
    )
    .unwrap();

    let mut evaluation = Evaluation::default();
    for (gold, pred) in treebank.v.iter().zip(&predicted) {
        assert_eq!(gold, pred);
        evaluation.accumulate(gold, pred).unwrap();
    }
    assert_eq!(evaluation.evaluate().fmeasure, 1.0);
    assert_eq!(evaluation.complete_match(), 1.0);
}

#[test]
fn test_targets_follow_heads() {
    init();
    let treebank = sample();
    let config = config(&treebank);
    let encoder = TargetEncoder::new(&config);
    let mut rng = StdRng::seed_from_u64(0);

    let targets = encoder.encode(&treebank.v[0], &[], &mut rng).unwrap();
    let tags = config.tag_vocab().unwrap();
    assert_eq!(
        targets.tags.unwrap(),
        vec![
            tags.id("DT").unwrap() as i32,
            tags.id("NN").unwrap() as i32,
            tags.id("VBZ").unwrap() as i32,
            tags.id(".").unwrap() as i32
        ]
    );
    assert!(targets.patterns.is_none());

    let batch = encoder.batch_targets(&mut rng);
    assert!(batch.compatibility.is_none());
    let left = batch.left_sibling_compatibility.unwrap();
    assert_eq!(left.rows() + 1, config.label_vocab().len());
    assert!(left.as_slice().iter().all(|&c| c == 1 || c == 0 || c == -100));
}

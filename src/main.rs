use std::{
    fs::File,
    io::{self, BufRead, BufReader, BufWriter, Write},
    path::PathBuf,
    time::Instant,
};

use chartparse::{
    heads::SiblingStats, subbatch, ChartDecoder, CompressedOutput, Evaluation, ParserConfig, ScoreChart, ScoreTensor, Treebank,
};
use clap::{Parser, Subcommand};
use serde::Deserialize;

/// Chart decoding tools for span-based constituency parsing
#[derive(Debug, Parser)]
struct Argv {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Build a parser config from the labels of a treebank (TREEBANK)
    Vocab {
        /// treebank in bracketed format
        #[arg(value_name = "TREEBANK")]
        treebank: PathBuf,
        /// store the config into a file (CONFIG)
        #[arg(short, long, value_name = "CONFIG")]
        output: PathBuf,
        /// also train a part-of-speech tagging head
        #[arg(short, long)]
        tags: bool,
        /// also train the sibling and sibling-compatibility heads
        #[arg(short, long)]
        siblings: bool,
        /// keep TOP/ROOT wrappers around trees
        #[arg(long)]
        keep_top: bool,
    },
    /// Print the gold chart of every tree as compressed spans
    Chart {
        /// read a parser config from a file (CONFIG)
        #[arg(short, long, required = true, value_name = "CONFIG")]
        config: PathBuf,
        #[arg(value_name = "TREEBANK")]
        treebank: PathBuf,
    },
    /// Decode scored sentences (one JSON object per line) into trees
    Decode {
        /// read a parser config from a file (CONFIG)
        #[arg(short, long, required = true, value_name = "CONFIG")]
        config: PathBuf,
        /// read scored sentences from a file instead of STDIN
        #[arg(value_name = "SCORES")]
        scores: Option<PathBuf>,
    },
    /// Report labeled bracket scores of predicted trees against gold trees
    Eval {
        #[arg(value_name = "GOLD")]
        gold: PathBuf,
        #[arg(value_name = "PREDICTED")]
        predicted: PathBuf,
        /// suppress the per-label table
        #[arg(short, long)]
        quiet: bool,
    },
}

/// One line of `decode` input.
#[derive(Debug, Deserialize)]
struct ScoredSentence {
    words: Vec<String>,
    #[serde(default)]
    tags: Option<Vec<String>>,
    /// `[n][n][L]` span scores.
    scores: Vec<Vec<Vec<f64>>>,
}

impl ScoredSentence {
    fn leaves(&self) -> Vec<(String, String)> {
        let tags = self.tags.clone().unwrap_or_else(|| vec!["X".to_string(); self.words.len()]);
        self.words.iter().cloned().zip(tags).collect()
    }
}

fn vocab(treebank: PathBuf, output: PathBuf, tags: bool, siblings: bool, keep_top: bool) -> chartparse::Result<()> {
    let treebank = Treebank::open(treebank, !keep_top)?;
    let labels = treebank.label_vocab()?;
    let mut builder = ParserConfig::builder(labels.clone());
    if tags {
        builder = builder.tagging(treebank.tag_vocab());
    }
    if siblings {
        let decoder = ChartDecoder::new(labels);
        builder = builder
            .sibling()
            .sibling_compatibility(SiblingStats::from_trees(&treebank.v, &decoder)?);
    }
    let config = builder.build()?;
    config.save(&output)?;
    log::info!("wrote {} labels to {}", config.label_vocab().len(), output.display());
    Ok(())
}

fn chart(config: PathBuf, treebank: PathBuf) -> chartparse::Result<()> {
    let config = ParserConfig::load(config)?;
    let decoder = config.decoder();
    let treebank = Treebank::open(treebank, true)?;
    let mut out = BufWriter::new(io::stdout().lock());
    for tree in &treebank.v {
        let gold = decoder.chart_from_tree(tree)?;
        let compressed = CompressedOutput::from_chart(&gold.labels);
        serde_json::to_writer(&mut out, &compressed)?;
        writeln!(out)?;
    }
    Ok(())
}

fn decode(config: PathBuf, scores: Option<PathBuf>) -> chartparse::Result<()> {
    let config = ParserConfig::load(config)?;
    let decoder = config.decoder();
    let reader: Box<dyn BufRead> = match scores {
        Some(path) => Box::new(BufReader::new(File::open(path)?)),
        None => Box::new(BufReader::new(io::stdin())),
    };
    let mut sentences = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if !line.trim().is_empty() {
            sentences.push(serde_json::from_str::<ScoredSentence>(&line)?);
        }
    }

    let begin = Instant::now();
    let lengths: Vec<usize> = sentences.iter().map(|s| s.words.len()).collect();
    let trees = subbatch::par_map(
        |group: &[&ScoredSentence]| -> chartparse::Result<Vec<_>> {
            let charts = group
                .iter()
                .map(|s| ScoreChart::from_nested(&s.scores))
                .collect::<chartparse::Result<Vec<_>>>()?;
            let lengths: Vec<usize> = group.iter().map(|s| s.words.len()).collect();
            let decoded = decoder.charts_from_scores_batched(&ScoreTensor::from_charts(&charts)?, &lengths)?;
            group
                .iter()
                .zip(decoded)
                .map(|(s, d)| decoder.tree_from_chart(&d.chart, &s.leaves()))
                .collect()
        },
        &sentences,
        &lengths,
        config.hparams().subbatch_max_tokens,
    )?;
    log::info!("decoded {} sentences in {:?}", trees.len(), begin.elapsed());

    let mut out = BufWriter::new(io::stdout().lock());
    for tree in trees {
        writeln!(out, "{tree}")?;
    }
    Ok(())
}

fn eval(gold: PathBuf, predicted: PathBuf, quiet: bool) -> chartparse::Result<()> {
    let gold = Treebank::open(gold, true)?;
    let predicted = Treebank::open(predicted, true)?;
    if gold.len() != predicted.len() {
        log::warn!("{} gold trees but {} predicted trees", gold.len(), predicted.len());
    }
    let mut evaluation = Evaluation::default();
    for (g, p) in gold.v.iter().zip(&predicted.v) {
        evaluation.accumulate(g, p)?;
    }
    if quiet {
        let e = evaluation.evaluate();
        println!("F1: {:.4} (precision {:.4}, recall {:.4})", e.fmeasure, e.precision, e.recall);
    } else {
        println!("{evaluation}");
    }
    Ok(())
}

fn main() -> chartparse::Result<()> {
    env_logger::init();
    let argv = Argv::parse();
    log::info!("{:?}", argv);
    match argv.command {
        Command::Vocab {
            treebank,
            output,
            tags,
            siblings,
            keep_top,
        } => vocab(treebank, output, tags, siblings, keep_top),
        Command::Chart { config, treebank } => chart(config, treebank),
        Command::Decode { config, scores } => decode(config, scores),
        Command::Eval { gold, predicted, quiet } => eval(gold, predicted, quiet),
    }
}

use std::{
    collections::BTreeMap,
    fs::File,
    io::{BufReader, BufWriter},
    path::Path,
};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::{
    chart::{ChartDecoder, Reduction, SpanMarginLoss},
    heads::SiblingStats,
    vocab::{LabelVocabulary, SymbolVocabulary},
    Error, Result,
};

bitflags! {
    /// Auxiliary outputs trained next to the span classifier.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Heads: u8 {
        /// Part-of-speech tags per token.
        const TAGGING = 1;
        /// Pattern class per span.
        const PATTERN = 1 << 1;
        /// Pattern to label compatibility.
        const COMPATIBILITY = 1 << 2;
        /// Left and right sibling labels per constituent.
        const SIBLING = 1 << 3;
        /// Label to sibling-label compatibility.
        const SIBLING_COMPATIBILITY = 1 << 4;
    }
}

/// Hyperparameters that affect decoding, batching and the combined loss.
///
/// Fields missing from a stored record take their default value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HParams {
    pub force_root_constituent: bool,
    /// Longest sentence the encoder's position table supports.
    pub encoder_max_len: usize,
    pub subbatch_max_tokens: usize,
    pub tag_loss_scale: f64,
    pub pattern_loss_scale: f64,
    pub compatible_loss_scale: f64,
    pub sibling_loss_scale: f64,
    pub sibling_compatible_loss_scale: f64,
    pub pattern_num_negative: usize,
    pub compatible_num_negative: usize,
    pub sibling_compatible_num_negative: usize,
    /// Minimum co-occurrence count for a sibling pair to count as compatible.
    pub sibling_compatible_threshold: usize,
}

impl Default for HParams {
    fn default() -> Self {
        Self {
            force_root_constituent: true,
            encoder_max_len: 512,
            subbatch_max_tokens: 2000,
            tag_loss_scale: 5.0,
            pattern_loss_scale: 1.0,
            compatible_loss_scale: 1.0,
            sibling_loss_scale: 1.0,
            sibling_compatible_loss_scale: 1.0,
            pattern_num_negative: 1,
            compatible_num_negative: 1,
            sibling_compatible_num_negative: 1,
            sibling_compatible_threshold: 1,
        }
    }
}

/// Vocabularies, active heads and hyperparameters of a parser.
///
/// Built once with [`ParserConfigBuilder`]; each optional vocabulary is
/// present exactly when its head is active.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ConfigRecord", into = "ConfigRecord")]
pub struct ParserConfig {
    label_vocab: LabelVocabulary,
    tag_vocab: Option<SymbolVocabulary>,
    pattern_vocab: Option<SymbolVocabulary>,
    pattern_children: Option<BTreeMap<String, Vec<String>>>,
    sibling_stats: Option<SiblingStats>,
    heads: Heads,
    hparams: HParams,
}

#[derive(Clone, Serialize, Deserialize)]
struct ConfigRecord {
    label_vocab: LabelVocabulary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tag_vocab: Option<SymbolVocabulary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pattern_vocab: Option<SymbolVocabulary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pattern_children: Option<BTreeMap<String, Vec<String>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sibling_stats: Option<SiblingStats>,
    #[serde(default)]
    heads: Heads,
    #[serde(default)]
    hparams: HParams,
}

impl TryFrom<ConfigRecord> for ParserConfig {
    type Error = Error;

    fn try_from(r: ConfigRecord) -> Result<Self> {
        let config = Self {
            label_vocab: r.label_vocab,
            tag_vocab: r.tag_vocab,
            pattern_vocab: r.pattern_vocab,
            pattern_children: r.pattern_children,
            sibling_stats: r.sibling_stats,
            heads: r.heads,
            hparams: r.hparams,
        };
        config.validate()?;
        Ok(config)
    }
}

impl From<ParserConfig> for ConfigRecord {
    fn from(c: ParserConfig) -> Self {
        Self {
            label_vocab: c.label_vocab,
            tag_vocab: c.tag_vocab,
            pattern_vocab: c.pattern_vocab,
            pattern_children: c.pattern_children,
            sibling_stats: c.sibling_stats,
            heads: c.heads,
            hparams: c.hparams,
        }
    }
}

impl ParserConfig {
    pub fn builder(label_vocab: LabelVocabulary) -> ParserConfigBuilder {
        ParserConfigBuilder::new(label_vocab)
    }

    fn validate(&self) -> Result<()> {
        let require = |head: Heads, present: bool, what: &str| {
            if self.heads.contains(head) && !present {
                Err(Error::InvalidConfig(format!("{head:?} head requires {what}")))
            } else {
                Ok(())
            }
        };
        require(Heads::TAGGING, self.tag_vocab.is_some(), "a tag vocabulary")?;
        require(Heads::PATTERN, self.pattern_vocab.is_some(), "a pattern vocabulary")?;
        require(Heads::COMPATIBILITY, self.heads.contains(Heads::PATTERN), "the pattern head")?;
        require(Heads::COMPATIBILITY, self.pattern_children.is_some(), "pattern children")?;
        require(Heads::SIBLING_COMPATIBILITY, self.heads.contains(Heads::SIBLING), "the sibling head")?;
        require(Heads::SIBLING_COMPATIBILITY, self.sibling_stats.is_some(), "sibling statistics")?;
        if self.hparams.encoder_max_len == 0 {
            return Err(Error::InvalidConfig("encoder_max_len must be positive".to_string()));
        }
        if self.hparams.subbatch_max_tokens == 0 {
            return Err(Error::InvalidConfig("subbatch_max_tokens must be positive".to_string()));
        }
        Ok(())
    }

    pub fn heads(&self) -> Heads {
        self.heads
    }

    pub fn hparams(&self) -> &HParams {
        &self.hparams
    }

    pub fn label_vocab(&self) -> &LabelVocabulary {
        &self.label_vocab
    }

    pub fn tag_vocab(&self) -> Option<&SymbolVocabulary> {
        self.tag_vocab.as_ref()
    }

    pub fn pattern_vocab(&self) -> Option<&SymbolVocabulary> {
        self.pattern_vocab.as_ref()
    }

    pub fn pattern_children(&self) -> Option<&BTreeMap<String, Vec<String>>> {
        self.pattern_children.as_ref()
    }

    pub fn sibling_stats(&self) -> Option<&SiblingStats> {
        self.sibling_stats.as_ref()
    }

    /// Decoder honouring the root and length settings.
    pub fn decoder(&self) -> ChartDecoder {
        ChartDecoder::new(self.label_vocab.clone())
            .with_force_root(self.hparams.force_root_constituent)
            .with_max_len(self.hparams.encoder_max_len)
    }

    /// Span loss summed over the sentences of a batch.
    pub fn margin_loss(&self) -> SpanMarginLoss {
        SpanMarginLoss::new(Reduction::Sum, self.hparams.force_root_constituent)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let config: Self = serde_json::from_reader(BufReader::new(file))?;
        log::info!(
            "loaded config (L: {}, heads: {:?})",
            config.label_vocab.len(),
            config.heads
        );
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)?;
        Ok(())
    }
}

/// Activates heads together with the data each one needs.
#[derive(Debug, Clone)]
pub struct ParserConfigBuilder {
    config: ParserConfig,
}

impl ParserConfigBuilder {
    pub fn new(label_vocab: LabelVocabulary) -> Self {
        Self {
            config: ParserConfig {
                label_vocab,
                tag_vocab: None,
                pattern_vocab: None,
                pattern_children: None,
                sibling_stats: None,
                heads: Heads::empty(),
                hparams: HParams::default(),
            },
        }
    }

    pub fn hparams(mut self, hparams: HParams) -> Self {
        self.config.hparams = hparams;
        self
    }

    pub fn tagging(mut self, tag_vocab: SymbolVocabulary) -> Self {
        self.config.tag_vocab = Some(tag_vocab);
        self.config.heads |= Heads::TAGGING;
        self
    }

    pub fn pattern(mut self, pattern_vocab: SymbolVocabulary) -> Self {
        self.config.pattern_vocab = Some(pattern_vocab);
        self.config.heads |= Heads::PATTERN;
        self
    }

    /// `children` maps a pattern to the labels found under it.
    pub fn compatibility(mut self, children: BTreeMap<String, Vec<String>>) -> Self {
        self.config.pattern_children = Some(children);
        self.config.heads |= Heads::COMPATIBILITY;
        self
    }

    pub fn sibling(mut self) -> Self {
        self.config.heads |= Heads::SIBLING;
        self
    }

    pub fn sibling_compatibility(mut self, stats: SiblingStats) -> Self {
        self.config.sibling_stats = Some(stats);
        self.config.heads |= Heads::SIBLING_COMPATIBILITY;
        self
    }

    pub fn build(self) -> Result<ParserConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

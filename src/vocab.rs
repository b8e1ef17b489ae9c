//! Label, tag and pattern vocabularies.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::quark::{Quark, StringTable, TextVectorizer};
use crate::tree::Tree;
use crate::{Error, Result};

/// Joins the labels of a collapsed unary chain, e.g. `"S::VP"`.
pub const CHAIN_SEPARATOR: &str = "::";

/// Id of the empty label.
pub const EMPTY_LABEL: usize = 0;

/// Maps (possibly chained) span labels to dense ids. Id 0 is always `""`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Quark", into = "Quark")]
pub struct LabelVocabulary {
    quark: Quark,
}

impl TryFrom<Quark> for LabelVocabulary {
    type Error = Error;

    fn try_from(quark: Quark) -> Result<Self> {
        match quark.to_str(EMPTY_LABEL) {
            Some("") => {}
            Some(s) => {
                return Err(Error::InvalidVocabulary(format!(
                    "id 0 must be the empty label, found '{s}'"
                )))
            }
            None => return Err(Error::InvalidVocabulary("vocabulary is empty".to_string())),
        }
        for label in quark.iter().skip(1) {
            validate_chain(label)?;
        }
        Ok(Self { quark })
    }
}

impl From<LabelVocabulary> for Quark {
    fn from(value: LabelVocabulary) -> Self {
        value.quark
    }
}

fn validate_chain(label: &str) -> Result<()> {
    if label.is_empty() {
        return Err(Error::InvalidVocabulary("empty label after id 0".to_string()));
    }
    // A sub-label must survive a split/join round trip unchanged.
    if label
        .split(CHAIN_SEPARATOR)
        .any(|part| part.is_empty() || part.starts_with(':') || part.ends_with(':'))
    {
        return Err(Error::InvalidVocabulary(format!(
            "label '{label}' collides with the chain separator '{CHAIN_SEPARATOR}'"
        )));
    }
    Ok(())
}

impl LabelVocabulary {
    /// Builds a vocabulary from the given labels: `""` first, then the
    /// distinct labels in sorted order.
    pub fn new<'a, I: IntoIterator<Item = &'a str>>(labels: I) -> Result<Self> {
        let set: BTreeSet<&str> = labels.into_iter().collect();
        let mut quark = Quark::default();
        quark.find_or_insert("");
        for label in set {
            quark.find_or_insert(label);
        }
        Self::try_from(quark)
    }

    /// Collects the collapsed constituent labels of a treebank.
    pub fn from_trees(trees: &[Tree]) -> Result<Self> {
        let spans: Vec<String> = trees
            .iter()
            .flat_map(|t| t.labeled_spans().into_iter().map(|s| s.label))
            .collect();
        let vocab = Self::new(spans.iter().map(String::as_str))?;
        log::info!("label vocabulary: {} labels from {} trees", vocab.len(), trees.len());
        Ok(vocab)
    }

    pub fn id(&self, label: &str) -> Result<usize> {
        self.quark
            .to_id(label)
            .ok_or_else(|| Error::UnknownLabel(label.to_string()))
    }

    pub fn label(&self, id: usize) -> Result<&str> {
        self.quark.to_str(id).ok_or_else(|| {
            Error::InvalidChart(format!("label id {id} out of range for {} labels", self.len()))
        })
    }

    /// Sub-labels of a chain label, top first; empty for id 0.
    pub fn chain(&self, id: usize) -> Result<Vec<String>> {
        Ok(crate::tree::split_chain(self.label(id)?))
    }

    pub fn len(&self) -> usize {
        self.quark.len()
    }

    pub fn is_empty(&self) -> bool {
        self.quark.len() <= 1
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.quark.iter()
    }
}

/// A plain symbol table for POS tags or span patterns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SymbolVocabulary {
    quark: Quark,
}

impl SymbolVocabulary {
    pub fn new<'a, I: IntoIterator<Item = &'a str>>(symbols: I) -> Self {
        let set: BTreeSet<&str> = symbols.into_iter().collect();
        let mut quark = Quark::default();
        for symbol in set {
            quark.find_or_insert(symbol);
        }
        Self { quark }
    }

    /// Collects the POS tags of a treebank.
    pub fn tags_from_trees(trees: &[Tree]) -> Self {
        let pos: Vec<(String, String)> = trees.iter().flat_map(Tree::pos).collect();
        Self::new(pos.iter().map(|(_, tag)| tag.as_str()))
    }

    pub fn id(&self, symbol: &str) -> Option<usize> {
        self.quark.to_id(symbol)
    }

    pub fn symbol(&self, id: usize) -> Option<&str> {
        self.quark.to_str(id)
    }

    pub fn len(&self) -> usize {
        self.quark.len()
    }

    pub fn is_empty(&self) -> bool {
        self.quark.is_empty()
    }
}

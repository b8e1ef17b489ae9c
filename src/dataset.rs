use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
};

use crate::tree::{self, Tree};
use crate::vocab::{LabelVocabulary, SymbolVocabulary};
use crate::Result;

/// Trees of a bracketed treebank file.
#[derive(Debug, Default)]
pub struct Treebank {
    pub v: Vec<Tree>,
}

impl Treebank {
    pub fn open<P: AsRef<Path>>(path: P, strip_top: bool) -> Result<Self> {
        let mut treebank = Self::default();
        treebank.read_file(File::open(path)?, strip_top)?;
        Ok(treebank)
    }

    /// Appends the trees of `file`. A tree may span several lines and a
    /// line may hold several trees. Malformed trees are skipped with a warning.
    pub fn read_file(&mut self, file: File, strip_top: bool) -> Result<()> {
        self.read(BufReader::new(file), strip_top)
    }

    pub fn read<R: BufRead>(&mut self, reader: R, strip_top: bool) -> Result<()> {
        let mut buf = String::new();
        let mut depth: isize = 0;
        let mut first_line = 0;
        for (n, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() && depth == 0 {
                continue;
            }
            if buf.is_empty() {
                first_line = n + 1;
            }
            for c in line.chars() {
                match c {
                    '(' => depth += 1,
                    ')' => depth -= 1,
                    _ => {}
                }
            }
            buf.push_str(&line);
            buf.push('\n');
            if depth <= 0 {
                self.push_trees(&buf, first_line, strip_top);
                buf.clear();
                depth = 0;
            }
        }
        if !buf.trim().is_empty() {
            log::warn!("unterminated tree at line {first_line}");
        }
        log::info!("read {} trees", self.v.len());
        Ok(())
    }

    fn push_trees(&mut self, text: &str, line: usize, strip_top: bool) {
        match tree::parse_trees(text, strip_top) {
            Ok(trees) => self.v.extend(trees),
            Err(e) => log::warn!("invalid tree at line {line}: {e}"),
        }
    }

    pub fn len(&self) -> usize {
        self.v.len()
    }

    pub fn is_empty(&self) -> bool {
        self.v.is_empty()
    }

    pub fn max_length(&self) -> usize {
        self.v.iter().map(|x| x.len()).max().unwrap_or_default()
    }

    pub fn total_items(&self) -> usize {
        self.v.iter().map(|x| x.len()).sum()
    }

    /// Token count of each sentence, usable as sub-batching costs.
    pub fn lengths(&self) -> Vec<usize> {
        self.v.iter().map(Tree::len).collect()
    }

    /// Drops sentences longer than `max_len` tokens.
    pub fn filter_by_length(&mut self, max_len: usize) {
        let before = self.v.len();
        self.v.retain(|t| t.len() <= max_len);
        if self.v.len() < before {
            log::warn!("dropped {} trees longer than {max_len} tokens", before - self.v.len());
        }
    }

    pub fn label_vocab(&self) -> Result<LabelVocabulary> {
        LabelVocabulary::from_trees(&self.v)
    }

    pub fn tag_vocab(&self) -> SymbolVocabulary {
        SymbolVocabulary::tags_from_trees(&self.v)
    }
}

//! Constituency trees and their bracketed (PTB) text form.

use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::vocab::CHAIN_SEPARATOR;
use crate::{Error, Result};

/// A half-open token range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        debug_assert!(start < end, "empty span [{start}, {end})");
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

impl Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// A constituent: a span together with its (possibly chained) label.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LabeledSpan {
    pub span: Span,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Tree {
    Leaf {
        word: String,
        tag: String,
    },
    /// `labels` lists a collapsed unary chain from top to bottom. An empty list
    /// marks a transparent node whose span is not a constituent.
    Internal {
        labels: Vec<String>,
        children: Vec<Tree>,
    },
}

impl Tree {
    pub fn leaf(word: &str, tag: &str) -> Self {
        Tree::Leaf {
            word: word.to_string(),
            tag: tag.to_string(),
        }
    }

    /// Builds an internal node; `label` may be a chain label such as `"S::VP"`
    /// or `""` for a transparent node.
    pub fn internal(label: &str, children: Vec<Tree>) -> Self {
        Tree::Internal {
            labels: split_chain(label),
            children,
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Tree::Leaf { .. })
    }

    /// Number of tokens covered.
    pub fn len(&self) -> usize {
        match self {
            Tree::Leaf { .. } => 1,
            Tree::Internal { children, .. } => children.iter().map(Tree::len).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(word, tag)` pairs left to right.
    pub fn pos(&self) -> Vec<(String, String)> {
        let mut out = Vec::with_capacity(self.len());
        self.collect_leaves(&mut out);
        out
    }

    pub fn words(&self) -> Vec<String> {
        self.pos().into_iter().map(|(w, _)| w).collect()
    }

    fn collect_leaves(&self, out: &mut Vec<(String, String)>) {
        match self {
            Tree::Leaf { word, tag } => out.push((word.clone(), tag.clone())),
            Tree::Internal { children, .. } => {
                for c in children {
                    c.collect_leaves(out);
                }
            }
        }
    }

    /// Joined label of an internal node, `""` for leaves and transparent nodes.
    pub fn label(&self) -> String {
        match self {
            Tree::Leaf { .. } => String::new(),
            Tree::Internal { labels, .. } => labels.join(CHAIN_SEPARATOR),
        }
    }

    /// Rejects internal nodes without children.
    pub fn validate(&self) -> Result<()> {
        match self {
            Tree::Leaf { .. } => Ok(()),
            Tree::Internal { labels, children } => {
                if children.is_empty() {
                    return Err(Error::InvalidTree(format!(
                        "node '{}' has no children",
                        labels.join(CHAIN_SEPARATOR)
                    )));
                }
                children.iter().try_for_each(Tree::validate)
            }
        }
    }

    /// Merges every chain of single-child internal nodes into one node whose
    /// labels are the concatenation of the chain, top first.
    pub fn collapse_unary(self) -> Tree {
        match self {
            leaf @ Tree::Leaf { .. } => leaf,
            Tree::Internal {
                mut labels,
                mut children,
            } => {
                while children.len() == 1 && !children[0].is_leaf() {
                    match children.pop() {
                        Some(Tree::Internal {
                            labels: inner_labels,
                            children: inner_children,
                        }) => {
                            labels.extend(inner_labels);
                            children = inner_children;
                        }
                        Some(leaf) => {
                            children.push(leaf);
                            break;
                        }
                        None => break,
                    }
                }
                Tree::Internal {
                    labels,
                    children: children.into_iter().map(Tree::collapse_unary).collect(),
                }
            }
        }
    }

    /// Expands chain labels into nested single-label nodes.
    pub fn expand_chains(self) -> Tree {
        match self {
            leaf @ Tree::Leaf { .. } => leaf,
            Tree::Internal { labels, children } => {
                let children: Vec<Tree> = children.into_iter().map(Tree::expand_chains).collect();
                if labels.len() <= 1 {
                    return Tree::Internal { labels, children };
                }
                let mut node = children;
                for label in labels.into_iter().rev() {
                    node = vec![Tree::Internal {
                        labels: vec![label],
                        children: node,
                    }];
                }
                node.pop().unwrap_or(Tree::Internal {
                    labels: Vec::new(),
                    children: Vec::new(),
                })
            }
        }
    }

    /// Constituents of the collapsed tree in preorder.
    pub fn labeled_spans(&self) -> Vec<LabeledSpan> {
        let collapsed = self.clone().collapse_unary();
        let mut out = Vec::new();
        collapsed.walk_spans(0, &mut out);
        out
    }

    fn walk_spans(&self, start: usize, out: &mut Vec<LabeledSpan>) -> usize {
        match self {
            Tree::Leaf { .. } => start + 1,
            Tree::Internal { labels, children } => {
                let slot = out.len();
                if !labels.is_empty() {
                    out.push(LabeledSpan {
                        span: Span { start, end: start },
                        label: labels.join(CHAIN_SEPARATOR),
                    });
                }
                let mut end = start;
                for c in children {
                    end = c.walk_spans(end, out);
                }
                if !labels.is_empty() {
                    out[slot].span = Span { start, end };
                }
                end
            }
        }
    }

    /// Drops a `TOP`/`ROOT`/unlabeled wrapper around a single child.
    pub fn strip_top(self) -> Tree {
        match self {
            Tree::Internal { labels, mut children }
                if children.len() == 1
                    && (labels.is_empty()
                        || labels.len() == 1 && (labels[0] == "TOP" || labels[0] == "ROOT")) =>
            {
                children.pop().unwrap_or(Tree::Internal { labels, children: Vec::new() })
            }
            other => other,
        }
    }
}

pub(crate) fn split_chain(label: &str) -> Vec<String> {
    if label.is_empty() {
        Vec::new()
    } else {
        label.split(CHAIN_SEPARATOR).map(str::to_string).collect()
    }
}

impl Display for Tree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tree::Leaf { word, tag } => write!(f, "({} {})", tag, word),
            Tree::Internal { labels, children } => {
                if labels.is_empty() {
                    write!(f, "(")?;
                    for (i, c) in children.iter().enumerate() {
                        if i > 0 {
                            write!(f, " ")?;
                        }
                        write!(f, "{}", c)?;
                    }
                    return write!(f, ")");
                }
                for label in labels {
                    write!(f, "({} ", label)?;
                }
                for (i, c) in children.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", c)?;
                }
                for _ in labels {
                    write!(f, ")")?;
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, PartialEq)]
enum Token<'a> {
    Open,
    Close,
    Atom(&'a str),
}

fn tokenize(text: &str) -> Vec<Token<'_>> {
    let mut tokens = Vec::new();
    let mut begin = None;
    for (i, c) in text.char_indices() {
        match c {
            '(' | ')' => {
                if let Some(b) = begin.take() {
                    tokens.push(Token::Atom(&text[b..i]));
                }
                tokens.push(if c == '(' { Token::Open } else { Token::Close });
            }
            c if c.is_whitespace() => {
                if let Some(b) = begin.take() {
                    tokens.push(Token::Atom(&text[b..i]));
                }
            }
            _ => {
                if begin.is_none() {
                    begin = Some(i);
                }
            }
        }
    }
    if let Some(b) = begin {
        tokens.push(Token::Atom(&text[b..]));
    }
    tokens
}

fn parse_node(tokens: &[Token<'_>], pos: &mut usize) -> Result<Tree> {
    if tokens.get(*pos) != Some(&Token::Open) {
        return Err(Error::InvalidTree(format!("expected '(' at token {}", *pos)));
    }
    *pos += 1;
    let label = match tokens.get(*pos) {
        Some(Token::Atom(s)) => {
            *pos += 1;
            *s
        }
        _ => "",
    };
    // (TAG word)
    if let (Some(Token::Atom(word)), Some(Token::Close)) = (tokens.get(*pos), tokens.get(*pos + 1)) {
        *pos += 2;
        return Ok(Tree::leaf(word, label));
    }
    let mut children = Vec::new();
    loop {
        match tokens.get(*pos) {
            Some(Token::Close) => {
                *pos += 1;
                break;
            }
            Some(Token::Open) => children.push(parse_node(tokens, pos)?),
            Some(Token::Atom(a)) => {
                return Err(Error::InvalidTree(format!("unexpected atom '{a}' under '{label}'")))
            }
            None => return Err(Error::InvalidTree("unbalanced parentheses".to_string())),
        }
    }
    if children.is_empty() {
        return Err(Error::InvalidTree(format!("node '{label}' has no children")));
    }
    Ok(Tree::Internal {
        labels: split_chain(label),
        children,
    })
}

/// Reads every bracketed tree in `text`.
pub fn parse_trees(text: &str, strip_top: bool) -> Result<Vec<Tree>> {
    let tokens = tokenize(text);
    let mut pos = 0;
    let mut trees = Vec::new();
    while pos < tokens.len() {
        let tree = parse_node(&tokens, &mut pos)?;
        trees.push(if strip_top { tree.strip_top() } else { tree });
    }
    Ok(trees)
}

impl FromStr for Tree {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut trees = parse_trees(s, false)?;
        match trees.len() {
            1 => Ok(trees.remove(0)),
            n => Err(Error::InvalidTree(format!("expected one tree, found {n}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SENT: &str = "(S (NP (DT the) (NN dog)) (VP (VBZ barks)))";

    #[test]
    fn read_and_write() {
        let tree: Tree = SENT.parse().unwrap();
        assert_eq!(tree.len(), 3);
        assert_eq!(tree.to_string(), SENT);
        assert_eq!(tree.words(), vec!["the", "dog", "barks"]);
    }

    #[test]
    fn strip_top_wrapper() {
        let trees = parse_trees(&format!("(TOP {SENT})\n( {SENT})"), true).unwrap();
        assert_eq!(trees.len(), 2);
        assert_eq!(trees[0], trees[1]);
        assert_eq!(trees[0].label(), "S");
    }

    #[test]
    fn labeled_spans_collapse_chains() {
        let tree: Tree = "(S (VP (VB go)))".parse().unwrap();
        let spans = tree.labeled_spans();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].label, "S::VP");
        assert_eq!(spans[0].span, Span::new(0, 1));

        let tree: Tree = SENT.parse().unwrap();
        let spans: Vec<_> = tree.labeled_spans().into_iter().map(|s| (s.span.start, s.span.end, s.label)).collect();
        assert_eq!(
            spans,
            vec![(0, 3, "S".to_string()), (0, 2, "NP".to_string()), (2, 3, "VP".to_string())]
        );
    }

    #[test]
    fn chains_expand_back() {
        let tree: Tree = "(S (VP (VB go)))".parse().unwrap();
        let collapsed = tree.clone().collapse_unary();
        assert_eq!(collapsed.label(), "S::VP");
        assert_eq!(collapsed.expand_chains(), tree);
    }

    #[test]
    fn malformed_input() {
        assert!(matches!("(S (NP".parse::<Tree>(), Err(Error::InvalidTree(_))));
        assert!(matches!("(S)".parse::<Tree>(), Err(Error::InvalidTree(_))));
        assert!(matches!("(S x (NN y))".parse::<Tree>(), Err(Error::InvalidTree(_))));
    }
}

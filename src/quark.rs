use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub trait StringTable {
    fn to_str(&self, id: usize) -> Option<&str>;
    fn to_id(&self, s: &str) -> Option<usize>;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub trait TextVectorizer {
    fn find_or_insert(&mut self, key: &str) -> usize;
}

/// Dense, insertion-ordered string table.
///
/// Serialized as the plain list of strings; the reverse index is rebuilt on load.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct Quark {
    v: Vec<String>,
    #[serde(skip)]
    m: HashMap<String, usize>,
}

impl From<Vec<String>> for Quark {
    fn from(value: Vec<String>) -> Self {
        let m = value.iter().enumerate().map(|(i, s)| (s.to_string(), i)).collect();
        Self { v: value, m }
    }
}

impl From<Quark> for Vec<String> {
    fn from(value: Quark) -> Self {
        value.v
    }
}

impl StringTable for Quark {
    fn to_str(&self, id: usize) -> Option<&str> {
        self.v.get(id).map(|x| x.as_str())
    }

    fn to_id(&self, s: &str) -> Option<usize> {
        self.m.get(s).copied()
    }

    fn len(&self) -> usize {
        self.v.len()
    }
}

impl TextVectorizer for Quark {
    fn find_or_insert(&mut self, key: &str) -> usize {
        if let Some(&idx) = self.m.get(key) {
            return idx;
        }
        let idx = self.v.len();
        self.m.insert(key.to_string(), idx);
        self.v.push(key.to_string());
        idx
    }
}

impl Quark {
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.v.iter().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_by_str() {
        let mut quark = Quark::default();
        for (s, id) in [("", 0), ("NP", 1), ("VP", 2), ("S", 3), ("VP", 2), ("NP", 1), ("", 0), ("PP", 4)] {
            assert_eq!(id, quark.find_or_insert(s), "{} != {}", s, id);
        }
    }

    #[test]
    fn find_by_id() {
        let mut quark = Quark::default();
        quark.find_or_insert("");
        quark.find_or_insert("NP");
        assert_eq!(quark.to_str(0), Some(""));
        assert_eq!(quark.to_str(1), Some("NP"));
        assert_eq!(quark.to_str(2), None);
    }

    #[test]
    fn serde_rebuilds_index() {
        let quark = Quark::from(vec!["".to_string(), "NP".to_string(), "S::VP".to_string()]);
        let s = serde_json::to_string(&quark).unwrap();
        assert_eq!(s, r#"["","NP","S::VP"]"#);
        let back: Quark = serde_json::from_str(&s).unwrap();
        assert_eq!(back.to_id("S::VP"), Some(2));
        assert_eq!(back, quark);
    }
}

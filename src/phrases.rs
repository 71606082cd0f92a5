//! Phrase definitions file.
//!
//! ```json
//! { "phrases": [ {"type": "phrase", "text": "Hello"}, {"type": "group", "name": "Food"} ],
//!   "groups":  { "Food": { "phrases": [ {"type": "phrase", "text": "I am hungry"} ] } } }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PhraseEntry {
    Phrase { text: String },
    Group { name: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhraseGroup {
    #[serde(default)]
    pub phrases: Vec<PhraseEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhraseBook {
    #[serde(default)]
    pub phrases: Vec<PhraseEntry>,
    #[serde(default)]
    pub groups: HashMap<String, PhraseGroup>,
}

impl PhraseBook {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    pub fn root(&self) -> &[PhraseEntry] {
        &self.phrases
    }

    pub fn group(&self, name: &str) -> Option<&[PhraseEntry]> {
        self.groups.get(name).map(|g| g.phrases.as_slice())
    }

    /// Group names referenced somewhere but never defined, sorted.
    pub fn validate(&self) -> Vec<String> {
        let mut dangling: Vec<String> = std::iter::once(&self.phrases)
            .chain(self.groups.values().map(|g| &g.phrases))
            .flatten()
            .filter_map(|entry| match entry {
                PhraseEntry::Group { name } if !self.groups.contains_key(name) => {
                    Some(name.clone())
                }
                _ => None,
            })
            .collect();
        dangling.sort();
        dangling.dedup();
        dangling
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOOK: &str = r#"{
        "phrases": [
            {"type": "phrase", "text": "Hello"},
            {"type": "group", "name": "Food"},
            {"type": "group", "name": "Feelings"}
        ],
        "groups": {
            "Food": { "phrases": [ {"type": "phrase", "text": "I am hungry"} ] }
        }
    }"#;

    #[test]
    fn test_parse_root_and_groups() {
        let book = PhraseBook::from_json(BOOK).unwrap();

        assert_eq!(book.root().len(), 3);
        assert_eq!(
            book.root()[0],
            PhraseEntry::Phrase {
                text: "Hello".to_string()
            }
        );
        assert_eq!(book.group("Food").unwrap().len(), 1);
        assert!(book.group("Drinks").is_none());
    }

    #[test]
    fn test_validate_reports_dangling_groups() {
        let book = PhraseBook::from_json(BOOK).unwrap();
        assert_eq!(book.validate(), vec!["Feelings".to_string()]);
    }

    #[test]
    fn test_unknown_entry_type_is_rejected() {
        let err = PhraseBook::from_json(r#"{"phrases": [{"type": "image", "src": "x.png"}]}"#);
        assert!(err.is_err());
    }
}

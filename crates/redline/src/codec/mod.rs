//! Document codecs: turn uploaded bytes into text units and write corrected
//! text back into the original format.

pub mod docx;
pub mod text;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ai::Suggestion;

pub use docx::DocxCodec;
pub use text::TextCodec;

/// One addressable piece of document text, typically a paragraph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextUnit {
    pub index: usize,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentFormat {
    Docx,
    Text,
}

impl DocumentFormat {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "docx" => Some(DocumentFormat::Docx),
            "txt" | "md" => Some(DocumentFormat::Text),
            _ => None,
        }
    }

    /// Format of a file name, by extension.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let (_, ext) = name.rsplit_once('.')?;
        Self::from_extension(ext)
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Unsupported document format: {0}")]
    Unsupported(String),

    #[error("Invalid document archive: {0}")]
    Archive(String),

    #[error("Document part missing: {0}")]
    MissingPart(String),

    #[error("Malformed document XML: {0}")]
    Xml(String),

    #[error("Document is not valid UTF-8 text")]
    Encoding,

    #[error("I/O error while encoding document: {0}")]
    Io(#[from] std::io::Error),
}

/// External document codec collaborator.
pub trait DocumentCodec: Send + Sync {
    fn supports(&self, format: DocumentFormat) -> bool;

    fn parse(&self, bytes: &[u8]) -> Result<Vec<TextUnit>, CodecError>;

    fn integrate(&self, original: &[u8], suggestions: &[Suggestion]) -> Result<Vec<u8>, CodecError>;
}

/// Routes a document format to the codec that handles it.
#[derive(Clone)]
pub struct CodecRegistry {
    codecs: Vec<Arc<dyn DocumentCodec>>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self {
            codecs: vec![Arc::new(DocxCodec::new()), Arc::new(TextCodec::new())],
        }
    }

    pub fn with_codecs(codecs: Vec<Arc<dyn DocumentCodec>>) -> Self {
        Self { codecs }
    }

    pub fn for_format(&self, format: DocumentFormat) -> Result<Arc<dyn DocumentCodec>, CodecError> {
        self.codecs
            .iter()
            .find(|c| c.supports(format))
            .cloned()
            .ok_or_else(|| CodecError::Unsupported(format!("{:?}", format)))
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Groups suggestions by the unit they target.
pub fn group_by_unit(suggestions: &[Suggestion]) -> BTreeMap<usize, Vec<&Suggestion>> {
    let mut grouped: BTreeMap<usize, Vec<&Suggestion>> = BTreeMap::new();
    for s in suggestions {
        grouped.entry(s.unit_index).or_default().push(s);
    }
    grouped
}

/// Applies suggestions to one unit's text by byte offset.
///
/// A suggestion whose `original` does not match the text at its offset, or
/// that overlaps an earlier applied one, is skipped.
pub fn apply_suggestions(text: &str, suggestions: &[&Suggestion]) -> String {
    let mut ordered: Vec<&Suggestion> = suggestions.to_vec();
    ordered.sort_by_key(|s| (s.offset, s.end()));

    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for s in ordered {
        let Some(end) = s.end() else {
            continue;
        };
        if s.offset < cursor || text.get(s.offset..end) != Some(s.original.as_str()) {
            continue;
        }
        out.push_str(&text[cursor..s.offset]);
        out.push_str(&s.replacement);
        cursor = end;
    }
    out.push_str(&text[cursor..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::SuggestionCategory;

    fn suggestion(offset: usize, original: &str, replacement: &str) -> Suggestion {
        Suggestion {
            unit_index: 0,
            offset,
            original: original.to_string(),
            replacement: replacement.to_string(),
            category: SuggestionCategory::Spelling,
            explanation: String::new(),
        }
    }

    #[test]
    fn test_format_from_extension() {
        assert_eq!(DocumentFormat::from_extension("DOCX"), Some(DocumentFormat::Docx));
        assert_eq!(DocumentFormat::from_extension("md"), Some(DocumentFormat::Text));
        assert_eq!(DocumentFormat::from_extension("pdf"), None);
        assert_eq!(
            DocumentFormat::from_file_name("notes.final.txt"),
            Some(DocumentFormat::Text)
        );
        assert_eq!(DocumentFormat::from_file_name("README"), None);
    }

    #[test]
    fn test_registry_routes_formats() {
        let registry = CodecRegistry::new();
        assert!(registry
            .for_format(DocumentFormat::Docx)
            .unwrap()
            .supports(DocumentFormat::Docx));
        assert!(registry
            .for_format(DocumentFormat::Text)
            .unwrap()
            .supports(DocumentFormat::Text));

        let empty = CodecRegistry::with_codecs(vec![]);
        assert!(matches!(
            empty.for_format(DocumentFormat::Text),
            Err(CodecError::Unsupported(_))
        ));
    }

    #[test]
    fn test_apply_in_offset_order() {
        let a = suggestion(10, "recieved", "received");
        let b = suggestion(0, "Teh", "The");
        let out = apply_suggestions("Teh email recieved.", &[&a, &b]);
        assert_eq!(out, "The email received.");
    }

    #[test]
    fn test_apply_skips_mismatch_and_overlap() {
        let wrong = suggestion(0, "Cat", "Dog");
        let first = suggestion(4, "sat on", "sits on");
        let overlapping = suggestion(8, "on the", "upon the");
        let out = apply_suggestions("the sat on the mat", &[&wrong, &first, &overlapping]);
        assert_eq!(out, "the sits on the mat");
    }

    #[test]
    fn test_apply_rejects_non_char_boundary() {
        let bad = suggestion(1, "x", "y");
        assert_eq!(apply_suggestions("é", &[&bad]), "é");
    }

    #[test]
    fn test_apply_skips_overflowing_offset() {
        let bad = suggestion(usize::MAX - 1, "cat", "dog");
        let good = suggestion(0, "Teh", "The");
        assert_eq!(apply_suggestions("Teh cat", &[&bad, &good]), "The cat");
    }

    #[test]
    fn test_group_by_unit() {
        let mut a = suggestion(0, "a", "b");
        a.unit_index = 2;
        let b = suggestion(0, "c", "d");
        let list = vec![a, b];
        let grouped = group_by_unit(&list);
        assert_eq!(grouped.keys().copied().collect::<Vec<_>>(), vec![0, 2]);
    }
}

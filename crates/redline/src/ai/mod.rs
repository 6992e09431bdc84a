//! Suggestion service seam.
//!
//! The pipeline only ever talks to a [`SuggestionService`]; the bundled
//! [`RuleSuggester`] is a deterministic pattern-based implementation that
//! needs no model or network access.

pub mod rule_suggester;

use std::fmt;
use std::ops::AddAssign;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec::TextUnit;

pub use rule_suggester::RuleSuggester;

/// Kind of correction a suggestion makes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuggestionCategory {
    Spelling,
    Grammar,
    Punctuation,
    Style,
    Clarity,
}

impl SuggestionCategory {
    pub const ALL: [SuggestionCategory; 5] = [
        SuggestionCategory::Spelling,
        SuggestionCategory::Grammar,
        SuggestionCategory::Punctuation,
        SuggestionCategory::Style,
        SuggestionCategory::Clarity,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SuggestionCategory::Spelling => "spelling",
            SuggestionCategory::Grammar => "grammar",
            SuggestionCategory::Punctuation => "punctuation",
            SuggestionCategory::Style => "style",
            SuggestionCategory::Clarity => "clarity",
        }
    }
}

impl fmt::Display for SuggestionCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single proposed edit inside one text unit.
///
/// `offset` is a byte offset into the unit's text where `original` starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Suggestion {
    pub unit_index: usize,
    pub offset: usize,
    pub original: String,
    pub replacement: String,
    pub category: SuggestionCategory,
    #[serde(default)]
    pub explanation: String,
}

impl Suggestion {
    /// Byte offset one past the end of the replaced span, or `None` when
    /// the offset reported by the service cannot be represented.
    pub fn end(&self) -> Option<usize> {
        self.offset.checked_add(self.original.len())
    }
}

/// Token accounting reported by a service call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        self.prompt_tokens += rhs.prompt_tokens;
        self.completion_tokens += rhs.completion_tokens;
    }
}

#[derive(Debug, Clone, Default)]
pub struct AnalysisResponse {
    pub suggestions: Vec<Suggestion>,
    pub usage: TokenUsage,
}

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("Suggestion service failed: {0}")]
    Service(String),

    #[error("Suggestion service returned an invalid response: {0}")]
    InvalidResponse(String),

    #[error("Suggestion service unavailable")]
    Unavailable,
}

/// External analysis collaborator.
///
/// Called from a worker thread under a timeout, so implementations must be
/// shareable across threads.
pub trait SuggestionService: Send + Sync {
    fn analyze(
        &self,
        units: &[TextUnit],
        categories: &[SuggestionCategory],
    ) -> Result<AnalysisResponse, AnalysisError>;
}

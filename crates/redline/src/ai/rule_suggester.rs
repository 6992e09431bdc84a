//! Pattern-based suggestion service.
//!
//! Catches a handful of mechanical mistakes without any model: common
//! misspellings, repeated words, stray whitespace around punctuation,
//! wordy phrases and paragraphs that start in lowercase.

use std::sync::LazyLock;

use regex::Regex;

use super::{
    AnalysisError, AnalysisResponse, Suggestion, SuggestionCategory, SuggestionService, TokenUsage,
};
use crate::codec::TextUnit;

/// Common misspellings and their corrections (lowercase).
const MISSPELLINGS: &[(&str, &str)] = &[
    ("teh", "the"),
    ("recieve", "receive"),
    ("recieved", "received"),
    ("seperate", "separate"),
    ("definately", "definitely"),
    ("occured", "occurred"),
    ("accomodate", "accommodate"),
    ("untill", "until"),
    ("wich", "which"),
    ("thier", "their"),
    ("becuase", "because"),
    ("adress", "address"),
    ("enviroment", "environment"),
    ("goverment", "government"),
    ("neccessary", "necessary"),
    ("occurence", "occurrence"),
    ("publically", "publicly"),
    ("tommorow", "tomorrow"),
    ("begining", "beginning"),
    ("beleive", "believe"),
];

/// Wordy phrases with a shorter equivalent.
struct WordyPhrase {
    phrase: &'static str,
    replacement: &'static str,
}

const WORDY_PHRASES: &[WordyPhrase] = &[
    WordyPhrase {
        phrase: "in order to",
        replacement: "to",
    },
    WordyPhrase {
        phrase: "due to the fact that",
        replacement: "because",
    },
    WordyPhrase {
        phrase: "at this point in time",
        replacement: "now",
    },
    WordyPhrase {
        phrase: "in the event that",
        replacement: "if",
    },
];

/// Words that legitimately appear twice in a row.
const ALLOWED_REPEATS: &[&str] = &["had", "that"];

static WORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[A-Za-z]+\b").expect("valid word regex"));
static SPACE_BEFORE_PUNCT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ \t]+([,.;:!?])").expect("valid punctuation regex"));
static DOUBLE_SPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r" {2,}").expect("valid spacing regex"));
static WORDY_RE: LazyLock<Vec<(Regex, &'static WordyPhrase)>> = LazyLock::new(|| {
    WORDY_PHRASES
        .iter()
        .map(|w| {
            let pattern = format!(r"(?i)\b{}\b", regex::escape(w.phrase));
            (Regex::new(&pattern).expect("valid phrase regex"), w)
        })
        .collect()
});

/// Approximate completion tokens charged per suggestion.
const TOKENS_PER_SUGGESTION: u64 = 16;

#[derive(Debug, Default, Clone)]
pub struct RuleSuggester;

impl RuleSuggester {
    pub fn new() -> Self {
        Self
    }

    fn analyze_unit(&self, unit: &TextUnit, categories: &[SuggestionCategory]) -> Vec<Suggestion> {
        let mut out = Vec::new();
        let wants = |c: SuggestionCategory| categories.contains(&c);

        if wants(SuggestionCategory::Spelling) {
            misspellings(unit, &mut out);
        }
        if wants(SuggestionCategory::Grammar) {
            repeated_words(unit, &mut out);
            lowercase_start(unit, &mut out);
        }
        if wants(SuggestionCategory::Punctuation) {
            space_before_punctuation(unit, &mut out);
        }
        if wants(SuggestionCategory::Style) {
            doubled_spaces(unit, &mut out);
        }
        if wants(SuggestionCategory::Clarity) {
            wordy_phrases(unit, &mut out);
        }

        out
    }
}

impl SuggestionService for RuleSuggester {
    fn analyze(
        &self,
        units: &[TextUnit],
        categories: &[SuggestionCategory],
    ) -> Result<AnalysisResponse, AnalysisError> {
        let suggestions: Vec<Suggestion> = units
            .iter()
            .flat_map(|u| self.analyze_unit(u, categories))
            .collect();

        let chars: usize = units.iter().map(|u| u.text.chars().count()).sum();
        let usage = TokenUsage {
            prompt_tokens: (chars as u64).div_ceil(4),
            completion_tokens: suggestions.len() as u64 * TOKENS_PER_SUGGESTION,
        };

        Ok(AnalysisResponse { suggestions, usage })
    }
}

/// Copies the capitalization of `original`'s first letter onto `replacement`.
fn match_case(original: &str, replacement: &str) -> String {
    let starts_upper = original.chars().next().is_some_and(|c| c.is_uppercase());
    if !starts_upper {
        return replacement.to_string();
    }
    let mut chars = replacement.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn misspellings(unit: &TextUnit, out: &mut Vec<Suggestion>) {
    for m in WORD_RE.find_iter(&unit.text) {
        let lower = m.as_str().to_ascii_lowercase();
        if let Some((_, fix)) = MISSPELLINGS.iter().find(|(wrong, _)| *wrong == lower) {
            out.push(Suggestion {
                unit_index: unit.index,
                offset: m.start(),
                original: m.as_str().to_string(),
                replacement: match_case(m.as_str(), fix),
                category: SuggestionCategory::Spelling,
                explanation: format!("'{}' is misspelled", m.as_str()),
            });
        }
    }
}

fn repeated_words(unit: &TextUnit, out: &mut Vec<Suggestion>) {
    let mut previous: Option<regex::Match<'_>> = None;
    for m in WORD_RE.find_iter(&unit.text) {
        if let Some(prev) = previous {
            let gap = &unit.text[prev.end()..m.start()];
            let same = prev.as_str().eq_ignore_ascii_case(m.as_str());
            let allowed = ALLOWED_REPEATS.contains(&m.as_str().to_ascii_lowercase().as_str());
            if same && !allowed && !gap.is_empty() && gap.chars().all(|c| c == ' ' || c == '\t')
            {
                out.push(Suggestion {
                    unit_index: unit.index,
                    offset: prev.start(),
                    original: unit.text[prev.start()..m.end()].to_string(),
                    replacement: prev.as_str().to_string(),
                    category: SuggestionCategory::Grammar,
                    explanation: format!("'{}' is repeated", m.as_str()),
                });
            }
        }
        previous = Some(m);
    }
}

fn lowercase_start(unit: &TextUnit, out: &mut Vec<Suggestion>) {
    let Some((offset, first)) = unit.text.char_indices().find(|(_, c)| !c.is_whitespace()) else {
        return;
    };
    if !first.is_ascii_lowercase() {
        return;
    }
    // Single words and list fragments are left alone.
    if !unit.text.trim_end().ends_with(['.', '!', '?']) {
        return;
    }
    out.push(Suggestion {
        unit_index: unit.index,
        offset,
        original: first.to_string(),
        replacement: first.to_ascii_uppercase().to_string(),
        category: SuggestionCategory::Grammar,
        explanation: "Sentences start with a capital letter".to_string(),
    });
}

fn space_before_punctuation(unit: &TextUnit, out: &mut Vec<Suggestion>) {
    for caps in SPACE_BEFORE_PUNCT_RE.captures_iter(&unit.text) {
        let (Some(whole), Some(punct)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        // Leading indentation is not a stray space.
        if unit.text[..whole.start()].trim().is_empty() {
            continue;
        }
        out.push(Suggestion {
            unit_index: unit.index,
            offset: whole.start(),
            original: whole.as_str().to_string(),
            replacement: punct.as_str().to_string(),
            category: SuggestionCategory::Punctuation,
            explanation: "No space before punctuation".to_string(),
        });
    }
}

fn doubled_spaces(unit: &TextUnit, out: &mut Vec<Suggestion>) {
    for m in DOUBLE_SPACE_RE.find_iter(&unit.text) {
        // Indentation, trailing runs and runs before punctuation are skipped.
        let rest = &unit.text[m.end()..];
        if unit.text[..m.start()].trim().is_empty()
            || rest.is_empty()
            || rest.starts_with([',', '.', ';', ':', '!', '?'])
        {
            continue;
        }
        out.push(Suggestion {
            unit_index: unit.index,
            offset: m.start(),
            original: m.as_str().to_string(),
            replacement: " ".to_string(),
            category: SuggestionCategory::Style,
            explanation: "Use a single space between words".to_string(),
        });
    }
}

fn wordy_phrases(unit: &TextUnit, out: &mut Vec<Suggestion>) {
    for (re, phrase) in WORDY_RE.iter() {
        for m in re.find_iter(&unit.text) {
            out.push(Suggestion {
                unit_index: unit.index,
                offset: m.start(),
                original: m.as_str().to_string(),
                replacement: match_case(m.as_str(), phrase.replacement),
                category: SuggestionCategory::Clarity,
                explanation: format!("'{}' can be shortened", phrase.phrase),
            });
        }
    }
}

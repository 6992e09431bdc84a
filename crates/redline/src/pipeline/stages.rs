//! The built-in correction stages.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::ai::{Suggestion, SuggestionCategory, SuggestionService, TokenUsage};
use crate::codec::{CodecError, CodecRegistry, TextUnit};
use crate::config::PricingConfig;
use crate::storage::FileStore;

use super::context::StageContext;
use super::error::StageError;
use super::stage::{Artifact, PipelineOutput, Stage, StageName};
use super::timeout::run_with_timeout;

fn unexpected(expected: &'static str, actual: &Artifact) -> StageError {
    StageError::UnexpectedArtifact {
        expected,
        actual: actual.kind(),
    }
}

/// Loads the input bytes, verifying their checksum.
pub struct InitializingStage {
    files: Arc<FileStore>,
}

impl InitializingStage {
    pub fn new(files: Arc<FileStore>) -> Self {
        Self { files }
    }
}

impl Stage for InitializingStage {
    fn name(&self) -> StageName {
        StageName::Initializing
    }

    fn run(&self, ctx: &mut StageContext<'_>, input: Artifact) -> Result<Artifact, StageError> {
        if !matches!(input, Artifact::Source) {
            return Err(unexpected("source", &input));
        }
        let format = ctx.file.format().ok_or_else(|| {
            CodecError::Unsupported(format!("file '{}'", ctx.file.original_name))
        })?;
        let (_, bytes) = self.files.read(&ctx.file.id).map_err(StageError::Storage)?;
        Ok(Artifact::Loaded { bytes, format })
    }
}

/// Splits the document into text units.
pub struct ParsingStage {
    codecs: CodecRegistry,
}

impl ParsingStage {
    pub fn new(codecs: CodecRegistry) -> Self {
        Self { codecs }
    }
}

impl Stage for ParsingStage {
    fn name(&self) -> StageName {
        StageName::Parsing
    }

    fn run(&self, ctx: &mut StageContext<'_>, input: Artifact) -> Result<Artifact, StageError> {
        let Artifact::Loaded { bytes, format } = input else {
            return Err(unexpected("loaded", &input));
        };
        let codec = self.codecs.for_format(format)?;
        ctx.tick(10);
        let units = codec.parse(&bytes)?;
        tracing::debug!(units = units.len(), "Parsed document");
        Ok(Artifact::Parsed {
            bytes,
            format,
            units,
        })
    }
}

/// Groups non-blank units into chunks of at most `max_chars` characters.
///
/// A unit longer than the budget forms a chunk of its own.
pub fn chunk_units(units: Vec<TextUnit>, max_chars: usize) -> Vec<Vec<TextUnit>> {
    let mut chunks = Vec::new();
    let mut current: Vec<TextUnit> = Vec::new();
    let mut size = 0usize;

    for unit in units {
        if unit.text.trim().is_empty() {
            continue;
        }
        let len = unit.text.chars().count();
        if !current.is_empty() && size + len > max_chars {
            chunks.push(std::mem::take(&mut current));
            size = 0;
        }
        size += len;
        current.push(unit);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

pub struct ChunkingStage {
    max_chars: usize,
}

impl ChunkingStage {
    pub fn new(max_chars: usize) -> Self {
        Self {
            max_chars: max_chars.max(1),
        }
    }
}

impl Stage for ChunkingStage {
    fn name(&self) -> StageName {
        StageName::Chunking
    }

    fn run(&self, _ctx: &mut StageContext<'_>, input: Artifact) -> Result<Artifact, StageError> {
        let Artifact::Parsed {
            bytes,
            format,
            units,
        } = input
        else {
            return Err(unexpected("parsed", &input));
        };
        let chunks = chunk_units(units, self.max_chars);
        tracing::debug!(chunks = chunks.len(), "Chunked document");
        Ok(Artifact::Chunked {
            bytes,
            format,
            chunks,
        })
    }
}

/// Sends each chunk to the suggestion service under a timeout.
pub struct AnalyzingStage {
    suggester: Arc<dyn SuggestionService>,
    categories: Vec<SuggestionCategory>,
    timeout: Duration,
}

impl AnalyzingStage {
    pub fn new(
        suggester: Arc<dyn SuggestionService>,
        categories: Vec<SuggestionCategory>,
        timeout: Duration,
    ) -> Self {
        Self {
            suggester,
            categories,
            timeout,
        }
    }
}

impl Stage for AnalyzingStage {
    fn name(&self) -> StageName {
        StageName::Analyzing
    }

    fn run(&self, ctx: &mut StageContext<'_>, input: Artifact) -> Result<Artifact, StageError> {
        let Artifact::Chunked {
            bytes,
            format,
            chunks,
        } = input
        else {
            return Err(unexpected("chunked", &input));
        };

        let total = chunks.len();
        let mut units = Vec::new();
        let mut suggestions = Vec::new();
        let mut usage = TokenUsage::default();

        for (i, chunk) in chunks.into_iter().enumerate() {
            let suggester = Arc::clone(&self.suggester);
            let categories = self.categories.clone();
            let call_units = chunk.clone();
            let response = run_with_timeout("analysis", self.timeout, move || {
                suggester
                    .analyze(&call_units, &categories)
                    .map_err(StageError::from)
            })?;

            suggestions.extend(response.suggestions);
            usage += response.usage;
            units.extend(chunk);
            ctx.tick_fraction(i + 1, total);
        }

        tracing::debug!(
            suggestions = suggestions.len(),
            prompt_tokens = usage.prompt_tokens,
            "Analysis finished"
        );
        Ok(Artifact::Analyzed {
            bytes,
            format,
            units,
            suggestions,
            usage,
        })
    }
}

/// Keeps only suggestions that can be applied as stated.
///
/// Drops no-ops, suggestions whose `original` is not found at their offset
/// (which covers unknown units and out-of-range offsets), exact duplicates
/// and suggestions overlapping an earlier one. The result is ordered by unit
/// and offset.
pub fn format_suggestions(units: &[TextUnit], suggestions: Vec<Suggestion>) -> Vec<Suggestion> {
    let texts: HashMap<usize, &str> = units.iter().map(|u| (u.index, u.text.as_str())).collect();

    let mut valid: Vec<Suggestion> = suggestions
        .into_iter()
        .filter(|s| s.original != s.replacement)
        .filter(|s| {
            let span = s.end().map(|end| s.offset..end);
            span.zip(texts.get(&s.unit_index))
                .and_then(|(span, text)| text.get(span))
                == Some(s.original.as_str())
        })
        .collect();

    valid.sort_by(|a, b| {
        (a.unit_index, a.offset, a.end(), &a.replacement).cmp(&(
            b.unit_index,
            b.offset,
            b.end(),
            &b.replacement,
        ))
    });
    valid.dedup_by(|b, a| {
        a.unit_index == b.unit_index
            && a.offset == b.offset
            && a.original == b.original
            && a.replacement == b.replacement
    });

    let mut kept: Vec<Suggestion> = Vec::with_capacity(valid.len());
    for s in valid {
        let overlaps = kept
            .last()
            .is_some_and(|prev| {
                prev.unit_index == s.unit_index && prev.end().is_some_and(|end| s.offset < end)
            });
        if !overlaps {
            kept.push(s);
        }
    }
    kept
}

pub struct FormattingStage;

impl Stage for FormattingStage {
    fn name(&self) -> StageName {
        StageName::Formatting
    }

    fn run(&self, _ctx: &mut StageContext<'_>, input: Artifact) -> Result<Artifact, StageError> {
        let Artifact::Analyzed {
            bytes,
            format,
            units,
            suggestions,
            usage,
        } = input
        else {
            return Err(unexpected("analyzed", &input));
        };
        let received = suggestions.len();
        let suggestions = format_suggestions(&units, suggestions);
        if suggestions.len() < received {
            tracing::debug!(
                dropped = received - suggestions.len(),
                "Dropped unusable suggestions"
            );
        }
        Ok(Artifact::Formatted {
            bytes,
            format,
            suggestions,
            usage,
        })
    }
}

/// Writes the accepted suggestions back into the document.
pub struct IntegratingStage {
    codecs: CodecRegistry,
    timeout: Duration,
}

impl IntegratingStage {
    pub fn new(codecs: CodecRegistry, timeout: Duration) -> Self {
        Self { codecs, timeout }
    }
}

impl Stage for IntegratingStage {
    fn name(&self) -> StageName {
        StageName::Integrating
    }

    fn run(&self, _ctx: &mut StageContext<'_>, input: Artifact) -> Result<Artifact, StageError> {
        let Artifact::Formatted {
            bytes,
            format,
            suggestions,
            usage,
        } = input
        else {
            return Err(unexpected("formatted", &input));
        };

        let output = if suggestions.is_empty() {
            bytes
        } else {
            let codec = self.codecs.for_format(format)?;
            let applied = suggestions.clone();
            run_with_timeout("integration", self.timeout, move || {
                codec.integrate(&bytes, &applied).map_err(StageError::from)
            })?
        };

        Ok(Artifact::Integrated {
            output,
            suggestions,
            usage,
        })
    }
}

/// `essay.docx` becomes `essay_corrected.docx`.
pub fn corrected_name(original_name: &str) -> String {
    match original_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{}_corrected.{}", stem, ext),
        _ => format!("{}_corrected", original_name),
    }
}

/// Computes the cost estimate and the output file name.
pub struct FinalizingStage {
    pricing: PricingConfig,
}

impl FinalizingStage {
    pub fn new(pricing: PricingConfig) -> Self {
        Self { pricing }
    }
}

impl Stage for FinalizingStage {
    fn name(&self) -> StageName {
        StageName::Finalizing
    }

    fn run(&self, ctx: &mut StageContext<'_>, input: Artifact) -> Result<Artifact, StageError> {
        let Artifact::Integrated {
            output,
            suggestions,
            usage,
        } = input
        else {
            return Err(unexpected("integrated", &input));
        };
        Ok(Artifact::Finalized(PipelineOutput {
            output_bytes: output,
            output_name: corrected_name(&ctx.file.original_name),
            cost_estimate: self
                .pricing
                .estimate(usage.prompt_tokens, usage.completion_tokens),
            suggestions,
            usage,
        }))
    }
}

//! Stage names, weights and the overall-progress formula.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ai::{Suggestion, TokenUsage};
use crate::codec::{DocumentFormat, TextUnit};

use super::context::StageContext;
use super::error::StageError;

/// The fixed, ordered set of pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Initializing,
    Parsing,
    Chunking,
    Analyzing,
    Formatting,
    Integrating,
    Finalizing,
}

impl StageName {
    /// All stages in execution order.
    pub const ORDER: [StageName; 7] = [
        StageName::Initializing,
        StageName::Parsing,
        StageName::Chunking,
        StageName::Analyzing,
        StageName::Formatting,
        StageName::Integrating,
        StageName::Finalizing,
    ];

    /// Share of overall progress, in percent. Weights sum to 100.
    pub fn weight(self) -> u32 {
        match self {
            StageName::Initializing => 5,
            StageName::Parsing => 10,
            StageName::Chunking => 10,
            StageName::Analyzing => 60,
            StageName::Formatting => 5,
            StageName::Integrating => 8,
            StageName::Finalizing => 2,
        }
    }

    /// Position in [`StageName::ORDER`].
    pub fn position(self) -> usize {
        self as usize
    }

    /// Sum of the weights of all stages before this one.
    pub fn cumulative_weight(self) -> u32 {
        Self::ORDER[..self.position()]
            .iter()
            .map(|s| s.weight())
            .sum()
    }

    /// Human-readable activity shown in progress messages.
    pub fn description(self) -> &'static str {
        match self {
            StageName::Initializing => "Loading document",
            StageName::Parsing => "Parsing document",
            StageName::Chunking => "Splitting text into chunks",
            StageName::Analyzing => "Analyzing text",
            StageName::Formatting => "Formatting suggestions",
            StageName::Integrating => "Applying corrections",
            StageName::Finalizing => "Finalizing",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StageName::Initializing => "initializing",
            StageName::Parsing => "parsing",
            StageName::Chunking => "chunking",
            StageName::Analyzing => "analyzing",
            StageName::Formatting => "formatting",
            StageName::Integrating => "integrating",
            StageName::Finalizing => "finalizing",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StageName::ORDER
            .iter()
            .copied()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| format!("unknown stage '{}'", s))
    }
}

/// Overall progress for a position in the pipeline, floored.
///
/// `None` means the job has not entered a stage yet. The result is capped
/// at 99: only a completed job reports 100.
pub fn overall_progress(stage: Option<StageName>, stage_progress: u8) -> u8 {
    let Some(stage) = stage else {
        return 0;
    };
    let within = stage.weight() * u32::from(stage_progress.min(100)) / 100;
    (stage.cumulative_weight() + within).min(99) as u8
}

/// Value passed from one stage to the next.
#[derive(Debug, Clone)]
pub enum Artifact {
    /// Input to the first stage.
    Source,
    /// Raw document bytes and their format.
    Loaded {
        bytes: Vec<u8>,
        format: DocumentFormat,
    },
    Parsed {
        bytes: Vec<u8>,
        format: DocumentFormat,
        units: Vec<TextUnit>,
    },
    Chunked {
        bytes: Vec<u8>,
        format: DocumentFormat,
        chunks: Vec<Vec<TextUnit>>,
    },
    Analyzed {
        bytes: Vec<u8>,
        format: DocumentFormat,
        units: Vec<TextUnit>,
        suggestions: Vec<Suggestion>,
        usage: TokenUsage,
    },
    Formatted {
        bytes: Vec<u8>,
        format: DocumentFormat,
        suggestions: Vec<Suggestion>,
        usage: TokenUsage,
    },
    Integrated {
        output: Vec<u8>,
        suggestions: Vec<Suggestion>,
        usage: TokenUsage,
    },
    /// Final product handed to the worker.
    Finalized(PipelineOutput),
}

impl Artifact {
    pub fn kind(&self) -> &'static str {
        match self {
            Artifact::Source => "source",
            Artifact::Loaded { .. } => "loaded",
            Artifact::Parsed { .. } => "parsed",
            Artifact::Chunked { .. } => "chunked",
            Artifact::Analyzed { .. } => "analyzed",
            Artifact::Formatted { .. } => "formatted",
            Artifact::Integrated { .. } => "integrated",
            Artifact::Finalized(_) => "finalized",
        }
    }
}

/// What a successful pipeline run produces.
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub output_bytes: Vec<u8>,
    pub output_name: String,
    pub suggestions: Vec<Suggestion>,
    pub usage: TokenUsage,
    pub cost_estimate: f64,
}

/// One pipeline unit.
///
/// A stage may call [`StageContext::tick`] any number of times; the runner
/// records entry (0) and exit (100) itself.
pub trait Stage: Send + Sync {
    fn name(&self) -> StageName;

    fn run(&self, ctx: &mut StageContext<'_>, input: Artifact) -> Result<Artifact, StageError>;
}

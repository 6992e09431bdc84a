use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info_span, warn};

use crate::ai::SuggestionService;
use crate::codec::CodecRegistry;
use crate::config::{PipelineSettings, PricingConfig};
use crate::storage::{FileRecord, FileStore};

use super::context::StageContext;
use super::error::{StageError, StageFailure};
use super::progress::ProgressSink;
use super::stage::{Artifact, PipelineOutput, Stage, StageName};
use super::stages::{
    AnalyzingStage, ChunkingStage, FinalizingStage, FormattingStage, InitializingStage,
    IntegratingStage, ParsingStage,
};
use super::timeout::panic_message;

/// Collaborators the built-in stages need.
#[derive(Clone)]
pub struct PipelineServices {
    pub files: Arc<FileStore>,
    pub codecs: CodecRegistry,
    pub suggester: Arc<dyn SuggestionService>,
    pub settings: PipelineSettings,
    pub pricing: PricingConfig,
}

pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
}

impl Pipeline {
    /// Production constructor: the seven built-in stages in order.
    pub fn new(services: PipelineServices) -> Self {
        let PipelineServices {
            files,
            codecs,
            suggester,
            settings,
            pricing,
        } = services;

        Self::with_stages(vec![
            Box::new(InitializingStage::new(files)),
            Box::new(ParsingStage::new(codecs.clone())),
            Box::new(ChunkingStage::new(settings.max_chunk_chars)),
            Box::new(AnalyzingStage::new(
                suggester,
                settings.categories.clone(),
                settings.analyze_timeout(),
            )),
            Box::new(FormattingStage),
            Box::new(IntegratingStage::new(codecs, settings.integrate_timeout())),
            Box::new(FinalizingStage::new(pricing)),
        ])
    }

    /// Test constructor: inject specific stages.
    pub fn with_stages(stages: Vec<Box<dyn Stage>>) -> Self {
        Self { stages }
    }

    pub fn stage_names(&self) -> Vec<StageName> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Runs every stage in order for one job.
    ///
    /// Each stage is entered with a 0 tick and left with a 100 tick. The
    /// first error or panic stops the run and is returned tagged with the
    /// stage that raised it.
    pub fn run(
        &self,
        job_id: &str,
        file: &FileRecord,
        progress: &dyn ProgressSink,
    ) -> Result<PipelineOutput, StageFailure> {
        let mut artifact = Artifact::Source;
        let mut last_stage = StageName::Initializing;

        for stage in &self.stages {
            let name = stage.name();
            last_stage = name;
            let _span = info_span!("stage", stage = %name).entered();
            let started = Instant::now();

            progress.report(name, 0);
            let mut ctx = StageContext::new(job_id, file, name, progress);
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| stage.run(&mut ctx, artifact)));

            artifact = match outcome {
                Ok(Ok(next)) => next,
                Ok(Err(e)) => {
                    warn!(retryable = e.is_retryable(), "Stage failed: {}", e);
                    return Err(StageFailure::new(name, e));
                }
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    error!("Stage panicked: {}", message);
                    return Err(StageFailure::new(name, StageError::Panicked(message)));
                }
            };

            progress.report(name, 100);
            debug!(
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Stage finished"
            );
        }

        match artifact {
            Artifact::Finalized(output) => Ok(output),
            other => Err(StageFailure::new(
                last_stage,
                StageError::UnexpectedArtifact {
                    expected: "finalized",
                    actual: other.kind(),
                },
            )),
        }
    }
}

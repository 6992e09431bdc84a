pub mod context;
pub mod error;
pub mod progress;
pub mod runner;
pub mod stage;
pub mod stages;
pub mod timeout;

pub use context::StageContext;
pub use error::{StageError, StageFailure};
pub use progress::{BroadcastProgress, NoopProgress, ProgressSink};
pub use runner::{Pipeline, PipelineServices};
pub use stage::{overall_progress, Artifact, PipelineOutput, Stage, StageName};

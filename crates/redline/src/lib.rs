pub mod ai;
pub mod broadcast;
pub mod codec;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod sanitize;
pub mod storage;
pub mod worker;

pub use ai::{RuleSuggester, Suggestion, SuggestionCategory, SuggestionService};
pub use broadcast::{EventKind, JobStore, ProgressBroadcaster, ProgressEvent, Subscription};
pub use codec::{CodecRegistry, DocumentCodec, DocumentFormat, TextUnit};
pub use config::{load_config, EngineConfig};
pub use engine::{Collaborators, Engine, SweepReport};
pub use error::{ConfigError, ErrorKind, RedlineError, Result};
pub use pipeline::{Pipeline, StageName};
pub use storage::{FileKind, FileRecord, FileStore};
pub use worker::{Job, JobResult, JobStatus};

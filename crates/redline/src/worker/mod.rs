pub mod job;
pub mod pool;
pub mod sweeper;

pub use job::{Job, JobResult, JobStatus};
pub use pool::{process_job, WorkerDeps, WorkerPool};
pub use sweeper::Sweeper;

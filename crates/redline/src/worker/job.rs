use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ai::SuggestionCategory;
use crate::db::job_repo::JobRow;
use crate::db::{format_timestamp, parse_timestamp, DatabaseError};
use crate::pipeline::stage::{overall_progress, StageName};

/// Lifecycle of a job. Transitions only move forward:
/// pending → processing → completed | failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

/// Outcome of a completed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    pub output_file_id: String,
    pub suggestion_count: usize,
    pub suggestions_by_category: BTreeMap<SuggestionCategory, usize>,
    pub elapsed_ms: u64,
    pub cost_estimate: f64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// A job record. Owned by the job store; everything else sees clones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub file_id: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<StageName>,
    pub stage_progress: u8,
    pub sequence: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
}

impl Job {
    /// A fresh pending job for the given input file.
    pub fn new(file_id: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            file_id: file_id.to_string(),
            status: JobStatus::Pending,
            stage: None,
            stage_progress: 0,
            sequence: 0,
            message: Some("Queued".to_string()),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
            result: None,
        }
    }

    /// Derived from `(stage, stage_progress)`; exactly 100 once completed.
    pub fn overall_progress(&self) -> u8 {
        if self.status == JobStatus::Completed {
            return 100;
        }
        overall_progress(self.stage, self.stage_progress)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn to_row(&self) -> JobRow {
        JobRow {
            id: self.id.clone(),
            file_id: self.file_id.clone(),
            status: self.status.as_str().to_string(),
            stage: self.stage.map(|s| s.as_str().to_string()),
            stage_progress: self.stage_progress,
            sequence: self.sequence,
            message: self.message.clone(),
            error_message: self.error_message.clone(),
            result_json: self
                .result
                .as_ref()
                .and_then(|r| serde_json::to_string(r).ok()),
            created_at: format_timestamp(self.created_at),
            started_at: self.started_at.map(format_timestamp),
            completed_at: self.completed_at.map(format_timestamp),
            updated_at: format_timestamp(Utc::now()),
        }
    }

    pub fn from_row(row: &JobRow) -> Result<Self, DatabaseError> {
        let corrupt = |reason: String| DatabaseError::CorruptRow {
            table: "jobs",
            id: row.id.clone(),
            reason,
        };

        let status = row.status.parse::<JobStatus>().map_err(corrupt)?;
        let stage = row
            .stage
            .as_deref()
            .map(str::parse::<StageName>)
            .transpose()
            .map_err(corrupt)?;
        let result = row
            .result_json
            .as_deref()
            .map(serde_json::from_str::<JobResult>)
            .transpose()
            .map_err(|e| corrupt(format!("bad result: {}", e)))?;
        let parse_opt = |s: &Option<String>| {
            s.as_deref()
                .map(|v| parse_timestamp(v, "jobs", &row.id))
                .transpose()
        };

        Ok(Self {
            id: row.id.clone(),
            file_id: row.file_id.clone(),
            status,
            stage,
            stage_progress: row.stage_progress.min(100),
            sequence: row.sequence,
            message: row.message.clone(),
            created_at: parse_timestamp(&row.created_at, "jobs", &row.id)?,
            started_at: parse_opt(&row.started_at)?,
            completed_at: parse_opt(&row.completed_at)?,
            error_message: row.error_message.clone(),
            result,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_job_is_pending() {
        let job = Job::new("file-1");
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.sequence, 0);
        assert_eq!(job.overall_progress(), 0);
        assert!(job.started_at.is_none());
        assert!(!job.is_terminal());
    }

    #[test]
    fn test_overall_progress_follows_stage() {
        let mut job = Job::new("file-1");
        job.status = JobStatus::Processing;
        job.stage = Some(StageName::Analyzing);
        job.stage_progress = 50;
        assert_eq!(job.overall_progress(), 55);

        job.status = JobStatus::Failed;
        assert_eq!(job.overall_progress(), 55);

        job.status = JobStatus::Completed;
        assert_eq!(job.overall_progress(), 100);
    }

    #[test]
    fn test_row_round_trip() {
        let mut job = Job::new("file-9");
        job.status = JobStatus::Completed;
        job.stage = Some(StageName::Finalizing);
        job.stage_progress = 100;
        job.sequence = 12;
        job.started_at = Some(job.created_at);
        job.completed_at = Some(job.created_at);
        job.result = Some(JobResult {
            output_file_id: "out-1".to_string(),
            suggestion_count: 3,
            suggestions_by_category: BTreeMap::from([
                (SuggestionCategory::Spelling, 2),
                (SuggestionCategory::Style, 1),
            ]),
            elapsed_ms: 1500,
            cost_estimate: 0.25,
            prompt_tokens: 100,
            completion_tokens: 48,
        });

        let row = job.to_row();
        assert_eq!(row.status, "completed");
        assert_eq!(row.stage.as_deref(), Some("finalizing"));

        let mut restored = Job::from_row(&row).unwrap();
        // Stored timestamps carry millisecond precision.
        restored.created_at = job.created_at;
        restored.started_at = job.started_at;
        restored.completed_at = job.completed_at;
        assert_eq!(restored, job);
    }

    #[test]
    fn test_from_row_rejects_unknown_status() {
        let mut row = Job::new("file-1").to_row();
        row.status = "archived".to_string();
        assert!(matches!(
            Job::from_row(&row),
            Err(DatabaseError::CorruptRow { table: "jobs", .. })
        ));
    }

    #[test]
    fn test_result_serializes_camel_case() {
        let result = JobResult {
            output_file_id: "o".to_string(),
            suggestion_count: 1,
            suggestions_by_category: BTreeMap::from([(SuggestionCategory::Grammar, 1)]),
            elapsed_ms: 1,
            cost_estimate: 0.0,
            prompt_tokens: 0,
            completion_tokens: 0,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["outputFileId"], "o");
        assert_eq!(json["suggestionsByCategory"]["grammar"], 1);
    }
}

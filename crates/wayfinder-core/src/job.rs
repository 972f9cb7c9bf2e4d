use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::adapter::{ExtractOptions, ExtractionStats, Pagination};
use crate::dedup::DedupStats;
use crate::error::AppError;

pub const DEFAULT_PRIORITY: u8 = 5;
pub const DEFAULT_JOB_LIMIT: usize = 1000;

/// Status of an ingestion job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    /// Failed at least once and waiting to be re-queued.
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Retrying => "retrying",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "retrying" => Ok(JobStatus::Retrying),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            _ => Err(format!("Unknown job status: {}", s)),
        }
    }
}

/// What the pipeline does with records the dedup pass reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    /// Store them unchanged.
    Keep,
    /// Store them with `possible_duplicate_of` set.
    #[default]
    Flag,
    /// Leave them out of the stored batch.
    Drop,
}

impl FromStr for DuplicatePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "keep" => Ok(DuplicatePolicy::Keep),
            "flag" => Ok(DuplicatePolicy::Flag),
            "drop" => Ok(DuplicatePolicy::Drop),
            _ => Err(format!("Unknown duplicate policy: {}", s)),
        }
    }
}

/// Per-job switches for the pipeline stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    pub extract: ExtractOptions,
    pub dedup: bool,
    pub quality_filter: bool,
    pub save: bool,
    /// Overrides the pipeline's minimum quality score.
    pub min_quality_score: Option<f64>,
    pub duplicate_policy: DuplicatePolicy,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            extract: ExtractOptions::default().with_limit(DEFAULT_JOB_LIMIT),
            dedup: true,
            quality_filter: true,
            save: true,
            min_quality_score: None,
            duplicate_policy: DuplicatePolicy::default(),
        }
    }
}

/// One run of a job, kept for diagnosis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobAttempt {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub error: Option<String>,
    /// The source's breaker was open; nothing was fetched.
    pub deferred: bool,
}

/// Outcome of a completed job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub extracted: usize,
    pub duplicates: usize,
    pub dropped_duplicates: usize,
    pub filtered_low_quality: usize,
    pub stored: usize,
    pub average_quality: f64,
    pub pagination: Option<Pagination>,
    pub extraction: ExtractionStats,
    pub dedup: Option<DedupStats>,
    pub duration_ms: u64,
}

/// An ingestion job: one source, one set of options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub source: String,
    pub status: JobStatus,
    /// Higher runs first.
    pub priority: u8,
    pub options: JobOptions,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub result: Option<JobResult>,
    pub error: Option<String>,
    pub attempts: Vec<JobAttempt>,
}

impl Job {
    pub fn new(request: CreateJobRequest, default_max_retries: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: request.source,
            status: JobStatus::Queued,
            priority: request.priority.unwrap_or(DEFAULT_PRIORITY),
            options: request.options,
            retry_count: 0,
            max_retries: request.max_retries.unwrap_or(default_max_retries),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            next_attempt_at: None,
            result: None,
            error: None,
            attempts: Vec::new(),
        }
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

/// Request to create a new ingestion job.
#[derive(Debug, Clone)]
pub struct CreateJobRequest {
    pub source: String,
    pub priority: Option<u8>,
    pub options: JobOptions,
    pub max_retries: Option<u32>,
}

impl CreateJobRequest {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            priority: None,
            options: JobOptions::default(),
            max_retries: None,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.options.extract.limit = Some(limit);
        self
    }

    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = Some(max);
        self
    }
}

/// Orchestrator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Services per store call.
    pub batch_size: usize,
    pub max_concurrent_jobs: usize,
    pub retry_attempts: u32,
    #[serde(with = "duration_ms")]
    pub retry_delay: Duration,
    pub min_quality_score: f64,
    pub dedup_threshold: f64,
    /// Finished jobs kept for status queries; oldest evicted first.
    pub job_retention: usize,
    /// Upper bound on stored services loaded for cross-run dedup.
    pub existing_lookup_limit: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_concurrent_jobs: 3,
            retry_attempts: 3,
            retry_delay: Duration::from_millis(5000),
            min_quality_score: 0.3,
            dedup_threshold: 0.8,
            job_retention: 500,
            existing_lookup_limit: 10_000,
        }
    }
}

impl PipelineConfig {
    pub fn with_max_concurrent_jobs(mut self, n: usize) -> Self {
        self.max_concurrent_jobs = n;
        self
    }

    pub fn with_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.retry_attempts = attempts;
        self.retry_delay = delay;
        self
    }

    pub fn with_min_quality_score(mut self, score: f64) -> Self {
        self.min_quality_score = score;
        self
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.batch_size == 0 {
            return Err(AppError::ConfigError("batch_size must be at least 1".into()));
        }
        if self.max_concurrent_jobs == 0 {
            return Err(AppError::ConfigError(
                "max_concurrent_jobs must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.min_quality_score) {
            return Err(AppError::ConfigError(
                "min_quality_score must be in [0, 1]".into(),
            ));
        }
        if !(self.dedup_threshold > 0.0 && self.dedup_threshold <= 1.0) {
            return Err(AppError::ConfigError(
                "dedup_threshold must be in (0, 1]".into(),
            ));
        }
        Ok(())
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

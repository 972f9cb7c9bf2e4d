pub mod adapter;
pub mod circuit_breaker;
pub mod config;
pub mod dedup;
pub mod error;
pub mod error_handler;
pub mod job;
pub mod job_queue;
pub mod models;
pub mod normalize;
pub mod parser;
pub mod pipeline;
pub mod quality;
pub mod rate_limiter;
pub mod traits;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use adapter::{
    ExtractOptions, ExtractionResult, GenericAdapter, SourceAdapter, SourceMetadata,
    ValidationReport,
};
pub use circuit_breaker::{CircuitBreakerConfig, CircuitState};
pub use config::{SourceConfig, load_sources, parse_sources};
pub use dedup::{DedupConfig, DedupReport, DeduplicationEngine};
pub use error::AppError;
pub use error_handler::{ErrorHandler, ErrorHandlerConfig, RetryOptions, Severity};
pub use job::{CreateJobRequest, DuplicatePolicy, Job, JobOptions, JobStatus, PipelineConfig};
pub use models::{Category, ExportFormat, Service, compute_hash};
pub use pipeline::{
    ChannelReporter, PipelineEvent, PipelineManager, PipelineReporter, PipelineStats,
    TracingReporter,
};
pub use quality::{QualityAssessment, QualityConfig, QualityEngine, QualityLevel};
pub use rate_limiter::{RateLimit, RateLimiter};
pub use traits::{Fetcher, NullStore, ServiceFilter, ServiceStore};

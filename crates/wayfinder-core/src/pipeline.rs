//! The ingestion orchestrator.
//!
//! [`PipelineManager`] owns a priority queue of [`Job`]s and runs up to
//! `max_concurrent_jobs` of them as tokio tasks. Each job goes through
//! extract, dedup, quality scoring/filtering and store. Failed jobs are
//! re-queued ahead of their priority peers after `retry_delay`; a job whose
//! source breaker is open is deferred until the breaker's cool-down ends.
//!
//! Cancellation is cooperative: a running job checks its token between
//! stages and between store batches.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::adapter::{ExtractOptions, SourceAdapter, SourceMetadata, ValidationReport};
use crate::circuit_breaker::CircuitState;
use crate::dedup::{DedupConfig, DeduplicationEngine};
use crate::error::AppError;
use crate::error_handler::{ErrorHandler, ErrorHandlerConfig};
use crate::job::{
    CreateJobRequest, DuplicatePolicy, Job, JobAttempt, JobResult, JobStatus, PipelineConfig,
};
use crate::job_queue::PriorityJobQueue;
use crate::quality::{QualityConfig, QualityEngine};
use crate::traits::{ServiceFilter, ServiceStore};

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Job lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    JobQueued {
        job_id: Uuid,
        source: String,
        priority: u8,
    },
    JobStarted {
        job_id: Uuid,
        source: String,
        attempt: u32,
    },
    JobCompleted {
        job_id: Uuid,
        source: String,
        extracted: usize,
        stored: usize,
        duration_ms: u64,
    },
    JobRetrying {
        job_id: Uuid,
        source: String,
        error: String,
        retry_count: u32,
        delay: Duration,
    },
    /// The source's breaker was open; the job waits out the cool-down.
    JobDeferred {
        job_id: Uuid,
        source: String,
        retry_count: u32,
        delay: Duration,
    },
    JobFailed {
        job_id: Uuid,
        source: String,
        error: String,
        retry_count: u32,
    },
    JobCancelled {
        job_id: Uuid,
        source: String,
    },
    /// Nothing queued, running or waiting to retry.
    QueueIdle,
}

impl PipelineEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineEvent::JobQueued { .. } => "job_queued",
            PipelineEvent::JobStarted { .. } => "job_started",
            PipelineEvent::JobCompleted { .. } => "job_completed",
            PipelineEvent::JobRetrying { .. } => "job_retrying",
            PipelineEvent::JobDeferred { .. } => "job_deferred",
            PipelineEvent::JobFailed { .. } => "job_failed",
            PipelineEvent::JobCancelled { .. } => "job_cancelled",
            PipelineEvent::QueueIdle => "queue_idle",
        }
    }
}

/// Receives pipeline events (decoupled logging and monitoring).
pub trait PipelineReporter: Send + Sync {
    fn report(&self, event: &PipelineEvent) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl PipelineReporter for TracingReporter {
    fn report(&self, event: &PipelineEvent) {
        match event {
            PipelineEvent::JobQueued {
                job_id,
                source,
                priority,
            } => {
                tracing::info!(%job_id, %source, %priority, "Job queued");
            }
            PipelineEvent::JobStarted {
                job_id,
                source,
                attempt,
            } => {
                tracing::info!(%job_id, %source, %attempt, "Job started");
            }
            PipelineEvent::JobCompleted {
                job_id,
                source,
                extracted,
                stored,
                duration_ms,
            } => {
                tracing::info!(%job_id, %source, %extracted, %stored, %duration_ms, "Job completed");
            }
            PipelineEvent::JobRetrying {
                job_id,
                source,
                error,
                retry_count,
                delay,
            } => {
                tracing::warn!(%job_id, %source, %error, %retry_count, delay_ms = delay.as_millis() as u64, "Job failed, will retry");
            }
            PipelineEvent::JobDeferred {
                job_id,
                source,
                retry_count,
                delay,
            } => {
                tracing::warn!(%job_id, %source, %retry_count, delay_ms = delay.as_millis() as u64, "Circuit open, job deferred");
            }
            PipelineEvent::JobFailed {
                job_id,
                source,
                error,
                retry_count,
            } => {
                tracing::error!(%job_id, %source, %error, %retry_count, "Job failed");
            }
            PipelineEvent::JobCancelled { job_id, source } => {
                tracing::info!(%job_id, %source, "Job cancelled");
            }
            PipelineEvent::QueueIdle => {
                tracing::debug!("Queue idle");
            }
        }
    }
}

/// Forwards events over a bounded channel. Events are dropped with a
/// warning when the receiver falls behind.
#[derive(Debug, Clone)]
pub struct ChannelReporter {
    tx: mpsc::Sender<PipelineEvent>,
}

impl ChannelReporter {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<PipelineEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl PipelineReporter for ChannelReporter {
    fn report(&self, event: &PipelineEvent) {
        match self.tx.try_send(event.clone()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                tracing::warn!(event = dropped.kind(), "Pipeline event channel full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Stats and checks
// ---------------------------------------------------------------------------

/// Cumulative counters across every job since construction.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineStats {
    pub jobs_created: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_cancelled: u64,
    pub retries: u64,
    pub records_processed: u64,
    pub records_stored: u64,
    pub duplicates_found: u64,
    pub records_filtered: u64,
    pub total_processing_ms: u64,
    /// Mean duration of completed jobs.
    pub average_processing_ms: f64,
    pub active_jobs: usize,
    pub queued_jobs: usize,
    pub registered_sources: usize,
}

/// Health probe result for one registered source.
#[derive(Debug, Clone, Serialize)]
pub struct SourceCheck {
    pub source: String,
    pub validation: ValidationReport,
    pub metadata: SourceMetadata,
    /// Services returned by a five-record sample extraction.
    pub sample_size: usize,
    pub sample_error: Option<String>,
    pub breaker: CircuitState,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct PipelineBuilder<S> {
    store: S,
    config: PipelineConfig,
    quality: QualityConfig,
    errors: Option<ErrorHandler>,
    reporter: Arc<dyn PipelineReporter>,
    adapters: Vec<Arc<dyn SourceAdapter>>,
}

impl<S: ServiceStore + 'static> PipelineBuilder<S> {
    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_quality_config(mut self, config: QualityConfig) -> Self {
        self.quality = config;
        self
    }

    pub fn with_error_handler(mut self, errors: ErrorHandler) -> Self {
        self.errors = Some(errors);
        self
    }

    pub fn with_reporter(mut self, reporter: impl PipelineReporter + 'static) -> Self {
        self.reporter = Arc::new(reporter);
        self
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn SourceAdapter>) -> Self {
        self.adapters.push(adapter);
        self
    }

    pub fn build(self) -> Result<PipelineManager<S>, AppError> {
        self.config.validate()?;
        let quality = QualityEngine::new(self.quality)?;
        let dedup =
            DeduplicationEngine::new(DedupConfig::default().with_threshold(self.config.dedup_threshold))?;
        let errors = match self.errors {
            Some(errors) => errors,
            None => ErrorHandler::new(ErrorHandlerConfig::default())?,
        };

        let adapters = self
            .adapters
            .into_iter()
            .map(|a| (a.name().to_string(), a))
            .collect();

        Ok(PipelineManager {
            shared: Arc::new(Shared {
                config: self.config,
                store: self.store,
                quality,
                dedup,
                errors,
                reporter: self.reporter,
                adapters: RwLock::new(adapters),
                state: Mutex::new(State::default()),
                idle: Notify::new(),
                shutdown: CancellationToken::new(),
            }),
        })
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

struct Shared<S> {
    config: PipelineConfig,
    store: S,
    quality: QualityEngine,
    dedup: DeduplicationEngine,
    errors: ErrorHandler,
    reporter: Arc<dyn PipelineReporter>,
    adapters: RwLock<HashMap<String, Arc<dyn SourceAdapter>>>,
    state: Mutex<State>,
    idle: Notify,
    shutdown: CancellationToken,
}

#[derive(Default)]
struct State {
    queue: PriorityJobQueue,
    jobs: HashMap<Uuid, Job>,
    /// Terminal jobs in completion order, for retention.
    finished: VecDeque<Uuid>,
    active: HashMap<Uuid, CancellationToken>,
    /// Jobs sleeping before a retry.
    waiting: usize,
    stats: PipelineStats,
}

impl State {
    fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.active.is_empty() && self.waiting == 0
    }

    fn retire(&mut self, job_id: Uuid, retention: usize) {
        self.finished.push_back(job_id);
        while self.finished.len() > retention {
            if let Some(old) = self.finished.pop_front() {
                self.jobs.remove(&old);
            }
        }
    }

    /// Mark a job that is not running as cancelled.
    fn cancel_idle_job(&mut self, job_id: Uuid, retention: usize) -> Option<PipelineEvent> {
        let job = self.jobs.get_mut(&job_id)?;
        job.status = JobStatus::Cancelled;
        job.completed_at = Some(Utc::now());
        job.next_attempt_at = None;
        let source = job.source.clone();
        self.stats.jobs_cancelled += 1;
        self.retire(job_id, retention);
        Some(PipelineEvent::JobCancelled { job_id, source })
    }
}

fn checkpoint(token: &CancellationToken) -> Result<(), AppError> {
    if token.is_cancelled() {
        Err(AppError::Cancelled)
    } else {
        Ok(())
    }
}

/// Errors that a later attempt cannot fix.
fn is_permanent(error: &AppError) -> bool {
    matches!(
        error,
        AppError::Cancelled | AppError::ConfigError(_) | AppError::UnknownSource(_)
    )
}

/// Priority-queue job orchestrator. Cheap to clone; clones share state.
pub struct PipelineManager<S> {
    shared: Arc<Shared<S>>,
}

impl<S> Clone for PipelineManager<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: ServiceStore + 'static> PipelineManager<S> {
    pub fn builder(store: S) -> PipelineBuilder<S> {
        PipelineBuilder {
            store,
            config: PipelineConfig::default(),
            quality: QualityConfig::default(),
            errors: None,
            reporter: Arc::new(TracingReporter),
            adapters: Vec::new(),
        }
    }

    pub fn new(config: PipelineConfig, store: S) -> Result<Self, AppError> {
        Self::builder(store).with_config(config).build()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.shared.config
    }

    pub fn error_handler(&self) -> &ErrorHandler {
        &self.shared.errors
    }

    pub fn quality_engine(&self) -> &QualityEngine {
        &self.shared.quality
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.shared.state.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned pipeline state mutex");
            poisoned.into_inner()
        })
    }

    fn report_all(&self, events: &[PipelineEvent]) {
        for event in events {
            self.shared.reporter.report(event);
        }
    }

    // -- adapters ------------------------------------------------------------

    /// Register (or replace) the adapter for its source name.
    pub fn register_adapter(&self, adapter: Arc<dyn SourceAdapter>) -> Option<Arc<dyn SourceAdapter>> {
        let name = adapter.name().to_string();
        tracing::debug!(source = %name, "Registering adapter");
        self.shared
            .adapters
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(name, adapter)
    }

    pub fn adapter_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .shared
            .adapters
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    fn adapter(&self, name: &str) -> Option<Arc<dyn SourceAdapter>> {
        self.shared
            .adapters
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(name)
            .cloned()
    }

    /// Validate, describe and sample every registered source.
    ///
    /// Samples go through the source's circuit breaker like job extractions:
    /// an open breaker skips the sample, and sample outcomes are logged and
    /// counted toward the breaker.
    pub async fn check_sources(&self) -> Vec<SourceCheck> {
        let mut adapters: Vec<Arc<dyn SourceAdapter>> = self
            .shared
            .adapters
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect();
        adapters.sort_by(|a, b| a.name().cmp(b.name()));

        let mut checks = Vec::with_capacity(adapters.len());
        for adapter in adapters {
            let validation = adapter.validate().await;
            let metadata = adapter.metadata().await;
            let (sample_size, sample_error) = match self.sample(adapter.as_ref()).await {
                Ok(size) => (size, None),
                Err(e) => (0, Some(e.to_string())),
            };
            tracing::info!(source = %adapter.name(), valid = validation.is_valid, sample_size, "Source checked");
            checks.push(SourceCheck {
                source: adapter.name().to_string(),
                breaker: self.shared.errors.breaker_state(adapter.name()),
                validation,
                metadata,
                sample_size,
                sample_error,
            });
        }
        checks
    }

    async fn sample(&self, adapter: &dyn SourceAdapter) -> Result<usize, AppError> {
        let errors = &self.shared.errors;
        let source = adapter.name();
        errors.acquire(source)?;
        match adapter.extract(&ExtractOptions::default().with_limit(5)).await {
            Ok(sample) => {
                errors.record_success(source);
                Ok(sample.services.len())
            }
            Err(e) => {
                errors.log(&e, source, serde_json::json!({ "stage": "sample" }));
                Err(e)
            }
        }
    }

    // -- control surface -----------------------------------------------------

    /// Queue a job and start it if a slot is free. Must be called from
    /// within a tokio runtime.
    pub async fn create_job(&self, request: CreateJobRequest) -> Result<Uuid, AppError> {
        if self.shared.shutdown.is_cancelled() {
            return Err(AppError::Cancelled);
        }
        if self.adapter(&request.source).is_none() {
            return Err(AppError::UnknownSource(request.source));
        }
        if let Some(min) = request.options.min_quality_score
            && !(0.0..=1.0).contains(&min)
        {
            return Err(AppError::ValidationError(format!(
                "min_quality_score must be in [0, 1] (got {min})"
            )));
        }

        let job = Job::new(request, self.shared.config.retry_attempts);
        let job_id = job.id;
        let event = PipelineEvent::JobQueued {
            job_id,
            source: job.source.clone(),
            priority: job.priority,
        };
        {
            let mut state = self.lock_state();
            state.queue.push(job_id, job.priority);
            state.jobs.insert(job_id, job);
            state.stats.jobs_created += 1;
        }
        self.shared.reporter.report(&event);
        self.pump();
        Ok(job_id)
    }

    /// Cancel a job. Queued and retry-waiting jobs are cancelled at once;
    /// a running job is signalled and stops at its next checkpoint.
    /// Returns `false` for unknown or already finished jobs.
    pub fn cancel_job(&self, job_id: Uuid) -> bool {
        let retention = self.shared.config.job_retention;
        let (accepted, event) = {
            let mut guard = self.lock_state();
            let state = &mut *guard;
            match state.jobs.get(&job_id).map(|j| j.status) {
                Some(JobStatus::Queued | JobStatus::Retrying) => {
                    state.queue.remove(job_id);
                    (true, state.cancel_idle_job(job_id, retention))
                }
                Some(JobStatus::Running) => {
                    if let Some(token) = state.active.get(&job_id) {
                        token.cancel();
                    }
                    tracing::info!(%job_id, "Cancellation requested for running job");
                    (true, None)
                }
                _ => (false, None),
            }
        };
        if let Some(event) = event {
            self.shared.reporter.report(&event);
        }
        if accepted {
            self.pump();
        }
        accepted
    }

    pub fn get_job_status(&self, job_id: Uuid) -> Option<Job> {
        self.lock_state().jobs.get(&job_id).cloned()
    }

    /// All retained jobs, newest first.
    pub fn get_all_jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.lock_state().jobs.values().cloned().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    pub fn get_stats(&self) -> PipelineStats {
        let registered = self.adapter_names().len();
        let state = self.lock_state();
        let mut stats = state.stats.clone();
        stats.active_jobs = state.active.len();
        stats.queued_jobs = state.queue.len();
        stats.registered_sources = registered;
        if stats.jobs_completed > 0 {
            stats.average_processing_ms = stats.total_processing_ms as f64 / stats.jobs_completed as f64;
        }
        stats
    }

    /// Resolve once nothing is queued, running or waiting to retry.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.lock_state().is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Cancel queued jobs, signal running ones and wait for them to stop.
    /// New jobs are refused afterwards.
    pub async fn shutdown(&self) {
        tracing::info!("Pipeline shutting down");
        let retention = self.shared.config.job_retention;
        let events: Vec<PipelineEvent> = {
            let mut state = self.lock_state();
            let queued = state.queue.drain();
            queued
                .into_iter()
                .filter_map(|id| state.cancel_idle_job(id, retention))
                .collect()
        };
        self.report_all(&events);
        self.shared.shutdown.cancel();
        self.pump();
        self.wait_idle().await;
        tracing::info!("Pipeline stopped");
    }

    // -- scheduling ----------------------------------------------------------

    /// Start queued jobs while slots are free; announce idleness.
    fn pump(&self) {
        let mut events = Vec::new();
        let mut launches = Vec::new();
        let idle = {
            let mut guard = self.lock_state();
            let state = &mut *guard;
            while state.active.len() < self.shared.config.max_concurrent_jobs {
                let Some(job_id) = state.queue.pop() else {
                    break;
                };
                let Some(job) = state.jobs.get_mut(&job_id) else {
                    continue;
                };
                job.status = JobStatus::Running;
                job.started_at = Some(Utc::now());
                job.next_attempt_at = None;
                events.push(PipelineEvent::JobStarted {
                    job_id,
                    source: job.source.clone(),
                    attempt: job.retry_count + 1,
                });
                let token = self.shared.shutdown.child_token();
                state.active.insert(job_id, token.clone());
                launches.push((job_id, token));
            }
            state.is_idle()
        };

        self.report_all(&events);
        for (job_id, token) in launches {
            let this = self.clone();
            tokio::spawn(async move { this.run_job(job_id, token).await });
        }
        if idle {
            self.shared.reporter.report(&PipelineEvent::QueueIdle);
            self.shared.idle.notify_waiters();
        }
    }

    async fn run_job(self, job_id: Uuid, token: CancellationToken) {
        let started_at = Utc::now();
        let clock = Instant::now();
        let Some(job) = self.get_job_status(job_id) else {
            self.lock_state().active.remove(&job_id);
            self.pump();
            return;
        };

        let mut result = JobResult::default();
        let outcome = match self.adapter(&job.source) {
            Some(adapter) => self.process(&job, adapter, &token, &mut result).await,
            None => Err(AppError::UnknownSource(job.source.clone())),
        };
        result.duration_ms = clock.elapsed().as_millis() as u64;

        if let Some((delay, priority)) =
            self.finish(job_id, started_at, outcome, result, token.is_cancelled())
        {
            self.schedule_retry(job_id, priority, delay);
        }
        self.pump();
    }

    /// Record the outcome of one attempt. Returns `(delay, priority)` when
    /// the job should be re-queued.
    fn finish(
        &self,
        job_id: Uuid,
        started_at: DateTime<Utc>,
        outcome: Result<(), AppError>,
        result: JobResult,
        cancelled: bool,
    ) -> Option<(Duration, u8)> {
        let config = &self.shared.config;
        let cancelled = cancelled || matches!(outcome, Err(AppError::Cancelled));
        let mut events = Vec::new();
        let mut retry = None;
        {
            let mut guard = self.lock_state();
            let state = &mut *guard;
            state.active.remove(&job_id);
            // Record counters come from the final attempt only.
            let counts = (
                result.extracted as u64,
                result.stored as u64,
                result.duplicates as u64,
                result.filtered_low_quality as u64,
            );

            let job = state.jobs.get_mut(&job_id)?;
            let now = Utc::now();
            job.attempts.push(JobAttempt {
                attempt: job.retry_count + 1,
                started_at,
                finished_at: now,
                error: outcome.as_ref().err().map(ToString::to_string),
                deferred: matches!(outcome, Err(AppError::CircuitOpen { .. })),
            });
            let source = job.source.clone();

            let terminal = match outcome {
                Ok(()) => {
                    job.status = JobStatus::Completed;
                    job.completed_at = Some(now);
                    job.error = None;
                    state.stats.jobs_completed += 1;
                    state.stats.total_processing_ms += result.duration_ms;
                    events.push(PipelineEvent::JobCompleted {
                        job_id,
                        source,
                        extracted: result.extracted,
                        stored: result.stored,
                        duration_ms: result.duration_ms,
                    });
                    job.result = Some(result);
                    true
                }
                Err(_) if cancelled => {
                    job.status = JobStatus::Cancelled;
                    job.completed_at = Some(now);
                    job.result = Some(result);
                    state.stats.jobs_cancelled += 1;
                    events.push(PipelineEvent::JobCancelled { job_id, source });
                    true
                }
                Err(e) if job.can_retry() && !is_permanent(&e) => {
                    job.retry_count += 1;
                    job.status = JobStatus::Retrying;
                    job.error = Some(e.to_string());
                    let delay = match &e {
                        AppError::CircuitOpen { retry_after, .. } => (*retry_after).max(config.retry_delay),
                        _ => config.retry_delay,
                    };
                    job.next_attempt_at = Some(
                        now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::TimeDelta::zero()),
                    );
                    state.waiting += 1;
                    state.stats.retries += 1;
                    events.push(match e {
                        AppError::CircuitOpen { .. } => PipelineEvent::JobDeferred {
                            job_id,
                            source,
                            retry_count: job.retry_count,
                            delay,
                        },
                        other => PipelineEvent::JobRetrying {
                            job_id,
                            source,
                            error: other.to_string(),
                            retry_count: job.retry_count,
                            delay,
                        },
                    });
                    retry = Some((delay, job.priority));
                    false
                }
                Err(e) => {
                    job.status = JobStatus::Failed;
                    job.completed_at = Some(now);
                    job.error = Some(e.to_string());
                    job.result = Some(result);
                    state.stats.jobs_failed += 1;
                    events.push(PipelineEvent::JobFailed {
                        job_id,
                        source,
                        error: e.to_string(),
                        retry_count: job.retry_count,
                    });
                    true
                }
            };
            if terminal {
                let (processed, stored, duplicates, filtered) = counts;
                state.stats.records_processed += processed;
                state.stats.records_stored += stored;
                state.stats.duplicates_found += duplicates;
                state.stats.records_filtered += filtered;
                state.retire(job_id, config.job_retention);
            }
        }
        self.report_all(&events);
        retry
    }

    fn schedule_retry(&self, job_id: Uuid, priority: u8, delay: Duration) {
        let this = self.clone();
        tokio::spawn(async move {
            let shutdown = this.shared.shutdown.clone();
            let aborted = tokio::select! {
                () = tokio::time::sleep(delay) => false,
                () = shutdown.cancelled() => true,
            };
            let event = {
                let mut guard = this.lock_state();
                let state = &mut *guard;
                state.waiting = state.waiting.saturating_sub(1);
                let still_waiting = state
                    .jobs
                    .get(&job_id)
                    .is_some_and(|j| j.status == JobStatus::Retrying);
                if !still_waiting {
                    None
                } else if aborted {
                    state.cancel_idle_job(job_id, this.shared.config.job_retention)
                } else {
                    if let Some(job) = state.jobs.get_mut(&job_id) {
                        job.status = JobStatus::Queued;
                    }
                    state.queue.push_front(job_id, priority);
                    None
                }
            };
            if let Some(event) = event {
                this.shared.reporter.report(&event);
            }
            this.pump();
        });
    }

    // -- job body ------------------------------------------------------------

    async fn process(
        &self,
        job: &Job,
        adapter: Arc<dyn SourceAdapter>,
        token: &CancellationToken,
        result: &mut JobResult,
    ) -> Result<(), AppError> {
        let source = job.source.as_str();
        let options = &job.options;
        let shared = &self.shared;
        checkpoint(token)?;

        shared.errors.acquire(source)?;
        let extraction = match adapter.extract(&options.extract).await {
            Ok(extraction) => {
                shared.errors.record_success(source);
                extraction
            }
            Err(e) => {
                shared.errors.log(
                    &e,
                    source,
                    serde_json::json!({
                        "job_id": job.id,
                        "attempt": job.retry_count + 1,
                        "stage": "extract",
                    }),
                );
                return Err(e);
            }
        };
        let mut services = extraction.services;
        result.extracted = services.len();
        result.pagination = Some(extraction.pagination);
        result.extraction = extraction.stats;
        tracing::debug!(job_id = %job.id, %source, extracted = result.extracted, "Extraction stage done");

        checkpoint(token)?;
        if options.dedup && !services.is_empty() {
            let filter = ServiceFilter {
                limit: Some(shared.config.existing_lookup_limit),
                ..Default::default()
            };
            let existing = match shared.store.existing_services(&filter).await {
                Ok(existing) => existing,
                Err(e) => {
                    tracing::warn!(job_id = %job.id, %source, error = %e, "Failed to load existing services, deduplicating within the batch only");
                    Vec::new()
                }
            };
            let report = shared.dedup.find_duplicates(&services, &existing);
            let duplicate_ids = report.duplicate_ids();
            result.duplicates = duplicate_ids.len();
            match options.duplicate_policy {
                DuplicatePolicy::Keep => {}
                DuplicatePolicy::Flag => {
                    for service in &mut services {
                        if let Some(pair) = report.best_match(service.id) {
                            service.possible_duplicate_of = Some(pair.matched_id);
                        }
                    }
                }
                DuplicatePolicy::Drop => {
                    let before = services.len();
                    services.retain(|s| !duplicate_ids.contains(&s.id));
                    result.dropped_duplicates = before - services.len();
                }
            }
            result.dedup = Some(report.stats);
        }

        checkpoint(token)?;
        let min_score = options
            .min_quality_score
            .unwrap_or(shared.config.min_quality_score);
        let batch = shared.quality.assess_batch(&services);
        let mut kept = Vec::with_capacity(services.len());
        let mut assessments = Vec::with_capacity(services.len());
        for (mut service, assessment) in services.into_iter().zip(batch.assessments) {
            if options.quality_filter && assessment.overall_score < min_score {
                result.filtered_low_quality += 1;
                continue;
            }
            service.completeness_score = assessment.completeness_score;
            service.verification_score = (assessment.overall_score * 100.0).round().clamp(0.0, 100.0) as u8;
            kept.push(service);
            assessments.push(assessment);
        }
        if !assessments.is_empty() {
            result.average_quality =
                assessments.iter().map(|a| a.overall_score).sum::<f64>() / assessments.len() as f64;
        }

        if options.save {
            let size = shared.config.batch_size;
            for (services, assessments) in kept.chunks(size).zip(assessments.chunks(size)) {
                checkpoint(token)?;
                match shared.store.store(services, assessments).await {
                    Ok(n) => result.stored += n,
                    Err(e) => {
                        let e = match e {
                            AppError::PersistenceError(_) => e,
                            other => AppError::PersistenceError(other.to_string()),
                        };
                        tracing::error!(job_id = %job.id, %source, stored = result.stored, error = %e, "Store failed");
                        return Err(e);
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::Semaphore;

    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::job::JobOptions;
    use crate::testutil::{FixtureAdapter, MockReporter, MockStore, ServiceBuilder, sample_service};

    fn manager(
        store: MockStore,
        config: PipelineConfig,
        adapters: &[Arc<FixtureAdapter>],
    ) -> (PipelineManager<MockStore>, MockReporter) {
        let reporter = MockReporter::new();
        let mut builder = PipelineManager::builder(store)
            .with_config(config)
            .with_reporter(reporter.clone());
        for adapter in adapters {
            builder = builder.with_adapter(adapter.clone());
        }
        (builder.build().unwrap(), reporter)
    }

    fn fast_retries() -> PipelineConfig {
        PipelineConfig::default().with_retry(3, Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_job_runs_all_stages_and_stores() {
        let adapter = Arc::new(FixtureAdapter::new(
            "fixture",
            vec![
                sample_service("Youth Legal Advice Line"),
                sample_service("Duty Lawyer Court Support"),
            ],
        ));
        let store = MockStore::new();
        let (pm, reporter) = manager(store.clone(), PipelineConfig::default(), &[adapter]);

        let id = pm.create_job(CreateJobRequest::new("fixture")).await.unwrap();
        pm.wait_idle().await;

        let job = pm.get_job_status(id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        let result = job.result.unwrap();
        assert_eq!(result.extracted, 2);
        assert_eq!(result.stored, 2);
        assert_eq!(result.duplicates, 0);
        assert_eq!(result.pagination.unwrap().total, 2);

        let stored = store.stored_services();
        assert_eq!(stored.len(), 2);
        for s in &stored {
            assert!(s.verification_score > 30);
            assert!(s.completeness_score > 0.9);
        }
        assert_eq!(store.assessments.lock().unwrap().len(), 2);

        let stats = pm.get_stats();
        assert_eq!(stats.jobs_completed, 1);
        assert_eq!(stats.records_processed, 2);
        assert_eq!(stats.records_stored, 2);
        assert_eq!(stats.active_jobs, 0);
        assert_eq!(
            reporter.kinds(),
            vec!["job_queued", "job_started", "job_completed", "queue_idle"]
        );
    }

    #[tokio::test]
    async fn test_unknown_source_rejected() {
        let (pm, _) = manager(MockStore::new(), PipelineConfig::default(), &[]);
        let err = pm.create_job(CreateJobRequest::new("nowhere")).await.unwrap_err();
        assert!(matches!(err, AppError::UnknownSource(_)));
        assert_eq!(pm.get_stats().jobs_created, 0);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let result = PipelineManager::new(
            PipelineConfig::default().with_max_concurrent_jobs(0),
            MockStore::new(),
        );
        assert!(matches!(result, Err(AppError::ConfigError(_))));
    }

    #[tokio::test]
    async fn test_higher_priority_starts_first() {
        let gate = Arc::new(Semaphore::new(0));
        let blocker = Arc::new(FixtureAdapter::new("blocker", vec![]).with_gate(gate.clone()));
        let fixture = Arc::new(FixtureAdapter::new("fixture", vec![sample_service("Youth Legal Advice Line")]));
        let (pm, reporter) = manager(
            MockStore::new(),
            PipelineConfig::default().with_max_concurrent_jobs(1),
            &[blocker, fixture],
        );

        let first = pm.create_job(CreateJobRequest::new("blocker")).await.unwrap();
        let low = pm
            .create_job(CreateJobRequest::new("fixture").with_priority(1))
            .await
            .unwrap();
        let high = pm
            .create_job(CreateJobRequest::new("fixture").with_priority(9))
            .await
            .unwrap();
        assert_eq!(pm.get_job_status(low).unwrap().status, JobStatus::Queued);
        assert_eq!(pm.get_stats().queued_jobs, 2);

        gate.add_permits(1);
        pm.wait_idle().await;
        assert_eq!(reporter.started(), vec![first, high, low]);
    }

    #[tokio::test]
    async fn test_concurrency_bound() {
        let gate = Arc::new(Semaphore::new(0));
        let adapter = Arc::new(FixtureAdapter::new("slow", vec![]).with_gate(gate.clone()));
        let (pm, _) = manager(
            MockStore::new(),
            PipelineConfig::default().with_max_concurrent_jobs(2),
            &[adapter],
        );
        for _ in 0..5 {
            pm.create_job(CreateJobRequest::new("slow")).await.unwrap();
        }
        let stats = pm.get_stats();
        assert_eq!(stats.active_jobs, 2);
        assert_eq!(stats.queued_jobs, 3);

        gate.add_permits(5);
        pm.wait_idle().await;
        assert_eq!(pm.get_stats().jobs_completed, 5);
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let adapter = Arc::new(
            FixtureAdapter::new("flaky", vec![sample_service("Youth Legal Advice Line")])
                .fail_times(2, AppError::NetworkError("connection reset".into())),
        );
        let (pm, reporter) = manager(MockStore::new(), fast_retries(), &[adapter.clone()]);

        let id = pm.create_job(CreateJobRequest::new("flaky")).await.unwrap();
        pm.wait_idle().await;

        let job = pm.get_job_status(id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.retry_count, 2);
        assert_eq!(job.attempts.len(), 3);
        assert!(job.attempts[0].error.as_deref().unwrap().contains("connection reset"));
        assert!(job.attempts[2].error.is_none());
        assert_eq!(adapter.extract_calls(), 3);
        assert_eq!(
            reporter.kinds().iter().filter(|k| **k == "job_retrying").count(),
            2
        );
        assert_eq!(pm.get_stats().retries, 2);
    }

    #[tokio::test]
    async fn test_retries_exhausted_marks_failed() {
        let adapter = Arc::new(FixtureAdapter::new("down", vec![]).fail_times(10, AppError::Timeout(30)));
        let (pm, reporter) = manager(
            MockStore::new(),
            PipelineConfig::default().with_retry(2, Duration::from_millis(5)),
            &[adapter.clone()],
        );

        let id = pm.create_job(CreateJobRequest::new("down")).await.unwrap();
        pm.wait_idle().await;

        let job = pm.get_job_status(id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, 2);
        assert_eq!(job.attempts.len(), 3);
        assert!(job.error.unwrap().contains("timed out"));
        assert_eq!(adapter.extract_calls(), 3);
        assert_eq!(pm.get_stats().jobs_failed, 1);
        assert!(reporter.kinds().contains(&"job_failed"));
    }

    #[tokio::test]
    async fn test_open_circuit_defers_job() {
        let errors = ErrorHandler::new(ErrorHandlerConfig {
            breaker: CircuitBreakerConfig {
                failure_threshold: 1,
                cooldown: Duration::from_millis(60),
            },
            ..Default::default()
        })
        .unwrap();
        let adapter = Arc::new(
            FixtureAdapter::new("guarded", vec![sample_service("Youth Legal Advice Line")])
                .fail_times(1, AppError::AuthError("401".into())),
        );
        let reporter = MockReporter::new();
        let pm = PipelineManager::builder(MockStore::new())
            .with_config(fast_retries())
            .with_error_handler(errors)
            .with_reporter(reporter.clone())
            .with_adapter(adapter.clone())
            .build()
            .unwrap();

        let id = pm.create_job(CreateJobRequest::new("guarded")).await.unwrap();
        pm.wait_idle().await;

        let job = pm.get_job_status(id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(adapter.extract_calls(), 2);
        assert_eq!(job.attempts.iter().filter(|a| a.deferred).count(), 1);
        assert!(reporter.kinds().contains(&"job_deferred"));
        assert_eq!(pm.error_handler().breaker_state("guarded"), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_cancel_queued_job() {
        let gate = Arc::new(Semaphore::new(0));
        let blocker = Arc::new(FixtureAdapter::new("blocker", vec![]).with_gate(gate.clone()));
        let fixture = Arc::new(FixtureAdapter::new("fixture", vec![sample_service("Youth Legal Advice Line")]));
        let (pm, _) = manager(
            MockStore::new(),
            PipelineConfig::default().with_max_concurrent_jobs(1),
            &[blocker, fixture.clone()],
        );

        pm.create_job(CreateJobRequest::new("blocker")).await.unwrap();
        let queued = pm.create_job(CreateJobRequest::new("fixture")).await.unwrap();
        assert!(pm.cancel_job(queued));
        assert!(!pm.cancel_job(queued));
        assert_eq!(pm.get_job_status(queued).unwrap().status, JobStatus::Cancelled);

        gate.add_permits(1);
        pm.wait_idle().await;
        assert_eq!(fixture.extract_calls(), 0);
        assert_eq!(pm.get_stats().jobs_cancelled, 1);
        assert!(!pm.cancel_job(Uuid::new_v4()));
    }

    #[tokio::test]
    async fn test_cancel_running_job_stops_at_checkpoint() {
        let gate = Arc::new(Semaphore::new(0));
        let adapter = Arc::new(
            FixtureAdapter::new("slow", vec![sample_service("Youth Legal Advice Line")]).with_gate(gate.clone()),
        );
        let store = MockStore::new();
        let (pm, _) = manager(store.clone(), PipelineConfig::default(), &[adapter]);

        let id = pm.create_job(CreateJobRequest::new("slow")).await.unwrap();
        assert_eq!(pm.get_job_status(id).unwrap().status, JobStatus::Running);
        assert!(pm.cancel_job(id));

        gate.add_permits(1);
        pm.wait_idle().await;
        assert_eq!(pm.get_job_status(id).unwrap().status, JobStatus::Cancelled);
        assert!(store.stored_services().is_empty());
    }

    #[tokio::test]
    async fn test_quality_filter_drops_low_scores() {
        let weak = ServiceBuilder::new("Bare Minimum Service")
            .data_source("unknown")
            .phone("123")
            .build();
        let adapter = Arc::new(FixtureAdapter::new(
            "mixed",
            vec![sample_service("Youth Legal Advice Line"), weak],
        ));
        let store = MockStore::new();
        let (pm, _) = manager(store.clone(), PipelineConfig::default(), &[adapter]);

        let options = JobOptions {
            min_quality_score: Some(0.6),
            ..Default::default()
        };
        let id = pm
            .create_job(CreateJobRequest::new("mixed").with_options(options))
            .await
            .unwrap();
        pm.wait_idle().await;

        let result = pm.get_job_status(id).unwrap().result.unwrap();
        assert_eq!(result.filtered_low_quality, 1);
        assert_eq!(result.stored, 1);
        assert_eq!(store.stored_services()[0].name, "Youth Legal Advice Line");
        let stats = pm.get_stats();
        assert!(stats.records_processed >= stats.records_stored);
    }

    #[tokio::test]
    async fn test_duplicate_policies() {
        let existing = sample_service("Youth Legal Advice Line");

        let flagged = MockStore::with_existing(vec![existing.clone()]);
        let adapter = Arc::new(FixtureAdapter::new("dupes", vec![sample_service("Youth Legal Advice Line")]));
        let (pm, _) = manager(flagged.clone(), PipelineConfig::default(), &[adapter.clone()]);
        pm.create_job(CreateJobRequest::new("dupes")).await.unwrap();
        pm.wait_idle().await;
        let stored = flagged.stored_services();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].possible_duplicate_of, Some(existing.id));

        let dropped = MockStore::with_existing(vec![existing.clone()]);
        let (pm, _) = manager(dropped.clone(), PipelineConfig::default(), &[adapter]);
        let options = JobOptions {
            duplicate_policy: DuplicatePolicy::Drop,
            ..Default::default()
        };
        let id = pm
            .create_job(CreateJobRequest::new("dupes").with_options(options))
            .await
            .unwrap();
        pm.wait_idle().await;
        let result = pm.get_job_status(id).unwrap().result.unwrap();
        assert_eq!(result.duplicates, 1);
        assert_eq!(result.dropped_duplicates, 1);
        assert_eq!(result.stored, 0);
        assert!(dropped.stored_services().is_empty());
    }

    #[tokio::test]
    async fn test_existing_lookup_failure_is_not_fatal() {
        let store = MockStore::new().fail_lookup(AppError::PersistenceError("db down".into()));
        let adapter = Arc::new(FixtureAdapter::new("fixture", vec![sample_service("Youth Legal Advice Line")]));
        let (pm, _) = manager(store.clone(), PipelineConfig::default(), &[adapter]);
        let id = pm.create_job(CreateJobRequest::new("fixture")).await.unwrap();
        pm.wait_idle().await;
        assert_eq!(pm.get_job_status(id).unwrap().status, JobStatus::Completed);
        assert_eq!(store.stored_services().len(), 1);
    }

    #[tokio::test]
    async fn test_store_failure_retries_as_persistence_error() {
        let store = MockStore::new().fail_next_store(AppError::Generic("disk full".into()));
        let adapter = Arc::new(FixtureAdapter::new("fixture", vec![sample_service("Youth Legal Advice Line")]));
        let (pm, _) = manager(store.clone(), fast_retries(), &[adapter]);
        let id = pm.create_job(CreateJobRequest::new("fixture")).await.unwrap();
        pm.wait_idle().await;

        let job = pm.get_job_status(id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.attempts[0].error.as_deref().unwrap().contains("disk full"));
        assert_eq!(store.store_calls.load(std::sync::atomic::Ordering::SeqCst), 2);
        assert_eq!(store.stored_services().len(), 1);
    }

    #[tokio::test]
    async fn test_retried_attempt_not_counted_twice() {
        let store = MockStore::new().fail_next_store(AppError::PersistenceError("connection reset".into()));
        let adapter = Arc::new(FixtureAdapter::new(
            "fixture",
            vec![
                sample_service("Youth Legal Advice Line"),
                sample_service("Duty Lawyer Court Support"),
                sample_service("Youth Housing Referral"),
            ],
        ));
        let (pm, _) = manager(store, fast_retries(), &[adapter]);
        let id = pm.create_job(CreateJobRequest::new("fixture")).await.unwrap();
        pm.wait_idle().await;

        let job = pm.get_job_status(id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempts.len(), 2);
        let result = job.result.unwrap();

        let stats = pm.get_stats();
        assert_eq!(stats.retries, 1);
        assert_eq!(stats.records_processed, result.extracted as u64);
        assert_eq!(stats.records_processed, 3);
        assert_eq!(stats.records_stored, 3);
    }

    #[tokio::test]
    async fn test_failed_job_counts_last_attempt_only() {
        let store = MockStore::new()
            .fail_next_store(AppError::PersistenceError("connection reset".into()))
            .fail_next_store(AppError::PersistenceError("connection reset".into()));
        let adapter = Arc::new(FixtureAdapter::new("fixture", vec![sample_service("Youth Legal Advice Line")]));
        let (pm, _) = manager(
            store,
            PipelineConfig::default().with_retry(1, Duration::from_millis(10)),
            &[adapter],
        );
        let id = pm.create_job(CreateJobRequest::new("fixture")).await.unwrap();
        pm.wait_idle().await;

        assert_eq!(pm.get_job_status(id).unwrap().status, JobStatus::Failed);
        let stats = pm.get_stats();
        assert_eq!(stats.jobs_failed, 1);
        assert_eq!(stats.records_processed, 1);
        assert_eq!(stats.records_stored, 0);
    }

    #[tokio::test]
    async fn test_channel_reporter_preserves_order() {
        let (reporter, mut rx) = ChannelReporter::new(16);
        let adapter: Arc<dyn SourceAdapter> = Arc::new(FixtureAdapter::new("fixture", vec![]));
        let pm = PipelineManager::builder(MockStore::new())
            .with_reporter(reporter)
            .with_adapter(adapter)
            .build()
            .unwrap();

        let id = pm.create_job(CreateJobRequest::new("fixture")).await.unwrap();
        pm.wait_idle().await;

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.kind());
        }
        assert_eq!(kinds, vec!["job_queued", "job_started", "job_completed", "queue_idle"]);
        assert_eq!(pm.get_job_status(id).unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_everything() {
        let gate = Arc::new(Semaphore::new(0));
        let adapter = Arc::new(FixtureAdapter::new("slow", vec![]).with_gate(gate.clone()));
        let (pm, _) = manager(
            MockStore::new(),
            PipelineConfig::default().with_max_concurrent_jobs(1),
            &[adapter],
        );
        let running = pm.create_job(CreateJobRequest::new("slow")).await.unwrap();
        let queued = pm.create_job(CreateJobRequest::new("slow")).await.unwrap();

        let shutdown = pm.shutdown();
        tokio::pin!(shutdown);
        assert!(
            tokio::time::timeout(Duration::from_millis(20), &mut shutdown)
                .await
                .is_err()
        );
        gate.add_permits(1);
        shutdown.await;

        assert_eq!(pm.get_job_status(queued).unwrap().status, JobStatus::Cancelled);
        assert_eq!(pm.get_job_status(running).unwrap().status, JobStatus::Cancelled);
        assert!(matches!(
            pm.create_job(CreateJobRequest::new("slow")).await,
            Err(AppError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_check_sources() {
        let good = Arc::new(FixtureAdapter::random("alpha", 12));
        let bad = Arc::new(FixtureAdapter::new("beta", vec![]).invalid());
        let (pm, _) = manager(MockStore::new(), PipelineConfig::default(), &[bad, good]);

        assert_eq!(pm.adapter_names(), vec!["alpha", "beta"]);
        let checks = pm.check_sources().await;
        assert_eq!(checks.len(), 2);
        assert_eq!(checks[0].source, "alpha");
        assert!(checks[0].validation.is_valid);
        assert_eq!(checks[0].sample_size, 5);
        assert_eq!(checks[0].metadata.estimated_records, Some(12));
        assert!(!checks[1].validation.is_valid);
        assert_eq!(checks[1].breaker, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_check_sources_feeds_breaker() {
        let flaky = Arc::new(FixtureAdapter::new("flaky", vec![]).fail_times(1, AppError::AuthError("expired key".into())));
        let breaker = CircuitBreakerConfig {
            failure_threshold: 1,
            cooldown: Duration::from_secs(60),
        };
        let errors = ErrorHandler::new(ErrorHandlerConfig {
            breaker,
            ..Default::default()
        })
        .unwrap();
        let pm = PipelineManager::builder(MockStore::new())
            .with_error_handler(errors)
            .with_adapter(flaky.clone())
            .build()
            .unwrap();

        let checks = pm.check_sources().await;
        assert!(checks[0].sample_error.as_deref().unwrap().contains("expired key"));
        assert_eq!(checks[0].breaker, CircuitState::Open);
        assert_eq!(pm.error_handler().source_stats("flaky").total, 1);

        // The open breaker short-circuits the next sample without calling out.
        let checks = pm.check_sources().await;
        assert!(checks[0].sample_error.is_some());
        assert_eq!(flaky.extract_calls(), 1);
    }

    #[tokio::test]
    async fn test_finished_jobs_retained_up_to_limit() {
        let adapter = Arc::new(FixtureAdapter::new("fixture", vec![]));
        let config = PipelineConfig {
            job_retention: 2,
            ..Default::default()
        };
        let (pm, _) = manager(MockStore::new(), config, &[adapter]);

        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(pm.create_job(CreateJobRequest::new("fixture")).await.unwrap());
            pm.wait_idle().await;
        }
        assert!(pm.get_job_status(ids[0]).is_none());
        let all = pm.get_all_jobs();
        assert_eq!(all.len(), 2);
        assert!(all[0].created_at >= all[1].created_at);
        assert_eq!(pm.get_stats().jobs_completed, 3);
    }

    #[tokio::test]
    async fn test_register_adapter_replaces_by_name() {
        let (pm, _) = manager(MockStore::new(), PipelineConfig::default(), &[]);
        assert!(pm.register_adapter(Arc::new(FixtureAdapter::new("one", vec![]))).is_none());
        assert!(pm.register_adapter(Arc::new(FixtureAdapter::new("one", vec![]))).is_some());
        assert_eq!(pm.get_stats().registered_sources, 1);
    }
}

//! Error classification, logging and retry for source calls.
//!
//! [`ErrorHandler`] owns the per-source [`CircuitBreakerTable`], keeps
//! per-source error statistics and a bounded in-memory log, and optionally
//! appends JSON-lines entries to a size-rotated log file.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::future::Future;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::circuit_breaker::{
    CircuitBreakerConfig, CircuitBreakerStats, CircuitBreakerTable, CircuitState,
};
use crate::error::AppError;
use crate::models::ExportFormat;

/// How bad an error is for the source that produced it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Classify an error message by keyword.
    pub fn classify(message: &str) -> Self {
        let msg = message.to_lowercase();
        let has = |words: &[&str]| words.iter().any(|w| msg.contains(w));

        if has(&["authentication", "unauthorized", "forbidden"]) {
            Severity::Critical
        } else if has(&["rate limit", "quota exceeded", "service unavailable"]) {
            Severity::High
        } else if has(&["timeout", "timed out", "connection", "network"]) {
            Severity::Medium
        } else {
            Severity::Low
        }
    }

    /// Only high and critical errors count toward opening a breaker.
    pub fn trips_breaker(&self) -> bool {
        *self >= Severity::High
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One logged error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub timestamp: DateTime<Utc>,
    pub level: Severity,
    pub source: String,
    pub message: String,
    #[serde(default)]
    pub context: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Rotating JSON-lines log
// ---------------------------------------------------------------------------

/// Append-only JSON-lines file, renamed to `<file>.<timestamp>` once it
/// grows past `max_bytes`.
#[derive(Debug, Clone)]
pub struct ErrorLog {
    path: PathBuf,
    max_bytes: u64,
}

impl ErrorLog {
    pub fn new(path: impl Into<PathBuf>, max_bytes: u64) -> Self {
        Self {
            path: path.into(),
            max_bytes,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, entry: &ErrorEntry) -> Result<(), AppError> {
        self.rotate_if_needed()?;

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(io_err)?;
        let line = serde_json::to_string(entry)?;
        writeln!(file, "{line}").map_err(io_err)
    }

    fn rotate_if_needed(&self) -> Result<(), AppError> {
        let size = match fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(_) => return Ok(()),
        };
        if size <= self.max_bytes {
            return Ok(());
        }

        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
        let mut archived = self.path.clone().into_os_string();
        archived.push(format!(".{stamp}"));
        tracing::info!(
            path = %self.path.display(),
            size_bytes = size,
            "Rotating error log"
        );
        fs::rename(&self.path, PathBuf::from(archived)).map_err(io_err)
    }

    /// Entries in the current (unrotated) file. Malformed lines are skipped.
    pub fn read_entries(&self) -> Result<Vec<ErrorEntry>, AppError> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(io_err(e)),
        };
        let mut entries = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(io_err)?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(entry) => entries.push(entry),
                Err(e) => tracing::warn!(error = %e, "Skipping malformed error log line"),
            }
        }
        Ok(entries)
    }
}

fn io_err(e: std::io::Error) -> AppError {
    AppError::Generic(format!("Error log I/O failed: {e}"))
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ErrorHandlerConfig {
    pub breaker: CircuitBreakerConfig,
    /// JSON-lines log file. `None` keeps the log in memory only.
    pub log_file: Option<PathBuf>,
    /// Rotation threshold for `log_file`.
    pub max_log_bytes: u64,
    /// Size of the in-memory log used for exports.
    pub max_recent_errors: usize,
}

impl Default for ErrorHandlerConfig {
    fn default() -> Self {
        Self {
            breaker: CircuitBreakerConfig::default(),
            log_file: None,
            max_log_bytes: 10 * 1024 * 1024,
            max_recent_errors: 1000,
        }
    }
}

impl ErrorHandlerConfig {
    pub fn validate(&self) -> Result<(), AppError> {
        self.breaker.validate()?;
        if self.max_log_bytes == 0 {
            return Err(AppError::ConfigError("max_log_bytes must be non-zero".into()));
        }
        if self.max_recent_errors == 0 {
            return Err(AppError::ConfigError(
                "max_recent_errors must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Retry policy for [`ErrorHandler::execute_with_retry`].
#[derive(Clone)]
pub struct RetryOptions {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub backoff_multiplier: f64,
    retry_if: Option<Arc<dyn Fn(&AppError) -> bool + Send + Sync>>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            retry_if: None,
        }
    }
}

impl fmt::Debug for RetryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryOptions")
            .field("max_retries", &self.max_retries)
            .field("retry_delay", &self.retry_delay)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("retry_if", &self.retry_if.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl RetryOptions {
    pub fn new(max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            max_retries,
            retry_delay,
            ..Default::default()
        }
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Replace the default predicate ([`AppError::is_retryable`]).
    pub fn with_retry_if(
        mut self,
        predicate: impl Fn(&AppError) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.retry_if = Some(Arc::new(predicate));
        self
    }

    fn should_retry(&self, error: &AppError) -> bool {
        match &self.retry_if {
            Some(predicate) => predicate(error),
            None => error.is_retryable(),
        }
    }

    /// `retry_delay × multiplier^attempt`, attempt counted from zero.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.max(0.0).powi(attempt as i32);
        self.retry_delay.mul_f64(factor)
    }
}

// ---------------------------------------------------------------------------
// Statistics and export filters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SeverityCounts {
    pub low: u64,
    pub medium: u64,
    pub high: u64,
    pub critical: u64,
}

impl SeverityCounts {
    fn bump(&mut self, severity: Severity) {
        match severity {
            Severity::Low => self.low += 1,
            Severity::Medium => self.medium += 1,
            Severity::High => self.high += 1,
            Severity::Critical => self.critical += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.low + self.medium + self.high + self.critical
    }
}

#[derive(Debug, Clone, Default)]
struct SourceErrors {
    counts: SeverityCounts,
    last_error_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

/// Error statistics for one source.
#[derive(Debug, Clone, Serialize)]
pub struct SourceErrorStats {
    pub source: String,
    pub total: u64,
    pub by_severity: SeverityCounts,
    pub last_error_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub breaker: CircuitBreakerStats,
}

/// Which logged entries an export includes.
#[derive(Debug, Clone, Default)]
pub struct ErrorFilter {
    pub source: Option<String>,
    pub min_level: Option<Severity>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl ErrorFilter {
    fn matches(&self, entry: &ErrorEntry) -> bool {
        self.source.as_deref().is_none_or(|s| s == entry.source)
            && self.min_level.is_none_or(|l| entry.level >= l)
            && self.since.is_none_or(|t| entry.timestamp >= t)
            && self.until.is_none_or(|t| entry.timestamp <= t)
    }
}

// ---------------------------------------------------------------------------
// ErrorHandler
// ---------------------------------------------------------------------------

struct HandlerInner {
    breakers: CircuitBreakerTable,
    per_source: HashMap<String, SourceErrors>,
    recent: VecDeque<ErrorEntry>,
}

/// Classifies, records and retries source errors. Cheap to clone.
#[derive(Clone)]
pub struct ErrorHandler {
    config: Arc<ErrorHandlerConfig>,
    log: Option<ErrorLog>,
    inner: Arc<Mutex<HandlerInner>>,
}

impl ErrorHandler {
    pub fn new(config: ErrorHandlerConfig) -> Result<Self, AppError> {
        config.validate()?;
        let log = config
            .log_file
            .as_ref()
            .map(|p| ErrorLog::new(p.clone(), config.max_log_bytes));
        let inner = HandlerInner {
            breakers: CircuitBreakerTable::new(config.breaker.clone()),
            per_source: HashMap::new(),
            recent: VecDeque::new(),
        };
        Ok(Self {
            config: Arc::new(config),
            log,
            inner: Arc::new(Mutex::new(inner)),
        })
    }

    /// Acquires the inner mutex lock, recovering from poison if necessary.
    fn lock_inner(&self) -> MutexGuard<'_, HandlerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned error handler mutex");
            poisoned.into_inner()
        })
    }

    /// Classify and record an error for `source`. Returns its severity.
    pub fn log(&self, error: &AppError, source: &str, context: serde_json::Value) -> Severity {
        let severity = error.severity();
        let entry = ErrorEntry {
            timestamp: Utc::now(),
            level: severity,
            source: source.to_string(),
            message: error.to_string(),
            context,
        };

        match severity {
            Severity::Critical | Severity::High => {
                tracing::error!(source = %source, severity = %severity, error = %error, "Source error")
            }
            Severity::Medium => {
                tracing::warn!(source = %source, severity = %severity, error = %error, "Source error")
            }
            Severity::Low => {
                tracing::debug!(source = %source, severity = %severity, error = %error, "Source error")
            }
        }

        {
            let mut inner = self.lock_inner();
            let stats = inner.per_source.entry(source.to_string()).or_default();
            stats.counts.bump(severity);
            stats.last_error_at = Some(entry.timestamp);
            stats.last_error = Some(entry.message.clone());

            inner.breakers.record_failure(source, severity, &entry.message);

            if inner.recent.len() >= self.config.max_recent_errors {
                inner.recent.pop_front();
            }
            inner.recent.push_back(entry.clone());
        }

        if let Some(log) = &self.log
            && let Err(e) = log.append(&entry)
        {
            tracing::warn!(error = %e, "Failed to write error log entry");
        }

        severity
    }

    /// Whether calls to `source` are currently admitted by its breaker.
    pub fn is_source_available(&self, source: &str) -> bool {
        self.lock_inner().breakers.is_available(source)
    }

    /// Claim admission for one call; `Err` carries a [`AppError::CircuitOpen`].
    pub fn acquire(&self, source: &str) -> Result<(), AppError> {
        self.lock_inner()
            .breakers
            .try_acquire(source)
            .map_err(|retry_after| AppError::CircuitOpen {
                source_name: source.to_string(),
                retry_after,
            })
    }

    pub fn record_success(&self, source: &str) {
        self.lock_inner().breakers.record_success(source);
    }

    pub fn breaker_state(&self, source: &str) -> CircuitState {
        self.lock_inner().breakers.state(source)
    }

    pub fn reset_breaker(&self, source: &str) {
        self.lock_inner().breakers.reset(source);
    }

    /// Run `operation` with breaker admission and exponential backoff.
    ///
    /// At most `max_retries + 1` attempts are made. The last error is
    /// returned unmodified; an open breaker fails fast with
    /// [`AppError::CircuitOpen`] without calling `operation`.
    pub async fn execute_with_retry<T, F, Fut>(
        &self,
        source: &str,
        options: &RetryOptions,
        mut operation: F,
    ) -> Result<T, AppError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            self.acquire(source)?;

            match operation().await {
                Ok(value) => {
                    self.record_success(source);
                    if attempt > 0 {
                        tracing::info!(source = %source, attempts = attempt + 1, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => {
                    self.log(
                        &e,
                        source,
                        serde_json::json!({ "attempt": attempt + 1, "max_retries": options.max_retries }),
                    );
                    if attempt >= options.max_retries || !options.should_retry(&e) {
                        return Err(e);
                    }
                    let delay = options.delay_for(attempt);
                    tracing::debug!(
                        source = %source,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying after backoff"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    pub fn source_stats(&self, source: &str) -> SourceErrorStats {
        let mut inner = self.lock_inner();
        let errors = inner.per_source.get(source).cloned().unwrap_or_default();
        let breaker = inner.breakers.stats(source);
        build_stats(source, errors, breaker)
    }

    /// Statistics for every source that has logged an error or been called.
    pub fn error_stats(&self) -> Vec<SourceErrorStats> {
        let mut inner = self.lock_inner();
        let breakers = inner.breakers.all_stats();
        let mut by_source: BTreeMap<String, SourceErrorStats> = BTreeMap::new();
        for breaker in breakers {
            let errors = inner.per_source.get(&breaker.source).cloned().unwrap_or_default();
            let source = breaker.source.clone();
            by_source.insert(source.clone(), build_stats(&source, errors, breaker));
        }
        by_source.into_values().collect()
    }

    /// Forget logged errors and reset breakers, for one source or all.
    pub fn clear_errors(&self, source: Option<&str>) {
        let mut inner = self.lock_inner();
        match source {
            Some(source) => {
                inner.per_source.remove(source);
                inner.recent.retain(|e| e.source != source);
                inner.breakers.reset(source);
            }
            None => {
                let sources: Vec<String> =
                    inner.breakers.all_stats().into_iter().map(|s| s.source).collect();
                for s in &sources {
                    inner.breakers.reset(s);
                }
                inner.per_source.clear();
                inner.recent.clear();
            }
        }
        tracing::info!(source = source.unwrap_or("*"), "Cleared error history");
    }

    /// Logged entries matching `filter`, oldest first.
    ///
    /// Reads the log file when one is configured, otherwise the in-memory
    /// buffer.
    pub fn entries(&self, filter: &ErrorFilter) -> Result<Vec<ErrorEntry>, AppError> {
        let all = match &self.log {
            Some(log) => log.read_entries()?,
            None => self.lock_inner().recent.iter().cloned().collect(),
        };
        Ok(all.into_iter().filter(|e| filter.matches(e)).collect())
    }

    /// Write filtered entries to `path`. Returns the number written.
    pub fn export_logs(
        &self,
        path: &Path,
        filter: &ErrorFilter,
        format: ExportFormat,
    ) -> Result<usize, AppError> {
        let entries = self.entries(filter)?;
        let file = File::create(path).map_err(io_err)?;

        match format {
            ExportFormat::Json => {
                serde_json::to_writer_pretty(file, &entries)?;
            }
            ExportFormat::Csv => {
                let mut writer = csv::Writer::from_writer(file);
                writer.write_record(["timestamp", "level", "source", "message", "context"])?;
                for entry in &entries {
                    writer.write_record([
                        entry.timestamp.to_rfc3339().as_str(),
                        entry.level.as_str(),
                        entry.source.as_str(),
                        entry.message.as_str(),
                        entry.context.to_string().as_str(),
                    ])?;
                }
                writer.flush().map_err(io_err)?;
            }
        }

        tracing::info!(path = %path.display(), count = entries.len(), "Exported error log");
        Ok(entries.len())
    }
}

fn build_stats(
    source: &str,
    errors: SourceErrors,
    breaker: CircuitBreakerStats,
) -> SourceErrorStats {
    SourceErrorStats {
        source: source.to_string(),
        total: errors.counts.total(),
        by_severity: errors.counts,
        last_error_at: errors.last_error_at,
        last_error: errors.last_error,
        breaker,
    }
}

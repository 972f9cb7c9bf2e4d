//! The source adapter contract and the config-driven [`GenericAdapter`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{ParserKind, SourceConfig};
use crate::error::AppError;
use crate::models::{Category, Service};
use crate::normalize::{validate_service, Normalizer};
use crate::parser::{CsvParser, JsonParser, RawRecord, RecordParser};
use crate::rate_limiter::RateLimiter;
use crate::traits::Fetcher;

/// Options for one extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractOptions {
    /// Maximum services returned; `None` for all.
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
    /// Keep services in any of these categories.
    #[serde(default)]
    pub categories: Vec<Category>,
    /// Keep services with a location in any of these regions.
    #[serde(default)]
    pub regions: Vec<String>,
    #[serde(default)]
    pub youth_only: bool,
    /// Dataset keys to fetch; empty means all.
    #[serde(default)]
    pub datasets: Vec<String>,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            limit: Some(100),
            offset: 0,
            categories: Vec::new(),
            regions: Vec::new(),
            youth_only: false,
            datasets: Vec::new(),
        }
    }
}

impl ExtractOptions {
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn accepts(&self, service: &Service) -> bool {
        (self.categories.is_empty() || self.categories.iter().any(|c| service.categories.contains(c)))
            && (self.regions.is_empty()
                || service
                    .locations
                    .iter()
                    .any(|l| self.regions.iter().any(|r| r == &l.region)))
            && (!self.youth_only || service.youth_specific)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pagination {
    /// Accepted services before `offset`/`limit` were applied.
    pub total: usize,
    pub offset: usize,
    pub limit: Option<usize>,
    pub has_more: bool,
}

/// Counters for one extraction run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionStats {
    /// Raw records seen, including ones that failed to parse.
    pub records_processed: usize,
    /// Records that passed validation and filters.
    pub records_extracted: usize,
    /// Records rejected by the validation gate or relevance keywords.
    pub records_skipped: usize,
    /// Valid records excluded by the caller's filters.
    pub records_filtered: usize,
    /// Per-record parse or normalization failures.
    pub errors: usize,
    pub average_completeness: f64,
    pub duration_ms: u64,
    pub records_per_second: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub services: Vec<Service>,
    pub pagination: Pagination,
    pub stats: ExtractionStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub message: String,
    #[serde(default)]
    pub diagnostics: BTreeMap<String, serde_json::Value>,
}

/// Descriptive information about a source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceMetadata {
    pub name: String,
    pub kind: String,
    pub base_url: String,
    pub coverage: Option<String>,
    pub update_frequency: Option<String>,
    pub licensing: Option<String>,
    pub data_quality: Option<String>,
    pub estimated_records: Option<u64>,
    pub datasets: Vec<String>,
    pub categories: Vec<Category>,
    pub generated_at: DateTime<Utc>,
}

/// One external data source.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Check connectivity and configuration. Never fails; problems are
    /// reported through `is_valid = false`.
    async fn validate(&self) -> ValidationReport;

    async fn metadata(&self) -> SourceMetadata;

    /// Fetch, normalize and filter records. Transport errors propagate;
    /// per-record problems are counted in the stats.
    async fn extract(&self, options: &ExtractOptions) -> Result<ExtractionResult, AppError>;
}

/// Parser for the kinds core can handle itself. HTML needs a DOM parser
/// and is supplied by the client crate.
pub fn builtin_parser(kind: &ParserKind) -> Option<Arc<dyn RecordParser>> {
    match kind {
        ParserKind::Csv => Some(Arc::new(CsvParser)),
        ParserKind::Json { records_pointer } => Some(Arc::new(JsonParser::new(records_pointer.clone()))),
        ParserKind::Html { .. } => None,
    }
}

/// Adapter driven entirely by a [`SourceConfig`].
pub struct GenericAdapter<F> {
    config: SourceConfig,
    fetcher: F,
    parser: Arc<dyn RecordParser>,
    normalizer: Normalizer,
    rate_limiter: RateLimiter,
}

impl<F: Fetcher> GenericAdapter<F> {
    pub fn new(
        config: SourceConfig,
        fetcher: F,
        parser: Arc<dyn RecordParser>,
    ) -> Result<Self, AppError> {
        config.validate()?;
        Ok(Self {
            normalizer: Normalizer::new(&config),
            rate_limiter: RateLimiter::new(config.rate_limit),
            config,
            fetcher,
            parser,
        })
    }

    /// Build with the parser for the configured [`ParserKind`].
    pub fn with_builtin_parser(config: SourceConfig, fetcher: F) -> Result<Self, AppError> {
        let parser = builtin_parser(&config.parser).ok_or_else(|| {
            AppError::ConfigError(format!(
                "{}: parser {:?} needs an external implementation",
                config.name, config.parser
            ))
        })?;
        Self::new(config, fetcher, parser)
    }

    pub fn config(&self) -> &SourceConfig {
        &self.config
    }

    async fn fetch_records(&self, url: &str) -> Result<Vec<Result<RawRecord, AppError>>, AppError> {
        self.rate_limiter.wait().await;
        let body = self.fetcher.fetch(url).await?;
        self.parser.parse(&body)
    }
}

#[async_trait]
impl<F: Fetcher + 'static> SourceAdapter for GenericAdapter<F> {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn validate(&self) -> ValidationReport {
        let mut diagnostics = BTreeMap::new();
        let datasets = self.config.datasets_for(&[]);
        let mut failures = Vec::new();

        for dataset in &datasets {
            match self.fetch_records(&dataset.url).await {
                Ok(records) => {
                    let ok = records.iter().filter(|r| r.is_ok()).count();
                    diagnostics.insert(
                        format!("{}.records", dataset.key),
                        serde_json::json!(ok),
                    );
                }
                Err(e) => {
                    diagnostics.insert(
                        format!("{}.error", dataset.key),
                        serde_json::json!(e.to_string()),
                    );
                    failures.push(format!("{}: {e}", dataset.key));
                }
            }
        }
        diagnostics.insert("datasets".into(), serde_json::json!(datasets.len()));

        if failures.is_empty() {
            ValidationReport {
                is_valid: true,
                message: format!("{} connection successful", self.config.name),
                diagnostics,
            }
        } else {
            tracing::warn!(source = %self.config.name, failures = failures.len(), "Source validation failed");
            ValidationReport {
                is_valid: false,
                message: format!("{} validation failed: {}", self.config.name, failures.join("; ")),
                diagnostics,
            }
        }
    }

    async fn metadata(&self) -> SourceMetadata {
        let meta = &self.config.metadata;
        SourceMetadata {
            name: self.config.name.clone(),
            kind: self.config.kind.as_str().to_string(),
            base_url: self.config.base_url.clone(),
            coverage: meta.coverage.clone(),
            update_frequency: meta.update_frequency.clone(),
            licensing: meta.licensing.clone(),
            data_quality: meta.data_quality.clone(),
            estimated_records: meta.estimated_records,
            datasets: self.config.datasets.iter().map(|d| d.name.clone()).collect(),
            categories: self.normalizer.categories().targets(),
            generated_at: Utc::now(),
        }
    }

    async fn extract(&self, options: &ExtractOptions) -> Result<ExtractionResult, AppError> {
        let started = Instant::now();
        let mut stats = ExtractionStats::default();
        let mut accepted: Vec<Service> = Vec::new();

        let datasets = self.config.datasets_for(&options.datasets);
        if datasets.is_empty() {
            return Err(AppError::ConfigError(format!(
                "{}: none of the requested datasets exist: {:?}",
                self.config.name, options.datasets
            )));
        }

        for dataset in &datasets {
            tracing::info!(source = %self.config.name, dataset = %dataset.key, url = %dataset.url, "Fetching dataset");
            let records = self.fetch_records(&dataset.url).await?;

            for record in records {
                stats.records_processed += 1;
                let raw = match record {
                    Ok(raw) => raw,
                    Err(e) => {
                        stats.errors += 1;
                        tracing::debug!(source = %self.config.name, error = %e, "Unparseable record");
                        continue;
                    }
                };

                if !Normalizer::is_relevant(&raw, &self.config.relevance_keywords) {
                    stats.records_skipped += 1;
                    continue;
                }

                let service = match self.normalizer.normalize(&raw) {
                    Ok(service) => service,
                    Err(e) => {
                        stats.errors += 1;
                        tracing::debug!(source = %self.config.name, error = %e, "Record failed to normalize");
                        continue;
                    }
                };

                if let Err(e) = validate_service(&service) {
                    stats.records_skipped += 1;
                    tracing::trace!(source = %self.config.name, reason = %e, "Skipping record");
                    continue;
                }

                if !options.accepts(&service) {
                    stats.records_filtered += 1;
                    continue;
                }
                accepted.push(service);
            }
        }

        let total = accepted.len();
        stats.records_extracted = total;
        if total > 0 {
            stats.average_completeness =
                accepted.iter().map(|s| s.completeness_score).sum::<f64>() / total as f64;
        }

        let end = match options.limit {
            Some(limit) => options.offset.saturating_add(limit).min(total),
            None => total,
        };
        let start = options.offset.min(total);
        let services: Vec<Service> = accepted.drain(start..end).collect();

        let elapsed = started.elapsed();
        stats.duration_ms = elapsed.as_millis() as u64;
        let secs = elapsed.as_secs_f64();
        if secs > 0.0 {
            stats.records_per_second = stats.records_processed as f64 / secs;
        }

        tracing::info!(
            source = %self.config.name,
            processed = stats.records_processed,
            extracted = stats.records_extracted,
            skipped = stats.records_skipped,
            errors = stats.errors,
            "Extraction finished"
        );

        Ok(ExtractionResult {
            services,
            pagination: Pagination {
                total,
                offset: options.offset,
                limit: options.limit,
                has_more: end < total,
            },
            stats,
        })
    }
}

//! Weighted data-quality scoring.
//!
//! Five sub-scores in [0, 1] combine into an overall score:
//!
//! | sub-score            | default weight |
//! |----------------------|----------------|
//! | completeness         | 0.40           |
//! | source reliability   | 0.25           |
//! | freshness            | 0.20           |
//! | contact verification | 0.10           |
//! | community validation | 0.05           |
//!
//! The overall score maps onto a [`QualityLevel`] by lower-inclusive
//! thresholds. Every assessment also carries rule-based issues and
//! recommendations.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::error_handler::Severity;
use crate::models::{ExportFormat, Service, VerificationStatus};
use crate::normalize::{completeness_score, MIN_NAME_LEN};

const EMAIL_PATTERN: &str = r"^[^\s@]+@[^\s@]+\.[^\s@]+$";
const AU_PHONE_PREFIXES: &[&str] = &["02", "03", "04", "07", "08"];
const TOP_N: usize = 10;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityWeights {
    pub completeness: f64,
    pub source_reliability: f64,
    pub freshness: f64,
    pub contact_verification: f64,
    pub community_validation: f64,
}

impl Default for QualityWeights {
    fn default() -> Self {
        Self {
            completeness: 0.40,
            source_reliability: 0.25,
            freshness: 0.20,
            contact_verification: 0.10,
            community_validation: 0.05,
        }
    }
}

impl QualityWeights {
    fn as_array(&self) -> [f64; 5] {
        [
            self.completeness,
            self.source_reliability,
            self.freshness,
            self.contact_verification,
            self.community_validation,
        ]
    }

    pub fn sum(&self) -> f64 {
        self.as_array().iter().sum()
    }
}

/// Age bands in days. A record updated within `excellent_days` scores 1.0,
/// then 0.8, 0.6, 0.4, and 0.2 beyond `poor_days`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreshnessBands {
    pub excellent_days: i64,
    pub good_days: i64,
    pub fair_days: i64,
    pub poor_days: i64,
}

impl Default for FreshnessBands {
    fn default() -> Self {
        Self {
            excellent_days: 30,
            good_days: 90,
            fair_days: 180,
            poor_days: 365,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierThresholds {
    pub excellent: f64,
    pub good: f64,
    pub fair: f64,
    pub poor: f64,
}

impl Default for TierThresholds {
    fn default() -> Self {
        Self {
            excellent: 0.85,
            good: 0.70,
            fair: 0.55,
            poor: 0.40,
        }
    }
}

/// One row of the source reliability table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReliabilityRule {
    pub class: String,
    pub score: f64,
    /// Matched case-insensitively against the service's `data_source`.
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Also match any service whose verification status is `verified`.
    #[serde(default)]
    pub matches_verified: bool,
}

/// Ordered classification of data sources; the first matching rule wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceReliabilityTable {
    pub rules: Vec<ReliabilityRule>,
    pub unknown_score: f64,
}

impl Default for SourceReliabilityTable {
    fn default() -> Self {
        let rule = |class: &str, score: f64, keywords: &[&str], matches_verified: bool| {
            ReliabilityRule {
                class: class.to_string(),
                score,
                keywords: keywords.iter().map(|k| k.to_string()).collect(),
                matches_verified,
            }
        };
        Self {
            rules: vec![
                rule(
                    "government",
                    1.0,
                    &["government", ".gov.", "queensland", "department"],
                    false,
                ),
                rule(
                    "verified_ngo",
                    0.9,
                    &["legal aid", "headspace", "mission australia", "lifeline"],
                    true,
                ),
                rule("community", 0.7, &["community", "aboriginal", "indigenous"], false),
                rule("scraped", 0.5, &["scraped", "crawled"], false),
            ],
            unknown_score: 0.3,
        }
    }
}

impl SourceReliabilityTable {
    /// `(class, score)` for a service.
    pub fn classify(&self, data_source: &str, status: VerificationStatus) -> (&str, f64) {
        let source = data_source.to_lowercase();
        self.rules
            .iter()
            .find(|r| {
                r.keywords.iter().any(|k| source.contains(&k.to_lowercase()))
                    || (r.matches_verified && status == VerificationStatus::Verified)
            })
            .map(|r| (r.class.as_str(), r.score))
            .unwrap_or(("unknown", self.unknown_score))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityConfig {
    #[serde(default)]
    pub weights: QualityWeights,
    #[serde(default)]
    pub freshness: FreshnessBands,
    #[serde(default)]
    pub reliability: SourceReliabilityTable,
    #[serde(default)]
    pub thresholds: TierThresholds,
}

impl QualityConfig {
    pub fn validate(&self) -> Result<(), AppError> {
        let w = self.weights.as_array();
        if w.iter().any(|x| !(0.0..=1.0).contains(x)) {
            return Err(AppError::ConfigError(
                "quality weights must each lie in [0, 1]".into(),
            ));
        }
        let sum = self.weights.sum();
        if (sum - 1.0).abs() > 1e-6 {
            return Err(AppError::ConfigError(format!(
                "quality weights must sum to 1.0 (got {sum:.6})"
            )));
        }

        let f = &self.freshness;
        if !(0 <= f.excellent_days
            && f.excellent_days <= f.good_days
            && f.good_days <= f.fair_days
            && f.fair_days <= f.poor_days)
        {
            return Err(AppError::ConfigError(
                "freshness bands must be non-negative and ascending".into(),
            ));
        }

        let t = &self.thresholds;
        if !(t.excellent <= 1.0 && t.excellent >= t.good && t.good >= t.fair && t.fair >= t.poor && t.poor >= 0.0) {
            return Err(AppError::ConfigError(
                "quality thresholds must descend within [0, 1]".into(),
            ));
        }

        let r = &self.reliability;
        if !(0.0..=1.0).contains(&r.unknown_score)
            || r.rules.iter().any(|rule| !(0.0..=1.0).contains(&rule.score))
        {
            return Err(AppError::ConfigError(
                "source reliability scores must lie in [0, 1]".into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Assessment types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityLevel {
    Critical,
    Poor,
    Fair,
    Good,
    Excellent,
}

impl QualityLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            QualityLevel::Excellent => "excellent",
            QualityLevel::Good => "good",
            QualityLevel::Fair => "fair",
            QualityLevel::Poor => "poor",
            QualityLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for QualityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueKind {
    Completeness,
    Contact,
    Location,
    Freshness,
    Format,
}

impl IssueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueKind::Completeness => "completeness",
            IssueKind::Contact => "contact",
            IssueKind::Location => "location",
            IssueKind::Freshness => "freshness",
            IssueKind::Format => "format",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityIssue {
    #[serde(rename = "type")]
    pub kind: IssueKind,
    pub severity: Severity,
    pub field: String,
    pub message: String,
}

impl QualityIssue {
    fn new(kind: IssueKind, severity: Severity, field: &str, message: &str) -> Self {
        Self {
            kind,
            severity,
            field: field.to_string(),
            message: message.to_string(),
        }
    }

    /// `type:field`, the key used for issue frequency counts.
    pub fn key(&self) -> String {
        format!("{}:{}", self.kind.as_str(), self.field)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecommendationKind {
    Enhancement,
    Verification,
    Maintenance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    #[serde(rename = "type")]
    pub kind: RecommendationKind,
    pub priority: Priority,
    pub action: String,
}

impl Recommendation {
    fn new(kind: RecommendationKind, priority: Priority, action: &str) -> Self {
        Self {
            kind,
            priority,
            action: action.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityAssessment {
    pub service_id: Uuid,
    pub service_name: String,
    pub data_source: String,
    pub assessed_at: DateTime<Utc>,
    pub completeness_score: f64,
    pub source_reliability_score: f64,
    pub freshness_score: f64,
    pub contact_verification_score: f64,
    pub community_validation_score: f64,
    pub overall_score: f64,
    pub quality_level: QualityLevel,
    pub issues: Vec<QualityIssue>,
    pub recommendations: Vec<Recommendation>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelDistribution {
    pub excellent: u64,
    pub good: u64,
    pub fair: u64,
    pub poor: u64,
    pub critical: u64,
}

impl LevelDistribution {
    fn bump(&mut self, level: QualityLevel) {
        match level {
            QualityLevel::Excellent => self.excellent += 1,
            QualityLevel::Good => self.good += 1,
            QualityLevel::Fair => self.fair += 1,
            QualityLevel::Poor => self.poor += 1,
            QualityLevel::Critical => self.critical += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frequency {
    pub key: String,
    pub count: u64,
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total_services: usize,
    pub average_score: f64,
    pub distribution: LevelDistribution,
    /// Most frequent `type:field` issues.
    pub common_issues: Vec<Frequency>,
    /// Most frequent recommended actions.
    pub top_recommendations: Vec<Frequency>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchAssessment {
    pub assessments: Vec<QualityAssessment>,
    pub summary: BatchSummary,
    pub processing_time_ms: u64,
}

/// Running totals across every assessment since the last reset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityStats {
    pub services_assessed: u64,
    pub average_score: f64,
    pub distribution: LevelDistribution,
    pub common_issues: Vec<Frequency>,
}

#[derive(Debug, Default)]
struct RunningStats {
    services_assessed: u64,
    average_score: f64,
    distribution: LevelDistribution,
    issue_counts: HashMap<String, u64>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct QualityEngine {
    config: QualityConfig,
    email_re: Regex,
    stats: Mutex<RunningStats>,
}

impl QualityEngine {
    pub fn new(config: QualityConfig) -> Result<Self, AppError> {
        config.validate()?;
        let email_re = Regex::new(EMAIL_PATTERN)
            .map_err(|e| AppError::ConfigError(format!("invalid email pattern: {e}")))?;
        Ok(Self {
            config,
            email_re,
            stats: Mutex::new(RunningStats::default()),
        })
    }

    pub fn config(&self) -> &QualityConfig {
        &self.config
    }

    fn lock_stats(&self) -> MutexGuard<'_, RunningStats> {
        self.stats.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned quality stats mutex");
            poisoned.into_inner()
        })
    }

    pub fn assess_service(&self, service: &Service) -> QualityAssessment {
        self.assess_service_at(service, Utc::now())
    }

    /// Assess as of `now`; freshness is measured against it.
    pub fn assess_service_at(&self, service: &Service, now: DateTime<Utc>) -> QualityAssessment {
        let completeness = completeness_score(service);
        let (_, reliability) = self
            .config
            .reliability
            .classify(&service.data_source, service.verification_status);
        let freshness = self.freshness_score(service.updated_at, now);
        let contact = self.contact_verification_score(service);
        let community = community_validation_score(service);

        let w = &self.config.weights;
        let overall = (completeness * w.completeness
            + reliability * w.source_reliability
            + freshness * w.freshness
            + contact * w.contact_verification
            + community * w.community_validation)
            .clamp(0.0, 1.0);

        let mut assessment = QualityAssessment {
            service_id: service.id,
            service_name: service.name.clone(),
            data_source: service.data_source.clone(),
            assessed_at: now,
            completeness_score: completeness,
            source_reliability_score: reliability,
            freshness_score: freshness,
            contact_verification_score: contact,
            community_validation_score: community,
            overall_score: overall,
            quality_level: self.quality_level(overall),
            issues: Vec::new(),
            recommendations: Vec::new(),
        };
        assessment.issues = self.identify_issues(service, &assessment);
        assessment.recommendations = recommendations(service, &assessment);

        self.record(&assessment);
        assessment
    }

    /// Assess every service and summarize the batch.
    pub fn assess_batch(&self, services: &[Service]) -> BatchAssessment {
        let started = Instant::now();
        let now = Utc::now();
        let assessments: Vec<QualityAssessment> = services
            .iter()
            .enumerate()
            .map(|(i, s)| {
                if (i + 1) % 100 == 0 {
                    tracing::debug!(assessed = i + 1, total = services.len(), "Quality assessment progress");
                }
                self.assess_service_at(s, now)
            })
            .collect();
        let summary = summarize(&assessments);
        BatchAssessment {
            assessments,
            summary,
            processing_time_ms: started.elapsed().as_millis() as u64,
        }
    }

    pub fn quality_level(&self, score: f64) -> QualityLevel {
        let t = &self.config.thresholds;
        if score >= t.excellent {
            QualityLevel::Excellent
        } else if score >= t.good {
            QualityLevel::Good
        } else if score >= t.fair {
            QualityLevel::Fair
        } else if score >= t.poor {
            QualityLevel::Poor
        } else {
            QualityLevel::Critical
        }
    }

    pub fn freshness_score(&self, updated_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
        let days = (now - updated_at).num_days();
        let f = &self.config.freshness;
        if days <= f.excellent_days {
            1.0
        } else if days <= f.good_days {
            0.8
        } else if days <= f.fair_days {
            0.6
        } else if days <= f.poor_days {
            0.4
        } else {
            0.2
        }
    }

    pub fn is_valid_email(&self, email: &str) -> bool {
        self.email_re.is_match(email)
    }

    /// Presence earns partial credit, valid format earns full credit.
    /// Phone, email and URL weigh 0.5, 0.3 and 0.2 of whatever is present.
    pub fn contact_verification_score(&self, service: &Service) -> f64 {
        let mut score = 0.0;
        let mut max = 0.0;

        if let Some(phone) = service.primary_phone() {
            max += 0.5;
            score += if is_valid_au_phone(phone) { 0.5 } else { 0.25 };
        }
        if let Some(email) = service.primary_email() {
            max += 0.3;
            score += if self.is_valid_email(email) { 0.3 } else { 0.15 };
        }
        if let Some(url) = &service.url {
            max += 0.2;
            score += if url::Url::parse(url).is_ok() { 0.2 } else { 0.1 };
        }

        if max > 0.0 { score / max } else { 0.0 }
    }

    fn identify_issues(&self, service: &Service, assessment: &QualityAssessment) -> Vec<QualityIssue> {
        use IssueKind::*;
        let mut issues = Vec::new();

        if service.name.trim().chars().count() < MIN_NAME_LEN {
            issues.push(QualityIssue::new(Completeness, Severity::High, "name", "Service name is missing or too short"));
        }
        if service.description.trim().chars().count() < 20 {
            issues.push(QualityIssue::new(Completeness, Severity::High, "description", "Service description is missing or too brief"));
        }
        if service.categories.is_empty() {
            issues.push(QualityIssue::new(Completeness, Severity::Medium, "categories", "Service categories are missing"));
        }

        let email = service.primary_email();
        if email.is_none() && service.primary_phone().is_none() {
            issues.push(QualityIssue::new(Contact, Severity::High, "contact_info", "No contact information available"));
        }

        match service.locations.first() {
            None => issues.push(QualityIssue::new(Location, Severity::High, "locations", "Location information is missing")),
            Some(loc) if !loc.has_coordinates() => issues.push(QualityIssue::new(
                Location,
                Severity::Medium,
                "coordinates",
                "Geographic coordinates are missing",
            )),
            Some(_) => {}
        }

        if assessment.freshness_score < 0.5 {
            issues.push(QualityIssue::new(Freshness, Severity::Medium, "updated_at", "Service information may be outdated"));
        }

        if let Some(email) = email
            && !self.is_valid_email(email)
        {
            issues.push(QualityIssue::new(Format, Severity::Low, "email", "Email format appears invalid"));
        }

        issues
    }

    fn record(&self, assessment: &QualityAssessment) {
        let mut stats = self.lock_stats();
        stats.services_assessed += 1;
        let n = stats.services_assessed as f64;
        stats.average_score += (assessment.overall_score - stats.average_score) / n;
        stats.distribution.bump(assessment.quality_level);
        for issue in &assessment.issues {
            *stats.issue_counts.entry(issue.key()).or_default() += 1;
        }
    }

    pub fn stats(&self) -> QualityStats {
        let stats = self.lock_stats();
        let total = stats.services_assessed.max(1) as f64;
        QualityStats {
            services_assessed: stats.services_assessed,
            average_score: stats.average_score,
            distribution: stats.distribution.clone(),
            common_issues: top_frequencies(&stats.issue_counts, total),
        }
    }

    pub fn reset_stats(&self) {
        *self.lock_stats() = RunningStats::default();
    }

    /// Render assessments as a JSON report (summary + assessments) or a CSV
    /// table with one row per assessment.
    pub fn export_report(
        &self,
        assessments: &[QualityAssessment],
        format: ExportFormat,
    ) -> Result<String, AppError> {
        match format {
            ExportFormat::Json => {
                let report = serde_json::json!({
                    "summary": summarize(assessments),
                    "assessments": assessments,
                    "generated_at": Utc::now(),
                });
                Ok(serde_json::to_string_pretty(&report)?)
            }
            ExportFormat::Csv => {
                let mut writer = csv::Writer::from_writer(Vec::new());
                writer.write_record([
                    "service_id",
                    "service_name",
                    "data_source",
                    "overall_score",
                    "quality_level",
                    "completeness_score",
                    "freshness_score",
                    "source_reliability_score",
                    "contact_verification_score",
                    "community_validation_score",
                    "issues_count",
                    "recommendations_count",
                ])?;
                for a in assessments {
                    writer.write_record([
                        a.service_id.to_string(),
                        a.service_name.clone(),
                        a.data_source.clone(),
                        format!("{:.3}", a.overall_score),
                        a.quality_level.to_string(),
                        format!("{:.3}", a.completeness_score),
                        format!("{:.3}", a.freshness_score),
                        format!("{:.3}", a.source_reliability_score),
                        format!("{:.3}", a.contact_verification_score),
                        format!("{:.3}", a.community_validation_score),
                        a.issues.len().to_string(),
                        a.recommendations.len().to_string(),
                    ])?;
                }
                let bytes = writer
                    .into_inner()
                    .map_err(|e| AppError::SerializationError(e.to_string()))?;
                String::from_utf8(bytes).map_err(|e| AppError::SerializationError(e.to_string()))
            }
        }
    }
}

/// Rating out of 5 contributes up to 0.6; verified adds 0.4, pending 0.2.
pub fn community_validation_score(service: &Service) -> f64 {
    let rating = service
        .community_rating
        .map(|r| (r.clamp(0.0, 5.0) / 5.0) * 0.6)
        .unwrap_or(0.0);
    let verification = match service.verification_status {
        VerificationStatus::Verified => 0.4,
        VerificationStatus::Pending => 0.2,
        VerificationStatus::Unverified => 0.0,
    };
    (rating + verification).min(1.0)
}

/// At least ten digits with an Australian area or mobile prefix.
/// A leading `61` country code is treated as `0`.
pub fn is_valid_au_phone(phone: &str) -> bool {
    let digits: String = phone.chars().filter(char::is_ascii_digit).collect();
    let digits = match digits.strip_prefix("61") {
        Some(rest) if digits.len() == 11 => format!("0{rest}"),
        _ => digits,
    };
    digits.len() >= 10 && AU_PHONE_PREFIXES.iter().any(|p| digits.starts_with(p))
}

fn recommendations(service: &Service, a: &QualityAssessment) -> Vec<Recommendation> {
    use RecommendationKind::*;
    let mut out = Vec::new();

    if a.completeness_score < 0.7 {
        if service.description.trim().chars().count() < 100 {
            out.push(Recommendation::new(
                Enhancement,
                Priority::High,
                "Expand service description with eligibility criteria, application process, and outcomes",
            ));
        }
        if service.url.is_none() {
            out.push(Recommendation::new(Enhancement, Priority::Medium, "Add website URL for more information"));
        }
    }
    if a.contact_verification_score < 0.8 {
        out.push(Recommendation::new(Verification, Priority::High, "Verify and update contact information"));
    }
    if a.freshness_score < 0.6 {
        out.push(Recommendation::new(
            Maintenance,
            Priority::Medium,
            "Contact service provider to verify current information",
        ));
    }
    if a.source_reliability_score < 0.7 {
        out.push(Recommendation::new(Verification, Priority::Medium, "Seek verification from authoritative source"));
    }
    out
}

/// Aggregate a batch: average, level distribution and the most frequent
/// issues and recommendations.
pub fn summarize(assessments: &[QualityAssessment]) -> BatchSummary {
    let mut distribution = LevelDistribution::default();
    let mut issues: HashMap<String, u64> = HashMap::new();
    let mut actions: HashMap<String, u64> = HashMap::new();
    let mut total_score = 0.0;

    for a in assessments {
        total_score += a.overall_score;
        distribution.bump(a.quality_level);
        for issue in &a.issues {
            *issues.entry(issue.key()).or_default() += 1;
        }
        for rec in &a.recommendations {
            *actions.entry(rec.action.clone()).or_default() += 1;
        }
    }

    let n = assessments.len();
    let denom = n.max(1) as f64;
    BatchSummary {
        total_services: n,
        average_score: if n == 0 { 0.0 } else { total_score / n as f64 },
        distribution,
        common_issues: top_frequencies(&issues, denom),
        top_recommendations: top_frequencies(&actions, denom),
    }
}

fn top_frequencies(counts: &HashMap<String, u64>, total: f64) -> Vec<Frequency> {
    let mut entries: Vec<(&String, &u64)> = counts.iter().collect();
    entries.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
    entries
        .into_iter()
        .take(TOP_N)
        .map(|(key, &count)| Frequency {
            key: key.clone(),
            count,
            percentage: count as f64 / total * 100.0,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::testutil::ServiceBuilder;

    fn engine() -> QualityEngine {
        QualityEngine::new(QualityConfig::default()).unwrap()
    }

    #[test]
    fn test_default_weights_sum_to_one() {
        assert!((QualityWeights::default().sum() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_invalid_weights_rejected() {
        let config = QualityConfig {
            weights: QualityWeights {
                completeness: 0.5,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(QualityEngine::new(config), Err(AppError::ConfigError(_))));
    }

    #[test]
    fn test_invalid_thresholds_rejected() {
        let config = QualityConfig {
            thresholds: TierThresholds {
                excellent: 0.5,
                good: 0.7,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(QualityEngine::new(config).is_err());
    }

    #[test]
    fn test_overall_is_weighted_sum() {
        let e = engine();
        let service = ServiceBuilder::new("Legal Aid Queensland Youth Service")
            .data_source("Queensland Open Data")
            .phone("07 3000 0000")
            .email("help@legalaid.qld.gov.au")
            .build();
        let a = e.assess_service(&service);
        let expected = 0.40 * a.completeness_score
            + 0.25 * a.source_reliability_score
            + 0.20 * a.freshness_score
            + 0.10 * a.contact_verification_score
            + 0.05 * a.community_validation_score;
        assert!((a.overall_score - expected).abs() < 1e-12);
        for s in [
            a.completeness_score,
            a.source_reliability_score,
            a.freshness_score,
            a.contact_verification_score,
            a.community_validation_score,
        ] {
            assert!((0.0..=1.0).contains(&s));
        }
    }

    #[test]
    fn test_tier_boundaries_inclusive() {
        let e = engine();
        assert_eq!(e.quality_level(0.85), QualityLevel::Excellent);
        assert_eq!(e.quality_level(0.8499), QualityLevel::Good);
        assert_eq!(e.quality_level(0.70), QualityLevel::Good);
        assert_eq!(e.quality_level(0.55), QualityLevel::Fair);
        assert_eq!(e.quality_level(0.40), QualityLevel::Poor);
        assert_eq!(e.quality_level(0.3999), QualityLevel::Critical);
    }

    #[test]
    fn test_freshness_bands() {
        let e = engine();
        let now = Utc::now();
        assert_eq!(e.freshness_score(now - Duration::days(10), now), 1.0);
        assert_eq!(e.freshness_score(now - Duration::days(60), now), 0.8);
        assert_eq!(e.freshness_score(now - Duration::days(200), now), 0.4);
        assert_eq!(e.freshness_score(now - Duration::days(400), now), 0.2);
    }

    #[test]
    fn test_source_reliability_table() {
        let table = SourceReliabilityTable::default();
        assert_eq!(table.classify("Queensland Open Data", VerificationStatus::Unverified).1, 1.0);
        assert_eq!(table.classify("headspace", VerificationStatus::Unverified).1, 0.9);
        assert_eq!(table.classify("random-feed", VerificationStatus::Verified).0, "verified_ngo");
        assert_eq!(table.classify("Community Directory", VerificationStatus::Unverified).1, 0.7);
        assert_eq!(table.classify("scraped-listings", VerificationStatus::Unverified).1, 0.5);
        assert_eq!(table.classify("mystery", VerificationStatus::Unverified), ("unknown", 0.3));
    }

    #[test]
    fn test_contact_verification_partial_credit() {
        let e = engine();
        let full = ServiceBuilder::new("Service A")
            .phone("+61 7 3000 0000")
            .email("info@example.org")
            .url("https://example.org")
            .build();
        assert!((e.contact_verification_score(&full) - 1.0).abs() < 1e-12);

        let bad_phone = ServiceBuilder::new("Service B").phone("13 11 14").build();
        assert!((e.contact_verification_score(&bad_phone) - 0.5).abs() < 1e-12);

        let none = ServiceBuilder::new("Service C").address("1 Main St", "Brisbane", "4000").build();
        assert_eq!(e.contact_verification_score(&none), 0.0);
    }

    #[test]
    fn test_phone_validation() {
        assert!(is_valid_au_phone("07 3000 0000"));
        assert!(is_valid_au_phone("0412 345 678"));
        assert!(is_valid_au_phone("+61 412 345 678"));
        assert!(!is_valid_au_phone("1300 651 188"));
        assert!(!is_valid_au_phone("3000 0000"));
    }

    #[test]
    fn test_community_validation() {
        let mut s = ServiceBuilder::new("Rated").build();
        s.community_rating = Some(5.0);
        s.verification_status = VerificationStatus::Verified;
        assert!((community_validation_score(&s) - 1.0).abs() < 1e-12);
        s.community_rating = None;
        s.verification_status = VerificationStatus::Pending;
        assert!((community_validation_score(&s) - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_issues_and_recommendations() {
        let e = engine();
        let mut service = ServiceBuilder::new("Yo")
            .data_source("unknown-feed")
            .email("not-an-email")
            .address("1 Main St", "Cairns", "4870")
            .build();
        service.updated_at = Utc::now() - Duration::days(500);

        let a = e.assess_service(&service);
        let keys: Vec<String> = a.issues.iter().map(QualityIssue::key).collect();
        assert!(keys.contains(&"completeness:name".to_string()));
        assert!(keys.contains(&"completeness:description".to_string()));
        assert!(keys.contains(&"location:coordinates".to_string()));
        assert!(keys.contains(&"freshness:updated_at".to_string()));
        assert!(keys.contains(&"format:email".to_string()));
        assert!(!keys.contains(&"contact:contact_info".to_string()));

        let actions: Vec<&str> = a.recommendations.iter().map(|r| r.action.as_str()).collect();
        assert!(actions.contains(&"Verify and update contact information"));
        assert!(actions.contains(&"Contact service provider to verify current information"));
        assert!(actions.contains(&"Seek verification from authoritative source"));
        assert!(actions.contains(&"Add website URL for more information"));
    }

    #[test]
    fn test_missing_contact_and_location_issues() {
        let e = engine();
        let service = ServiceBuilder::new("Nowhere Service").build();
        let a = e.assess_service(&service);
        let keys: Vec<String> = a.issues.iter().map(QualityIssue::key).collect();
        assert!(keys.contains(&"contact:contact_info".to_string()));
        assert!(keys.contains(&"location:locations".to_string()));
    }

    #[test]
    fn test_batch_summary_and_stats() {
        let e = engine();
        let services = vec![
            ServiceBuilder::new("Service One").phone("0733330000").build(),
            ServiceBuilder::new("Service Two").phone("0733331111").build(),
            ServiceBuilder::new("Service Three").email("a@b.org").build(),
        ];
        let batch = e.assess_batch(&services);
        assert_eq!(batch.summary.total_services, 3);
        let top = &batch.summary.common_issues[0];
        assert_eq!(top.count, 3);
        assert!((top.percentage - 100.0).abs() < 1e-9);
        assert!(batch.summary.common_issues.len() <= 10);

        let stats = e.stats();
        assert_eq!(stats.services_assessed, 3);
        assert!((stats.average_score - batch.summary.average_score).abs() < 1e-9);

        e.reset_stats();
        assert_eq!(e.stats().services_assessed, 0);
    }

    #[test]
    fn test_export_report_formats() {
        let e = engine();
        let batch = e.assess_batch(&[ServiceBuilder::new("Export Me").phone("0733330000").build()]);

        let csv = e.export_report(&batch.assessments, ExportFormat::Csv).unwrap();
        let mut lines = csv.lines();
        assert!(lines.next().unwrap().starts_with("service_id,service_name,data_source"));
        assert!(lines.next().unwrap().contains("Export Me"));

        let json = e.export_report(&batch.assessments, ExportFormat::Json).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["summary"]["total_services"], 1);
        assert_eq!(parsed["assessments"].as_array().unwrap().len(), 1);
    }
}

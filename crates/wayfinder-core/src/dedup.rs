//! Duplicate detection.
//!
//! Each new record is compared against the existing set and against the new
//! records before it. A pair is reported when one of the match rules fires
//! with a confidence at or above the configured threshold. The engine only
//! reports; merging, flagging or dropping is the caller's decision.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{Location, Service};

const EARTH_RADIUS_M: f64 = 6_371_000.0;

const ORG_SUFFIXES: &[&str] = &[
    "inc",
    "incorporated",
    "ltd",
    "limited",
    "pty",
    "proprietary",
    "llc",
    "corp",
    "corporation",
    "co",
    "company",
    "association",
    "assoc",
    "org",
    "organization",
    "society",
    "foundation",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Minimum confidence for a pair to be reported.
    pub threshold: f64,
    /// Name similarity needed for a fuzzy match.
    pub name_threshold: f64,
    /// Locations further apart than this score zero on distance.
    pub max_location_distance_m: f64,
    /// Locations closer than this score full marks on distance.
    pub near_distance_m: f64,
    /// Blocking kicks in when new + existing exceeds this many records.
    pub blocking_min_records: usize,
    pub name_prefix_len: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            threshold: 0.80,
            name_threshold: 0.85,
            max_location_distance_m: 2000.0,
            near_distance_m: 100.0,
            blocking_min_records: 300,
            name_prefix_len: 3,
        }
    }
}

impl DedupConfig {
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if !(self.threshold > 0.0 && self.threshold <= 1.0) {
            return Err(AppError::ConfigError(format!(
                "dedup threshold must be in (0, 1] (got {})",
                self.threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.name_threshold) {
            return Err(AppError::ConfigError(
                "dedup name threshold must be in [0, 1]".into(),
            ));
        }
        if !(self.near_distance_m >= 0.0 && self.near_distance_m < self.max_location_distance_m) {
            return Err(AppError::ConfigError(
                "near distance must be below the max location distance".into(),
            ));
        }
        if self.name_prefix_len == 0 {
            return Err(AppError::ConfigError(
                "blocking name prefix length must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Per-field similarity of two records, each in [0, 1].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SimilarityScores {
    pub name: f64,
    pub organization: f64,
    pub location: f64,
    pub contact: f64,
    pub tax_id: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    TaxId,
    Contact,
    LocationName,
    Organization,
    Fuzzy,
}

impl MatchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchKind::TaxId => "tax_id",
            MatchKind::Contact => "contact",
            MatchKind::LocationName => "location_name",
            MatchKind::Organization => "organization",
            MatchKind::Fuzzy => "fuzzy",
        }
    }
}

/// What the new record was compared against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    Existing,
    Sibling,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicatePair {
    /// The newly extracted record (for siblings, the later one).
    pub record_id: Uuid,
    /// The record it duplicates.
    pub matched_id: Uuid,
    pub comparison: Comparison,
    pub kind: MatchKind,
    pub confidence: f64,
    pub scores: SimilarityScores,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DedupStats {
    pub new_records: usize,
    pub existing_records: usize,
    pub pairs_compared: u64,
    pub duplicates_found: usize,
    pub blocking_used: bool,
    pub processing_time_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DedupReport {
    pub pairs: Vec<DuplicatePair>,
    pub stats: DedupStats,
}

impl DedupReport {
    /// The highest-confidence match for a new record, if any.
    pub fn best_match(&self, record_id: Uuid) -> Option<&DuplicatePair> {
        self.pairs
            .iter()
            .filter(|p| p.record_id == record_id)
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
    }

    pub fn duplicate_ids(&self) -> HashSet<Uuid> {
        self.pairs.iter().map(|p| p.record_id).collect()
    }
}

// ---------------------------------------------------------------------------
// Blocking
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum BlockKey {
    NamePrefix(String),
    Postcode(String),
    TaxId(String),
    Phone(String),
}

fn block_keys(service: &Service, prefix_len: usize) -> Vec<BlockKey> {
    let mut keys = Vec::new();
    let name = normalize_text(&service.name);
    if !name.is_empty() {
        keys.push(BlockKey::NamePrefix(name.chars().take(prefix_len).collect()));
    }
    for loc in &service.locations {
        let pc = loc.postal_code.trim();
        if !pc.is_empty() {
            keys.push(BlockKey::Postcode(pc.to_string()));
        }
    }
    if let Some(tax) = tax_id_digits(service) {
        keys.push(BlockKey::TaxId(tax));
    }
    if let Some(phone) = service.primary_phone().map(normalize_phone)
        && !phone.is_empty()
    {
        keys.push(BlockKey::Phone(phone));
    }
    keys
}

#[derive(Debug, Default)]
struct BlockIndex {
    buckets: HashMap<BlockKey, Vec<usize>>,
}

impl BlockIndex {
    fn build(services: &[Service], prefix_len: usize) -> Self {
        let mut index = Self::default();
        for (i, s) in services.iter().enumerate() {
            for key in block_keys(s, prefix_len) {
                index.buckets.entry(key).or_default().push(i);
            }
        }
        index
    }

    fn candidates(&self, keys: &[BlockKey]) -> BTreeSet<usize> {
        keys.iter()
            .filter_map(|k| self.buckets.get(k))
            .flatten()
            .copied()
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DeduplicationEngine {
    config: DedupConfig,
}

impl DeduplicationEngine {
    pub fn new(config: DedupConfig) -> Result<Self, AppError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &DedupConfig {
        &self.config
    }

    /// Report likely duplicates of `new_records` among `existing` and among
    /// earlier entries of `new_records`.
    pub fn find_duplicates(&self, new_records: &[Service], existing: &[Service]) -> DedupReport {
        let started = Instant::now();
        let blocking = new_records.len() + existing.len() > self.config.blocking_min_records;
        let prefix = self.config.name_prefix_len;

        let (existing_index, sibling_index) = if blocking {
            (
                Some(BlockIndex::build(existing, prefix)),
                Some(BlockIndex::build(new_records, prefix)),
            )
        } else {
            (None, None)
        };

        let mut pairs = Vec::new();
        let mut compared = 0u64;

        for (j, record) in new_records.iter().enumerate() {
            let keys = if blocking { block_keys(record, prefix) } else { Vec::new() };

            let existing_candidates: Vec<usize> = match &existing_index {
                Some(index) => index.candidates(&keys).into_iter().collect(),
                None => (0..existing.len()).collect(),
            };
            for i in existing_candidates {
                let other = &existing[i];
                if other.id == record.id {
                    continue;
                }
                compared += 1;
                if let Some(pair) = self.check_pair(record, other, Comparison::Existing) {
                    pairs.push(pair);
                }
            }

            let sibling_candidates: Vec<usize> = match &sibling_index {
                Some(index) => index.candidates(&keys).into_iter().filter(|&i| i < j).collect(),
                None => (0..j).collect(),
            };
            for i in sibling_candidates {
                let other = &new_records[i];
                if other.id == record.id {
                    continue;
                }
                compared += 1;
                if let Some(pair) = self.check_pair(record, other, Comparison::Sibling) {
                    pairs.push(pair);
                }
            }

            if (j + 1) % 100 == 0 {
                tracing::debug!(checked = j + 1, total = new_records.len(), "Deduplication progress");
            }
        }

        let stats = DedupStats {
            new_records: new_records.len(),
            existing_records: existing.len(),
            pairs_compared: compared,
            duplicates_found: pairs.len(),
            blocking_used: blocking,
            processing_time_ms: started.elapsed().as_millis() as u64,
        };
        tracing::debug!(
            duplicates = stats.duplicates_found,
            compared = stats.pairs_compared,
            blocking,
            "Deduplication complete"
        );
        DedupReport { pairs, stats }
    }

    fn check_pair(&self, record: &Service, other: &Service, comparison: Comparison) -> Option<DuplicatePair> {
        let scores = self.similarity(record, other);
        let (kind, confidence) = self.evaluate(&scores)?;
        (confidence >= self.config.threshold).then(|| DuplicatePair {
            record_id: record.id,
            matched_id: other.id,
            comparison,
            kind,
            confidence,
            scores,
        })
    }

    pub fn similarity(&self, a: &Service, b: &Service) -> SimilarityScores {
        SimilarityScores {
            name: name_similarity(&a.name, &b.name),
            organization: organization_similarity(
                a.organization_name().unwrap_or_default(),
                b.organization_name().unwrap_or_default(),
            ),
            location: self.location_similarity(&a.locations, &b.locations),
            contact: contact_similarity(a, b),
            tax_id: match (tax_id_digits(a), tax_id_digits(b)) {
                (Some(x), Some(y)) if x == y => 1.0,
                _ => 0.0,
            },
        }
    }

    /// Apply the match rules in order; the first that fires decides the kind.
    pub fn evaluate(&self, s: &SimilarityScores) -> Option<(MatchKind, f64)> {
        if s.tax_id >= 1.0 {
            return Some((MatchKind::TaxId, 1.0));
        }
        if s.contact >= 0.8 && s.name >= 0.7 {
            return Some((MatchKind::Contact, s.contact * 0.6 + s.name * 0.4));
        }
        if s.location >= 0.9 && s.name >= 0.8 {
            return Some((MatchKind::LocationName, s.location * 0.5 + s.name * 0.5));
        }
        if s.organization >= 0.85 && s.name >= 0.75 {
            return Some((MatchKind::Organization, s.organization * 0.6 + s.name * 0.4));
        }
        if s.name >= self.config.name_threshold {
            let mut support = 0;
            let mut confidence = s.name * 0.5;
            if s.organization >= 0.7 {
                support += 1;
                confidence += s.organization * 0.2;
            }
            if s.location >= 0.7 {
                support += 1;
                confidence += s.location * 0.2;
            }
            if s.contact >= 0.7 {
                support += 1;
                confidence += s.contact * 0.1;
            }
            if support > 0 {
                return Some((MatchKind::Fuzzy, confidence.min(1.0)));
            }
        }
        None
    }

    /// Best match over all location pairs.
    pub fn location_similarity(&self, a: &[Location], b: &[Location]) -> f64 {
        a.iter()
            .flat_map(|x| b.iter().map(move |y| (x, y)))
            .map(|(x, y)| self.compare_locations(x, y))
            .fold(0.0, f64::max)
    }

    fn compare_locations(&self, a: &Location, b: &Location) -> f64 {
        let mut score = 0.0;
        let mut max = 0.0;

        if !a.address_1.is_empty() && !b.address_1.is_empty() {
            score += text_similarity(&a.address_1, &b.address_1) * 0.4;
            max += 0.4;
        }
        if !a.city.is_empty() && !b.city.is_empty() {
            score += text_similarity(&a.city, &b.city) * 0.2;
            max += 0.2;
        }
        if !a.postal_code.is_empty() && !b.postal_code.is_empty() {
            if a.postal_code.trim() == b.postal_code.trim() {
                score += 0.2;
            }
            max += 0.2;
        }
        if let (Some(lat1), Some(lng1), Some(lat2), Some(lng2)) =
            (a.latitude, a.longitude, b.latitude, b.longitude)
        {
            let d = haversine_m(lat1, lng1, lat2, lng2);
            let distance_score = if d < self.config.near_distance_m {
                1.0
            } else if d < self.config.max_location_distance_m {
                1.0 - d / self.config.max_location_distance_m
            } else {
                0.0
            };
            score += distance_score * 0.2;
            max += 0.2;
        }

        if max > 0.0 { score / max } else { 0.0 }
    }
}

// ---------------------------------------------------------------------------
// Similarity helpers
// ---------------------------------------------------------------------------

/// Lowercase, punctuation to spaces, whitespace collapsed.
pub fn normalize_text(text: &str) -> String {
    let mapped: String = text
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '_' { c } else { ' ' })
        .collect();
    mapped.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn text_similarity(a: &str, b: &str) -> f64 {
    let (a, b) = (normalize_text(a), normalize_text(b));
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }
    strsim::normalized_levenshtein(&a, &b)
}

/// 0.6 × normalized Levenshtein + 0.4 × word Jaccard; 1.0 on exact match.
pub fn name_similarity(a: &str, b: &str) -> f64 {
    let (a, b) = (normalize_text(a), normalize_text(b));
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }
    let lev = strsim::normalized_levenshtein(&a, &b);
    let wa: HashSet<&str> = a.split(' ').collect();
    let wb: HashSet<&str> = b.split(' ').collect();
    let union = wa.union(&wb).count();
    let jaccard = if union == 0 {
        0.0
    } else {
        wa.intersection(&wb).count() as f64 / union as f64
    };
    lev * 0.6 + jaccard * 0.4
}

/// Drop trailing legal-form words ("Pty Ltd", "Inc", "Association").
pub fn strip_org_suffixes(name: &str) -> String {
    let mut words: Vec<&str> = name.split(' ').collect();
    while words.len() > 1 && words.last().is_some_and(|w| ORG_SUFFIXES.contains(w)) {
        words.pop();
    }
    words.join(" ")
}

pub fn organization_similarity(a: &str, b: &str) -> f64 {
    let (a, b) = (normalize_text(a), normalize_text(b));
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }
    let (ca, cb) = (strip_org_suffixes(&a), strip_org_suffixes(&b));
    if ca == cb {
        return 0.95;
    }
    strsim::normalized_levenshtein(&ca, &cb)
}

/// Digits only, with a `61` country code rewritten to a leading `0`.
pub fn normalize_phone(phone: &str) -> String {
    let digits: String = phone.chars().filter(char::is_ascii_digit).collect();
    match digits.strip_prefix("61") {
        Some(rest) if digits.len() == 11 => format!("0{rest}"),
        _ => digits,
    }
}

fn domain(url: &str) -> Option<String> {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.trim_start_matches("www.").to_lowercase()))
}

/// Share of the contact channels present on both records that agree.
pub fn contact_similarity(a: &Service, b: &Service) -> f64 {
    let mut hits = 0u32;
    let mut checks = 0u32;

    if let (Some(x), Some(y)) = (a.primary_email(), b.primary_email()) {
        checks += 1;
        if x.trim().eq_ignore_ascii_case(y.trim()) {
            hits += 1;
        }
    }
    if let (Some(x), Some(y)) = (a.primary_phone(), b.primary_phone()) {
        checks += 1;
        if normalize_phone(x) == normalize_phone(y) {
            hits += 1;
        }
    }
    if let (Some(x), Some(y)) = (&a.url, &b.url) {
        checks += 1;
        if let (Some(dx), Some(dy)) = (domain(x), domain(y))
            && dx == dy
        {
            hits += 1;
        }
    }

    if checks == 0 { 0.0 } else { f64::from(hits) / f64::from(checks) }
}

fn tax_id_digits(service: &Service) -> Option<String> {
    let tax = service.organization.as_ref()?.tax_id.as_deref()?;
    let digits: String = tax.chars().filter(char::is_ascii_digit).collect();
    (!digits.is_empty()).then_some(digits)
}

pub fn haversine_m(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let (p1, p2) = (lat1.to_radians(), lat2.to_radians());
    let dp = (lat2 - lat1).to_radians();
    let dl = (lng2 - lng1).to_radians();
    let a = (dp / 2.0).sin().powi(2) + p1.cos() * p2.cos() * (dl / 2.0).sin().powi(2);
    EARTH_RADIUS_M * 2.0 * a.sqrt().atan2((1.0 - a).sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ServiceBuilder;

    fn engine() -> DeduplicationEngine {
        DeduplicationEngine::new(DedupConfig::default()).unwrap()
    }

    fn headspace(name: &str) -> Service {
        ServiceBuilder::new(name)
            .organization("Headspace Pty Ltd")
            .address("12 Wharf Street", "Cairns", "4870")
            .coordinates(-16.9230, 145.7780)
            .build()
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(DeduplicationEngine::new(DedupConfig::default().with_threshold(0.0)).is_err());
        assert!(DeduplicationEngine::new(DedupConfig::default().with_threshold(1.5)).is_err());
        let config = DedupConfig {
            near_distance_m: 5000.0,
            ..Default::default()
        };
        assert!(DeduplicationEngine::new(config).is_err());
    }

    #[test]
    fn test_normalize_text() {
        assert_eq!(normalize_text("  Youth-Legal   Aid!! "), "youth legal aid");
    }

    #[test]
    fn test_name_similarity() {
        assert_eq!(name_similarity("Youth Legal Aid", "youth legal-aid"), 1.0);
        assert_eq!(name_similarity("", "Anything"), 0.0);
        let close = name_similarity("Youth Legal Aid Service", "Youth Legal Aid Services");
        assert!(close > 0.8, "{close}");
        let far = name_similarity("Youth Legal Aid", "Cairns Food Bank");
        assert!(far < 0.5, "{far}");
    }

    #[test]
    fn test_organization_suffixes() {
        assert_eq!(strip_org_suffixes("headspace pty ltd"), "headspace");
        assert_eq!(organization_similarity("Headspace Pty Ltd", "Headspace Ltd"), 0.95);
        assert_eq!(organization_similarity("Headspace", "headspace"), 1.0);
    }

    #[test]
    fn test_phone_normalization() {
        assert_eq!(normalize_phone("+61 7 4000 1234"), "0740001234");
        assert_eq!(normalize_phone("(07) 4000 1234"), "0740001234");
    }

    #[test]
    fn test_haversine() {
        let d = haversine_m(-27.4698, 153.0251, -27.4698, 153.0351);
        assert!((d - 986.0).abs() < 15.0, "{d}");
        assert_eq!(haversine_m(-27.0, 153.0, -27.0, 153.0), 0.0);
    }

    #[test]
    fn test_matching_name_org_location_is_duplicate() {
        let e = engine();
        let existing = headspace("Headspace Cairns");
        let new = headspace("headspace cairns");
        let report = e.find_duplicates(std::slice::from_ref(&new), std::slice::from_ref(&existing));
        assert_eq!(report.pairs.len(), 1);
        let pair = &report.pairs[0];
        assert_eq!(pair.record_id, new.id);
        assert_eq!(pair.matched_id, existing.id);
        assert_eq!(pair.comparison, Comparison::Existing);
        assert!(pair.confidence >= 0.8);
    }

    #[test]
    fn test_different_records_not_paired() {
        let e = engine();
        let a = headspace("Headspace Cairns");
        let b = ServiceBuilder::new("Toowoomba Food Relief")
            .organization("Rotary Club")
            .address("99 Ruthven Street", "Toowoomba", "4350")
            .coordinates(-27.5606, 151.9507)
            .build();
        let report = e.find_duplicates(&[b], &[a]);
        assert!(report.pairs.is_empty());
        assert_eq!(report.stats.pairs_compared, 1);
    }

    #[test]
    fn test_tax_id_match_is_certain() {
        let e = engine();
        let a = ServiceBuilder::new("Alpha").organization("Alpha Org").tax_id("51 824 753 556").build();
        let b = ServiceBuilder::new("Completely Different").organization("Beta").tax_id("51824753556").build();
        let report = e.find_duplicates(&[b], &[a]);
        assert_eq!(report.pairs.len(), 1);
        assert_eq!(report.pairs[0].kind, MatchKind::TaxId);
        assert_eq!(report.pairs[0].confidence, 1.0);
    }

    #[test]
    fn test_contact_match() {
        let e = engine();
        let a = ServiceBuilder::new("Youth Support Line").phone("07 4000 1234").email("help@ysl.org.au").build();
        let b = ServiceBuilder::new("Youth Support Line QLD").phone("+61 7 4000 1234").email("HELP@ysl.org.au").build();
        let (kind, confidence) = e.evaluate(&e.similarity(&a, &b)).unwrap();
        assert_eq!(kind, MatchKind::Contact);
        assert!(confidence > 0.8);
    }

    #[test]
    fn test_fuzzy_name_needs_support() {
        let e = engine();
        let scores = SimilarityScores {
            name: 0.9,
            ..Default::default()
        };
        assert!(e.evaluate(&scores).is_none());
        let supported = SimilarityScores {
            name: 0.9,
            organization: 0.8,
            ..Default::default()
        };
        let (kind, _) = e.evaluate(&supported).unwrap();
        assert_eq!(kind, MatchKind::Fuzzy);
    }

    #[test]
    fn test_siblings_and_identical_ids() {
        let e = engine();
        let first = headspace("Headspace Cairns");
        let mut second = headspace("Headspace Cairns");
        let report = e.find_duplicates(&[first.clone(), second.clone()], &[]);
        assert_eq!(report.pairs.len(), 1);
        assert_eq!(report.pairs[0].record_id, second.id);
        assert_eq!(report.pairs[0].matched_id, first.id);
        assert_eq!(report.pairs[0].comparison, Comparison::Sibling);

        second.id = first.id;
        let report = e.find_duplicates(&[second], &[first]);
        assert!(report.pairs.is_empty());
        assert_eq!(report.stats.pairs_compared, 0);
    }

    #[test]
    fn test_blocking_reduces_comparisons() {
        let e = engine();
        let existing: Vec<Service> = (0..400)
            .map(|i| {
                ServiceBuilder::new(&format!("Service {i:03}"))
                    .address(&format!("{i} Long Road"), "Mount Isa", &format!("{}", 4000 + i))
                    .build()
            })
            .collect();
        let new = vec![
            ServiceBuilder::new("Zebra Crossing Youth Hub")
                .address("1 Short Street", "Mackay", "4740")
                .build(),
        ];
        let report = e.find_duplicates(&new, &existing);
        assert!(report.stats.blocking_used);
        assert!(report.stats.pairs_compared < 400);

        let small = e.find_duplicates(&new, &existing[..10]);
        assert!(!small.stats.blocking_used);
        assert_eq!(small.stats.pairs_compared, 10);
    }

    #[test]
    fn test_best_match_prefers_higher_confidence() {
        let e = engine();
        let strong = headspace("Headspace Cairns");
        let weaker = ServiceBuilder::new("Headspace Cairns Centre")
            .organization("Headspace")
            .address("14 Wharf Street", "Cairns", "4870")
            .build();
        let new = headspace("Headspace Cairns");
        let report = e.find_duplicates(std::slice::from_ref(&new), &[weaker, strong.clone()]);
        assert_eq!(report.best_match(new.id).map(|p| p.matched_id), Some(strong.id));
        assert!(report.duplicate_ids().contains(&new.id));
    }
}

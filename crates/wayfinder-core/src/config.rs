//! Source definitions.
//!
//! Every adapter is a [`GenericAdapter`](crate::adapter::GenericAdapter)
//! driven by one [`SourceConfig`]: where to fetch, how to parse, which raw
//! field names map to which logical field, and how free-text categories map
//! onto the closed taxonomy. Source files are TOML with one `[[sources]]`
//! table per source.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::models::{Category, OrganizationType, VerificationStatus};
use crate::rate_limiter::RateLimit;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Unique source name; also the `data_source` of every record it emits.
    pub name: String,
    #[serde(default)]
    pub kind: SourceKind,
    pub base_url: String,
    #[serde(default)]
    pub datasets: Vec<Dataset>,
    #[serde(default)]
    pub rate_limit: RateLimit,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub respect_robots_txt: bool,
    #[serde(default)]
    pub parser: ParserKind,
    #[serde(default)]
    pub fields: FieldMapping,
    #[serde(default)]
    pub categories: CategoryTable,
    #[serde(default)]
    pub regions: RegionRules,
    /// When non-empty, records must mention at least one keyword.
    #[serde(default)]
    pub relevance_keywords: Vec<String>,
    #[serde(default)]
    pub defaults: RecordDefaults,
    #[serde(default)]
    pub metadata: SourceMetadataConfig,
}

fn default_timeout_secs() -> u64 {
    30
}

impl SourceConfig {
    /// Minimal CSV source fetching `base_url` directly.
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: SourceKind::default(),
            base_url: base_url.into(),
            datasets: Vec::new(),
            rate_limit: RateLimit::default(),
            timeout_secs: default_timeout_secs(),
            user_agent: None,
            respect_robots_txt: false,
            parser: ParserKind::default(),
            fields: FieldMapping::default(),
            categories: CategoryTable::default(),
            regions: RegionRules::default(),
            relevance_keywords: Vec::new(),
            defaults: RecordDefaults::default(),
            metadata: SourceMetadataConfig::default(),
        }
    }

    pub fn with_parser(mut self, parser: ParserKind) -> Self {
        self.parser = parser;
        self
    }

    pub fn with_dataset(mut self, dataset: Dataset) -> Self {
        self.datasets.push(dataset);
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: RateLimit) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.name.trim().is_empty() {
            return Err(AppError::ConfigError("source name must not be empty".into()));
        }
        url::Url::parse(&self.base_url).map_err(|e| {
            AppError::ConfigError(format!("{}: invalid base_url {}: {e}", self.name, self.base_url))
        })?;
        for dataset in &self.datasets {
            url::Url::parse(&dataset.url).map_err(|e| {
                AppError::ConfigError(format!(
                    "{}: dataset {} has invalid url {}: {e}",
                    self.name, dataset.key, dataset.url
                ))
            })?;
        }
        self.rate_limit
            .validate()
            .map_err(|e| AppError::ConfigError(format!("{}: {e}", self.name)))?;
        if self.timeout_secs == 0 {
            return Err(AppError::ConfigError(format!(
                "{}: timeout_secs must be > 0",
                self.name
            )));
        }
        if let ParserKind::Html { record_selector, .. } = &self.parser
            && record_selector.trim().is_empty()
        {
            return Err(AppError::ConfigError(format!(
                "{}: html parser needs a record_selector",
                self.name
            )));
        }
        Ok(())
    }

    /// Datasets to fetch for an extraction. An empty `selected` list means
    /// every dataset; a source without datasets fetches `base_url`.
    pub fn datasets_for(&self, selected: &[String]) -> Vec<Dataset> {
        if self.datasets.is_empty() {
            return vec![Dataset {
                key: "default".into(),
                name: self.name.clone(),
                url: self.base_url.clone(),
                description: None,
            }];
        }
        self.datasets
            .iter()
            .filter(|d| selected.is_empty() || selected.iter().any(|s| s == &d.key))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Api,
    #[default]
    File,
    Scraper,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Api => "api",
            SourceKind::File => "file",
            SourceKind::Scraper => "scraper",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub key: String,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// How a fetched payload is split into raw records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ParserKind {
    #[default]
    Csv,
    Json {
        /// JSON pointer to the records array; empty for the document root.
        #[serde(default)]
        records_pointer: String,
    },
    Html {
        /// CSS selector matching one element per record.
        record_selector: String,
        /// Raw field name → CSS selector relative to the record element.
        #[serde(default)]
        fields: BTreeMap<String, String>,
    },
}

// ---------------------------------------------------------------------------
// Field mapping
// ---------------------------------------------------------------------------

/// Logical fields of the canonical schema that adapters look up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Name,
    Description,
    Categories,
    SourceUrl,
    Website,
    Email,
    Phone,
    ContactName,
    Address,
    Address2,
    City,
    State,
    Postcode,
    Latitude,
    Longitude,
    LocationName,
    WheelchairAccessible,
    Organization,
    OrgDescription,
    OrgEmail,
    OrgWebsite,
    TaxId,
    MinAge,
    MaxAge,
    Rating,
    VerificationStatus,
}

impl Field {
    /// Built-in aliases, most specific first.
    pub fn default_aliases(&self) -> &'static [&'static str] {
        match self {
            Field::Name => &["title", "name", "facility_name", "centre_name", "service_name"],
            Field::Description => &["description", "service_description", "details", "summary"],
            Field::Categories => &["categories", "category", "service_type", "type", "services"],
            Field::SourceUrl => &["url", "link", "source_url"],
            Field::Website => &["website", "web_site", "web", "url"],
            Field::Email => &["email", "contact_email", "email_address"],
            Field::Phone => &["phone", "telephone", "contact_phone", "phone_number"],
            Field::ContactName => &["contact_name", "contact_person"],
            Field::Address => &["address", "street_address", "address_1", "location"],
            Field::Address2 => &["address_2", "address_line_2"],
            Field::City => &["city", "suburb", "locality", "town"],
            Field::State => &["state", "state_province"],
            Field::Postcode => &["postcode", "postal_code", "post_code", "zip"],
            Field::Latitude => &["latitude", "lat"],
            Field::Longitude => &["longitude", "lng", "lon"],
            Field::LocationName => &["location_name", "site_name"],
            Field::WheelchairAccessible => &["wheelchair_accessible", "accessible"],
            Field::Organization => &[
                "organization",
                "organisation",
                "org_name",
                "provider",
                "agency",
                "department",
                "charity_legal_name",
            ],
            Field::OrgDescription => &["org_description", "agency_description"],
            Field::OrgEmail => &["org_email", "contact_email"],
            Field::OrgWebsite => &["org_website", "website"],
            Field::TaxId => &["abn", "acn", "tax_id"],
            Field::MinAge => &["min_age", "minimum_age", "age_from"],
            Field::MaxAge => &["max_age", "maximum_age", "age_to"],
            Field::Rating => &["rating", "community_rating"],
            Field::VerificationStatus => &["verification_status", "verified"],
        }
    }
}

/// Per-source alias overrides. A field listed here replaces its built-in
/// alias list entirely.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldMapping(BTreeMap<Field, Vec<String>>);

impl FieldMapping {
    pub fn with(mut self, field: Field, aliases: &[&str]) -> Self {
        self.0
            .insert(field, aliases.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn aliases(&self, field: Field) -> Vec<&str> {
        match self.0.get(&field) {
            Some(list) => list.iter().map(String::as_str).collect(),
            None => field.default_aliases().to_vec(),
        }
    }
}

// ---------------------------------------------------------------------------
// Category keyword table
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryRule {
    pub keyword: String,
    pub category: Category,
}

/// Ordered keyword → category table. Exact matches win over substring
/// matches; among substring matches the first rule wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CategoryTable(Vec<CategoryRule>);

impl Default for CategoryTable {
    fn default() -> Self {
        use Category::*;
        Self::from_pairs(&[
            ("legal", LegalAid),
            ("law", LegalAid),
            ("court", CourtSupport),
            ("youth justice", YouthJustice),
            ("mental health", MentalHealth),
            ("psychology", MentalHealth),
            ("counselling", MentalHealth),
            ("counseling", MentalHealth),
            ("housing", Housing),
            ("accommodation", Housing),
            ("homeless", Housing),
            ("crisis", CrisisSupport),
            ("emergency", CrisisSupport),
            ("education", EducationSupport),
            ("training", EducationSupport),
            ("drug", DrugAlcohol),
            ("alcohol", DrugAlcohol),
            ("substance", DrugAlcohol),
            ("family", FamilySupport),
            ("cultural", CulturalSupport),
            ("indigenous", CulturalSupport),
            ("community", CommunityService),
            ("health", HealthServices),
            ("employment", Employment),
            ("government", GovernmentService),
        ])
    }
}

impl CategoryTable {
    pub fn from_pairs(pairs: &[(&str, Category)]) -> Self {
        Self(
            pairs
                .iter()
                .map(|(k, c)| CategoryRule {
                    keyword: k.to_lowercase(),
                    category: *c,
                })
                .collect(),
        )
    }

    /// Map one free-text value. `None` if no rule matches.
    pub fn lookup(&self, raw: &str) -> Option<Category> {
        let needle = raw.trim().to_lowercase();
        if needle.is_empty() {
            return None;
        }
        if let Ok(exact) = needle.replace(' ', "_").parse::<Category>() {
            return Some(exact);
        }
        self.0
            .iter()
            .find(|r| r.keyword == needle)
            .or_else(|| self.0.iter().find(|r| needle.contains(&r.keyword)))
            .map(|r| r.category)
    }

    /// Distinct categories the table can produce.
    pub fn targets(&self) -> Vec<Category> {
        let mut out: Vec<Category> = self.0.iter().map(|r| r.category).collect();
        out.sort();
        out.dedup();
        out
    }
}

// ---------------------------------------------------------------------------
// Region rules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionRule {
    pub region: String,
    /// Inclusive postcode ranges.
    #[serde(default)]
    pub postcodes: Vec<(u32, u32)>,
    #[serde(default)]
    pub city_keywords: Vec<String>,
}

/// Postcode-range and city-keyword classification into coarse regions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionRules {
    /// State names/codes the rules apply to (case-insensitive).
    pub states: Vec<String>,
    pub rules: Vec<RegionRule>,
    /// Region for in-state locations no rule matches.
    pub fallback: String,
    /// Region for locations outside `states`.
    pub out_of_area: String,
}

impl Default for RegionRules {
    fn default() -> Self {
        let rule = |region: &str, lo: u32, hi: u32, city: &str| RegionRule {
            region: region.to_string(),
            postcodes: vec![(lo, hi)],
            city_keywords: vec![city.to_string()],
        };
        Self {
            states: vec!["qld".into(), "queensland".into()],
            rules: vec![
                rule("brisbane", 4000, 4179, "brisbane"),
                rule("gold_coast", 4200, 4299, "gold coast"),
                rule("sunshine_coast", 4550, 4579, "sunshine coast"),
                rule("townsville", 4810, 4819, "townsville"),
                rule("cairns", 4870, 4879, "cairns"),
                rule("toowoomba", 4350, 4359, "toowoomba"),
            ],
            fallback: "remote_queensland".into(),
            out_of_area: "out_of_area".into(),
        }
    }
}

impl RegionRules {
    pub fn classify(&self, postcode: &str, city: &str, state: &str) -> String {
        let state = state.trim().to_lowercase();
        if !state.is_empty() && !self.states.iter().any(|s| s.eq_ignore_ascii_case(&state)) {
            return self.out_of_area.clone();
        }

        let pc: Option<u32> = postcode.trim().parse().ok();
        let city = city.to_lowercase();
        self.rules
            .iter()
            .find(|r| {
                pc.is_some_and(|pc| r.postcodes.iter().any(|&(lo, hi)| (lo..=hi).contains(&pc)))
                    || r.city_keywords.iter().any(|k| !k.is_empty() && city.contains(&k.to_lowercase()))
            })
            .map(|r| r.region.clone())
            .unwrap_or_else(|| self.fallback.clone())
    }
}

// ---------------------------------------------------------------------------
// Defaults and metadata
// ---------------------------------------------------------------------------

/// Values applied when a record does not carry them itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordDefaults {
    #[serde(default = "default_state")]
    pub state: String,
    #[serde(default = "default_country")]
    pub country: String,
    #[serde(default)]
    pub verification_status: VerificationStatus,
    #[serde(default)]
    pub organization_name: Option<String>,
    /// Overrides name-based inference when set.
    #[serde(default)]
    pub organization_type: Option<OrganizationType>,
    /// Category used when a record has no category field at all.
    #[serde(default)]
    pub category: Option<Category>,
}

fn default_state() -> String {
    "QLD".to_string()
}
fn default_country() -> String {
    "AU".to_string()
}

impl Default for RecordDefaults {
    fn default() -> Self {
        Self {
            state: default_state(),
            country: default_country(),
            verification_status: VerificationStatus::default(),
            organization_name: None,
            organization_type: None,
            category: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceMetadataConfig {
    #[serde(default)]
    pub coverage: Option<String>,
    #[serde(default)]
    pub update_frequency: Option<String>,
    #[serde(default)]
    pub licensing: Option<String>,
    #[serde(default)]
    pub data_quality: Option<String>,
    #[serde(default)]
    pub estimated_records: Option<u64>,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SourcesFile {
    #[serde(default)]
    sources: Vec<SourceConfig>,
}

/// Parse and validate a TOML document of `[[sources]]` tables.
pub fn parse_sources(content: &str) -> Result<Vec<SourceConfig>, AppError> {
    let file: SourcesFile = toml::from_str(content)
        .map_err(|e| AppError::ConfigError(format!("Failed to parse sources file: {e}")))?;

    let mut seen = std::collections::HashSet::new();
    for source in &file.sources {
        source.validate()?;
        if !seen.insert(source.name.as_str()) {
            return Err(AppError::ConfigError(format!(
                "duplicate source name: {}",
                source.name
            )));
        }
    }
    Ok(file.sources)
}

pub fn load_sources(path: &Path) -> Result<Vec<SourceConfig>, AppError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        AppError::ConfigError(format!("Failed to read sources file {}: {e}", path.display()))
    })?;
    parse_sources(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_lookup_exact_before_substring() {
        let table = CategoryTable::default();
        assert_eq!(table.lookup("Legal"), Some(Category::LegalAid));
        assert_eq!(table.lookup("Community Legal Centre"), Some(Category::LegalAid));
        assert_eq!(table.lookup("Mental Health"), Some(Category::MentalHealth));
        assert_eq!(table.lookup("drug_alcohol"), Some(Category::DrugAlcohol));
        assert_eq!(table.lookup("basket weaving"), None);
    }

    #[test]
    fn test_region_classification() {
        let rules = RegionRules::default();
        assert_eq!(rules.classify("4000", "", "QLD"), "brisbane");
        assert_eq!(rules.classify("", "Surfers Paradise, Gold Coast", "Queensland"), "gold_coast");
        assert_eq!(rules.classify("4870", "", "qld"), "cairns");
        assert_eq!(rules.classify("4825", "Mount Isa", "QLD"), "remote_queensland");
        assert_eq!(rules.classify("2000", "Sydney", "NSW"), "out_of_area");
    }

    #[test]
    fn test_field_mapping_override() {
        let mapping = FieldMapping::default().with(Field::Name, &["service"]);
        assert_eq!(mapping.aliases(Field::Name), vec!["service"]);
        assert_eq!(mapping.aliases(Field::City)[0], "city");
    }

    #[test]
    fn test_datasets_for_selection() {
        let config = SourceConfig::new("qld", "https://data.qld.gov.au")
            .with_dataset(Dataset {
                key: "centres".into(),
                name: "Centres".into(),
                url: "https://data.qld.gov.au/centres.csv".into(),
                description: None,
            })
            .with_dataset(Dataset {
                key: "programs".into(),
                name: "Programs".into(),
                url: "https://data.qld.gov.au/programs.csv".into(),
                description: None,
            });
        assert_eq!(config.datasets_for(&[]).len(), 2);
        let picked = config.datasets_for(&["programs".to_string()]);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].key, "programs");

        let bare = SourceConfig::new("raw", "https://example.org/data.csv");
        assert_eq!(bare.datasets_for(&[])[0].url, "https://example.org/data.csv");
    }

    #[test]
    fn test_parse_sources_toml() {
        let toml = r#"
            [[sources]]
            name = "askizzy"
            kind = "api"
            base_url = "https://askizzy.org.au/api/v0/search"
            relevance_keywords = ["youth", "legal"]

            [sources.parser]
            type = "json"
            records_pointer = "/objects"

            [sources.rate_limit]
            requests = 30
            window_ms = 60000

            [sources.fields]
            name = ["name"]
            organization = ["organisation_name"]

            [[sources.categories]]
            keyword = "legal"
            category = "legal_aid"

            [sources.defaults]
            verification_status = "verified"
            organization_type = "non_profit"
        "#;
        let sources = parse_sources(toml).unwrap();
        assert_eq!(sources.len(), 1);
        let s = &sources[0];
        assert_eq!(s.kind, SourceKind::Api);
        assert_eq!(
            s.parser,
            ParserKind::Json {
                records_pointer: "/objects".into()
            }
        );
        assert_eq!(s.rate_limit.requests, 30);
        assert_eq!(s.fields.aliases(Field::Organization), vec!["organisation_name"]);
        assert_eq!(s.categories.lookup("legal"), Some(Category::LegalAid));
        assert_eq!(s.defaults.state, "QLD");
        assert_eq!(s.defaults.organization_type, Some(OrganizationType::NonProfit));
    }

    #[test]
    fn test_parse_sources_rejects_invalid() {
        let bad_url = r#"
            [[sources]]
            name = "x"
            base_url = "not a url"
        "#;
        assert!(matches!(parse_sources(bad_url), Err(AppError::ConfigError(_))));

        let dup = r#"
            [[sources]]
            name = "x"
            base_url = "https://a.example"
            [[sources]]
            name = "x"
            base_url = "https://b.example"
        "#;
        assert!(parse_sources(dup).is_err());
    }
}

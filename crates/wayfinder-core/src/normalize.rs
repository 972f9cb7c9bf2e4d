//! Raw record → canonical [`Service`].

use std::collections::BTreeSet;

use chrono::Utc;
use uuid::Uuid;

use crate::config::{CategoryTable, Field, FieldMapping, RecordDefaults, RegionRules, SourceConfig};
use crate::error::AppError;
use crate::models::{
    Category, Contact, Location, Organization, OrganizationType, Phone, Service, ServiceStatus,
    VerificationStatus,
};
use crate::parser::RawRecord;

const YOUTH_KEYWORDS: &[&str] = &["youth", "young", "teen", "adolescent", "juvenile", "child"];
const INDIGENOUS_KEYWORDS: &[&str] = &[
    "aboriginal",
    "indigenous",
    "torres strait",
    "first nations",
    "atsi",
];

/// Minimum name length for a record to be accepted.
pub const MIN_NAME_LEN: usize = 3;

/// Normalizes raw records for one source.
#[derive(Debug, Clone)]
pub struct Normalizer {
    source_name: String,
    fields: FieldMapping,
    categories: CategoryTable,
    regions: RegionRules,
    defaults: RecordDefaults,
}

impl Normalizer {
    pub fn new(config: &SourceConfig) -> Self {
        Self {
            source_name: config.name.clone(),
            fields: config.fields.clone(),
            categories: config.categories.clone(),
            regions: config.regions.clone(),
            defaults: config.defaults.clone(),
        }
    }

    pub fn categories(&self) -> &CategoryTable {
        &self.categories
    }

    fn get(&self, raw: &RawRecord, field: Field) -> Option<String> {
        raw.field(&self.fields.aliases(field))
    }

    /// Normalize one record. Fails only on malformed values (e.g. an
    /// unparseable coordinate); a record that is merely incomplete still
    /// normalizes and is rejected later by [`validate_service`].
    pub fn normalize(&self, raw: &RawRecord) -> Result<Service, AppError> {
        let now = Utc::now();
        let text = raw.text();

        let mut service = Service {
            id: Uuid::new_v4(),
            name: self.get(raw, Field::Name).unwrap_or_default(),
            description: self.get(raw, Field::Description).unwrap_or_default(),
            status: ServiceStatus::Active,
            categories: self.extract_categories(raw),
            data_source: self.source_name.clone(),
            source_url: self.get(raw, Field::SourceUrl),
            url: self.get(raw, Field::Website),
            verification_status: self
                .get(raw, Field::VerificationStatus)
                .map(|v| parse_verification(&v))
                .unwrap_or(self.defaults.verification_status),
            completeness_score: 0.0,
            verification_score: 0,
            community_rating: self
                .get(raw, Field::Rating)
                .and_then(|r| r.parse::<f64>().ok())
                .filter(|r| (0.0..=5.0).contains(r)),
            created_at: now,
            updated_at: now,
            youth_specific: contains_any(&text, YOUTH_KEYWORDS),
            indigenous_specific: contains_any(&text, INDIGENOUS_KEYWORDS),
            minimum_age: self.get(raw, Field::MinAge).and_then(|a| parse_age(&a)),
            maximum_age: self.get(raw, Field::MaxAge).and_then(|a| parse_age(&a)),
            organization: self.extract_organization(raw),
            locations: self.extract_locations(raw)?,
            contacts: self.extract_contacts(raw),
            possible_duplicate_of: None,
        };

        service.completeness_score = completeness_score(&service);
        Ok(service)
    }

    fn extract_categories(&self, raw: &RawRecord) -> BTreeSet<Category> {
        let Some(value) = raw.value(&self.fields.aliases(Field::Categories)) else {
            return BTreeSet::from([self.defaults.category.unwrap_or(Category::General)]);
        };

        let parts: Vec<String> = match value {
            serde_json::Value::Array(items) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            serde_json::Value::String(s) => s
                .split([',', ';', '|'])
                .map(str::to_string)
                .collect(),
            other => vec![other.to_string()],
        };

        let mut categories: BTreeSet<Category> = parts
            .iter()
            .filter(|p| !p.trim().is_empty())
            .map(|p| self.categories.lookup(p).unwrap_or(Category::General))
            .collect();

        if categories.len() > 1 {
            categories.remove(&Category::General);
        }
        if categories.is_empty() {
            categories.insert(Category::General);
        }
        categories
    }

    fn extract_organization(&self, raw: &RawRecord) -> Option<Organization> {
        let name = self
            .get(raw, Field::Organization)
            .or_else(|| self.defaults.organization_name.clone())?;
        let organization_type = self
            .defaults
            .organization_type
            .unwrap_or_else(|| infer_organization_type(&name));

        Some(Organization {
            id: Uuid::new_v4(),
            description: self.get(raw, Field::OrgDescription),
            organization_type,
            url: self.get(raw, Field::OrgWebsite),
            email: self.get(raw, Field::OrgEmail),
            tax_id: self.get(raw, Field::TaxId),
            verification_status: self.defaults.verification_status,
            name,
        })
    }

    fn extract_locations(&self, raw: &RawRecord) -> Result<Vec<Location>, AppError> {
        let address = self.get(raw, Field::Address);
        let city = self.get(raw, Field::City);
        if address.is_none() && city.is_none() {
            return Ok(vec![]);
        }

        let state = self
            .get(raw, Field::State)
            .unwrap_or_else(|| self.defaults.state.clone());
        let postcode = self.get(raw, Field::Postcode).unwrap_or_default();
        let city = city.unwrap_or_default();
        let latitude = self.coordinate(raw, Field::Latitude, 90.0)?;
        let longitude = self.coordinate(raw, Field::Longitude, 180.0)?;

        Ok(vec![Location {
            id: Uuid::new_v4(),
            name: self.get(raw, Field::LocationName),
            address_1: address.unwrap_or_default(),
            address_2: self.get(raw, Field::Address2),
            region: self.regions.classify(&postcode, &city, &state),
            city,
            state_province: state,
            postal_code: postcode,
            country: self.defaults.country.clone(),
            latitude,
            longitude,
            wheelchair_accessible: self
                .get(raw, Field::WheelchairAccessible)
                .is_some_and(|v| parse_bool(&v)),
        }])
    }

    fn coordinate(&self, raw: &RawRecord, field: Field, bound: f64) -> Result<Option<f64>, AppError> {
        let Some(text) = self.get(raw, field) else {
            return Ok(None);
        };
        let value: f64 = text
            .parse()
            .map_err(|_| AppError::ParseError(format!("invalid {field:?} value: {text}")))?;
        if !value.is_finite() || value.abs() > bound {
            return Err(AppError::ParseError(format!("{field:?} out of range: {value}")));
        }
        Ok(Some(value))
    }

    fn extract_contacts(&self, raw: &RawRecord) -> Vec<Contact> {
        let phone = self.get(raw, Field::Phone);
        let email = self.get(raw, Field::Email);
        if phone.is_none() && email.is_none() {
            return vec![];
        }
        vec![Contact {
            id: Uuid::new_v4(),
            name: self.get(raw, Field::ContactName),
            phones: phone.map(Phone::voice).into_iter().collect(),
            email,
        }]
    }

    /// Whether the record mentions any of the source's relevance keywords.
    pub fn is_relevant(raw: &RawRecord, keywords: &[String]) -> bool {
        if keywords.is_empty() {
            return true;
        }
        let text = raw.text();
        keywords.iter().any(|k| text.contains(&k.to_lowercase()))
    }
}

/// Organization type from keywords in its name, defaulting to community.
pub fn infer_organization_type(name: &str) -> OrganizationType {
    let name = name.to_lowercase();
    let has = |words: &[&str]| words.iter().any(|w| name.contains(w));

    if has(&["government", "department", "ministry", ".gov."]) {
        OrganizationType::Government
    } else if has(&["aboriginal", "indigenous", "torres strait"]) {
        OrganizationType::Indigenous
    } else if has(&["church", "religious", "faith"]) {
        OrganizationType::Religious
    } else if has(&["university", "college", "school"]) {
        OrganizationType::Educational
    } else if has(&["hospital", "health", "medical"]) {
        OrganizationType::Healthcare
    } else {
        OrganizationType::Community
    }
}

pub fn is_youth_specific(text: &str) -> bool {
    contains_any(&text.to_lowercase(), YOUTH_KEYWORDS)
}

pub fn is_indigenous_specific(text: &str) -> bool {
    contains_any(&text.to_lowercase(), INDIGENOUS_KEYWORDS)
}

fn contains_any(text: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|k| text.contains(k))
}

fn parse_age(text: &str) -> Option<u8> {
    let digits: String = text
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

fn parse_bool(text: &str) -> bool {
    matches!(text.trim().to_lowercase().as_str(), "true" | "yes" | "y" | "1")
}

fn parse_verification(text: &str) -> VerificationStatus {
    match text.trim().to_lowercase().as_str() {
        "verified" | "true" | "yes" => VerificationStatus::Verified,
        "pending" => VerificationStatus::Pending,
        _ => VerificationStatus::Unverified,
    }
}

/// Weighted field presence in [0, 1].
///
/// Core fields (name, description, categories) carry 40 points, contact
/// 25, location 25 and organization 10. Every term is a presence check,
/// so populating another field never lowers the score.
pub fn completeness_score(service: &Service) -> f64 {
    let mut score = 0u32;

    if service.name.trim().chars().count() >= MIN_NAME_LEN {
        score += 10;
    }
    let desc_len = service.description.trim().chars().count();
    if desc_len >= 20 {
        score += 15;
    }
    if desc_len >= 100 {
        score += 5;
    }
    if !service.categories.is_empty() {
        score += 10;
    }

    if service.primary_email().is_some() {
        score += 8;
    }
    if service.primary_phone().is_some() {
        score += 10;
    }
    if service.url.is_some() {
        score += 7;
    }

    if service.locations.iter().any(|l| !l.address_1.is_empty()) {
        score += 8;
    }
    if service.locations.iter().any(|l| !l.city.is_empty()) {
        score += 5;
    }
    if service.locations.iter().any(|l| !l.postal_code.is_empty()) {
        score += 4;
    }
    if service.locations.iter().any(Location::has_coordinates) {
        score += 8;
    }

    if let Some(org) = &service.organization {
        if !org.name.trim().is_empty() {
            score += 5;
        }
        if org.description.is_some() {
            score += 3;
        }
        score += 2;
    }

    (f64::from(score) / 100.0).clamp(0.0, 1.0)
}

/// Acceptance gate for normalized records.
pub fn validate_service(service: &Service) -> Result<(), AppError> {
    if service.name.trim().chars().count() < MIN_NAME_LEN {
        return Err(AppError::ValidationError(format!(
            "name must be at least {MIN_NAME_LEN} characters"
        )));
    }
    if service.categories.is_empty() {
        return Err(AppError::ValidationError("no categories".into()));
    }
    if !service.has_contact() && !service.has_location() {
        return Err(AppError::ValidationError(
            "record has neither contact nor location information".into(),
        ));
    }
    Ok(())
}

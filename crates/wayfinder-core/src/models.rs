use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Lifecycle status of a service listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    #[default]
    Active,
    Inactive,
}

/// How far a record has been checked against an authoritative party.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationStatus {
    #[default]
    Unverified,
    Pending,
    Verified,
}

impl VerificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationStatus::Unverified => "unverified",
            VerificationStatus::Pending => "pending",
            VerificationStatus::Verified => "verified",
        }
    }
}

impl fmt::Display for VerificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed set of organization kinds, inferred from the organization name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrganizationType {
    Government,
    Indigenous,
    Religious,
    Educational,
    Healthcare,
    #[default]
    Community,
    NonProfit,
}

impl OrganizationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrganizationType::Government => "government",
            OrganizationType::Indigenous => "indigenous",
            OrganizationType::Religious => "religious",
            OrganizationType::Educational => "educational",
            OrganizationType::Healthcare => "healthcare",
            OrganizationType::Community => "community",
            OrganizationType::NonProfit => "non_profit",
        }
    }
}

impl fmt::Display for OrganizationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrganizationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace(['-', ' '], "_").as_str() {
            "government" => Ok(OrganizationType::Government),
            "indigenous" => Ok(OrganizationType::Indigenous),
            "religious" => Ok(OrganizationType::Religious),
            "educational" => Ok(OrganizationType::Educational),
            "healthcare" => Ok(OrganizationType::Healthcare),
            "community" => Ok(OrganizationType::Community),
            "non_profit" | "nonprofit" => Ok(OrganizationType::NonProfit),
            _ => Err(format!("Unknown organization type: {s}")),
        }
    }
}

/// Service taxonomy. Unmapped input lands in [`Category::General`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    LegalAid,
    CourtSupport,
    MentalHealth,
    Housing,
    CrisisSupport,
    EducationSupport,
    DrugAlcohol,
    FamilySupport,
    CulturalSupport,
    CommunityService,
    HealthServices,
    Employment,
    YouthJustice,
    GovernmentService,
    General,
}

impl Category {
    pub const ALL: [Category; 15] = [
        Category::LegalAid,
        Category::CourtSupport,
        Category::MentalHealth,
        Category::Housing,
        Category::CrisisSupport,
        Category::EducationSupport,
        Category::DrugAlcohol,
        Category::FamilySupport,
        Category::CulturalSupport,
        Category::CommunityService,
        Category::HealthServices,
        Category::Employment,
        Category::YouthJustice,
        Category::GovernmentService,
        Category::General,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::LegalAid => "legal_aid",
            Category::CourtSupport => "court_support",
            Category::MentalHealth => "mental_health",
            Category::Housing => "housing",
            Category::CrisisSupport => "crisis_support",
            Category::EducationSupport => "education_support",
            Category::DrugAlcohol => "drug_alcohol",
            Category::FamilySupport => "family_support",
            Category::CulturalSupport => "cultural_support",
            Category::CommunityService => "community_service",
            Category::HealthServices => "health_services",
            Category::Employment => "employment",
            Category::YouthJustice => "youth_justice",
            Category::GovernmentService => "government_service",
            Category::General => "general",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim().to_lowercase();
        Category::ALL
            .into_iter()
            .find(|c| c.as_str() == key)
            .ok_or_else(|| format!("Unknown category: {s}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhoneType {
    #[default]
    Voice,
    Fax,
    Text,
    Tty,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phone {
    pub number: String,
    #[serde(rename = "type")]
    pub kind: PhoneType,
    pub language: String,
}

impl Phone {
    pub fn voice(number: impl Into<String>) -> Self {
        Self {
            number: number.into(),
            kind: PhoneType::Voice,
            language: "en".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub id: Uuid,
    pub name: Option<String>,
    pub phones: Vec<Phone>,
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub id: Uuid,
    pub name: Option<String>,
    pub address_1: String,
    pub address_2: Option<String>,
    pub city: String,
    pub state_province: String,
    pub postal_code: String,
    pub country: String,
    /// Coarse bucket (e.g. `brisbane`, `regional_queensland`).
    pub region: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub wheelchair_accessible: bool,
}

impl Location {
    pub fn has_coordinates(&self) -> bool {
        self.latitude.is_some() && self.longitude.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub organization_type: OrganizationType,
    pub url: Option<String>,
    pub email: Option<String>,
    /// ABN/ACN or equivalent registry number.
    pub tax_id: Option<String>,
    pub verification_status: VerificationStatus,
}

/// The canonical ingested record every adapter must emit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub status: ServiceStatus,
    pub categories: BTreeSet<Category>,
    pub data_source: String,
    pub source_url: Option<String>,
    /// Public website of the service.
    pub url: Option<String>,
    pub verification_status: VerificationStatus,
    /// Weighted field presence in [0, 1].
    pub completeness_score: f64,
    /// 0-100, set from the overall quality score when stored.
    pub verification_score: u8,
    /// Optional 0-5 community rating.
    pub community_rating: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub youth_specific: bool,
    pub indigenous_specific: bool,
    pub minimum_age: Option<u8>,
    pub maximum_age: Option<u8>,
    pub organization: Option<Organization>,
    pub locations: Vec<Location>,
    pub contacts: Vec<Contact>,
    /// Set by the pipeline when the duplicate policy is `flag`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub possible_duplicate_of: Option<Uuid>,
}

impl Service {
    /// First email across the service's contacts.
    pub fn primary_email(&self) -> Option<&str> {
        self.contacts.iter().find_map(|c| c.email.as_deref())
    }

    /// First phone number across the service's contacts.
    pub fn primary_phone(&self) -> Option<&str> {
        self.contacts
            .iter()
            .flat_map(|c| c.phones.iter())
            .map(|p| p.number.as_str())
            .next()
    }

    pub fn has_contact(&self) -> bool {
        self.contacts
            .iter()
            .any(|c| c.email.is_some() || !c.phones.is_empty())
    }

    pub fn has_location(&self) -> bool {
        !self.locations.is_empty()
    }

    pub fn organization_name(&self) -> Option<&str> {
        self.organization.as_ref().map(|o| o.name.as_str())
    }

    /// Stable identity used for upserts: hash of (organization, name).
    pub fn fingerprint(&self) -> String {
        let org = self.organization_name().unwrap_or_default();
        compute_hash(&format!(
            "{}\u{1f}{}",
            org.trim().to_lowercase(),
            self.name.trim().to_lowercase()
        ))
    }
}

/// Output format for report and log exports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Json,
    Csv,
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            _ => Err(format!("Unknown export format: {s} (expected json or csv)")),
        }
    }
}

/// Compute a SHA-256 hash of a string, returned as 64-char hex.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_hash_consistency() {
        let h1 = compute_hash("hello world");
        let h2 = compute_hash("hello world");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
    }

    #[test]
    fn test_category_roundtrip() {
        for cat in Category::ALL {
            let parsed: Category = cat.as_str().parse().unwrap();
            assert_eq!(parsed, cat);
        }
        assert!("basket_weaving".parse::<Category>().is_err());
    }

    #[test]
    fn test_category_serializes_snake_case() {
        let json = serde_json::to_string(&Category::DrugAlcohol).unwrap();
        assert_eq!(json, "\"drug_alcohol\"");
    }

    #[test]
    fn test_organization_type_parse() {
        assert_eq!(
            "non-profit".parse::<OrganizationType>().unwrap(),
            OrganizationType::NonProfit
        );
        assert!("guild".parse::<OrganizationType>().is_err());
    }

    #[test]
    fn test_verification_status_ordering() {
        assert!(VerificationStatus::Verified > VerificationStatus::Pending);
        assert!(VerificationStatus::Pending > VerificationStatus::Unverified);
    }
}

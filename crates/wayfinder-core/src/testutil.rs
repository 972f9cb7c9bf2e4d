//! Test utilities: hand-written doubles for the core seams.
//!
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing test
//! assertions on recorded calls. [`FixtureAdapter`] is the only place that
//! generates synthetic sample services.

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::adapter::{
    ExtractOptions, ExtractionResult, ExtractionStats, Pagination, SourceAdapter, SourceMetadata,
    ValidationReport,
};
use crate::error::AppError;
use crate::models::{
    Category, Contact, Location, Organization, OrganizationType, Phone, Service, ServiceStatus,
    VerificationStatus,
};
use crate::pipeline::{PipelineEvent, PipelineReporter};
use crate::quality::QualityAssessment;
use crate::traits::{Fetcher, ServiceFilter, ServiceStore};

// ---------------------------------------------------------------------------
// MockFetcher
// ---------------------------------------------------------------------------

/// Mock fetcher with a queue of responses.
///
/// Each call pops the front response; the last one is sticky and is
/// returned for every further call.
#[derive(Clone)]
pub struct MockFetcher {
    responses: Arc<Mutex<VecDeque<Result<String, AppError>>>>,
    urls: Arc<Mutex<Vec<String>>>,
}

impl MockFetcher {
    pub fn new(body: &str) -> Self {
        Self::with_responses(vec![Ok(body.to_string())])
    }

    pub fn with_error(error: AppError) -> Self {
        Self::with_responses(vec![Err(error)])
    }

    pub fn with_responses(responses: Vec<Result<String, AppError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses.into())),
            urls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn requested_urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }
}

impl Fetcher for MockFetcher {
    async fn fetch(&self, url: &str) -> Result<String, AppError> {
        self.urls.lock().unwrap().push(url.to_string());
        let mut responses = self.responses.lock().unwrap();
        if responses.len() > 1 {
            responses.pop_front().unwrap()
        } else {
            responses.front().cloned().unwrap_or_else(|| Ok(String::new()))
        }
    }
}

// ---------------------------------------------------------------------------
// MockStore
// ---------------------------------------------------------------------------

/// In-memory store that upserts by fingerprint and records every call.
#[derive(Clone, Default)]
pub struct MockStore {
    pub stored: Arc<Mutex<Vec<Service>>>,
    pub assessments: Arc<Mutex<Vec<QualityAssessment>>>,
    pub store_calls: Arc<AtomicUsize>,
    existing: Arc<Mutex<Vec<Service>>>,
    store_errors: Arc<Mutex<VecDeque<AppError>>>,
    lookup_error: Arc<Mutex<Option<AppError>>>,
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store already holding `services` (returned by `existing_services`).
    pub fn with_existing(services: Vec<Service>) -> Self {
        let store = Self::default();
        *store.existing.lock().unwrap() = services;
        store
    }

    /// The next `store` call fails with `error`.
    pub fn fail_next_store(self, error: AppError) -> Self {
        self.store_errors.lock().unwrap().push_back(error);
        self
    }

    /// The next `existing_services` call fails with `error`.
    pub fn fail_lookup(self, error: AppError) -> Self {
        *self.lookup_error.lock().unwrap() = Some(error);
        self
    }

    pub fn stored_services(&self) -> Vec<Service> {
        self.stored.lock().unwrap().clone()
    }
}

impl ServiceStore for MockStore {
    async fn store(
        &self,
        services: &[Service],
        assessments: &[QualityAssessment],
    ) -> Result<usize, AppError> {
        self.store_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = self.store_errors.lock().unwrap().pop_front() {
            return Err(e);
        }
        let mut stored = self.stored.lock().unwrap();
        for service in services {
            let fp = service.fingerprint();
            match stored.iter_mut().find(|s| s.fingerprint() == fp) {
                Some(existing) => *existing = service.clone(),
                None => stored.push(service.clone()),
            }
        }
        self.assessments
            .lock()
            .unwrap()
            .extend(assessments.iter().cloned());
        Ok(services.len())
    }

    async fn existing_services(&self, filter: &ServiceFilter) -> Result<Vec<Service>, AppError> {
        if let Some(e) = self.lookup_error.lock().unwrap().take() {
            return Err(e);
        }
        let existing = self.existing.lock().unwrap();
        let matching = existing.iter().filter(|s| filter.matches(s)).cloned();
        Ok(match filter.limit {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        })
    }
}

// ---------------------------------------------------------------------------
// FixtureAdapter
// ---------------------------------------------------------------------------

const SAMPLE_TOWNS: &[(&str, &str, f64, f64)] = &[
    ("Brisbane", "4000", -27.4698, 153.0251),
    ("Logan Central", "4114", -27.6394, 153.1094),
    ("Ipswich", "4305", -27.6144, 152.7580),
    ("Toowoomba", "4350", -27.5606, 151.9507),
    ("Townsville", "4810", -19.2590, 146.8169),
    ("Cairns", "4870", -16.9186, 145.7781),
    ("Mount Isa", "4825", -20.7256, 139.4927),
    ("Rockhampton", "4700", -23.3791, 150.5100),
];

const SAMPLE_PROGRAMS: &[(&str, Category)] = &[
    ("Youth Legal Advice", Category::LegalAid),
    ("Family Support Program", Category::FamilySupport),
    ("Youth Mental Health Hub", Category::MentalHealth),
    ("Crisis Accommodation", Category::Housing),
    ("Education Re-engagement", Category::EducationSupport),
    ("Cultural Mentoring", Category::CulturalSupport),
];

const SAMPLE_STREETS: &[&str] = &["Queen Street", "Flinders Street", "Ruthven Street", "Lake Street", "Brisbane Road"];

/// Pick from `items` by a seed byte.
fn pick<T>(items: &[T], seed: u8) -> &T {
    &items[usize::from(seed) % items.len()]
}

/// Source adapter test double serving a fixed or synthetic set of services.
pub struct FixtureAdapter {
    name: String,
    services: Vec<Service>,
    failures: Mutex<VecDeque<AppError>>,
    gate: Option<Arc<Semaphore>>,
    delay: Option<Duration>,
    valid: bool,
    extract_calls: AtomicUsize,
}

impl FixtureAdapter {
    pub fn new(name: &str, services: Vec<Service>) -> Self {
        Self {
            name: name.to_string(),
            services,
            failures: Mutex::new(VecDeque::new()),
            gate: None,
            delay: None,
            valid: true,
            extract_calls: AtomicUsize::new(0),
        }
    }

    /// `count` synthetic Queensland services with random towns, programs
    /// and phone numbers.
    pub fn random(name: &str, count: usize) -> Self {
        let services = (0..count)
            .map(|i| {
                let seed = Uuid::new_v4();
                let b = seed.as_bytes();
                let (town, postcode, lat, lng) = *pick(SAMPLE_TOWNS, b[0]);
                let (program, category) = *pick(SAMPLE_PROGRAMS, b[1]);
                let street = *pick(SAMPLE_STREETS, b[2]);
                ServiceBuilder::new(&format!("{town} {program} {i}"))
                    .data_source(name)
                    .description(&format!(
                        "{program} for young people and families in the {town} area."
                    ))
                    .category(category)
                    .organization(&format!("{town} Community Services"))
                    .phone(&format!("07 4{:03} {:04}", u16::from(b[3]) % 1000, u16::from_be_bytes([b[4], b[5]]) % 10000))
                    .address(&format!("{} {street}", 1 + b[6] % 200), town, postcode)
                    .coordinates(lat, lng)
                    .build()
            })
            .collect();
        Self::new(name, services)
    }

    /// The next `n` extract calls fail with `error` before any succeed.
    pub fn fail_times(self, n: usize, error: AppError) -> Self {
        {
            let mut failures = self.failures.lock().unwrap();
            for _ in 0..n {
                failures.push_back(error.clone());
            }
        }
        self
    }

    /// Each extract waits for a permit from `gate` before returning.
    pub fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn invalid(mut self) -> Self {
        self.valid = false;
        self
    }

    pub fn extract_calls(&self) -> usize {
        self.extract_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceAdapter for FixtureAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn validate(&self) -> ValidationReport {
        ValidationReport {
            is_valid: self.valid,
            message: if self.valid {
                format!("{} fixture ready", self.name)
            } else {
                format!("{} fixture unavailable", self.name)
            },
            diagnostics: Default::default(),
        }
    }

    async fn metadata(&self) -> SourceMetadata {
        SourceMetadata {
            name: self.name.clone(),
            kind: "fixture".to_string(),
            base_url: "memory://fixture".to_string(),
            coverage: Some("Queensland".to_string()),
            update_frequency: None,
            licensing: None,
            data_quality: None,
            estimated_records: Some(self.services.len() as u64),
            datasets: vec![],
            categories: self
                .services
                .iter()
                .flat_map(|s| s.categories.iter().copied())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect(),
            generated_at: Utc::now(),
        }
    }

    async fn extract(&self, options: &ExtractOptions) -> Result<ExtractionResult, AppError> {
        self.extract_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            let permit = gate.acquire().await.map_err(|_| AppError::Cancelled)?;
            permit.forget();
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(e) = self.failures.lock().unwrap().pop_front() {
            return Err(e);
        }

        let accepted: Vec<Service> = self
            .services
            .iter()
            .filter(|s| options.accepts(s))
            .cloned()
            .collect();
        let total = accepted.len();
        let start = options.offset.min(total);
        let end = options
            .limit
            .map_or(total, |l| start.saturating_add(l).min(total));

        Ok(ExtractionResult {
            services: accepted[start..end].to_vec(),
            pagination: Pagination {
                total,
                offset: options.offset,
                limit: options.limit,
                has_more: end < total,
            },
            stats: ExtractionStats {
                records_processed: self.services.len(),
                records_extracted: total,
                records_filtered: self.services.len() - total,
                ..Default::default()
            },
        })
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Reporter that records every pipeline event in order.
#[derive(Clone, Default)]
pub struct MockReporter {
    pub events: Arc<Mutex<Vec<PipelineEvent>>>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().iter().map(PipelineEvent::kind).collect()
    }

    /// Job ids in the order they started.
    pub fn started(&self) -> Vec<Uuid> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                PipelineEvent::JobStarted { job_id, .. } => Some(*job_id),
                _ => None,
            })
            .collect()
    }
}

impl PipelineReporter for MockReporter {
    fn report(&self, event: &PipelineEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

// ---------------------------------------------------------------------------
// ServiceBuilder
// ---------------------------------------------------------------------------

/// Builder for canonical services in tests.
pub struct ServiceBuilder {
    service: Service,
}

impl ServiceBuilder {
    pub fn new(name: &str) -> Self {
        let now = Utc::now();
        Self {
            service: Service {
                id: Uuid::new_v4(),
                name: name.to_string(),
                description: String::new(),
                status: ServiceStatus::Active,
                categories: BTreeSet::from([Category::General]),
                data_source: "test".to_string(),
                source_url: None,
                url: None,
                verification_status: VerificationStatus::Unverified,
                completeness_score: 0.0,
                verification_score: 0,
                community_rating: None,
                created_at: now,
                updated_at: now,
                youth_specific: false,
                indigenous_specific: false,
                minimum_age: None,
                maximum_age: None,
                organization: None,
                locations: Vec::new(),
                contacts: Vec::new(),
                possible_duplicate_of: None,
            },
        }
    }

    pub fn data_source(mut self, source: &str) -> Self {
        self.service.data_source = source.to_string();
        self
    }

    pub fn description(mut self, description: &str) -> Self {
        self.service.description = description.to_string();
        self
    }

    /// Replaces the default `general` category on first use.
    pub fn category(mut self, category: Category) -> Self {
        self.service.categories.remove(&Category::General);
        self.service.categories.insert(category);
        self
    }

    pub fn url(mut self, url: &str) -> Self {
        self.service.url = Some(url.to_string());
        self
    }

    pub fn youth_specific(mut self) -> Self {
        self.service.youth_specific = true;
        self
    }

    pub fn organization(mut self, name: &str) -> Self {
        self.org().name = name.to_string();
        self
    }

    pub fn tax_id(mut self, tax_id: &str) -> Self {
        self.org().tax_id = Some(tax_id.to_string());
        self
    }

    fn org(&mut self) -> &mut Organization {
        self.service.organization.get_or_insert_with(|| Organization {
            id: Uuid::new_v4(),
            name: String::new(),
            description: None,
            organization_type: OrganizationType::Community,
            url: None,
            email: None,
            tax_id: None,
            verification_status: VerificationStatus::Unverified,
        })
    }

    fn contact(&mut self) -> &mut Contact {
        if self.service.contacts.is_empty() {
            self.service.contacts.push(Contact {
                id: Uuid::new_v4(),
                name: None,
                phones: Vec::new(),
                email: None,
            });
        }
        &mut self.service.contacts[0]
    }

    pub fn phone(mut self, number: &str) -> Self {
        self.contact().phones.push(Phone::voice(number));
        self
    }

    pub fn email(mut self, email: &str) -> Self {
        self.contact().email = Some(email.to_string());
        self
    }

    pub fn address(mut self, street: &str, city: &str, postcode: &str) -> Self {
        self.service.locations.push(Location {
            id: Uuid::new_v4(),
            name: None,
            address_1: street.to_string(),
            address_2: None,
            city: city.to_string(),
            state_province: "QLD".to_string(),
            postal_code: postcode.to_string(),
            country: "AU".to_string(),
            region: String::new(),
            latitude: None,
            longitude: None,
            wheelchair_accessible: false,
        });
        self
    }

    /// Sets coordinates on the most recently added location.
    pub fn coordinates(mut self, lat: f64, lng: f64) -> Self {
        if let Some(loc) = self.service.locations.last_mut() {
            loc.latitude = Some(lat);
            loc.longitude = Some(lng);
        }
        self
    }

    pub fn build(self) -> Service {
        self.service
    }
}

/// A service that passes validation and scores well.
pub fn sample_service(name: &str) -> Service {
    ServiceBuilder::new(name)
        .data_source("Queensland Government")
        .description("Free legal advice and court support for young people aged 10 to 17 across Queensland, including duty lawyer services.")
        .category(Category::LegalAid)
        .organization("Legal Aid Queensland")
        .url("https://www.legalaid.qld.gov.au")
        .phone("1300 651 188")
        .email("youth@legalaid.qld.gov.au")
        .address("44 Herschel Street", "Brisbane", "4000")
        .coordinates(-27.4667, 153.0217)
        .build()
}

use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::models::Service;
use crate::quality::QualityAssessment;

/// Fetches a raw payload (CSV, JSON, HTML) from a URL.
pub trait Fetcher: Send + Sync + Clone {
    fn fetch(&self, url: &str) -> impl Future<Output = Result<String, AppError>> + Send;
}

/// Which stored services to load for cross-run deduplication.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceFilter {
    /// Restrict to these `data_source` values; empty means all sources.
    #[serde(default)]
    pub data_sources: Vec<String>,
    /// Restrict to services with a location in these postcodes.
    #[serde(default)]
    pub postcodes: Vec<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl ServiceFilter {
    pub fn matches(&self, service: &Service) -> bool {
        (self.data_sources.is_empty() || self.data_sources.contains(&service.data_source))
            && (self.postcodes.is_empty()
                || service
                    .locations
                    .iter()
                    .any(|l| self.postcodes.contains(&l.postal_code)))
    }
}

/// The persistence collaborator.
///
/// Storage is an upsert keyed by (organization name, service name), so
/// storing the same batch twice is idempotent. No transaction spans a
/// batch: records stored before a failure stay stored.
pub trait ServiceStore: Send + Sync + Clone {
    /// Upsert services with their assessments (matched by `service_id`).
    /// Returns the number of services written.
    fn store(
        &self,
        services: &[Service],
        assessments: &[QualityAssessment],
    ) -> impl Future<Output = Result<usize, AppError>> + Send;

    /// Previously stored services, for deduplication.
    fn existing_services(
        &self,
        filter: &ServiceFilter,
    ) -> impl Future<Output = Result<Vec<Service>, AppError>> + Send;
}

/// A no-op ServiceStore for dry runs.
#[derive(Debug, Clone)]
pub struct NullStore;

impl ServiceStore for NullStore {
    async fn store(
        &self,
        _services: &[Service],
        _assessments: &[QualityAssessment],
    ) -> Result<usize, AppError> {
        Ok(0)
    }

    async fn existing_services(&self, _filter: &ServiceFilter) -> Result<Vec<Service>, AppError> {
        Ok(vec![])
    }
}

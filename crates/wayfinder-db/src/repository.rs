use std::collections::HashMap;

use sqlx::{PgPool, Pool, Postgres};
use uuid::Uuid;
use wayfinder_core::error::AppError;
use wayfinder_core::models::Service;
use wayfinder_core::quality::QualityAssessment;
use wayfinder_core::traits::{ServiceFilter, ServiceStore};

fn db_err(e: sqlx::Error) -> AppError {
    AppError::PersistenceError(e.to_string())
}

/// PostgreSQL-backed service store.
///
/// Each service is one row keyed by its fingerprint, with the full record
/// kept as JSONB and the quality assessment alongside it. Re-storing a
/// service updates the row in place and keeps its original id.
#[derive(Clone)]
pub struct ServiceRepository {
    pool: Pool<Postgres>,
}

impl ServiceRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert or update one service. Returns the stored row's id.
    pub async fn upsert(
        &self,
        service: &Service,
        assessment: Option<&QualityAssessment>,
    ) -> Result<Uuid, AppError> {
        let postcodes: Vec<String> = service
            .locations
            .iter()
            .map(|l| l.postal_code.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        let record = serde_json::to_value(service)?;
        let quality = assessment.map(serde_json::to_value).transpose()?;

        let row: (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO services (
                id, fingerprint, name, organization_name, data_source, postcodes, record,
                completeness_score, verification_score, quality, quality_level,
                possible_duplicate_of, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, NOW())
            ON CONFLICT (fingerprint) DO UPDATE SET
                name = EXCLUDED.name,
                organization_name = EXCLUDED.organization_name,
                data_source = EXCLUDED.data_source,
                postcodes = EXCLUDED.postcodes,
                record = EXCLUDED.record,
                completeness_score = EXCLUDED.completeness_score,
                verification_score = EXCLUDED.verification_score,
                quality = COALESCE(EXCLUDED.quality, services.quality),
                quality_level = COALESCE(EXCLUDED.quality_level, services.quality_level),
                possible_duplicate_of = NULLIF(EXCLUDED.possible_duplicate_of, services.id),
                updated_at = NOW()
            RETURNING id
            "#,
        )
        .bind(service.id)
        .bind(service.fingerprint())
        .bind(&service.name)
        .bind(service.organization_name())
        .bind(&service.data_source)
        .bind(&postcodes)
        .bind(&record)
        .bind(service.completeness_score)
        .bind(i16::from(service.verification_score))
        .bind(&quality)
        .bind(assessment.map(|a| a.quality_level.as_str()))
        .bind(service.possible_duplicate_of)
        .bind(service.created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.0)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Service>, AppError> {
        let row = sqlx::query_as::<_, ServiceRow>(
            "SELECT id, record, possible_duplicate_of FROM services WHERE id = $1",
        )
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row.map(Service::try_from).transpose()
    }

    /// Stored services matching `filter`, most recently updated first.
    pub async fn list(&self, filter: &ServiceFilter) -> Result<Vec<Service>, AppError> {
        let rows = sqlx::query_as::<_, ServiceRow>(
            r#"
            SELECT id, record, possible_duplicate_of FROM services
            WHERE (cardinality($1::text[]) = 0 OR data_source = ANY($1))
              AND (cardinality($2::text[]) = 0 OR postcodes && $2)
            ORDER BY updated_at DESC
            LIMIT $3
            "#,
        )
        .bind(&filter.data_sources)
        .bind(&filter.postcodes)
        .bind(filter.limit.map(|l| l as i64))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let id = row.id;
                Service::try_from(row)
                    .inspect_err(|e| tracing::warn!(%id, error = %e, "Skipping unreadable stored service"))
                    .ok()
            })
            .collect())
    }

    /// Stored quality assessments matching `filter`, for report exports.
    pub async fn assessments(&self, filter: &ServiceFilter) -> Result<Vec<QualityAssessment>, AppError> {
        let rows: Vec<(serde_json::Value,)> = sqlx::query_as(
            r#"
            SELECT quality FROM services
            WHERE quality IS NOT NULL
              AND (cardinality($1::text[]) = 0 OR data_source = ANY($1))
              AND (cardinality($2::text[]) = 0 OR postcodes && $2)
            ORDER BY updated_at DESC
            LIMIT $3
            "#,
        )
        .bind(&filter.data_sources)
        .bind(&filter.postcodes)
        .bind(filter.limit.map(|l| l as i64))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.into_iter()
            .map(|(quality,)| Ok(serde_json::from_value(quality)?))
            .collect()
    }

    /// Point a stored row at the row it likely duplicates. A reference to
    /// the row itself is cleared.
    pub async fn set_duplicate_of(&self, id: Uuid, duplicate_of: Option<Uuid>) -> Result<(), AppError> {
        sqlx::query("UPDATE services SET possible_duplicate_of = NULLIF($2, id) WHERE id = $1")
            .bind(id)
            .bind(duplicate_of)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    pub async fn count(&self) -> Result<i64, AppError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM services")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.0)
    }

    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

// -- Internal row type for sqlx deserialization --

#[derive(sqlx::FromRow)]
struct ServiceRow {
    id: Uuid,
    record: serde_json::Value,
    possible_duplicate_of: Option<Uuid>,
}

impl TryFrom<ServiceRow> for Service {
    type Error = AppError;

    fn try_from(row: ServiceRow) -> Result<Self, Self::Error> {
        let mut service: Service = serde_json::from_value(row.record)?;
        service.id = row.id;
        // The column wins over the record's copy.
        service.possible_duplicate_of = row.possible_duplicate_of;
        Ok(service)
    }
}

// -- Trait implementation --

impl ServiceStore for ServiceRepository {
    async fn store(
        &self,
        services: &[Service],
        assessments: &[QualityAssessment],
    ) -> Result<usize, AppError> {
        let mut stored = 0;
        let mut persisted: HashMap<Uuid, Uuid> = HashMap::with_capacity(services.len());
        for service in services {
            let assessment = assessments.iter().find(|a| a.service_id == service.id);
            let id = self.upsert(service, assessment).await?;
            persisted.insert(service.id, id);
            stored += 1;
        }

        // Sibling flags must name persisted row ids, not batch ids.
        for service in services {
            let (Some(target), Some(&id)) = (service.possible_duplicate_of, persisted.get(&service.id)) else {
                continue;
            };
            if let Some(&resolved) = persisted.get(&target)
                && (resolved != target || id != service.id)
            {
                self.set_duplicate_of(id, Some(resolved)).await?;
            }
        }
        tracing::debug!(stored, "Stored services");
        Ok(stored)
    }

    async fn existing_services(&self, filter: &ServiceFilter) -> Result<Vec<Service>, AppError> {
        self.list(filter).await
    }
}

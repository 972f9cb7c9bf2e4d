use std::sync::Arc;

use wayfinder_core::job::{CreateJobRequest, JobStatus, PipelineConfig};
use wayfinder_core::pipeline::PipelineManager;
use wayfinder_core::quality::{QualityConfig, QualityEngine};
use wayfinder_core::testutil::{FixtureAdapter, ServiceBuilder, sample_service};
use wayfinder_core::traits::{ServiceFilter, ServiceStore};
use wayfinder_db::{Database, ServiceRepository};

use crate::common::setup_test_db;

#[tokio::test]
async fn store_and_read_back_services() {
    let (pool, _container) = setup_test_db().await;
    let repo = ServiceRepository::new(pool);
    let engine = QualityEngine::new(QualityConfig::default()).unwrap();

    let services = vec![
        sample_service("Youth Legal Advice Line"),
        sample_service("Duty Lawyer Court Support"),
    ];
    let batch = engine.assess_batch(&services);

    let stored = repo.store(&services, &batch.assessments).await.unwrap();
    assert_eq!(stored, 2);
    assert_eq!(repo.count().await.unwrap(), 2);

    let loaded = repo.get(services[0].id).await.unwrap().expect("service should exist");
    assert_eq!(loaded, services[0]);

    let assessments = repo.assessments(&ServiceFilter::default()).await.unwrap();
    assert_eq!(assessments.len(), 2);
    assert!(assessments.iter().any(|a| a.service_id == services[1].id));
}

#[tokio::test]
async fn restoring_same_fingerprint_updates_in_place() {
    let (pool, _container) = setup_test_db().await;
    let repo = ServiceRepository::new(pool);

    let original = sample_service("Youth Legal Advice Line");
    let first_id = repo.upsert(&original, None).await.unwrap();

    let mut refreshed = sample_service("Youth Legal Advice Line");
    refreshed.description = "Updated description for the youth legal advice line service.".into();
    let second_id = repo.upsert(&refreshed, None).await.unwrap();

    assert_eq!(first_id, second_id);
    assert_eq!(repo.count().await.unwrap(), 1);
    let loaded = repo.get(first_id).await.unwrap().unwrap();
    assert_eq!(loaded.id, original.id);
    assert_eq!(loaded.description, refreshed.description);
}

#[tokio::test]
async fn existing_services_respects_filter() {
    let (pool, _container) = setup_test_db().await;
    let repo = ServiceRepository::new(pool);

    let brisbane = ServiceBuilder::new("Brisbane Youth Hub")
        .data_source("qld-open-data")
        .address("1 Queen Street", "Brisbane", "4000")
        .build();
    let cairns = ServiceBuilder::new("Cairns Youth Hub")
        .data_source("qld-open-data")
        .address("2 Lake Street", "Cairns", "4870")
        .build();
    let other = ServiceBuilder::new("Logan Family Support")
        .data_source("ask-izzy")
        .address("3 Wembley Road", "Logan Central", "4114")
        .build();
    repo.store(&[brisbane.clone(), cairns, other], &[]).await.unwrap();

    let by_source = repo
        .existing_services(&ServiceFilter {
            data_sources: vec!["qld-open-data".into()],
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(by_source.len(), 2);

    let by_postcode = repo
        .existing_services(&ServiceFilter {
            postcodes: vec!["4000".into()],
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(by_postcode.len(), 1);
    assert_eq!(by_postcode[0].id, brisbane.id);

    let limited = repo
        .existing_services(&ServiceFilter {
            limit: Some(1),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(limited.len(), 1);
}

#[tokio::test]
async fn pipeline_stores_into_postgres() {
    let (pool, _container) = setup_test_db().await;
    let db = Database::from_pool(pool);
    db.migrate().await.unwrap();
    let repo = db.service_repo();

    let pm = PipelineManager::builder(repo.clone())
        .with_config(PipelineConfig::default().with_min_quality_score(0.0))
        .with_adapter(Arc::new(FixtureAdapter::random("fixture", 25)))
        .build()
        .unwrap();

    let id = pm.create_job(CreateJobRequest::new("fixture")).await.unwrap();
    pm.wait_idle().await;

    let job = pm.get_job_status(id).unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    let result = job.result.unwrap();
    assert_eq!(result.extracted, 25);
    assert_eq!(repo.count().await.unwrap(), result.stored as i64);

    // Re-running the same source upserts over the first run's rows.
    let id = pm.create_job(CreateJobRequest::new("fixture")).await.unwrap();
    pm.wait_idle().await;
    let rerun = pm.get_job_status(id).unwrap().result.unwrap();
    assert_eq!(rerun.stored, result.stored);
    assert_eq!(repo.count().await.unwrap(), result.stored as i64);
}

#[tokio::test]
async fn restoring_flagged_batch_never_points_at_itself() {
    let (pool, _container) = setup_test_db().await;
    let repo = ServiceRepository::new(pool);

    let first = vec![
        sample_service("Youth Legal Advice Line"),
        sample_service("Duty Lawyer Court Support"),
    ];
    repo.store(&first, &[]).await.unwrap();

    // A second run re-extracts the same services under fresh ids, flagged
    // as duplicates of the stored rows.
    let rerun: Vec<_> = first
        .iter()
        .map(|s| {
            let mut again = sample_service(&s.name);
            again.possible_duplicate_of = Some(s.id);
            again
        })
        .collect();
    repo.store(&rerun, &[]).await.unwrap();

    assert_eq!(repo.count().await.unwrap(), 2);
    for original in &first {
        let loaded = repo.get(original.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, original.id);
        assert_ne!(loaded.possible_duplicate_of, Some(original.id));
        assert_eq!(loaded.possible_duplicate_of, None);
    }
    for service in repo.list(&ServiceFilter::default()).await.unwrap() {
        assert_ne!(service.possible_duplicate_of, Some(service.id));
    }
}

#[tokio::test]
async fn sibling_flag_resolves_to_persisted_row() {
    let (pool, _container) = setup_test_db().await;
    let repo = ServiceRepository::new(pool);

    let hub = sample_service("Brisbane Youth Hub");
    let helpline = sample_service("Youth Legal Advice Line");
    repo.store(&[hub.clone(), helpline.clone()], &[]).await.unwrap();

    // Re-extracted hub (new id, conflicts with the stored row) and a new
    // near-duplicate sibling flagged against the re-extracted hub.
    let hub_again = sample_service("Brisbane Youth Hub");
    let mut sibling = sample_service("Brisbane Youth Hub Inc");
    sibling.possible_duplicate_of = Some(hub_again.id);
    repo.store(&[hub_again.clone(), sibling.clone()], &[]).await.unwrap();

    let loaded = repo.get(sibling.id).await.unwrap().unwrap();
    assert_eq!(loaded.possible_duplicate_of, Some(hub.id));
    assert!(repo.get(hub_again.id).await.unwrap().is_none());
}

//! Integration tests for the PostgreSQL job store.
//!
//! Requires a running Postgres instance reachable through `DATABASE_URL`.
//! Run with:
//! `cargo test --test postgres_store --features postgres -- --ignored`

#![cfg(feature = "postgres")]

use chrono::{Duration, Utc};
use jobchain::persistence::PostgresJobStore;
use jobchain::*;
use jobchain_testkit::{entity, entry};
use sqlx::PgPool;

async fn connect() -> PostgresJobStore {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = PgPool::connect(&url).await.expect("connect to postgres");
    let store = PostgresJobStore::new(pool);
    store.ensure_schema().await.expect("ensure_schema");
    store
}

/// Random positive id, so runs do not see each other's rows.
fn unique_id() -> i64 {
    (JobId::new().as_uuid().as_u128() & 0x7fff_ffff_ffff_ffff) as i64
}

fn unique_owner() -> OwnerId {
    OwnerId(unique_id())
}

#[tokio::test]
#[ignore]
async fn insert_fetch_preserves_record() {
    let store = connect().await;
    let job = JobRecord::new(
        unique_owner(),
        Some(TargetRef::Entity(entity(77))),
        codes::EDIT_ENTITY,
        "queued",
        JobParams::from_json_str(r#"{"b":2,"a":1}"#),
    );
    store.insert(job.clone()).await.unwrap();

    let fetched = store.fetch(job.id).await.unwrap().unwrap();
    assert_eq!(fetched.target, job.target);
    assert_eq!(fetched.status, JobStatus::Preparing);
    assert_eq!(fetched.params.as_str(), r#"{"a":1,"b":2}"#);
}

#[tokio::test]
#[ignore]
async fn modify_applies_update_rules() {
    let store = connect().await;
    let registry = OperationRegistry::with_core_operations();
    let job = JobRecord::new(
        unique_owner(),
        Some(TargetRef::Entry(entry(5))),
        codes::EDIT_ENTRY,
        "",
        JobParams::empty(),
    );
    store.insert(job.clone()).await.unwrap();

    let applied = apply_update(
        &store,
        &registry,
        job.id,
        &JobUpdate::status(JobStatus::Done).with_text("ok"),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(applied.record.status, JobStatus::Done);

    let error = JobUpdate::status(JobStatus::Error);
    let frozen = apply_update(&store, &registry, job.id, &error)
        .await
        .unwrap()
        .unwrap();
    assert!(frozen.effect.frozen);
    let stored = store.fetch(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Done);
}

#[tokio::test]
#[ignore]
async fn latest_active_and_detach() {
    let store = connect().await;
    let owner = unique_owner();
    let target_id = unique_id();
    let first = JobRecord::new(
        owner,
        Some(TargetRef::Entry(entry(target_id))),
        codes::DELETE_ENTRY,
        "",
        JobParams::empty(),
    );
    let mut second = first.clone();
    second.id = JobId::new();
    second.created_at = first.created_at + Duration::milliseconds(5);
    store.insert(first.clone()).await.unwrap();
    store.insert(second.clone()).await.unwrap();

    let target = first.target_key().unwrap();
    let since = Utc::now() - Duration::hours(1);
    let latest = store
        .latest_active(target, codes::DELETE_ENTRY, since)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest.id, second.id);

    assert_eq!(store.detach_target(target).await.unwrap(), 2);
    let detached = store.fetch(first.id).await.unwrap().unwrap();
    assert_eq!(detached.target, None);
    assert_eq!(detached.target_kind, TargetKind::Entry);

    let listed = store.list_by_owner(owner, 10, &[]).await.unwrap();
    assert_eq!(listed.len(), 2);
    assert!(
        store
            .list_by_owner(owner, 10, &[codes::DELETE_ENTRY])
            .await
            .unwrap()
            .is_empty()
    );
}

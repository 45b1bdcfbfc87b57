//! Race and failure handling of the visit upsert engine
//!
//! The pooled tests use a file-backed SQLite database so that several
//! connections really do write at the same time on a multi-thread runtime.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use visitrack::models::{NewVisit, Visit, VisitAttributes, VisitableCounters, VisitableRef};
use visitrack::storage::{SqliteStore, StorageError, StorageResult, VisitScope, VisitStore};
use visitrack::{EntityRef, Identifiers, Registry, VisitError, VisitTracker, VisitableOptions};

fn create_registry() -> Arc<Registry> {
    Arc::new(
        Registry::builder()
            .visitor_type("user")
            .visitable(
                VisitableOptions::new("post")
                    .by(["users"])
                    .accept_ip(true)
                    .counter_cache(true),
            )
            .visitable(VisitableOptions::new("page").accept_ip(true))
            .build()
            .unwrap(),
    )
}

/// Fresh on-disk database URL
fn temp_database_url(label: &str) -> String {
    format!(
        "sqlite://{}/visitrack-{label}-{}.db?mode=rwc",
        std::env::temp_dir().display(),
        Utc::now().timestamp_nanos_opt().unwrap_or_default()
    )
}

async fn create_file_store(url: &str) -> Arc<dyn VisitStore> {
    let store = SqliteStore::new(url, 5, Vec::new()).await.unwrap();
    store.init().await.unwrap();
    Arc::new(store)
}

async fn create_memory_store() -> Arc<dyn VisitStore> {
    let store = SqliteStore::new("sqlite::memory:", 1, Vec::new())
        .await
        .unwrap();
    store.init().await.unwrap();
    Arc::new(store)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pooled_concurrent_visits_same_visitor() {
    let store = create_file_store(&temp_database_url("same-visitor")).await;
    let tracker = Arc::new(VisitTracker::new(store, create_registry()));
    let post = EntityRef::new("post", 1);
    tracker.visitable(post.clone()).unwrap().created().await.unwrap();

    let mut handles = vec![];
    for _ in 0..50 {
        let tracker = Arc::clone(&tracker);
        let post = post.clone();
        handles.push(tokio::spawn(async move {
            tracker
                .visitable(post)?
                .visit(&Identifiers::user(EntityRef::new("user", 7)))
                .await
        }));
    }

    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let visitable = tracker.visitable(post).unwrap();
    let rows = visitable.visits(VisitScope::new()).await.unwrap();
    assert_eq!(rows.len(), 1, "Exactly one row per pairing");
    assert_eq!(rows[0].count, 50);

    assert_eq!(visitable.total_visits(false).await.unwrap(), 50);
    assert_eq!(visitable.unique_visits(false).await.unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pooled_concurrent_visits_many_ips() {
    let store = create_file_store(&temp_database_url("many-ips")).await;
    let tracker = Arc::new(VisitTracker::new(store, create_registry()));
    let post = EntityRef::new("post", 1);
    tracker.visitable(post.clone()).unwrap().created().await.unwrap();

    let mut handles = vec![];
    for i in 0..60 {
        let tracker = Arc::clone(&tracker);
        let post = post.clone();
        handles.push(tokio::spawn(async move {
            let ip = format!("198.51.100.{}", i % 6);
            tracker.visitable(post)?.visit(&Identifiers::ip(ip)).await
        }));
    }

    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let visitable = tracker.visitable(post).unwrap();
    assert_eq!(visitable.visits(VisitScope::new()).await.unwrap().len(), 6);
    assert_eq!(visitable.total_visits(true).await.unwrap(), 60);
    assert_eq!(visitable.unique_visits(true).await.unwrap(), 6);
    assert_eq!(visitable.total_visits(false).await.unwrap(), 60);
    assert_eq!(visitable.unique_visits(false).await.unwrap(), 6);
}

/// Store that loses races on purpose: the next insert finds the pairing
/// already written by someone else, and the next increment finds its row
/// deleted by a concurrent reset.
struct RacingStore {
    inner: Arc<dyn VisitStore>,
    lose_insert: AtomicBool,
    lose_increment: AtomicBool,
}

impl RacingStore {
    fn new(inner: Arc<dyn VisitStore>) -> Self {
        Self {
            inner,
            lose_insert: AtomicBool::new(false),
            lose_increment: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl VisitStore for RacingStore {
    async fn init(&self) -> Result<()> {
        self.inner.init().await
    }

    async fn insert_visit(&self, visit: &NewVisit) -> StorageResult<Visit> {
        if self.lose_insert.swap(false, Ordering::SeqCst) {
            self.inner.insert_visit(visit).await?;
            return Err(StorageError::Conflict);
        }
        self.inner.insert_visit(visit).await
    }

    async fn increment_visit(
        &self,
        id: i64,
        attributes: &VisitAttributes,
    ) -> StorageResult<Option<Visit>> {
        if self.lose_increment.swap(false, Ordering::SeqCst) {
            let rows = self.inner.query(&VisitScope::new()).await?;
            if let Some(row) = rows.into_iter().find(|row| row.id == id) {
                self.inner.delete_all_for(&row.visitable).await?;
            }
            return Ok(None);
        }
        self.inner.increment_visit(id, attributes).await
    }

    async fn delete_all_for(&self, visitable: &VisitableRef) -> StorageResult<u64> {
        self.inner.delete_all_for(visitable).await
    }

    async fn sum_counts(&self, visitable: &VisitableRef) -> StorageResult<i64> {
        self.inner.sum_counts(visitable).await
    }

    async fn query(&self, scope: &VisitScope) -> StorageResult<Vec<Visit>> {
        self.inner.query(scope).await
    }

    async fn count(&self, scope: &VisitScope) -> StorageResult<i64> {
        self.inner.count(scope).await
    }

    async fn init_counters(&self, visitable: &VisitableRef) -> StorageResult<()> {
        self.inner.init_counters(visitable).await
    }

    async fn load_counters(
        &self,
        visitable: &VisitableRef,
    ) -> StorageResult<Option<VisitableCounters>> {
        self.inner.load_counters(visitable).await
    }

    async fn increment_counters(
        &self,
        visitable: &VisitableRef,
        total_delta: i64,
        unique_delta: i64,
    ) -> StorageResult<bool> {
        self.inner
            .increment_counters(visitable, total_delta, unique_delta)
            .await
    }

    async fn write_counters(
        &self,
        visitable: &VisitableRef,
        counters: VisitableCounters,
    ) -> StorageResult<()> {
        self.inner.write_counters(visitable, counters).await
    }
}

#[tokio::test]
async fn test_insert_conflict_rereads_existing_row() {
    let store = Arc::new(RacingStore::new(create_memory_store().await));
    let tracker = VisitTracker::new(store.clone(), create_registry());
    let page = tracker.visitable(EntityRef::new("page", 1)).unwrap();

    store.lose_insert.store(true, Ordering::SeqCst);
    let visit = page
        .visit(&Identifiers::user(EntityRef::new("user", 1)))
        .await
        .unwrap();

    // The competing writer's visit plus ours, on the competing writer's row.
    let rows = page.visits(VisitScope::new()).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, visit.id);
    assert_eq!(visit.count, 2);
    assert!(!store.lose_insert.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_vanished_row_is_recreated() {
    let store = Arc::new(RacingStore::new(create_memory_store().await));
    let tracker = VisitTracker::new(store.clone(), create_registry());
    let page = tracker.visitable(EntityRef::new("page", 1)).unwrap();
    let visitor = Identifiers::user(EntityRef::new("user", 1));

    let first = page.visit(&visitor).await.unwrap();
    assert_eq!(first.count, 1);

    store.lose_increment.store(true, Ordering::SeqCst);
    let visit = page.visit(&visitor).await.unwrap();

    let rows = page.visits(VisitScope::new()).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, visit.id);
    assert_ne!(visit.id, first.id);
    assert_eq!(visit.count, 1);
}

#[tokio::test]
async fn test_storage_failure_surfaces_as_record_error() {
    let url = temp_database_url("record-error");
    let store = create_file_store(&url).await;
    let tracker = VisitTracker::new(store, create_registry());
    let post = tracker.visitable(EntityRef::new("post", 1)).unwrap();

    let admin = sqlx::SqlitePool::connect(&url).await.unwrap();
    sqlx::query("DROP TABLE visits").execute(&admin).await.unwrap();

    let err = post
        .visit(&Identifiers::user(EntityRef::new("user", 2)))
        .await
        .unwrap_err();
    match err {
        VisitError::Record { context, .. } => {
            assert_eq!(context, "post#1 by user#2");
        }
        other => panic!("Unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_counter_failure_does_not_fail_visit() {
    let url = temp_database_url("counter-failure");
    let store = create_file_store(&url).await;
    let tracker = VisitTracker::new(store, create_registry());
    let post = tracker.visitable(EntityRef::new("post", 1)).unwrap();
    post.created().await.unwrap();

    let admin = sqlx::SqlitePool::connect(&url).await.unwrap();
    sqlx::query("DROP TABLE visitable_counters")
        .execute(&admin)
        .await
        .unwrap();

    let visit = post
        .visit(&Identifiers::user(EntityRef::new("user", 2)))
        .await
        .unwrap();
    assert_eq!(visit.count, 1);

    // The detail rows stay authoritative.
    assert_eq!(post.total_visits(true).await.unwrap(), 1);
    assert_eq!(post.unique_visits(true).await.unwrap(), 1);
}

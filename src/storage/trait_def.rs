use crate::models::{NewVisit, Visit, VisitAttributes, VisitableCounters, VisitableRef, VisitorKey};
use crate::storage::VisitScope;
use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("visit pairing already exists")]
    Conflict,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => StorageError::Conflict,
            _ => StorageError::Other(err.into()),
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

#[async_trait]
pub trait VisitStore: Send + Sync {
    /// Initialize the storage (create tables and indexes)
    async fn init(&self) -> Result<()>;

    /// Insert a new pairing row; `Conflict` if the pairing already exists
    async fn insert_visit(&self, visit: &NewVisit) -> StorageResult<Visit>;

    /// Add one visit to an existing row and apply attributes.
    /// Returns `None` if the row no longer exists.
    async fn increment_visit(
        &self,
        id: i64,
        attributes: &VisitAttributes,
    ) -> StorageResult<Option<Visit>>;

    /// Delete every visit of a visitable, returning the number of rows removed
    async fn delete_all_for(&self, visitable: &VisitableRef) -> StorageResult<u64>;

    /// Sum of visit counts over a visitable's rows
    async fn sum_counts(&self, visitable: &VisitableRef) -> StorageResult<i64>;

    /// Rows matching a scope
    async fn query(&self, scope: &VisitScope) -> StorageResult<Vec<Visit>>;

    /// Number of rows matching a scope
    async fn count(&self, scope: &VisitScope) -> StorageResult<i64>;

    /// Set both counters to zero unless they already hold a value
    async fn init_counters(&self, visitable: &VisitableRef) -> StorageResult<()>;

    /// Cached counters, or `None` if they were never initialized
    async fn load_counters(&self, visitable: &VisitableRef)
        -> StorageResult<Option<VisitableCounters>>;

    /// Apply deltas to initialized counters; `false` if there was nothing to update
    async fn increment_counters(
        &self,
        visitable: &VisitableRef,
        total_delta: i64,
        unique_delta: i64,
    ) -> StorageResult<bool>;

    /// Overwrite both counters
    async fn write_counters(
        &self,
        visitable: &VisitableRef,
        counters: VisitableCounters,
    ) -> StorageResult<()>;

    /// Exact lookup of a (visitable, visitor) pairing
    async fn find_by_pairing(
        &self,
        visitable: &VisitableRef,
        visitor: &VisitorKey,
    ) -> StorageResult<Option<Visit>> {
        let scope = VisitScope::new().on(visitable).by(visitor).limit(1);
        Ok(self.query(&scope).await?.into_iter().next())
    }

    /// Find the pairing row or insert `visit`, telling which happened.
    ///
    /// Concurrent callers for one pairing never produce two rows: the loser of
    /// an insert race gets `Conflict` from the unique index and re-reads.
    async fn create_or_get_pairing(&self, visit: &NewVisit) -> StorageResult<(Visit, bool)> {
        for _ in 0..MAX_PAIRING_ATTEMPTS {
            if let Some(existing) = self.find_by_pairing(&visit.visitable, &visit.visitor).await? {
                return Ok((existing, false));
            }
            match self.insert_visit(visit).await {
                Ok(created) => return Ok((created, true)),
                Err(StorageError::Conflict) => {
                    tracing::debug!(
                        visitable = %visit.visitable,
                        visitor = %visit.visitor,
                        "pairing created concurrently, re-reading"
                    );
                }
                Err(err) => return Err(err),
            }
        }
        Err(StorageError::Other(anyhow::anyhow!(
            "pairing {} / {} could not be created or read after {} attempts",
            visit.visitable,
            visit.visitor,
            MAX_PAIRING_ATTEMPTS
        )))
    }

    /// Number of distinct visitors of a visitable (one row per visitor)
    async fn count_distinct_visitors(&self, visitable: &VisitableRef) -> StorageResult<i64> {
        self.count(&VisitScope::new().on(visitable)).await
    }
}

const MAX_PAIRING_ATTEMPTS: usize = 3;

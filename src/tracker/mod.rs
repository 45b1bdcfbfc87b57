//! Visit upsert engine
//!
//! `VisitTracker` ties the registry, the identity resolver and a `VisitStore`
//! together. Callers obtain a `Visitable` handle for an entity and record
//! visits through it; counters cached for the entity are kept in step with the
//! detail rows.

pub mod identity;

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{VisitError, VisitResult};
use crate::models::{
    EntityRef, NewVisit, Visit, VisitableCounters, VisitableRef, VisitorKey,
};
use crate::registry::{Registry, VisitableConfig};
use crate::storage::{StorageError, StorageResult, VisitScope, VisitStore};

pub use identity::{Identifier, Identifiers};

/// Attempts at find-or-create followed by increment before giving up. A retry
/// only happens when the row vanished in between (a concurrent reset).
const MAX_UPSERT_ATTEMPTS: usize = 3;

pub struct VisitTracker {
    store: Arc<dyn VisitStore>,
    registry: Arc<Registry>,
}

impl VisitTracker {
    pub fn new(store: Arc<dyn VisitStore>, registry: Arc<Registry>) -> Self {
        Self { store, registry }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn VisitStore> {
        &self.store
    }

    /// Handle for a visitable entity; fails if its type never opted in.
    pub fn visitable(&self, entity: VisitableRef) -> VisitResult<Visitable<'_>> {
        let config = self.registry.visitable(&entity.type_tag)?;
        Ok(Visitable {
            tracker: self,
            entity,
            config,
        })
    }

    /// Handle for a visitor entity; fails if its type is not a registered visitor.
    pub fn visitor(&self, entity: EntityRef) -> VisitResult<Visitor<'_>> {
        if !self.registry.is_visitor_type(&entity.type_tag) {
            return Err(VisitError::invalid_config(format!(
                "'{}' is not a registered visitor type",
                entity.type_tag
            )));
        }
        Ok(Visitor {
            tracker: self,
            entity,
        })
    }

    /// Run an arbitrary scope against the visit log.
    pub async fn visits(&self, scope: &VisitScope) -> VisitResult<Vec<Visit>> {
        self.store
            .query(scope)
            .await
            .map_err(|source| VisitError::record_for("visit query", source))
    }
}

/// A visitable entity bound to its registered configuration.
pub struct Visitable<'a> {
    tracker: &'a VisitTracker,
    entity: VisitableRef,
    config: &'a VisitableConfig,
}

impl<'a> Visitable<'a> {
    pub fn entity(&self) -> &VisitableRef {
        &self.entity
    }

    fn store(&self) -> &dyn VisitStore {
        self.tracker.store.as_ref()
    }

    fn resolve(&self, identifiers: &Identifiers) -> VisitResult<VisitorKey> {
        identity::resolve(identifiers, self.config, &self.tracker.registry)
    }

    fn record_error(&self, source: StorageError) -> VisitError {
        VisitError::record_for(self.entity.to_string(), source)
    }

    /// Initialize cached counters for a freshly created entity.
    pub async fn created(&self) -> VisitResult<()> {
        if !self.config.counter_cache {
            return Ok(());
        }
        self.store()
            .init_counters(&self.entity)
            .await
            .map_err(|source| self.record_error(source))
    }

    /// Record a visit, creating the pairing row on first sight.
    pub async fn visit(&self, identifiers: &Identifiers) -> VisitResult<Visit> {
        let visitor = self.resolve(identifiers)?;
        let attributes = self.config.writable_attributes(&identifiers.attributes);

        let (visit, created) = self
            .upsert(&visitor, NewVisit::new(self.entity.clone(), visitor.clone(), attributes))
            .await
            .map_err(|source| VisitError::record(&self.entity, &visitor, source))?;

        debug!(
            visitable = %self.entity,
            visitor = %visitor,
            visits = visit.count,
            new_visitor = created,
            "recorded visit"
        );

        if self.config.counter_cache {
            self.bump_counters(created).await;
        }

        Ok(visit)
    }

    async fn upsert(&self, visitor: &VisitorKey, mut draft: NewVisit) -> StorageResult<(Visit, bool)> {
        // A new row is written already counting this visit.
        draft.count += 1;

        for _ in 0..MAX_UPSERT_ATTEMPTS {
            let (visit, created) = self.store().create_or_get_pairing(&draft).await?;
            if created {
                return Ok((visit, true));
            }
            match self.store().increment_visit(visit.id, &draft.attributes).await? {
                Some(visit) => return Ok((visit, false)),
                None => debug!(
                    visitable = %self.entity,
                    visitor = %visitor,
                    "pairing removed before increment, retrying"
                ),
            }
        }

        Err(StorageError::Other(anyhow::anyhow!(
            "pairing kept disappearing after {MAX_UPSERT_ATTEMPTS} attempts"
        )))
    }

    async fn bump_counters(&self, new_visitor: bool) {
        let unique_delta = i64::from(new_visitor);
        match self
            .store()
            .increment_counters(&self.entity, 1, unique_delta)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!(visitable = %self.entity, "counter cache not initialized, recomputing");
                self.recount_best_effort().await;
            }
            Err(err) => {
                warn!(visitable = %self.entity, error = %err, "counter increment failed, recomputing");
                self.recount_best_effort().await;
            }
        }
    }

    async fn recount_best_effort(&self) {
        if let Err(err) = self.recount().await {
            warn!(visitable = %self.entity, error = %err, "counter recompute failed");
        }
    }

    /// Recompute both counters from the visit log and store them.
    pub async fn recount(&self) -> VisitResult<VisitableCounters> {
        let counters = VisitableCounters {
            total_visits: self.total_visits(true).await?,
            unique_visitors: self.unique_visits(true).await?,
        };
        if self.config.counter_cache {
            self.store()
                .write_counters(&self.entity, counters)
                .await
                .map_err(|source| self.record_error(source))?;
        }
        info!(
            visitable = %self.entity,
            total_visits = counters.total_visits,
            unique_visitors = counters.unique_visitors,
            "recounted visits"
        );
        Ok(counters)
    }

    /// Delete every visit of this entity and zero its counters.
    pub async fn reset_visits(&self) -> VisitResult<()> {
        let removed = self
            .store()
            .delete_all_for(&self.entity)
            .await
            .map_err(|source| self.record_error(source))?;

        if self.config.counter_cache {
            self.store()
                .write_counters(&self.entity, VisitableCounters::default())
                .await
                .map_err(|source| self.record_error(source))?;
        }

        info!(visitable = %self.entity, removed, "reset visits");
        Ok(())
    }

    async fn cached_counters(&self) -> VisitResult<Option<VisitableCounters>> {
        if !self.config.counter_cache {
            return Ok(None);
        }
        self.store()
            .load_counters(&self.entity)
            .await
            .map_err(|source| self.record_error(source))
    }

    /// Sum of visit counts over all visitors.
    pub async fn total_visits(&self, recalculate: bool) -> VisitResult<i64> {
        if !recalculate {
            if let Some(counters) = self.cached_counters().await? {
                return Ok(counters.total_visits);
            }
        }
        self.store()
            .sum_counts(&self.entity)
            .await
            .map_err(|source| self.record_error(source))
    }

    /// Number of distinct visitors.
    pub async fn unique_visits(&self, recalculate: bool) -> VisitResult<i64> {
        if !recalculate {
            if let Some(counters) = self.cached_counters().await? {
                return Ok(counters.unique_visitors);
            }
        }
        self.store()
            .count_distinct_visitors(&self.entity)
            .await
            .map_err(|source| self.record_error(source))
    }

    pub async fn number_of_visits(&self) -> VisitResult<i64> {
        self.total_visits(false).await
    }

    pub async fn number_of_visitors(&self) -> VisitResult<i64> {
        self.unique_visits(false).await
    }

    pub async fn is_visited(&self) -> VisitResult<bool> {
        Ok(self.unique_visits(false).await? > 0)
    }

    pub async fn is_visited_by(&self, identifiers: &Identifiers) -> VisitResult<bool> {
        Ok(self.visit_by(identifiers).await?.is_some())
    }

    /// The pairing row for a visitor, if they ever visited.
    pub async fn visit_by(&self, identifiers: &Identifiers) -> VisitResult<Option<Visit>> {
        let visitor = self.resolve(identifiers)?;
        self.store()
            .find_by_pairing(&self.entity, &visitor)
            .await
            .map_err(|source| VisitError::record(&self.entity, &visitor, source))
    }

    /// Visit rows of this entity, narrowed by `scope`.
    pub async fn visits(&self, scope: VisitScope) -> VisitResult<Vec<Visit>> {
        self.tracker.visits(&scope.on(&self.entity)).await
    }

    /// Everyone who visited, oldest first.
    pub async fn visitors(&self) -> VisitResult<Vec<VisitorKey>> {
        let visits = self.visits(VisitScope::new().in_order()).await?;
        Ok(visits.into_iter().map(|visit| visit.visitor).collect())
    }
}

/// A registered visitor entity, for the inverse side of the association.
pub struct Visitor<'a> {
    tracker: &'a VisitTracker,
    entity: EntityRef,
}

impl<'a> Visitor<'a> {
    pub fn entity(&self) -> &EntityRef {
        &self.entity
    }

    pub async fn visits(&self, scope: VisitScope) -> VisitResult<Vec<Visit>> {
        let key = VisitorKey::identified(self.entity.clone());
        self.tracker.visits(&scope.by(&key)).await
    }

    /// Everything this visitor visited, oldest first.
    pub async fn visitables(&self) -> VisitResult<Vec<VisitableRef>> {
        let visits = self.visits(VisitScope::new().in_order()).await?;
        Ok(visits.into_iter().map(|visit| visit.visitable).collect())
    }
}

//! Generic query executor over a transactional [`DataStore`].
//!
//! Every public method runs in exactly one store transaction, committed on
//! success and rolled back on any error. Transient store failures re-run the
//! whole transaction under the configured [`RetryPolicy`]; every other error
//! is classified and returned on first occurrence.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use taskhub_core::entity::{from_row, to_row};
use taskhub_core::{Cardinality, Entity, FilterOp, Page, Patch, QueryFilter, QuerySpec, Relation, Row};

use super::audit::{AuditAction, AuditRecord, AuditSink};
use super::error::{RepositoryError, RepositoryResult};
use super::store::{DataStore, StoreResult, StoreTransaction};
use crate::cache::{Cache, CacheExt, cache_key, component_prefix};
use crate::retry::RetryPolicy;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Clone)]
struct CacheBinding {
    cache: Arc<dyn Cache>,
    ttl: Option<Duration>,
    /// Bumped on every invalidation. A read fills the cache only if no
    /// invalidation happened while it was querying the store.
    generation: Arc<Mutex<u64>>,
}

impl CacheBinding {
    fn generation(&self) -> u64 {
        *self.generation.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store `value` unless the generation moved past `seen`. Returns whether it was stored.
    fn fill<T: Serialize>(&self, key: &str, value: &T, seen: u64) -> RepositoryResult<bool> {
        let current = self.generation.lock().unwrap_or_else(PoisonError::into_inner);
        if *current != seen {
            return Ok(false);
        }
        self.cache.set_serialized(key, value, self.ttl)?;
        Ok(true)
    }

    fn invalidate(&self, prefix: &str) -> usize {
        let mut current = self.generation.lock().unwrap_or_else(PoisonError::into_inner);
        *current = current.wrapping_add(1);
        self.cache.delete_prefix(prefix)
    }
}

/// Query executor for entity `E` backed by store `S`.
///
/// Stateless between calls apart from the optional cache it delegates to.
pub struct Repository<E, S> {
    store: Arc<S>,
    retry: RetryPolicy,
    cache: Option<CacheBinding>,
    audit: Option<Arc<dyn AuditSink>>,
    component: String,
    _entity: PhantomData<fn() -> E>,
}

impl<E, S> Clone for Repository<E, S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            retry: self.retry.clone(),
            cache: self.cache.clone(),
            audit: self.audit.clone(),
            component: self.component.clone(),
            _entity: PhantomData,
        }
    }
}

impl<E, S> fmt::Debug for Repository<E, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Repository")
            .field("component", &self.component)
            .field("retry", &self.retry)
            .field("cached", &self.cache.is_some())
            .field("audited", &self.audit.is_some())
            .finish()
    }
}

impl<E, S> Repository<E, S>
where
    E: Entity,
    S: DataStore,
{
    pub fn new(store: S) -> Self {
        Self::from_shared(Arc::new(store))
    }

    pub fn from_shared(store: Arc<S>) -> Self {
        Self {
            store,
            retry: RetryPolicy::default(),
            cache: None,
            audit: None,
            component: E::TABLE.to_string(),
            _entity: PhantomData,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Enable the `*_cached` read paths. Entries live for `ttl` (forever when `None`).
    ///
    /// Clones of the returned repository share one invalidation generation,
    /// so writers and cached readers of a component should be clones of it.
    pub fn with_cache(mut self, cache: Arc<dyn Cache>, ttl: Option<Duration>) -> Self {
        self.cache = Some(CacheBinding {
            cache,
            ttl,
            generation: Arc::new(Mutex::new(0)),
        });
        self
    }

    pub fn with_audit(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    /// Override the component name used as the cache key prefix (defaults to the table).
    pub fn with_component(mut self, component: impl Into<String>) -> Self {
        self.component = component.into();
        self
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    /// Point lookup; a miss is `Ok(None)`.
    pub async fn get(&self, id: &E::Id) -> RepositoryResult<Option<E>> {
        let key = id.to_string();
        let row = self
            .transact("get", move |tx| {
                let key = key.clone();
                Box::pin(async move { Ok::<_, RepositoryError>(tx.get(E::TABLE, &key).await?) })
            })
            .await?;

        debug!(entity = E::TABLE, id = %id, found = row.is_some(), "get");
        Ok(row.map(from_row::<E>).transpose()?)
    }

    /// Like [`get`](Self::get), but a miss is `NotFound`.
    pub async fn require(&self, id: &E::Id) -> RepositoryResult<E> {
        self.get(id)
            .await?
            .ok_or_else(|| RepositoryError::not_found(E::TABLE, id))
    }

    pub async fn exists(&self, id: &E::Id) -> RepositoryResult<bool> {
        let key = id.to_string();
        self.transact("exists", move |tx| {
            let key = key.clone();
            Box::pin(async move { Ok::<_, RepositoryError>(tx.get(E::TABLE, &key).await?.is_some()) })
        })
        .await
    }

    /// Filter (AND), sort, paginate, then eager-load the named relationships.
    ///
    /// Each relationship costs one extra `IN` query within the same transaction.
    pub async fn get_multi(&self, spec: &QuerySpec<E>, page: Page, eager: &[&str]) -> RepositoryResult<Vec<E>> {
        if page.limit == 0 {
            return Err(RepositoryError::Validation(
                "page limit must be greater than zero".to_string(),
            ));
        }
        let relations = resolve_relations::<E>(eager)?;

        let filters = spec.filters().to_vec();
        let sorts = spec.sorts().to_vec();
        let rows = self
            .transact("get_multi", move |tx| {
                let filters = filters.clone();
                let sorts = sorts.clone();
                let relations = relations.clone();
                Box::pin(async move {
                    let mut rows = tx.select(E::TABLE, &filters, &sorts, Some(page)).await?;
                    load_relations(tx, &mut rows, &relations).await?;
                    Ok::<_, RepositoryError>(rows)
                })
            })
            .await?;

        debug!(entity = E::TABLE, returned = rows.len(), skip = page.skip, limit = page.limit, "get_multi");
        rows.into_iter()
            .map(|row| from_row::<E>(row).map_err(RepositoryError::from))
            .collect()
    }

    pub async fn count(&self, spec: &QuerySpec<E>) -> RepositoryResult<u64> {
        let filters = spec.filters().to_vec();
        self.transact("count", move |tx| {
            let filters = filters.clone();
            Box::pin(async move { Ok::<_, RepositoryError>(tx.count(E::TABLE, &filters).await?) })
        })
        .await
    }

    pub async fn create(&self, input: E::Input) -> RepositoryResult<E> {
        let entity = E::from_input(input);
        let id = entity.id().to_string();
        let row = to_row(&entity)?;

        let audit_row = row.clone();
        let insert_id = id.clone();
        self.transact("create", move |tx| {
            let id = insert_id.clone();
            let row = row.clone();
            Box::pin(async move { Ok::<_, RepositoryError>(tx.insert(E::TABLE, &id, row, E::UNIQUE_FIELDS).await?) })
        })
        .await?;

        debug!(entity = E::TABLE, id = %id, "created");
        self.after_write(vec![AuditRecord::new(E::TABLE, id, AuditAction::Create, None, Some(audit_row))]);
        Ok(entity)
    }

    /// Apply `patch` to the stored state of `existing`.
    ///
    /// The stored row, not the caller's copy, is the base for the patch. A
    /// record deleted in the meantime yields `NotFound`.
    pub async fn update(&self, existing: &E, patch: Patch) -> RepositoryResult<E> {
        patch.validate_for::<E>()?;
        let id = existing.id().to_string();

        let patch_id = id.clone();
        let (old, new, entity) = self
            .transact("update", move |tx| {
                let id = patch_id.clone();
                let patch = patch.clone();
                Box::pin(async move {
                    let Some(old) = tx.get(E::TABLE, &id).await? else {
                        return Err(RepositoryError::not_found(E::TABLE, &id));
                    };
                    let mut new = old.clone();
                    patch.apply_to(&mut new);
                    let entity = from_row::<E>(new.clone())?;
                    tx.replace(E::TABLE, &id, new.clone(), E::UNIQUE_FIELDS).await?;
                    Ok::<_, RepositoryError>((old, new, entity))
                })
            })
            .await?;

        debug!(entity = E::TABLE, id = %id, "updated");
        self.after_write(vec![AuditRecord::new(E::TABLE, id, AuditAction::Update, Some(old), Some(new))]);
        Ok(entity)
    }

    /// Delete by id; `false` when nothing was there.
    pub async fn delete(&self, id: &E::Id) -> RepositoryResult<bool> {
        let key = id.to_string();
        let old = self
            .transact("delete", move |tx| {
                let key = key.clone();
                Box::pin(async move {
                    let Some(old) = tx.get(E::TABLE, &key).await? else {
                        return Ok::<_, RepositoryError>(None);
                    };
                    tx.remove(E::TABLE, &key).await?;
                    Ok(Some(old))
                })
            })
            .await?;

        debug!(entity = E::TABLE, id = %id, deleted = old.is_some(), "delete");
        match old {
            Some(old) => {
                self.after_write(vec![AuditRecord::new(E::TABLE, id.to_string(), AuditAction::Delete, Some(old), None)]);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Insert all inputs in one transaction. Any failure persists none of them.
    pub async fn bulk_create(&self, inputs: Vec<E::Input>) -> RepositoryResult<Vec<E>> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }

        let entities: Vec<E> = inputs.into_iter().map(E::from_input).collect();
        let rows = entities
            .iter()
            .map(|e| Ok((e.id().to_string(), to_row(e)?)))
            .collect::<RepositoryResult<Vec<(String, Row)>>>()?;

        let batch = rows.clone();
        self.transact("bulk_create", move |tx| {
            let batch = batch.clone();
            Box::pin(async move {
                for (id, row) in batch {
                    tx.insert(E::TABLE, &id, row, E::UNIQUE_FIELDS).await?;
                }
                Ok::<_, RepositoryError>(())
            })
        })
        .await?;

        debug!(entity = E::TABLE, count = entities.len(), "bulk_create");
        self.after_write(
            rows.into_iter()
                .map(|(id, row)| AuditRecord::new(E::TABLE, id, AuditAction::Create, None, Some(row)))
                .collect(),
        );
        Ok(entities)
    }

    /// Apply each patch in one transaction. Ids that do not exist are skipped.
    pub async fn bulk_update(&self, updates: Vec<(E::Id, Patch)>) -> RepositoryResult<Vec<E>> {
        for (_, patch) in &updates {
            patch.validate_for::<E>()?;
        }
        if updates.is_empty() {
            return Ok(Vec::new());
        }

        let batch: Vec<(String, Patch)> = updates.into_iter().map(|(id, p)| (id.to_string(), p)).collect();
        let changes = self
            .transact("bulk_update", move |tx| {
                let batch = batch.clone();
                Box::pin(async move {
                    let mut changes = Vec::with_capacity(batch.len());
                    for (id, patch) in batch {
                        let Some(old) = tx.get(E::TABLE, &id).await? else {
                            debug!(entity = E::TABLE, id = %id, "bulk_update skipped missing record");
                            continue;
                        };
                        let mut new = old.clone();
                        patch.apply_to(&mut new);
                        let entity = from_row::<E>(new.clone())?;
                        tx.replace(E::TABLE, &id, new.clone(), E::UNIQUE_FIELDS).await?;
                        changes.push((id, old, new, entity));
                    }
                    Ok::<_, RepositoryError>(changes)
                })
            })
            .await?;

        debug!(entity = E::TABLE, count = changes.len(), "bulk_update");
        let mut entities = Vec::with_capacity(changes.len());
        let mut records = Vec::with_capacity(changes.len());
        for (id, old, new, entity) in changes {
            records.push(AuditRecord::new(E::TABLE, id, AuditAction::Update, Some(old), Some(new)));
            entities.push(entity);
        }
        self.after_write(records);
        Ok(entities)
    }

    /// Delete every existing id in one transaction; returns how many were removed.
    pub async fn bulk_delete(&self, ids: &[E::Id]) -> RepositoryResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let keys: Vec<String> = ids.iter().map(ToString::to_string).collect();
        let removed = self
            .transact("bulk_delete", move |tx| {
                let keys = keys.clone();
                Box::pin(async move {
                    let mut removed = Vec::new();
                    for key in keys {
                        if let Some(old) = tx.get(E::TABLE, &key).await? {
                            tx.remove(E::TABLE, &key).await?;
                            removed.push((key, old));
                        }
                    }
                    Ok::<_, RepositoryError>(removed)
                })
            })
            .await?;

        let count = removed.len() as u64;
        debug!(entity = E::TABLE, count, "bulk_delete");
        self.after_write(
            removed
                .into_iter()
                .map(|(id, old)| AuditRecord::new(E::TABLE, id, AuditAction::Delete, Some(old), None))
                .collect(),
        );
        Ok(count)
    }

    /// [`get_multi`](Self::get_multi) memoized in the bound cache.
    pub async fn get_multi_cached(&self, spec: &QuerySpec<E>, page: Page, eager: &[&str]) -> RepositoryResult<Vec<E>> {
        let Some(binding) = &self.cache else {
            return self.get_multi(spec, page, eager).await;
        };

        let key = cache_key(&self.component, "get_multi", &(spec.canonical(), page, eager))?;
        if let Some(hit) = binding.cache.get_as::<Vec<E>>(&key) {
            debug!(entity = E::TABLE, key = %key, "cache hit");
            return Ok(hit);
        }

        let seen = binding.generation();
        let result = self.get_multi(spec, page, eager).await?;
        if !binding.fill(&key, &result, seen)? {
            debug!(entity = E::TABLE, key = %key, "write landed during read, not cached");
        }
        Ok(result)
    }

    /// [`count`](Self::count) memoized in the bound cache.
    pub async fn count_cached(&self, spec: &QuerySpec<E>) -> RepositoryResult<u64> {
        let Some(binding) = &self.cache else {
            return self.count(spec).await;
        };

        let key = cache_key(&self.component, "count", &spec.canonical())?;
        if let Some(hit) = binding.cache.get_as::<u64>(&key) {
            debug!(entity = E::TABLE, key = %key, "cache hit");
            return Ok(hit);
        }

        let seen = binding.generation();
        let result = self.count(spec).await?;
        if !binding.fill(&key, &result, seen)? {
            debug!(entity = E::TABLE, key = %key, "write landed during read, not cached");
        }
        Ok(result)
    }

    /// Drop every cached read of this component; returns the number of keys removed.
    pub fn invalidate_cached_reads(&self) -> usize {
        match &self.cache {
            Some(binding) => binding.invalidate(&component_prefix(&self.component)),
            None => 0,
        }
    }

    /// Post-commit bookkeeping: cached reads of this component are stale now.
    fn after_write(&self, records: Vec<AuditRecord>) {
        let invalidated = self.invalidate_cached_reads();
        if invalidated > 0 {
            debug!(entity = E::TABLE, invalidated, "invalidated cached reads");
        }
        if let Some(sink) = &self.audit {
            for record in records {
                sink.record(record);
            }
        }
    }

    async fn transact<T, F>(&self, operation: &'static str, work: F) -> RepositoryResult<T>
    where
        T: Send,
        F: for<'t> Fn(&'t mut S::Tx) -> BoxFuture<'t, RepositoryResult<T>> + Send + Sync,
    {
        let work = &work;
        self.retry
            .run(operation, RepositoryError::is_retryable, move || self.attempt(operation, work))
            .await
    }

    async fn attempt<T, F>(&self, operation: &'static str, work: &F) -> RepositoryResult<T>
    where
        F: for<'t> Fn(&'t mut S::Tx) -> BoxFuture<'t, RepositoryResult<T>>,
    {
        let mut tx = self.store.begin().await?;
        match work(&mut tx).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(entity = E::TABLE, operation, error = %rollback_err, "rollback failed");
                }
                warn!(entity = E::TABLE, operation, error = %err, "transaction rolled back");
                Err(err)
            }
        }
    }
}

fn resolve_relations<E: Entity>(names: &[&str]) -> RepositoryResult<Vec<&'static Relation>> {
    names
        .iter()
        .map(|name| {
            E::relation(name).ok_or_else(|| RepositoryError::InvalidQuery {
                field: name.to_string(),
                reason: format!("{} has no relationship named '{name}'", E::TABLE),
            })
        })
        .collect()
}

/// Attach related rows under each relation's name, one `IN` query per relation.
async fn load_relations<T: StoreTransaction>(
    tx: &mut T,
    rows: &mut [Row],
    relations: &[&'static Relation],
) -> StoreResult<()> {
    for relation in relations {
        let mut keys: Vec<Value> = Vec::new();
        for row in rows.iter() {
            if let Some(value) = row.get(relation.local_field).filter(|v| !v.is_null()) {
                if !keys.contains(value) {
                    keys.push(value.clone());
                }
            }
        }

        let mut related: HashMap<String, Vec<Row>> = HashMap::new();
        if !keys.is_empty() {
            let filter = QueryFilter::new(relation.foreign_field, FilterOp::In, Value::Array(keys));
            for target in tx.select(relation.target, &[filter], &[], None).await? {
                if let Some(key) = target.get(relation.foreign_field) {
                    related.entry(key.to_string()).or_default().push(target);
                }
            }
        }

        for row in rows.iter_mut() {
            let matches = row
                .get(relation.local_field)
                .and_then(|key| related.get(&key.to_string()))
                .cloned()
                .unwrap_or_default();
            let attached = match relation.cardinality {
                Cardinality::Many => Value::Array(matches.into_iter().map(Value::Object).collect()),
                Cardinality::One => matches.into_iter().next().map_or(Value::Null, Value::Object),
            };
            row.insert(relation.name.to_string(), attached);
        }
    }
    Ok(())
}

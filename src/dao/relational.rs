//! Sharded DAO for relational entities.

use super::locked::{LockedContext, Seed};
use super::scatter::ScatterGather;
use crate::error::{Error, Result};
use crate::execution::{ObserverChain, TransactionExecutor, TransactionInfo, TransactionScope};
use crate::partitioning::ShardCalculator;
use crate::registry::ResourceHolder;
use crate::store::{Entity, Session, ShardStore};
use crate::types::{Criteria, ShardId, UpdateOperationMeta, UpdateOutcome};
use std::any::type_name;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::debug;

const DAO_TYPE: &str = "RelationalDao";

/// Sharded data access for entities of type `T` stored in `S`.
///
/// Every call takes a routing key (the parent key), resolves it to a shard
/// and runs in its own transaction on that shard's store. Entities sharing
/// a parent key always live on the same shard.
pub struct RelationalDao<T: Entity, S: ShardStore> {
    holder: Arc<ResourceHolder<S>>,
    calculator: Arc<ShardCalculator>,
    executor: TransactionExecutor,
    scatter: ScatterGather,
    key_field: &'static str,
    _entity: PhantomData<fn() -> T>,
}

impl<T: Entity, S: ShardStore> fmt::Debug for RelationalDao<T, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelationalDao")
            .field("entity", &entity_name::<T>())
            .field("table", &T::TABLE)
            .field("key_field", &self.key_field)
            .field("shards", &self.holder.shard_count())
            .finish()
    }
}

impl<T: Entity, S: ShardStore> RelationalDao<T, S> {
    /// Create a DAO.
    ///
    /// Fails with [`Error::Config`] unless `T` designates exactly one key
    /// field, or if the holder and calculator disagree on the shard count.
    pub fn new(
        holder: Arc<ResourceHolder<S>>,
        calculator: Arc<ShardCalculator>,
        observers: Arc<ObserverChain>,
        namespace: impl Into<Arc<str>>,
        scatter: ScatterGather,
    ) -> Result<Self> {
        let key_field = match T::key_fields() {
            [field] if !field.is_empty() => *field,
            [] => {
                return Err(Error::Config(format!(
                    "entity {} has no key field",
                    entity_name::<T>()
                )))
            }
            fields => {
                return Err(Error::Config(format!(
                    "entity {} must have exactly one usable key field, found {:?}",
                    entity_name::<T>(),
                    fields
                )))
            }
        };
        if holder.shard_count() != calculator.num_shards() {
            return Err(Error::Config(format!(
                "resource holder has {} shards but calculator routes to {}",
                holder.shard_count(),
                calculator.num_shards()
            )));
        }

        debug!(
            entity = entity_name::<T>(),
            key_field,
            shards = holder.shard_count(),
            "Created relational dao"
        );
        Ok(Self {
            holder,
            calculator,
            executor: TransactionExecutor::new(observers, namespace, DAO_TYPE, entity_name::<T>()),
            scatter,
            key_field,
            _entity: PhantomData,
        })
    }

    /// Name of the key field.
    pub fn key_field(&self) -> &'static str {
        self.key_field
    }

    /// Number of shards.
    pub fn shard_count(&self) -> u32 {
        self.holder.shard_count()
    }

    /// Shard owning `parent_key`.
    pub fn shard_id(&self, parent_key: &str) -> Result<ShardId> {
        self.calculator.shard_id(parent_key)
    }

    /// Look up an entity by key.
    pub fn get(&self, parent_key: &str, key: &T::Key) -> Result<Option<T>> {
        self.get_with(parent_key, key, |found| found)
    }

    /// Look up an entity by key and map the result inside the transaction.
    pub fn get_with<U>(
        &self,
        parent_key: &str,
        key: &T::Key,
        handler: impl FnOnce(Option<T>) -> U,
    ) -> Result<U> {
        let (shard_id, store) = self.route(parent_key)?;
        self.executor.execute(
            TransactionScope::Begin(store),
            TransactionInfo::read_only("get", shard_id),
            |session, key| Ok(session.get::<T>(key)?),
            key,
            |_, found| Ok(handler(found)),
        )
    }

    /// Persist a new entity.
    pub fn save(&self, parent_key: &str, entity: T) -> Result<T> {
        self.save_with(parent_key, entity, |saved| saved)
    }

    /// Persist a new entity and map the stored value inside the transaction.
    pub fn save_with<U>(
        &self,
        parent_key: &str,
        entity: T,
        handler: impl FnOnce(T) -> U,
    ) -> Result<U> {
        let (shard_id, store) = self.route(parent_key)?;
        self.executor.execute(
            TransactionScope::Begin(store),
            TransactionInfo::read_write("save", shard_id),
            |session, entity: T| Ok(session.save(entity)?),
            entity,
            |_, saved| Ok(handler(saved)),
        )
    }

    /// Persist several entities in one transaction.
    pub fn save_all(&self, parent_key: &str, entities: Vec<T>) -> Result<Vec<T>> {
        let (shard_id, store) = self.route(parent_key)?;
        self.executor
            .run(store, TransactionInfo::read_write("saveAll", shard_id), |session| {
                save_each(session, entities)
            })
    }

    /// Replace the entity with `key` by `updater(current)`.
    ///
    /// Returns `false` when nothing matched or the updater returned `None`;
    /// nothing is written in either case.
    pub fn update(
        &self,
        parent_key: &str,
        key: &T::Key,
        updater: impl FnOnce(T) -> Option<T>,
    ) -> Result<bool> {
        self.try_update(parent_key, key, updater).map(bool::from)
    }

    /// Like [`update`](Self::update), distinguishing a missing row from a
    /// rejected update.
    pub fn try_update(
        &self,
        parent_key: &str,
        key: &T::Key,
        updater: impl FnOnce(T) -> Option<T>,
    ) -> Result<UpdateOutcome> {
        let (shard_id, store) = self.route(parent_key)?;
        self.executor
            .run(store, TransactionInfo::read_write("update", shard_id), |session| {
                update_by_key(session, key, updater)
            })
    }

    /// Replace the first entity matching `criteria`.
    pub fn update_matching(
        &self,
        parent_key: &str,
        criteria: &Criteria<T>,
        updater: impl FnOnce(T) -> Option<T>,
    ) -> Result<UpdateOutcome> {
        let (shard_id, store) = self.route(parent_key)?;
        self.executor
            .run(store, TransactionInfo::read_write("update", shard_id), |session| {
                match session.select(criteria, 0, 1)?.pop() {
                    Some(current) => replace(session, current, updater),
                    None => Ok(UpdateOutcome::NotFound),
                }
            })
    }

    /// Replace every entity in a page of matches.
    ///
    /// Replacements are computed for the whole page first; if the updater
    /// rejects any of them nothing is written.
    pub fn update_all(
        &self,
        parent_key: &str,
        start: usize,
        num_rows: usize,
        criteria: &Criteria<T>,
        mut updater: impl FnMut(&T) -> Option<T>,
    ) -> Result<UpdateOutcome> {
        let (shard_id, store) = self.route(parent_key)?;
        self.executor
            .run(store, TransactionInfo::read_write("updateAll", shard_id), |session| {
                let current = session.select(criteria, start, num_rows)?;
                if current.is_empty() {
                    return Ok(UpdateOutcome::NotFound);
                }

                let mut replacements = Vec::with_capacity(current.len());
                for old in current {
                    match updater(&old) {
                        Some(new) => replacements.push((old, new)),
                        None => return Ok(UpdateOutcome::Rejected),
                    }
                }
                for (old, new) in replacements {
                    session.update(&old, new)?;
                }
                Ok(UpdateOutcome::Updated)
            })
    }

    /// Run a registered bulk update on the shard of `parent_key`. Returns the
    /// number of rows changed.
    pub fn update_using_query(
        &self,
        parent_key: &str,
        operation: &UpdateOperationMeta,
    ) -> Result<usize> {
        let (shard_id, store) = self.route(parent_key)?;
        self.executor.run(
            store,
            TransactionInfo::read_write("updateUsingQuery", shard_id),
            |session| Ok(session.execute_update(operation)?),
        )
    }

    /// A page of entities matching `criteria`, in the store's natural order.
    pub fn select(
        &self,
        parent_key: &str,
        criteria: &Criteria<T>,
        start: usize,
        num_rows: usize,
    ) -> Result<Vec<T>> {
        self.select_with(parent_key, criteria, start, num_rows, |rows| rows)
    }

    /// [`select`](Self::select) with a result handler run inside the transaction.
    pub fn select_with<U>(
        &self,
        parent_key: &str,
        criteria: &Criteria<T>,
        start: usize,
        num_rows: usize,
        handler: impl FnOnce(Vec<T>) -> U,
    ) -> Result<U> {
        let (shard_id, store) = self.route(parent_key)?;
        self.executor.execute(
            TransactionScope::Begin(store),
            TransactionInfo::read_only("select", shard_id),
            |session, criteria| Ok(session.select(criteria, start, num_rows)?),
            criteria,
            |_, rows| Ok(handler(rows)),
        )
    }

    /// Number of entities matching `criteria` on the shard of `parent_key`.
    pub fn count(&self, parent_key: &str, criteria: &Criteria<T>) -> Result<u64> {
        let (shard_id, store) = self.route(parent_key)?;
        self.executor
            .run(store, TransactionInfo::read_only("count", shard_id), |session| {
                Ok(session.count(criteria)?)
            })
    }

    /// Whether an entity with `key` exists.
    pub fn exists(&self, parent_key: &str, key: &T::Key) -> Result<bool> {
        let (shard_id, store) = self.route(parent_key)?;
        let found = self.executor.execute_and_resolve(
            store,
            TransactionInfo::read_only("exists", shard_id),
            |session| Ok(session.get::<T>(key)?),
        )?;
        Ok(found.is_some())
    }

    /// Run arbitrary read-only work against the raw session of the shard
    /// owning `parent_key`.
    pub fn run_in_session<U>(
        &self,
        parent_key: &str,
        handler: impl FnOnce(&mut S::Session) -> Result<U>,
    ) -> Result<U> {
        let (shard_id, store) = self.route(parent_key)?;
        self.executor.run(
            store,
            TransactionInfo::read_only("runInSession", shard_id),
            handler,
        )
    }

    /// Start a locked context whose transaction begins by locking the row
    /// matching `criteria`. The lock does not wait: a row locked by another
    /// transaction fails the context with a lock conflict.
    pub fn lock_and_get_executor(
        &self,
        parent_key: &str,
        criteria: Criteria<T>,
    ) -> Result<LockedContext<'_, T, S>> {
        let shard_id = self.calculator.shard_id(parent_key)?;
        let store = self.holder.get(shard_id, parent_key)?.clone();
        Ok(LockedContext::new(
            self,
            shard_id,
            parent_key,
            store,
            Seed::Lock(criteria),
        ))
    }

    /// Start a locked context whose transaction begins by saving `entity`.
    pub fn save_and_get_executor(
        &self,
        parent_key: &str,
        entity: T,
    ) -> Result<LockedContext<'_, T, S>> {
        let shard_id = self.calculator.shard_id(parent_key)?;
        let store = self.holder.get(shard_id, parent_key)?.clone();
        Ok(LockedContext::new(
            self,
            shard_id,
            parent_key,
            store,
            Seed::Save(entity),
        ))
    }

    /// Query every shard and concatenate the results in shard order.
    ///
    /// `start` and `num_rows` apply per shard. A failure on any shard fails
    /// the whole call. Meant for administrative use; every shard is queried.
    pub fn scatter_gather(
        &self,
        criteria: &Criteria<T>,
        start: usize,
        num_rows: usize,
    ) -> Result<Vec<T>> {
        self.scatter.gather(self.holder.shard_count(), |shard_id| {
            let store = self.holder.get_any(shard_id)?;
            self.executor
                .run(&**store, TransactionInfo::read_only("scatterGather", shard_id), |session| {
                    Ok(session.select(criteria, start, num_rows)?)
                })
        })
    }

    /// Count matches on every shard; one entry per shard, in shard order.
    pub fn count_scatter_gather(&self, criteria: &Criteria<T>) -> Result<Vec<u64>> {
        self.scatter.run(self.holder.shard_count(), |shard_id| {
            let store = self.holder.get_any(shard_id)?;
            self.executor.run(
                &**store,
                TransactionInfo::read_only("countScatterGather", shard_id),
                |session| Ok(session.count(criteria)?),
            )
        })
    }

    pub(crate) fn executor(&self) -> &TransactionExecutor {
        &self.executor
    }

    fn route(&self, parent_key: &str) -> Result<(ShardId, &S)> {
        let shard_id = self.calculator.shard_id(parent_key)?;
        let store = self.holder.get(shard_id, parent_key)?;
        Ok((shard_id, &**store))
    }

    // Operations joining a transaction owned by a locked context.

    pub(crate) fn save_joined(
        &self,
        session: &mut S::Session,
        shard_id: ShardId,
        entity: T,
    ) -> Result<T> {
        self.executor.join::<S, _>(
            session,
            TransactionInfo::read_write("save", shard_id),
            |session| Ok(session.save(entity)?),
        )
    }

    pub(crate) fn save_all_joined(
        &self,
        session: &mut S::Session,
        shard_id: ShardId,
        entities: Vec<T>,
    ) -> Result<Vec<T>> {
        self.executor.join::<S, _>(
            session,
            TransactionInfo::read_write("saveAll", shard_id),
            |session| save_each(session, entities),
        )
    }

    pub(crate) fn update_joined(
        &self,
        session: &mut S::Session,
        shard_id: ShardId,
        key: &T::Key,
        updater: impl FnOnce(T) -> Option<T>,
    ) -> Result<UpdateOutcome> {
        self.executor.join::<S, _>(
            session,
            TransactionInfo::read_write("update", shard_id),
            |session| update_by_key(session, key, updater),
        )
    }

    /// Walk the matches of `criteria` in order, replacing each one, until
    /// `update_next` returns `false`. No matches is not a failure.
    pub(crate) fn update_matching_joined(
        &self,
        session: &mut S::Session,
        shard_id: ShardId,
        criteria: &Criteria<T>,
        mut updater: impl FnMut(T) -> Option<T>,
        mut update_next: impl FnMut() -> bool,
    ) -> Result<UpdateOutcome> {
        self.executor.join::<S, _>(
            session,
            TransactionInfo::read_write("update", shard_id),
            |session| {
                let rows = session.select(criteria, 0, usize::MAX)?;
                for current in rows {
                    let outcome = replace(&mut *session, current, &mut updater)?;
                    if !outcome.is_updated() {
                        return Ok(outcome);
                    }
                    if !update_next() {
                        break;
                    }
                }
                Ok(UpdateOutcome::Updated)
            },
        )
    }

    pub(crate) fn create_or_update_joined(
        &self,
        session: &mut S::Session,
        shard_id: ShardId,
        criteria: &Criteria<T>,
        updater: impl FnOnce(T) -> Option<T>,
        generator: impl FnOnce() -> T,
    ) -> Result<UpdateOutcome> {
        self.executor.join::<S, _>(
            session,
            TransactionInfo::read_write("createOrUpdate", shard_id),
            |session| match session.select(criteria, 0, 1)?.pop() {
                Some(current) => replace(session, current, updater),
                None => {
                    session.save(generator())?;
                    Ok(UpdateOutcome::Updated)
                }
            },
        )
    }

    pub(crate) fn update_using_query_joined(
        &self,
        session: &mut S::Session,
        shard_id: ShardId,
        operation: &UpdateOperationMeta,
    ) -> Result<usize> {
        self.executor.join::<S, _>(
            session,
            TransactionInfo::read_write("updateUsingQuery", shard_id),
            |session| Ok(session.execute_update(operation)?),
        )
    }
}

fn save_each<T: Entity, X: Session>(session: &mut X, entities: Vec<T>) -> Result<Vec<T>> {
    entities
        .into_iter()
        .map(|entity| Ok(session.save(entity)?))
        .collect()
}

fn update_by_key<T: Entity, X: Session>(
    session: &mut X,
    key: &T::Key,
    updater: impl FnOnce(T) -> Option<T>,
) -> Result<UpdateOutcome> {
    match session.get::<T>(key)? {
        Some(current) => replace(session, current, updater),
        None => Ok(UpdateOutcome::NotFound),
    }
}

fn replace<T: Entity, X: Session>(
    session: &mut X,
    current: T,
    updater: impl FnOnce(T) -> Option<T>,
) -> Result<UpdateOutcome> {
    let old = current.clone();
    match updater(current) {
        Some(new) => {
            session.update(&old, new)?;
            Ok(UpdateOutcome::Updated)
        }
        None => Ok(UpdateOutcome::Rejected),
    }
}

/// Type name of `T` with the module path of the outer type removed.
/// Generic arguments are kept as written, e.g. `Wrapper<inner::Bar>`.
pub(crate) fn entity_name<T>() -> &'static str {
    let full = type_name::<T>();
    let head = full.find('<').map_or(full, |generics| &full[..generics]);
    let start = head.rfind("::").map_or(0, |sep| sep + 2);
    &full[start..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partitioning::{BalancedShardManager, ConsistentHashBucketIdExtractor, ShardManager};
    use crate::store::MemoryStore;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Keyless;

    impl Entity for Keyless {
        type Key = String;
        const TABLE: &'static str = "keyless";

        fn key_fields() -> &'static [&'static str] {
            &[]
        }

        fn key(&self) -> String {
            String::new()
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Composite {
        a: u32,
        b: u32,
    }

    impl Entity for Composite {
        type Key = String;
        const TABLE: &'static str = "composite";

        fn key_fields() -> &'static [&'static str] {
            &["a", "b"]
        }

        fn key(&self) -> String {
            format!("{}:{}", self.a, self.b)
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Single {
        id: u32,
    }

    impl Entity for Single {
        type Key = u32;
        const TABLE: &'static str = "single";

        fn key_fields() -> &'static [&'static str] {
            &["id"]
        }

        fn key(&self) -> u32 {
            self.id
        }
    }

    fn parts(shards: u32) -> (Arc<ResourceHolder<MemoryStore>>, Arc<ShardCalculator>) {
        let stores = (0..shards)
            .map(|i| MemoryStore::new(format!("shard-{}", i)))
            .collect();
        let manager = BalancedShardManager::new(shards).unwrap();
        let extractor = ConsistentHashBucketIdExtractor::new(manager.num_buckets()).unwrap();
        let calculator = ShardCalculator::new(Arc::new(manager), Arc::new(extractor)).unwrap();
        (
            Arc::new(ResourceHolder::from_single(stores).unwrap()),
            Arc::new(calculator),
        )
    }

    fn dao<T: Entity>(
        holder: Arc<ResourceHolder<MemoryStore>>,
        calculator: Arc<ShardCalculator>,
    ) -> Result<RelationalDao<T, MemoryStore>> {
        RelationalDao::new(
            holder,
            calculator,
            Arc::new(ObserverChain::new()),
            "test",
            ScatterGather::sequential(),
        )
    }

    #[test]
    fn test_key_field_validation() {
        let (holder, calculator) = parts(2);

        assert!(matches!(
            dao::<Keyless>(holder.clone(), calculator.clone()),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            dao::<Composite>(holder.clone(), calculator.clone()),
            Err(Error::Config(_))
        ));

        let single = dao::<Single>(holder, calculator).unwrap();
        assert_eq!(single.key_field(), "id");
        assert_eq!(single.shard_count(), 2);
    }

    #[test]
    fn test_shard_count_mismatch() {
        let (holder, _) = parts(2);
        let (_, calculator) = parts(3);
        assert!(matches!(dao::<Single>(holder, calculator), Err(Error::Config(_))));
    }

    #[test]
    fn test_empty_routing_key_fails_fast() {
        let (holder, calculator) = parts(2);
        let dao = dao::<Single>(holder, calculator).unwrap();

        assert!(matches!(dao.get("", &1), Err(Error::InvalidRoutingKey(_))));
        assert!(matches!(dao.save("", Single { id: 1 }), Err(Error::InvalidRoutingKey(_))));
    }

    #[test]
    fn test_entity_name() {
        assert_eq!(entity_name::<Single>(), "Single");
        assert_eq!(entity_name::<u32>(), "u32");
        assert!(entity_name::<Option<Single>>().starts_with("Option<"));
        assert!(entity_name::<Option<Single>>().ends_with("::Single>"));
        assert_eq!(entity_name::<Vec<u32>>(), "Vec<u32>");
    }
}

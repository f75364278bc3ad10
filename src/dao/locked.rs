//! Deferred chains of operations sharing one shard transaction.

use super::relational::RelationalDao;
use crate::error::{Error, Result};
use crate::execution::{TransactionInfo, TransactionScope};
use crate::store::{Entity, Session, ShardStore};
use crate::types::{Criteria, ShardId, UpdateOperationMeta, UpdateOutcome};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// First action of a locked context.
pub(crate) enum Seed<T> {
    /// Lock the unique row matching the criteria, without waiting.
    Lock(Criteria<T>),
    /// Save a new entity.
    Save(T),
}

impl<T: Entity> Seed<T> {
    fn operation(&self) -> &'static str {
        match self {
            Seed::Lock(_) => "lockAndExecute",
            Seed::Save(_) => "saveAndExecute",
        }
    }

    fn run<X: Session>(self, session: &mut X) -> Result<T> {
        match self {
            Seed::Lock(criteria) => session.lock_for_write(&criteria)?.ok_or_else(|| {
                Error::ContextAborted(format!(
                    "no {} row matches {}",
                    T::TABLE,
                    criteria.description()
                ))
            }),
            Seed::Save(entity) => Ok(session.save(entity)?),
        }
    }
}

/// Lifecycle of a [`LockedContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    /// Only the seed action is queued.
    Initial,
    /// Further actions are queued after the seed.
    Chained,
    /// The chain ran and committed.
    Executed,
    /// The chain stopped early and rolled back.
    Failed,
}

type Operation<'a, T, S> =
    Box<dyn FnOnce(&mut <S as ShardStore>::Session, &mut T) -> Result<()> + 'a>;

/// A seed action plus a chain of follow-up actions, all run in one
/// transaction on one shard.
///
/// Nothing touches the store until [`execute`](Self::execute). Actions run in
/// the order they were added; the first failure, or the first update that
/// did not apply, rolls the whole transaction back. A context executes at
/// most once.
///
/// ```rust,ignore
/// let order = orders
///     .lock_and_get_executor("customer-1", Criteria::new("id = 7", |o: &Order| o.id == 7))?
///     .filter(|order| order.status == Status::Open)
///     .apply(|order| order.status = Status::Paid)
///     .save(&payments, |order| Payment::for_order(order))
///     .execute()?;
/// ```
pub struct LockedContext<'a, T: Entity, S: ShardStore> {
    dao: &'a RelationalDao<T, S>,
    shard_id: ShardId,
    parent_key: String,
    store: Arc<S>,
    seed: Option<Seed<T>>,
    operations: Vec<Operation<'a, T, S>>,
    state: ContextState,
}

impl<T: Entity, S: ShardStore> fmt::Debug for LockedContext<'_, T, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockedContext")
            .field("shard_id", &self.shard_id)
            .field("parent_key", &self.parent_key)
            .field("store", &self.store.name())
            .field("operations", &self.operations.len())
            .field("state", &self.state)
            .finish()
    }
}

impl<'a, T: Entity, S: ShardStore> LockedContext<'a, T, S> {
    pub(crate) fn new(
        dao: &'a RelationalDao<T, S>,
        shard_id: ShardId,
        parent_key: &str,
        store: Arc<S>,
        seed: Seed<T>,
    ) -> Self {
        Self {
            dao,
            shard_id,
            parent_key: parent_key.to_string(),
            store,
            seed: Some(seed),
            operations: Vec::new(),
            state: ContextState::Initial,
        }
    }

    /// Shard the context runs on.
    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    /// Routing key the context was created for.
    pub fn parent_key(&self) -> &str {
        &self.parent_key
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    /// Modify the seed entity; the change is written in the shared transaction.
    pub fn apply(self, mutator: impl FnOnce(&mut T) + 'a) -> Self {
        self.then(move |session, entity| {
            let before = entity.clone();
            mutator(entity);
            Ok(session.update(&before, entity.clone())?)
        })
    }

    /// Abort the chain unless `predicate` holds for the seed entity.
    pub fn filter(self, predicate: impl FnOnce(&T) -> bool + 'a) -> Self {
        self.then(move |_, entity| {
            if predicate(&*entity) {
                Ok(())
            } else {
                Err(Error::ContextAborted(format!(
                    "{} {} rejected by filter",
                    T::TABLE,
                    entity.key()
                )))
            }
        })
    }

    /// Save an entity derived from the seed entity through `dao`.
    pub fn save<U: Entity>(
        self,
        dao: &'a RelationalDao<U, S>,
        generator: impl FnOnce(&T) -> U + 'a,
    ) -> Self {
        let shard_id = self.shard_id;
        self.then(move |session, entity| {
            dao.save_joined(session, shard_id, generator(&*entity))?;
            Ok(())
        })
    }

    /// Save several entities derived from the seed entity through `dao`.
    pub fn save_all<U: Entity>(
        self,
        dao: &'a RelationalDao<U, S>,
        generator: impl FnOnce(&T) -> Vec<U> + 'a,
    ) -> Self {
        let shard_id = self.shard_id;
        self.then(move |session, entity| {
            dao.save_all_joined(session, shard_id, generator(&*entity))?;
            Ok(())
        })
    }

    /// Replace the entity with `key`. Aborts the chain if it does not exist
    /// or the updater returns `None`.
    pub fn update<U: Entity>(
        self,
        dao: &'a RelationalDao<U, S>,
        key: U::Key,
        updater: impl FnOnce(U) -> Option<U> + 'a,
    ) -> Self {
        let shard_id = self.shard_id;
        self.then(move |session, _| {
            let outcome = dao.update_joined(session, shard_id, &key, updater)?;
            require_updated(outcome, || format!("update of {} {}", U::TABLE, key))
        })
    }

    /// Replace matches of `criteria` in order until `update_next` returns
    /// `false`. Aborts the chain if the updater returns `None`.
    pub fn update_matching<U: Entity>(
        self,
        dao: &'a RelationalDao<U, S>,
        criteria: Criteria<U>,
        updater: impl FnMut(U) -> Option<U> + 'a,
        update_next: impl FnMut() -> bool + 'a,
    ) -> Self {
        let shard_id = self.shard_id;
        self.then(move |session, _| {
            let outcome =
                dao.update_matching_joined(session, shard_id, &criteria, updater, update_next)?;
            require_updated(outcome, || {
                format!("update of {} matching {}", U::TABLE, criteria.description())
            })
        })
    }

    /// Replace the first match of `criteria`, or save a generated entity when
    /// nothing matches.
    pub fn create_or_update<U: Entity>(
        self,
        dao: &'a RelationalDao<U, S>,
        criteria: Criteria<U>,
        updater: impl FnOnce(U) -> Option<U> + 'a,
        generator: impl FnOnce(&T) -> U + 'a,
    ) -> Self {
        let shard_id = self.shard_id;
        self.then(move |session, entity| {
            let outcome = dao.create_or_update_joined(
                session,
                shard_id,
                &criteria,
                updater,
                || generator(&*entity),
            )?;
            require_updated(outcome, || {
                format!("create or update of {} matching {}", U::TABLE, criteria.description())
            })
        })
    }

    /// Run a registered bulk update.
    pub fn update_using_query<U: Entity>(
        self,
        dao: &'a RelationalDao<U, S>,
        operation: UpdateOperationMeta,
    ) -> Self {
        let shard_id = self.shard_id;
        self.then(move |session, _| {
            let changed = dao.update_using_query_joined(session, shard_id, &operation)?;
            debug!(query = %operation.query_name, changed, "Bulk update in locked context");
            Ok(())
        })
    }

    /// Run the seed and every queued action in one transaction and return
    /// the seed entity as it stands at the end of the chain.
    ///
    /// Returns [`Error::ContextConsumed`] when called again.
    pub fn execute(&mut self) -> Result<T> {
        if matches!(self.state, ContextState::Executed | ContextState::Failed) {
            return Err(Error::ContextConsumed);
        }
        let seed = self.seed.take().ok_or(Error::ContextConsumed)?;
        let operations = std::mem::take(&mut self.operations);
        debug!(
            shard_id = self.shard_id,
            operations = operations.len(),
            "Executing locked context"
        );

        let result = self.dao.executor().execute(
            TransactionScope::Begin(&*self.store),
            TransactionInfo::read_write(seed.operation(), self.shard_id),
            |session, seed: Seed<T>| seed.run(session),
            seed,
            |session, mut entity| {
                for operation in operations {
                    operation(&mut *session, &mut entity)?;
                }
                Ok(entity)
            },
        );

        self.state = if result.is_ok() {
            ContextState::Executed
        } else {
            ContextState::Failed
        };
        result
    }

    fn then(
        mut self,
        operation: impl FnOnce(&mut S::Session, &mut T) -> Result<()> + 'a,
    ) -> Self {
        self.operations.push(Box::new(operation));
        if self.state == ContextState::Initial {
            self.state = ContextState::Chained;
        }
        self
    }
}

fn require_updated(outcome: UpdateOutcome, what: impl FnOnce() -> String) -> Result<()> {
    match outcome {
        UpdateOutcome::Updated => Ok(()),
        UpdateOutcome::NotFound => Err(Error::ContextAborted(format!("{}: not found", what()))),
        UpdateOutcome::Rejected => Err(Error::ContextAborted(format!(
            "{}: rejected by updater",
            what()
        ))),
    }
}

//! Runs units of work inside store transactions.

use super::observer::{ObserverChain, ObserverContext};
use crate::error::{Error, Result, StoreError};
use crate::store::{Session, ShardStore, TransactionMode};
use crate::types::ShardId;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Where a unit of work gets its transaction from.
pub enum TransactionScope<'a, S: ShardStore> {
    /// Open a new transaction on the store; commit on success, roll back on
    /// failure.
    Begin(&'a S),
    /// Join a transaction owned by the caller. Nothing is committed or
    /// rolled back here.
    Join(&'a mut S::Session),
}

impl<S: ShardStore> TransactionScope<'_, S> {
    /// Whether this call owns the transaction boundary.
    pub fn completes_transaction(&self) -> bool {
        matches!(self, TransactionScope::Begin(_))
    }
}

impl<S: ShardStore> fmt::Debug for TransactionScope<'_, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionScope::Begin(store) => f.debug_tuple("Begin").field(&store.name()).finish(),
            TransactionScope::Join(_) => f.write_str("Join"),
        }
    }
}

/// Describes one executed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionInfo {
    pub operation: &'static str,
    pub shard_id: ShardId,
    pub mode: TransactionMode,
}

impl TransactionInfo {
    pub fn read_only(operation: &'static str, shard_id: ShardId) -> Self {
        Self {
            operation,
            shard_id,
            mode: TransactionMode::ReadOnly,
        }
    }

    pub fn read_write(operation: &'static str, shard_id: ShardId) -> Self {
        Self {
            operation,
            shard_id,
            mode: TransactionMode::ReadWrite,
        }
    }
}

/// Executes work against a shard store through the observer chain.
///
/// One executor is built per DAO; it carries the namespace and the type
/// names reported to observers. Safe to share between threads; every call
/// uses its own transaction.
#[derive(Debug, Clone)]
pub struct TransactionExecutor {
    chain: Arc<ObserverChain>,
    namespace: Arc<str>,
    dao_type: &'static str,
    entity_type: &'static str,
}

impl TransactionExecutor {
    pub fn new(
        chain: Arc<ObserverChain>,
        namespace: impl Into<Arc<str>>,
        dao_type: &'static str,
        entity_type: &'static str,
    ) -> Self {
        Self {
            chain,
            namespace: namespace.into(),
            dao_type,
            entity_type,
        }
    }

    /// Namespace reported to observers.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Run `work(session, arg)`, then `handler(session, result)`.
    ///
    /// With [`TransactionScope::Begin`] the transaction is committed when both
    /// succeed and rolled back otherwise, and failures come back as
    /// [`Error::Transaction`] carrying the operation and shard. With
    /// [`TransactionScope::Join`] errors propagate unchanged and the
    /// caller's transaction is left alone.
    pub fn execute<S, A, R, U>(
        &self,
        scope: TransactionScope<'_, S>,
        info: TransactionInfo,
        work: impl FnOnce(&mut S::Session, A) -> Result<R>,
        arg: A,
        handler: impl FnOnce(&mut S::Session, R) -> Result<U>,
    ) -> Result<U>
    where
        S: ShardStore,
    {
        let mut ctx = self.context(&info);
        match scope {
            TransactionScope::Begin(store) => self
                .chain
                .run(&mut ctx, |_| {
                    let mut session = store.begin(info.mode)?;
                    let outcome = work(&mut session, arg).and_then(|r| handler(&mut session, r));
                    match outcome {
                        Ok(value) => {
                            session.commit()?;
                            debug!(
                                operation = info.operation,
                                shard_id = info.shard_id,
                                store = store.name(),
                                "Transaction committed"
                            );
                            Ok(value)
                        }
                        Err(e) => {
                            if let Err(rollback_err) = session.rollback() {
                                warn!(
                                    operation = info.operation,
                                    shard_id = info.shard_id,
                                    error = %rollback_err,
                                    "Rollback failed"
                                );
                            }
                            Err(e)
                        }
                    }
                })
                .map_err(|source| Error::Transaction {
                    operation: info.operation,
                    shard_id: info.shard_id,
                    source: Box::new(source),
                }),
            TransactionScope::Join(session) => self.chain.run(&mut ctx, |_| {
                let result = work(session, arg)?;
                handler(session, result)
            }),
        }
    }

    /// [`execute`](Self::execute) in a new transaction, without a result handler.
    pub fn run<S, R>(
        &self,
        store: &S,
        info: TransactionInfo,
        work: impl FnOnce(&mut S::Session) -> Result<R>,
    ) -> Result<R>
    where
        S: ShardStore,
    {
        self.execute(
            TransactionScope::Begin(store),
            info,
            |session, ()| work(session),
            (),
            |_, r| Ok(r),
        )
    }

    /// [`execute`](Self::execute) inside the caller's transaction.
    pub fn join<S, R>(
        &self,
        session: &mut S::Session,
        info: TransactionInfo,
        work: impl FnOnce(&mut S::Session) -> Result<R>,
    ) -> Result<R>
    where
        S: ShardStore,
    {
        self.execute::<S, _, _, _>(
            TransactionScope::Join(session),
            info,
            |session, ()| work(session),
            (),
            |_, r| Ok(r),
        )
    }

    /// Run `work` in a new transaction, reporting a missing row as `None`
    /// instead of an error. The transaction still commits in that case.
    pub fn execute_and_resolve<S, R>(
        &self,
        store: &S,
        info: TransactionInfo,
        work: impl FnOnce(&mut S::Session) -> Result<Option<R>>,
    ) -> Result<Option<R>>
    where
        S: ShardStore,
    {
        self.run(store, info, |session| match work(session) {
            Err(Error::Store(StoreError::MissingRow { table, key })) => {
                debug!(table, %key, operation = info.operation, "Resolved missing row to none");
                Ok(None)
            }
            other => other,
        })
    }

    fn context(&self, info: &TransactionInfo) -> ObserverContext {
        ObserverContext::new(
            info.operation,
            info.shard_id,
            self.namespace.clone(),
            self.dao_type,
            self.entity_type,
        )
    }
}

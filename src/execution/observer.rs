//! Observer chain wrapped around every transactional operation.
//!
//! Observers are invoked in registration order. Each one receives the
//! operation's [`ObserverContext`] and a `next` continuation, and must call
//! `next` exactly once. Metadata an observer attaches to the context before
//! calling `next` is visible to every later observer and to the unit of work;
//! the observer detaches it afterwards.
//!
//! The context is passed explicitly rather than kept in thread-local state,
//! so nested and concurrent executions never see each other's metadata.

use crate::error::{Error, Result};
use crate::types::ShardId;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info_span, warn};

/// Metadata for one observed operation.
#[derive(Debug, Clone)]
pub struct ObserverContext {
    operation: &'static str,
    shard_id: ShardId,
    namespace: Arc<str>,
    dao_type: &'static str,
    entity_type: &'static str,
    tags: Vec<(&'static str, String)>,
}

impl ObserverContext {
    /// Create a context for one operation.
    pub fn new(
        operation: &'static str,
        shard_id: ShardId,
        namespace: Arc<str>,
        dao_type: &'static str,
        entity_type: &'static str,
    ) -> Self {
        Self {
            operation,
            shard_id,
            namespace,
            dao_type,
            entity_type,
            tags: Vec::new(),
        }
    }

    /// Operation name, e.g. `"save"`.
    pub fn operation(&self) -> &'static str {
        self.operation
    }

    /// Shard the operation runs on.
    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    /// Namespace of the shard set.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// DAO type issuing the operation.
    pub fn dao_type(&self) -> &'static str {
        self.dao_type
    }

    /// Entity type the operation works on.
    pub fn entity_type(&self) -> &'static str {
        self.entity_type
    }

    /// Attach a tag, replacing any previous value under the same name.
    pub fn attach(&mut self, name: &'static str, value: impl Into<String>) {
        let value = value.into();
        match self.tags.iter_mut().find(|(n, _)| *n == name) {
            Some(tag) => tag.1 = value,
            None => self.tags.push((name, value)),
        }
    }

    /// Detach a tag, returning its value.
    pub fn detach(&mut self, name: &str) -> Option<String> {
        let idx = self.tags.iter().position(|(n, _)| *n == name)?;
        Some(self.tags.remove(idx).1)
    }

    /// Value of an attached tag.
    pub fn tag(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }

    /// All attached tags, in attach order.
    pub fn tags(&self) -> &[(&'static str, String)] {
        &self.tags
    }
}

/// Continuation handed to an observer.
pub type Next<'a> = dyn FnMut(&mut ObserverContext) -> Result<()> + 'a;

/// A cross-cutting wrapper around transactional work.
pub trait TransactionObserver: Send + Sync + Debug {
    /// Name used in diagnostics.
    fn name(&self) -> &str;

    /// Run `next` exactly once, doing any work needed before and after it.
    fn observe(&self, ctx: &mut ObserverContext, next: &mut Next<'_>) -> Result<()>;
}

/// Ordered list of observers.
#[derive(Debug, Clone, Default)]
pub struct ObserverChain {
    observers: Vec<Arc<dyn TransactionObserver>>,
}

impl ObserverChain {
    /// Create an empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an observer.
    pub fn with(mut self, observer: Arc<dyn TransactionObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Append an observer in place.
    pub fn push(&mut self, observer: Arc<dyn TransactionObserver>) {
        self.observers.push(observer);
    }

    /// Number of observers.
    pub fn len(&self) -> usize {
        self.observers.len()
    }

    /// Whether the chain has no observers.
    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    /// Run `work` inside every observer.
    pub fn run<R>(
        &self,
        ctx: &mut ObserverContext,
        work: impl FnOnce(&mut ObserverContext) -> Result<R>,
    ) -> Result<R> {
        let mut work = Some(work);
        let mut output = None;
        let mut terminal = |ctx: &mut ObserverContext| -> Result<()> {
            let work = work
                .take()
                .ok_or_else(|| Error::Internal("unit of work invoked twice".into()))?;
            output = Some(work(ctx)?);
            Ok(())
        };

        self.dispatch(0, ctx, &mut terminal)?;
        output.ok_or_else(|| Error::Internal("unit of work never ran".into()))
    }

    fn dispatch(
        &self,
        idx: usize,
        ctx: &mut ObserverContext,
        terminal: &mut Next<'_>,
    ) -> Result<()> {
        let Some(observer) = self.observers.get(idx) else {
            return terminal(ctx);
        };

        let mut calls = 0usize;
        let result = {
            let mut next = |ctx: &mut ObserverContext| -> Result<()> {
                calls += 1;
                if calls > 1 {
                    return Err(Error::Internal(format!(
                        "observer {} invoked next more than once",
                        observer.name()
                    )));
                }
                self.dispatch(idx + 1, ctx, &mut *terminal)
            };
            observer.observe(ctx, &mut next)
        };

        if result.is_ok() && calls == 0 {
            return Err(Error::ObserverSkipped(observer.name().to_string()));
        }
        result
    }
}

/// Opens a `tracing` span per operation and logs its outcome.
#[derive(Debug, Default)]
pub struct TracingObserver;

impl TransactionObserver for TracingObserver {
    fn name(&self) -> &str {
        "tracing"
    }

    fn observe(&self, ctx: &mut ObserverContext, next: &mut Next<'_>) -> Result<()> {
        let span = info_span!(
            "transaction",
            namespace = %ctx.namespace(),
            operation = ctx.operation(),
            shard_id = ctx.shard_id(),
            dao = ctx.dao_type(),
            entity = ctx.entity_type(),
        );
        let _guard = span.enter();
        let start = Instant::now();

        let result = next(ctx);
        match &result {
            Ok(()) => debug!(elapsed_us = start.elapsed().as_micros() as u64, "Operation completed"),
            Err(e) => warn!(error = %e, elapsed_us = start.elapsed().as_micros() as u64, "Operation failed"),
        }
        result
    }
}

/// Attaches the DAO and entity type names as context tags for the duration
/// of the operation.
#[derive(Debug, Default)]
pub struct TypeTagObserver;

impl TypeTagObserver {
    /// Tag carrying the DAO type.
    pub const DAO_TAG: &'static str = "dao.type";
    /// Tag carrying the entity type.
    pub const ENTITY_TAG: &'static str = "entity.type";
}

impl TransactionObserver for TypeTagObserver {
    fn name(&self) -> &str {
        "type-tags"
    }

    fn observe(&self, ctx: &mut ObserverContext, next: &mut Next<'_>) -> Result<()> {
        ctx.attach(Self::DAO_TAG, ctx.dao_type());
        ctx.attach(Self::ENTITY_TAG, ctx.entity_type());
        let result = next(ctx);
        ctx.detach(Self::ENTITY_TAG);
        ctx.detach(Self::DAO_TAG);
        result
    }
}

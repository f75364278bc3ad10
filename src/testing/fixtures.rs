//! Shared entities and database setup for the integration-style tests.

use crate::config::ShardingConfig;
use crate::dao::ShardedDatabase;
use crate::error::Result;
use crate::execution::{Next, ObserverContext, TransactionObserver};
use crate::store::{Entity, MemoryStore};
use crate::types::ShardId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub(crate) const SHARDS: u32 = 16;

/// Named update setting `value` on every row whose `key_two` matches.
pub(crate) const UPDATE_BY_KEY_TWO: &str = "testUpdateUsingKeyTwo";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct RelationalEntity {
    pub key: String,
    pub key_two: String,
    pub value: String,
}

impl RelationalEntity {
    pub fn new(key: &str, key_two: &str, value: &str) -> Self {
        Self {
            key: key.to_string(),
            key_two: key_two.to_string(),
            value: value.to_string(),
        }
    }
}

impl Entity for RelationalEntity {
    type Key = String;
    const TABLE: &'static str = "relational_entities";

    fn key_fields() -> &'static [&'static str] {
        &["key"]
    }

    fn key(&self) -> String {
        self.key.clone()
    }
}

/// Child rows written alongside a [`RelationalEntity`] in locked contexts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct AuditEntry {
    pub id: String,
    pub entity_key: String,
    pub note: String,
}

impl AuditEntry {
    pub fn for_entity(entity: &RelationalEntity, note: &str) -> Self {
        Self {
            id: format!("{}:{}", entity.key, note),
            entity_key: entity.key.clone(),
            note: note.to_string(),
        }
    }
}

impl Entity for AuditEntry {
    type Key = String;
    const TABLE: &'static str = "audit_entries";

    fn key_fields() -> &'static [&'static str] {
        &["id"]
    }

    fn key(&self) -> String {
        self.id.clone()
    }
}

pub(crate) struct TestDatabase {
    pub db: ShardedDatabase<MemoryStore>,
    /// Handles to the same stores the database uses, indexed by shard.
    pub stores: Vec<MemoryStore>,
}

impl TestDatabase {
    pub fn new(shards: u32) -> Self {
        Self::with_config(ShardingConfig::new("test"), shards)
    }

    pub fn with_config(config: ShardingConfig, shards: u32) -> Self {
        let stores: Vec<MemoryStore> = (0..shards)
            .map(|i| {
                let store = MemoryStore::new(format!("shard-{}", i));
                register_updates(&store);
                store
            })
            .collect();
        let db = ShardedDatabase::with_single_stores(config, stores.clone()).unwrap();
        Self { db, stores }
    }

    /// Total committed rows of a table across all shards.
    pub fn committed_rows(&self, table: &str) -> usize {
        self.stores.iter().map(|s| s.committed_rows(table)).sum()
    }

    pub fn held_locks(&self) -> usize {
        self.stores.iter().map(|s| s.held_locks()).sum()
    }
}

fn register_updates(store: &MemoryStore) {
    store.register_update::<RelationalEntity, _>(UPDATE_BY_KEY_TWO, |row, op| {
        let key_two = op.param("keyTwo")?.as_str()?;
        let value = op.param("value")?.as_str()?;
        (row.key_two == key_two).then(|| RelationalEntity {
            value: value.to_string(),
            ..row.clone()
        })
    });
}

/// Random routing key.
pub(crate) fn parent_key() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// One recorded observer hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Hook {
    pub observer: &'static str,
    pub phase: &'static str,
    pub operation: &'static str,
    pub shard_id: ShardId,
}

/// Observer that records its before/after hooks into a shared log.
#[derive(Debug)]
pub(crate) struct RecordingObserver {
    name: &'static str,
    log: Arc<Mutex<Vec<Hook>>>,
}

impl RecordingObserver {
    pub fn new(name: &'static str, log: Arc<Mutex<Vec<Hook>>>) -> Self {
        Self { name, log }
    }

    fn record(&self, phase: &'static str, ctx: &ObserverContext) {
        self.log.lock().push(Hook {
            observer: self.name,
            phase,
            operation: ctx.operation(),
            shard_id: ctx.shard_id(),
        });
    }
}

impl TransactionObserver for RecordingObserver {
    fn name(&self) -> &str {
        self.name
    }

    fn observe(&self, ctx: &mut ObserverContext, next: &mut Next<'_>) -> Result<()> {
        self.record("before", ctx);
        ctx.attach(self.name, "active");
        let result = next(ctx);
        ctx.detach(self.name);
        self.record("after", ctx);
        result
    }
}

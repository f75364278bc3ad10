//! Integration-style tests running the DAO layer against in-memory shards.
//!
//! - `relational_dao_tests`: single-shard operations end to end
//! - `locked_context_tests`: chained operations in one transaction
//! - `scatter_gather_tests`: fan-out across shards
//! - `observer_tests`: observer hooks around real operations
//! - `topology_tests`: custom shard managers and multi-store shards

mod fixtures;

mod relational_dao_tests;

pub(crate) use fixtures::*;

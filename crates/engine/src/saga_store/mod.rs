//! Saga instance persistence boundary.
//!
//! This module defines the transactional store contract the dispatch engine runs
//! every saga transition through, plus an in-memory and a PostgreSQL implementation.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemorySagaStore;
pub use postgres::PostgresSagaStore;
pub use r#trait::{
    ArmedTimeout, OutboxEntry, SagaInstance, SagaStatus, SagaStore, SagaStoreError,
    SagaTransaction,
};

//! Persistence layer for worker coordination
//!
//! This module provides:
//! - [`CoordinationStore`] trait over the shared state store
//! - [`RedisCoordinationStore`] for production
//! - [`InMemoryCoordinationStore`] for tests and benchmarks

pub mod keys;
mod memory;
mod redis_store;
mod store;

pub use memory::InMemoryCoordinationStore;
pub use redis_store::RedisCoordinationStore;
pub use store::{
    validate_capability, Assignment, CoordinationStore, HeartbeatResponse, ReapReport,
    ReleaseOutcome, Selection, SelectionRequest, StoreError, WorkerFilter, WorkerKey,
    WorkerRecord, WorkerSnapshot, WorkerStatus,
};

//! Beats storage service.
//!
//! Owns the consistency between the two stores a beat lives in (blob
//! storage for audio/cover files, Postgres for metadata), protects the
//! blob store with load shedding and a concurrency ceiling, and consumes
//! user lifecycle events from the bus.

pub mod blob_gateway;
pub mod blob_store;
pub mod config;
pub mod consumer;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod handlers;
pub mod limiter;
pub mod load_guard;
pub mod repository;

#[cfg(test)]
pub mod testing;

//! Persistence layer for drover: the durable PostgreSQL backend, the
//! in-memory fallback backend, and the [`fallback::FallbackStore`] that
//! switches between them without ever blocking the broker loop.

pub mod backend;
pub mod config;
pub mod fallback;
pub mod mem;
pub mod models;
pub mod pg;
pub mod pool;

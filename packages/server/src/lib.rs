// Tillbridge - durable job queue and webhook bridge to the retail vendor API
//
// This crate mediates between the back office and the vendor's HTTP API:
// admin-enqueued jobs, periodic pulls and inbound signed webhooks are stored
// in Postgres and drained by a bounded dispatcher with retry, idempotency
// and circuit-breaker semantics.

pub mod common;
pub mod config;
pub mod kernel;
pub mod server;

pub use config::Config;

//! forohtoo — a Solana wallet activity monitor.
//!
//! The service watches a set of externally-held accounts, delivers each
//! newly observed transaction to every interested live subscriber, and
//! persists it durably. Monitoring is self-service: a caller asks to watch
//! an address, is quoted a fee and a unique memo, and the registration is
//! committed once a ledger payment matching that fee and memo is observed
//! on the service account.
//!
//! # Modules
//!
//! - [`rpc`] — facade over a pool of upstream RPC endpoints with failure
//!   classification.
//! - [`parser`] — instruction-level decoding into normalized transaction
//!   records.
//! - [`poll`] — the per-subscription poll cycle with dedup and backoff.
//! - [`scheduler`] — interval-triggered scheduling of poll cycles.
//! - [`workflow`] — the poll workflow and the payment-gated registration
//!   workflow.
//! - [`store`] — durable storage (Postgres) with idempotent writes.
//! - [`events`] — the subject-partitioned event log (JetStream).
//! - [`sse`] — the HTTP event-stream endpoint replaying history before the
//!   live feed.
//! - [`awaiter`] — predicate-matched waiting over history plus live events.
//! - [`admin`] / [`handlers`] — the registration surface and its HTTP
//!   endpoints.

pub mod admin;
pub mod awaiter;
pub mod config;
pub mod events;
pub mod handlers;
pub mod network;
pub mod parser;
pub mod poll;
pub mod rpc;
pub mod scheduler;
pub mod shutdown;
pub mod sse;
pub mod store;
pub mod telemetry;
pub mod types;
pub mod workflow;

#[cfg(test)]
pub(crate) mod testing;

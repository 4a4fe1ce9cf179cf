//! Core types and trait seams for the Relaybox outbox dispatch subsystem.
//!
//! Relaybox reliably propagates committed domain state changes to a message
//! broker using the transactional outbox pattern:
//!
//! 1. A writer appends an event row to the outbox table inside the same
//!    database transaction as its domain mutation.
//! 2. A dispatcher loop claims unpublished rows (lock-skip semantics, so
//!    multiple replicas never double-claim), encodes them with Schema
//!    Registry framing, and publishes them to the broker in per-topic
//!    batches.
//! 3. Batches that cannot be delivered are routed to a dead-letter table,
//!    from which a reclaimer loop re-offers them with bounded exponential
//!    backoff, quarantining entries that exhaust their retry budget.
//!
//! Delivery is **at-least-once**: consumers must deduplicate on event id.
//!
//! This crate is I/O free. Concrete implementations live in
//! `relaybox-postgres` (stores), `relaybox-kafka` (publisher),
//! `relaybox-registry` (schema registrar) and `relaybox-dispatch` (the two
//! control loops).

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backoff;
pub mod catalog;
pub mod event;
pub mod publisher;
pub mod registry;
pub mod store;
pub mod wire;

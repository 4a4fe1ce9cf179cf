//! Control loops turning outbox rows into published broker messages.
//!
//! # Overview
//!
//! Two independent loops, each owning one half of the delivery lifecycle:
//!
//! - [`Dispatcher`]: polls the outbox, claims a batch, resolves schema ids,
//!   frames payloads, publishes per-topic batches, and finalizes every claimed
//!   row exactly once (published or dead-lettered, never stuck).
//! - [`DlqReclaimer`]: polls the dead-letter table and retries entries with
//!   exponential backoff until they requeue or exhaust their retry budget.
//!
//! Both loops are driven by a `tokio::sync::watch` shutdown channel and are
//! safe to run as multiple replicas: all coordination happens in the stores.
//!
//! ```text
//! ┌────────┐ claim  ┌────────────┐ publish ┌────────┐
//! │ outbox │───────►│ Dispatcher │────────►│ broker │
//! └────────┘        └─────┬──────┘         └────────┘
//!      ▲                  │ on failure
//!      │ requeue    ┌─────▼──────┐
//!      └────────────│    DLQ     │◄── DlqReclaimer (backoff, quarantine)
//!                   └────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod dispatcher;
pub mod reclaimer;

pub use config::DispatchConfig;
pub use dispatcher::Dispatcher;
pub use reclaimer::DlqReclaimer;

//! Schema registrar trait seam.

use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur while resolving a schema.
#[derive(Error, Debug, Clone)]
pub enum RegistryError {
    /// Request could not be sent or the registry did not respond.
    #[error("schema registry request failed: {0}")]
    Request(String),

    /// The registry rejected a lookup or registration.
    #[error("schema registry error for subject '{subject}': {body}")]
    Rejected {
        /// The subject being looked up or registered.
        subject: String,
        /// Response body returned by the registry.
        body: String,
    },

    /// The registry response could not be decoded.
    #[error("schema registry response decode failed: {0}")]
    Decode(String),
}

/// Resolves or registers a wire schema and returns its stable numeric id.
///
/// `ensure_schema` is idempotent: registering an identical schema twice is
/// safe and yields the same id (the registry deduplicates). Callers cache
/// `(subject, schema) -> id` for process lifetime; subjects are effectively
/// append-only per event type, so the cache is never invalidated mid-process.
pub trait SchemaRegistrar: Send + Sync {
    /// Return the id of the latest schema registered under `subject`,
    /// registering `schema` first if the subject does not exist yet.
    fn ensure_schema<'a>(
        &'a self,
        subject: &'a str,
        schema: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<i32, RegistryError>> + Send + 'a>>;
}

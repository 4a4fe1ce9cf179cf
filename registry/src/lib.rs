//! Confluent-compatible schema registry client.
//!
//! Implements the [`SchemaRegistrar`] trait from `relaybox-core` over the
//! registry's HTTP API: look up the latest version of a subject, and register
//! a new version when the subject does not exist yet. Registration is
//! idempotent on the registry side, so racing registrations of an identical
//! schema converge on the same id.
//!
//! Caching is the caller's concern: the dispatcher memoizes
//! `(subject, schema) -> id` for its process lifetime.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use relaybox_core::registry::{RegistryError, SchemaRegistrar};
use reqwest::StatusCode;
use serde::Deserialize;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

const REGISTRY_CONTENT_TYPE: &str = "application/vnd.schemaregistry.v1+json";

#[derive(Deserialize)]
struct SchemaIdResponse {
    id: i32,
}

/// HTTP client for a Confluent-style schema registry.
#[derive(Clone)]
pub struct SchemaRegistryClient {
    client: reqwest::Client,
    base_url: String,
}

impl SchemaRegistryClient {
    /// Create a client for the registry at `base_url` with a 10s timeout.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Request`] if the underlying HTTP client
    /// cannot be constructed.
    pub fn new(base_url: impl Into<String>) -> Result<Self, RegistryError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| RegistryError::Request(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn fetch_latest(&self, subject: &str) -> Result<i32, RegistryError> {
        let url = format!("{}/subjects/{subject}/versions/latest", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| RegistryError::Request(e.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(RegistryError::Rejected {
                subject: subject.to_string(),
                body: "schema subject not found".to_string(),
            }),
            status if status.is_success() => response
                .json::<SchemaIdResponse>()
                .await
                .map(|body| body.id)
                .map_err(|e| RegistryError::Decode(e.to_string())),
            _ => {
                let body = response.text().await.unwrap_or_default();
                Err(RegistryError::Rejected {
                    subject: subject.to_string(),
                    body,
                })
            }
        }
    }

    async fn register(&self, subject: &str, schema: &str) -> Result<i32, RegistryError> {
        let url = format!("{}/subjects/{subject}/versions", self.base_url);
        let body = serde_json::json!({
            "schemaType": "JSON",
            "schema": schema,
        });

        let response = self
            .client
            .post(&url)
            .header("content-type", REGISTRY_CONTENT_TYPE)
            .json(&body)
            .send()
            .await
            .map_err(|e| RegistryError::Request(e.to_string()))?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RegistryError::Rejected {
                subject: subject.to_string(),
                body,
            });
        }

        let id = response
            .json::<SchemaIdResponse>()
            .await
            .map(|body| body.id)
            .map_err(|e| RegistryError::Decode(e.to_string()))?;

        tracing::info!(subject = subject, schema_id = id, "Schema registered");
        Ok(id)
    }
}

impl SchemaRegistrar for SchemaRegistryClient {
    fn ensure_schema<'a>(
        &'a self,
        subject: &'a str,
        schema: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<i32, RegistryError>> + Send + 'a>> {
        Box::pin(async move {
            // Lookup first; any miss (including a registry that has never
            // seen the subject) falls through to registration.
            if let Ok(id) = self.fetch_latest(subject).await {
                return Ok(id);
            }

            self.register(subject, schema).await
        })
    }
}

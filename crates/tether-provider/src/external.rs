//! Provider-side external client traits.
//!
//! A provider registers one [`ExternalConnector`] per kind. For every
//! session the router calls the connector once at connect time to obtain an
//! [`ExternalClient`] bound to that session's resource; the client then
//! handles the observe/create/update/delete loop until disconnect or stream
//! end, at which point the router closes it. A client instance is owned by
//! exactly one session and is never shared.

use async_trait::async_trait;
use tether_core::{Creation, Deletion, Observation, Resource, Update};

/// Error returned by provider handler implementations.
///
/// Handlers are arbitrary provider code; failures surface to the peer as an
/// internal status that terminates the session.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct ExternalError {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl ExternalError {
    /// Builds an error from a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Builds an error wrapping an underlying cause.
    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Factory producing an external client bound to one declarative object.
///
/// Connect may mutate the object (e.g. to record connection metadata); the
/// mutated copy travels back to the caller in the connect response.
#[async_trait]
pub trait ExternalConnector: Send + Sync {
    /// Establishes whatever provider-side state one session needs.
    ///
    /// # Errors
    ///
    /// Returns [`ExternalError`] when the external system is unreachable or
    /// the object cannot be bound.
    async fn connect(&self, resource: &mut Resource)
        -> Result<Box<dyn ExternalClient>, ExternalError>;
}

/// One session's handle on an external resource.
///
/// Owns any remote credentials, cursors, or cached handles for the bound
/// resource. `close` is always called exactly once, on disconnect or when
/// the stream ends.
#[async_trait]
pub trait ExternalClient: Send + Sync {
    /// Observes the external resource backing the object.
    async fn observe(&self, resource: &mut Resource) -> Result<Observation, ExternalError>;

    /// Creates the external resource.
    async fn create(&self, resource: &mut Resource) -> Result<Creation, ExternalError>;

    /// Updates the external resource toward the desired state.
    async fn update(&self, resource: &mut Resource) -> Result<Update, ExternalError>;

    /// Deletes the external resource. A resource that is already gone is
    /// not an error; the handler reports it through the outcome details.
    async fn delete(&self, resource: &mut Resource) -> Result<Deletion, ExternalError>;

    /// Releases provider-side state for this session.
    async fn close(&self) -> Result<(), ExternalError>;
}

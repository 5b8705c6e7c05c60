//! External collaborator seams.
//!
//! The engine consumes three interfaces from the surrounding system: a
//! watchable object store, a publish target for connection details, and an
//! event recorder. How they are implemented is the deployment's concern;
//! [`memory`] provides in-process implementations used by tests and the
//! standalone binary.

pub mod memory;

use async_trait::async_trait;
use tether_core::{ConnectionDetails, Kind, ObjectKey, Resource};

/// Errors raised by store backends.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backend failed.
    #[error("store backend error: {message}")]
    Backend {
        /// Description of the failure.
        message: String,
    },

    /// The object to update does not exist (or was modified concurrently).
    #[error("conflict updating {key}")]
    Conflict {
        /// The contended key.
        key: ObjectKey,
    },
}

/// Callback invoked by the store for every change to a watched kind.
pub type WatchHandler = Box<dyn Fn(&Resource) + Send + Sync>;

/// A watchable declarative object store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetches one object, `None` when it does not exist.
    async fn get(&self, kind: &Kind, key: &ObjectKey) -> Result<Option<Resource>, StoreError>;

    /// Lists all objects of a kind.
    async fn list(&self, kind: &Kind) -> Result<Vec<Resource>, StoreError>;

    /// Persists spec-level changes (finalizers, late-initialized fields).
    async fn update(&self, resource: &Resource) -> Result<(), StoreError>;

    /// Persists status-level changes.
    async fn update_status(&self, resource: &Resource) -> Result<(), StoreError>;

    /// Installs a change handler for a kind. The handler runs for every
    /// create, update, and delete of objects of that kind.
    fn add_watch(&self, kind: &Kind, handler: WatchHandler) -> Result<(), StoreError>;
}

/// Errors raised by connection-detail publishers.
#[derive(Debug, thiserror::Error)]
#[error("failed to publish connection details: {message}")]
pub struct PublishError {
    /// Description of the failure.
    pub message: String,
}

/// Publish target for secret material produced by provider operations.
#[async_trait]
pub trait ConnectionPublisher: Send + Sync {
    /// Publishes the details for the given object. Empty detail maps are
    /// skipped by callers.
    async fn publish(
        &self,
        resource: &Resource,
        details: &ConnectionDetails,
    ) -> Result<(), PublishError>;
}

/// A publisher that discards everything.
pub struct NopPublisher;

#[async_trait]
impl ConnectionPublisher for NopPublisher {
    async fn publish(
        &self,
        _resource: &Resource,
        _details: &ConnectionDetails,
    ) -> Result<(), PublishError> {
        Ok(())
    }
}

/// Severity of a recorded event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Routine lifecycle event.
    Normal,
    /// Something went wrong for the object.
    Warning,
}

/// One event attached to an object.
#[derive(Debug, Clone)]
pub struct Event {
    /// Severity.
    pub type_: EventType,
    /// Machine-readable reason, e.g. `CreatedExternalResource`.
    pub reason: String,
    /// Human-readable message.
    pub message: String,
}

impl Event {
    /// A normal event.
    pub fn normal(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_: EventType::Normal,
            reason: reason.into(),
            message: message.into(),
        }
    }

    /// A warning event.
    pub fn warning(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_: EventType::Warning,
            reason: reason.into(),
            message: message.into(),
        }
    }
}

/// Records events against objects.
pub trait EventRecorder: Send + Sync {
    /// Records one event for the object.
    fn record(&self, resource: &Resource, event: Event);
}

/// A recorder that discards everything.
pub struct NopRecorder;

impl EventRecorder for NopRecorder {
    fn record(&self, _resource: &Resource, _event: Event) {}
}

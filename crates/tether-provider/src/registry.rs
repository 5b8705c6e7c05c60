//! Kind → handler registry.
//!
//! Registration happens during provider setup and is write-once per kind;
//! lookup runs on every session connect. The map sits behind a
//! multiple-reader/single-writer lock; discovery sorts by the kind
//! triple's ordering so its output is stable across calls.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tether_core::Kind;

use crate::external::ExternalConnector;

/// Errors raised during handler registration. All are fatal for provider
/// setup and never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegisterError {
    /// The kind triple was entirely empty.
    #[error("cannot register handler for empty kind triple")]
    EmptyKind,

    /// A handler for the kind already exists.
    #[error("handler for {kind} is already registered")]
    Duplicate {
        /// The kind that was registered twice.
        kind: Kind,
    },
}

/// Registry mapping kinds to their external connector factories.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<Kind, Arc<dyn ExternalConnector>>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connector for a kind.
    ///
    /// # Errors
    ///
    /// Returns [`RegisterError::EmptyKind`] for an empty triple and
    /// [`RegisterError::Duplicate`] when the kind is already taken.
    pub fn register(
        &self,
        kind: Kind,
        connector: Arc<dyn ExternalConnector>,
    ) -> Result<(), RegisterError> {
        if kind.is_empty() {
            return Err(RegisterError::EmptyKind);
        }

        let mut handlers = self.handlers.write().expect("handler registry poisoned");
        if handlers.contains_key(&kind) {
            return Err(RegisterError::Duplicate { kind });
        }
        tracing::debug!(kind = %kind, "registered handler");
        handlers.insert(kind, connector);
        Ok(())
    }

    /// Looks up the connector for a kind.
    #[must_use]
    pub fn lookup(&self, kind: &Kind) -> Option<Arc<dyn ExternalConnector>> {
        self.handlers
            .read()
            .expect("handler registry poisoned")
            .get(kind)
            .cloned()
    }

    /// All registered kinds, in stable (triple) order.
    #[must_use]
    pub fn kinds(&self) -> Vec<Kind> {
        let mut kinds: Vec<Kind> = self
            .handlers
            .read()
            .expect("handler registry poisoned")
            .keys()
            .cloned()
            .collect();
        kinds.sort();
        kinds
    }

    /// Number of registered kinds.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers
            .read()
            .expect("handler registry poisoned")
            .len()
    }

    /// Whether no handlers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

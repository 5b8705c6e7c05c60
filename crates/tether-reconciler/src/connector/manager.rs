//! Multi-endpoint connector bookkeeping.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tether_core::Kind;
use tracing::debug;

use super::Connector;

/// Composes one [`Connector`] per provider endpoint.
///
/// At most one connector (and therefore one transport) exists per
/// endpoint; asking again for a known endpoint merges the requested kinds
/// into the existing connector's allowed set. A kind index records which
/// connector serves each kind.
#[derive(Default)]
pub struct ConnectorManager {
    connectors: RwLock<HashMap<String, Arc<Connector>>>,
    by_kind: RwLock<HashMap<Kind, Arc<Connector>>>,
}

impl ConnectorManager {
    /// Creates an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the connector for an endpoint, creating it on first use.
    pub fn get_or_create(
        &self,
        endpoint: &str,
        kinds: impl IntoIterator<Item = Kind>,
    ) -> Arc<Connector> {
        let kinds: Vec<Kind> = kinds.into_iter().collect();

        let connector = {
            let mut connectors = self.connectors.write().expect("connector map poisoned");
            if let Some(existing) = connectors.get(endpoint) {
                for kind in &kinds {
                    existing.allow_kind(kind.clone());
                }
                existing.clone()
            } else {
                debug!(endpoint, "creating connector");
                let connector = Arc::new(Connector::with_kinds(endpoint, kinds.clone()));
                connectors.insert(endpoint.to_string(), connector.clone());
                connector
            }
        };

        let mut by_kind = self.by_kind.write().expect("kind index poisoned");
        for kind in kinds {
            by_kind.insert(kind, connector.clone());
        }
        connector
    }

    /// The connector serving a kind, if any provider declared it.
    #[must_use]
    pub fn connector_for_kind(&self, kind: &Kind) -> Option<Arc<Connector>> {
        self.by_kind
            .read()
            .expect("kind index poisoned")
            .get(kind)
            .cloned()
    }

    /// The connector for an endpoint, if one exists.
    #[must_use]
    pub fn get(&self, endpoint: &str) -> Option<Arc<Connector>> {
        self.connectors
            .read()
            .expect("connector map poisoned")
            .get(endpoint)
            .cloned()
    }

    /// Number of managed endpoints.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connectors.read().expect("connector map poisoned").len()
    }

    /// Whether no connectors exist.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes every connector and clears both maps.
    pub fn close_all(&self) {
        self.by_kind.write().expect("kind index poisoned").clear();
        let drained: Vec<_> = self
            .connectors
            .write()
            .expect("connector map poisoned")
            .drain()
            .collect();
        for (endpoint, connector) in drained {
            debug!(endpoint = %endpoint, "closing connector");
            connector.close();
        }
    }
}

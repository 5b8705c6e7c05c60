//! Client connector layer.
//!
//! A [`Connector`] owns the (lazily created) shared transport to one
//! provider endpoint and opens one-shot [`Session`]s over it. The
//! [`ConnectorManager`] composes one connector per endpoint and closes
//! them all at shutdown.
//!
//! Transport creation is double-checked under a lock; the steady-state
//! read path takes only a read lock. If the connection drops, the next
//! connect replaces the dead transport, unless the connector was closed
//! deliberately, after which every connect fails.

mod manager;
mod session;
mod transport;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use std::time::Duration;

pub use manager::ConnectorManager;
pub use session::{Session, SessionError};
use tether_core::proto::{request, response, DiscoverRequest, Method, Request};
use tether_core::{Kind, Resource};
use tracing::{debug, warn};
pub use transport::{Transport, TransportError};

use self::transport::StreamEvent;

/// Default bound on a discovery call.
pub const DEFAULT_DISCOVER_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors raised by connector operations.
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    /// The connector was configured with an allowed-kind set that does not
    /// contain the object's kind. Misconfiguration; fatal for the caller's
    /// controller.
    #[error("connector for {endpoint} does not support resource kind {kind}")]
    UnsupportedKind {
        /// The connector's endpoint.
        endpoint: String,
        /// The unsupported kind.
        kind: Kind,
    },

    /// The object does not carry a usable kind.
    #[error("resource has no usable kind")]
    NoKind(#[from] tether_core::KindError),

    /// The initial `Connect` exchange failed.
    #[error("failed to open session")]
    SessionOpen(#[source] SessionError),

    /// The transport could not be created or has been closed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A discovery call timed out.
    #[error("discovery against {endpoint} timed out after {timeout:?}")]
    DiscoverTimeout {
        /// The endpoint queried.
        endpoint: String,
        /// The configured bound.
        timeout: Duration,
    },
}

/// Client-side factory of sessions over a shared transport to one endpoint.
pub struct Connector {
    endpoint: String,
    info: String,
    allowed: RwLock<HashSet<Kind>>,
    transport: RwLock<Option<Transport>>,
    // Serializes dialing so one endpoint never has two live transports.
    dial_lock: tokio::sync::Mutex<()>,
    closed: AtomicBool,
    discover_timeout: Duration,
}

impl Connector {
    /// Creates a connector for an endpoint with no kind restrictions.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            info: format!("tether-reconciler/{}", env!("CARGO_PKG_VERSION")),
            allowed: RwLock::new(HashSet::new()),
            transport: RwLock::new(None),
            dial_lock: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
            discover_timeout: DEFAULT_DISCOVER_TIMEOUT,
        }
    }

    /// Creates a connector restricted to the given kinds.
    ///
    /// An empty set means all kinds are allowed.
    pub fn with_kinds(endpoint: impl Into<String>, kinds: impl IntoIterator<Item = Kind>) -> Self {
        let connector = Self::new(endpoint);
        connector
            .allowed
            .write()
            .expect("allowed-kind set poisoned")
            .extend(kinds);
        connector
    }

    /// The endpoint this connector dials.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Adds a kind to the allowed set.
    pub fn allow_kind(&self, kind: Kind) {
        self.allowed
            .write()
            .expect("allowed-kind set poisoned")
            .insert(kind);
    }

    /// The currently allowed kinds (empty means unrestricted).
    #[must_use]
    pub fn allowed_kinds(&self) -> Vec<Kind> {
        let mut kinds: Vec<_> = self
            .allowed
            .read()
            .expect("allowed-kind set poisoned")
            .iter()
            .cloned()
            .collect();
        kinds.sort();
        kinds
    }

    /// Opens a session bound to the object's kind.
    ///
    /// The shared transport is created on first use and reused by every
    /// subsequent session to this endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError::UnsupportedKind`] for kinds outside the
    /// allowed set, [`ConnectorError::Transport`] when the endpoint is
    /// unreachable, and [`ConnectorError::SessionOpen`] when the initial
    /// `Connect` exchange fails.
    pub async fn connect(&self, resource: &mut Resource) -> Result<Session, ConnectorError> {
        let kind = resource.kind()?;

        {
            let allowed = self.allowed.read().expect("allowed-kind set poisoned");
            if !allowed.is_empty() && !allowed.contains(&kind) {
                return Err(ConnectorError::UnsupportedKind {
                    endpoint: self.endpoint.clone(),
                    kind,
                });
            }
        }

        let transport = self.transport().await?;
        Session::open(&transport, kind, resource)
            .await
            .map_err(ConnectorError::SessionOpen)
    }

    /// Queries the provider for the kinds it reconciles.
    ///
    /// Independent of sessions; bounded by the discovery timeout.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError::DiscoverTimeout`] when the provider does
    /// not answer in time, and transport/protocol errors otherwise.
    pub async fn discover(&self) -> Result<Vec<Kind>, ConnectorError> {
        let result = tokio::time::timeout(self.discover_timeout, self.discover_inner()).await;
        match result {
            Ok(kinds) => kinds,
            Err(_) => Err(ConnectorError::DiscoverTimeout {
                endpoint: self.endpoint.clone(),
                timeout: self.discover_timeout,
            }),
        }
    }

    async fn discover_inner(&self) -> Result<Vec<Kind>, ConnectorError> {
        let transport = self.transport().await?;
        let mut stream = transport.open_stream(Method::Discover).await?;

        stream
            .send(Request {
                op: Some(request::Op::Discover(DiscoverRequest {})),
            })
            .await
            .map_err(|e| ConnectorError::SessionOpen(e.into()))?;

        let event = stream
            .recv()
            .await
            .map_err(|e| ConnectorError::SessionOpen(e.into()))?;
        stream.close().await;

        let response = match event {
            StreamEvent::Response(response) => response,
            StreamEvent::Status(status) => {
                return Err(ConnectorError::SessionOpen(SessionError::Rejected {
                    code: status.code(),
                    message: status.message,
                }));
            }
        };

        match response.op {
            Some(response::Op::Reconcilers(list)) => {
                let mut kinds = Vec::with_capacity(list.reconcilers.len());
                for reconciler in list.reconcilers {
                    let Some(for_ref) = reconciler.r#for else {
                        continue;
                    };
                    match Kind::from_api_version(&for_ref.api_version, &for_ref.kind) {
                        Ok(kind) => kinds.push(kind),
                        Err(e) => {
                            warn!(name = %reconciler.name, error = %e, "skipping undecodable discovered kind");
                        }
                    }
                }
                Ok(kinds)
            }
            _ => Err(ConnectorError::SessionOpen(SessionError::WrongResponse {
                expected: "Reconcilers",
                got: response.op_name().to_string(),
            })),
        }
    }

    /// Closes the shared transport. Subsequent connects fail.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let transport = self
            .transport
            .write()
            .expect("transport slot poisoned")
            .take();
        if let Some(transport) = transport {
            transport.close();
        }
        debug!(endpoint = %self.endpoint, "connector closed");
    }

    /// Returns the live transport, dialing if necessary.
    async fn transport(&self) -> Result<Transport, ConnectorError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed {
                endpoint: self.endpoint.clone(),
            }
            .into());
        }

        // Fast path: a healthy transport is read under the read lock only.
        if let Some(transport) = self.published_transport() {
            return Ok(transport);
        }

        // Slow path: one dialer at a time per endpoint. Losers of the race
        // find the winner's transport on the re-check and never dial.
        let _dialing = self.dial_lock.lock().await;
        if let Some(transport) = self.published_transport() {
            return Ok(transport);
        }

        let fresh = Transport::connect(&self.endpoint, &self.info).await?;
        if self.closed.load(Ordering::SeqCst) {
            fresh.close();
            return Err(TransportError::Closed {
                endpoint: self.endpoint.clone(),
            }
            .into());
        }
        *self.transport.write().expect("transport slot poisoned") = Some(fresh.clone());
        Ok(fresh)
    }

    fn published_transport(&self) -> Option<Transport> {
        let slot = self.transport.read().expect("transport slot poisoned");
        slot.as_ref().filter(|t| !t.is_closed()).cloned()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn widget_resource() -> Resource {
        Resource::from_value(json!({
            "apiVersion": "example.org/v1",
            "kind": "Widget",
            "metadata": { "name": "w1" },
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn rejects_kinds_outside_the_allowed_set() {
        let connector = Connector::with_kinds(
            "127.0.0.1:1",
            [Kind::new("example.org", "v1", "Gadget")],
        );
        let mut resource = widget_resource();
        let err = connector.connect(&mut resource).await.unwrap_err();
        assert!(matches!(err, ConnectorError::UnsupportedKind { .. }));
    }

    #[tokio::test]
    async fn unreachable_endpoint_surfaces_transport_connect() {
        // Port 1 on loopback refuses connections.
        let connector = Connector::new("127.0.0.1:1");
        let mut resource = widget_resource();
        let err = connector.connect(&mut resource).await.unwrap_err();
        assert!(matches!(
            err,
            ConnectorError::Transport(TransportError::Connect { .. })
        ));
    }

    #[tokio::test]
    async fn closed_connector_refuses_connects() {
        let connector = Connector::new("127.0.0.1:1");
        connector.close();
        let mut resource = widget_resource();
        let err = connector.connect(&mut resource).await.unwrap_err();
        assert!(matches!(
            err,
            ConnectorError::Transport(TransportError::Closed { .. })
        ));
    }

    #[tokio::test]
    async fn allow_kind_extends_the_set() {
        let connector =
            Connector::with_kinds("127.0.0.1:1", [Kind::new("example.org", "v1", "Gadget")]);
        connector.allow_kind(Kind::new("example.org", "v1", "Widget"));
        assert_eq!(connector.allowed_kinds().len(), 2);
    }
}

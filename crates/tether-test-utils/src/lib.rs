//! Scripted providers and harnesses for exercising the runtime end to end.
//!
//! [`FakeExternal`] simulates a provider's external system: an in-memory
//! map of external resources keyed by object name, with counters for every
//! lifecycle call. Tests register it as the handler for a kind, start a
//! real provider server on a loopback listener, and drive the real
//! connector/engine against it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tether_core::{Creation, Deletion, Kind, Observation, Resource, Update};
use tether_provider::{
    ExternalClient, ExternalConnector, ExternalError, HandlerRegistry, ProviderServer,
};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

/// The kind used throughout the test suites.
#[must_use]
pub fn widget_kind() -> Kind {
    Kind::new("example.org", "v1", "Widget")
}

/// Builds a widget object with the given name and size.
#[must_use]
pub fn widget(name: &str, size: i64) -> Resource {
    Resource::from_value(serde_json::json!({
        "apiVersion": "example.org/v1",
        "kind": "Widget",
        "metadata": { "name": name },
        "spec": { "size": size },
    }))
    .expect("widget literal is a mapping")
}

/// Call counters shared by a [`FakeExternal`] and its clients.
#[derive(Debug, Default)]
pub struct FakeCounters {
    /// Connect calls (one per session).
    pub connects: AtomicUsize,
    /// Observe calls.
    pub observes: AtomicUsize,
    /// Create calls.
    pub creates: AtomicUsize,
    /// Update calls.
    pub updates: AtomicUsize,
    /// Delete calls.
    pub deletes: AtomicUsize,
    /// Close calls (one per session end).
    pub closes: AtomicUsize,
}

impl FakeCounters {
    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::SeqCst);
    }

    /// Reads a counter.
    #[must_use]
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

/// A scripted external system: external resources are entries in a map,
/// keyed by object name, holding the spec that was last written.
#[derive(Default)]
pub struct FakeExternal {
    resources: Mutex<HashMap<String, Value>>,
    /// Lifecycle counters.
    pub counters: FakeCounters,
    /// When set, every observe fails; for driving error paths.
    pub fail_observes: AtomicBool,
}

impl FakeExternal {
    /// Creates an empty external system.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Whether an external resource exists for the name.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.resources
            .lock()
            .expect("fake external poisoned")
            .contains_key(name)
    }

    /// The stored spec for a name, if present.
    #[must_use]
    pub fn spec_of(&self, name: &str) -> Option<Value> {
        self.resources
            .lock()
            .expect("fake external poisoned")
            .get(name)
            .cloned()
    }

    fn spec(resource: &Resource) -> Value {
        resource
            .value()
            .get("spec")
            .cloned()
            .unwrap_or(Value::Null)
    }
}

/// Session-scoped client over a [`FakeExternal`].
pub struct FakeClient {
    external: Arc<FakeExternal>,
    name: String,
}

#[async_trait]
impl ExternalClient for FakeClient {
    async fn observe(&self, resource: &mut Resource) -> Result<Observation, ExternalError> {
        FakeCounters::bump(&self.external.counters.observes);
        if self.external.fail_observes.load(Ordering::SeqCst) {
            return Err(ExternalError::new("scripted observe failure"));
        }
        let stored = self.external.spec_of(&self.name);
        let desired = FakeExternal::spec(resource);
        match stored {
            Some(stored) => Ok(Observation {
                exists: true,
                up_to_date: stored == desired,
                late_initialized: false,
                connection_details: connection_details(),
            }),
            None => Ok(Observation::default()),
        }
    }

    async fn create(&self, resource: &mut Resource) -> Result<Creation, ExternalError> {
        FakeCounters::bump(&self.external.counters.creates);
        self.external
            .resources
            .lock()
            .expect("fake external poisoned")
            .insert(self.name.clone(), FakeExternal::spec(resource));
        let mut additional = tether_core::AdditionalDetails::new();
        additional.insert("more".to_string(), "call me back".to_string());
        Ok(Creation {
            connection_details: connection_details(),
            additional_details: additional,
        })
    }

    async fn update(&self, resource: &mut Resource) -> Result<Update, ExternalError> {
        FakeCounters::bump(&self.external.counters.updates);
        self.external
            .resources
            .lock()
            .expect("fake external poisoned")
            .insert(self.name.clone(), FakeExternal::spec(resource));
        Ok(Update {
            connection_details: connection_details(),
            additional_details: tether_core::AdditionalDetails::new(),
        })
    }

    async fn delete(&self, _resource: &mut Resource) -> Result<Deletion, ExternalError> {
        FakeCounters::bump(&self.external.counters.deletes);
        self.external
            .resources
            .lock()
            .expect("fake external poisoned")
            .remove(&self.name);
        let mut additional = tether_core::AdditionalDetails::new();
        additional.insert("more".to_string(), "hang up".to_string());
        Ok(Deletion {
            additional_details: additional,
        })
    }

    async fn close(&self) -> Result<(), ExternalError> {
        FakeCounters::bump(&self.external.counters.closes);
        Ok(())
    }
}

fn connection_details() -> tether_core::ConnectionDetails {
    let mut details = tether_core::ConnectionDetails::new();
    details.insert("Client".to_string(), b"fake-endpoint".to_vec());
    details
}

/// A running scripted provider.
pub struct ProviderHarness {
    /// The loopback address the provider listens on.
    pub addr: SocketAddr,
    /// Cancel to stop the server.
    pub cancel: CancellationToken,
    /// Join handle of the serve task.
    pub handle: tokio::task::JoinHandle<()>,
}

impl ProviderHarness {
    /// Starts a provider serving the given external system for the widget
    /// kind.
    ///
    /// # Panics
    ///
    /// Panics when binding the loopback listener fails.
    pub async fn start(external: Arc<FakeExternal>) -> Self {
        let registry = Arc::new(HandlerRegistry::new());
        registry
            .register(widget_kind(), Arc::new(FakeConnector { external }))
            .expect("widget kind registers once");
        Self::start_with_registry(registry).await
    }

    /// Starts a provider over an arbitrary registry.
    ///
    /// # Panics
    ///
    /// Panics when binding the loopback listener fails.
    pub async fn start_with_registry(registry: Arc<HandlerRegistry>) -> Self {
        let listener = ProviderServer::bind("127.0.0.1:0")
            .await
            .expect("loopback listener binds");
        let addr = listener.local_addr().expect("listener has an address");
        let cancel = CancellationToken::new();
        let server = Arc::new(ProviderServer::new(registry));
        let serve_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            let _ = server.serve(listener, serve_cancel).await;
        });
        Self {
            addr,
            cancel,
            handle,
        }
    }

    /// Stops the provider and waits for the serve task.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}

/// Connector wrapper binding [`FakeExternal`] to sessions.
pub struct FakeConnector {
    /// The scripted external system.
    pub external: Arc<FakeExternal>,
}

#[async_trait]
impl ExternalConnector for FakeConnector {
    async fn connect(
        &self,
        resource: &mut Resource,
    ) -> Result<Box<dyn ExternalClient>, ExternalError> {
        FakeCounters::bump(&self.external.counters.connects);
        Ok(Box::new(FakeClient {
            external: self.external.clone(),
            name: resource.name().to_string(),
        }))
    }
}

/// Opens a raw framed connection with a completed handshake, for tests
/// that drive the wire protocol by hand.
///
/// # Panics
///
/// Panics when the connection or handshake fails.
pub async fn raw_client(
    addr: SocketAddr,
) -> Framed<tokio::net::TcpStream, tether_core::proto::FrameCodec> {
    let stream = tokio::net::TcpStream::connect(addr)
        .await
        .expect("loopback connect succeeds");
    let mut framed = Framed::new(stream, tether_core::proto::FrameCodec::new());
    tether_core::proto::client_handshake(&mut framed, "raw-test-client")
        .await
        .expect("handshake succeeds");
    framed
}

/// Polls a condition until it holds or the timeout elapses.
///
/// # Panics
///
/// Panics with the given message when the timeout elapses first.
pub async fn wait_for(timeout: std::time::Duration, message: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for: {message}"
        );
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
}

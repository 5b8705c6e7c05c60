//! Server-side session state machine.
//!
//! One [`SessionHandler`] lives on each session stream's task, entirely on
//! that task's stack; no per-session state is shared across streams. The
//! handler enforces the protocol contract:
//!
//! - the first request must be `Connect` (anything else aborts with
//!   `FailedPrecondition`),
//! - every subsequent request's kind must equal the kind pinned at connect,
//! - responses are produced strictly in request order,
//! - the bound external client is closed exactly once, on disconnect,
//!   abort, or stream end.

use std::sync::Arc;

use tether_core::codec;
use tether_core::proto::{
    request, response, ConnectResponse, CreateResponse, DeleteResponse, DisconnectResponse,
    ObserveResponse, Reconciler, ReconcilerRef, Reconcilers, Request, Response, Status, StatusCode,
    UpdateResponse,
};
use tether_core::{Kind, Resource, SessionPhase};
use tracing::{debug, warn};

use crate::external::ExternalClient;
use crate::registry::HandlerRegistry;

/// Outcome of handling one request on a session stream.
pub(crate) enum SessionStep {
    /// Send the response and keep the session open.
    Reply(Response),
    /// Send the response, then end the stream (disconnect acknowledged).
    ReplyAndFinish(Response),
    /// Send the terminal status and end the stream.
    Abort(Status),
}

/// Terminal failure with a wire status. Used by the session and legacy
/// paths so every error renders the same way to the peer.
#[derive(Debug)]
pub(crate) struct Abort {
    pub code: StatusCode,
    pub message: String,
}

impl Abort {
    pub(crate) fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub(crate) fn status(&self) -> Status {
        Status::new(self.code, self.message.clone())
    }
}

/// Decodes a request payload into a fresh resource, reporting its kind.
pub(crate) fn decode_resource(request: &Request) -> Result<(Resource, Kind), Abort> {
    let payload = request.resource().ok_or_else(|| {
        Abort::new(
            StatusCode::InvalidArgument,
            format!("{} request carried no resource", request.op_name()),
        )
    })?;
    let kind = codec::extract_kind(payload)
        .map_err(|e| Abort::new(StatusCode::InvalidArgument, e.to_string()))?;

    let mut resource = Resource::new(&kind, "");
    codec::decode(payload, &mut resource)
        .map_err(|e| Abort::new(StatusCode::InvalidArgument, e.to_string()))?;
    Ok((resource, kind))
}

pub(crate) fn encode_back(resource: &Resource) -> Result<prost_types::Struct, Abort> {
    codec::encode(resource).map_err(|e| Abort::new(StatusCode::Internal, e.to_string()))
}

/// Builds the discovery response for the registry's current contents.
pub(crate) fn discover_response(registry: &HandlerRegistry) -> Response {
    let reconcilers = registry
        .kinds()
        .into_iter()
        .map(|kind| Reconciler {
            name: kind.to_string(),
            r#for: Some(ReconcilerRef {
                api_version: kind.api_version(),
                kind: kind.kind.clone(),
            }),
        })
        .collect();
    Response {
        op: Some(response::Op::Reconcilers(Reconcilers { reconcilers })),
    }
}

/// State machine driver for one session stream.
pub(crate) struct SessionHandler {
    registry: Arc<HandlerRegistry>,
    phase: SessionPhase,
    pinned: Option<Kind>,
    client: Option<Box<dyn ExternalClient>>,
}

impl SessionHandler {
    pub(crate) fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self {
            registry,
            phase: SessionPhase::Opening,
            pinned: None,
            client: None,
        }
    }

    /// Handles one request, advancing the state machine.
    pub(crate) async fn handle(&mut self, request: Request) -> SessionStep {
        match self.step(request).await {
            Ok(step) => step,
            Err(abort) => {
                // Any abort is terminal: the external client must not
                // outlive the session.
                self.shutdown().await;
                SessionStep::Abort(abort.status())
            }
        }
    }

    async fn step(&mut self, request: Request) -> Result<SessionStep, Abort> {
        match &request.op {
            None => Err(Abort::new(
                StatusCode::InvalidArgument,
                "no matching operation found in request",
            )),
            Some(request::Op::Connect(_)) => self.handle_connect(&request).await,
            Some(
                request::Op::Observe(_)
                | request::Op::Create(_)
                | request::Op::Update(_)
                | request::Op::Delete(_),
            ) => self.handle_operation(&request).await,
            Some(request::Op::Disconnect(_)) => self.handle_disconnect().await,
            Some(request::Op::Discover(_)) => Err(Abort::new(
                StatusCode::InvalidArgument,
                "Discover is not valid on a session stream",
            )),
        }
    }

    async fn handle_connect(&mut self, request: &Request) -> Result<SessionStep, Abort> {
        if self.phase != SessionPhase::Opening {
            return Err(Abort::new(
                StatusCode::FailedPrecondition,
                "session is already connected",
            ));
        }

        let (mut resource, kind) = decode_resource(request)?;

        let connector = self.registry.lookup(&kind).ok_or_else(|| {
            Abort::new(
                StatusCode::NotFound,
                format!("no matching resource type handler found for {kind}"),
            )
        })?;

        let client = connector
            .connect(&mut resource)
            .await
            .map_err(|e| Abort::new(StatusCode::Internal, e.to_string()))?;

        let payload = encode_back(&resource)?;

        self.phase = self
            .phase
            .activate()
            .map_err(|e| Abort::new(StatusCode::Internal, e.to_string()))?;
        self.pinned = Some(kind.clone());
        self.client = Some(client);
        debug!(kind = %kind, "session connected");

        Ok(SessionStep::Reply(Response {
            op: Some(response::Op::Connect(ConnectResponse {
                resource: Some(payload),
                connection_details: Default::default(),
            })),
        }))
    }

    async fn handle_operation(&mut self, request: &Request) -> Result<SessionStep, Abort> {
        if !self.phase.allows_operations() {
            return Err(Abort::new(
                StatusCode::FailedPrecondition,
                format!(
                    "first request on a session must be Connect, got {}",
                    request.op_name()
                ),
            ));
        }

        let (mut resource, kind) = decode_resource(request)?;

        let pinned = self
            .pinned
            .as_ref()
            .expect("active session always has a pinned kind");
        if &kind != pinned {
            return Err(Abort::new(
                StatusCode::FailedPrecondition,
                format!("resource kind mismatch: session is pinned to {pinned}, got {kind}"),
            ));
        }

        let client = self
            .client
            .as_ref()
            .expect("active session always has a bound client");

        let op = match &request.op {
            Some(request::Op::Observe(_)) => {
                let obs = client
                    .observe(&mut resource)
                    .await
                    .map_err(|e| Abort::new(StatusCode::Internal, e.to_string()))?;
                response::Op::Observe(ObserveResponse {
                    resource: Some(encode_back(&resource)?),
                    connection_details: obs.connection_details,
                    resource_exists: obs.exists,
                    resource_up_to_date: obs.up_to_date,
                    resource_late_initialized: obs.late_initialized,
                })
            }
            Some(request::Op::Create(_)) => {
                let creation = client
                    .create(&mut resource)
                    .await
                    .map_err(|e| Abort::new(StatusCode::Internal, e.to_string()))?;
                response::Op::Create(CreateResponse {
                    resource: Some(encode_back(&resource)?),
                    connection_details: creation.connection_details,
                    additional_details: creation.additional_details,
                })
            }
            Some(request::Op::Update(_)) => {
                let update = client
                    .update(&mut resource)
                    .await
                    .map_err(|e| Abort::new(StatusCode::Internal, e.to_string()))?;
                response::Op::Update(UpdateResponse {
                    resource: Some(encode_back(&resource)?),
                    connection_details: update.connection_details,
                    additional_details: update.additional_details,
                })
            }
            Some(request::Op::Delete(_)) => {
                let deletion = client
                    .delete(&mut resource)
                    .await
                    .map_err(|e| Abort::new(StatusCode::Internal, e.to_string()))?;
                // The session stays open: closure is always explicit
                // (Disconnect) or driven by stream termination.
                response::Op::Delete(DeleteResponse {
                    resource: Some(encode_back(&resource)?),
                    additional_details: deletion.additional_details,
                })
            }
            _ => unreachable!("handle_operation is only called for CRUD ops"),
        };

        Ok(SessionStep::Reply(Response { op: Some(op) }))
    }

    async fn handle_disconnect(&mut self) -> Result<SessionStep, Abort> {
        if self.phase == SessionPhase::Opening {
            return Err(Abort::new(
                StatusCode::FailedPrecondition,
                "first request on a session must be Connect, got Disconnect",
            ));
        }

        self.phase = self.phase.begin_close().unwrap_or(SessionPhase::Closed);
        if let Some(client) = self.client.take() {
            if let Err(e) = client.close().await {
                warn!(error = %e, "error closing external client on disconnect");
            }
        }
        self.phase = self.phase.close();

        Ok(SessionStep::ReplyAndFinish(Response {
            op: Some(response::Op::Disconnect(DisconnectResponse {})),
        }))
    }

    /// Releases the bound external client, if any. Idempotent; called on
    /// stream end and on abort.
    pub(crate) async fn shutdown(&mut self) {
        self.phase = self.phase.close();
        if let Some(client) = self.client.take() {
            if let Err(e) = client.close().await {
                warn!(error = %e, "error closing external client at stream end");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;
    use tether_core::proto::{
        ConnectRequest, DisconnectRequest, DiscoverRequest, ObserveRequest,
    };
    use tether_core::Observation;

    use super::*;
    use crate::external::{ExternalConnector, ExternalError};

    #[derive(Default)]
    struct Counters {
        connects: AtomicUsize,
        closes: AtomicUsize,
    }

    struct CountingConnector(Arc<Counters>);

    #[async_trait]
    impl ExternalConnector for CountingConnector {
        async fn connect(
            &self,
            _resource: &mut Resource,
        ) -> Result<Box<dyn ExternalClient>, ExternalError> {
            self.0.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(CountingClient(self.0.clone())))
        }
    }

    struct CountingClient(Arc<Counters>);

    #[async_trait]
    impl ExternalClient for CountingClient {
        async fn observe(&self, _r: &mut Resource) -> Result<Observation, ExternalError> {
            Ok(Observation {
                exists: true,
                up_to_date: true,
                ..Default::default()
            })
        }
        async fn create(&self, _r: &mut Resource) -> Result<tether_core::Creation, ExternalError> {
            Ok(Default::default())
        }
        async fn update(&self, _r: &mut Resource) -> Result<tether_core::Update, ExternalError> {
            Ok(Default::default())
        }
        async fn delete(&self, _r: &mut Resource) -> Result<tether_core::Deletion, ExternalError> {
            Ok(Default::default())
        }
        async fn close(&self) -> Result<(), ExternalError> {
            self.0.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn registry_with_widget(counters: &Arc<Counters>) -> Arc<HandlerRegistry> {
        let registry = Arc::new(HandlerRegistry::new());
        registry
            .register(
                Kind::new("example.org", "v1", "Widget"),
                Arc::new(CountingConnector(counters.clone())),
            )
            .unwrap();
        registry
    }

    fn payload(kind: &str, name: &str) -> prost_types::Struct {
        let resource = Resource::from_value(json!({
            "apiVersion": "example.org/v1",
            "kind": kind,
            "metadata": { "name": name },
        }))
        .unwrap();
        codec::encode(&resource).unwrap()
    }

    fn connect_request(kind: &str) -> Request {
        Request {
            op: Some(request::Op::Connect(ConnectRequest {
                resource: Some(payload(kind, "w1")),
            })),
        }
    }

    fn observe_request(kind: &str) -> Request {
        Request {
            op: Some(request::Op::Observe(ObserveRequest {
                resource: Some(payload(kind, "w1")),
            })),
        }
    }

    #[tokio::test]
    async fn connect_then_observe_round_trip() {
        let counters = Arc::new(Counters::default());
        let mut handler = SessionHandler::new(registry_with_widget(&counters));

        let step = handler.handle(connect_request("Widget")).await;
        assert!(matches!(step, SessionStep::Reply(_)));
        assert_eq!(counters.connects.load(Ordering::SeqCst), 1);

        match handler.handle(observe_request("Widget")).await {
            SessionStep::Reply(resp) => match resp.op {
                Some(response::Op::Observe(obs)) => {
                    assert!(obs.resource_exists);
                    assert!(obs.resource_up_to_date);
                }
                other => panic!("unexpected response: {other:?}"),
            },
            _ => panic!("expected a reply"),
        }
    }

    #[tokio::test]
    async fn first_request_must_be_connect() {
        let counters = Arc::new(Counters::default());
        let mut handler = SessionHandler::new(registry_with_widget(&counters));

        match handler.handle(observe_request("Widget")).await {
            SessionStep::Abort(status) => {
                assert_eq!(status.code(), StatusCode::FailedPrecondition);
                assert!(status.message.contains("Connect"));
            }
            _ => panic!("expected abort"),
        }
        // No handler was invoked.
        assert_eq!(counters.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unregistered_kind_aborts_not_found() {
        let counters = Arc::new(Counters::default());
        let mut handler = SessionHandler::new(registry_with_widget(&counters));

        match handler.handle(connect_request("Gadget")).await {
            SessionStep::Abort(status) => assert_eq!(status.code(), StatusCode::NotFound),
            _ => panic!("expected abort"),
        }
    }

    #[tokio::test]
    async fn kind_mismatch_aborts_and_closes_client() {
        let counters = Arc::new(Counters::default());
        let mut handler = SessionHandler::new(registry_with_widget(&counters));

        handler.handle(connect_request("Widget")).await;
        match handler.handle(observe_request("Gadget")).await {
            SessionStep::Abort(status) => {
                assert_eq!(status.code(), StatusCode::FailedPrecondition);
                assert!(status.message.contains("kind mismatch"));
            }
            _ => panic!("expected abort"),
        }
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disconnect_closes_client_and_finishes() {
        let counters = Arc::new(Counters::default());
        let mut handler = SessionHandler::new(registry_with_widget(&counters));

        handler.handle(connect_request("Widget")).await;
        let step = handler
            .handle(Request {
                op: Some(request::Op::Disconnect(DisconnectRequest {})),
            })
            .await;
        assert!(matches!(step, SessionStep::ReplyAndFinish(_)));
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);

        // Stream-end shutdown after a disconnect is a no-op.
        handler.shutdown().await;
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn discover_is_rejected_on_session_streams() {
        let counters = Arc::new(Counters::default());
        let mut handler = SessionHandler::new(registry_with_widget(&counters));
        match handler
            .handle(Request {
                op: Some(request::Op::Discover(DiscoverRequest {})),
            })
            .await
        {
            SessionStep::Abort(status) => assert_eq!(status.code(), StatusCode::InvalidArgument),
            _ => panic!("expected abort"),
        }
    }

    #[tokio::test]
    async fn stream_end_closes_bound_client() {
        let counters = Arc::new(Counters::default());
        let mut handler = SessionHandler::new(registry_with_widget(&counters));
        handler.handle(connect_request("Widget")).await;
        handler.shutdown().await;
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn discover_response_lists_kinds() {
        let counters = Arc::new(Counters::default());
        let registry = registry_with_widget(&counters);
        let response = discover_response(&registry);
        match response.op {
            Some(response::Op::Reconcilers(list)) => {
                assert_eq!(list.reconcilers.len(), 1);
                let rec = &list.reconcilers[0];
                assert_eq!(rec.name, "example.org/v1, Kind=Widget");
                let for_ref = rec.r#for.as_ref().unwrap();
                assert_eq!(for_ref.api_version, "example.org/v1");
                assert_eq!(for_ref.kind, "Widget");
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }
}

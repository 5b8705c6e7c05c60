//! The provider server.
//!
//! Accepts TCP connections, performs the protocol handshake, and
//! demultiplexes frames by stream id. Each open stream runs on its own
//! task: session streams drive the [`SessionHandler`](crate::session)
//! state machine, unary streams answer a single discovery or legacy CRUD
//! request. Responses from all streams funnel through one writer task so
//! frames never interleave mid-message.
//!
//! Shutdown is cooperative: cancelling the server's token stops the accept
//! loop, then in-flight connections and their streams are awaited, then
//! cached legacy clients are closed.

use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use prost::Message;
use tether_core::proto::{
    self, encode_message, frame, Frame, FrameCodec, Method, Request, StatusCode,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::legacy::LegacyService;
use crate::registry::HandlerRegistry;
use crate::session::{discover_response, SessionHandler, SessionStep};

/// Provider server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Identification string sent in the handshake.
    pub info: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            info: format!("tether-provider/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Errors raised while binding or accepting.
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    /// The listen address could not be bound.
    #[error("failed to bind {address}")]
    Bind {
        /// The address that failed.
        address: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Accepting a connection failed.
    #[error("failed to accept connection")]
    Accept(#[source] std::io::Error),
}

/// The provider-side session router.
pub struct ProviderServer {
    registry: Arc<HandlerRegistry>,
    legacy: Arc<LegacyService>,
    config: ServerConfig,
}

impl ProviderServer {
    /// Creates a server routing sessions to the given registry.
    #[must_use]
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self::with_config(registry, ServerConfig::default())
    }

    /// Creates a server with explicit configuration.
    #[must_use]
    pub fn with_config(registry: Arc<HandlerRegistry>, config: ServerConfig) -> Self {
        Self {
            legacy: Arc::new(LegacyService::new(registry.clone())),
            registry,
            config,
        }
    }

    /// The handler registry backing this server.
    #[must_use]
    pub fn registry(&self) -> Arc<HandlerRegistry> {
        self.registry.clone()
    }

    /// Binds a TCP listener for [`serve`](Self::serve).
    ///
    /// # Errors
    ///
    /// Returns [`ServeError::Bind`] when the address is unusable.
    pub async fn bind(address: &str) -> Result<TcpListener, ServeError> {
        TcpListener::bind(address)
            .await
            .map_err(|source| ServeError::Bind {
                address: address.to_string(),
                source,
            })
    }

    /// Accepts and serves connections until the token is cancelled.
    ///
    /// In-flight sessions are allowed to finish their current exchange;
    /// cached legacy clients are closed before returning.
    ///
    /// # Errors
    ///
    /// Returns [`ServeError::Accept`] when the listener fails permanently.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> Result<(), ServeError> {
        let local = listener.local_addr().ok();
        info!(addr = ?local, "provider server listening");

        let tracker = TaskTracker::new();
        let result = loop {
            tokio::select! {
                () = cancel.cancelled() => break Ok(()),
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!(%peer, "accepted connection");
                            let server = self.clone();
                            let conn_cancel = cancel.child_token();
                            tracker.spawn(async move {
                                server.handle_connection(stream, conn_cancel).await;
                            });
                        }
                        Err(e) => break Err(ServeError::Accept(e)),
                    }
                }
            }
        };

        tracker.close();
        tracker.wait().await;
        self.legacy.shutdown().await;
        info!(addr = ?local, "provider server stopped");
        result
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, cancel: CancellationToken) {
        let mut framed = Framed::new(stream, FrameCodec::new());

        if let Err(e) = proto::server_handshake(&mut framed, &self.config.info).await {
            debug!(error = %e, "handshake failed, closing connection");
            return;
        }

        let (sink, frames) = framed.split();
        let (out_tx, out_rx) = mpsc::channel::<Frame>(64);

        let writer = tokio::spawn(write_frames(sink, out_rx));
        self.demux_frames(frames, out_tx, cancel).await;
        if let Err(e) = writer.await {
            warn!(error = %e, "writer task panicked");
        }
        debug!("connection closed");
    }

    /// Reads frames and routes them to per-stream tasks until the
    /// connection ends or the server shuts down.
    async fn demux_frames(
        &self,
        mut frames: SplitStream<Framed<TcpStream, FrameCodec>>,
        out_tx: mpsc::Sender<Frame>,
        cancel: CancellationToken,
    ) {
        let mut streams: HashMap<u64, mpsc::Sender<Request>> = HashMap::new();
        let mut last_stream = 0u64;
        let tracker = TaskTracker::new();

        loop {
            let frame = tokio::select! {
                () = cancel.cancelled() => break,
                next = frames.next() => match next {
                    Some(Ok(bytes)) => bytes,
                    Some(Err(e)) => {
                        debug!(error = %e, "frame read error");
                        break;
                    }
                    None => break,
                },
            };

            let frame = match Frame::decode(frame.as_ref()) {
                Ok(frame) => frame,
                Err(e) => {
                    debug!(error = %e, "undecodable frame, closing connection");
                    break;
                }
            };
            let stream_id = frame.stream;

            match frame.body {
                Some(frame::Body::Open(open)) => {
                    // Client ids are odd and strictly increasing; anything
                    // else is a reuse or a reserved id.
                    if stream_id == 0 || stream_id % 2 == 0 || stream_id <= last_stream {
                        let _ = out_tx
                            .send(Frame::status(
                                stream_id,
                                StatusCode::InvalidArgument,
                                format!("invalid stream id {stream_id}"),
                            ))
                            .await;
                        continue;
                    }
                    last_stream = stream_id;

                    let method = open.method();
                    if method == Method::Unspecified {
                        let _ = out_tx
                            .send(Frame::status(
                                stream_id,
                                StatusCode::InvalidArgument,
                                "stream opened without a method",
                            ))
                            .await;
                        continue;
                    }

                    let (req_tx, req_rx) = mpsc::channel::<Request>(16);
                    streams.insert(stream_id, req_tx);

                    let out = out_tx.clone();
                    match method {
                        Method::Session => {
                            let registry = self.registry.clone();
                            tracker.spawn(run_session_stream(stream_id, req_rx, out, registry));
                        }
                        Method::Discover => {
                            let registry = self.registry.clone();
                            tracker.spawn(run_discover_stream(stream_id, req_rx, out, registry));
                        }
                        Method::Observe | Method::Create | Method::Update | Method::Delete => {
                            let legacy = self.legacy.clone();
                            tracker.spawn(run_unary_stream(
                                stream_id, method, req_rx, out, legacy,
                            ));
                        }
                        Method::Unspecified => unreachable!("rejected above"),
                    }
                }
                Some(frame::Body::Request(request)) => {
                    let known = match streams.get(&stream_id) {
                        Some(tx) => tx.send(request).await.is_ok(),
                        None => false,
                    };
                    if !known {
                        streams.remove(&stream_id);
                        let _ = out_tx
                            .send(Frame::status(
                                stream_id,
                                StatusCode::InvalidArgument,
                                format!("frame for unknown stream {stream_id}"),
                            ))
                            .await;
                    }
                }
                Some(frame::Body::Close(_)) => {
                    // Dropping the sender ends the stream task's input.
                    streams.remove(&stream_id);
                }
                Some(frame::Body::Response(_) | frame::Body::Status(_)) => {
                    warn!(stream = stream_id, "client sent a server-only frame");
                    let _ = out_tx
                        .send(Frame::status(
                            stream_id,
                            StatusCode::InvalidArgument,
                            "clients may not send response or status frames",
                        ))
                        .await;
                }
                None => {
                    debug!(stream = stream_id, "frame with empty body ignored");
                }
            }
        }

        // Connection over: ending the streams' input lets every session
        // close its external client before the writer is released.
        drop(streams);
        tracker.close();
        tracker.wait().await;
    }
}

async fn write_frames(
    mut sink: SplitSink<Framed<TcpStream, FrameCodec>, bytes::Bytes>,
    mut out_rx: mpsc::Receiver<Frame>,
) {
    while let Some(frame) = out_rx.recv().await {
        if let Err(e) = sink.send(encode_message(&frame)).await {
            debug!(error = %e, "frame write error");
            break;
        }
    }
    let _ = sink.close().await;
}

async fn run_session_stream(
    stream_id: u64,
    mut requests: mpsc::Receiver<Request>,
    out: mpsc::Sender<Frame>,
    registry: Arc<HandlerRegistry>,
) {
    let mut handler = SessionHandler::new(registry);

    while let Some(request) = requests.recv().await {
        match handler.handle(request).await {
            SessionStep::Reply(response) => {
                if out.send(Frame::response(stream_id, response)).await.is_err() {
                    break;
                }
            }
            SessionStep::ReplyAndFinish(response) => {
                let _ = out.send(Frame::response(stream_id, response)).await;
                return;
            }
            SessionStep::Abort(status) => {
                let _ = out
                    .send(Frame {
                        stream: stream_id,
                        body: Some(frame::Body::Status(status)),
                    })
                    .await;
                return;
            }
        }
    }

    // Stream ended without a disconnect: release the external client.
    handler.shutdown().await;
}

async fn run_discover_stream(
    stream_id: u64,
    mut requests: mpsc::Receiver<Request>,
    out: mpsc::Sender<Frame>,
    registry: Arc<HandlerRegistry>,
) {
    let Some(request) = requests.recv().await else {
        return;
    };

    let frame = match request.op {
        Some(tether_core::proto::request::Op::Discover(_)) => {
            Frame::response(stream_id, discover_response(&registry))
        }
        _ => Frame::status(
            stream_id,
            StatusCode::InvalidArgument,
            format!(
                "stream opened for Discover carried a {} request",
                request.op_name()
            ),
        ),
    };
    let _ = out.send(frame).await;
}

async fn run_unary_stream(
    stream_id: u64,
    method: Method,
    mut requests: mpsc::Receiver<Request>,
    out: mpsc::Sender<Frame>,
    legacy: Arc<LegacyService>,
) {
    let Some(request) = requests.recv().await else {
        return;
    };

    let frame = match legacy.handle(method, &request).await {
        Ok(response) => Frame::response(stream_id, response),
        Err(abort) => Frame {
            stream: stream_id,
            body: Some(frame::Body::Status(abort.status())),
        },
    };
    let _ = out.send(frame).await;
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::json;
    use tether_core::codec;
    use tether_core::proto::{request, response, ConnectRequest, DiscoverRequest};
    use tether_core::{Kind, Observation, Resource};

    use super::*;
    use crate::external::{ExternalClient, ExternalConnector, ExternalError};

    struct EchoConnector;

    #[async_trait]
    impl ExternalConnector for EchoConnector {
        async fn connect(
            &self,
            _resource: &mut Resource,
        ) -> Result<Box<dyn ExternalClient>, ExternalError> {
            Ok(Box::new(EchoClient))
        }
    }

    struct EchoClient;

    #[async_trait]
    impl ExternalClient for EchoClient {
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
            Ok(())
        }
    }

    async fn start_server() -> (std::net::SocketAddr, CancellationToken, tokio::task::JoinHandle<()>) {
        let registry = Arc::new(HandlerRegistry::new());
        registry
            .register(Kind::new("example.org", "v1", "Widget"), Arc::new(EchoConnector))
            .unwrap();
        let server = Arc::new(ProviderServer::new(registry));
        let listener = ProviderServer::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let serve_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            server.serve(listener, serve_cancel).await.unwrap();
        });
        (addr, cancel, handle)
    }

    async fn connect_framed(
        addr: std::net::SocketAddr,
    ) -> Framed<TcpStream, FrameCodec> {
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut framed = Framed::new(stream, FrameCodec::new());
        proto::client_handshake(&mut framed, "test-client").await.unwrap();
        framed
    }

    fn widget_payload() -> prost_types::Struct {
        codec::encode(
            &Resource::from_value(json!({
                "apiVersion": "example.org/v1",
                "kind": "Widget",
                "metadata": { "name": "w1" },
            }))
            .unwrap(),
        )
        .unwrap()
    }

    async fn next_frame(framed: &mut Framed<TcpStream, FrameCodec>) -> Frame {
        let bytes = framed.next().await.unwrap().unwrap();
        Frame::decode(bytes.as_ref()).unwrap()
    }

    #[tokio::test]
    async fn session_connect_and_discover_over_tcp() {
        let (addr, cancel, handle) = start_server().await;
        let mut framed = connect_framed(addr).await;

        // Discover on stream 1.
        framed
            .send(encode_message(&Frame::open(1, Method::Discover)))
            .await
            .unwrap();
        framed
            .send(encode_message(&Frame::request(
                1,
                Request {
                    op: Some(request::Op::Discover(DiscoverRequest {})),
                },
            )))
            .await
            .unwrap();
        let frame = next_frame(&mut framed).await;
        match frame.body {
            Some(frame::Body::Response(resp)) => match resp.op {
                Some(response::Op::Reconcilers(list)) => {
                    assert_eq!(list.reconcilers.len(), 1);
                }
                other => panic!("unexpected response: {other:?}"),
            },
            other => panic!("unexpected frame: {other:?}"),
        }

        // Session on stream 3.
        framed
            .send(encode_message(&Frame::open(3, Method::Session)))
            .await
            .unwrap();
        framed
            .send(encode_message(&Frame::request(
                3,
                Request {
                    op: Some(request::Op::Connect(ConnectRequest {
                        resource: Some(widget_payload()),
                    })),
                },
            )))
            .await
            .unwrap();
        let frame = next_frame(&mut framed).await;
        assert_eq!(frame.stream, 3);
        match frame.body {
            Some(frame::Body::Response(resp)) => {
                assert!(matches!(resp.op, Some(response::Op::Connect(_))));
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        cancel.cancel();
        drop(framed);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn even_stream_ids_are_rejected() {
        let (addr, cancel, handle) = start_server().await;
        let mut framed = connect_framed(addr).await;

        framed
            .send(encode_message(&Frame::open(2, Method::Session)))
            .await
            .unwrap();
        let frame = next_frame(&mut framed).await;
        match frame.body {
            Some(frame::Body::Status(status)) => {
                assert_eq!(status.code(), StatusCode::InvalidArgument);
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        cancel.cancel();
        drop(framed);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn request_on_unknown_stream_gets_status() {
        let (addr, cancel, handle) = start_server().await;
        let mut framed = connect_framed(addr).await;

        framed
            .send(encode_message(&Frame::request(
                7,
                Request {
                    op: Some(request::Op::Discover(DiscoverRequest {})),
                },
            )))
            .await
            .unwrap();
        let frame = next_frame(&mut framed).await;
        match frame.body {
            Some(frame::Body::Status(status)) => {
                assert_eq!(status.code(), StatusCode::InvalidArgument);
                assert!(status.message.contains("unknown stream"));
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        cancel.cancel();
        drop(framed);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_stops_accepting() {
        let (addr, cancel, handle) = start_server().await;
        cancel.cancel();
        handle.await.unwrap();
        // After shutdown the listener is gone.
        assert!(TcpStream::connect(addr).await.is_err());
    }
}

//! Shared client transport.
//!
//! One [`Transport`] wraps one TCP connection to one provider endpoint and
//! is shared by every concurrent session to that endpoint. A writer task
//! serializes outbound frames; a reader task demultiplexes inbound frames
//! by stream id into per-stream channels. Stream ids are allocated odd and
//! monotonically increasing, so they never collide with another session on
//! the same transport.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use prost::Message;
use tether_core::proto::{
    self, encode_message, frame, Frame, FrameCodec, Method, ProtocolError, Request, Response,
    Status,
};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Errors raised by the transport layer.
///
/// All of these terminate the session that hit them; the reconcile that
/// owned the session is requeued with backoff.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The endpoint refused or dropped the TCP connection.
    #[error("failed to connect to provider at {endpoint}")]
    Connect {
        /// The unreachable endpoint.
        endpoint: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The protocol handshake failed.
    #[error("handshake with {endpoint} failed")]
    Handshake {
        /// The endpoint that rejected us.
        endpoint: String,
        /// The underlying protocol error.
        #[source]
        source: ProtocolError,
    },

    /// A request could not be sent on the stream.
    #[error("failed to send request to provider")]
    Send,

    /// A response could not be received from the stream.
    #[error("failed to receive response from provider")]
    Recv,

    /// The transport has been closed.
    #[error("transport to {endpoint} is closed")]
    Closed {
        /// The endpoint the transport pointed at.
        endpoint: String,
    },
}

/// One inbound event for a stream.
#[derive(Debug)]
pub(crate) enum StreamEvent {
    /// A response frame.
    Response(Response),
    /// A terminal status frame.
    Status(Status),
}

#[derive(Debug)]
struct Inner {
    endpoint: String,
    out_tx: mpsc::Sender<Frame>,
    streams: Mutex<HashMap<u64, mpsc::Sender<StreamEvent>>>,
    next_stream: AtomicU64,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl Inner {
    fn deregister(&self, stream_id: u64) {
        self.streams
            .lock()
            .expect("transport stream table poisoned")
            .remove(&stream_id);
    }

    fn fail_all_streams(&self) {
        let drained: Vec<_> = self
            .streams
            .lock()
            .expect("transport stream table poisoned")
            .drain()
            .collect();
        // Dropping the senders wakes every pending recv with stream end.
        drop(drained);
    }
}

/// A shared, multiplexed connection to one provider endpoint.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

impl Transport {
    /// Dials the endpoint and performs the protocol handshake.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Connect`] when the endpoint is
    /// unreachable and [`TransportError::Handshake`] when version
    /// negotiation fails.
    pub async fn connect(endpoint: &str, info: &str) -> Result<Self, TransportError> {
        let stream =
            TcpStream::connect(endpoint)
                .await
                .map_err(|source| TransportError::Connect {
                    endpoint: endpoint.to_string(),
                    source,
                })?;

        let mut framed = Framed::new(stream, FrameCodec::new());
        proto::client_handshake(&mut framed, info)
            .await
            .map_err(|source| TransportError::Handshake {
                endpoint: endpoint.to_string(),
                source,
            })?;

        let (sink, frames) = framed.split();
        let (out_tx, out_rx) = mpsc::channel::<Frame>(64);

        let inner = Arc::new(Inner {
            endpoint: endpoint.to_string(),
            out_tx,
            streams: Mutex::new(HashMap::new()),
            next_stream: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        });

        tokio::spawn(write_frames(sink, out_rx, inner.cancel.clone()));
        tokio::spawn(read_frames(frames, inner.clone()));

        debug!(endpoint, "transport established");
        Ok(Self { inner })
    }

    /// The endpoint this transport points at.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    /// Whether the transport has been closed or lost its connection.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Opens a new stream with the given method.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] after the transport goes down
    /// and [`TransportError::Send`] when the open frame cannot be written.
    pub(crate) async fn open_stream(&self, method: Method) -> Result<StreamHandle, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed {
                endpoint: self.inner.endpoint.clone(),
            });
        }

        let stream_id = self.inner.next_stream.fetch_add(2, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel::<StreamEvent>(16);
        self.inner
            .streams
            .lock()
            .expect("transport stream table poisoned")
            .insert(stream_id, tx);

        if self
            .inner
            .out_tx
            .send(Frame::open(stream_id, method))
            .await
            .is_err()
        {
            self.inner.deregister(stream_id);
            return Err(TransportError::Send);
        }

        Ok(StreamHandle {
            id: stream_id,
            inner: self.inner.clone(),
            rx,
        })
    }

    /// Closes the transport and fails every open stream.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.cancel.cancel();
        self.inner.fail_all_streams();
        debug!(endpoint = %self.inner.endpoint, "transport closed");
    }
}

/// One session's half of a multiplexed stream.
pub(crate) struct StreamHandle {
    id: u64,
    inner: Arc<Inner>,
    rx: mpsc::Receiver<StreamEvent>,
}

impl StreamHandle {
    /// Sends a request frame on this stream.
    pub(crate) async fn send(&self, request: Request) -> Result<(), TransportError> {
        self.inner
            .out_tx
            .send(Frame::request(self.id, request))
            .await
            .map_err(|_| TransportError::Send)
    }

    /// Receives the next event on this stream.
    pub(crate) async fn recv(&mut self) -> Result<StreamEvent, TransportError> {
        self.rx.recv().await.ok_or(TransportError::Recv)
    }

    /// Sends a half-close and deregisters the stream. Best effort.
    pub(crate) async fn close(&mut self) {
        let _ = self.inner.out_tx.send(Frame::close(self.id)).await;
        self.inner.deregister(self.id);
        self.rx.close();
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.inner.deregister(self.id);
    }
}

async fn write_frames(
    mut sink: SplitSink<Framed<TcpStream, FrameCodec>, bytes::Bytes>,
    mut out_rx: mpsc::Receiver<Frame>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => break,
            frame = out_rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        if let Err(e) = sink.send(encode_message(&frame)).await {
            debug!(error = %e, "transport write error");
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_frames(mut frames: SplitStream<Framed<TcpStream, FrameCodec>>, inner: Arc<Inner>) {
    loop {
        let bytes = tokio::select! {
            () = inner.cancel.cancelled() => break,
            next = frames.next() => match next {
                Some(Ok(bytes)) => bytes,
                Some(Err(e)) => {
                    debug!(endpoint = %inner.endpoint, error = %e, "transport read error");
                    break;
                }
                None => break,
            },
        };

        let frame = match Frame::decode(bytes.as_ref()) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(endpoint = %inner.endpoint, error = %e, "undecodable frame from provider");
                break;
            }
        };

        let event = match frame.body {
            Some(frame::Body::Response(response)) => StreamEvent::Response(response),
            // A status is terminal for its stream.
            Some(frame::Body::Status(status)) => StreamEvent::Status(status),
            Some(frame::Body::Close(_)) => {
                inner.deregister(frame.stream);
                continue;
            }
            Some(frame::Body::Open(_) | frame::Body::Request(_)) => {
                warn!(stream = frame.stream, "provider sent a client-only frame");
                continue;
            }
            None => continue,
        };
        let terminal = matches!(event, StreamEvent::Status(_));

        let tx = {
            let streams = inner.streams.lock().expect("transport stream table poisoned");
            streams.get(&frame.stream).cloned()
        };
        match tx {
            Some(tx) => {
                let _ = tx.send(event).await;
                if terminal {
                    inner.deregister(frame.stream);
                }
            }
            // Late frame for a stream we already tore down.
            None => debug!(stream = frame.stream, "dropping frame for closed stream"),
        }
    }

    // Connection gone: every open stream fails, future opens are refused.
    inner.closed.store(true, Ordering::SeqCst);
    inner.cancel.cancel();
    inner.fail_all_streams();
}

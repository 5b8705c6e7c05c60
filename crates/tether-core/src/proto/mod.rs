//! The provider wire protocol.
//!
//! Transport is a TCP connection carrying length-prefixed protobuf frames.
//! After a Hello/HelloAck handshake, every frame belongs to a numbered
//! stream; streams are opened with a method selector and carry strict
//! request/reply traffic. Two logical services ride on the same framing:
//!
//! - **Streaming**: one bidirectional `Session` method (connect pins the
//!   kind, then observe/create/update/delete loop until disconnect) plus a
//!   unary `Discover`.
//! - **Connected** (legacy): unary observe/create/update/delete, one
//!   operation per stream.
//!
//! The modules layer bottom-up:
//!
//! - [`framing`]: length-prefixed frame codec ([`FrameCodec`])
//! - [`handshake`]: version negotiation helpers
//! - [`messages`]: the protobuf message types
//! - [`error`]: [`ProtocolError`] and wire limits

pub mod error;
pub mod framing;
pub mod handshake;
pub mod messages;

pub use error::{ProtocolError, ProtocolResult, MAX_FRAME_SIZE, PROTOCOL_VERSION};
pub use framing::FrameCodec;
pub use handshake::{client_handshake, encode_message, server_handshake};
pub use messages::{
    frame, handshake as handshake_msg, request, response, Close, ConnectRequest, ConnectResponse,
    CreateRequest, CreateResponse, DeleteRequest, DeleteResponse, DisconnectRequest,
    DisconnectResponse, DiscoverRequest, Frame, Handshake, Hello, HelloAck, HelloNack, Method,
    ObserveRequest, ObserveResponse, Open, Reconciler, ReconcilerRef, Reconcilers, Request,
    Response, Status, StatusCode, UpdateRequest, UpdateResponse,
};

//! Wire message types for the provider protocol.
//!
//! Messages are Protocol Buffers, written out with prost derives rather
//! than generated at build time so the wire contract is reviewable source.
//! Field tags are frozen; renumbering is a breaking protocol change.
//!
//! Map fields use `BTreeMap` so encoding order is deterministic.
//!
//! # Layering
//!
//! ```text
//! ┌───────────────────────────────────────────┐
//! │ Request / Response unions (per stream)    │
//! ├───────────────────────────────────────────┤
//! │ Frame { stream, body } multiplexing       │
//! ├───────────────────────────────────────────┤
//! │ Handshake (Hello / HelloAck / HelloNack)  │
//! ├───────────────────────────────────────────┤
//! │ Length-prefixed framing (framing module)  │
//! └───────────────────────────────────────────┘
//! ```
//!
//! Resources travel as the well-known `Struct` type: a recursive mapping of
//! string keys to null/number/string/bool/list/struct values, compatible
//! with any JSON-encodable object graph.

use std::collections::BTreeMap;

/// Client greeting, the first frame on any transport.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Hello {
    /// Protocol version the client speaks.
    #[prost(uint32, tag = "1")]
    pub protocol_version: u32,
    /// Free-form client identification, e.g. `tether-reconciler/0.1.0`.
    #[prost(string, tag = "2")]
    pub info: String,
}

/// Server acceptance of a [`Hello`].
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HelloAck {
    /// Protocol version the server speaks.
    #[prost(uint32, tag = "1")]
    pub protocol_version: u32,
    /// Free-form server identification.
    #[prost(string, tag = "2")]
    pub info: String,
}

/// Server rejection of a [`Hello`]. The connection closes after this.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HelloNack {
    /// Protocol version the server speaks.
    #[prost(uint32, tag = "1")]
    pub protocol_version: u32,
    /// Human-readable rejection reason.
    #[prost(string, tag = "2")]
    pub reason: String,
}

/// Envelope for handshake frames.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Handshake {
    /// The handshake message variant.
    #[prost(oneof = "handshake::Msg", tags = "1, 2, 3")]
    pub msg: Option<handshake::Msg>,
}

/// Nested types for [`Handshake`].
pub mod handshake {
    /// Handshake message variants.
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Msg {
        /// Client greeting.
        #[prost(message, tag = "1")]
        Hello(super::Hello),
        /// Server acceptance.
        #[prost(message, tag = "2")]
        HelloAck(super::HelloAck),
        /// Server rejection.
        #[prost(message, tag = "3")]
        HelloNack(super::HelloNack),
    }
}

/// Method selector carried by the [`Open`] frame of a new stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Method {
    /// Reserved zero value; never valid on the wire.
    Unspecified = 0,
    /// Bidirectional session stream (streaming service).
    Session = 1,
    /// Unary discovery call (streaming service).
    Discover = 2,
    /// Legacy unary observe (connected service).
    Observe = 3,
    /// Legacy unary create (connected service).
    Create = 4,
    /// Legacy unary update (connected service).
    Update = 5,
    /// Legacy unary delete (connected service).
    Delete = 6,
}

/// Terminal stream status codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum StatusCode {
    /// Normal completion.
    Ok = 0,
    /// Malformed frame or payload for the stream's state.
    InvalidArgument = 1,
    /// No handler registered for the requested kind. Non-retryable.
    NotFound = 2,
    /// Protocol contract violated: operation before connect, or kind
    /// mismatch against the pinned kind.
    FailedPrecondition = 3,
    /// Handler or codec failure on the provider side.
    Internal = 4,
    /// Provider is shutting down.
    Unavailable = 5,
}

/// Opens a new stream with the given method.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Open {
    /// Service method this stream carries.
    #[prost(enumeration = "Method", tag = "1")]
    pub method: i32,
}

/// Half-closes a stream from the sender's side.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Close {}

/// Terminal status for a stream. Any non-`Ok` code ends the stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Status {
    /// Status code.
    #[prost(enumeration = "StatusCode", tag = "1")]
    pub code: i32,
    /// Human-readable detail.
    #[prost(string, tag = "2")]
    pub message: String,
}

impl Status {
    /// Builds a status from a code and message.
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code: code as i32,
            message: message.into(),
        }
    }
}

/// Connect request: binds the stream to the resource's kind.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConnectRequest {
    /// The declarative object, carrying `apiVersion` and `kind`.
    #[prost(message, optional, tag = "1")]
    pub resource: Option<::prost_types::Struct>,
}

/// Observe request for the pinned kind.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ObserveRequest {
    /// The declarative object.
    #[prost(message, optional, tag = "1")]
    pub resource: Option<::prost_types::Struct>,
}

/// Create request for the pinned kind.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreateRequest {
    /// The declarative object.
    #[prost(message, optional, tag = "1")]
    pub resource: Option<::prost_types::Struct>,
}

/// Update request for the pinned kind.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateRequest {
    /// The declarative object.
    #[prost(message, optional, tag = "1")]
    pub resource: Option<::prost_types::Struct>,
}

/// Delete request for the pinned kind.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeleteRequest {
    /// The declarative object.
    #[prost(message, optional, tag = "1")]
    pub resource: Option<::prost_types::Struct>,
}

/// Ends the session conversation; the provider releases the bound client.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DisconnectRequest {}

/// Asks the provider which kinds it reconciles.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DiscoverRequest {}

/// A request on an open stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Request {
    /// The operation variant.
    #[prost(oneof = "request::Op", tags = "1, 2, 3, 4, 5, 6, 7")]
    pub op: Option<request::Op>,
}

/// Nested types for [`Request`].
pub mod request {
    /// Request operation variants.
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Op {
        /// Bind the stream to a kind.
        #[prost(message, tag = "1")]
        Connect(super::ConnectRequest),
        /// Observe the external resource.
        #[prost(message, tag = "2")]
        Observe(super::ObserveRequest),
        /// Create the external resource.
        #[prost(message, tag = "3")]
        Create(super::CreateRequest),
        /// Update the external resource.
        #[prost(message, tag = "4")]
        Update(super::UpdateRequest),
        /// Delete the external resource.
        #[prost(message, tag = "5")]
        Delete(super::DeleteRequest),
        /// End the conversation.
        #[prost(message, tag = "6")]
        Disconnect(super::DisconnectRequest),
        /// Enumerate reconcilable kinds.
        #[prost(message, tag = "7")]
        Discover(super::DiscoverRequest),
    }
}

impl Request {
    /// Name of the carried operation, for logs and error messages.
    #[must_use]
    pub fn op_name(&self) -> &'static str {
        match &self.op {
            Some(request::Op::Connect(_)) => "Connect",
            Some(request::Op::Observe(_)) => "Observe",
            Some(request::Op::Create(_)) => "Create",
            Some(request::Op::Update(_)) => "Update",
            Some(request::Op::Delete(_)) => "Delete",
            Some(request::Op::Disconnect(_)) => "Disconnect",
            Some(request::Op::Discover(_)) => "Discover",
            None => "(empty)",
        }
    }

    /// The resource payload of the carried operation, if it has one.
    #[must_use]
    pub fn resource(&self) -> Option<&::prost_types::Struct> {
        match &self.op {
            Some(request::Op::Connect(r)) => r.resource.as_ref(),
            Some(request::Op::Observe(r)) => r.resource.as_ref(),
            Some(request::Op::Create(r)) => r.resource.as_ref(),
            Some(request::Op::Update(r)) => r.resource.as_ref(),
            Some(request::Op::Delete(r)) => r.resource.as_ref(),
            Some(request::Op::Disconnect(_) | request::Op::Discover(_)) | None => None,
        }
    }
}

/// Connect response, carrying the possibly-mutated object back.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConnectResponse {
    /// The declarative object after provider-side connect.
    #[prost(message, optional, tag = "1")]
    pub resource: Option<::prost_types::Struct>,
    /// Opaque secret material produced by connect, if any.
    #[prost(btree_map = "string, bytes", tag = "2")]
    pub connection_details: BTreeMap<String, Vec<u8>>,
}

/// Observe response.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ObserveResponse {
    /// The declarative object after observation.
    #[prost(message, optional, tag = "1")]
    pub resource: Option<::prost_types::Struct>,
    /// Opaque secret material observed, if any.
    #[prost(btree_map = "string, bytes", tag = "2")]
    pub connection_details: BTreeMap<String, Vec<u8>>,
    /// Whether the external resource exists.
    #[prost(bool, tag = "3")]
    pub resource_exists: bool,
    /// Whether the external resource matches the desired state.
    #[prost(bool, tag = "4")]
    pub resource_up_to_date: bool,
    /// Whether observation back-filled spec fields.
    #[prost(bool, tag = "5")]
    pub resource_late_initialized: bool,
}

/// Create response.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreateResponse {
    /// The declarative object after creation.
    #[prost(message, optional, tag = "1")]
    pub resource: Option<::prost_types::Struct>,
    /// Opaque secret material produced by creation.
    #[prost(btree_map = "string, bytes", tag = "2")]
    pub connection_details: BTreeMap<String, Vec<u8>>,
    /// Diagnostic metadata about the creation.
    #[prost(btree_map = "string, string", tag = "3")]
    pub additional_details: BTreeMap<String, String>,
}

/// Update response.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateResponse {
    /// The declarative object after update.
    #[prost(message, optional, tag = "1")]
    pub resource: Option<::prost_types::Struct>,
    /// Opaque secret material produced by the update.
    #[prost(btree_map = "string, bytes", tag = "2")]
    pub connection_details: BTreeMap<String, Vec<u8>>,
    /// Diagnostic metadata about the update.
    #[prost(btree_map = "string, string", tag = "3")]
    pub additional_details: BTreeMap<String, String>,
}

/// Delete response.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeleteResponse {
    /// The declarative object after deletion.
    #[prost(message, optional, tag = "1")]
    pub resource: Option<::prost_types::Struct>,
    /// Diagnostic metadata about the deletion.
    #[prost(btree_map = "string, string", tag = "2")]
    pub additional_details: BTreeMap<String, String>,
}

/// Disconnect acknowledgement.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DisconnectResponse {}

/// Reference to a reconcilable kind, serialized form.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReconcilerRef {
    /// `group/version` (or bare version for the core group).
    #[prost(string, tag = "1")]
    pub api_version: String,
    /// Kind name.
    #[prost(string, tag = "2")]
    pub kind: String,
}

/// One reconciler advertised by a provider.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Reconciler {
    /// Reconciler name.
    #[prost(string, tag = "1")]
    pub name: String,
    /// The kind this reconciler is for.
    #[prost(message, optional, tag = "2")]
    pub r#for: Option<ReconcilerRef>,
}

/// Discovery response: all reconcilers the provider hosts.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Reconcilers {
    /// Advertised reconcilers, in a stable order.
    #[prost(message, repeated, tag = "1")]
    pub reconcilers: Vec<Reconciler>,
}

/// A response on an open stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Response {
    /// The operation variant.
    #[prost(oneof = "response::Op", tags = "1, 2, 3, 4, 5, 6, 7")]
    pub op: Option<response::Op>,
}

/// Nested types for [`Response`].
pub mod response {
    /// Response operation variants.
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Op {
        /// Reply to connect.
        #[prost(message, tag = "1")]
        Connect(super::ConnectResponse),
        /// Reply to observe.
        #[prost(message, tag = "2")]
        Observe(super::ObserveResponse),
        /// Reply to create.
        #[prost(message, tag = "3")]
        Create(super::CreateResponse),
        /// Reply to update.
        #[prost(message, tag = "4")]
        Update(super::UpdateResponse),
        /// Reply to delete.
        #[prost(message, tag = "5")]
        Delete(super::DeleteResponse),
        /// Reply to disconnect.
        #[prost(message, tag = "6")]
        Disconnect(super::DisconnectResponse),
        /// Reply to discover.
        #[prost(message, tag = "7")]
        Reconcilers(super::Reconcilers),
    }
}

impl Response {
    /// Name of the carried operation, for logs and error messages.
    #[must_use]
    pub fn op_name(&self) -> &'static str {
        match &self.op {
            Some(response::Op::Connect(_)) => "Connect",
            Some(response::Op::Observe(_)) => "Observe",
            Some(response::Op::Create(_)) => "Create",
            Some(response::Op::Update(_)) => "Update",
            Some(response::Op::Delete(_)) => "Delete",
            Some(response::Op::Disconnect(_)) => "Disconnect",
            Some(response::Op::Reconcilers(_)) => "Reconcilers",
            None => "(empty)",
        }
    }
}

/// A multiplexed frame: one stream's worth of protocol traffic.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Frame {
    /// Stream identifier. Client-allocated ids are odd and increase
    /// monotonically within a transport.
    #[prost(uint64, tag = "1")]
    pub stream: u64,
    /// Frame body.
    #[prost(oneof = "frame::Body", tags = "2, 3, 4, 5, 6")]
    pub body: Option<frame::Body>,
}

/// Nested types for [`Frame`].
pub mod frame {
    /// Frame body variants.
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Body {
        /// Open a new stream.
        #[prost(message, tag = "2")]
        Open(super::Open),
        /// Request on an open stream.
        #[prost(message, tag = "3")]
        Request(super::Request),
        /// Response on an open stream.
        #[prost(message, tag = "4")]
        Response(super::Response),
        /// Half-close from the sender.
        #[prost(message, tag = "5")]
        Close(super::Close),
        /// Terminal status.
        #[prost(message, tag = "6")]
        Status(super::Status),
    }
}

impl Frame {
    /// An `Open` frame for a new stream.
    #[must_use]
    pub fn open(stream: u64, method: Method) -> Self {
        Self {
            stream,
            body: Some(frame::Body::Open(Open {
                method: method as i32,
            })),
        }
    }

    /// A request frame.
    #[must_use]
    pub fn request(stream: u64, request: Request) -> Self {
        Self {
            stream,
            body: Some(frame::Body::Request(request)),
        }
    }

    /// A response frame.
    #[must_use]
    pub fn response(stream: u64, response: Response) -> Self {
        Self {
            stream,
            body: Some(frame::Body::Response(response)),
        }
    }

    /// A half-close frame.
    #[must_use]
    pub fn close(stream: u64) -> Self {
        Self {
            stream,
            body: Some(frame::Body::Close(Close {})),
        }
    }

    /// A terminal status frame.
    pub fn status(stream: u64, code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            stream,
            body: Some(frame::Body::Status(Status::new(code, message))),
        }
    }
}

#[cfg(test)]
mod tests {
    use prost::Message as _;

    use super::*;

    #[test]
    fn frame_round_trip() {
        let frame = Frame::open(1, Method::Session);
        let bytes = frame.encode_to_vec();
        let decoded = Frame::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded, frame);
        match decoded.body {
            Some(frame::Body::Open(open)) => assert_eq!(open.method(), Method::Session),
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn request_op_names() {
        let req = Request {
            op: Some(request::Op::Connect(ConnectRequest { resource: None })),
        };
        assert_eq!(req.op_name(), "Connect");
        assert_eq!(Request { op: None }.op_name(), "(empty)");
    }

    #[test]
    fn connection_details_map_round_trip() {
        let mut details = BTreeMap::new();
        details.insert("Client".to_string(), b"secret".to_vec());
        let resp = ConnectResponse {
            resource: None,
            connection_details: details.clone(),
        };
        let decoded = ConnectResponse::decode(resp.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded.connection_details, details);
    }

    #[test]
    fn unknown_method_decodes_as_unspecified() {
        let open = Open { method: 99 };
        assert_eq!(open.method(), Method::Unspecified);
    }

    #[test]
    fn status_helper_sets_code() {
        let status = Status::new(StatusCode::NotFound, "no handler");
        assert_eq!(status.code(), StatusCode::NotFound);
        assert_eq!(status.message, "no handler");
    }
}

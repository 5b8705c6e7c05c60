//! Client-side sessions.
//!
//! A [`Session`] is one conversation with a provider for one reconcile:
//! opened by `Connect`, driven through observe/create/update/delete in
//! strict request/reply lockstep, and ended by an idempotent `Disconnect`.
//! Sessions are one-shot and never pooled; exclusive use is enforced by
//! `&mut self` on every operation.

use tether_core::codec::{self, CodecError};
use tether_core::proto::{
    request, response, ConnectRequest, CreateRequest, DeleteRequest, DisconnectRequest, Method,
    ObserveRequest, Request, Response, StatusCode, UpdateRequest,
};
use tether_core::{Creation, Deletion, Kind, Observation, Resource, SessionPhase, Update};
use tracing::{debug, warn};

use super::transport::{StreamEvent, StreamHandle, Transport, TransportError};

/// Errors raised by session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The session is not active; no RPC was attempted.
    #[error("session is closed")]
    Closed,

    /// The object's kind does not match the kind pinned at connect.
    #[error("resource kind mismatch: session is pinned to {expected}, got {got}")]
    KindMismatch {
        /// The pinned kind.
        expected: String,
        /// The offending kind.
        got: String,
    },

    /// The provider answered with the wrong response variant.
    #[error("wrong response variant: expected {expected}, got {got}")]
    WrongResponse {
        /// Expected variant name.
        expected: &'static str,
        /// Received variant name.
        got: String,
    },

    /// The provider terminated the stream with a status.
    #[error("provider rejected the request ({code:?}): {message}")]
    Rejected {
        /// The wire status code.
        code: StatusCode,
        /// The status detail.
        message: String,
    },

    /// The underlying transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Payload conversion failed.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// One client ↔ provider conversation, bound to one kind.
pub struct Session {
    stream: StreamHandle,
    kind: Kind,
    phase: SessionPhase,
}

impl Session {
    /// Opens a session for the object's kind and performs the initial
    /// `Connect` exchange. The object is updated in place from the
    /// response.
    pub(crate) async fn open(
        transport: &Transport,
        kind: Kind,
        resource: &mut Resource,
    ) -> Result<Self, SessionError> {
        let mut stream = transport.open_stream(Method::Session).await?;

        let payload = codec::encode(resource)?;
        stream
            .send(Request {
                op: Some(request::Op::Connect(ConnectRequest {
                    resource: Some(payload),
                })),
            })
            .await?;

        let response = match stream.recv().await? {
            StreamEvent::Response(response) => response,
            StreamEvent::Status(status) => {
                return Err(SessionError::Rejected {
                    code: status.code(),
                    message: status.message,
                });
            }
        };

        match response.op {
            Some(response::Op::Connect(connect)) => {
                if let Some(payload) = &connect.resource {
                    codec::decode(payload, resource)?;
                }
            }
            _ => {
                let got = response.op_name();
                return Err(SessionError::WrongResponse {
                    expected: "Connect",
                    got: got.to_string(),
                });
            }
        }

        debug!(kind = %kind, "session opened");
        Ok(Self {
            stream,
            kind,
            phase: SessionPhase::Active,
        })
    }

    /// The kind pinned at connect.
    #[must_use]
    pub fn kind(&self) -> &Kind {
        &self.kind
    }

    /// The session's current phase.
    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Observes the external resource.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] on lifecycle, protocol, or transport
    /// failures; all are terminal for the session.
    pub async fn observe(&mut self, resource: &mut Resource) -> Result<Observation, SessionError> {
        let response = self
            .exchange(resource, |payload| {
                request::Op::Observe(ObserveRequest {
                    resource: Some(payload),
                })
            })
            .await?;

        match response.op {
            Some(response::Op::Observe(observe)) => {
                if let Some(payload) = &observe.resource {
                    codec::decode(payload, resource)?;
                }
                Ok(Observation {
                    exists: observe.resource_exists,
                    up_to_date: observe.resource_up_to_date,
                    late_initialized: observe.resource_late_initialized,
                    connection_details: observe.connection_details,
                })
            }
            _ => Err(self.wrong_response("Observe", &response)),
        }
    }

    /// Creates the external resource.
    ///
    /// # Errors
    ///
    /// See [`observe`](Self::observe).
    pub async fn create(&mut self, resource: &mut Resource) -> Result<Creation, SessionError> {
        let response = self
            .exchange(resource, |payload| {
                request::Op::Create(CreateRequest {
                    resource: Some(payload),
                })
            })
            .await?;

        match response.op {
            Some(response::Op::Create(create)) => {
                if let Some(payload) = &create.resource {
                    codec::decode(payload, resource)?;
                }
                Ok(Creation {
                    connection_details: create.connection_details,
                    additional_details: create.additional_details,
                })
            }
            _ => Err(self.wrong_response("Create", &response)),
        }
    }

    /// Updates the external resource.
    ///
    /// # Errors
    ///
    /// See [`observe`](Self::observe).
    pub async fn update(&mut self, resource: &mut Resource) -> Result<Update, SessionError> {
        let response = self
            .exchange(resource, |payload| {
                request::Op::Update(UpdateRequest {
                    resource: Some(payload),
                })
            })
            .await?;

        match response.op {
            Some(response::Op::Update(update)) => {
                if let Some(payload) = &update.resource {
                    codec::decode(payload, resource)?;
                }
                Ok(Update {
                    connection_details: update.connection_details,
                    additional_details: update.additional_details,
                })
            }
            _ => Err(self.wrong_response("Update", &response)),
        }
    }

    /// Deletes the external resource.
    ///
    /// # Errors
    ///
    /// See [`observe`](Self::observe).
    pub async fn delete(&mut self, resource: &mut Resource) -> Result<Deletion, SessionError> {
        let response = self
            .exchange(resource, |payload| {
                request::Op::Delete(DeleteRequest {
                    resource: Some(payload),
                })
            })
            .await?;

        match response.op {
            Some(response::Op::Delete(delete)) => {
                if let Some(payload) = &delete.resource {
                    codec::decode(payload, resource)?;
                }
                Ok(Deletion {
                    additional_details: delete.additional_details,
                })
            }
            _ => Err(self.wrong_response("Delete", &response)),
        }
    }

    /// Ends the session. Idempotent: calling it on a closed session is a
    /// no-op returning success, and reply errors are logged, not raised.
    pub async fn disconnect(&mut self) {
        if self.phase == SessionPhase::Closed {
            return;
        }
        self.phase = self.phase.begin_close().unwrap_or(SessionPhase::Closed);

        let sent = self
            .stream
            .send(Request {
                op: Some(request::Op::Disconnect(DisconnectRequest {})),
            })
            .await;
        match sent {
            Ok(()) => match self.stream.recv().await {
                Ok(StreamEvent::Response(response))
                    if matches!(response.op, Some(response::Op::Disconnect(_))) =>
                {
                    debug!(kind = %self.kind, "session disconnected");
                }
                Ok(other) => {
                    warn!(kind = %self.kind, ?other, "unexpected reply to disconnect");
                }
                Err(e) => {
                    debug!(kind = %self.kind, error = %e, "no disconnect acknowledgement");
                }
            },
            Err(e) => {
                debug!(kind = %self.kind, error = %e, "failed to send disconnect");
            }
        }

        self.stream.close().await;
        self.phase = self.phase.close();
    }

    /// Runs one request/reply exchange, enforcing phase and kind.
    async fn exchange(
        &mut self,
        resource: &Resource,
        build: impl FnOnce(prost_types::Struct) -> request::Op,
    ) -> Result<Response, SessionError> {
        if !self.phase.allows_operations() {
            return Err(SessionError::Closed);
        }

        let kind = resource.kind().map_err(|_| SessionError::KindMismatch {
            expected: self.kind.to_string(),
            got: "(unknown)".to_string(),
        })?;
        if kind != self.kind {
            return Err(SessionError::KindMismatch {
                expected: self.kind.to_string(),
                got: kind.to_string(),
            });
        }

        let payload = codec::encode(resource)?;
        let sent = self
            .stream
            .send(Request {
                op: Some(build(payload)),
            })
            .await;
        if let Err(e) = sent {
            self.terminate().await;
            return Err(e.into());
        }

        match self.stream.recv().await {
            Ok(StreamEvent::Response(response)) => Ok(response),
            Ok(StreamEvent::Status(status)) => {
                self.terminate().await;
                Err(SessionError::Rejected {
                    code: status.code(),
                    message: status.message,
                })
            }
            Err(e) => {
                self.terminate().await;
                Err(e.into())
            }
        }
    }

    /// Terminal failure: the session is dead and its stream released.
    async fn terminate(&mut self) {
        self.phase = self.phase.close();
        self.stream.close().await;
    }

    fn wrong_response(&mut self, expected: &'static str, response: &Response) -> SessionError {
        self.phase = self.phase.close();
        SessionError::WrongResponse {
            expected,
            got: response.op_name().to_string(),
        }
    }
}

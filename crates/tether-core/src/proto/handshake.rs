//! Hello/HelloAck version negotiation.
//!
//! The first frame in each direction on a new transport is a handshake
//! message. The client opens with [`Hello`]; the server answers with
//! [`HelloAck`] on success or [`HelloNack`] before closing on version
//! mismatch. No protocol frame may be sent before the handshake completes.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use prost::Message;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

use super::error::{ProtocolError, ProtocolResult, PROTOCOL_VERSION};
use super::framing::FrameCodec;
use super::messages::{handshake, Handshake, Hello, HelloAck, HelloNack};

/// Encodes a protocol message into a wire frame payload.
#[must_use]
pub fn encode_message<M: Message>(message: &M) -> Bytes {
    Bytes::from(message.encode_to_vec())
}

/// Performs the client side of the handshake.
///
/// Sends `Hello` and waits for the server's verdict.
///
/// # Errors
///
/// Returns [`ProtocolError::VersionMismatch`] or
/// [`ProtocolError::HandshakeRejected`] when the server declines, and
/// transport errors otherwise.
pub async fn client_handshake<T>(
    framed: &mut Framed<T, FrameCodec>,
    info: &str,
) -> ProtocolResult<HelloAck>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let hello = Handshake {
        msg: Some(handshake::Msg::Hello(Hello {
            protocol_version: PROTOCOL_VERSION,
            info: info.to_string(),
        })),
    };
    framed.send(encode_message(&hello)).await?;

    let frame = framed
        .next()
        .await
        .ok_or(ProtocolError::ConnectionClosed)??;
    let reply = Handshake::decode(frame.as_ref())?;

    match reply.msg {
        Some(handshake::Msg::HelloAck(ack)) => {
            if ack.protocol_version != PROTOCOL_VERSION {
                return Err(ProtocolError::VersionMismatch {
                    local: PROTOCOL_VERSION,
                    remote: ack.protocol_version,
                });
            }
            Ok(ack)
        }
        Some(handshake::Msg::HelloNack(nack)) => Err(ProtocolError::HandshakeRejected {
            reason: nack.reason,
        }),
        Some(handshake::Msg::Hello(_)) | None => Err(ProtocolError::UnexpectedHandshake),
    }
}

/// Performs the server side of the handshake.
///
/// Waits for the client's `Hello` and answers with `HelloAck`, or with
/// `HelloNack` before failing on version mismatch.
///
/// # Errors
///
/// Returns [`ProtocolError::VersionMismatch`] after nacking an incompatible
/// client, [`ProtocolError::UnexpectedHandshake`] for a non-`Hello` opener,
/// and transport errors otherwise.
pub async fn server_handshake<T>(
    framed: &mut Framed<T, FrameCodec>,
    info: &str,
) -> ProtocolResult<Hello>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let frame = framed
        .next()
        .await
        .ok_or(ProtocolError::ConnectionClosed)??;
    let opener = Handshake::decode(frame.as_ref())?;

    let hello = match opener.msg {
        Some(handshake::Msg::Hello(hello)) => hello,
        Some(handshake::Msg::HelloAck(_) | handshake::Msg::HelloNack(_)) | None => {
            return Err(ProtocolError::UnexpectedHandshake);
        }
    };

    if hello.protocol_version != PROTOCOL_VERSION {
        let nack = Handshake {
            msg: Some(handshake::Msg::HelloNack(HelloNack {
                protocol_version: PROTOCOL_VERSION,
                reason: format!(
                    "unsupported protocol version {} (server speaks {})",
                    hello.protocol_version, PROTOCOL_VERSION
                ),
            })),
        };
        // Best effort: the connection is going down either way.
        let _ = framed.send(encode_message(&nack)).await;
        return Err(ProtocolError::VersionMismatch {
            local: PROTOCOL_VERSION,
            remote: hello.protocol_version,
        });
    }

    let ack = Handshake {
        msg: Some(handshake::Msg::HelloAck(HelloAck {
            protocol_version: PROTOCOL_VERSION,
            info: info.to_string(),
        })),
    };
    framed.send(encode_message(&ack)).await?;

    Ok(hello)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framed_pair() -> (
        Framed<tokio::io::DuplexStream, FrameCodec>,
        Framed<tokio::io::DuplexStream, FrameCodec>,
    ) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        (
            Framed::new(client, FrameCodec::new()),
            Framed::new(server, FrameCodec::new()),
        )
    }

    #[tokio::test]
    async fn handshake_succeeds_on_matching_versions() {
        let (mut client, mut server) = framed_pair();

        let server_task = tokio::spawn(async move {
            server_handshake(&mut server, "test-provider/0.1").await
        });

        let ack = client_handshake(&mut client, "test-client/0.1")
            .await
            .unwrap();
        assert_eq!(ack.protocol_version, PROTOCOL_VERSION);
        assert_eq!(ack.info, "test-provider/0.1");

        let hello = server_task.await.unwrap().unwrap();
        assert_eq!(hello.info, "test-client/0.1");
    }

    #[tokio::test]
    async fn server_nacks_version_mismatch() {
        let (mut client, mut server) = framed_pair();

        let server_task =
            tokio::spawn(async move { server_handshake(&mut server, "test-provider").await });

        // Speak a bogus version by hand.
        let hello = Handshake {
            msg: Some(handshake::Msg::Hello(Hello {
                protocol_version: PROTOCOL_VERSION + 1,
                info: "future-client".to_string(),
            })),
        };
        client.send(encode_message(&hello)).await.unwrap();

        let frame = client.next().await.unwrap().unwrap();
        let reply = Handshake::decode(frame.as_ref()).unwrap();
        assert!(matches!(reply.msg, Some(handshake::Msg::HelloNack(_))));

        let err = server_task.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::VersionMismatch { remote, .. } if remote == PROTOCOL_VERSION + 1
        ));
    }

    #[tokio::test]
    async fn server_rejects_non_hello_opener() {
        let (mut client, mut server) = framed_pair();

        let server_task =
            tokio::spawn(async move { server_handshake(&mut server, "test-provider").await });

        let bogus = Handshake {
            msg: Some(handshake::Msg::HelloAck(HelloAck {
                protocol_version: PROTOCOL_VERSION,
                info: String::new(),
            })),
        };
        client.send(encode_message(&bogus)).await.unwrap();

        let err = server_task.await.unwrap().unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedHandshake));
    }

    #[tokio::test]
    async fn client_surfaces_closed_connection() {
        let (mut client, server) = framed_pair();
        drop(server);
        let err = client_handshake(&mut client, "test-client").await.unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::ConnectionClosed | ProtocolError::Io(_)
        ));
    }
}

//! Framed transport helpers for the push protocol.
//!
//! Frames are 4-byte big-endian length-delimited. A request payload is
//! `[tag: u8][protobuf]`; a response payload is bare protobuf. Frame size
//! is capped at [`MAX_PUSH_FRAME_SIZE`] by the codec, so an oversized or
//! corrupt length prefix surfaces as an I/O error before allocation.

use std::path::PathBuf;

use bytes::{BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use prost::Message;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use super::MessageKind;

/// Maximum size of a push frame in bytes (4 MiB). Configuration bodies are
/// JSON documents; anything larger indicates a corrupt stream.
pub const MAX_PUSH_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Builds the length-delimited codec used on both sides of the protocol.
#[must_use]
pub fn push_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_PUSH_FRAME_SIZE)
        .new_codec()
}

/// Transport-level errors on the push protocol.
///
/// These are distinct from a worker answering `FAIL`: a transport error
/// means the worker never answered, so the caller excludes it from
/// aggregation and marks the worker failing.
#[derive(Debug, Error)]
pub enum PushError {
    /// Could not reach the worker's socket.
    #[error("failed to connect to worker socket {path}: {source}")]
    Connect {
        /// Socket path the connect targeted.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// The peer closed the connection before a full exchange.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// A request frame arrived with no payload at all.
    #[error("received empty request frame")]
    EmptyFrame,

    /// A request frame carried a tag no operation is registered for.
    #[error("unknown message tag: {tag}")]
    UnknownTag {
        /// The unrecognized tag byte.
        tag: u8,
    },

    /// The call did not complete within the caller's deadline.
    #[error("push call timed out after {duration_ms}ms")]
    Timeout {
        /// Elapsed deadline in milliseconds.
        duration_ms: u64,
    },

    /// Payload was not a valid protobuf message.
    #[error("failed to decode push payload: {0}")]
    Decode(#[from] prost::DecodeError),

    /// I/O error on the underlying stream, including frames rejected by
    /// the codec's size cap.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Sends one `[tag][payload]` request frame.
pub async fn send_request<T, M>(
    framed: &mut Framed<T, LengthDelimitedCodec>,
    kind: MessageKind,
    message: &M,
) -> Result<(), PushError>
where
    T: AsyncRead + AsyncWrite + Unpin,
    M: Message,
{
    let payload = message.encode_to_vec();
    let mut buf = BytesMut::with_capacity(1 + payload.len());
    buf.put_u8(kind.tag());
    buf.put_slice(&payload);
    framed.send(buf.freeze()).await?;
    Ok(())
}

/// Receives one request frame, splitting the operation tag from the
/// payload.
pub async fn recv_request<T>(
    framed: &mut Framed<T, LengthDelimitedCodec>,
) -> Result<(MessageKind, Bytes), PushError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let frame = match framed.next().await {
        Some(frame) => frame?,
        None => return Err(PushError::ConnectionClosed),
    };
    if frame.is_empty() {
        return Err(PushError::EmptyFrame);
    }

    let tag = frame[0];
    let kind = MessageKind::from_tag(tag).ok_or(PushError::UnknownTag { tag })?;
    Ok((kind, frame.freeze().slice(1..)))
}

/// Sends one response frame.
pub async fn send_response<T, M>(
    framed: &mut Framed<T, LengthDelimitedCodec>,
    message: &M,
) -> Result<(), PushError>
where
    T: AsyncRead + AsyncWrite + Unpin,
    M: Message,
{
    framed.send(Bytes::from(message.encode_to_vec())).await?;
    Ok(())
}

/// Receives one response frame decoded as `M`.
pub async fn recv_response<T, M>(
    framed: &mut Framed<T, LengthDelimitedCodec>,
) -> Result<M, PushError>
where
    T: AsyncRead + AsyncWrite + Unpin,
    M: Message + Default,
{
    let frame = match framed.next().await {
        Some(frame) => frame?,
        None => return Err(PushError::ConnectionClosed),
    };
    Ok(M::decode(frame.freeze())?)
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::super::{HelloRequest, HelloResponse, SetRequest};
    use super::*;

    fn framed_pair() -> (
        Framed<tokio::io::DuplexStream, LengthDelimitedCodec>,
        Framed<tokio::io::DuplexStream, LengthDelimitedCodec>,
    ) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        (
            Framed::new(client, push_codec()),
            Framed::new(server, push_codec()),
        )
    }

    #[tokio::test]
    async fn test_request_round_trip() {
        let (mut client, mut server) = framed_pair();

        let request = SetRequest {
            id: "auth@basic".to_string(),
            profession: "auth".to_string(),
            name: "basic".to_string(),
            driver: "basic".to_string(),
            body: b"{}".to_vec(),
        };
        send_request(&mut client, MessageKind::SetCheck, &request)
            .await
            .unwrap();

        let (kind, payload) = recv_request(&mut server).await.unwrap();
        assert_eq!(kind, MessageKind::SetCheck);
        assert_eq!(SetRequest::decode(payload).unwrap(), request);
    }

    #[tokio::test]
    async fn test_response_round_trip() {
        let (mut client, mut server) = framed_pair();

        let request = HelloRequest {
            hello: "probe".to_string(),
        };
        send_response(&mut server, &HelloResponse::echo(&request, vec![8081]))
            .await
            .unwrap();

        let response: HelloResponse = recv_response(&mut client).await.unwrap();
        assert_eq!(response.hello, "probe");
        assert_eq!(response.resource.unwrap().ports, vec![8081]);
    }

    #[tokio::test]
    async fn test_unknown_tag_rejected() {
        let (mut client, mut server) = framed_pair();

        client.send(Bytes::from_static(&[0x7f, 0x00])).await.unwrap();

        let err = recv_request(&mut server).await.unwrap_err();
        assert!(matches!(err, PushError::UnknownTag { tag: 0x7f }));
    }

    #[tokio::test]
    async fn test_empty_frame_rejected() {
        let (mut client, mut server) = framed_pair();

        client.send(Bytes::new()).await.unwrap();

        let err = recv_request(&mut server).await.unwrap_err();
        assert!(matches!(err, PushError::EmptyFrame));
    }

    #[tokio::test]
    async fn test_closed_peer_reported() {
        let (client, mut server) = framed_pair();
        drop(client);

        let err = recv_request(&mut server).await.unwrap_err();
        assert!(matches!(err, PushError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_oversized_length_prefix_rejected() {
        let (client, mut server) = framed_pair();

        let mut raw = client.into_inner();
        raw.write_all(&(u32::MAX).to_be_bytes()).await.unwrap();
        raw.write_all(&[0u8; 32]).await.unwrap();

        let err = recv_request(&mut server).await.unwrap_err();
        assert!(matches!(err, PushError::Io(_)));
    }
}

//! Framing layer: length-prefixed frames on a byte stream.
//!
//! A frame is a 4-byte big-endian length followed by exactly that many
//! payload bytes. The split itself is `LengthDelimitedCodec`; this module
//! configures it and maps its errors. It knows nothing about what the
//! payload means.

use std::io;

use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, FramedRead, FramedWrite, LengthDelimitedCodec, LengthDelimitedCodecError};

use crate::wire::MAX_FRAME_LEN;

/// Inbound half of a framed link.
pub type FrameReader<R> = FramedRead<R, LengthDelimitedCodec>;

/// Outbound half of a framed link.
pub type FrameWriter<W> = FramedWrite<W, LengthDelimitedCodec>;

/// Both directions on one stream; used where a link is never split.
pub type FramedLink<S> = Framed<S, LengthDelimitedCodec>;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The peer closed the stream, or it broke, before a whole frame arrived.
    #[error("stream closed")]
    StreamClosed,

    #[error("frame exceeds maximum length {}", MAX_FRAME_LEN)]
    TooLarge,

    #[error("frame i/o failed: {0}")]
    Io(#[from] io::Error),
}

impl FrameError {
    fn from_io(e: io::Error) -> Self {
        if e.get_ref().is_some_and(|inner| inner.is::<LengthDelimitedCodecError>()) {
            return FrameError::TooLarge;
        }
        match e.kind() {
            // The codec reports a stream that ends inside a frame as `Other`.
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::Other => FrameError::StreamClosed,
            _ => FrameError::Io(e),
        }
    }
}

/// 4-byte big-endian length, bodies up to `MAX_FRAME_LEN`. Oversized
/// lengths are rejected before the body is buffered.
pub fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

pub fn reader<R: AsyncRead>(io: R) -> FrameReader<R> {
    FramedRead::new(io, codec())
}

pub fn writer<W: AsyncWrite>(io: W) -> FrameWriter<W> {
    FramedWrite::new(io, codec())
}

pub fn framed<S: AsyncRead + AsyncWrite>(io: S) -> FramedLink<S> {
    Framed::new(io, codec())
}

/// Write one frame and flush.
pub async fn send_frame<S>(sink: &mut S, payload: Bytes) -> Result<(), FrameError>
where
    S: Sink<Bytes, Error = io::Error> + Unpin,
{
    sink.send(payload).await.map_err(FrameError::from_io)
}

/// Read one whole frame. Never returns a partial payload.
pub async fn read_frame<S>(stream: &mut S) -> Result<Bytes, FrameError>
where
    S: Stream<Item = Result<bytes::BytesMut, io::Error>> + Unpin,
{
    match stream.next().await {
        Some(Ok(frame)) => Ok(frame.freeze()),
        Some(Err(e)) => Err(FrameError::from_io(e)),
        None => Err(FrameError::StreamClosed),
    }
}

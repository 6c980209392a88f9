//! Framed reads and writes over stream transports.
//!
//! The same 8-byte-header format travels over heterogeneous byte streams:
//! TLS session halves and the helper Unix sockets. These helpers retry
//! short reads until the header fills, validate the length before
//! allocating, then read exactly the body.

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::wire::{Frame, Header, HEADER_LEN, MAX_FRAME_SIZE};

/// Transport-level errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransportError {
    /// The peer closed the stream.
    #[error("end of stream")]
    Eof,

    /// The header announced a body beyond [`MAX_FRAME_SIZE`].
    #[error("frame of {size} bytes exceeds limit of {max} bytes")]
    TooMuch {
        /// Announced body size.
        size: usize,
        /// The enforced limit.
        max: usize,
    },

    /// The underlying stream raised an error.
    #[error("transport I/O: {0}")]
    Io(#[from] std::io::Error),

    /// A frame arrived but its contents were unusable.
    #[error("malformed frame: {0}")]
    Malformed(String),
}

impl TransportError {
    /// Returns `true` when the peer is gone and the stream is unusable.
    #[must_use]
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::Eof => true,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::UnexpectedEof
            ),
            Self::TooMuch { .. } | Self::Malformed(_) => false,
        }
    }
}

/// Reads exactly one frame.
///
/// Retries short reads until the header fills, then reads `length` body
/// bytes. A clean close before the first header byte — or mid-frame — is
/// reported as [`TransportError::Eof`].
///
/// # Errors
///
/// Returns [`TransportError`] on stream closure, oversized frames, or I/O
/// failure.
pub async fn read_frame<R>(stream: &mut R) -> Result<Frame, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; HEADER_LEN];
    if let Err(e) = stream.read_exact(&mut head).await {
        return Err(map_eof(e));
    }
    let header = Header::parse(&head);
    let length = header.length as usize;
    if length > MAX_FRAME_SIZE {
        return Err(TransportError::TooMuch {
            size: length,
            max: MAX_FRAME_SIZE,
        });
    }
    let mut body = vec![0u8; length];
    if let Err(e) = stream.read_exact(&mut body).await {
        return Err(map_eof(e));
    }
    Ok(Frame {
        header,
        body: Bytes::from(body),
    })
}

/// Writes all of `bytes`, looping on short writes.
///
/// # Errors
///
/// Returns [`TransportError::Io`] if the stream raises an error; writes to
/// a dead peer surface here rather than as a signal (`SIGPIPE` is ignored
/// process-wide by the daemon).
pub async fn write_raw<W>(stream: &mut W, bytes: &[u8]) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    stream.write_all(bytes).await?;
    stream.flush().await?;
    Ok(())
}

fn map_eof(e: std::io::Error) -> TransportError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        TransportError::Eof
    } else {
        TransportError::Io(e)
    }
}

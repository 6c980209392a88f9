//! Helper socket plumbing: writers, feeders, and connection setup.
//!
//! The engine is the single writer on each helper socket; a dedicated
//! writer task drains an unbounded channel so engine handlers never block.
//! Background feeders read helper events forever and drive the engine's
//! feed handlers. Console and log feeders treat transport loss as fatal
//! (the daemon cannot satisfy its contract without them); the stats feeder
//! demotes statistics instead.

use std::io::ErrorKind;
use std::path::Path;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use skua_core::transport::{read_frame, write_raw, TransportError};

use crate::{lock_engine, SharedEngine};

/// Connects to a helper socket that must exist.
///
/// # Errors
///
/// Returns the connect error; the daemon treats this as a startup failure.
pub async fn connect_required(path: &Path) -> std::io::Result<UnixStream> {
    let stream = UnixStream::connect(path).await?;
    info!(socket = %path.display(), "helper connected");
    Ok(stream)
}

/// Connects to the optional statistics socket.
///
/// A missing or refusing socket yields `None`; any other error is
/// surfaced.
///
/// # Errors
///
/// Returns errors other than `ENOENT`/`ECONNREFUSED`.
pub async fn connect_optional(path: &Path) -> std::io::Result<Option<UnixStream>> {
    match UnixStream::connect(path).await {
        Ok(stream) => {
            info!(socket = %path.display(), "helper connected");
            Ok(Some(stream))
        }
        Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::ConnectionRefused) => {
            info!(socket = %path.display(), "helper absent, continuing without it");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Spawns the writer task for one outbound channel.
///
/// The task ends once every sender is dropped and the queue is drained,
/// then half-closes the stream.
pub fn start_writer<W>(mut writer: W, mut rx: UnboundedReceiver<Bytes>) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = write_raw(&mut writer, &frame).await {
                warn!(error = %e, "helper or session write failed");
                break;
            }
        }
        let _ = writer.shutdown().await;
    })
}

/// Discards the announced body of an oversized frame so the stream stays
/// framed.
async fn drain<R: AsyncRead + Unpin>(reader: &mut R, mut remaining: u64) -> std::io::Result<()> {
    let mut scratch = [0u8; 8192];
    while remaining > 0 {
        #[allow(clippy::cast_possible_truncation)]
        let chunk = remaining.min(scratch.len() as u64) as usize;
        reader.read_exact(&mut scratch[..chunk]).await?;
        remaining -= chunk as u64;
    }
    Ok(())
}

/// Feeder loop for the console helper. Returns only on transport loss.
pub async fn console_feeder<R>(mut reader: R, engine: SharedEngine) -> TransportError
where
    R: AsyncRead + Unpin,
{
    loop {
        match read_frame(&mut reader).await {
            Ok(frame) => lock_engine(&engine).handle_cons(&frame),
            Err(TransportError::TooMuch { size, .. }) => {
                warn!(size, "oversized frame from console helper skipped");
                if let Err(e) = drain(&mut reader, size as u64).await {
                    return TransportError::Io(e);
                }
            }
            Err(e) => return e,
        }
    }
}

/// Feeder loop for the log helper. Returns only on transport loss.
pub async fn log_feeder<R>(mut reader: R, engine: SharedEngine) -> TransportError
where
    R: AsyncRead + Unpin,
{
    loop {
        match read_frame(&mut reader).await {
            Ok(frame) => lock_engine(&engine).handle_log(&frame),
            Err(TransportError::TooMuch { size, .. }) => {
                warn!(size, "oversized frame from log helper skipped");
                if let Err(e) = drain(&mut reader, size as u64).await {
                    return TransportError::Io(e);
                }
            }
            Err(e) => return e,
        }
    }
}

/// Feeder loop for the statistics helper.
///
/// Any error demotes statistics and ends the task; the daemon keeps
/// running.
pub async fn stats_feeder<R>(mut reader: R, engine: SharedEngine)
where
    R: AsyncRead + Unpin,
{
    loop {
        match read_frame(&mut reader).await {
            Ok(frame) => lock_engine(&engine).handle_stat(&frame),
            Err(e) => {
                debug!(error = %e, "stats feeder stopping");
                lock_engine(&engine).stats_lost();
                return;
            }
        }
    }
}

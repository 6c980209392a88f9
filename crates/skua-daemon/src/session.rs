//! Per-connection session task.
//!
//! Each accepted TCP connection is upgraded to TLS with a configuration
//! built from the CRL snapshot taken at accept time, then handed to the
//! engine for classification. The task owns the read half; a writer task
//! drains the session's outbound channel so engine handlers never block
//! on the peer.

use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::Arc;

use chrono::Utc;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use skua_core::transport::{read_frame, TransportError};
use skua_core::wire::{self, WIRE_VERSION};

use crate::engine::vm::{ExitReason, SpawnSpec};
use crate::engine::{CreateTicket, EngineError, Flow, NextAction};
use crate::tls::TlsAuthority;
use crate::{lock_engine, SharedEngine};

/// Serves one accepted connection to completion.
///
/// All errors are handled internally: the connection is closed and the
/// engine is left consistent. The accept loop never propagates session
/// failures.
pub async fn serve(
    tcp: TcpStream,
    peer: SocketAddr,
    engine: SharedEngine,
    authority: Arc<TlsAuthority>,
) {
    if let Err(e) = fcntl(tcp.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)) {
        warn!(%peer, error = %e, "failed to set close-on-exec on session fd");
    }

    // the authenticator depends on revocation state, so the configuration
    // is rebuilt from the current snapshot for every connection
    let snapshot = lock_engine(&engine).crl_snapshot();
    let config = match authority.server_config(snapshot) {
        Ok(config) => config,
        Err(e) => {
            warn!(%peer, error = %e, "failed to build TLS configuration");
            return;
        }
    };

    let stream = match TlsAcceptor::from(config).accept(tcp).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!(%peer, error = %e, "TLS handshake failed");
            return;
        }
    };

    let chain: Vec<Vec<u8>> = stream
        .get_ref()
        .1
        .peer_certificates()
        .map(|certs| certs.iter().map(|cert| cert.as_ref().to_vec()).collect())
        .unwrap_or_default();
    if chain.is_empty() {
        debug!(%peer, "peer presented no certificate chain");
        return;
    }

    let (mut reader, writer) = tokio::io::split(stream);
    let (tx, rx) = mpsc::unbounded_channel();
    let writer_task = crate::helpers::start_writer(writer, rx);
    let cancel = CancellationToken::new();

    let action = lock_engine(&engine).handle_initial(
        peer,
        tx.clone(),
        cancel.clone(),
        &chain,
        Utc::now(),
    );

    match action {
        Ok(NextAction::Loop) => {
            command_loop(&engine, peer, &mut reader, &tx, &cancel).await;
            lock_engine(&engine).handle_disconnect(peer);
        }
        Ok(NextAction::Close) => {
            lock_engine(&engine).handle_disconnect(peer);
        }
        Ok(NextAction::Create(ticket)) => {
            run_create(&engine, *ticket).await;
            lock_engine(&engine).handle_disconnect(peer);
        }
        Err(EngineError::Rejected(message)) => {
            // the failure reply is already queued; flush and close
            info!(%peer, %message, "session refused");
        }
        Err(EngineError::Handshake(e)) => {
            info!(%peer, error = %e, "chain verification failed");
            lock_engine(&engine).handle_disconnect(peer);
        }
    }

    drop(tx);
    let _ = writer_task.await;
}

/// Reads and dispatches command frames until the session ends.
async fn command_loop(
    engine: &SharedEngine,
    peer: SocketAddr,
    reader: &mut (impl tokio::io::AsyncRead + Unpin),
    tx: &mpsc::UnboundedSender<bytes::Bytes>,
    cancel: &CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                debug!(%peer, "session cancelled by revocation");
                return;
            }
            result = read_frame(reader) => match result {
                Ok(frame) => {
                    if lock_engine(engine).handle_command(peer, &frame) == Flow::Close {
                        return;
                    }
                }
                Err(e) if e.is_disconnect() => {
                    debug!(%peer, "session closed by peer");
                    return;
                }
                Err(e @ TransportError::TooMuch { .. }) => {
                    // framing error: report while writable, then close
                    let _ = tx.send(wire::fail(&e.to_string(), 0, WIRE_VERSION));
                    return;
                }
                Err(e) => {
                    warn!(%peer, error = %e, "session transport error");
                    return;
                }
            }
        }
    }
}

/// The spawn continuation for an admitted create.
async fn run_create(engine: &SharedEngine, ticket: CreateTicket) {
    let CreateTicket {
        id,
        meta,
        image,
        requester,
    } = ticket;

    let workdir = lock_engine(engine).workdir().to_path_buf();
    let monitor = lock_engine(engine).monitor();

    let (image_path, console_path) =
        match crate::engine::vm::prepare_artifacts(&workdir, &id, &image).await {
            Ok(paths) => paths,
            Err(e) => {
                lock_engine(engine).abort_create(&id, requester, &e.to_string());
                return;
            }
        };

    let spawned = monitor.spawn(&SpawnSpec {
        id: &id,
        image_path: &image_path,
        console_path: &console_path,
        meta: &meta,
    });
    let spawned = match spawned {
        Ok(spawned) => spawned,
        Err(e) => {
            lock_engine(engine).abort_create(&id, requester, &e.to_string());
            return;
        }
    };

    let registered =
        lock_engine(engine).commit_create(&id, requester, spawned.pid, Utc::now());
    if !registered {
        // the id was revoked while the spawn was in flight
        if let Err(e) = monitor.kill(spawned.pid) {
            warn!(%id, pid = spawned.pid, error = %e, "failed to kill orphaned monitor");
        }
        return;
    }

    if let Some(mut child) = spawned.child {
        let engine = Arc::clone(engine);
        let pid = spawned.pid;
        tokio::spawn(async move {
            let reason = match child.wait().await {
                Ok(status) => ExitReason::from_status(status),
                Err(e) => {
                    warn!(%id, pid, error = %e, "wait on monitor failed");
                    ExitReason::Exited(-1)
                }
            };
            lock_engine(&engine).handle_shutdown(&id, pid, reason, Utc::now());
        });
    }
}

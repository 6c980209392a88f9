//! skua-stats - statistics helper for the skua daemon.
//!
//! Serves one framed connection (the engine) on a Unix socket. The engine
//! registers and removes monitor pids; the helper pushes a sample per
//! registered pid on every tick and answers one-shot `statistics`
//! requests. Pids that vanish between ticks are dropped silently.

mod proc;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use skua_core::id::VmId;
use skua_core::transport::{read_frame, write_raw, TransportError};
use skua_core::wire::{self, Event, Request, StatsSample, SuccessReply, Tag, WIRE_VERSION};

/// skua statistics helper
#[derive(Parser, Debug)]
#[command(name = "skua-stats")]
#[command(version, about, long_about = None)]
struct Args {
    /// Unix socket to serve on
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Sampling interval in seconds
    #[arg(long, default_value = "10")]
    interval: u64,
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    let runtime = tokio::runtime::Runtime::new().context("failed to create runtime")?;
    runtime.block_on(run(args))
}

async fn run(args: Args) -> Result<()> {
    let socket = args
        .socket
        .unwrap_or_else(|| std::env::temp_dir().join("stat.sock"));
    if socket.exists() {
        std::fs::remove_file(&socket).context("failed to remove stale socket")?;
    }
    let listener = UnixListener::bind(&socket)
        .with_context(|| format!("failed to bind {}", socket.display()))?;
    info!(socket = %socket.display(), interval = args.interval, "stats helper listening");

    // one client at a time: the engine
    loop {
        let (stream, _) = listener.accept().await.context("accept failed")?;
        info!("engine connected");
        if let Err(e) = serve(stream, Duration::from_secs(args.interval.max(1))).await {
            warn!(error = %e, "engine connection ended");
        } else {
            info!("engine disconnected");
        }
    }
}

/// Serves one engine connection until it closes.
async fn serve(stream: UnixStream, interval: Duration) -> Result<(), TransportError> {
    let (mut reader, mut writer) = stream.into_split();
    let mut registered: HashMap<u32, VmId> = HashMap::new();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            result = read_frame(&mut reader) => {
                let frame = match result {
                    Ok(frame) => frame,
                    Err(e) if e.is_disconnect() => return Ok(()),
                    Err(e) => return Err(e),
                };
                handle_frame(&mut writer, &mut registered, &frame).await?;
            }
            _ = ticker.tick() => {
                push_samples(&mut writer, &mut registered).await?;
            }
        }
    }
}

async fn handle_frame<W: tokio::io::AsyncWrite + Unpin>(
    stream: &mut W,
    registered: &mut HashMap<u32, VmId>,
    frame: &skua_core::wire::Frame,
) -> Result<(), TransportError> {
    let request_id = frame.request_id().map(|(id, _)| id).unwrap_or_default();
    let request: Request = match frame.decode_payload() {
        Ok((_, request)) => request,
        Err(e) => {
            debug!(error = %e, "malformed frame from engine");
            return Ok(());
        }
    };

    match request {
        Request::StatAdd { id, pid } => {
            debug!(%id, pid, "pid registered");
            registered.insert(pid, id);
        }
        Request::StatRemove { pid } => {
            debug!(pid, "pid removed");
            registered.remove(&pid);
        }
        Request::Statistics { id } => {
            let reply = registered
                .iter()
                .find(|(_, vm)| **vm == id)
                .map(|(pid, vm)| (*pid, vm.clone()));
            match reply {
                Some((pid, vm)) => match proc::sample(pid) {
                    Ok(counters) => {
                        let sample = StatsSample {
                            id: vm,
                            pid,
                            timestamp: Utc::now(),
                            cpu_ns: counters.cpu_ns,
                            rss_bytes: counters.rss_bytes,
                        };
                        let frame = wire::encode(
                            WIRE_VERSION,
                            Tag::Success,
                            request_id,
                            &SuccessReply::Stats(sample),
                        )
                        .expect("stats reply encodes");
                        write_raw(stream, &frame).await?;
                    }
                    Err(e) => {
                        registered.remove(&pid);
                        write_raw(stream, &wire::fail(&e.to_string(), request_id, WIRE_VERSION))
                            .await?;
                    }
                },
                None => {
                    write_raw(stream, &wire::fail("unknown vm", request_id, WIRE_VERSION))
                        .await?;
                }
            }
        }
        other => {
            debug!(?other, "request outside the stats protocol");
        }
    }
    Ok(())
}

/// Pushes one sample per registered pid; vanished pids are dropped.
async fn push_samples<W: tokio::io::AsyncWrite + Unpin>(
    stream: &mut W,
    registered: &mut HashMap<u32, VmId>,
) -> Result<(), TransportError> {
    let mut gone = Vec::new();
    let snapshot: Vec<(u32, VmId)> = registered
        .iter()
        .map(|(pid, id)| (*pid, id.clone()))
        .collect();

    for (pid, id) in snapshot {
        match proc::sample(pid) {
            Ok(counters) => {
                let event = Event::Stats(StatsSample {
                    id,
                    pid,
                    timestamp: Utc::now(),
                    cpu_ns: counters.cpu_ns,
                    rss_bytes: counters.rss_bytes,
                });
                let frame = wire::encode(WIRE_VERSION, Tag::StatsSample, 0, &event)
                    .expect("stats event encodes");
                write_raw(stream, &frame).await?;
            }
            Err(e) => {
                debug!(pid, error = %e, "pid vanished, dropping");
                gone.push(pid);
            }
        }
    }
    for pid in gone {
        registered.remove(&pid);
    }
    Ok(())
}

//! skua-daemon - unikernel VM orchestration daemon.
//!
//! Startup order matters: `SIGPIPE` is ignored and the rustls crypto
//! provider installed before any socket work; the console and log helpers
//! are required (the daemon cannot satisfy its contract without them)
//! while the statistics helper is optional; only then is the TLS listener
//! bound. Each accepted connection runs as an independent session task.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use tokio::net::{TcpListener, TcpSocket};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use skua_daemon::engine::vm::UkvmMonitor;
use skua_daemon::engine::Engine;
use skua_daemon::tls::TlsAuthority;
use skua_daemon::{
    helpers, lock_engine, session, SharedEngine, CONSOLE_SOCKET, LISTEN_PORT, LOG_SOCKET,
    STATS_SOCKET,
};

/// skua daemon - certificate-driven unikernel orchestration
#[derive(Parser, Debug)]
#[command(name = "skua-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Working directory holding helper sockets and VM artifacts
    working_dir: PathBuf,

    /// CA certificate (PEM); clients must chain to it
    cacert: PathBuf,

    /// Server certificate (PEM), signed by the CA
    cert: PathBuf,

    /// Server private key (PEM)
    key: PathBuf,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short = 'v', long = "verbosity", action = clap::ArgAction::Count)]
    verbosity: u8,
}

fn init_tracing(verbosity: u8) {
    let default = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Ignores `SIGPIPE` so writes to dead peers surface as errors.
fn ignore_sigpipe() -> Result<()> {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

    let action = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    // SAFETY: installing SIG_IGN for SIGPIPE has no handler code and is
    // done before any other thread exists.
    unsafe { sigaction(Signal::SIGPIPE, &action) }.context("failed to ignore SIGPIPE")?;
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbosity);

    ignore_sigpipe()?;

    // must happen before any TLS configuration is built
    rustls::crypto::ring::default_provider().install_default().ok();

    let runtime = tokio::runtime::Runtime::new().context("failed to create runtime")?;
    runtime.block_on(run(args))
}

async fn run(args: Args) -> Result<()> {
    let workdir = args
        .working_dir
        .canonicalize()
        .with_context(|| format!("working directory {:?}", args.working_dir))?;

    let authority = Arc::new(
        TlsAuthority::load(&args.cacert, &args.cert, &args.key)
            .context("failed to load TLS material")?,
    );

    // console and log helpers are required; stats is best-effort
    let console = helpers::connect_required(&workdir.join(CONSOLE_SOCKET))
        .await
        .context("console helper socket")?;
    let log = helpers::connect_required(&workdir.join(LOG_SOCKET))
        .await
        .context("log helper socket")?;
    let stats = helpers::connect_optional(&workdir.join(STATS_SOCKET))
        .await
        .context("stats helper socket")?;

    let (console_read, console_write) = console.into_split();
    let (console_tx, console_rx) = mpsc::unbounded_channel();
    helpers::start_writer(console_write, console_rx);

    // the log socket is helper-to-engine only; the write half is parked to
    // keep the stream fully open
    let (log_read, _log_write) = log.into_split();

    let (stats_read, stats_tx) = match stats {
        Some(stream) => {
            let (read, write) = stream.into_split();
            let (tx, rx) = mpsc::unbounded_channel();
            helpers::start_writer(write, rx);
            (Some(read), Some(tx))
        }
        None => (None, None),
    };
    let stats_available = stats_tx.is_some();

    let engine: SharedEngine = Arc::new(Mutex::new(Engine::new(
        workdir.clone(),
        authority.ca_der().to_vec(),
        Arc::new(UkvmMonitor),
        console_tx,
        stats_tx,
    )));

    let mut console_feeder = tokio::spawn(helpers::console_feeder(console_read, Arc::clone(&engine)));
    let mut log_feeder = tokio::spawn(helpers::log_feeder(log_read, Arc::clone(&engine)));
    if let Some(read) = stats_read {
        tokio::spawn(helpers::stats_feeder(read, Arc::clone(&engine)));
    }

    let listener = bind_listener().context("failed to bind TLS listener")?;
    info!(
        port = LISTEN_PORT,
        workdir = %workdir.display(),
        stats = stats_available,
        "skua daemon listening"
    );

    let accept_engine = Arc::clone(&engine);
    let accept_authority = Arc::clone(&authority);
    let accept_loop = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((tcp, peer)) => {
                    let engine = Arc::clone(&accept_engine);
                    let authority = Arc::clone(&accept_authority);
                    tokio::spawn(session::serve(tcp, peer, engine, authority));
                }
                Err(e) => {
                    error!(error = %e, "accept failed");
                }
            }
        }
    });

    let mut sigterm = signal(SignalKind::terminate()).context("failed to register SIGTERM")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to register SIGINT")?;

    let outcome = tokio::select! {
        _ = sigterm.recv() => {
            info!("received SIGTERM");
            Ok(())
        }
        _ = sigint.recv() => {
            info!("received SIGINT");
            Ok(())
        }
        result = &mut console_feeder => {
            let e = result.map_or_else(|join| join.to_string(), |e| e.to_string());
            Err(anyhow::anyhow!("console helper lost: {e}"))
        }
        result = &mut log_feeder => {
            let e = result.map_or_else(|join| join.to_string(), |e| e.to_string());
            Err(anyhow::anyhow!("log helper lost: {e}"))
        }
    };

    accept_loop.abort();
    info!("shutting down, destroying live vms");
    lock_engine(&engine).shutdown_all(Utc::now());

    if let Err(e) = &outcome {
        warn!(error = %e, "daemon exiting after helper failure");
    } else {
        info!("daemon shutdown complete");
    }
    outcome
}

/// Binds TCP/1025 with `SO_REUSEADDR` and close-on-exec.
fn bind_listener() -> Result<TcpListener> {
    use std::os::fd::AsRawFd;

    let socket = TcpSocket::new_v4().context("socket")?;
    socket.set_reuseaddr(true).context("SO_REUSEADDR")?;
    let addr: SocketAddr = ([0, 0, 0, 0], LISTEN_PORT).into();
    socket.bind(addr).context("bind")?;

    nix::fcntl::fcntl(
        socket.as_raw_fd(),
        nix::fcntl::FcntlArg::F_SETFD(nix::fcntl::FdFlag::FD_CLOEXEC),
    )
    .context("FD_CLOEXEC")?;

    socket.listen(1024).context("listen")
}

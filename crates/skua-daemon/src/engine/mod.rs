//! The engine: session authorization, resource accounting, VM lifecycle,
//! and event fan-out.
//!
//! One [`Engine`] value owns all mutable daemon state. Handlers are
//! synchronous: they complete every state mutation before returning and
//! emit outbound frames by pushing into per-session and per-helper
//! channels, so no task ever observes a torn intermediate state. The
//! daemon wraps the engine in a mutex that is never held across an
//! `await`.
//!
//! Sessions are keyed by peer socket address. A session enters through
//! [`Engine::handle_initial`], which verifies the presented certificate
//! chain against the trust root and the current CRL snapshot, then
//! classifies the session: a CRL announcement installs a revocation list
//! and closes, a VM certificate runs the admission algebra and hands back
//! a create ticket, and anything else enters the command loop.

pub mod crl;
pub mod vm;

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use skua_core::id::VmId;
use skua_core::policy::chain::{
    crl_issuer_cn, crl_number, revoked_serials, verify_chain, CertRef, LeafClass,
};
use skua_core::policy::{PermissionSet, Permission, PolicyError};
use skua_core::resources::{check_admission, LiveDraw};
use skua_core::ring::{Ring, RING_SLOTS};
use skua_core::wire::{self, Event, FailureReply, Frame, Request, SuccessReply, Tag};
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

use crl::CrlStore;
use vm::{Monitor, RunningVm, VmMeta};

/// Errors surfaced to the session task from `handle_initial`.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The request was refused; a failure frame has already been queued to
    /// the session and it should be closed politely.
    #[error("{0}")]
    Rejected(String),

    /// The chain failed cryptographic verification; the session is closed
    /// silently after logging.
    #[error("handshake: {0}")]
    Handshake(#[from] PolicyError),
}

/// What the session task should do after `handle_initial`.
#[derive(Debug)]
pub enum NextAction {
    /// Enter the command loop.
    Loop,
    /// Flush queued replies and close the session.
    Close,
    /// Run the spawn continuation, then close.
    Create(Box<CreateTicket>),
}

/// Everything the spawn continuation needs outside the engine lock.
#[derive(Debug)]
pub struct CreateTicket {
    /// Full id of the VM being created.
    pub id: VmId,
    /// Launch parameters.
    pub meta: VmMeta,
    /// Executable image bytes (already inflated).
    pub image: Vec<u8>,
    /// The creating session, addressed for the final reply.
    pub requester: SocketAddr,
}

/// Whether the command loop should continue after a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep reading commands.
    Continue,
    /// Close the session.
    Close,
}

/// A connected TLS session as the engine sees it.
#[derive(Debug)]
struct Session {
    prefix: Vec<String>,
    permissions: PermissionSet,
    tx: UnboundedSender<Bytes>,
    cancel: CancellationToken,
    cert_refs: Vec<CertRef>,
}

/// The three per-VM subscription streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Stream {
    Console,
    Log,
    Stats,
}

#[derive(Debug, Default)]
struct Subscriptions {
    console: HashMap<VmId, HashSet<SocketAddr>>,
    log: HashMap<VmId, HashSet<SocketAddr>>,
    stats: HashMap<VmId, HashSet<SocketAddr>>,
}

impl Subscriptions {
    fn map(&self, stream: Stream) -> &HashMap<VmId, HashSet<SocketAddr>> {
        match stream {
            Stream::Console => &self.console,
            Stream::Log => &self.log,
            Stream::Stats => &self.stats,
        }
    }

    fn map_mut(&mut self, stream: Stream) -> &mut HashMap<VmId, HashSet<SocketAddr>> {
        match stream {
            Stream::Console => &mut self.console,
            Stream::Log => &mut self.log,
            Stream::Stats => &mut self.stats,
        }
    }

    fn subscribe(&mut self, stream: Stream, id: VmId, addr: SocketAddr) {
        self.map_mut(stream).entry(id).or_default().insert(addr);
    }

    fn subscribers(&self, stream: Stream, id: &VmId) -> Vec<SocketAddr> {
        self.map(stream)
            .get(id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// All sessions subscribed to any stream of `id`.
    fn all_subscribers(&self, id: &VmId) -> HashSet<SocketAddr> {
        let mut out = HashSet::new();
        for stream in [Stream::Console, Stream::Log, Stream::Stats] {
            if let Some(set) = self.map(stream).get(id) {
                out.extend(set.iter().copied());
            }
        }
        out
    }

    fn drop_vm(&mut self, id: &VmId) {
        self.console.remove(id);
        self.log.remove(id);
        self.stats.remove(id);
    }

    fn drop_session(&mut self, addr: SocketAddr) {
        for map in [&mut self.console, &mut self.log, &mut self.stats] {
            map.retain(|_, set| {
                set.remove(&addr);
                !set.is_empty()
            });
        }
    }
}

/// An entry in the engine's log ring.
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Full id of the VM the line belongs to.
    pub id: VmId,
    /// The line.
    pub line: String,
}

/// The engine state.
pub struct Engine {
    workdir: PathBuf,
    version: u16,
    ca_der: Vec<u8>,
    monitor: Arc<dyn Monitor>,
    console_tx: UnboundedSender<Bytes>,
    stats_tx: Option<UnboundedSender<Bytes>>,
    vms: HashMap<VmId, RunningVm>,
    sessions: HashMap<SocketAddr, Session>,
    subs: Subscriptions,
    crls: CrlStore,
    ring: Ring<LogEntry>,
    stat_token: u32,
    stat_waiters: HashMap<u32, (SocketAddr, u32)>,
}

impl Engine {
    /// Creates an engine with no sessions and no VMs.
    #[must_use]
    pub fn new(
        workdir: PathBuf,
        ca_der: Vec<u8>,
        monitor: Arc<dyn Monitor>,
        console_tx: UnboundedSender<Bytes>,
        stats_tx: Option<UnboundedSender<Bytes>>,
    ) -> Self {
        Self {
            workdir,
            version: wire::WIRE_VERSION,
            ca_der,
            monitor,
            console_tx,
            stats_tx,
            vms: HashMap::new(),
            sessions: HashMap::new(),
            subs: Subscriptions::default(),
            crls: CrlStore::new(),
            ring: Ring::new(RING_SLOTS),
            stat_token: 0,
            stat_waiters: HashMap::new(),
        }
    }

    /// The working directory VM artifacts are placed in.
    #[must_use]
    pub fn workdir(&self) -> &std::path::Path {
        &self.workdir
    }

    /// Snapshot of installed CRLs for the next TLS handshake.
    #[must_use]
    pub fn crl_snapshot(&self) -> skua_core::policy::chain::CrlSnapshot {
        self.crls.snapshot()
    }

    /// The hypervisor invocation used for spawn continuations.
    #[must_use]
    pub fn monitor(&self) -> Arc<dyn Monitor> {
        Arc::clone(&self.monitor)
    }

    /// Destroys every live VM for daemon shutdown.
    pub fn shutdown_all(&mut self, now: DateTime<Utc>) {
        let ids: Vec<VmId> = self.vms.keys().cloned().collect();
        for id in &ids {
            self.preempt_vm_with_reason(id, "shutting down", now);
        }
    }

    /// Number of live VMs (including in-flight spawns).
    #[must_use]
    pub fn vm_count(&self) -> usize {
        self.vms.len()
    }

    // -----------------------------------------------------------------
    // Session entry
    // -----------------------------------------------------------------

    /// Authenticates and classifies a fresh session.
    ///
    /// Verifies the chain against the trust root with the current CRL
    /// snapshot at `now`, derives the session's prefix and permissions,
    /// and dispatches on the leaf class. On `Ok(NextAction::Create)` a
    /// pending VM entry already holds the id and its budget; the caller
    /// must finish with [`Engine::commit_create`] or
    /// [`Engine::abort_create`].
    ///
    /// # Errors
    ///
    /// [`EngineError::Handshake`] for cryptographic failures (close
    /// silently); [`EngineError::Rejected`] when a failure reply has been
    /// queued.
    pub fn handle_initial(
        &mut self,
        addr: SocketAddr,
        tx: UnboundedSender<Bytes>,
        cancel: CancellationToken,
        chain: &[Vec<u8>],
        now: DateTime<Utc>,
    ) -> Result<NextAction, EngineError> {
        let snapshot = self.crls.snapshot();
        let verified = match verify_chain(chain, &self.ca_der, &snapshot, now, self.version) {
            Ok(verified) => verified,
            Err(e) if is_crypto(&e) => return Err(EngineError::Handshake(e)),
            Err(e) => {
                let message = e.to_string();
                let _ = tx.send(wire::fail(&message, 0, self.version));
                return Err(EngineError::Rejected(message));
            }
        };

        info!(
            peer = %addr,
            prefix = %verified.prefix.join("/"),
            name = %verified.name,
            "session authenticated"
        );

        self.sessions.insert(
            addr,
            Session {
                prefix: verified.prefix.clone(),
                permissions: verified.permissions.clone(),
                tx,
                cancel,
                cert_refs: verified.refs.clone(),
            },
        );

        match verified.class {
            LeafClass::Crl(der) => {
                match self.install_crl(addr, &der, &verified.permissions, chain, now) {
                    Ok(()) => {
                        self.send_to(addr, wire::ok(0, self.version));
                        Ok(NextAction::Close)
                    }
                    Err(message) => {
                        self.send_to(addr, wire::fail(&message, 0, self.version));
                        self.handle_disconnect(addr);
                        Err(EngineError::Rejected(message))
                    }
                }
            }
            LeafClass::Vm(config) => {
                let force = verified.permissions.allows(Permission::ForceCreate);
                if !verified.permissions.allows(Permission::Create) && !force {
                    return Err(self.refuse(addr, "permission denied"));
                }

                let id = match VmId::from_prefix(&verified.prefix, &verified.name) {
                    Ok(id) => id,
                    Err(e) => return Err(self.refuse(addr, &e.to_string())),
                };

                if self.vms.contains_key(&id) {
                    if force {
                        self.preempt_vm(&id, now);
                    } else {
                        return Err(self.refuse(addr, "already exists"));
                    }
                }

                let admission = {
                    let draws: Vec<LiveDraw<'_>> = self
                        .vms
                        .values()
                        .map(|running| LiveDraw {
                            id: &running.id,
                            memory: running.meta.requested_memory,
                            block: running.meta.block_size.unwrap_or(0),
                        })
                        .collect();
                    check_admission(&verified.delegations, draws.iter().copied(), &config)
                };
                if let Err(e) = admission {
                    return Err(self.refuse(addr, &e.to_string()));
                }

                let image = match config.image.executable() {
                    Ok(image) => image,
                    Err(e) => return Err(self.refuse(addr, &e.to_string())),
                };

                let meta = VmMeta::from_config(&config);
                let stem = id.file_stem();
                // reserve the id and its budget before the first await
                self.vms.insert(
                    id.clone(),
                    RunningVm {
                        id: id.clone(),
                        meta: meta.clone(),
                        pid: None,
                        started: None,
                        cert_refs: verified.refs,
                        image_path: self.workdir.join(format!("{stem}.img")),
                        console_path: self.workdir.join(format!("{stem}.fifo")),
                    },
                );

                Ok(NextAction::Create(Box::new(CreateTicket {
                    id,
                    meta,
                    image,
                    requester: addr,
                })))
            }
            LeafClass::Delegation => Ok(NextAction::Loop),
        }
    }

    fn refuse(&mut self, addr: SocketAddr, message: &str) -> EngineError {
        self.send_to(addr, wire::fail(message, 0, self.version));
        self.handle_disconnect(addr);
        EngineError::Rejected(message.to_string())
    }

    // -----------------------------------------------------------------
    // Create continuation
    // -----------------------------------------------------------------

    /// Registers the spawned monitor for a pending create.
    ///
    /// Returns `false` when the pending entry vanished while the spawn was
    /// in flight (a concurrent revocation); the caller must kill the
    /// spawned pid.
    pub fn commit_create(
        &mut self,
        id: &VmId,
        requester: SocketAddr,
        pid: u32,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(running) = self.vms.get_mut(id) else {
            warn!(%id, pid, "pending vm vanished during spawn, killing monitor");
            return false;
        };
        running.pid = Some(pid);
        running.started = Some(now);

        info!(%id, pid, "vm started");
        self.console_ctl(Tag::ConsoleAttach, id);
        self.stats_ctl(Request::StatAdd {
            id: id.clone(),
            pid,
        });
        self.send_to(
            requester,
            wire::encode(self.version, Tag::Success, 0, &SuccessReply::Created(id.clone()))
                .expect("created reply encodes"),
        );
        true
    }

    /// Abandons a pending create after a spawn failure.
    pub fn abort_create(&mut self, id: &VmId, requester: SocketAddr, message: &str) {
        self.vms.remove(id);
        warn!(%id, message, "vm spawn failed");
        self.send_to(requester, wire::fail(message, 0, self.version));
    }

    // -----------------------------------------------------------------
    // Command loop
    // -----------------------------------------------------------------

    /// Dispatches one command frame from a `Loop` session.
    pub fn handle_command(&mut self, addr: SocketAddr, frame: &Frame) -> Flow {
        let Some(session) = self.sessions.get(&addr) else {
            return Flow::Close;
        };
        let prefix = session.prefix.clone();
        let permissions = session.permissions.clone();

        if frame.header.version != self.version {
            self.send_to(addr, wire::fail("protocol version mismatch", 0, self.version));
            return Flow::Close;
        }

        let request_id = match frame.request_id() {
            Ok((id, _)) => id,
            Err(_) => {
                self.send_to(addr, wire::fail("truncated frame", 0, self.version));
                return Flow::Close;
            }
        };

        let Some(tag) = frame.header.known_tag() else {
            self.send_to(
                addr,
                wire::fail("unknown command", request_id, self.version),
            );
            return Flow::Continue;
        };

        let request: Request = match frame.decode_payload() {
            Ok((_, request)) => request,
            Err(e) => {
                debug!(peer = %addr, error = %e, "malformed command body");
                self.send_to(
                    addr,
                    wire::fail("malformed request", request_id, self.version),
                );
                return Flow::Close;
            }
        };

        match (tag, request) {
            (Tag::Info, Request::Info { glob }) => {
                self.cmd_info(addr, request_id, &prefix, &permissions, &glob);
            }
            (Tag::Destroy, Request::Destroy { id }) => {
                self.cmd_destroy(addr, request_id, &prefix, &permissions, &id);
            }
            (Tag::Console, Request::Console { id }) => {
                self.cmd_subscribe(addr, request_id, &prefix, &permissions, id, Stream::Console);
            }
            (Tag::Log, Request::Log { id, since }) => {
                self.cmd_log(addr, request_id, &prefix, &permissions, id, since);
            }
            (Tag::Statistics, Request::Statistics { id }) => {
                self.cmd_statistics(addr, request_id, &prefix, &permissions, &id);
            }
            (Tag::CrlFetch, Request::CrlFetch { issuer }) => {
                self.cmd_crl_fetch(addr, request_id, &permissions, &issuer);
            }
            (tag, _) => {
                debug!(peer = %addr, ?tag, "tag outside the command space");
                self.send_to(
                    addr,
                    wire::fail("unknown command", request_id, self.version),
                );
            }
        }
        Flow::Continue
    }

    fn cmd_info(
        &mut self,
        addr: SocketAddr,
        request_id: u32,
        prefix: &[String],
        permissions: &PermissionSet,
        glob: &str,
    ) {
        if !permissions.allows(Permission::Info) {
            return self.deny(addr, request_id);
        }
        let mut summaries: Vec<_> = self
            .vms
            .values()
            .filter(|vm| vm.id.matches_glob(prefix, glob))
            .map(RunningVm::summary)
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        self.send_to(
            addr,
            wire::encode(
                self.version,
                Tag::Success,
                request_id,
                &SuccessReply::Info(summaries),
            )
            .expect("info reply encodes"),
        );
    }

    fn cmd_destroy(
        &mut self,
        addr: SocketAddr,
        request_id: u32,
        prefix: &[String],
        permissions: &PermissionSet,
        id: &VmId,
    ) {
        if !permissions.allows(Permission::Create) && !permissions.allows(Permission::ForceCreate)
        {
            return self.deny(addr, request_id);
        }
        // ids outside the caller's prefix are invisible
        let Some(vm) = self.vms.get(id).filter(|vm| vm.id.starts_with(prefix)) else {
            return self.send_to(addr, wire::fail("no such vm", request_id, self.version));
        };
        let Some(pid) = vm.pid else {
            return self.send_to(addr, wire::fail("vm is starting", request_id, self.version));
        };
        // cleanup happens in the exit callback once the monitor is gone
        match self.monitor.kill(pid) {
            Ok(()) => self.send_to(addr, wire::ok(request_id, self.version)),
            Err(e) => self.send_to(addr, wire::fail(&e.to_string(), request_id, self.version)),
        }
    }

    fn cmd_subscribe(
        &mut self,
        addr: SocketAddr,
        request_id: u32,
        prefix: &[String],
        permissions: &PermissionSet,
        id: VmId,
        stream: Stream,
    ) {
        let required = match stream {
            Stream::Console => Permission::Console,
            Stream::Log => Permission::Log,
            Stream::Stats => Permission::Statistics,
        };
        if !permissions.allows(required) {
            return self.deny(addr, request_id);
        }
        if !self.vms.contains_key(&id) || !id.starts_with(prefix) {
            return self.send_to(addr, wire::fail("no such vm", request_id, self.version));
        }
        self.subs.subscribe(stream, id, addr);
        self.send_to(addr, wire::ok(request_id, self.version));
    }

    fn cmd_log(
        &mut self,
        addr: SocketAddr,
        request_id: u32,
        prefix: &[String],
        permissions: &PermissionSet,
        id: VmId,
        since: Option<DateTime<Utc>>,
    ) {
        self.cmd_subscribe(addr, request_id, prefix, permissions, id.clone(), Stream::Log);
        if !self.subs.subscribers(Stream::Log, &id).contains(&addr) {
            // subscription was refused; no replay
            return;
        }
        if let Some(since) = since {
            for (timestamp, entry) in self.ring.read_since(since) {
                if entry.id != id {
                    continue;
                }
                let frame = self.event_frame(
                    Tag::LogLine,
                    &Event::Log {
                        id: entry.id,
                        timestamp,
                        line: entry.line,
                    },
                );
                self.send_to(addr, frame);
            }
        }
    }

    fn cmd_statistics(
        &mut self,
        addr: SocketAddr,
        request_id: u32,
        prefix: &[String],
        permissions: &PermissionSet,
        id: &VmId,
    ) {
        if !permissions.allows(Permission::Statistics) {
            return self.deny(addr, request_id);
        }
        if !self.vms.contains_key(id) || !id.starts_with(prefix) {
            return self.send_to(addr, wire::fail("no such vm", request_id, self.version));
        }
        if self.stats_tx.is_none() {
            return self.send_to(
                addr,
                wire::fail("statistics unavailable", request_id, self.version),
            );
        }
        self.stat_token = self.stat_token.wrapping_add(1);
        let token = self.stat_token;
        self.stat_waiters.insert(token, (addr, request_id));
        self.subs.subscribe(Stream::Stats, id.clone(), addr);
        let frame = wire::encode(
            self.version,
            Tag::Statistics,
            token,
            &Request::Statistics { id: id.clone() },
        )
        .expect("statistics request encodes");
        self.stats_send(frame);
    }

    fn cmd_crl_fetch(
        &mut self,
        addr: SocketAddr,
        request_id: u32,
        permissions: &PermissionSet,
        issuer: &str,
    ) {
        if !permissions.allows(Permission::Crl) {
            return self.deny(addr, request_id);
        }
        match self.crls.get(issuer) {
            Some(stored) => {
                let frame = wire::encode(
                    self.version,
                    Tag::Success,
                    request_id,
                    &SuccessReply::Crl(stored.der.clone()),
                )
                .expect("crl reply encodes");
                self.send_to(addr, frame);
            }
            None => self.send_to(
                addr,
                wire::fail("no revocation list", request_id, self.version),
            ),
        }
    }

    fn deny(&mut self, addr: SocketAddr, request_id: u32) {
        self.send_to(addr, wire::fail("permission denied", request_id, self.version));
    }

    // -----------------------------------------------------------------
    // Helper feeds
    // -----------------------------------------------------------------

    /// Routes a frame pushed by the console helper.
    pub fn handle_cons(&mut self, frame: &Frame) {
        match frame.header.known_tag() {
            Some(Tag::ConsoleLine) => {
                let Ok((_, Event::Console { id, timestamp, line })) =
                    frame.decode_payload::<Event>()
                else {
                    debug!("malformed console event dropped");
                    return;
                };
                let subscribers = self.subs.subscribers(Stream::Console, &id);
                if subscribers.is_empty() && !self.vms.contains_key(&id) {
                    debug!(%id, "console line for unknown vm dropped");
                    return;
                }
                let event = self.event_frame(
                    Tag::ConsoleLine,
                    &Event::Console {
                        id,
                        timestamp,
                        line,
                    },
                );
                for addr in subscribers {
                    self.send_to(addr, event.clone());
                }
            }
            // attach/detach acknowledgements are uninteresting
            Some(tag) if tag.is_reply() => {}
            _ => debug!(tag = frame.header.tag, "unexpected frame from console helper"),
        }
    }

    /// Routes a frame pushed by the log helper.
    pub fn handle_log(&mut self, frame: &Frame) {
        match frame.header.known_tag() {
            Some(Tag::LogLine) => {
                let Ok((_, Event::Log { id, timestamp, line })) = frame.decode_payload::<Event>()
                else {
                    debug!("malformed log event dropped");
                    return;
                };
                if !self.vms.contains_key(&id)
                    && self.subs.subscribers(Stream::Log, &id).is_empty()
                {
                    debug!(%id, "log line for unknown vm dropped");
                    return;
                }
                self.ring.append(
                    timestamp,
                    LogEntry {
                        id: id.clone(),
                        line: line.clone(),
                    },
                );
                let event = self.event_frame(
                    Tag::LogLine,
                    &Event::Log {
                        id: id.clone(),
                        timestamp,
                        line,
                    },
                );
                for addr in self.subs.subscribers(Stream::Log, &id) {
                    self.send_to(addr, event.clone());
                }
            }
            _ => debug!(tag = frame.header.tag, "unexpected frame from log helper"),
        }
    }

    /// Routes a frame pushed by the stats helper.
    pub fn handle_stat(&mut self, frame: &Frame) {
        match frame.header.known_tag() {
            Some(Tag::Success) => {
                if let Ok((token, reply)) = frame.decode_payload::<SuccessReply>() {
                    if let Some((addr, request_id)) = self.stat_waiters.remove(&token) {
                        let frame =
                            wire::encode(self.version, Tag::Success, request_id, &reply)
                                .expect("stats relay encodes");
                        self.send_to(addr, frame);
                    }
                }
            }
            Some(Tag::Failure) => {
                if let Ok((token, reply)) = frame.decode_payload::<FailureReply>() {
                    if let Some((addr, request_id)) = self.stat_waiters.remove(&token) {
                        self.send_to(addr, wire::fail(&reply.message, request_id, self.version));
                    }
                }
            }
            Some(Tag::StatsSample) => {
                if let Ok((_, Event::Stats(sample))) = frame.decode_payload::<Event>() {
                    let subscribers = self.subs.subscribers(Stream::Stats, &sample.id);
                    if subscribers.is_empty() {
                        debug!(id = %sample.id, "stats sample without subscribers dropped");
                        return;
                    }
                    let event = self.event_frame(Tag::StatsSample, &Event::Stats(sample));
                    for addr in subscribers {
                        self.send_to(addr, event.clone());
                    }
                }
            }
            _ => debug!(tag = frame.header.tag, "unexpected frame from stats helper"),
        }
    }

    /// Demotes statistics after the helper connection failed.
    ///
    /// Pending one-shot requests are answered with a failure; subsequent
    /// `statistics` commands fail fast.
    pub fn stats_lost(&mut self) {
        if self.stats_tx.take().is_some() {
            warn!("statistics helper lost, demoting statistics commands");
        }
        let waiters: Vec<_> = self.stat_waiters.drain().collect();
        for (_, (addr, request_id)) in waiters {
            self.send_to(
                addr,
                wire::fail("statistics unavailable", request_id, self.version),
            );
        }
    }

    // -----------------------------------------------------------------
    // Lifecycle callbacks
    // -----------------------------------------------------------------

    /// Handles the exit of a spawned monitor.
    ///
    /// No-op when the VM was already retired (pre-emption or revocation
    /// replaced it) or the pid does not match the live entry.
    pub fn handle_shutdown(
        &mut self,
        id: &VmId,
        pid: u32,
        reason: vm::ExitReason,
        now: DateTime<Utc>,
    ) {
        let matches = self
            .vms
            .get(id)
            .is_some_and(|running| running.pid == Some(pid));
        if !matches {
            debug!(%id, pid, "exit for retired vm ignored");
            return;
        }
        let running = self.vms.remove(id).expect("checked above");
        info!(%id, pid, %reason, "vm exited");
        self.retire(&running, &reason.to_string(), now);
    }

    /// Removes a live VM immediately, synthesizing a terminal event.
    ///
    /// Used by force-create pre-emption and CRL revocation, where the id
    /// and its budget must be released before the reply is produced. The
    /// eventual exit callback for the old pid finds no matching entry and
    /// is ignored.
    fn preempt_vm(&mut self, id: &VmId, now: DateTime<Utc>) {
        self.preempt_vm_with_reason(id, "preempted", now);
    }

    /// Common tail of every VM teardown: helper bookkeeping, the terminal
    /// log line, subscriber notification, subscription release.
    fn retire(&mut self, running: &RunningVm, line: &str, now: DateTime<Utc>) {
        if let Some(pid) = running.pid {
            self.stats_ctl(Request::StatRemove { pid });
        }
        self.console_ctl(Tag::ConsoleDetach, &running.id);

        self.ring.append(
            now,
            LogEntry {
                id: running.id.clone(),
                line: line.to_string(),
            },
        );
        let event = self.event_frame(
            Tag::LogLine,
            &Event::Log {
                id: running.id.clone(),
                timestamp: now,
                line: line.to_string(),
            },
        );
        // notify before dropping the subscriptions
        for addr in self.subs.all_subscribers(&running.id) {
            self.send_to(addr, event.clone());
        }
        self.subs.drop_vm(&running.id);
    }

    /// Releases everything a departing session owned.
    pub fn handle_disconnect(&mut self, addr: SocketAddr) {
        if self.sessions.remove(&addr).is_none() {
            return;
        }
        debug!(peer = %addr, "session disconnected");
        self.subs.drop_session(addr);
        self.stat_waiters.retain(|_, (waiter, _)| *waiter != addr);
    }

    // -----------------------------------------------------------------
    // CRL installation
    // -----------------------------------------------------------------

    /// Installs a revocation list announced on a leaf certificate and
    /// destroys every live VM whose chain no longer validates.
    fn install_crl(
        &mut self,
        addr: SocketAddr,
        crl_der: &[u8],
        permissions: &PermissionSet,
        chain: &[Vec<u8>],
        now: DateTime<Utc>,
    ) -> Result<(), String> {
        if !permissions.allows(Permission::Crl) {
            return Err("permission denied".to_string());
        }

        let issuer_cn = crl_issuer_cn(crl_der).map_err(|e| e.to_string())?;
        verify_crl_against_chain(crl_der, &issuer_cn, chain, &self.ca_der)?;

        let number = crl_number(crl_der).map_err(|e| e.to_string())?.unwrap_or_default();
        if !self.crls.install(issuer_cn.clone(), number, crl_der.to_vec()) {
            return Err("stale revocation list".to_string());
        }

        let revoked = revoked_serials(crl_der).map_err(|e| e.to_string())?;
        let hit = |refs: &[CertRef]| {
            refs.iter()
                .any(|r| r.issuer_cn == issuer_cn && revoked.contains(&r.serial))
        };

        let doomed: Vec<VmId> = self
            .vms
            .values()
            .filter(|vm| hit(&vm.cert_refs))
            .map(|vm| vm.id.clone())
            .collect();
        for id in &doomed {
            self.preempt_vm_with_reason(id, "revoked", now);
        }
        info!(
            issuer = %issuer_cn,
            revoked_vms = doomed.len(),
            "revocation list installed"
        );

        // sessions whose chains are now revoked cannot keep operating
        let cancelled: Vec<SocketAddr> = self
            .sessions
            .iter()
            .filter(|(peer, session)| **peer != addr && hit(&session.cert_refs))
            .map(|(peer, _)| *peer)
            .collect();
        for peer in cancelled {
            if let Some(session) = self.sessions.get(&peer) {
                session.cancel.cancel();
            }
        }

        Ok(())
    }

    fn preempt_vm_with_reason(&mut self, id: &VmId, line: &str, now: DateTime<Utc>) {
        let Some(running) = self.vms.remove(id) else {
            return;
        };
        if let Some(pid) = running.pid {
            if let Err(e) = self.monitor.kill(pid) {
                warn!(%id, pid, error = %e, "failed to signal revoked vm");
            }
        }
        info!(%id, reason = line, "vm destroyed");
        self.retire(&running, line, now);
    }

    // -----------------------------------------------------------------
    // Outbound plumbing
    // -----------------------------------------------------------------

    fn event_frame<T: serde::Serialize>(&self, tag: Tag, event: &T) -> Bytes {
        wire::encode(self.version, tag, 0, event).expect("event frame encodes")
    }

    fn send_to(&self, addr: SocketAddr, frame: Bytes) {
        if let Some(session) = self.sessions.get(&addr) {
            // a closed channel means the session is tearing down; the
            // disconnect path cleans up
            let _ = session.tx.send(frame);
        }
    }

    fn console_ctl(&self, tag: Tag, id: &VmId) {
        let frame = wire::encode(
            self.version,
            tag,
            0,
            &Request::ConsoleCtl { id: id.clone() },
        )
        .expect("console control encodes");
        if self.console_tx.send(frame).is_err() {
            warn!("console helper channel closed");
        }
    }

    fn stats_ctl(&self, request: Request) {
        let tag = match request {
            Request::StatAdd { .. } => Tag::StatAdd,
            Request::StatRemove { .. } => Tag::StatRemove,
            _ => return,
        };
        let frame =
            wire::encode(self.version, tag, 0, &request).expect("stats control encodes");
        self.stats_send(frame);
    }

    fn stats_send(&self, frame: Bytes) {
        if let Some(tx) = &self.stats_tx {
            let _ = tx.send(frame);
        }
    }
}

/// Finds the CRL issuer's certificate among the presented chain and the
/// trust root, and verifies the list's signature against it.
fn verify_crl_against_chain(
    crl_der: &[u8],
    issuer_cn: &str,
    chain: &[Vec<u8>],
    ca_der: &[u8],
) -> Result<(), String> {
    let mut last_error = None;
    for candidate in chain.iter().map(Vec::as_slice).chain(Some(ca_der)) {
        let Ok((_, cert)) = X509Certificate::from_der(candidate) else {
            continue;
        };
        let cn = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|attr| attr.as_str().ok());
        if cn != Some(issuer_cn) {
            continue;
        }
        match skua_core::policy::chain::verify_crl(crl_der, candidate) {
            Ok(()) => return Ok(()),
            Err(e) => last_error = Some(e.to_string()),
        }
    }
    Err(last_error.unwrap_or_else(|| "unknown revocation list issuer".to_string()))
}

fn is_crypto(e: &PolicyError) -> bool {
    matches!(
        e,
        PolicyError::Cert(_)
            | PolicyError::BadSignature { .. }
            | PolicyError::OutsideValidity { .. }
            | PolicyError::Revoked { .. }
            | PolicyError::BrokenChain(_)
            | PolicyError::NoCommonName
    )
}

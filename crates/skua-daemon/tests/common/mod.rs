//! Shared helpers for engine scenario tests: certificate chain building
//! with the private policy extensions, a recording fake monitor, and
//! frame plumbing.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use rcgen::{
    BasicConstraints, CertificateParams, CustomExtension, DnType, IsCa, KeyPair, SerialNumber,
};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;

use skua_core::policy::{codec, Permission, PermissionSet, VmImage};
use skua_core::wire::{FailureReply, Frame, Header, Request, SuccessReply, Tag, HEADER_LEN};
use skua_daemon::engine::vm::{Monitor, SpawnError, SpawnSpec, SpawnedVm};
use skua_daemon::engine::Engine;

pub const ARC: &[u64] = &[1, 3, 6, 1, 4, 1, 49836, 42];

pub fn ext(suffix: u64, content: Vec<u8>) -> CustomExtension {
    let mut oid = ARC.to_vec();
    oid.push(suffix);
    CustomExtension::from_oid_content(&oid, content)
}

pub fn version_ext() -> CustomExtension {
    ext(0, codec::encode_uint(0))
}

pub fn perm_ext(permissions: &[Permission]) -> CustomExtension {
    ext(
        42,
        codec::encode_permissions(&permissions.iter().copied().collect::<PermissionSet>()),
    )
}

/// Delegation extensions: vms, memory, cpuids, and internal bridges.
pub fn delegation_exts(vms: u32, memory: u32, cpuids: &[u16], bridges: &[&str]) -> Vec<CustomExtension> {
    let mut out = vec![
        version_ext(),
        ext(1, codec::encode_uint(u64::from(vms))),
        ext(5, codec::encode_uint(u64::from(memory))),
        ext(4, codec::encode_cpuids(&cpuids.iter().copied().collect())),
    ];
    if !bridges.is_empty() {
        let map = bridges
            .iter()
            .map(|name| ((*name).to_string(), skua_core::policy::Bridge::Internal))
            .collect();
        out.push(ext(2, codec::encode_bridges(&map)));
    }
    out
}

/// Leaf VM extensions: cpuid, memory, image, permissions, networks.
pub fn vm_exts(
    cpuid: u16,
    memory: u32,
    image: &[u8],
    permissions: &[Permission],
    networks: &[&str],
) -> Vec<CustomExtension> {
    let mut out = vec![
        version_ext(),
        ext(6, codec::encode_uint(u64::from(cpuid))),
        ext(5, codec::encode_uint(u64::from(memory))),
        ext(9, codec::encode_image(&VmImage::Amd64(image.to_vec()))),
        perm_ext(permissions),
    ];
    if !networks.is_empty() {
        let names: Vec<String> = networks.iter().map(|s| (*s).to_string()).collect();
        out.push(ext(7, codec::encode_strings(&names)));
    }
    out
}

pub struct Issued {
    pub cert: rcgen::Certificate,
    pub key: KeyPair,
}

impl Issued {
    pub fn der(&self) -> Vec<u8> {
        self.cert.der().to_vec()
    }
}

pub struct Authority {
    pub cert: rcgen::Certificate,
    pub key: KeyPair,
}

impl Authority {
    pub fn new() -> Self {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::new()).unwrap();
        params.distinguished_name.push(DnType::CommonName, "root");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let cert = params.self_signed(&key).unwrap();
        Self { cert, key }
    }

    pub fn ca_der(&self) -> Vec<u8> {
        self.cert.der().to_vec()
    }

    pub fn issue(
        &self,
        cn: &str,
        serial: u64,
        extensions: Vec<CustomExtension>,
        is_ca: bool,
    ) -> Issued {
        issue_from(cn, serial, extensions, is_ca, &self.cert, &self.key)
    }

    /// A CRL signed by the root revoking the given serials.
    pub fn crl(&self, revoked: &[u64], number: u64) -> Vec<u8> {
        let params = rcgen::CertificateRevocationListParams {
            this_update: rcgen::date_time_ymd(2024, 1, 1),
            next_update: rcgen::date_time_ymd(4096, 1, 1),
            crl_number: SerialNumber::from(number),
            issuing_distribution_point: None,
            revoked_certs: revoked
                .iter()
                .map(|serial| rcgen::RevokedCertParams {
                    serial_number: SerialNumber::from(*serial),
                    revocation_time: rcgen::date_time_ymd(2024, 1, 1),
                    reason_code: None,
                    invalidity_date: None,
                })
                .collect(),
            key_identifier_method: rcgen::KeyIdMethod::Sha256,
        };
        params.signed_by(&self.cert, &self.key).unwrap().der().to_vec()
    }
}

pub fn issue_from(
    cn: &str,
    serial: u64,
    extensions: Vec<CustomExtension>,
    is_ca: bool,
    issuer: &rcgen::Certificate,
    issuer_key: &KeyPair,
) -> Issued {
    let key = KeyPair::generate().unwrap();
    let mut params = CertificateParams::new(Vec::new()).unwrap();
    params.distinguished_name.push(DnType::CommonName, cn);
    params.serial_number = Some(SerialNumber::from(serial));
    params.custom_extensions = extensions;
    if is_ca {
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    }
    let cert = params.signed_by(&key, issuer, issuer_key).unwrap();
    Issued { cert, key }
}

/// Monitor fake that records kills and never spawns real processes.
#[derive(Debug, Default)]
pub struct FakeMonitor {
    pub kills: Mutex<Vec<u32>>,
}

impl Monitor for FakeMonitor {
    fn spawn(&self, _spec: &SpawnSpec<'_>) -> Result<SpawnedVm, SpawnError> {
        Ok(SpawnedVm {
            pid: 1,
            child: None,
        })
    }

    fn kill(&self, pid: u32) -> Result<(), SpawnError> {
        self.kills.lock().unwrap().push(pid);
        Ok(())
    }
}

impl FakeMonitor {
    pub fn killed(&self) -> Vec<u32> {
        self.kills.lock().unwrap().clone()
    }
}

/// An engine wired to inspectable channels.
pub struct Harness {
    pub engine: Engine,
    pub monitor: Arc<FakeMonitor>,
    pub console_rx: UnboundedReceiver<Bytes>,
    pub stats_rx: Option<UnboundedReceiver<Bytes>>,
    pub workdir: tempfile::TempDir,
}

impl Harness {
    pub fn new(authority: &Authority, with_stats: bool) -> Self {
        let workdir = tempfile::tempdir().unwrap();
        let monitor = Arc::new(FakeMonitor::default());
        let (console_tx, console_rx) = unbounded_channel();
        let (stats_tx, stats_rx) = if with_stats {
            let (tx, rx) = unbounded_channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let engine = Engine::new(
            workdir.path().to_path_buf(),
            authority.ca_der(),
            Arc::clone(&monitor) as Arc<dyn Monitor>,
            console_tx,
            stats_tx,
        );
        Self {
            engine,
            monitor,
            console_rx,
            stats_rx,
            workdir,
        }
    }
}

/// A fake TLS session: an address plus the outbound frame channel.
pub struct Peer {
    pub addr: SocketAddr,
    pub tx: UnboundedSender<Bytes>,
    pub rx: UnboundedReceiver<Bytes>,
    pub cancel: CancellationToken,
}

static NEXT_PORT: AtomicU16 = AtomicU16::new(40_000);

pub fn peer() -> Peer {
    let port = NEXT_PORT.fetch_add(1, Ordering::Relaxed);
    let (tx, rx) = unbounded_channel();
    Peer {
        addr: SocketAddr::from(([127, 0, 0, 1], port)),
        tx,
        rx,
        cancel: CancellationToken::new(),
    }
}

/// Parses raw outbound bytes back into a frame.
pub fn parse_frame(bytes: &Bytes) -> Frame {
    let mut head = [0u8; HEADER_LEN];
    head.copy_from_slice(&bytes[..HEADER_LEN]);
    Frame {
        header: Header::parse(&head),
        body: bytes.slice(HEADER_LEN..),
    }
}

pub fn next_frame(rx: &mut UnboundedReceiver<Bytes>) -> Option<Frame> {
    rx.try_recv().ok().map(|bytes| parse_frame(&bytes))
}

pub fn expect_failure(frame: &Frame) -> String {
    assert_eq!(frame.header.known_tag(), Some(Tag::Failure), "{frame:?}");
    let (_, reply): (u32, FailureReply) = frame.decode_payload().unwrap();
    reply.message
}

pub fn expect_success(frame: &Frame) -> SuccessReply {
    assert_eq!(frame.header.known_tag(), Some(Tag::Success), "{frame:?}");
    let (_, reply): (u32, SuccessReply) = frame.decode_payload().unwrap();
    reply
}

/// Builds a command frame the way a client would.
pub fn command(tag: Tag, request_id: u32, request: &Request) -> Frame {
    let bytes = skua_core::wire::encode(skua_core::wire::WIRE_VERSION, tag, request_id, request)
        .unwrap();
    parse_frame(&bytes)
}

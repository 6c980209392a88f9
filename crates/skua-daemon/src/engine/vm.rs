//! VM lifecycle: spawn contract, running state, exit classification.
//!
//! The hypervisor invocation is abstracted behind [`Monitor`]; the
//! production implementation execs a per-architecture ukvm-style monitor
//! binary with the guest's stdout redirected into the VM's console FIFO.
//! Tests substitute a recording fake.

use std::fmt;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use chrono::{DateTime, Utc};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::process::{Child, Command};

use skua_core::id::VmId;
use skua_core::policy::chain::CertRef;
use skua_core::policy::VmConfig;
use skua_core::wire::VmSummary;

/// Spawn and kill failures.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SpawnError {
    /// The monitor process could not be started.
    #[error("spawn failed: {0}")]
    SpawnFailed(String),

    /// Preparing on-disk artifacts (image, console FIFO) failed.
    #[error("failed to prepare {path:?}: {source}")]
    Prepare {
        /// The artifact being prepared.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Delivering a signal to the monitor failed.
    #[error("kill {1} failed: {0}")]
    KillFailed(String, u32),
}

/// Launch parameters kept on a live VM after the image left memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmMeta {
    /// CPU the VM is pinned to.
    pub cpuid: u16,
    /// Requested memory in MB.
    pub requested_memory: u32,
    /// Requested block storage in MB.
    pub block_size: Option<u32>,
    /// Attached block device name.
    pub block_device: Option<String>,
    /// Attached bridge names.
    pub networks: Vec<String>,
    /// Guest argument vector.
    pub argv: Option<Vec<String>>,
    /// Image architecture, used for monitor selection.
    pub arch: &'static str,
}

impl VmMeta {
    /// Extracts the retained metadata from a validated configuration.
    #[must_use]
    pub fn from_config(config: &VmConfig) -> Self {
        Self {
            cpuid: config.cpuid,
            requested_memory: config.requested_memory,
            block_size: config.block_size,
            block_device: config.block_device.clone(),
            networks: config.networks.clone(),
            argv: config.argv.clone(),
            arch: config.image.arch(),
        }
    }
}

/// A live (or starting) VM.
#[derive(Debug)]
pub struct RunningVm {
    /// Full id.
    pub id: VmId,
    /// Retained launch parameters.
    pub meta: VmMeta,
    /// Monitor pid; `None` while the spawn continuation is in flight.
    pub pid: Option<u32>,
    /// Wall-clock start; `None` while the spawn continuation is in flight.
    pub started: Option<DateTime<Utc>>,
    /// Chain identities for revocation re-checks.
    pub cert_refs: Vec<CertRef>,
    /// Path of the image file in the working directory.
    pub image_path: PathBuf,
    /// Path of the console FIFO the monitor writes to.
    pub console_path: PathBuf,
}

impl RunningVm {
    /// The `info` projection of this VM.
    #[must_use]
    pub fn summary(&self) -> VmSummary {
        VmSummary {
            id: self.id.clone(),
            cpuid: self.meta.cpuid,
            memory: self.meta.requested_memory,
            networks: self.meta.networks.clone(),
            block_device: self.meta.block_device.clone(),
            pid: self.pid,
            started: self.started,
        }
    }
}

/// Why a monitor process exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Normal exit with a status code.
    Exited(i32),
    /// Terminated by a signal.
    Signalled(i32),
    /// Stopped by a signal.
    Stopped(i32),
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited {code}"),
            Self::Signalled(signal) => write!(f, "signalled {signal}"),
            Self::Stopped(signal) => write!(f, "stopped {signal}"),
        }
    }
}

impl ExitReason {
    /// Classifies a wait status.
    #[must_use]
    pub fn from_status(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;

        if let Some(code) = status.code() {
            Self::Exited(code)
        } else if let Some(signal) = status.signal() {
            Self::Signalled(signal)
        } else if let Some(signal) = status.stopped_signal() {
            Self::Stopped(signal)
        } else {
            Self::Exited(-1)
        }
    }
}

/// Everything the monitor needs to start one VM.
#[derive(Debug)]
pub struct SpawnSpec<'a> {
    /// Full id of the VM.
    pub id: &'a VmId,
    /// Image file, already written to the working directory.
    pub image_path: &'a Path,
    /// Console FIFO, already created.
    pub console_path: &'a Path,
    /// Launch parameters.
    pub meta: &'a VmMeta,
}

/// The result of a successful spawn.
#[derive(Debug)]
pub struct SpawnedVm {
    /// Pid of the monitor process.
    pub pid: u32,
    /// Child handle for the wait task; fakes return `None`.
    pub child: Option<Child>,
}

/// Abstract hypervisor invocation.
///
/// Only the dedicated wait task may reap a spawned child; `kill` delivers
/// the termination signal and relies on the exit callback for cleanup.
pub trait Monitor: Send + Sync {
    /// Starts the monitor for one VM.
    ///
    /// # Errors
    ///
    /// Returns [`SpawnError::SpawnFailed`] if the process cannot be started.
    fn spawn(&self, spec: &SpawnSpec<'_>) -> Result<SpawnedVm, SpawnError>;

    /// Sends SIGTERM to a previously spawned monitor.
    ///
    /// # Errors
    ///
    /// Returns [`SpawnError::KillFailed`] if the signal cannot be delivered.
    fn kill(&self, pid: u32) -> Result<(), SpawnError>;
}

/// Production monitor: execs `skua-monitor.hvt` (amd64) or
/// `skua-monitor.spt` (arm64) from the daemon's binary directory or
/// `PATH`.
#[derive(Debug, Default)]
pub struct UkvmMonitor;

impl UkvmMonitor {
    fn binary(arch: &str) -> &'static str {
        match arch {
            "arm64" => "skua-monitor.spt",
            _ => "skua-monitor.hvt",
        }
    }
}

impl Monitor for UkvmMonitor {
    fn spawn(&self, spec: &SpawnSpec<'_>) -> Result<SpawnedVm, SpawnError> {
        // O_RDWR keeps the open from blocking when the console helper has
        // not attached its reader yet.
        let console = OpenOptions::new()
            .read(true)
            .write(true)
            .open(spec.console_path)
            .map_err(|source| SpawnError::Prepare {
                path: spec.console_path.to_path_buf(),
                source,
            })?;

        let mut cmd = Command::new(Self::binary(spec.meta.arch));
        cmd.arg(format!("--mem={}", spec.meta.requested_memory))
            .arg(format!("--cpu={}", spec.meta.cpuid));
        for network in &spec.meta.networks {
            cmd.arg(format!("--net={network}"));
        }
        if let Some(device) = &spec.meta.block_device {
            cmd.arg(format!("--block={device}"));
        }
        cmd.arg(spec.image_path);
        if let Some(argv) = &spec.meta.argv {
            cmd.arg("--").args(argv);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::from(console.try_clone().map_err(|source| {
                SpawnError::Prepare {
                    path: spec.console_path.to_path_buf(),
                    source,
                }
            })?))
            .stderr(Stdio::from(console))
            .kill_on_drop(false);

        let child = cmd
            .spawn()
            .map_err(|e| SpawnError::SpawnFailed(e.to_string()))?;
        let pid = child
            .id()
            .ok_or_else(|| SpawnError::SpawnFailed("no pid for spawned monitor".to_string()))?;

        Ok(SpawnedVm {
            pid,
            child: Some(child),
        })
    }

    fn kill(&self, pid: u32) -> Result<(), SpawnError> {
        #[allow(clippy::cast_possible_wrap)]
        kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
            .map_err(|e| SpawnError::KillFailed(e.to_string(), pid))
    }
}

/// Writes the image file and creates the console FIFO for a VM.
///
/// The image file is overwritten if present (a force-create replaces the
/// previous upload); a stale FIFO from an earlier instance is reused.
///
/// # Errors
///
/// Returns [`SpawnError::Prepare`] on any filesystem failure.
pub async fn prepare_artifacts(
    workdir: &Path,
    id: &VmId,
    image: &[u8],
) -> Result<(PathBuf, PathBuf), SpawnError> {
    let stem = id.file_stem();
    let image_path = workdir.join(format!("{stem}.img"));
    let console_path = workdir.join(format!("{stem}.fifo"));

    tokio::fs::write(&image_path, image)
        .await
        .map_err(|source| SpawnError::Prepare {
            path: image_path.clone(),
            source,
        })?;

    if !console_path.exists() {
        nix::unistd::mkfifo(&console_path, nix::sys::stat::Mode::from_bits_truncate(0o600))
            .map_err(|e| SpawnError::Prepare {
                path: console_path.clone(),
                source: std::io::Error::other(e),
            })?;
    }

    Ok((image_path, console_path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_reason_formats_match_the_wire_contract() {
        assert_eq!(ExitReason::Exited(0).to_string(), "exited 0");
        assert_eq!(ExitReason::Signalled(15).to_string(), "signalled 15");
        assert_eq!(ExitReason::Stopped(19).to_string(), "stopped 19");
    }

    #[tokio::test]
    async fn prepare_writes_image_and_fifo() {
        let dir = tempfile::tempdir().unwrap();
        let id: VmId = "tenant/vm1".parse().unwrap();
        let (image_path, console_path) = prepare_artifacts(dir.path(), &id, b"\x7fELF")
            .await
            .unwrap();

        assert_eq!(tokio::fs::read(&image_path).await.unwrap(), b"\x7fELF");
        let file_type = std::fs::metadata(&console_path).unwrap().file_type();
        assert!(std::os::unix::fs::FileTypeExt::is_fifo(&file_type));

        // second upload overwrites
        prepare_artifacts(dir.path(), &id, b"new").await.unwrap();
        assert_eq!(tokio::fs::read(&image_path).await.unwrap(), b"new");
    }
}

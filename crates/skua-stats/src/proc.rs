//! Counter retrieval from `/proc/<pid>/`.
//!
//! CPU time comes from `/proc/<pid>/stat` (utime + stime jiffies,
//! converted via `_SC_CLK_TCK`), resident memory from
//! `/proc/<pid>/statm` (pages, converted via `_SC_PAGESIZE`). Reads are
//! bounded and fail closed: a vanished or unreadable pid yields an error
//! and the caller drops it from the sample set.

use std::fs;
use std::sync::OnceLock;

use nix::libc;
use thiserror::Error;

/// Maximum bytes read from any proc file.
const MAX_PROC_FILE_SIZE: u64 = 64 * 1024;

/// Proc reading errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProcError {
    /// The proc file could not be read (usually: the pid is gone).
    #[error("failed to read /proc/{pid}/{file}: {source}")]
    Read {
        /// Process id.
        pid: u32,
        /// File under the pid directory.
        file: &'static str,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The proc file content did not parse.
    #[error("failed to parse /proc/{pid}/{file}: {reason}")]
    Parse {
        /// Process id.
        pid: u32,
        /// File under the pid directory.
        file: &'static str,
        /// What went wrong.
        reason: String,
    },
}

/// Runtime-queried clock ticks per second.
fn clk_tck() -> u64 {
    static CLK_TCK: OnceLock<u64> = OnceLock::new();
    *CLK_TCK.get_or_init(|| {
        // SAFETY: sysconf reads system configuration without touching any
        // process state; _SC_CLK_TCK is valid on all POSIX systems.
        let result = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        u64::try_from(result).unwrap_or(100)
    })
}

/// Runtime-queried page size.
fn page_size() -> u64 {
    static PAGE_SIZE: OnceLock<u64> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        // SAFETY: see clk_tck.
        let result = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        u64::try_from(result).unwrap_or(4096)
    })
}

fn read_bounded(pid: u32, file: &'static str) -> Result<String, ProcError> {
    let path = format!("/proc/{pid}/{file}");
    let content = fs::read(&path).map_err(|source| ProcError::Read { pid, file, source })?;
    if content.len() as u64 > MAX_PROC_FILE_SIZE {
        return Err(ProcError::Parse {
            pid,
            file,
            reason: "file unexpectedly large".to_string(),
        });
    }
    String::from_utf8(content).map_err(|_| ProcError::Parse {
        pid,
        file,
        reason: "not UTF-8".to_string(),
    })
}

/// One sample of a process's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Counters {
    /// Cumulative CPU time (user + system) in nanoseconds.
    pub cpu_ns: u64,
    /// Resident set size in bytes.
    pub rss_bytes: u64,
}

/// Reads the current counters for `pid`.
///
/// # Errors
///
/// Returns [`ProcError`] when the pid is gone or the files do not parse.
pub fn sample(pid: u32) -> Result<Counters, ProcError> {
    let stat = read_bounded(pid, "stat")?;
    // the comm field may contain spaces and parentheses; everything of
    // interest comes after the final ')'
    let after_comm = stat.rfind(')').map(|i| &stat[i + 1..]).ok_or_else(|| {
        ProcError::Parse {
            pid,
            file: "stat",
            reason: "missing comm delimiter".to_string(),
        }
    })?;
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    // fields[11] is utime, fields[12] stime (0-indexed after the comm)
    let parse = |index: usize, name: &str| -> Result<u64, ProcError> {
        fields
            .get(index)
            .and_then(|raw| raw.parse::<u64>().ok())
            .ok_or_else(|| ProcError::Parse {
                pid,
                file: "stat",
                reason: format!("bad {name} field"),
            })
    };
    let utime = parse(11, "utime")?;
    let stime = parse(12, "stime")?;
    let ns_per_jiffy = 1_000_000_000 / clk_tck().max(1);
    let cpu_ns = utime.saturating_add(stime).saturating_mul(ns_per_jiffy);

    let statm = read_bounded(pid, "statm")?;
    let resident: u64 = statm
        .split_whitespace()
        .nth(1)
        .and_then(|raw| raw.parse().ok())
        .ok_or_else(|| ProcError::Parse {
            pid,
            file: "statm",
            reason: "bad resident field".to_string(),
        })?;
    let rss_bytes = resident.saturating_mul(page_size());

    Ok(Counters { cpu_ns, rss_bytes })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sampling_the_current_process_works() {
        let counters = sample(std::process::id()).unwrap();
        assert!(counters.rss_bytes > 0);
    }

    #[test]
    fn vanished_pid_reports_read_error() {
        // pid 0 never has a /proc entry accessible this way
        assert!(matches!(sample(0), Err(ProcError::Read { .. })));
    }
}

//! skua-daemon - unikernel VM orchestration daemon library.
//!
//! The daemon accepts mutually-authenticated TLS sessions whose client
//! certificates carry both identity and policy, enforces the delegation
//! resource algebra, runs the per-VM lifecycle, and multiplexes console,
//! log, and statistics streams between helper processes and subscribed
//! sessions.
//!
//! # Modules
//!
//! - [`engine`]: session authorization, resource accounting, VM lifecycle,
//!   event fan-out
//! - [`tls`]: TLS 1.2 listener configuration and the per-connection
//!   chain-of-trust authenticator
//! - [`helpers`]: helper socket writers and background feeders
//! - [`session`]: per-connection task driving the engine

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod engine;
pub mod helpers;
pub mod session;
pub mod tls;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use engine::Engine;

/// TCP port the TLS listener binds.
pub const LISTEN_PORT: u16 = 1025;

/// Console helper socket name inside the working directory.
pub const CONSOLE_SOCKET: &str = "cons.sock";

/// Log helper socket name inside the working directory.
pub const LOG_SOCKET: &str = "log.sock";

/// Statistics helper socket name inside the working directory.
pub const STATS_SOCKET: &str = "stat.sock";

/// The engine behind its session-shared lock.
///
/// The lock is only ever held for the duration of one synchronous handler
/// and never across an `await`.
pub type SharedEngine = Arc<Mutex<Engine>>;

/// Locks the engine, recovering from a poisoned lock.
///
/// Handlers are short and panic-free in practice; should one panic
/// anyway, continuing with the engine state as-is beats taking the whole
/// daemon down.
pub fn lock_engine(engine: &SharedEngine) -> MutexGuard<'_, Engine> {
    engine.lock().unwrap_or_else(PoisonError::into_inner)
}

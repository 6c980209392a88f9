//! # skua-core
//!
//! Core library for skua - a single-host orchestrator for lightweight
//! unikernel virtual machines.
//!
//! This crate provides the protocol and policy building blocks shared by the
//! daemon and its helper processes:
//!
//! - **Wire codec**: the fixed 8-byte framed message format spoken on every
//!   TLS session and helper socket
//! - **Transport**: framed reads/writes over arbitrary async byte streams
//! - **Policy**: the X.509 extension grammar that turns a client certificate
//!   chain into an authorization prefix, a permission set, and (for leaf VM
//!   certificates) a launch configuration
//! - **Resources**: the delegation algebra that bounds what a tenant subtree
//!   may consume
//! - **Ring**: the fixed-size timestamped buffer backing log replay
//!
//! ## Example
//!
//! ```rust
//! use skua_core::id::VmId;
//! use skua_core::wire::{self, Tag};
//!
//! let id: VmId = "tenant/group/vm".parse().unwrap();
//! let frame = wire::fail("no such vm", 7, wire::WIRE_VERSION);
//! assert_eq!(frame[2..4], (Tag::Failure as u16).to_be_bytes());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod id;
pub mod policy;
pub mod resources;
pub mod ring;
pub mod transport;
pub mod wire;

pub use id::VmId;
pub use policy::{Delegation, Permission, PermissionSet, VmConfig, VmImage};

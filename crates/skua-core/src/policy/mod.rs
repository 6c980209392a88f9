//! Certificate-borne policy: permissions, delegations, VM configurations.
//!
//! Client certificates are the daemon's policy datastore. A chain of
//! intermediate certificates delegates resources down a tenant hierarchy;
//! the leaf either names the operations a client may perform, carries a
//! complete VM launch configuration, or announces a revocation list. The
//! payloads live in private X.509 extensions under the
//! `1.3.6.1.4.1.49836.42` arc and are decoded by [`codec`]; [`projection`]
//! lifts them off parsed certificates and [`chain`] validates whole chains.

pub mod chain;
pub mod codec;
mod der;
pub mod projection;

use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while decoding or validating certificate policy.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PolicyError {
    /// DER content ended before the announced length.
    #[error("truncated DER content")]
    Truncated,

    /// Bytes remained after the outermost DER value.
    #[error("trailing bytes")]
    TrailingBytes,

    /// A DER tag other than the expected one was found.
    #[error("unexpected DER tag {found:#04x}, expected {expected:#04x}")]
    UnexpectedTag {
        /// The tag the grammar requires.
        expected: u8,
        /// The tag found in the input.
        found: u8,
    },

    /// An INTEGER was negative or too large for its target type.
    #[error("integer out of range")]
    IntegerRange,

    /// A UTF8String held invalid UTF-8.
    #[error("invalid UTF-8 in string")]
    Utf8,

    /// A CHOICE carried an unknown alternative.
    #[error("unknown choice tag {0:#04x}")]
    UnknownChoice(u8),

    /// A permissions list carried an unknown code.
    #[error("unknown permission code {0}")]
    UnknownPermission(u64),

    /// A required extension was absent.
    #[error("certificate {subject:?} lacks the {extension} extension")]
    MissingExtension {
        /// Subject common name.
        subject: String,
        /// Human name of the missing extension.
        extension: &'static str,
    },

    /// The version extension did not match the engine's version.
    #[error("certificate {subject:?} carries version {found}, engine speaks {expected}")]
    VersionMismatch {
        /// Subject common name.
        subject: String,
        /// Engine version.
        expected: u16,
        /// Version found on the certificate.
        found: u64,
    },

    /// A certificate carried both a VM image and a revocation list.
    #[error("certificate {subject:?} is both a VM and a CRL certificate")]
    VmAndCrl {
        /// Subject common name.
        subject: String,
    },

    /// X.509 structure failed to parse.
    #[error("malformed certificate material: {0}")]
    Cert(String),

    /// A certificate had no common name to derive a label from.
    #[error("certificate without a common name")]
    NoCommonName,

    /// A signature in the chain did not verify.
    #[error("signature of {subject:?} does not verify against its issuer")]
    BadSignature {
        /// Subject common name.
        subject: String,
    },

    /// A certificate was outside its validity window.
    #[error("certificate {subject:?} is not valid at the current time")]
    OutsideValidity {
        /// Subject common name.
        subject: String,
    },

    /// A certificate in the chain has been revoked.
    #[error("certificate {subject:?} is revoked")]
    Revoked {
        /// Subject common name.
        subject: String,
    },

    /// The chain did not link subject to issuer correctly.
    #[error("broken chain: {0}")]
    BrokenChain(String),

    /// A compressed image failed to inflate.
    #[error("image decompression failed: {0}")]
    Decompress(String),
}

/// Operations a leaf certificate may authorize.
///
/// `All` implies every other permission.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    /// Implies every other permission.
    All,
    /// Query live VM configurations.
    Info,
    /// Create and destroy VMs.
    Create,
    /// Create even over an existing VM with the same id.
    ForceCreate,
    /// Manage block devices (reserved; no operation uses it yet).
    Block,
    /// Request statistics samples.
    Statistics,
    /// Subscribe to console streams.
    Console,
    /// Subscribe to log streams.
    Log,
    /// Install and download revocation lists.
    Crl,
}

impl Permission {
    /// Wire code used in the permissions extension.
    #[must_use]
    pub const fn code(self) -> u64 {
        match self {
            Self::All => 0,
            Self::Info => 1,
            Self::Create => 2,
            Self::ForceCreate => 3,
            Self::Block => 4,
            Self::Statistics => 5,
            Self::Console => 6,
            Self::Log => 7,
            Self::Crl => 8,
        }
    }

    /// Decodes a wire code.
    #[must_use]
    pub const fn from_code(code: u64) -> Option<Self> {
        Some(match code {
            0 => Self::All,
            1 => Self::Info,
            2 => Self::Create,
            3 => Self::ForceCreate,
            4 => Self::Block,
            5 => Self::Statistics,
            6 => Self::Console,
            7 => Self::Log,
            8 => Self::Crl,
            _ => return None,
        })
    }
}

/// A set of [`Permission`]s with `All` implication.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSet {
    permissions: BTreeSet<Permission>,
}

impl PermissionSet {
    /// The empty set.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Inserts a permission.
    pub fn insert(&mut self, permission: Permission) {
        self.permissions.insert(permission);
    }

    /// Returns `true` if the set authorizes `permission`.
    #[must_use]
    pub fn allows(&self, permission: Permission) -> bool {
        self.permissions.contains(&Permission::All) || self.permissions.contains(&permission)
    }

    /// Iterates the stored permissions (without `All` expansion).
    pub fn iter(&self) -> impl Iterator<Item = Permission> + '_ {
        self.permissions.iter().copied()
    }
}

impl FromIterator<Permission> for PermissionSet {
    fn from_iter<I: IntoIterator<Item = Permission>>(iter: I) -> Self {
        Self {
            permissions: iter.into_iter().collect(),
        }
    }
}

/// One bridge grant inside a delegation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bridge {
    /// Host-internal bridge; the daemon hands out no addresses.
    Internal,
    /// Externally routed bridge with an address range.
    External {
        /// First address handed to guests.
        start_ip: Ipv4Addr,
        /// Last address handed to guests.
        end_ip: Ipv4Addr,
        /// Default router advertised to guests.
        router_ip: Ipv4Addr,
        /// Prefix length of the attached network.
        netmask: u8,
    },
}

/// Resources a non-leaf certificate grants to its subtree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delegation {
    /// Maximum number of live VMs under this subtree.
    pub vms: u32,
    /// CPU ids VMs in this subtree may be pinned to.
    pub cpuids: BTreeSet<u16>,
    /// Memory budget in MB for the subtree.
    pub memory: u32,
    /// Block storage budget in MB, absent when storage is not delegated.
    pub block: Option<u32>,
    /// Named bridges VMs in this subtree may attach to.
    pub bridges: BTreeMap<String, Bridge>,
}

/// Maximum size an image may inflate to (128 MiB).
pub const MAX_IMAGE_SIZE: u64 = 128 * 1024 * 1024;

/// A unikernel image as carried on a VM certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmImage {
    /// Statically linked amd64 unikernel.
    Amd64(Vec<u8>),
    /// Statically linked arm64 unikernel.
    Arm64(Vec<u8>),
    /// Deflate-compressed amd64 unikernel.
    Amd64Compressed(Vec<u8>),
}

impl VmImage {
    /// The architecture label used for monitor selection.
    #[must_use]
    pub const fn arch(&self) -> &'static str {
        match self {
            Self::Amd64(_) | Self::Amd64Compressed(_) => "amd64",
            Self::Arm64(_) => "arm64",
        }
    }

    /// Raw payload as carried on the certificate.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        match self {
            Self::Amd64(b) | Self::Arm64(b) | Self::Amd64Compressed(b) => b,
        }
    }

    /// The executable image bytes, inflating compressed variants.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Decompress`] if inflation fails or the result
    /// exceeds [`MAX_IMAGE_SIZE`].
    pub fn executable(&self) -> Result<Vec<u8>, PolicyError> {
        match self {
            Self::Amd64(b) | Self::Arm64(b) => Ok(b.clone()),
            Self::Amd64Compressed(b) => {
                let mut decoder =
                    flate2::read::DeflateDecoder::new(&b[..]).take(MAX_IMAGE_SIZE + 1);
                let mut out = Vec::new();
                decoder
                    .read_to_end(&mut out)
                    .map_err(|e| PolicyError::Decompress(e.to_string()))?;
                if out.len() as u64 > MAX_IMAGE_SIZE {
                    return Err(PolicyError::Decompress(format!(
                        "inflated image exceeds {MAX_IMAGE_SIZE} bytes"
                    )));
                }
                Ok(out)
            }
        }
    }
}

/// Launch parameters carried on a leaf VM certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmConfig {
    /// CPU the VM is pinned to; must be delegated at every ancestor level.
    pub cpuid: u16,
    /// Requested memory in MB.
    pub requested_memory: u32,
    /// Requested block storage in MB; set when `block_device` is.
    pub block_size: Option<u32>,
    /// Name of the block device to attach.
    pub block_device: Option<String>,
    /// Bridge names to attach; each must be delegated.
    pub networks: Vec<String>,
    /// The unikernel image.
    pub image: VmImage,
    /// Extra arguments handed to the guest.
    pub argv: Option<Vec<String>>,
}

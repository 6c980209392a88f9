//! The delegation resource algebra.
//!
//! Every ancestor level of a VM's id carries a delegation bounding the
//! whole subtree beneath it: live VM count, memory, pinned CPUs, named
//! bridges, and block storage. Admission walks the levels root-down,
//! subtracts the live draw, and names the first violated constraint in a
//! message suitable for the failure reply.

use thiserror::Error;

use crate::id::VmId;
use crate::policy::{Delegation, VmConfig};

/// The first constraint violated during admission.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum AdmissionError {
    /// The subtree VM count would exceed the delegation.
    #[error("vms: {requested} > {allowed} allowed")]
    Vms {
        /// Count including the candidate.
        requested: u32,
        /// Delegated maximum.
        allowed: u32,
    },

    /// The subtree memory draw would exceed the delegation.
    #[error("memory: {requested} > {remaining} remaining")]
    Memory {
        /// Memory the candidate asks for, in MB.
        requested: u32,
        /// What the delegation still has free, in MB.
        remaining: u32,
    },

    /// The candidate's cpuid is not delegated at this level.
    #[error("cpuid: {0} not delegated")]
    Cpuid(u16),

    /// A requested bridge is not delegated at this level.
    #[error("bridge: {0} not delegated")]
    UnknownBridge(String),

    /// Block storage was requested but not delegated.
    #[error("block: not delegated")]
    BlockNotDelegated,

    /// The subtree block draw would exceed the delegation.
    #[error("block: {requested} > {remaining} remaining")]
    Block {
        /// Block storage the candidate asks for, in MB.
        requested: u32,
        /// What the delegation still has free, in MB.
        remaining: u32,
    },
}

/// A live VM's contribution to the accounting, as seen by admission.
#[derive(Debug, Clone, Copy)]
pub struct LiveDraw<'a> {
    /// Full id of the live VM.
    pub id: &'a VmId,
    /// Requested memory in MB.
    pub memory: u32,
    /// Requested block storage in MB, if any.
    pub block: u32,
}

/// Checks a candidate VM against every delegation level.
///
/// `levels` pairs each ancestor prefix (root-most first) with its
/// delegation, as produced by chain verification; `live` is the current
/// set of live VMs. The candidate id itself must not be counted in `live`.
///
/// # Errors
///
/// Returns the first violated constraint, walking levels root-down and
/// checking, per level: VM count, memory, cpuid, bridges, block.
pub fn check_admission<'a>(
    levels: &[(Vec<String>, Delegation)],
    live: impl Iterator<Item = LiveDraw<'a>> + Clone,
    config: &VmConfig,
) -> Result<(), AdmissionError> {
    let requested_block = config.block_size.unwrap_or(0);

    for (prefix, delegation) in levels {
        let under: Vec<LiveDraw<'a>> = live
            .clone()
            .filter(|draw| draw.id.starts_with(prefix))
            .collect();

        let count = u32::try_from(under.len()).unwrap_or(u32::MAX);
        if count.saturating_add(1) > delegation.vms {
            return Err(AdmissionError::Vms {
                requested: count.saturating_add(1),
                allowed: delegation.vms,
            });
        }

        let used_memory: u32 = under.iter().map(|d| d.memory).sum();
        let remaining = delegation.memory.saturating_sub(used_memory);
        if config.requested_memory > remaining {
            return Err(AdmissionError::Memory {
                requested: config.requested_memory,
                remaining,
            });
        }

        if !delegation.cpuids.contains(&config.cpuid) {
            return Err(AdmissionError::Cpuid(config.cpuid));
        }

        for network in &config.networks {
            if !delegation.bridges.contains_key(network) {
                return Err(AdmissionError::UnknownBridge(network.clone()));
            }
        }

        if config.block_device.is_some() {
            let Some(block_budget) = delegation.block else {
                return Err(AdmissionError::BlockNotDelegated);
            };
            let used_block: u32 = under.iter().map(|d| d.block).sum();
            let remaining = block_budget.saturating_sub(used_block);
            if requested_block > remaining {
                return Err(AdmissionError::Block {
                    requested: requested_block,
                    remaining,
                });
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::VmImage;
    use std::collections::{BTreeMap, BTreeSet};

    fn delegation(vms: u32, memory: u32, cpuids: &[u16]) -> Delegation {
        Delegation {
            vms,
            memory,
            cpuids: cpuids.iter().copied().collect::<BTreeSet<u16>>(),
            block: None,
            bridges: BTreeMap::new(),
        }
    }

    fn config(cpuid: u16, memory: u32) -> VmConfig {
        VmConfig {
            cpuid,
            requested_memory: memory,
            block_size: None,
            block_device: None,
            networks: Vec::new(),
            image: VmImage::Amd64(vec![0x7f]),
            argv: None,
        }
    }

    fn level(prefix: &[&str], d: Delegation) -> (Vec<String>, Delegation) {
        (prefix.iter().map(|s| (*s).to_string()).collect(), d)
    }

    #[test]
    fn first_vm_within_budget_is_admitted() {
        let levels = vec![level(&["tenant"], delegation(2, 256, &[0]))];
        let live: Vec<LiveDraw<'_>> = Vec::new();
        assert!(check_admission(&levels, live.iter().copied(), &config(0, 128)).is_ok());
    }

    #[test]
    fn memory_overdraw_names_the_remainder() {
        let levels = vec![level(&["tenant"], delegation(2, 256, &[0]))];
        let existing: VmId = "tenant/vm1".parse().unwrap();
        let live = [LiveDraw {
            id: &existing,
            memory: 128,
            block: 0,
        }];
        let err =
            check_admission(&levels, live.iter().copied(), &config(0, 200)).unwrap_err();
        assert_eq!(err.to_string(), "memory: 200 > 128 remaining");
    }

    #[test]
    fn vm_count_is_bounded() {
        let levels = vec![level(&["tenant"], delegation(1, 1024, &[0]))];
        let existing: VmId = "tenant/vm1".parse().unwrap();
        let live = [LiveDraw {
            id: &existing,
            memory: 16,
            block: 0,
        }];
        let err = check_admission(&levels, live.iter().copied(), &config(0, 16)).unwrap_err();
        assert_eq!(err.to_string(), "vms: 2 > 1 allowed");
    }

    #[test]
    fn undelegated_cpuid_is_rejected() {
        let levels = vec![level(&["tenant"], delegation(2, 256, &[0, 1]))];
        let live: Vec<LiveDraw<'_>> = Vec::new();
        let err = check_admission(&levels, live.iter().copied(), &config(3, 64)).unwrap_err();
        assert_eq!(err.to_string(), "cpuid: 3 not delegated");
    }

    #[test]
    fn unknown_bridge_is_rejected() {
        let levels = vec![level(&["tenant"], delegation(2, 256, &[0]))];
        let mut cfg = config(0, 64);
        cfg.networks.push("uplink".to_string());
        let live: Vec<LiveDraw<'_>> = Vec::new();
        let err = check_admission(&levels, live.iter().copied(), &cfg).unwrap_err();
        assert_eq!(err.to_string(), "bridge: uplink not delegated");
    }

    #[test]
    fn block_without_delegation_is_rejected() {
        let levels = vec![level(&["tenant"], delegation(2, 256, &[0]))];
        let mut cfg = config(0, 64);
        cfg.block_device = Some("disk0".to_string());
        cfg.block_size = Some(100);
        let live: Vec<LiveDraw<'_>> = Vec::new();
        let err = check_admission(&levels, live.iter().copied(), &cfg).unwrap_err();
        assert_eq!(err.to_string(), "block: not delegated");
    }

    #[test]
    fn block_overdraw_is_rejected() {
        let mut d = delegation(4, 1024, &[0]);
        d.block = Some(100);
        let levels = vec![level(&["tenant"], d)];
        let existing: VmId = "tenant/vm1".parse().unwrap();
        let live = [LiveDraw {
            id: &existing,
            memory: 16,
            block: 80,
        }];
        let mut cfg = config(0, 16);
        cfg.block_device = Some("disk0".to_string());
        cfg.block_size = Some(40);
        let err = check_admission(&levels, live.iter().copied(), &cfg).unwrap_err();
        assert_eq!(err.to_string(), "block: 40 > 20 remaining");
    }

    #[test]
    fn sibling_subtrees_do_not_interfere() {
        // two tenants under the root; only the candidate's ancestry counts
        let levels = vec![level(&["tenant-a"], delegation(1, 128, &[0]))];
        let other: VmId = "tenant-b/vm1".parse().unwrap();
        let live = [LiveDraw {
            id: &other,
            memory: 128,
            block: 0,
        }];
        assert!(check_admission(&levels, live.iter().copied(), &config(0, 128)).is_ok());
    }

    #[test]
    fn nested_levels_all_apply() {
        let levels = vec![
            level(&["tenant"], delegation(4, 512, &[0, 1])),
            level(&["tenant", "group"], delegation(1, 128, &[0])),
        ];
        let existing: VmId = "tenant/group/vm1".parse().unwrap();
        let live = [LiveDraw {
            id: &existing,
            memory: 64,
            block: 0,
        }];
        // the inner level's vm count trips first
        let err = check_admission(&levels, live.iter().copied(), &config(0, 32)).unwrap_err();
        assert_eq!(err.to_string(), "vms: 2 > 1 allowed");
    }
}

//! Store of installed certificate revocation lists.
//!
//! One list per issuer common name, with a monotonically increasing CRL
//! number: installing a list whose number is not strictly greater than the
//! stored one is rejected as stale.

use std::collections::BTreeMap;

use skua_core::policy::chain::{serial_gt, CrlSnapshot};

/// A stored revocation list.
#[derive(Debug, Clone)]
pub struct StoredCrl {
    /// Normalized big-endian CRL number; empty when the list carried none.
    pub number: Vec<u8>,
    /// The raw DER list, served to `crl` download requests.
    pub der: Vec<u8>,
}

/// Mapping issuer common name to its latest revocation list.
#[derive(Debug, Default)]
pub struct CrlStore {
    lists: BTreeMap<String, StoredCrl>,
}

impl CrlStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The stored list for an issuer, if any.
    #[must_use]
    pub fn get(&self, issuer_cn: &str) -> Option<&StoredCrl> {
        self.lists.get(issuer_cn)
    }

    /// Installs a list, enforcing serial monotonicity per issuer.
    ///
    /// Returns `false` (and leaves the store untouched) when the incoming
    /// number is not strictly greater than the stored one.
    pub fn install(&mut self, issuer_cn: String, number: Vec<u8>, der: Vec<u8>) -> bool {
        if let Some(existing) = self.lists.get(&issuer_cn) {
            if !serial_gt(&number, &existing.number) {
                return false;
            }
        }
        self.lists.insert(issuer_cn, StoredCrl { number, der });
        true
    }

    /// Snapshot of all lists keyed by issuer, handed to chain verification.
    #[must_use]
    pub fn snapshot(&self) -> CrlSnapshot {
        self.lists
            .iter()
            .map(|(issuer, stored)| (issuer.clone(), stored.der.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_requires_strictly_greater_number() {
        let mut store = CrlStore::new();
        assert!(store.install("tenant".into(), vec![2], vec![0xaa]));
        assert!(!store.install("tenant".into(), vec![2], vec![0xbb]));
        assert!(!store.install("tenant".into(), vec![1], vec![0xbb]));
        assert_eq!(store.get("tenant").unwrap().der, vec![0xaa]);
        assert!(store.install("tenant".into(), vec![3], vec![0xcc]));
        assert_eq!(store.get("tenant").unwrap().der, vec![0xcc]);
    }

    #[test]
    fn issuers_are_independent() {
        let mut store = CrlStore::new();
        assert!(store.install("a".into(), vec![5], vec![1]));
        assert!(store.install("b".into(), vec![1], vec![2]));
        assert_eq!(store.snapshot().len(), 2);
    }
}

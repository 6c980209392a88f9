//! Certificate chain verification and authorization derivation.
//!
//! A presented chain (leaf first, as TLS delivers it) is checked link by
//! link against the configured trust root: subject/issuer linkage,
//! signatures, validity windows, the version pin, and revocation against
//! the current CRL snapshot. The verified chain yields the session's
//! authorization *prefix* (the common names of the intermediates, root
//! excluded), the leaf's permission set and classification, and the
//! delegations bounding every level of the subtree.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::{CertificateRevocationList, FromDer};
use x509_parser::time::ASN1Time;

use super::projection::{
    check_version, contains_crl, contains_vm, crl_of_cert, delegation_of_cert,
    permissions_of_cert, subject_cn, vm_of_cert,
};
use super::{Delegation, PermissionSet, PolicyError, VmConfig};

/// Snapshot of installed revocation lists, keyed by issuer common name.
pub type CrlSnapshot = BTreeMap<String, Vec<u8>>;

/// Identity of one link in a verified chain, kept on live VMs so a later
/// CRL install can re-check them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertRef {
    /// Common name of the certificate's issuer.
    pub issuer_cn: String,
    /// Normalized big-endian serial number.
    pub serial: Vec<u8>,
}

/// Classification of the leaf certificate.
#[derive(Debug, Clone)]
pub enum LeafClass {
    /// The leaf carries a VM image: a create request.
    Vm(Box<VmConfig>),
    /// The leaf announces a revocation list (raw DER).
    Crl(Vec<u8>),
    /// Plain delegation or administrative leaf.
    Delegation,
}

/// The result of verifying a chain.
#[derive(Debug, Clone)]
pub struct VerifiedChain {
    /// Common names of the intermediates, root-most first.
    pub prefix: Vec<String>,
    /// Common name of the leaf.
    pub name: String,
    /// Permission set of the leaf.
    pub permissions: PermissionSet,
    /// Leaf classification.
    pub class: LeafClass,
    /// Per-link identities for later revocation checks, leaf first.
    pub refs: Vec<CertRef>,
    /// Delegations along the chain, paired with the prefix they bound,
    /// root-most level first.
    pub delegations: Vec<(Vec<String>, Delegation)>,
}

/// Strips leading zero octets from a serial number.
#[must_use]
pub fn normalize_serial(raw: &[u8]) -> Vec<u8> {
    let skip = raw.iter().take_while(|&&b| b == 0).count();
    raw[skip.min(raw.len().saturating_sub(1))..].to_vec()
}

/// Compares two normalized serials as unsigned big-endian integers.
#[must_use]
pub fn serial_gt(a: &[u8], b: &[u8]) -> bool {
    let a = normalize_serial(a);
    let b = normalize_serial(b);
    match a.len().cmp(&b.len()) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => a > b,
    }
}

fn cert_error(e: impl std::fmt::Display) -> PolicyError {
    PolicyError::Cert(e.to_string())
}

/// The revoked serial numbers listed in a DER CRL.
///
/// # Errors
///
/// Returns [`PolicyError::Cert`] if the list fails to parse.
pub fn revoked_serials(crl_der: &[u8]) -> Result<BTreeSet<Vec<u8>>, PolicyError> {
    let (_, crl) = CertificateRevocationList::from_der(crl_der).map_err(cert_error)?;
    Ok(crl
        .iter_revoked_certificates()
        .map(|revoked| normalize_serial(revoked.raw_serial()))
        .collect())
}

/// The issuer common name of a DER CRL.
///
/// # Errors
///
/// Returns [`PolicyError`] if the list fails to parse or its issuer has no
/// common name.
pub fn crl_issuer_cn(crl_der: &[u8]) -> Result<String, PolicyError> {
    let (_, crl) = CertificateRevocationList::from_der(crl_der).map_err(cert_error)?;
    let cn = crl
        .issuer()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_string)
        .ok_or(PolicyError::NoCommonName);
    cn
}

/// The CRL number extension of a DER CRL, as normalized big-endian bytes.
///
/// # Errors
///
/// Returns [`PolicyError::Cert`] if the list fails to parse.
pub fn crl_number(crl_der: &[u8]) -> Result<Option<Vec<u8>>, PolicyError> {
    use x509_parser::extensions::ParsedExtension;

    let (_, crl) = CertificateRevocationList::from_der(crl_der).map_err(cert_error)?;
    for ext in crl.extensions() {
        if let ParsedExtension::CRLNumber(number) = ext.parsed_extension() {
            return Ok(Some(normalize_serial(&number.to_bytes_be())));
        }
    }
    Ok(None)
}

/// Verifies a DER CRL's signature against its issuing certificate.
///
/// # Errors
///
/// Returns [`PolicyError`] if parsing fails, the issuer does not match, or
/// the signature does not verify.
pub fn verify_crl(crl_der: &[u8], issuer_cert_der: &[u8]) -> Result<(), PolicyError> {
    let (_, crl) = CertificateRevocationList::from_der(crl_der).map_err(cert_error)?;
    let (_, issuer) = X509Certificate::from_der(issuer_cert_der).map_err(cert_error)?;
    if crl.issuer().as_raw() != issuer.subject().as_raw() {
        return Err(PolicyError::BrokenChain(
            "revocation list issuer does not match the presented certificate".into(),
        ));
    }
    crl.verify_signature(issuer.public_key())
        .map_err(|_| PolicyError::BadSignature {
            subject: subject_cn(&issuer).unwrap_or_default(),
        })
}

/// Verifies a leaf-first chain against the trust root.
///
/// Checks, for every presented certificate: subject/issuer linkage,
/// signature, validity at `now`, the `version` pin, and revocation under
/// `crls`. A trailing copy of the root is tolerated and ignored.
///
/// # Errors
///
/// Returns the first [`PolicyError`] encountered walking from the leaf
/// upward.
pub fn verify_chain(
    chain: &[Vec<u8>],
    ca_der: &[u8],
    crls: &CrlSnapshot,
    now: DateTime<Utc>,
    version: u16,
) -> Result<VerifiedChain, PolicyError> {
    let (_, ca) = X509Certificate::from_der(ca_der).map_err(cert_error)?;

    // tolerate the client sending the root as the last element
    let presented: Vec<&[u8]> = chain
        .iter()
        .map(Vec::as_slice)
        .filter(|der| *der != ca_der)
        .collect();
    if presented.is_empty() {
        return Err(PolicyError::BrokenChain("empty certificate chain".into()));
    }

    let mut certs = Vec::with_capacity(presented.len());
    for der in &presented {
        let (_, cert) = X509Certificate::from_der(der).map_err(cert_error)?;
        certs.push(cert);
    }

    let at = ASN1Time::from_timestamp(now.timestamp()).map_err(cert_error)?;
    let mut refs = Vec::with_capacity(certs.len());

    for i in 0..certs.len() {
        let cert = &certs[i];
        let issuer = certs.get(i + 1).unwrap_or(&ca);
        let subject = subject_cn(cert)?;

        if cert.issuer().as_raw() != issuer.subject().as_raw() {
            return Err(PolicyError::BrokenChain(format!(
                "issuer of {subject:?} does not match the next certificate"
            )));
        }
        cert.verify_signature(Some(issuer.public_key()))
            .map_err(|_| PolicyError::BadSignature {
                subject: subject.clone(),
            })?;
        if !cert.validity().is_valid_at(at) {
            return Err(PolicyError::OutsideValidity { subject });
        }
        check_version(cert, version)?;

        let issuer_cn = subject_cn(issuer)?;
        let serial = normalize_serial(cert.raw_serial());
        if let Some(crl_der) = crls.get(&issuer_cn) {
            if revoked_serials(crl_der)?.contains(&serial) {
                return Err(PolicyError::Revoked { subject });
            }
        }
        refs.push(CertRef { issuer_cn, serial });
    }

    let leaf = &certs[0];
    let name = subject_cn(leaf)?;
    let prefix: Vec<String> = certs[1..]
        .iter()
        .rev()
        .map(subject_cn)
        .collect::<Result<_, _>>()?;

    let mut delegations = Vec::with_capacity(prefix.len());
    for (level, cert) in certs[1..].iter().rev().enumerate() {
        delegations.push((prefix[..=level].to_vec(), delegation_of_cert(cert)?));
    }

    let class = match (contains_vm(leaf), contains_crl(leaf)) {
        (true, true) => {
            return Err(PolicyError::VmAndCrl {
                subject: name.clone(),
            })
        }
        (true, false) => LeafClass::Vm(Box::new(vm_of_cert(leaf)?)),
        (false, true) => LeafClass::Crl(
            crl_of_cert(leaf)
                .expect("contains_crl implies the extension is present")
                .to_vec(),
        ),
        (false, false) => LeafClass::Delegation,
    };

    let permissions = permissions_of_cert(leaf)?;

    Ok(VerifiedChain {
        prefix,
        name,
        permissions,
        class,
        refs,
        delegations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::codec;
    use crate::policy::Permission;
    use rcgen::{
        BasicConstraints, CertificateParams, CustomExtension, DnType, IsCa, KeyPair, SerialNumber,
    };

    const ARC: &[u64] = &[1, 3, 6, 1, 4, 1, 49836, 42];

    fn ext(suffix: u64, content: Vec<u8>) -> CustomExtension {
        let mut oid = ARC.to_vec();
        oid.push(suffix);
        CustomExtension::from_oid_content(&oid, content)
    }

    fn version_ext() -> CustomExtension {
        ext(0, codec::encode_uint(0))
    }

    struct TestCa {
        cert: rcgen::Certificate,
        key: KeyPair,
    }

    fn make_ca() -> TestCa {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::new()).unwrap();
        params.distinguished_name.push(DnType::CommonName, "root");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let cert = params.self_signed(&key).unwrap();
        TestCa { cert, key }
    }

    fn issue(
        cn: &str,
        serial: u64,
        extensions: Vec<CustomExtension>,
        ca: bool,
        issuer: &rcgen::Certificate,
        issuer_key: &KeyPair,
    ) -> (rcgen::Certificate, KeyPair) {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::new()).unwrap();
        params.distinguished_name.push(DnType::CommonName, cn);
        params.serial_number = Some(SerialNumber::from(serial));
        params.custom_extensions = extensions;
        if ca {
            params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        }
        let cert = params.signed_by(&key, issuer, issuer_key).unwrap();
        (cert, key)
    }

    #[test]
    fn two_level_chain_yields_prefix_and_permissions() {
        let ca = make_ca();
        let (tenant, tenant_key) = issue(
            "tenant",
            10,
            vec![version_ext(), ext(1, codec::encode_uint(4))],
            true,
            &ca.cert,
            &ca.key,
        );
        let (leaf, _) = issue(
            "admin",
            11,
            vec![
                version_ext(),
                ext(
                    42,
                    codec::encode_permissions(&PermissionSet::from_iter([Permission::Info])),
                ),
            ],
            false,
            &tenant,
            &tenant_key,
        );

        let chain = vec![leaf.der().to_vec(), tenant.der().to_vec()];
        let verified = verify_chain(
            &chain,
            ca.cert.der(),
            &CrlSnapshot::new(),
            Utc::now(),
            0,
        )
        .unwrap();

        assert_eq!(verified.prefix, vec!["tenant".to_string()]);
        assert_eq!(verified.name, "admin");
        assert!(verified.permissions.allows(Permission::Info));
        assert!(matches!(verified.class, LeafClass::Delegation));
        assert_eq!(verified.delegations.len(), 1);
        assert_eq!(verified.delegations[0].1.vms, 4);
        assert_eq!(verified.refs[0].issuer_cn, "tenant");
        assert_eq!(verified.refs[1].issuer_cn, "root");
    }

    #[test]
    fn missing_version_fails_the_chain() {
        let ca = make_ca();
        let (leaf, _) = issue("bare", 1, Vec::new(), false, &ca.cert, &ca.key);
        let chain = vec![leaf.der().to_vec()];
        assert!(matches!(
            verify_chain(&chain, ca.cert.der(), &CrlSnapshot::new(), Utc::now(), 0),
            Err(PolicyError::MissingExtension {
                extension: "version",
                ..
            })
        ));
    }

    #[test]
    fn wrong_issuer_breaks_the_chain() {
        let ca = make_ca();
        let other = make_ca();
        let (leaf, _) = issue("leaf", 1, vec![version_ext()], false, &other.cert, &other.key);
        let chain = vec![leaf.der().to_vec()];
        assert!(verify_chain(&chain, ca.cert.der(), &CrlSnapshot::new(), Utc::now(), 0).is_err());
    }

    #[test]
    fn revoked_intermediate_fails_the_chain() {
        let ca = make_ca();
        let (tenant, tenant_key) = issue(
            "tenant",
            77,
            vec![version_ext()],
            true,
            &ca.cert,
            &ca.key,
        );
        let (leaf, _) = issue("leaf", 78, vec![version_ext()], false, &tenant, &tenant_key);

        let crl_params = rcgen::CertificateRevocationListParams {
            this_update: rcgen::date_time_ymd(2024, 1, 1),
            next_update: rcgen::date_time_ymd(4096, 1, 1),
            crl_number: SerialNumber::from(1u64),
            issuing_distribution_point: None,
            revoked_certs: vec![rcgen::RevokedCertParams {
                serial_number: SerialNumber::from(77u64),
                revocation_time: rcgen::date_time_ymd(2024, 1, 1),
                reason_code: None,
                invalidity_date: None,
            }],
            key_identifier_method: rcgen::KeyIdMethod::Sha256,
        };
        let crl = crl_params.signed_by(&ca.cert, &ca.key).unwrap();

        let mut crls = CrlSnapshot::new();
        crls.insert("root".to_string(), crl.der().to_vec());

        let chain = vec![leaf.der().to_vec(), tenant.der().to_vec()];
        assert!(matches!(
            verify_chain(&chain, ca.cert.der(), &crls, Utc::now(), 0),
            Err(PolicyError::Revoked { .. })
        ));
    }

    #[test]
    fn vm_and_crl_on_one_leaf_is_rejected() {
        let ca = make_ca();
        let (leaf, _) = issue(
            "both",
            5,
            vec![
                version_ext(),
                ext(6, codec::encode_uint(0)),
                ext(5, codec::encode_uint(64)),
                ext(
                    9,
                    codec::encode_image(&crate::policy::VmImage::Amd64(vec![1])),
                ),
                ext(43, vec![0x30, 0x00]),
            ],
            false,
            &ca.cert,
            &ca.key,
        );
        let chain = vec![leaf.der().to_vec()];
        assert!(matches!(
            verify_chain(&chain, ca.cert.der(), &CrlSnapshot::new(), Utc::now(), 0),
            Err(PolicyError::VmAndCrl { .. })
        ));
    }

    #[test]
    fn serial_ordering() {
        assert!(serial_gt(&[0x02], &[0x01]));
        assert!(serial_gt(&[0x01, 0x00], &[0xff]));
        assert!(!serial_gt(&[0x01], &[0x01]));
        assert!(!serial_gt(&[0x00, 0x01], &[0x02]));
    }
}

//! Lifting policy payloads off parsed certificates.
//!
//! Certificates fall into three classes: those carrying a `vmimage`
//! extension are VM certificates, those carrying a `crl` extension are
//! revocation announcements, and all others are delegations. The version
//! extension is required on every issued certificate and must match the
//! engine's supported version.

use x509_parser::certificate::X509Certificate;
use x509_parser::der_parser::{oid, Oid};

use super::{codec, Delegation, PermissionSet, PolicyError, VmConfig};

/// OID of the protocol version extension.
pub const OID_VERSION: Oid<'static> = oid!(1.3.6.1.4.1.49836.42.0);
/// OID of the delegated VM count.
pub const OID_VMS: Oid<'static> = oid!(1.3.6.1.4.1.49836.42.1);
/// OID of the delegated bridge mapping.
pub const OID_BRIDGES: Oid<'static> = oid!(1.3.6.1.4.1.49836.42.2);
/// OID of the block storage budget / request.
pub const OID_BLOCK: Oid<'static> = oid!(1.3.6.1.4.1.49836.42.3);
/// OID of the delegated cpuid set.
pub const OID_CPUIDS: Oid<'static> = oid!(1.3.6.1.4.1.49836.42.4);
/// OID of the memory budget / request.
pub const OID_MEMORY: Oid<'static> = oid!(1.3.6.1.4.1.49836.42.5);
/// OID of the requested cpuid.
pub const OID_CPUID: Oid<'static> = oid!(1.3.6.1.4.1.49836.42.6);
/// OID of the requested bridge attachments.
pub const OID_NETWORK: Oid<'static> = oid!(1.3.6.1.4.1.49836.42.7);
/// OID of the requested block device name.
pub const OID_BLOCK_DEVICE: Oid<'static> = oid!(1.3.6.1.4.1.49836.42.8);
/// OID of the unikernel image.
pub const OID_VMIMAGE: Oid<'static> = oid!(1.3.6.1.4.1.49836.42.9);
/// OID of the guest argument vector.
pub const OID_ARGV: Oid<'static> = oid!(1.3.6.1.4.1.49836.42.10);
/// OID of the permission set.
pub const OID_PERMISSIONS: Oid<'static> = oid!(1.3.6.1.4.1.49836.42.42);
/// OID of an attached revocation list.
pub const OID_CRL: Oid<'static> = oid!(1.3.6.1.4.1.49836.42.43);

/// Looks up the raw value of an extension by OID.
fn find_extension<'a>(cert: &'a X509Certificate<'_>, oid: &Oid<'_>) -> Option<&'a [u8]> {
    cert.extensions()
        .iter()
        .find(|ext| ext.oid == *oid)
        .map(|ext| ext.value)
}

/// The subject common name of a certificate.
///
/// # Errors
///
/// Returns [`PolicyError::NoCommonName`] if none is present.
pub fn subject_cn(cert: &X509Certificate<'_>) -> Result<String, PolicyError> {
    cert.subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_string)
        .ok_or(PolicyError::NoCommonName)
}

/// The protocol version carried on a certificate.
///
/// # Errors
///
/// Returns [`PolicyError::MissingExtension`] when absent and decode errors
/// otherwise.
pub fn version_of_cert(cert: &X509Certificate<'_>) -> Result<u64, PolicyError> {
    let value = find_extension(cert, &OID_VERSION).ok_or_else(|| PolicyError::MissingExtension {
        subject: subject_cn(cert).unwrap_or_default(),
        extension: "version",
    })?;
    codec::decode_uint(value)
}

/// Checks the certificate's version against the engine's.
///
/// # Errors
///
/// Returns [`PolicyError::VersionMismatch`] on any difference.
pub fn check_version(cert: &X509Certificate<'_>, expected: u16) -> Result<(), PolicyError> {
    let found = version_of_cert(cert)?;
    if found != u64::from(expected) {
        return Err(PolicyError::VersionMismatch {
            subject: subject_cn(cert).unwrap_or_default(),
            expected,
            found,
        });
    }
    Ok(())
}

/// Returns `true` if the certificate carries a VM image.
#[must_use]
pub fn contains_vm(cert: &X509Certificate<'_>) -> bool {
    find_extension(cert, &OID_VMIMAGE).is_some()
}

/// Returns `true` if the certificate announces a revocation list.
#[must_use]
pub fn contains_crl(cert: &X509Certificate<'_>) -> bool {
    find_extension(cert, &OID_CRL).is_some()
}

/// The raw DER revocation list attached to a certificate, if any.
#[must_use]
pub fn crl_of_cert<'a>(cert: &'a X509Certificate<'_>) -> Option<&'a [u8]> {
    find_extension(cert, &OID_CRL)
}

/// The delegation carried on a certificate.
///
/// Absent fields decode to their empty values: a certificate delegating
/// nothing bounds its subtree to nothing.
///
/// # Errors
///
/// Returns [`PolicyError`] on any malformed extension payload.
pub fn delegation_of_cert(cert: &X509Certificate<'_>) -> Result<Delegation, PolicyError> {
    let mut delegation = Delegation::default();
    if let Some(value) = find_extension(cert, &OID_VMS) {
        delegation.vms =
            u32::try_from(codec::decode_uint(value)?).map_err(|_| PolicyError::IntegerRange)?;
    }
    if let Some(value) = find_extension(cert, &OID_CPUIDS) {
        delegation.cpuids = codec::decode_cpuids(value)?;
    }
    if let Some(value) = find_extension(cert, &OID_MEMORY) {
        delegation.memory =
            u32::try_from(codec::decode_uint(value)?).map_err(|_| PolicyError::IntegerRange)?;
    }
    if let Some(value) = find_extension(cert, &OID_BLOCK) {
        delegation.block = Some(
            u32::try_from(codec::decode_uint(value)?).map_err(|_| PolicyError::IntegerRange)?,
        );
    }
    if let Some(value) = find_extension(cert, &OID_BRIDGES) {
        delegation.bridges = codec::decode_bridges(value)?;
    }
    Ok(delegation)
}

/// The VM configuration carried on a leaf certificate.
///
/// `cpuid`, `memory`, and `vmimage` are required; the rest are optional.
///
/// # Errors
///
/// Returns [`PolicyError`] when a required extension is missing or any
/// payload is malformed.
pub fn vm_of_cert(cert: &X509Certificate<'_>) -> Result<VmConfig, PolicyError> {
    let subject = subject_cn(cert).unwrap_or_default();
    let missing = |extension: &'static str| PolicyError::MissingExtension {
        subject: subject.clone(),
        extension,
    };

    let cpuid_raw = find_extension(cert, &OID_CPUID).ok_or_else(|| missing("cpuid"))?;
    let cpuid =
        u16::try_from(codec::decode_uint(cpuid_raw)?).map_err(|_| PolicyError::IntegerRange)?;

    let memory_raw = find_extension(cert, &OID_MEMORY).ok_or_else(|| missing("memory"))?;
    let requested_memory =
        u32::try_from(codec::decode_uint(memory_raw)?).map_err(|_| PolicyError::IntegerRange)?;

    let image_raw = find_extension(cert, &OID_VMIMAGE).ok_or_else(|| missing("vmimage"))?;
    let image = codec::decode_image(image_raw)?;

    let block_device = find_extension(cert, &OID_BLOCK_DEVICE)
        .map(codec::decode_utf8)
        .transpose()?;
    let block_size = find_extension(cert, &OID_BLOCK)
        .map(|v| {
            codec::decode_uint(v)
                .and_then(|n| u32::try_from(n).map_err(|_| PolicyError::IntegerRange))
        })
        .transpose()?;
    let networks = find_extension(cert, &OID_NETWORK)
        .map(codec::decode_strings)
        .transpose()?
        .unwrap_or_default();
    let argv = find_extension(cert, &OID_ARGV)
        .map(codec::decode_strings)
        .transpose()?;

    Ok(VmConfig {
        cpuid,
        requested_memory,
        block_size,
        block_device,
        networks,
        image,
        argv,
    })
}

/// The permission set carried on a leaf certificate.
///
/// A certificate without the extension authorizes nothing.
///
/// # Errors
///
/// Returns [`PolicyError`] on a malformed payload.
pub fn permissions_of_cert(cert: &X509Certificate<'_>) -> Result<PermissionSet, PolicyError> {
    find_extension(cert, &OID_PERMISSIONS)
        .map(codec::decode_permissions)
        .transpose()
        .map(Option::unwrap_or_default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{Permission, VmImage};
    use rcgen::{CertificateParams, CustomExtension, DnType, KeyPair};
    use x509_parser::prelude::FromDer;

    const ARC: &[u64] = &[1, 3, 6, 1, 4, 1, 49836, 42];

    fn ext(suffix: u64, content: Vec<u8>) -> CustomExtension {
        let mut oid = ARC.to_vec();
        oid.push(suffix);
        CustomExtension::from_oid_content(&oid, content)
    }

    fn self_signed(extensions: Vec<CustomExtension>) -> Vec<u8> {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::new()).unwrap();
        params.distinguished_name.push(DnType::CommonName, "probe");
        params.custom_extensions = extensions;
        params.self_signed(&key).unwrap().der().to_vec()
    }

    #[test]
    fn version_and_permissions_project() {
        let der = self_signed(vec![
            ext(0, codec::encode_uint(0)),
            ext(
                42,
                codec::encode_permissions(&PermissionSet::from_iter([
                    Permission::Create,
                    Permission::Console,
                ])),
            ),
        ]);
        let (_, cert) = X509Certificate::from_der(&der).unwrap();
        assert_eq!(version_of_cert(&cert).unwrap(), 0);
        check_version(&cert, 0).unwrap();
        assert!(check_version(&cert, 1).is_err());
        let perms = permissions_of_cert(&cert).unwrap();
        assert!(perms.allows(Permission::Create));
        assert!(!perms.allows(Permission::Crl));
    }

    #[test]
    fn vm_cert_projects_config() {
        let der = self_signed(vec![
            ext(0, codec::encode_uint(0)),
            ext(6, codec::encode_uint(1)),
            ext(5, codec::encode_uint(128)),
            ext(9, codec::encode_image(&VmImage::Amd64(vec![0x7f, 0x45]))),
            ext(7, codec::encode_strings(&["service".into()])),
        ]);
        let (_, cert) = X509Certificate::from_der(&der).unwrap();
        assert!(contains_vm(&cert));
        assert!(!contains_crl(&cert));
        let config = vm_of_cert(&cert).unwrap();
        assert_eq!(config.cpuid, 1);
        assert_eq!(config.requested_memory, 128);
        assert_eq!(config.networks, vec!["service".to_string()]);
        assert!(config.block_device.is_none());
    }

    #[test]
    fn vm_cert_missing_memory_is_rejected() {
        let der = self_signed(vec![
            ext(0, codec::encode_uint(0)),
            ext(6, codec::encode_uint(0)),
            ext(9, codec::encode_image(&VmImage::Amd64(vec![1]))),
        ]);
        let (_, cert) = X509Certificate::from_der(&der).unwrap();
        assert!(matches!(
            vm_of_cert(&cert),
            Err(PolicyError::MissingExtension {
                extension: "memory",
                ..
            })
        ));
    }

    #[test]
    fn delegation_defaults_to_empty() {
        let der = self_signed(vec![ext(0, codec::encode_uint(0))]);
        let (_, cert) = X509Certificate::from_der(&der).unwrap();
        let delegation = delegation_of_cert(&cert).unwrap();
        assert_eq!(delegation.vms, 0);
        assert_eq!(delegation.memory, 0);
        assert!(delegation.cpuids.is_empty());
    }

    #[test]
    fn missing_version_is_an_error() {
        let der = self_signed(Vec::new());
        let (_, cert) = X509Certificate::from_der(&der).unwrap();
        assert!(matches!(
            version_of_cert(&cert),
            Err(PolicyError::MissingExtension {
                extension: "version",
                ..
            })
        ));
    }
}

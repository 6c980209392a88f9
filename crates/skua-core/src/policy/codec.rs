//! DER codec for the private certificate extensions.
//!
//! Every decoder requires the outermost value to consume the whole input;
//! surplus bytes are a [`PolicyError::TrailingBytes`] parse error. Every
//! encoder produces input its decoder accepts, so the pair round-trips.
//!
//! Payload grammar, by OID suffix under `1.3.6.1.4.1.49836.42`:
//!
//! | suffix | name         | encoding |
//! |-------:|--------------|----------|
//! | 0      | version      | INTEGER |
//! | 1      | vms          | INTEGER |
//! | 2      | bridges      | SEQUENCE OF CHOICE { [0] UTF8String, [1] SEQUENCE { name, start, end, router, netmask } } |
//! | 3      | block        | INTEGER |
//! | 4      | cpuids       | SEQUENCE OF INTEGER |
//! | 5      | memory       | INTEGER |
//! | 6      | cpuid        | INTEGER |
//! | 7      | network      | SEQUENCE OF UTF8String |
//! | 8      | block_device | UTF8String |
//! | 9      | vmimage      | CHOICE { [0] amd64, [1] arm64, [2] amd64 deflated } OCTET STRING |
//! | 10     | argv         | SEQUENCE OF UTF8String |
//! | 42     | permissions  | SEQUENCE OF ENUMERATED |
//! | 43     | crl          | raw DER CertificateList |

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

use super::der::{
    context_constructed, context_primitive, uint_from_content, utf8_from_content, Reader, Writer,
    TAG_ENUMERATED, TAG_INTEGER, TAG_OCTET_STRING, TAG_SEQUENCE, TAG_UTF8_STRING,
};
use super::{Bridge, Permission, PermissionSet, PolicyError, VmImage};

/// Encodes a bare unsigned INTEGER (version, vms, block, memory, cpuid).
#[must_use]
pub fn encode_uint(value: u64) -> Vec<u8> {
    let mut w = Writer::new();
    w.uint(TAG_INTEGER, value);
    w.into_bytes()
}

/// Decodes a bare unsigned INTEGER.
///
/// # Errors
///
/// Returns [`PolicyError`] on malformed DER or trailing bytes.
pub fn decode_uint(input: &[u8]) -> Result<u64, PolicyError> {
    let mut r = Reader::new(input);
    let content = r.expect(TAG_INTEGER)?;
    let value = uint_from_content(content)?;
    r.finish()?;
    Ok(value)
}

/// Encodes a UTF8String (block_device).
#[must_use]
pub fn encode_utf8(value: &str) -> Vec<u8> {
    let mut w = Writer::new();
    w.utf8(TAG_UTF8_STRING, value);
    w.into_bytes()
}

/// Decodes a UTF8String.
///
/// # Errors
///
/// Returns [`PolicyError`] on malformed DER or trailing bytes.
pub fn decode_utf8(input: &[u8]) -> Result<String, PolicyError> {
    let mut r = Reader::new(input);
    let content = r.expect(TAG_UTF8_STRING)?;
    let value = utf8_from_content(content)?;
    r.finish()?;
    Ok(value)
}

/// Encodes a SEQUENCE OF UTF8String (network, argv).
#[must_use]
pub fn encode_strings(values: &[String]) -> Vec<u8> {
    let mut inner = Writer::new();
    for value in values {
        inner.utf8(TAG_UTF8_STRING, value);
    }
    let mut w = Writer::new();
    w.tlv(TAG_SEQUENCE, &inner.into_bytes());
    w.into_bytes()
}

/// Decodes a SEQUENCE OF UTF8String.
///
/// # Errors
///
/// Returns [`PolicyError`] on malformed DER or trailing bytes.
pub fn decode_strings(input: &[u8]) -> Result<Vec<String>, PolicyError> {
    let mut r = Reader::new(input);
    let content = r.expect(TAG_SEQUENCE)?;
    r.finish()?;
    let mut inner = Reader::new(content);
    let mut out = Vec::new();
    while !inner.is_empty() {
        out.push(utf8_from_content(inner.expect(TAG_UTF8_STRING)?)?);
    }
    Ok(out)
}

/// Encodes a SEQUENCE OF INTEGER (cpuids).
#[must_use]
pub fn encode_cpuids(cpuids: &BTreeSet<u16>) -> Vec<u8> {
    let mut inner = Writer::new();
    for &cpuid in cpuids {
        inner.uint(TAG_INTEGER, u64::from(cpuid));
    }
    let mut w = Writer::new();
    w.tlv(TAG_SEQUENCE, &inner.into_bytes());
    w.into_bytes()
}

/// Decodes a SEQUENCE OF INTEGER into a cpuid set.
///
/// # Errors
///
/// Returns [`PolicyError`] on malformed DER, out-of-range ids, or trailing
/// bytes.
pub fn decode_cpuids(input: &[u8]) -> Result<BTreeSet<u16>, PolicyError> {
    let mut r = Reader::new(input);
    let content = r.expect(TAG_SEQUENCE)?;
    r.finish()?;
    let mut inner = Reader::new(content);
    let mut out = BTreeSet::new();
    while !inner.is_empty() {
        let value = uint_from_content(inner.expect(TAG_INTEGER)?)?;
        let cpuid = u16::try_from(value).map_err(|_| PolicyError::IntegerRange)?;
        out.insert(cpuid);
    }
    Ok(out)
}

fn ipv4_content(content: &[u8]) -> Result<Ipv4Addr, PolicyError> {
    let octets: [u8; 4] = content.try_into().map_err(|_| PolicyError::IntegerRange)?;
    Ok(Ipv4Addr::from(octets))
}

/// Encodes the bridges mapping.
#[must_use]
pub fn encode_bridges(bridges: &BTreeMap<String, Bridge>) -> Vec<u8> {
    let mut inner = Writer::new();
    for (name, bridge) in bridges {
        match bridge {
            Bridge::Internal => inner.utf8(context_primitive(0), name),
            Bridge::External {
                start_ip,
                end_ip,
                router_ip,
                netmask,
            } => {
                let mut fields = Writer::new();
                fields.utf8(TAG_UTF8_STRING, name);
                fields.tlv(TAG_OCTET_STRING, &start_ip.octets());
                fields.tlv(TAG_OCTET_STRING, &end_ip.octets());
                fields.tlv(TAG_OCTET_STRING, &router_ip.octets());
                fields.uint(TAG_INTEGER, u64::from(*netmask));
                inner.tlv(context_constructed(1), &fields.into_bytes());
            }
        }
    }
    let mut w = Writer::new();
    w.tlv(TAG_SEQUENCE, &inner.into_bytes());
    w.into_bytes()
}

/// Decodes the bridges mapping.
///
/// # Errors
///
/// Returns [`PolicyError`] on malformed DER, an unknown CHOICE tag, or
/// trailing bytes.
pub fn decode_bridges(input: &[u8]) -> Result<BTreeMap<String, Bridge>, PolicyError> {
    let mut r = Reader::new(input);
    let content = r.expect(TAG_SEQUENCE)?;
    r.finish()?;
    let mut inner = Reader::new(content);
    let mut out = BTreeMap::new();
    while !inner.is_empty() {
        let (tag, content) = inner.read_tlv()?;
        if tag == context_primitive(0) {
            out.insert(utf8_from_content(content)?, Bridge::Internal);
        } else if tag == context_constructed(1) {
            let mut fields = Reader::new(content);
            let name = utf8_from_content(fields.expect(TAG_UTF8_STRING)?)?;
            let start_ip = ipv4_content(fields.expect(TAG_OCTET_STRING)?)?;
            let end_ip = ipv4_content(fields.expect(TAG_OCTET_STRING)?)?;
            let router_ip = ipv4_content(fields.expect(TAG_OCTET_STRING)?)?;
            let netmask = u8::try_from(uint_from_content(fields.expect(TAG_INTEGER)?)?)
                .map_err(|_| PolicyError::IntegerRange)?;
            fields.finish()?;
            out.insert(
                name,
                Bridge::External {
                    start_ip,
                    end_ip,
                    router_ip,
                    netmask,
                },
            );
        } else {
            return Err(PolicyError::UnknownChoice(tag));
        }
    }
    Ok(out)
}

/// Encodes a VM image.
#[must_use]
pub fn encode_image(image: &VmImage) -> Vec<u8> {
    let (choice, payload) = match image {
        VmImage::Amd64(b) => (0, b),
        VmImage::Arm64(b) => (1, b),
        VmImage::Amd64Compressed(b) => (2, b),
    };
    let mut w = Writer::new();
    w.tlv(context_primitive(choice), payload);
    w.into_bytes()
}

/// Decodes a VM image.
///
/// Choice `[1]` is arm64 and `[2]` amd64-compressed; any other choice is
/// rejected.
///
/// # Errors
///
/// Returns [`PolicyError`] on malformed DER, an unknown choice, or trailing
/// bytes.
pub fn decode_image(input: &[u8]) -> Result<VmImage, PolicyError> {
    let mut r = Reader::new(input);
    let (tag, content) = r.read_tlv()?;
    r.finish()?;
    let payload = content.to_vec();
    match tag {
        t if t == context_primitive(0) => Ok(VmImage::Amd64(payload)),
        t if t == context_primitive(1) => Ok(VmImage::Arm64(payload)),
        t if t == context_primitive(2) => Ok(VmImage::Amd64Compressed(payload)),
        other => Err(PolicyError::UnknownChoice(other)),
    }
}

/// Encodes a permission set.
#[must_use]
pub fn encode_permissions(set: &PermissionSet) -> Vec<u8> {
    let mut inner = Writer::new();
    for permission in set.iter() {
        inner.uint(TAG_ENUMERATED, permission.code());
    }
    let mut w = Writer::new();
    w.tlv(TAG_SEQUENCE, &inner.into_bytes());
    w.into_bytes()
}

/// Decodes a permission set.
///
/// # Errors
///
/// Returns [`PolicyError`] on malformed DER, an unknown permission code, or
/// trailing bytes.
pub fn decode_permissions(input: &[u8]) -> Result<PermissionSet, PolicyError> {
    let mut r = Reader::new(input);
    let content = r.expect(TAG_SEQUENCE)?;
    r.finish()?;
    let mut inner = Reader::new(content);
    let mut out = PermissionSet::empty();
    while !inner.is_empty() {
        let code = uint_from_content(inner.expect(TAG_ENUMERATED)?)?;
        let permission = Permission::from_code(code).ok_or(PolicyError::UnknownPermission(code))?;
        out.insert(permission);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uint_extension_roundtrip() {
        for value in [0u64, 2, 256, 1024] {
            let der = encode_uint(value);
            assert_eq!(decode_uint(&der).unwrap(), value);
        }
    }

    #[test]
    fn every_decoder_rejects_trailing_bytes() {
        let mut uint = encode_uint(1);
        uint.push(0);
        assert!(matches!(
            decode_uint(&uint),
            Err(PolicyError::TrailingBytes)
        ));

        let mut strings = encode_strings(&["net0".into()]);
        strings.push(0);
        assert!(matches!(
            decode_strings(&strings),
            Err(PolicyError::TrailingBytes)
        ));

        let mut image = encode_image(&VmImage::Amd64(vec![1, 2, 3]));
        image.push(0);
        assert!(matches!(
            decode_image(&image),
            Err(PolicyError::TrailingBytes)
        ));

        let mut bridges = encode_bridges(&BTreeMap::new());
        bridges.push(0);
        assert!(matches!(
            decode_bridges(&bridges),
            Err(PolicyError::TrailingBytes)
        ));

        let mut perms = encode_permissions(&PermissionSet::from_iter([Permission::Info]));
        perms.push(0);
        assert!(matches!(
            decode_permissions(&perms),
            Err(PolicyError::TrailingBytes)
        ));
    }

    #[test]
    fn strings_roundtrip() {
        let values = vec!["service".to_string(), "br0".to_string()];
        assert_eq!(decode_strings(&encode_strings(&values)).unwrap(), values);
        assert!(decode_strings(&encode_strings(&[])).unwrap().is_empty());
    }

    #[test]
    fn utf8_roundtrip() {
        assert_eq!(decode_utf8(&encode_utf8("disk0")).unwrap(), "disk0");
    }

    #[test]
    fn cpuids_roundtrip() {
        let cpuids: BTreeSet<u16> = [0, 1, 7].into_iter().collect();
        assert_eq!(decode_cpuids(&encode_cpuids(&cpuids)).unwrap(), cpuids);
    }

    #[test]
    fn bridges_roundtrip() {
        let mut bridges = BTreeMap::new();
        bridges.insert("internal0".to_string(), Bridge::Internal);
        bridges.insert(
            "uplink".to_string(),
            Bridge::External {
                start_ip: Ipv4Addr::new(192, 0, 2, 10),
                end_ip: Ipv4Addr::new(192, 0, 2, 20),
                router_ip: Ipv4Addr::new(192, 0, 2, 1),
                netmask: 24,
            },
        );
        assert_eq!(decode_bridges(&encode_bridges(&bridges)).unwrap(), bridges);
    }

    #[test]
    fn image_roundtrip_all_choices() {
        for image in [
            VmImage::Amd64(vec![1, 2, 3]),
            VmImage::Arm64(vec![4, 5]),
            VmImage::Amd64Compressed(vec![6]),
        ] {
            assert_eq!(decode_image(&encode_image(&image)).unwrap(), image);
        }
    }

    #[test]
    fn image_unknown_choice_rejected() {
        // [3] OCTET STRING
        let input = [0x83, 0x01, 0xaa];
        assert!(matches!(
            decode_image(&input),
            Err(PolicyError::UnknownChoice(0x83))
        ));
    }

    #[test]
    fn permissions_roundtrip() {
        let set = PermissionSet::from_iter([
            Permission::Create,
            Permission::Console,
            Permission::Statistics,
        ]);
        assert_eq!(decode_permissions(&encode_permissions(&set)).unwrap(), set);
    }

    #[test]
    fn permissions_unknown_code_rejected() {
        // SEQUENCE { ENUMERATED 200 }
        let input = [0x30, 0x04, 0x0a, 0x02, 0x00, 0xc8];
        assert!(matches!(
            decode_permissions(&input),
            Err(PolicyError::UnknownPermission(200))
        ));
    }
}

//! Physical key codec.
//!
//! Every stored key is `[class:1][instance:4][type-key:var][version:4][tombstone:1]`
//! with big-endian integer fields. For a fixed (class, instance, type-key)
//! prefix, keys sort by (version, tombstone), so all versions of one logical
//! cell are contiguous and a tombstone sorts immediately after its sibling
//! value at the same version.

use std::convert::TryFrom;

use crate::error::{Result, StrataError};
use crate::model::{InstanceId, VersionId};

/// Number of bytes besides the type-key: class + instance + version + tombstone.
pub const KEY_OVERHEAD: usize = 10;

pub const MIN_VERSION: VersionId = VersionId(0);
pub const MAX_VERSION: VersionId = VersionId(u32::MAX);

#[repr(u8)]
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum KeyClass {
    Metadata = 0x01,
    Data = 0x02,
    LabelIndex = 0x03,
}

impl KeyClass {
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for KeyClass {
    type Error = StrataError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(KeyClass::Metadata),
            0x02 => Ok(KeyClass::Data),
            0x03 => Ok(KeyClass::LabelIndex),
            _ => Err(StrataError::MalformedKey("unknown key class")),
        }
    }
}

/// Decoded form of a physical key.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct PhysicalKey {
    pub class: KeyClass,
    pub instance: InstanceId,
    pub type_key: Vec<u8>,
    pub version: VersionId,
    pub tombstone: bool,
}

pub fn encode(
    class: KeyClass,
    instance: InstanceId,
    type_key: &[u8],
    version: VersionId,
    tombstone: bool,
) -> Vec<u8> {
    let mut key = Vec::with_capacity(KEY_OVERHEAD + type_key.len());
    key.push(class.as_u8());
    key.extend_from_slice(&instance.0.to_be_bytes());
    key.extend_from_slice(type_key);
    key.extend_from_slice(&version.0.to_be_bytes());
    key.push(tombstone as u8);
    key
}

pub fn decode(key: &[u8]) -> Result<PhysicalKey> {
    if key.len() < KEY_OVERHEAD {
        return Err(StrataError::MalformedKey("key shorter than fixed fields"));
    }
    let class = KeyClass::try_from(key[0])?;
    let instance = InstanceId(u32::from_be_bytes(key[1..5].try_into().unwrap()));
    let tail = key.len() - 5;
    let type_key = key[5..tail].to_vec();
    let version = VersionId(u32::from_be_bytes(key[tail..tail + 4].try_into().unwrap()));
    let tombstone = match key[key.len() - 1] {
        0 => false,
        1 => true,
        _ => return Err(StrataError::MalformedKey("bad tombstone byte")),
    };
    Ok(PhysicalKey {
        class,
        instance,
        type_key,
        version,
        tombstone,
    })
}

/// The type-key portion of an encoded key, without allocating.
pub fn type_key_of(key: &[u8]) -> Result<&[u8]> {
    if key.len() < KEY_OVERHEAD {
        return Err(StrataError::MalformedKey("key shorter than fixed fields"));
    }
    Ok(&key[5..key.len() - 5])
}

pub fn version_of(key: &[u8]) -> Result<VersionId> {
    if key.len() < KEY_OVERHEAD {
        return Err(StrataError::MalformedKey("key shorter than fixed fields"));
    }
    let tail = key.len() - 5;
    Ok(VersionId(u32::from_be_bytes(
        key[tail..tail + 4].try_into().unwrap(),
    )))
}

pub fn is_tombstone(key: &[u8]) -> Result<bool> {
    if key.len() < KEY_OVERHEAD {
        return Err(StrataError::MalformedKey("key shorter than fixed fields"));
    }
    match key[key.len() - 1] {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(StrataError::MalformedKey("bad tombstone byte")),
    }
}

/// Smallest possible key for a type-key: version 0, no tombstone.
pub fn min_version_key(class: KeyClass, instance: InstanceId, type_key: &[u8]) -> Vec<u8> {
    encode(class, instance, type_key, MIN_VERSION, false)
}

/// Largest possible key for a type-key: version 0xFFFFFFFF, tombstone set.
pub fn max_version_key(class: KeyClass, instance: InstanceId, type_key: &[u8]) -> Vec<u8> {
    encode(class, instance, type_key, MAX_VERSION, true)
}

pub fn tombstone_key(
    class: KeyClass,
    instance: InstanceId,
    type_key: &[u8],
    version: VersionId,
) -> Vec<u8> {
    encode(class, instance, type_key, version, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let cases = [
            (KeyClass::Metadata, 0u32, &b""[..], 0u32, false),
            (KeyClass::Data, 7, &b"\xAA"[..], 1, false),
            (KeyClass::Data, 7, &b"\xAA"[..], 2, true),
            (KeyClass::LabelIndex, u32::MAX, &[0u8; 8][..], u32::MAX, true),
        ];
        for (class, instance, tkey, version, tombstone) in cases {
            let key = encode(class, InstanceId(instance), tkey, VersionId(version), tombstone);
            let decoded = decode(&key).unwrap();
            assert_eq!(decoded.class, class);
            assert_eq!(decoded.instance, InstanceId(instance));
            assert_eq!(decoded.type_key, tkey);
            assert_eq!(decoded.version, VersionId(version));
            assert_eq!(decoded.tombstone, tombstone);
        }
    }

    #[test]
    fn order_follows_version_then_tombstone() {
        let tkey = b"\x01\x02\x03";
        let inst = InstanceId(9);
        let mut expected = Vec::new();
        for version in [0u32, 1, 2, 500, u32::MAX] {
            for tombstone in [false, true] {
                expected.push(encode(
                    KeyClass::Data,
                    inst,
                    tkey,
                    VersionId(version),
                    tombstone,
                ));
            }
        }
        let mut sorted = expected.clone();
        sorted.sort();
        assert_eq!(expected, sorted);
    }

    #[test]
    fn min_max_bracket_all_versions() {
        let tkey = b"\x10";
        let inst = InstanceId(3);
        let low = min_version_key(KeyClass::Data, inst, tkey);
        let high = max_version_key(KeyClass::Data, inst, tkey);
        let mid = encode(KeyClass::Data, inst, tkey, VersionId(12345), true);
        assert!(low <= mid && mid <= high);
    }

    #[test]
    fn decode_rejects_short_and_bad_bytes() {
        assert!(matches!(
            decode(&[0x02, 0, 0]),
            Err(StrataError::MalformedKey(_))
        ));
        let mut key = encode(KeyClass::Data, InstanceId(1), b"k", VersionId(1), false);
        let last = key.len() - 1;
        key[last] = 9;
        assert!(matches!(decode(&key), Err(StrataError::MalformedKey(_))));
        key[last] = 0;
        key[0] = 0x77;
        assert!(matches!(decode(&key), Err(StrataError::MalformedKey(_))));
    }

    #[test]
    fn instances_share_no_prefix_past_class_byte() {
        let a = encode(KeyClass::Data, InstanceId(1), b"same", VersionId(1), false);
        let b = encode(KeyClass::Data, InstanceId(2), b"same", VersionId(1), false);
        assert_eq!(a[0], b[0]);
        assert_ne!(a[1..5], b[1..5]);
    }
}

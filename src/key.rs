// Copyright 2018 Kodebox, Inc.
// This file is part of CodeChain.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Nibble paths and tagged state keys with their canonical byte form.

use std::hash::Hasher;

use primitive_types::H256;
use siphasher::sip::SipHasher13;

/// Root hash of an empty authenticated tree. Normalized to zero by every
/// consumer in this crate.
pub const EMPTY_TREE_HASH: H256 = H256([
    0x56, 0xe8, 0x1f, 0x17, 0x1b, 0xcc, 0x55, 0xa6, 0xff, 0x83, 0x45, 0xe6, 0x92, 0xc0, 0xf8, 0x6e, 0x5b, 0x48, 0xe0,
    0x1b, 0x99, 0x6c, 0xad, 0xc0, 0x01, 0x62, 0x2f, 0xb5, 0xe3, 0x63, 0xb4, 0x21,
]);

/// Maps `EMPTY_TREE_HASH` to the zero hash; identity otherwise.
pub fn normalize_root(hash: H256) -> H256 {
    if hash == EMPTY_TREE_HASH {
        H256::zero()
    } else {
        hash
    }
}

pub const NIBBLES_PER_HASH: u8 = 64;

const SIP_K0: u64 = 0x0706_0504_0302_0100;
const SIP_K1: u64 = 0x0f0e_0d0c_0b0a_0908;
const DESTROYED_SEED: u32 = 0x9e37_79b9;

/// The 64-bit hash of a canonically encoded key: filter seed and
/// dictionary probe hash.
pub fn key_hash(encoded: &[u8]) -> u64 {
    let mut hasher = SipHasher13::new_with_keys(SIP_K0, SIP_K1);
    hasher.write(encoded);
    hasher.finish()
}

/// Short hash marking whole-subtree deletion of an account inside a
/// committed block's filter. Never zero: zero means "not applicable".
pub fn destroyed_hash(address: &H256) -> u64 {
    let mut hasher = crc32fast::Hasher::new_with_initial(DESTROYED_SEED);
    hasher.update(address.as_bytes());
    let crc = u64::from(hasher.finalize());
    if crc == 0 {
        1
    } else {
        crc
    }
}

/// A sequence of up to 64 nibbles derived from a hash. Nibbles beyond
/// `len` are kept zero so equal paths compare and encode equally.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct NibblePath {
    len: u8,
    bytes: [u8; 32],
}

impl NibblePath {
    pub fn empty() -> Self {
        NibblePath {
            len: 0,
            bytes: [0u8; 32],
        }
    }

    pub fn full(hash: &H256) -> Self {
        NibblePath {
            len: NIBBLES_PER_HASH,
            bytes: hash.to_fixed_bytes(),
        }
    }

    pub fn truncated(hash: &H256, len: u8) -> Self {
        assert!(len <= NIBBLES_PER_HASH);
        let mut bytes = hash.to_fixed_bytes();
        let full_bytes = (len / 2) as usize;
        if len % 2 == 1 {
            bytes[full_bytes] &= 0xF0;
            for byte in bytes.iter_mut().skip(full_bytes + 1) {
                *byte = 0;
            }
        } else {
            for byte in bytes.iter_mut().skip(full_bytes) {
                *byte = 0;
            }
        }
        NibblePath {
            len,
            bytes,
        }
    }

    pub fn len(&self) -> u8 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == NIBBLES_PER_HASH
    }

    pub fn nibble(&self, index: u8) -> u8 {
        assert!(index < self.len);
        let byte = self.bytes[(index / 2) as usize];
        if index % 2 == 0 {
            byte >> 4
        } else {
            byte & 0x0F
        }
    }

    /// The hash this path spells out, when it is full length.
    pub fn as_hash(&self) -> Option<H256> {
        if self.is_full() {
            Some(H256(self.bytes))
        } else {
            None
        }
    }

    fn packed(&self) -> &[u8] {
        &self.bytes[..((self.len as usize) + 1) / 2]
    }

    fn from_packed(len: u8, packed: &[u8]) -> Self {
        let mut bytes = [0u8; 32];
        bytes[..packed.len()].copy_from_slice(packed);
        NibblePath {
            len,
            bytes,
        }
    }
}

impl std::fmt::Debug for NibblePath {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Path(")?;
        for i in 0..self.len {
            write!(f, "{:x}", self.nibble(i))?;
        }
        write!(f, ")")
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum KeyKind {
    Account = 0,
    StorageCell = 1,
    Merkle = 2,
}

impl KeyKind {
    fn from_u8(tag: u8) -> Option<KeyKind> {
        match tag {
            0 => Some(KeyKind::Account),
            1 => Some(KeyKind::StorageCell),
            2 => Some(KeyKind::Merkle),
            _ => None,
        }
    }
}

/// A tagged state key: the path locates the owning subtree, the extra
/// path carries the in-account part for storage cells and storage-tree
/// merkle nodes.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Key {
    kind: KeyKind,
    path: NibblePath,
    extra: NibblePath,
}

impl Key {
    /// Longest canonical encoding: tag, two length bytes, two packed
    /// full-length paths.
    pub const MAX_ENCODED: usize = 3 + 32 + 32;

    pub fn account(address: &H256) -> Key {
        Key {
            kind: KeyKind::Account,
            path: NibblePath::full(address),
            extra: NibblePath::empty(),
        }
    }

    pub fn storage(address: &H256, slot: &H256) -> Key {
        Key {
            kind: KeyKind::StorageCell,
            path: NibblePath::full(address),
            extra: NibblePath::full(slot),
        }
    }

    pub fn merkle(path: NibblePath) -> Key {
        Key {
            kind: KeyKind::Merkle,
            path,
            extra: NibblePath::empty(),
        }
    }

    /// A merkle node inside one account's storage tree.
    pub fn storage_merkle(address: &H256, path: NibblePath) -> Key {
        Key {
            kind: KeyKind::Merkle,
            path: NibblePath::full(address),
            extra: path,
        }
    }

    pub fn kind(&self) -> KeyKind {
        self.kind
    }

    pub fn path(&self) -> &NibblePath {
        &self.path
    }

    pub fn extra(&self) -> &NibblePath {
        &self.extra
    }

    /// The account owning this key, when the path is full length.
    pub fn address(&self) -> Option<H256> {
        self.path.as_hash()
    }

    /// The destroyed-subtree marker hash, or zero when the key has no
    /// full-length owner path.
    pub fn destroyed_hash(&self) -> u64 {
        match self.address() {
            Some(address) => destroyed_hash(&address),
            None => 0,
        }
    }

    /// Canonical serialization into a caller buffer; returns the
    /// written prefix.
    pub fn write_to<'a>(&self, buf: &'a mut [u8; Self::MAX_ENCODED]) -> &'a [u8] {
        buf[0] = self.kind as u8;
        buf[1] = self.path.len();
        let mut at = 2;
        let packed = self.path.packed();
        buf[at..at + packed.len()].copy_from_slice(packed);
        at += packed.len();
        buf[at] = self.extra.len();
        at += 1;
        let packed = self.extra.packed();
        buf[at..at + packed.len()].copy_from_slice(packed);
        at += packed.len();
        &buf[..at]
    }

    /// Parse one canonical key, returning it and the remaining bytes.
    pub fn read_from(bytes: &[u8]) -> Option<(Key, &[u8])> {
        if bytes.len() < 3 {
            return None
        }
        let kind = KeyKind::from_u8(bytes[0])?;
        let path_len = bytes[1];
        if path_len > NIBBLES_PER_HASH {
            return None
        }
        let path_bytes = ((path_len as usize) + 1) / 2;
        let extra_at = 2 + path_bytes;
        if bytes.len() < extra_at + 1 {
            return None
        }
        let path = NibblePath::from_packed(path_len, &bytes[2..extra_at]);
        let extra_len = bytes[extra_at];
        if extra_len > NIBBLES_PER_HASH {
            return None
        }
        let extra_bytes = ((extra_len as usize) + 1) / 2;
        let end = extra_at + 1 + extra_bytes;
        if bytes.len() < end {
            return None
        }
        let extra = NibblePath::from_packed(extra_len, &bytes[extra_at + 1..end]);
        Some((
            Key {
                kind,
                path,
                extra,
            },
            &bytes[end..],
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(byte: u8) -> H256 {
        H256([byte; 32])
    }

    #[test]
    fn nibbles_read_high_first() {
        let path = NibblePath::full(&hash(0xAB));
        assert_eq!(0xA, path.nibble(0));
        assert_eq!(0xB, path.nibble(1));
        assert_eq!(0xA, path.nibble(62));
        assert_eq!(0xB, path.nibble(63));
    }

    #[test]
    fn truncation_is_canonical() {
        let mut raw = [0u8; 32];
        raw[0] = 0xFF;
        raw[1] = 0xFA;
        let a = NibblePath::truncated(&hash(0xFF), 3);
        let b = NibblePath::truncated(&H256(raw), 3);
        assert_eq!(a, b);
        assert_eq!(3, a.len());
        assert_eq!(None, a.as_hash());
    }

    #[test]
    fn full_path_round_trips_to_hash() {
        let h = hash(0x42);
        assert_eq!(Some(h), NibblePath::full(&h).as_hash());
    }

    #[test]
    fn encode_decode_round_trip() {
        let keys = [
            Key::account(&hash(0x11)),
            Key::storage(&hash(0x11), &hash(0x22)),
            Key::merkle(NibblePath::empty()),
            Key::merkle(NibblePath::truncated(&hash(0x33), 7)),
            Key::storage_merkle(&hash(0x11), NibblePath::truncated(&hash(0x44), 10)),
        ];
        for key in &keys {
            let mut buf = [0u8; Key::MAX_ENCODED];
            let encoded = key.write_to(&mut buf);
            let (decoded, rest) = Key::read_from(encoded).unwrap();
            assert_eq!(*key, decoded);
            assert!(rest.is_empty());
        }
    }

    #[test]
    fn distinct_keys_encode_distinctly() {
        let mut buf_a = [0u8; Key::MAX_ENCODED];
        let mut buf_b = [0u8; Key::MAX_ENCODED];
        let a = Key::account(&hash(0x11)).write_to(&mut buf_a).to_vec();
        let b = Key::storage(&hash(0x11), &hash(0x11)).write_to(&mut buf_b).to_vec();
        assert_ne!(a, b);
        assert_ne!(key_hash(&a), key_hash(&b));
    }

    #[test]
    fn destroyed_hash_applies_to_full_paths_only() {
        assert_ne!(0, Key::account(&hash(0x11)).destroyed_hash());
        assert_ne!(0, Key::storage(&hash(0x11), &hash(0x22)).destroyed_hash());
        assert_eq!(0, Key::merkle(NibblePath::truncated(&hash(0x11), 8)).destroyed_hash());

        // The marker only depends on the owning account.
        assert_eq!(
            Key::account(&hash(0x11)).destroyed_hash(),
            Key::storage(&hash(0x11), &hash(0x22)).destroyed_hash()
        );
    }

    #[test]
    fn normalization_folds_empty_tree() {
        assert_eq!(H256::zero(), normalize_root(EMPTY_TREE_HASH));
        let other = hash(0x01);
        assert_eq!(other, normalize_root(other));
    }

    #[test]
    fn empty_tree_hash_constant() {
        use rustc_hex::FromHex;

        let raw: Vec<u8> =
            "56e81f171bcc55a6ff8345e692c0f86e5b48e01b996cadc001622fb5e363b421".from_hex().unwrap();
        assert_eq!(EMPTY_TREE_HASH, H256::from_slice(&raw));
    }
}

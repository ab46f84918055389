//! Items, hashed items, and label keys
//!
//! An [`Item`] is an opaque 128-bit value (two u64 words), normally derived
//! from an application string or byte blob by a domain-separated blake3
//! hash. The all-zero item is reserved as the "empty" sentinel used by the
//! receiver's cuckoo table and is rejected as a real set member.
//!
//! A [`HashedItem`] is an item *after* the OPRF (or, when the OPRF is
//! disabled, after the plain extraction step); it is deliberately a distinct
//! type so unhashed items cannot leak into the intersection engine. The
//! paired [`LabelKey`] is the symmetric key half of the same extraction and
//! feeds the label AEAD.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::bitstring::{self, CodecError};
use crate::ffield::{Felt, Modulus};

/// Bit width of every item (and of every label part).
pub const ITEM_BIT_COUNT: usize = 128;

/// Byte width of an item.
pub const ITEM_BYTE_COUNT: usize = ITEM_BIT_COUNT / 8;

/// Domain-separation prefix for hashing application data into items.
const ITEM_HASH_DOMAIN: &str = "apsi.item.v1";

/// An opaque 128-bit item, stored as two little-endian u64 words.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Item(pub [u64; 2]);

impl Item {
    /// The reserved all-zero "empty" sentinel.
    pub const EMPTY: Item = Item([0, 0]);

    /// Hash arbitrary application bytes into an item.
    pub fn hash(data: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(ITEM_HASH_DOMAIN.as_bytes());
        hasher.update(&(data.len() as u64).to_le_bytes());
        hasher.update(data);
        let digest = hasher.finalize();
        let mut bytes = [0u8; ITEM_BYTE_COUNT];
        bytes.copy_from_slice(&digest.as_bytes()[..ITEM_BYTE_COUNT]);
        Self::from_bytes(bytes)
    }

    /// Interpret 16 little-endian bytes as an item, without hashing.
    pub fn from_bytes(bytes: [u8; ITEM_BYTE_COUNT]) -> Self {
        let lo = u64::from_le_bytes(bytes[0..8].try_into().expect("8 bytes"));
        let hi = u64::from_le_bytes(bytes[8..16].try_into().expect("8 bytes"));
        Item([lo, hi])
    }

    /// The item's 16 little-endian bytes.
    pub fn to_bytes(self) -> [u8; ITEM_BYTE_COUNT] {
        let mut out = [0u8; ITEM_BYTE_COUNT];
        out[0..8].copy_from_slice(&self.0[0].to_le_bytes());
        out[8..16].copy_from_slice(&self.0[1].to_le_bytes());
        out
    }

    /// Whether this is the reserved empty sentinel.
    #[inline]
    pub fn is_empty_sentinel(self) -> bool {
        self == Self::EMPTY
    }
}

impl From<u128> for Item {
    fn from(v: u128) -> Self {
        Item([v as u64, (v >> 64) as u64])
    }
}

impl fmt::Debug for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Item({})", hex::encode(self.to_bytes()))
    }
}

impl fmt::Display for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.to_bytes()))
    }
}

/// A 128-bit item after OPRF evaluation (or plain extraction).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HashedItem(pub [u64; 2]);

impl HashedItem {
    pub fn from_bytes(bytes: [u8; ITEM_BYTE_COUNT]) -> Self {
        let item = Item::from_bytes(bytes);
        HashedItem(item.0)
    }

    pub fn to_bytes(self) -> [u8; ITEM_BYTE_COUNT] {
        Item(self.0).to_bytes()
    }

    /// Encode into the minimal number of field elements.
    pub fn to_felts(self, modulus: Modulus) -> Result<Vec<Felt>, CodecError> {
        bitstring::bits_to_felts(&self.to_bytes(), ITEM_BIT_COUNT, modulus)
    }

    /// Encode into exactly `width` field elements, zero-padding when the
    /// configured `felts_per_item` exceeds the minimal packing width.
    pub fn to_felts_padded(
        self,
        modulus: Modulus,
        width: usize,
    ) -> Result<Vec<Felt>, CodecError> {
        let mut felts = self.to_felts(modulus)?;
        debug_assert!(felts.len() <= width, "width below the minimal packing");
        felts.resize(width, 0);
        Ok(felts)
    }
}

impl fmt::Debug for HashedItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HashedItem({})", hex::encode(self.to_bytes()))
    }
}

/// Symmetric key for label encryption, paired with a [`HashedItem`] by the
/// extraction step.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelKey(pub [u8; 16]);

impl fmt::Debug for LabelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print key material.
        f.write_str("LabelKey(..)")
    }
}

// ============================================================================
// Tests
// ============================================================================

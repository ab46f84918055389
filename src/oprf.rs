//! Oblivious PRF on a prime-order group
//!
//! The OPRF blinds items before intersection: the receiver learns
//! `F_k(x) = extract(k·H(x))` without the sender learning `x`, and without
//! the receiver learning the sender's long-lived key `k`.
//!
//! The group is Ristretto (prime order, canonical 32-byte encodings,
//! constant-time scalar arithmetic). Per item `x`:
//! - receiver samples a nonzero blind `r`, sends `A = r·H(x)`;
//! - sender replies `B = k·A`, rejecting any encoding that is not a valid
//!   group element;
//! - receiver computes `r⁻¹·B = k·H(x)` and expands it, via a keyed hash of
//!   the canonical point encoding, into a 256-bit extract: the first 128
//!   bits become the [`HashedItem`], the second 128 the [`LabelKey`].
//!
//! Blinding is information-theoretic: `A` is a uniformly random group
//! element whatever `x` is, and `r` never leaves the receiver. All
//! secret-dependent work happens inside the curve library; nothing in this
//! wrapper branches on secret bytes.

#![forbid(unsafe_code)]

use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::item::{HashedItem, Item, LabelKey, ITEM_BYTE_COUNT};

/// Byte width of one encoded group element on the wire.
pub const POINT_BYTE_COUNT: usize = 32;

const HASH_TO_GROUP_DOMAIN: &str = "apsi.oprf.h2g.v1";
const EXTRACT_DOMAIN: &[u8] = b"apsi.oprf.extract.v1";
const PLAIN_EXTRACT_DOMAIN: &str = "apsi.oprf.plain.v1";

/// Errors surfaced by OPRF processing.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum OprfError {
    #[error("blob of {0} bytes is not a whole number of encoded points")]
    MalformedBlob(usize),
    #[error("point {index} is not a valid curve point")]
    InvalidCurvePoint { index: usize },
    #[error("response carries {got} points, request carried {expected}")]
    ResponseSizeMismatch { got: usize, expected: usize },
}

// ============================================================================
// Key
// ============================================================================

/// The sender's long-lived OPRF key: a uniformly random nonzero scalar.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OprfKey {
    bytes: [u8; 32],
}

impl OprfKey {
    /// Sample a fresh key. The zero scalar is reserved and regenerated.
    pub fn random(rng: &mut impl RngCore) -> Self {
        Self { bytes: random_nonzero_scalar(rng).to_bytes() }
    }

    #[inline]
    fn scalar(&self) -> Scalar {
        Scalar::from_bytes_mod_order(self.bytes)
    }
}

impl std::fmt::Debug for OprfKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.write_str("OprfKey(..)")
    }
}

fn random_nonzero_scalar(rng: &mut impl RngCore) -> Scalar {
    loop {
        let mut wide = [0u8; 64];
        rng.fill_bytes(&mut wide);
        let s = Scalar::from_bytes_mod_order_wide(&wide);
        if s != Scalar::ZERO {
            return s;
        }
    }
}

/// Map an item onto the group through a 64-byte XOF expansion.
fn hash_to_group(item: &Item) -> RistrettoPoint {
    let key = blake3::derive_key(HASH_TO_GROUP_DOMAIN, &item.to_bytes());
    let mut xof = blake3::Hasher::new_keyed(&key).finalize_xof();
    let mut wide = [0u8; 64];
    xof.fill(&mut wide);
    RistrettoPoint::from_uniform_bytes(&wide)
}

/// Expand an evaluated point into `(HashedItem, LabelKey)`.
fn extract(point: &RistrettoPoint) -> (HashedItem, LabelKey) {
    let encoded = point.compress();
    let mut hasher = blake3::Hasher::new_keyed(encoded.as_bytes());
    hasher.update(EXTRACT_DOMAIN);
    let digest = hasher.finalize();
    let bytes = digest.as_bytes();

    let mut item_bytes = [0u8; ITEM_BYTE_COUNT];
    item_bytes.copy_from_slice(&bytes[..ITEM_BYTE_COUNT]);
    let mut key_bytes = [0u8; 16];
    key_bytes.copy_from_slice(&bytes[ITEM_BYTE_COUNT..32]);
    (HashedItem::from_bytes(item_bytes), LabelKey(key_bytes))
}

// ============================================================================
// Receiver side
// ============================================================================

/// Per-request unblinding state, indexed by item position. Holds the blind
/// inverses; dropping it forgets them.
pub struct OprfReceiverState {
    inv_blinds: Vec<Scalar>,
}

impl OprfReceiverState {
    /// Number of items this state was built for.
    pub fn item_count(&self) -> usize {
        self.inv_blinds.len()
    }
}

/// Blind `items` into a request blob of concatenated encoded points.
pub fn blind_items(items: &[Item], rng: &mut impl RngCore) -> (Vec<u8>, OprfReceiverState) {
    let mut blob = Vec::with_capacity(items.len() * POINT_BYTE_COUNT);
    let mut inv_blinds = Vec::with_capacity(items.len());
    for item in items {
        let r = random_nonzero_scalar(rng);
        let blinded = hash_to_group(item) * r;
        blob.extend_from_slice(blinded.compress().as_bytes());
        inv_blinds.push(r.invert());
    }
    (blob, OprfReceiverState { inv_blinds })
}

/// Unblind a response blob and extract the hashed items and label keys, in
/// request order. The whole response is rejected if any point is invalid or
/// the count disagrees with the request.
pub fn unblind_responses(
    state: &OprfReceiverState,
    blob: &[u8],
) -> Result<Vec<(HashedItem, LabelKey)>, OprfError> {
    let points = decode_blob(blob)?;
    if points.len() != state.inv_blinds.len() {
        return Err(OprfError::ResponseSizeMismatch {
            got: points.len(),
            expected: state.inv_blinds.len(),
        });
    }
    Ok(points
        .into_iter()
        .zip(&state.inv_blinds)
        .map(|(b, r_inv)| extract(&(b * r_inv)))
        .collect())
}

// ============================================================================
// Sender side
// ============================================================================

/// Evaluate every encoded point in a request blob under `key`. Output blob
/// has the same length as the input.
pub fn evaluate_blob(key: &OprfKey, blob: &[u8]) -> Result<Vec<u8>, OprfError> {
    let points = decode_blob(blob)?;
    let k = key.scalar();
    let mut out = Vec::with_capacity(blob.len());
    for point in points {
        out.extend_from_slice((point * k).compress().as_bytes());
    }
    Ok(out)
}

/// Direct evaluation of the sender's own item (used when building the DB).
pub fn evaluate_item(key: &OprfKey, item: &Item) -> (HashedItem, LabelKey) {
    extract(&(hash_to_group(item) * key.scalar()))
}

/// Extraction used when the OPRF is disabled: both sides derive the hashed
/// item and label key from the item alone.
pub fn plain_extract(item: &Item) -> (HashedItem, LabelKey) {
    let bytes = blake3::derive_key(PLAIN_EXTRACT_DOMAIN, &item.to_bytes());
    let mut item_bytes = [0u8; ITEM_BYTE_COUNT];
    item_bytes.copy_from_slice(&bytes[..ITEM_BYTE_COUNT]);
    let mut key_bytes = [0u8; 16];
    key_bytes.copy_from_slice(&bytes[ITEM_BYTE_COUNT..32]);
    (HashedItem::from_bytes(item_bytes), LabelKey(key_bytes))
}

fn decode_blob(blob: &[u8]) -> Result<Vec<RistrettoPoint>, OprfError> {
    if blob.len() % POINT_BYTE_COUNT != 0 {
        return Err(OprfError::MalformedBlob(blob.len()));
    }
    blob.chunks_exact(POINT_BYTE_COUNT)
        .enumerate()
        .map(|(index, chunk)| {
            CompressedRistretto::from_slice(chunk)
                .ok()
                .and_then(|c| c.decompress())
                .ok_or(OprfError::InvalidCurvePoint { index })
        })
        .collect()
}

// ============================================================================
// Tests
// ============================================================================

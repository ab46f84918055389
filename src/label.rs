//! Label encryption
//!
//! Labels are stored and returned encrypted under a per-item [`LabelKey`]
//! (the second half of the OPRF extraction, so only a party that actually
//! holds the item can open its label). The construction is an AEAD stream:
//!
//! ```text
//! stored = nonce ‖ (plain ⊕ XOF(derive(key ‖ nonce))) ‖ mac16
//! ```
//!
//! with a keyed-blake3 XOF as the keystream and a keyed-blake3 MAC over
//! `nonce ‖ ciphertext`, truncated to 16 bytes. Nonces are per-item random
//! bytes of a configurable width; the MAC width is fixed.

#![forbid(unsafe_code)]

use rand::RngCore;

use crate::item::LabelKey;

/// Byte width of the trailing MAC.
pub const MAC_BYTE_COUNT: usize = 16;

const STREAM_DOMAIN: &str = "apsi.label.stream.v1";
const MAC_DOMAIN: &str = "apsi.label.mac.v1";

/// Errors surfaced when opening a stored label.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LabelError {
    #[error("label authentication failed")]
    InvalidLabel,
    #[error("stored label too short: {got} bytes, need at least {need}")]
    MalformedLabel { got: usize, need: usize },
}

/// Stored byte width for a plaintext label of `label_byte_count` bytes.
#[inline]
pub fn stored_label_byte_count(label_byte_count: usize, nonce_byte_count: usize) -> usize {
    nonce_byte_count + label_byte_count + MAC_BYTE_COUNT
}

fn subkey(domain: &str, key: &LabelKey, nonce: &[u8]) -> [u8; 32] {
    let mut material = Vec::with_capacity(key.0.len() + nonce.len());
    material.extend_from_slice(&key.0);
    material.extend_from_slice(nonce);
    blake3::derive_key(domain, &material)
}

fn apply_keystream(key: &LabelKey, nonce: &[u8], data: &mut [u8]) {
    let mut xof = blake3::Hasher::new_keyed(&subkey(STREAM_DOMAIN, key, nonce)).finalize_xof();
    let mut stream = vec![0u8; data.len()];
    xof.fill(&mut stream);
    for (d, s) in data.iter_mut().zip(&stream) {
        *d ^= s;
    }
}

fn mac(key: &LabelKey, nonce: &[u8], ciphertext: &[u8]) -> [u8; MAC_BYTE_COUNT] {
    let mut hasher = blake3::Hasher::new_keyed(&subkey(MAC_DOMAIN, key, nonce));
    hasher.update(nonce);
    hasher.update(ciphertext);
    let digest = hasher.finalize();
    let mut out = [0u8; MAC_BYTE_COUNT];
    out.copy_from_slice(&digest.as_bytes()[..MAC_BYTE_COUNT]);
    out
}

/// Encrypt `plain` under `key` with a fresh random nonce of
/// `nonce_byte_count` bytes. Returns the stored form.
pub fn encrypt_label(
    plain: &[u8],
    key: &LabelKey,
    nonce_byte_count: usize,
    rng: &mut impl RngCore,
) -> Vec<u8> {
    let mut nonce = vec![0u8; nonce_byte_count];
    rng.fill_bytes(&mut nonce);

    let mut out = Vec::with_capacity(stored_label_byte_count(plain.len(), nonce_byte_count));
    out.extend_from_slice(&nonce);
    let body_start = out.len();
    out.extend_from_slice(plain);
    apply_keystream(key, &nonce, &mut out[body_start..]);
    let tag = mac(key, &nonce, &out[body_start..]);
    out.extend_from_slice(&tag);
    out
}

/// Open a stored label. Fails with [`LabelError::InvalidLabel`] on MAC
/// mismatch; the plaintext is only produced after authentication.
pub fn decrypt_label(
    stored: &[u8],
    key: &LabelKey,
    nonce_byte_count: usize,
) -> Result<Vec<u8>, LabelError> {
    let need = nonce_byte_count + MAC_BYTE_COUNT;
    if stored.len() < need {
        return Err(LabelError::MalformedLabel { got: stored.len(), need });
    }
    let (nonce, rest) = stored.split_at(nonce_byte_count);
    let (ciphertext, tag) = rest.split_at(rest.len() - MAC_BYTE_COUNT);

    let expected = mac(key, nonce, ciphertext);
    // Branch-free comparison; reject before any decryption work.
    let diff = expected
        .iter()
        .zip(tag)
        .fold(0u8, |acc, (a, b)| acc | (a ^ b));
    if diff != 0 {
        return Err(LabelError::InvalidLabel);
    }

    let mut plain = ciphertext.to_vec();
    apply_keystream(key, nonce, &mut plain);
    Ok(plain)
}

// ============================================================================
// Tests
// ============================================================================

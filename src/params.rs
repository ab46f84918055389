//! Protocol parameters
//!
//! [`PsiParams`] is the frozen configuration both parties must agree on
//! before any query: item packing width, cuckoo table shape, the sparse
//! query power set, and the scheme parameters. Every invariant is enforced
//! at construction, so a `PsiParams` value in hand is always coherent:
//!
//! - the plain modulus is prime and supports batching (`p ≡ 1 mod 2N`);
//! - `table_size` is a power of two;
//! - `felts_per_item` divides `N` and carries a full 128-bit item;
//! - `hash_func_count ∈ [1, 8]`;
//! - `powers_set` contains 1 and reaches every power in
//!   `[1, max_items_per_bin]` under the powers DAG.
//!
//! The derived quantities (`items_per_bundle`, `bundle_count`,
//! `bins_per_bundle`) are methods, not stored fields, so they can never
//! drift from their inputs.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::bitstring;
use crate::ffield::Modulus;
use crate::he::EncryptionParameters;
use crate::item::ITEM_BIT_COUNT;
use crate::label::MAC_BYTE_COUNT;
use crate::powers::PowersDag;

/// Errors surfaced by parameter validation.
#[derive(Debug, thiserror::Error)]
pub enum ParamsError {
    #[error("plain modulus {0} is not a prime of at least 3")]
    InvalidModulus(u64),
    #[error("felts_per_item={felts_per_item} is invalid for degree {degree} and modulus {modulus}")]
    InvalidFeltsPerItem { felts_per_item: u32, degree: usize, modulus: u64 },
    #[error("table_size {0} must be a positive power of two")]
    NonPowerOfTwoTableSize(u32),
    #[error("query power {power} is unreachable from the source power set")]
    PowersDagUnreachable { power: u32 },
    #[error("incompatible parameters: {0}")]
    IncompatibleParameters(&'static str),
}

/// Item packing configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemParams {
    /// Field elements per item; each carries `bitlen(p) − 1` bits.
    pub felts_per_item: u32,
}

/// Cuckoo table configuration, shared by both parties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableParams {
    /// Slot count; a power of two.
    pub table_size: u32,
    /// Bin occupancy cap inside every bin bundle.
    pub max_items_per_bin: u32,
    /// Number of cuckoo location functions, in `[1, 8]`.
    pub hash_func_count: u32,
    /// Seed of the location functions.
    pub hash_func_seed: u64,
}

/// Query configuration: the sparse set of encrypted powers the receiver
/// sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryParams {
    pub powers_set: BTreeSet<u32>,
}

/// The frozen, negotiated protocol configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PsiParams {
    item: ItemParams,
    table: TableParams,
    query: QueryParams,
    he: EncryptionParameters,
}

impl PsiParams {
    pub fn new(
        item: ItemParams,
        table: TableParams,
        query: QueryParams,
        he: EncryptionParameters,
    ) -> Result<Self, ParamsError> {
        let modulus = Modulus::new(he.plain_modulus())
            .map_err(|_| ParamsError::InvalidModulus(he.plain_modulus()))?;
        if modulus.value() < 3 || !modulus.is_prime() {
            return Err(ParamsError::InvalidModulus(modulus.value()));
        }

        let degree = he.poly_modulus_degree();
        if (he.plain_modulus() - 1) % (2 * degree as u64) != 0 {
            return Err(ParamsError::IncompatibleParameters(
                "plain modulus does not support batching at this degree",
            ));
        }

        if table.table_size == 0 || !table.table_size.is_power_of_two() {
            return Err(ParamsError::NonPowerOfTwoTableSize(table.table_size));
        }
        if !(1..=8).contains(&table.hash_func_count) {
            return Err(ParamsError::IncompatibleParameters(
                "hash_func_count must lie in [1, 8]",
            ));
        }
        if table.max_items_per_bin == 0 {
            return Err(ParamsError::IncompatibleParameters(
                "max_items_per_bin must be positive",
            ));
        }

        let fpi = item.felts_per_item as usize;
        let carries_item = fpi * bitstring::bits_per_felt(modulus) >= ITEM_BIT_COUNT;
        if fpi == 0 || degree % fpi != 0 || !carries_item {
            return Err(ParamsError::InvalidFeltsPerItem {
                felts_per_item: item.felts_per_item,
                degree,
                modulus: modulus.value(),
            });
        }

        if !query.powers_set.contains(&1) {
            return Err(ParamsError::IncompatibleParameters(
                "powers_set must contain power 1",
            ));
        }
        if query.powers_set.iter().any(|&k| k == 0 || k > table.max_items_per_bin) {
            return Err(ParamsError::IncompatibleParameters(
                "powers_set entries must lie in [1, max_items_per_bin]",
            ));
        }
        let targets: BTreeSet<u32> = (1..=table.max_items_per_bin).collect();
        PowersDag::configure(&query.powers_set, &targets)
            .map_err(|e| match e {
                crate::powers::PowersDagError::Unreachable { power } => {
                    ParamsError::PowersDagUnreachable { power }
                }
                _ => ParamsError::IncompatibleParameters("invalid powers_set"),
            })?;

        Ok(Self { item, table, query, he })
    }

    // ------------------------------ Accessors ------------------------------

    #[inline]
    pub fn item(&self) -> &ItemParams {
        &self.item
    }

    #[inline]
    pub fn table(&self) -> &TableParams {
        &self.table
    }

    #[inline]
    pub fn query(&self) -> &QueryParams {
        &self.query
    }

    #[inline]
    pub fn he(&self) -> &EncryptionParameters {
        &self.he
    }

    #[inline]
    pub fn felts_per_item(&self) -> usize {
        self.item.felts_per_item as usize
    }

    #[inline]
    pub fn table_size(&self) -> usize {
        self.table.table_size as usize
    }

    /// The plain modulus as a field handle. Infallible: validated at
    /// construction.
    pub fn plain_modulus(&self) -> Modulus {
        Modulus::new(self.he.plain_modulus()).expect("validated at construction")
    }

    // ------------------------------- Derived -------------------------------

    /// Items per bin bundle: `N / felts_per_item`.
    #[inline]
    pub fn items_per_bundle(&self) -> usize {
        self.he.poly_modulus_degree() / self.felts_per_item()
    }

    /// Bins per bundle: one per batching slot.
    #[inline]
    pub fn bins_per_bundle(&self) -> usize {
        self.he.poly_modulus_degree()
    }

    /// Number of bundle indices covering the cuckoo table.
    #[inline]
    pub fn bundle_count(&self) -> usize {
        (self.table_size() + self.items_per_bundle() - 1) / self.items_per_bundle()
    }

    /// Number of 128-bit label parts for a stored (nonce ‖ ciphertext ‖ MAC)
    /// label of the given widths. Zero when unlabeled.
    pub fn label_size(&self, label_byte_count: usize, nonce_byte_count: usize) -> usize {
        if label_byte_count == 0 {
            return 0;
        }
        let stored_bits = 8 * (nonce_byte_count + label_byte_count + MAC_BYTE_COUNT);
        (stored_bits + ITEM_BIT_COUNT - 1) / ITEM_BIT_COUNT
    }

    /// The shared powers DAG for this configuration. Infallible: validated
    /// at construction.
    pub fn powers_dag(&self) -> PowersDag {
        let targets: BTreeSet<u32> = (1..=self.table.max_items_per_bin).collect();
        PowersDag::configure(&self.query.powers_set, &targets)
            .expect("validated at construction")
    }

    #[inline]
    pub fn max_items_per_bin(&self) -> usize {
        self.table.max_items_per_bin as usize
    }
}

// ============================================================================
// Tests
// ============================================================================

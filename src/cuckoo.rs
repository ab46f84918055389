//! Receiver-side cuckoo table
//!
//! The receiver packs its (hashed) query items into a `table_size`-slot
//! cuckoo table with `hash_func_count` location functions and a bounded
//! random-walk eviction budget. Each slot holds at most one item together
//! with the index of the originating input, so result decoding can undo the
//! cuckoo permutation. Unused slots keep the all-zero empty sentinel.
//!
//! The location functions are keyed blake3 hashes seeded by the table-wide
//! `hash_func_seed` from the negotiated parameters; the sender computes the
//! same locations when it places its own items, which is what makes the
//! intersection line up.

#![forbid(unsafe_code)]

use rand::Rng;

use crate::item::HashedItem;

/// Errors surfaced by table insertion.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CuckooError {
    #[error("eviction limit reached after {probes} probes (table too full)")]
    EvictionLimit { probes: usize },
}

const LOCATION_DOMAIN: &str = "apsi.cuckoo.loc.v1";

/// Default random-walk probe budget.
pub const DEFAULT_MAX_PROBE: usize = 100;

/// The table slot an item maps to under location function `func_idx`.
pub fn location(item: &HashedItem, func_idx: u32, seed: u64, table_size: usize) -> usize {
    debug_assert!(table_size > 0);
    let mut material = [0u8; 12];
    material[..8].copy_from_slice(&seed.to_le_bytes());
    material[8..].copy_from_slice(&func_idx.to_le_bytes());
    let key = blake3::derive_key(LOCATION_DOMAIN, &material);
    let mut hasher = blake3::Hasher::new_keyed(&key);
    hasher.update(&item.to_bytes());
    let digest = hasher.finalize();
    let word = u64::from_le_bytes(digest.as_bytes()[..8].try_into().expect("8 bytes"));
    (word % table_size as u64) as usize
}

/// All distinct locations of an item, in location-function order.
pub fn locations(
    item: &HashedItem,
    hash_func_count: u32,
    seed: u64,
    table_size: usize,
) -> Vec<usize> {
    let mut out = Vec::with_capacity(hash_func_count as usize);
    for func_idx in 0..hash_func_count {
        let loc = location(item, func_idx, seed, table_size);
        if !out.contains(&loc) {
            out.push(loc);
        }
    }
    out
}

/// One occupied slot: the resident item and the index of the input it came
/// from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CuckooEntry {
    pub item: HashedItem,
    pub input_idx: usize,
}

/// A `d`-choice cuckoo table with bounded random-walk eviction.
pub struct CuckooTable {
    table_size: usize,
    hash_func_count: u32,
    seed: u64,
    max_probe: usize,
    slots: Vec<Option<CuckooEntry>>,
}

impl CuckooTable {
    pub fn new(table_size: usize, hash_func_count: u32, seed: u64) -> Self {
        Self::with_max_probe(table_size, hash_func_count, seed, DEFAULT_MAX_PROBE)
    }

    pub fn with_max_probe(
        table_size: usize,
        hash_func_count: u32,
        seed: u64,
        max_probe: usize,
    ) -> Self {
        Self {
            table_size,
            hash_func_count,
            seed,
            max_probe,
            slots: vec![None; table_size],
        }
    }

    #[inline]
    pub fn table_size(&self) -> usize {
        self.table_size
    }

    /// Read-only view of the slots; `None` marks the empty sentinel.
    #[inline]
    pub fn slots(&self) -> &[Option<CuckooEntry>] {
        &self.slots
    }

    /// Number of occupied slots.
    pub fn fill_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Insert one item, evicting residents along a random walk if needed.
    /// Failure leaves the table in a valid (if permuted) state; every
    /// previously inserted item is still resident somewhere.
    pub fn insert(
        &mut self,
        item: HashedItem,
        input_idx: usize,
        rng: &mut impl Rng,
    ) -> Result<(), CuckooError> {
        let mut current = CuckooEntry { item, input_idx };
        for _probe in 0..self.max_probe {
            let locs = locations(&current.item, self.hash_func_count, self.seed, self.table_size);
            if let Some(&free) = locs.iter().find(|&&loc| self.slots[loc].is_none()) {
                self.slots[free] = Some(current);
                return Ok(());
            }
            // All candidate slots occupied: evict a random resident.
            let victim_loc = locs[rng.gen_range(0..locs.len())];
            let evicted = self.slots[victim_loc]
                .replace(current)
                .expect("occupied slot has a resident");
            current = evicted;
        }
        Err(CuckooError::EvictionLimit { probes: self.max_probe })
    }
}

// ============================================================================
// Tests
// ============================================================================

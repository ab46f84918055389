//! Sender database
//!
//! [`SenderDb`] owns the sender's entire set as bin-bundle chains. Placement
//! of one item:
//!
//! 1. compute its (deduplicated) cuckoo locations in the `table_size`-slot
//!    table — the same locations the receiver's table uses;
//! 2. each location maps to `bundle_idx = slot / items_per_bundle` and a
//!    start bin `(slot % items_per_bundle) · felts_per_item`;
//! 3. encode the OPRF'd item (and its encrypted label) into felts;
//! 4. try a dry-run insert into each bundle chained at that index, taking
//!    the first whose bins stay within `max_items_per_bin`;
//! 5. if none accepts, open a new bundle in that chain.
//!
//! An item is placed at **every** one of its locations, because the
//! receiver's cuckoo table stores it at just one of them and the sender
//! cannot know which. Removal symmetrically unplaces all locations.
//!
//! The struct itself is unsynchronized; the orchestrator wraps it in a
//! reader-writer lock (writers: insert/remove/clear/strip/regen; readers:
//! query evaluation and serialization).

#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::io::{Read, Write};

use rand::RngCore;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::bin_bundle::{BinBundle, BinBundleError};
use crate::bitstring;
use crate::context::CryptoContext;
use crate::ffield::Felt;
use crate::he::HeError;
use crate::item::{HashedItem, Item, LabelKey, ITEM_BIT_COUNT, ITEM_BYTE_COUNT};
use crate::label;
use crate::oprf::{self, OprfKey};
use crate::params::{ParamsError, PsiParams};

/// Dump framing.
const DB_MAGIC: u32 = 0xA5D1_DB01;
const DB_VERSION: u32 = 1;

/// Per-item failure inside a batch operation.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum BatchItemError {
    #[error("item already present")]
    DuplicateKey,
    #[error("item not present")]
    NotPresent,
    #[error("the all-zero item is reserved")]
    ReservedItem,
    #[error("label is {got} bytes, database stores {expected}-byte labels")]
    LabelLengthMismatch { got: usize, expected: usize },
}

/// Errors surfaced by the sender database.
#[derive(Debug, thiserror::Error)]
pub enum SenderDbError {
    #[error(transparent)]
    Params(#[from] ParamsError),
    #[error(transparent)]
    He(#[from] HeError),
    #[error(transparent)]
    Bundle(#[from] BinBundleError),
    #[error("{failed} of {total} items failed; first failure at index {first_index}: {first}")]
    PartialBatch {
        failed: usize,
        total: usize,
        first_index: usize,
        first: BatchItemError,
        errors: Vec<(usize, BatchItemError)>,
    },
    #[error("operation requires a labeled database")]
    NotLabeled,
    #[error("operation requires an unlabeled database")]
    NotUnlabeled,
    #[error("database has been stripped; set mutations are no longer possible")]
    Stripped,
    #[error("bin overflow at bundle index {bundle_idx}")]
    BinOverflow { bundle_idx: usize },
    #[error("stored item missing from bundle chain {bundle_idx}; database corrupted")]
    Corrupted { bundle_idx: usize },
    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization failure: {0}")]
    Codec(#[from] bincode::Error),
    #[error("bad magic number in database dump")]
    BadMagic,
    #[error("database dump version {got} is not supported (expected {expected})")]
    VersionMismatch { got: u32, expected: u32 },
}

/// Serialized body of a database dump (everything after magic/version).
#[derive(Serialize, Deserialize)]
struct DumpBody {
    params: PsiParams,
    label_byte_count: u32,
    nonce_byte_count: u32,
    oprf_key: Option<OprfKey>,
    item_set: Option<Vec<HashedItem>>,
    bundles: Vec<Vec<BinBundle>>,
}

/// The sender's set, arranged for batched polynomial evaluation.
pub struct SenderDb {
    params: PsiParams,
    crypto: CryptoContext,
    oprf_key: Option<OprfKey>,
    label_byte_count: usize,
    nonce_byte_count: usize,
    /// Bundle chains, indexed by `bundle_idx ∈ [0, bundle_count)`.
    bundles: Vec<Vec<BinBundle>>,
    /// Hashed-item membership for duplicate detection; `None` once stripped.
    item_set: Option<BTreeSet<HashedItem>>,
}

impl SenderDb {
    /// Create an empty database. `label_byte_count == 0` selects unlabeled
    /// mode; `oprf_key = None` disables the OPRF front-end (both sides then
    /// use the plain extraction).
    pub fn new(
        params: PsiParams,
        label_byte_count: usize,
        nonce_byte_count: usize,
        oprf_key: Option<OprfKey>,
    ) -> Result<Self, SenderDbError> {
        let crypto = CryptoContext::new(params.he().clone())?;
        let bundle_count = params.bundle_count();
        Ok(Self {
            params,
            crypto,
            oprf_key,
            label_byte_count,
            nonce_byte_count,
            bundles: (0..bundle_count).map(|_| Vec::new()).collect(),
            item_set: Some(BTreeSet::new()),
        })
    }

    // ------------------------------ Accessors ------------------------------

    #[inline]
    pub fn params(&self) -> &PsiParams {
        &self.params
    }

    #[inline]
    pub fn crypto(&self) -> &CryptoContext {
        &self.crypto
    }

    #[inline]
    pub fn is_labeled(&self) -> bool {
        self.label_byte_count > 0
    }

    #[inline]
    pub fn label_byte_count(&self) -> usize {
        self.label_byte_count
    }

    #[inline]
    pub fn nonce_byte_count(&self) -> usize {
        self.nonce_byte_count
    }

    #[inline]
    pub fn oprf_key(&self) -> Option<&OprfKey> {
        self.oprf_key.as_ref()
    }

    #[inline]
    pub fn is_stripped(&self) -> bool {
        self.item_set.is_none()
    }

    /// Number of items currently stored (0 after `strip`).
    pub fn item_count(&self) -> usize {
        self.item_set.as_ref().map_or(0, |s| s.len())
    }

    /// The bundle chain at one bundle index.
    pub fn bundle_chain(&self, bundle_idx: usize) -> &[BinBundle] {
        &self.bundles[bundle_idx]
    }

    /// Total bundles across all chains.
    pub fn total_bundle_count(&self) -> usize {
        self.bundles.iter().map(|c| c.len()).sum()
    }

    /// Felts per stored label group (label parts).
    pub fn label_size(&self) -> usize {
        self.params.label_size(self.label_byte_count, self.nonce_byte_count)
    }

    /// Hash an item the way this database stores it.
    pub fn hash_item(&self, item: &Item) -> (HashedItem, LabelKey) {
        match &self.oprf_key {
            Some(key) => oprf::evaluate_item(key, item),
            None => oprf::plain_extract(item),
        }
    }

    // ------------------------------ Mutations ------------------------------

    /// Insert a batch into an unlabeled database.
    pub fn insert(&mut self, items: &[Item]) -> Result<(), SenderDbError> {
        if self.is_labeled() {
            return Err(SenderDbError::NotUnlabeled);
        }
        let mut rng = rand::thread_rng();
        self.insert_inner(items.iter().map(|item| (item, None)), &mut rng)
    }

    /// Insert a batch of `(item, label)` pairs into a labeled database.
    pub fn insert_labeled(
        &mut self,
        items: &[(Item, Vec<u8>)],
    ) -> Result<(), SenderDbError> {
        if !self.is_labeled() {
            return Err(SenderDbError::NotLabeled);
        }
        let mut rng = rand::thread_rng();
        self.insert_inner(
            items.iter().map(|(item, label)| (item, Some(label.as_slice()))),
            &mut rng,
        )
    }

    fn insert_inner<'a>(
        &mut self,
        items: impl Iterator<Item = (&'a Item, Option<&'a [u8]>)>,
        rng: &mut impl RngCore,
    ) -> Result<(), SenderDbError> {
        if self.is_stripped() {
            return Err(SenderDbError::Stripped);
        }
        let mut errors: Vec<(usize, BatchItemError)> = Vec::new();
        let mut total = 0usize;

        for (index, (item, label)) in items.enumerate() {
            total += 1;
            if item.is_empty_sentinel() {
                errors.push((index, BatchItemError::ReservedItem));
                continue;
            }
            if let Some(label) = label {
                if label.len() != self.label_byte_count {
                    errors.push((
                        index,
                        BatchItemError::LabelLengthMismatch {
                            got: label.len(),
                            expected: self.label_byte_count,
                        },
                    ));
                    continue;
                }
            }

            let (hashed, label_key) = self.hash_item(item);
            let item_set = self.item_set.as_mut().expect("checked above");
            if !item_set.insert(hashed) {
                errors.push((index, BatchItemError::DuplicateKey));
                continue;
            }

            let label_parts = match label {
                Some(label) => {
                    self.encode_label(label, &label_key, rng)?
                }
                None => Vec::new(),
            };
            self.place_everywhere(&hashed, &label_parts)?;
        }

        debug!(
            inserted = total - errors.len(),
            failed = errors.len(),
            bundles = self.total_bundle_count(),
            "insert batch done"
        );
        Self::batch_outcome(total, errors)
    }

    /// Remove a batch of items (labeled or not).
    pub fn remove(&mut self, items: &[Item]) -> Result<(), SenderDbError> {
        if self.is_stripped() {
            return Err(SenderDbError::Stripped);
        }
        let mut errors: Vec<(usize, BatchItemError)> = Vec::new();
        for (index, item) in items.iter().enumerate() {
            let (hashed, _) = self.hash_item(item);
            let item_set = self.item_set.as_mut().expect("checked above");
            if !item_set.remove(&hashed) {
                errors.push((index, BatchItemError::NotPresent));
                continue;
            }
            self.unplace_everywhere(&hashed)?;
        }
        debug!(removed = items.len() - errors.len(), failed = errors.len(), "remove batch done");
        Self::batch_outcome(items.len(), errors)
    }

    fn batch_outcome(
        total: usize,
        errors: Vec<(usize, BatchItemError)>,
    ) -> Result<(), SenderDbError> {
        if errors.is_empty() {
            return Ok(());
        }
        let (first_index, first) = errors[0].clone();
        Err(SenderDbError::PartialBatch {
            failed: errors.len(),
            total,
            first_index,
            first,
            errors,
        })
    }

    /// Drop every bundle and the item set (parameters and keys survive).
    pub fn clear(&mut self) {
        for chain in &mut self.bundles {
            chain.clear();
        }
        self.item_set = Some(BTreeSet::new());
        info!("sender database cleared");
    }

    /// Discard the hashed-item set and the OPRF key, keeping bundles and
    /// caches. A stripped database still answers queries but accepts no
    /// further set mutations.
    pub fn strip(&mut self) {
        self.item_set = None;
        self.oprf_key = None;
        info!("sender database stripped");
    }

    /// Regenerate every invalid bundle cache, in parallel across bundles.
    /// Valid caches (e.g. freshly loaded ones) are left untouched.
    pub fn regen_caches(&mut self) -> Result<(), SenderDbError> {
        let crypto = &self.crypto;
        let regenerated: usize = self
            .bundles
            .par_iter_mut()
            .flat_map(|chain| chain.par_iter_mut())
            .filter(|bundle| !bundle.cache_valid())
            .map(|bundle| bundle.regen_cache(crypto).map(|_| 1usize))
            .try_reduce(|| 0, |a, b| Ok(a + b))?;
        debug!(regenerated, "bundle caches regenerated");
        Ok(())
    }

    // ----------------------------- Placement ------------------------------

    fn encode_label(
        &self,
        label: &[u8],
        label_key: &LabelKey,
        rng: &mut impl RngCore,
    ) -> Result<Vec<Vec<Felt>>, SenderDbError> {
        let stored = label::encrypt_label(label, label_key, self.nonce_byte_count, rng);
        let label_size = self.label_size();
        let mut padded = stored;
        padded.resize(label_size * ITEM_BYTE_COUNT, 0);

        let modulus = self.params.plain_modulus();
        let width = self.params.felts_per_item();
        let mut parts = Vec::with_capacity(label_size);
        for part in padded.chunks_exact(ITEM_BYTE_COUNT) {
            let mut felts = bitstring::bits_to_felts(part, ITEM_BIT_COUNT, modulus)
                .expect("modulus validated at construction");
            // Match the item's bin span when felts_per_item is wider than
            // the minimal packing.
            felts.resize(width, 0);
            parts.push(felts);
        }
        Ok(parts)
    }

    /// `(key, label-felts)` groups for one hashed item, bin-major.
    fn item_pairs(&self, hashed: &HashedItem, label_parts: &[Vec<Felt>]) -> Vec<(Felt, Vec<Felt>)> {
        let felts = hashed
            .to_felts_padded(self.params.plain_modulus(), self.params.felts_per_item())
            .expect("modulus validated at construction");
        felts
            .iter()
            .enumerate()
            .map(|(j, &key)| {
                let labels = label_parts.iter().map(|part| part[j]).collect();
                (key, labels)
            })
            .collect()
    }

    fn locations(&self, hashed: &HashedItem) -> Vec<usize> {
        let table = self.params.table();
        crate::cuckoo::locations(
            hashed,
            table.hash_func_count,
            table.hash_func_seed,
            self.params.table_size(),
        )
    }

    fn place_everywhere(
        &mut self,
        hashed: &HashedItem,
        label_parts: &[Vec<Felt>],
    ) -> Result<(), SenderDbError> {
        let pairs = self.item_pairs(hashed, label_parts);
        let items_per_bundle = self.params.items_per_bundle();
        let felts_per_item = self.params.felts_per_item();
        let max_bin = self.params.max_items_per_bin();
        let bins_per_bundle = self.params.bins_per_bundle();
        let label_size = self.label_size();

        for slot in self.locations(hashed) {
            let bundle_idx = slot / items_per_bundle;
            let start_bin = (slot % items_per_bundle) * felts_per_item;
            let chain = &mut self.bundles[bundle_idx];

            let mut placed = false;
            for bundle in chain.iter_mut() {
                match bundle.multi_insert(&pairs, start_bin, true) {
                    Some(size) if size <= max_bin => {
                        bundle.multi_insert(&pairs, start_bin, false);
                        placed = true;
                        break;
                    }
                    _ => {}
                }
            }
            if !placed {
                let mut bundle = BinBundle::new(bins_per_bundle, label_size);
                if bundle.multi_insert(&pairs, start_bin, false).is_none() {
                    return Err(SenderDbError::BinOverflow { bundle_idx });
                }
                chain.push(bundle);
            }
        }
        Ok(())
    }

    fn unplace_everywhere(&mut self, hashed: &HashedItem) -> Result<(), SenderDbError> {
        let keys: Vec<Felt> = hashed
            .to_felts_padded(self.params.plain_modulus(), self.params.felts_per_item())
            .expect("modulus validated at construction");
        let items_per_bundle = self.params.items_per_bundle();
        let felts_per_item = self.params.felts_per_item();

        for slot in self.locations(hashed) {
            let bundle_idx = slot / items_per_bundle;
            let start_bin = (slot % items_per_bundle) * felts_per_item;
            let chain = &mut self.bundles[bundle_idx];
            let removed = chain
                .iter_mut()
                .any(|bundle| bundle.try_multi_remove(&keys, start_bin));
            if !removed {
                // The item set said this item exists; its absence from the
                // chain is an internal invariant violation.
                return Err(SenderDbError::Corrupted { bundle_idx });
            }
            chain.retain(|bundle| !bundle.is_empty());
        }
        Ok(())
    }

    // ----------------------------- Persistence ----------------------------

    /// Stable binary dump: magic, version, then the parameter block, keys,
    /// item set, and bundle chains with whatever caches are present.
    pub fn save(&self, writer: &mut impl Write) -> Result<(), SenderDbError> {
        writer.write_all(&DB_MAGIC.to_le_bytes())?;
        writer.write_all(&DB_VERSION.to_le_bytes())?;
        let body = DumpBody {
            params: self.params.clone(),
            label_byte_count: self.label_byte_count as u32,
            nonce_byte_count: self.nonce_byte_count as u32,
            oprf_key: self.oprf_key.clone(),
            item_set: self.item_set.as_ref().map(|s| s.iter().copied().collect()),
            bundles: self.bundles.clone(),
        };
        bincode::serialize_into(writer, &body)?;
        info!(bundles = self.total_bundle_count(), "sender database saved");
        Ok(())
    }

    /// Load a dump written by [`SenderDb::save`]. Caches that were absent
    /// in the dump stay absent; `regen_caches` rebuilds exactly those.
    pub fn load(reader: &mut impl Read) -> Result<Self, SenderDbError> {
        let mut word = [0u8; 4];
        reader.read_exact(&mut word)?;
        if u32::from_le_bytes(word) != DB_MAGIC {
            return Err(SenderDbError::BadMagic);
        }
        reader.read_exact(&mut word)?;
        let version = u32::from_le_bytes(word);
        if version != DB_VERSION {
            return Err(SenderDbError::VersionMismatch { got: version, expected: DB_VERSION });
        }
        let body: DumpBody = bincode::deserialize_from(reader)?;
        let crypto = CryptoContext::new(body.params.he().clone())?;
        info!(bundles = body.bundles.iter().map(|c| c.len()).sum::<usize>(), "sender database loaded");
        Ok(Self {
            params: body.params,
            crypto,
            oprf_key: body.oprf_key,
            label_byte_count: body.label_byte_count as usize,
            nonce_byte_count: body.nonce_byte_count as usize,
            bundles: body.bundles,
            item_set: body.item_set.map(|v| v.into_iter().collect()),
        })
    }
}

impl std::fmt::Debug for SenderDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SenderDb")
            .field("labeled", &self.is_labeled())
            .field("stripped", &self.is_stripped())
            .field("items", &self.item_count())
            .field("bundles", &self.total_bundle_count())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

//! Bin bundles
//!
//! A [`BinBundle`] is the unit of sender-side storage and the unit of
//! ciphertext returned to the receiver: a fixed array of `bins_per_bundle`
//! bins (one per batching slot), each an ordered map from a key felt to the
//! felts of the item's label parts. One item occupies `felts_per_item`
//! consecutive bins starting at `bundle_offset · felts_per_item`.
//!
//! Each bundle owns a cache of everything derivable from its bins:
//!
//! - per bin, the **matching polynomial** — the monic polynomial whose
//!   roots are exactly that bin's keys, so it evaluates to zero precisely
//!   on membership. Empty bins get the reserved sentinel root, which no
//!   encoded query felt can ever equal;
//! - per bin and label part, the **interpolation polynomial** through
//!   `(key, label-felt)` pairs (plus a sentinel anchor point, which keeps
//!   every polynomial at evaluable degree);
//! - the batched forms: one plaintext per coefficient degree, slot `i`
//!   holding bin `i`'s degree-`d` coefficient, NTT-transformed for cheap
//!   slot-wise products (the constant term stays in coefficient form for
//!   the final `add_plain`).
//!
//! The cache is invalid from the moment any bin mutates until
//! [`BinBundle::regen_cache`] runs; readers of an invalid cache get an
//! error, never a partially rebuilt view.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::bitstring;
use crate::context::CryptoContext;
use crate::ffield::Felt;
use crate::he::{Ciphertext, HeError, Plaintext};
use crate::interpolate::{self, FeltPolyn, InterpolationError};

/// Errors surfaced by bundle cache operations.
#[derive(Debug, thiserror::Error)]
pub enum BinBundleError {
    #[error(transparent)]
    He(#[from] HeError),
    #[error(transparent)]
    Interpolation(#[from] InterpolationError),
    #[error("bundle cache is invalid; call regen_cache first")]
    CacheInvalid,
    #[error("batched polynomial has no nonconstant term to evaluate")]
    EmptyPolynomial,
    #[error("evaluation needs {need} ciphertext powers, got {got}")]
    NotEnoughPowers { need: usize, got: usize },
}

// ============================================================================
// Batched plaintext polynomials
// ============================================================================

/// A column of polynomials batched degree-wise into plaintexts.
///
/// For bins with polynomials `P₀, …, P_{N-1}`, plaintext `d` holds
/// `coeff_d(Pᵢ)` in slot `i`. Evaluating against the precomputed query
/// powers `[C¹, …, C^D]` then yields, in slot `i`, the value `Pᵢ` takes at
/// the receiver's felt in that slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchedPlaintextPolyn {
    /// Index = coefficient degree. Entry 0 is coefficient-form; the rest
    /// are NTT-form.
    batched_coeffs: Vec<Plaintext>,
}

impl BatchedPlaintextPolyn {
    /// Batch one polynomial per bin. All polynomials are implicitly
    /// zero-padded to the longest length.
    pub fn new(polyns: &[FeltPolyn], ctx: &CryptoContext) -> Result<Self, BinBundleError> {
        let max_len = polyns.iter().map(|p| p.len()).max().unwrap_or(0);
        let mut batched_coeffs = Vec::with_capacity(max_len);
        let mut slots = vec![0u64; polyns.len()];
        for degree in 0..max_len {
            for (slot, polyn) in slots.iter_mut().zip(polyns) {
                *slot = polyn.get(degree).copied().unwrap_or(0);
            }
            let mut plain = ctx.encoder().encode(&slots)?;
            if degree > 0 {
                ctx.evaluator().transform_plain_to_ntt_inplace(&mut plain)?;
            }
            batched_coeffs.push(plain);
        }
        Ok(Self { batched_coeffs })
    }

    /// Highest coefficient degree (`len − 1`); the number of ciphertext
    /// powers evaluation needs.
    pub fn degree(&self) -> usize {
        self.batched_coeffs.len().saturating_sub(1)
    }

    /// Evaluate `Σ_d coeff_d · C^d` against NTT-form powers
    /// `powers[d-1] = C^d`, treating `C⁰` as the implicit unit.
    pub fn eval(
        &self,
        powers: &[Ciphertext],
        ctx: &CryptoContext,
    ) -> Result<Ciphertext, BinBundleError> {
        if self.batched_coeffs.len() < 2 {
            return Err(BinBundleError::EmptyPolynomial);
        }
        let need = self.degree();
        if powers.len() < need {
            return Err(BinBundleError::NotEnoughPowers { need, got: powers.len() });
        }

        let evaluator = ctx.evaluator();
        let mut acc: Option<Ciphertext> = None;
        for (degree, coeff) in self.batched_coeffs.iter().enumerate().skip(1) {
            let mut term = powers[degree - 1].clone();
            evaluator.multiply_plain_inplace(&mut term, coeff)?;
            match acc.as_mut() {
                None => acc = Some(term),
                Some(sum) => evaluator.add_inplace(sum, &term)?,
            }
        }
        let mut result = acc.expect("len >= 2 yields at least one term");
        evaluator.transform_from_ntt_inplace(&mut result)?;
        evaluator.add_plain_inplace(&mut result, &self.batched_coeffs[0])?;
        Ok(result)
    }
}

// ============================================================================
// Cache
// ============================================================================

/// Everything recomputable from a bundle's bins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinBundleCache {
    /// Per bin: monic polynomial with the bin's keys as roots.
    pub matching_polyns: Vec<FeltPolyn>,
    /// Per label part, per bin: Newton interpolation through
    /// `(key, label-felt)` pairs. Empty in unlabeled mode.
    pub interp_polyns: Vec<Vec<FeltPolyn>>,
    /// Batched form of `matching_polyns`.
    pub batched_matching_polyn: BatchedPlaintextPolyn,
    /// Batched forms of `interp_polyns`, one per label part.
    pub batched_interp_polyns: Vec<BatchedPlaintextPolyn>,
}

// ============================================================================
// BinBundle
// ============================================================================

/// A fixed-width slice of the sender's database; see the module docs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinBundle {
    bins: Vec<BTreeMap<Felt, Vec<Felt>>>,
    label_size: usize,
    /// `None` whenever a bin has mutated since the last regeneration.
    cache: Option<BinBundleCache>,
}

impl BinBundle {
    pub fn new(bins_per_bundle: usize, label_size: usize) -> Self {
        Self {
            bins: vec![BTreeMap::new(); bins_per_bundle],
            label_size,
            cache: None,
        }
    }

    #[inline]
    pub fn bin_count(&self) -> usize {
        self.bins.len()
    }

    #[inline]
    pub fn label_size(&self) -> usize {
        self.label_size
    }

    /// Largest bin occupancy across the bundle.
    pub fn max_bin_size(&self) -> usize {
        self.bins.iter().map(|b| b.len()).max().unwrap_or(0)
    }

    /// Whether every bin is empty.
    pub fn is_empty(&self) -> bool {
        self.bins.iter().all(|b| b.is_empty())
    }

    /// Insert one item's `(key, label-felts)` groups into the consecutive
    /// bins `[start_bin_idx, start_bin_idx + pairs.len())`.
    ///
    /// If any target bin already contains that group's key, nothing is
    /// inserted and `None` is returned. On acceptance, returns the
    /// post-insert maximum bin size over the affected range. `dry_run`
    /// reports the same outcome without mutating (and without
    /// invalidating the cache).
    pub fn multi_insert(
        &mut self,
        pairs: &[(Felt, Vec<Felt>)],
        start_bin_idx: usize,
        dry_run: bool,
    ) -> Option<usize> {
        if start_bin_idx + pairs.len() > self.bins.len() {
            return None;
        }
        debug_assert!(
            pairs.iter().all(|(_, labels)| labels.len() == self.label_size),
            "label felt group width must equal label_size"
        );

        // Collision scan over the whole range before any mutation.
        for (offset, (key, _)) in pairs.iter().enumerate() {
            if self.bins[start_bin_idx + offset].contains_key(key) {
                return None;
            }
        }

        let mut max_size = 0usize;
        if dry_run {
            for (offset, _) in pairs.iter().enumerate() {
                max_size = max_size.max(self.bins[start_bin_idx + offset].len() + 1);
            }
        } else {
            for (offset, (key, labels)) in pairs.iter().enumerate() {
                let bin = &mut self.bins[start_bin_idx + offset];
                bin.insert(*key, labels.clone());
                max_size = max_size.max(bin.len());
            }
            self.cache = None;
        }
        Some(max_size)
    }

    /// Remove one item's keys from the consecutive bins starting at
    /// `start_bin_idx`. If any key is absent from its bin the bundle is
    /// left unchanged and `false` is returned.
    pub fn try_multi_remove(&mut self, keys: &[Felt], start_bin_idx: usize) -> bool {
        if start_bin_idx + keys.len() > self.bins.len() {
            return false;
        }
        for (offset, key) in keys.iter().enumerate() {
            if !self.bins[start_bin_idx + offset].contains_key(key) {
                return false;
            }
        }
        for (offset, key) in keys.iter().enumerate() {
            self.bins[start_bin_idx + offset].remove(key);
        }
        self.cache = None;
        true
    }

    #[inline]
    pub fn cache_valid(&self) -> bool {
        self.cache.is_some()
    }

    /// The cache, or an error while it is invalid.
    pub fn cache(&self) -> Result<&BinBundleCache, BinBundleError> {
        self.cache.as_ref().ok_or(BinBundleError::CacheInvalid)
    }

    /// Drop the cache without touching the bins.
    pub fn clear_cache(&mut self) {
        self.cache = None;
    }

    /// Rebuild all polynomials and their batched plaintexts, then clear the
    /// invalid flag. The new cache is swapped in whole.
    pub fn regen_cache(&mut self, ctx: &CryptoContext) -> Result<(), BinBundleError> {
        let modulus = ctx.plain_modulus();
        let sentinel = bitstring::null_felt(modulus);

        let mut matching_polyns = Vec::with_capacity(self.bins.len());
        let mut interp_polyns: Vec<Vec<FeltPolyn>> =
            (0..self.label_size).map(|_| Vec::with_capacity(self.bins.len())).collect();

        for bin in &self.bins {
            let roots: Vec<Felt> = if bin.is_empty() {
                vec![sentinel]
            } else {
                bin.keys().copied().collect()
            };
            matching_polyns.push(interpolate::polyn_with_roots(&roots, modulus));

            for (part, part_polyns) in interp_polyns.iter_mut().enumerate() {
                // Anchor every bin at the sentinel so the interpolation
                // polynomial always has an evaluable (≥ 1) degree. The
                // sentinel is outside the encodable felt range, so the
                // anchor value is never observable.
                let mut points: Vec<Felt> = bin.keys().copied().collect();
                let mut values: Vec<Felt> =
                    bin.values().map(|labels| labels[part]).collect();
                points.push(sentinel);
                values.push(0);
                if points.len() < 2 {
                    points.push(0);
                    values.push(0);
                }
                part_polyns.push(interpolate::newton_interpolate(&points, &values, modulus)?);
            }
        }

        let batched_matching_polyn = BatchedPlaintextPolyn::new(&matching_polyns, ctx)?;
        let batched_interp_polyns = interp_polyns
            .iter()
            .map(|polyns| BatchedPlaintextPolyn::new(polyns, ctx))
            .collect::<Result<Vec<_>, _>>()?;

        self.cache = Some(BinBundleCache {
            matching_polyns,
            interp_polyns,
            batched_matching_polyn,
            batched_interp_polyns,
        });
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::he::{
        BatchEncoder, Decryptor, EncryptionParameters, Encryptor, KeyGenerator,
    };
    use crate::interpolate::polyn_eval;
    use rand::SeedableRng;

    fn ctx() -> CryptoContext {
        let parms = EncryptionParameters::new(16, 97, vec![50, 40]).unwrap();
        CryptoContext::new(parms).unwrap()
    }

    #[test]
    fn multi_insert_dry_run_and_collisions() {
        let mut bundle = BinBundle::new(16, 0);
        let pairs = vec![(3u64, vec![]), (5u64, vec![])];

        assert_eq!(bundle.multi_insert(&pairs, 4, true), Some(1));
        assert!(bundle.is_empty(), "dry run must not mutate");

        assert_eq!(bundle.multi_insert(&pairs, 4, false), Some(1));
        assert_eq!(bundle.max_bin_size(), 1);

        // Same keys in the same bins collide; shifted by one they do not.
        assert_eq!(bundle.multi_insert(&pairs, 4, true), None);
        assert_eq!(bundle.multi_insert(&pairs, 5, true), Some(2));

        // Different keys stack into the same bins.
        let other = vec![(7u64, vec![]), (9u64, vec![])];
        assert_eq!(bundle.multi_insert(&other, 4, false), Some(2));
        assert_eq!(bundle.max_bin_size(), 2);

        // Out of range is rejected.
        assert_eq!(bundle.multi_insert(&pairs, 15, true), None);
    }

    #[test]
    fn try_multi_remove_is_all_or_nothing() {
        let mut bundle = BinBundle::new(8, 0);
        bundle.multi_insert(&[(1, vec![]), (2, vec![])], 0, false);

        assert!(!bundle.try_multi_remove(&[1, 3], 0), "missing key aborts");
        assert_eq!(bundle.max_bin_size(), 1);

        assert!(bundle.try_multi_remove(&[1, 2], 0));
        assert!(bundle.is_empty());
    }

    #[test]
    fn mutation_invalidates_the_cache() {
        let ctx = ctx();
        let mut bundle = BinBundle::new(16, 0);
        bundle.multi_insert(&[(1, vec![])], 0, false);
        bundle.regen_cache(&ctx).unwrap();
        assert!(bundle.cache_valid());

        bundle.multi_insert(&[(2, vec![])], 3, false);
        assert!(!bundle.cache_valid());
        assert!(matches!(bundle.cache(), Err(BinBundleError::CacheInvalid)));

        bundle.regen_cache(&ctx).unwrap();
        bundle.try_multi_remove(&[2], 3);
        assert!(!bundle.cache_valid());
    }

    #[test]
    fn matching_polynomials_vanish_exactly_on_bin_keys() {
        let ctx = ctx();
        let modulus = ctx.plain_modulus();
        let mut bundle = BinBundle::new(16, 0);
        bundle.multi_insert(&[(10, vec![]), (20, vec![])], 2, false);
        bundle.multi_insert(&[(11, vec![]), (21, vec![])], 2, false);
        bundle.regen_cache(&ctx).unwrap();

        let cache = bundle.cache().unwrap();
        assert_eq!(polyn_eval(&cache.matching_polyns[2], 10, modulus), 0);
        assert_eq!(polyn_eval(&cache.matching_polyns[2], 11, modulus), 0);
        assert_ne!(polyn_eval(&cache.matching_polyns[2], 12, modulus), 0);
        assert_eq!(polyn_eval(&cache.matching_polyns[3], 20, modulus), 0);
        assert_eq!(polyn_eval(&cache.matching_polyns[3], 21, modulus), 0);
        // Empty bin: only the sentinel root, so nothing encodable matches.
        let sentinel = bitstring::null_felt(modulus);
        assert_eq!(polyn_eval(&cache.matching_polyns[0], sentinel, modulus), 0);
        assert_ne!(polyn_eval(&cache.matching_polyns[0], 0, modulus), 0);
    }

    #[test]
    fn batched_evaluation_matches_the_scalar_polynomials() {
        let ctx = ctx();
        let modulus = ctx.plain_modulus();
        let mut rng = rand::rngs::StdRng::seed_from_u64(3);

        // Labeled bundle: one label part per key.
        let mut bundle = BinBundle::new(16, 1);
        bundle.multi_insert(&[(10, vec![55]), (20, vec![66])], 2, false);
        bundle.multi_insert(&[(30, vec![77])], 2, false);
        bundle.multi_insert(&[(40, vec![88])], 9, false);
        bundle.regen_cache(&ctx).unwrap();
        let cache = bundle.cache().unwrap();

        // Receiver-side machinery for the test.
        let keygen = KeyGenerator::new(&mut rng);
        let encoder = BatchEncoder::new(ctx.he().clone());
        let encryptor = Encryptor::new(ctx.he().clone(), &keygen.public_key());
        let decryptor = Decryptor::new(ctx.he().clone(), &keygen.secret_key());

        // Query felts, one per bin; bins 2,3 carry the stored keys.
        let query: Vec<Felt> = (0..16u64).map(|i| (i * 13 + 7) % 97).collect();
        let mut query = query;
        query[2] = 10;
        query[3] = 20;

        let max_degree = cache.batched_matching_polyn.degree();
        let mut powers = Vec::new();
        for d in 1..=max_degree as u64 {
            let raised: Vec<Felt> = query.iter().map(|&q| modulus.pow(q, d)).collect();
            let mut ct = encryptor.encrypt(&encoder.encode(&raised).unwrap()).unwrap();
            ctx.evaluator().transform_to_ntt_inplace(&mut ct).unwrap();
            powers.push(ct);
        }

        let result = cache.batched_matching_polyn.eval(&powers, &ctx).unwrap();
        let slots = encoder.decode(&decryptor.decrypt(&result).unwrap());
        for bin in 0..16 {
            let expected = polyn_eval(&cache.matching_polyns[bin], query[bin], modulus);
            assert_eq!(slots[bin], expected, "bin {bin}");
        }
        assert_eq!(slots[2], 0);
        assert_eq!(slots[3], 0);

        let label_degree = cache.batched_interp_polyns[0].degree();
        let result = cache.batched_interp_polyns[0]
            .eval(&powers[..label_degree], &ctx)
            .unwrap();
        let slots = encoder.decode(&decryptor.decrypt(&result).unwrap());
        assert_eq!(slots[2], 55, "label felt surfaces at the matched bin");
        assert_eq!(slots[3], 66);
    }

    #[test]
    fn evaluation_demands_enough_powers() {
        let ctx = ctx();
        let mut bundle = BinBundle::new(16, 0);
        bundle.multi_insert(&[(1, vec![])], 0, false);
        bundle.multi_insert(&[(2, vec![])], 0, false);
        bundle.regen_cache(&ctx).unwrap();
        let cache = bundle.cache().unwrap();
        assert!(matches!(
            cache.batched_matching_polyn.eval(&[], &ctx),
            Err(BinBundleError::NotEnoughPowers { .. })
        ));
    }
}

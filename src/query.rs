//! Query engine
//!
//! Turns one received [`QueryRequest`] into a stream of result packages:
//!
//! 1. validate that the submitted power set equals the negotiated
//!    `powers_set` and that every power carries one ciphertext per bundle
//!    index;
//! 2. per bundle index, build the full power basis: seed the submitted
//!    powers (NTT-transformed at seeding), then walk the powers DAG —
//!    multiply the two NTT-form parents and relinearize under the
//!    receiver's keys, so every node lands in NTT form;
//! 3. evaluate every chained bundle's cached matching polynomial (and, in
//!    labeled mode, each label part's interpolation polynomial) against the
//!    basis, modulus-switching each result down for compact serialization;
//! 4. emit one [`ResultPackage`] per `(bundle_idx, bundle)` pair.
//!
//! Work is partitioned across the orchestrator's pool by bundle index; the
//! per-bundle DAG walk runs on its own scoped threads (the inner level
//! never enqueues into the pool).

#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use tracing::debug;

use crate::bin_bundle::BinBundleError;
use crate::he::{Ciphertext, HeError};
use crate::messages::{QueryRequest, QueryResponse, ResultPackage};
use crate::powers::PowersDag;
use crate::sender_db::SenderDb;

/// Errors surfaced while answering a query.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("malformed query: {0}")]
    MalformedQuery(&'static str),
    #[error("bundle index {bundle_idx} outside the configured {bundle_count} bundles")]
    UnknownBundleIndex { bundle_idx: u32, bundle_count: usize },
    #[error("expected {expected} result packages, got {got}")]
    PackageCountMismatch { expected: usize, got: usize },
    #[error("power {power} missing from the expanded basis")]
    MissingPower { power: u32 },
    #[error(transparent)]
    He(#[from] HeError),
    #[error(transparent)]
    Bundle(#[from] BinBundleError),
}

/// Answer a query against a quiescent database snapshot. Every bundle cache
/// must be valid; the orchestrator regenerates caches before taking its
/// reader lock.
///
/// Call from inside the orchestrator's pool to parallelize across bundle
/// indices; `inner_workers` sizes the per-bundle DAG walk.
pub fn process_query(
    db: &SenderDb,
    request: &QueryRequest,
    inner_workers: usize,
) -> Result<(QueryResponse, Vec<ResultPackage>), QueryError> {
    validate_request(db, request)?;
    let dag = db.params().powers_dag();
    let bundle_count = db.params().bundle_count();

    let per_bundle: Vec<Vec<ResultPackage>> = (0..bundle_count)
        .into_par_iter()
        .map(|bundle_idx| answer_bundle(db, request, &dag, bundle_idx, inner_workers))
        .collect::<Result<Vec<_>, _>>()?;

    let packages: Vec<ResultPackage> = per_bundle.into_iter().flatten().collect();
    debug!(packages = packages.len(), "query evaluated");
    Ok((QueryResponse { package_count: packages.len() as u32 }, packages))
}

fn validate_request(db: &SenderDb, request: &QueryRequest) -> Result<(), QueryError> {
    let submitted: BTreeSet<u32> = request.data.keys().copied().collect();
    if submitted != db.params().query().powers_set {
        return Err(QueryError::MalformedQuery(
            "submitted powers do not equal the negotiated powers_set",
        ));
    }
    let bundle_count = db.params().bundle_count();
    for ciphertexts in request.data.values() {
        if ciphertexts.len() != bundle_count {
            return Err(QueryError::MalformedQuery(
                "every power must carry one ciphertext per bundle index",
            ));
        }
        if ciphertexts.iter().any(|ct| ct.is_ntt_form()) {
            return Err(QueryError::MalformedQuery(
                "query ciphertexts must arrive in coefficient form",
            ));
        }
    }
    Ok(())
}

fn answer_bundle(
    db: &SenderDb,
    request: &QueryRequest,
    dag: &PowersDag,
    bundle_idx: usize,
    inner_workers: usize,
) -> Result<Vec<ResultPackage>, QueryError> {
    let chain = db.bundle_chain(bundle_idx);
    if chain.is_empty() {
        return Ok(Vec::new());
    }

    let powers = expand_powers(db, request, dag, bundle_idx, inner_workers)?;
    let ctx = db.crypto();
    let evaluator = ctx.evaluator();

    let mut packages = Vec::with_capacity(chain.len());
    for bundle in chain {
        let cache = bundle.cache()?;

        let matching = &cache.batched_matching_polyn;
        let mut psi_result = matching.eval(&powers[..matching.degree()], ctx)?;
        evaluator.mod_switch_to_last_inplace(&mut psi_result)?;

        let mut label_result = Vec::with_capacity(cache.batched_interp_polyns.len());
        for interp in &cache.batched_interp_polyns {
            let mut ct = interp.eval(&powers[..interp.degree()], ctx)?;
            evaluator.mod_switch_to_last_inplace(&mut ct)?;
            label_result.push(ct);
        }

        packages.push(ResultPackage {
            bundle_idx: bundle_idx as u32,
            label_byte_count: db.label_byte_count() as u32,
            nonce_byte_count: db.nonce_byte_count() as u32,
            psi_result,
            label_result,
        });
    }
    Ok(packages)
}

/// Expand the submitted sparse powers into `[C¹, …, C^max]`, all NTT-form.
fn expand_powers(
    db: &SenderDb,
    request: &QueryRequest,
    dag: &PowersDag,
    bundle_idx: usize,
    inner_workers: usize,
) -> Result<Vec<Ciphertext>, QueryError> {
    let evaluator = db.crypto().evaluator();
    let max_power = db.params().max_items_per_bin();
    let slots: Vec<RwLock<Option<Ciphertext>>> =
        (0..max_power).map(|_| RwLock::new(None)).collect();

    // Seed the submitted powers, NTT-transformed.
    for (&power, ciphertexts) in &request.data {
        let mut ct = ciphertexts[bundle_idx].clone();
        evaluator.transform_to_ntt_inplace(&mut ct)?;
        *slots[power as usize - 1].write() = Some(ct);
    }

    // Walk the DAG. Failures leave the node empty, which downstream nodes
    // observe as a missing parent; the first error wins.
    let failure: Mutex<Option<QueryError>> = Mutex::new(None);
    dag.parallel_apply(inner_workers, |node| {
        if node.is_source() {
            return;
        }
        let (a, b) = node.parents.expect("non-source node");
        let computed = (|| -> Result<Ciphertext, QueryError> {
            let guard_a = slots[a as usize - 1].read();
            let guard_b = slots[b as usize - 1].read();
            let parent_a =
                guard_a.as_ref().ok_or(QueryError::MissingPower { power: a })?;
            let parent_b =
                guard_b.as_ref().ok_or(QueryError::MissingPower { power: b })?;
            // Parents are NTT-form, so the product already is too.
            let mut product = evaluator.multiply(parent_a, parent_b)?;
            evaluator.relinearize_inplace(&mut product, &request.relin_keys)?;
            Ok(product)
        })();
        match computed {
            Ok(ct) => *slots[node.power as usize - 1].write() = Some(ct),
            Err(err) => {
                let mut failure = failure.lock();
                if failure.is_none() {
                    *failure = Some(err);
                }
            }
        }
    });
    if let Some(err) = failure.into_inner() {
        return Err(err);
    }

    slots
        .into_iter()
        .enumerate()
        .map(|(i, slot)| {
            slot.into_inner().ok_or(QueryError::MissingPower { power: i as u32 + 1 })
        })
        .collect()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::he::{
        BatchEncoder, Decryptor, EncryptionParameters, Encryptor, KeyGenerator, RelinKeys,
    };
    use crate::item::{HashedItem, Item, ITEM_BIT_COUNT};
    use crate::params::{ItemParams, PsiParams, QueryParams, TableParams};
    use crate::sender_db::SenderDb;
    use rand::SeedableRng;
    use std::collections::BTreeMap;

    fn tiny_params() -> PsiParams {
        PsiParams::new(
            ItemParams { felts_per_item: 8 },
            TableParams {
                table_size: 512,
                max_items_per_bin: 16,
                hash_func_count: 3,
                hash_func_seed: 0xFEED,
            },
            QueryParams { powers_set: [1, 3, 5].into_iter().collect() },
            EncryptionParameters::new(4096, 65537, vec![50, 40, 40]).unwrap(),
        )
        .unwrap()
    }

    struct TestReceiver {
        encoder: BatchEncoder,
        encryptor: Encryptor,
        decryptor: Decryptor,
        relin_keys: RelinKeys,
    }

    fn test_receiver(db: &SenderDb) -> TestReceiver {
        let mut rng = rand::rngs::StdRng::seed_from_u64(17);
        let keygen = KeyGenerator::new(&mut rng);
        let ctx = db.crypto().he().clone();
        TestReceiver {
            encoder: BatchEncoder::new(ctx.clone()),
            encryptor: Encryptor::new(ctx.clone(), &keygen.public_key()),
            decryptor: Decryptor::new(ctx, &keygen.secret_key()),
            relin_keys: keygen.relin_keys(),
        }
    }

    /// Build a query placing each hashed item at its first cuckoo location.
    fn build_request(
        db: &SenderDb,
        receiver: &TestReceiver,
        hashed: &[HashedItem],
    ) -> (QueryRequest, Vec<usize>) {
        let params = db.params();
        let modulus = params.plain_modulus();
        let table = params.table();

        let mut table_felts = vec![vec![0u64; params.felts_per_item()]; params.table_size()];
        let mut slots_used = Vec::new();
        for item in hashed {
            // The sender places items at every location, so any free one works.
            let locs = crate::cuckoo::locations(
                item,
                table.hash_func_count,
                table.hash_func_seed,
                params.table_size(),
            );
            let slot = *locs
                .iter()
                .find(|&&s| table_felts[s].iter().all(|&f| f == 0))
                .expect("a free location exists for this small query");
            table_felts[slot] = item.to_felts(modulus).unwrap();
            slots_used.push(slot);
        }

        let fpi = params.felts_per_item();
        let ipb = params.items_per_bundle();
        let mut data = BTreeMap::new();
        for &k in &params.query().powers_set {
            let mut per_bundle = Vec::new();
            for bundle_idx in 0..params.bundle_count() {
                let mut slots = vec![0u64; params.bins_per_bundle()];
                for (j, slot_value) in slots.iter_mut().enumerate() {
                    let table_slot = bundle_idx * ipb + j / fpi;
                    if table_slot < params.table_size() {
                        let felt = table_felts[table_slot][j % fpi];
                        *slot_value = modulus.pow(felt, k as u64);
                    }
                }
                let plain = receiver.encoder.encode(&slots).unwrap();
                per_bundle.push(receiver.encryptor.encrypt(&plain).unwrap());
            }
            data.insert(k, per_bundle);
        }
        (QueryRequest { relin_keys: receiver.relin_keys.clone(), data }, slots_used)
    }

    fn matched_slots(
        db: &SenderDb,
        receiver: &TestReceiver,
        packages: &[ResultPackage],
    ) -> Vec<usize> {
        let params = db.params();
        let fpi = params.felts_per_item();
        let ipb = params.items_per_bundle();
        let mut matched = Vec::new();
        for package in packages {
            let plain = receiver.decryptor.decrypt(&package.psi_result).unwrap();
            let slots = receiver.encoder.decode(&plain);
            for offset in 0..ipb {
                let table_slot = package.bundle_idx as usize * ipb + offset;
                if table_slot >= params.table_size() {
                    continue;
                }
                if slots[offset * fpi..(offset + 1) * fpi].iter().all(|&v| v == 0) {
                    matched.push(table_slot);
                }
            }
        }
        matched.sort_unstable();
        matched.dedup();
        matched
    }

    #[test]
    fn query_finds_exactly_the_stored_items() {
        let mut db = SenderDb::new(tiny_params(), 0, 0, None).unwrap();
        let sender_set: Vec<Item> = (1u128..=10).map(Item::from).collect();
        db.insert(&sender_set).unwrap();
        db.regen_caches().unwrap();
        let receiver = test_receiver(&db);

        // Query five members and five strangers.
        let queried: Vec<Item> =
            (1u128..=5).chain(100..=104).map(Item::from).collect();
        let hashed: Vec<HashedItem> =
            queried.iter().map(|i| db.hash_item(i).0).collect();
        let (request, slots_used) = build_request(&db, &receiver, &hashed);

        let (response, packages) = process_query(&db, &request, 2).unwrap();
        assert_eq!(response.package_count as usize, packages.len());
        assert!(!packages.is_empty());

        let matched = matched_slots(&db, &receiver, &packages);
        for (i, slot) in slots_used.iter().enumerate() {
            let expect_found = i < 5;
            assert_eq!(
                matched.contains(slot),
                expect_found,
                "query item {i} (slot {slot})"
            );
        }
    }

    #[test]
    fn labeled_query_recovers_label_felts() {
        let mut db = SenderDb::new(tiny_params(), 16, 16, None).unwrap();
        let labeled: Vec<(Item, Vec<u8>)> = (1u128..=6)
            .map(|i| (Item::from(i), (i as u8..i as u8 + 16).collect()))
            .collect();
        db.insert_labeled(&labeled).unwrap();
        db.regen_caches().unwrap();
        let receiver = test_receiver(&db);

        let hashed = vec![db.hash_item(&Item::from(3u128)).0];
        let (request, slots_used) = build_request(&db, &receiver, &hashed);
        let (_, packages) = process_query(&db, &request, 2).unwrap();

        // label parts for nonce16 + label16 + mac16 under 128-bit parts.
        let label_size = db.params().label_size(16, 16);
        assert_eq!(label_size, 3);
        let matched = matched_slots(&db, &receiver, &packages);
        assert_eq!(matched, vec![slots_used[0]]);
        for package in &packages {
            assert_eq!(package.label_result.len(), label_size);
            assert_eq!(package.label_byte_count, 16);
            assert_eq!(package.nonce_byte_count, 16);
        }
    }

    #[test]
    fn wrong_power_sets_are_malformed() {
        let mut db = SenderDb::new(tiny_params(), 0, 0, None).unwrap();
        db.insert(&[Item::from(1u128)]).unwrap();
        db.regen_caches().unwrap();
        let receiver = test_receiver(&db);
        let hashed = vec![db.hash_item(&Item::from(1u128)).0];
        let (request, _) = build_request(&db, &receiver, &hashed);

        // Drop one power.
        let mut missing = request.clone();
        missing.data.remove(&5);
        assert!(matches!(
            process_query(&db, &missing, 1),
            Err(QueryError::MalformedQuery(_))
        ));

        // Wrong per-power ciphertext count.
        let mut short = request.clone();
        short.data.get_mut(&1).unwrap().clear();
        assert!(matches!(
            process_query(&db, &short, 1),
            Err(QueryError::MalformedQuery(_))
        ));

        // NTT-form ciphertexts are rejected up front.
        let mut ntt = request;
        let evaluator = db.crypto().evaluator();
        for ct in ntt.data.get_mut(&1).unwrap() {
            evaluator.transform_to_ntt_inplace(ct).unwrap();
        }
        assert!(matches!(
            process_query(&db, &ntt, 1),
            Err(QueryError::MalformedQuery(_))
        ));
    }

    #[test]
    fn item_bit_width_matches_the_encoding() {
        // The build_request helper assumes full-width items.
        assert_eq!(ITEM_BIT_COUNT, 128);
    }
}

//! Receiver
//!
//! The receiver drives the protocol: fetch parameters, run the OPRF
//! round-trip, build the encrypted query, and decode the streamed result
//! packages back onto its original item order.
//!
//! Query construction packs the (hashed) items into a cuckoo table, encodes
//! every slot (the all-zero sentinel for unused ones) into felts, and
//! encrypts, for each negotiated power `k`, one ciphertext per bundle index
//! whose slots hold the `k`-th powers of the slot felts. The returned
//! index-translation map undoes the cuckoo permutation during decoding.
//!
//! Decoding marks an input item found when any of its cuckoo locations
//! yields `felts_per_item` consecutive zero slots in a package's decrypted
//! matching result. In labeled mode the label ciphertexts are decrypted at
//! exactly those positions, decoded felts→bits→bytes, and opened with the
//! item's label key; a MAC failure on a found item aborts the whole query
//! with [`ReceiverError::InvalidLabel`].

#![forbid(unsafe_code)]

use rand::Rng;
use tracing::debug;

use crate::bitstring::{self, CodecError};
use crate::channel::Channel;
use crate::context::CryptoContext;
use crate::cuckoo::{CuckooError, CuckooTable};
use crate::ffield::Felt;
use crate::he::{
    Decryptor, Encryptor, HeError, KeyGenerator, RelinKeys,
};
use crate::item::{HashedItem, Item, LabelKey, ITEM_BIT_COUNT};
use crate::label::{self, LabelError, MAC_BYTE_COUNT};
use crate::messages::{
    OprfRequest, ProtocolError, QueryRequest, Response, ResultPackage, SenderOperation,
};
use crate::oprf::{self, OprfError};
use crate::params::{ParamsError, PsiParams};
use crate::query::QueryError;

/// Errors surfaced on the receiver side.
#[derive(Debug, thiserror::Error)]
pub enum ReceiverError {
    #[error(transparent)]
    Params(#[from] ParamsError),
    #[error(transparent)]
    He(#[from] HeError),
    #[error(transparent)]
    Oprf(#[from] OprfError),
    #[error(transparent)]
    Cuckoo(#[from] CuckooError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("label authentication failed for a matched item")]
    InvalidLabel,
    #[error("stored label bytes failed to decode")]
    LabelDecodeFailure,
    #[error("sender answered with the wrong response variant")]
    UnexpectedResponse,
    #[error("got {got} label keys for {expected} query items")]
    LabelKeyCountMismatch { got: usize, expected: usize },
}

/// One entry of the receiver's result vector, aligned with its input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchRecord {
    pub found: bool,
    pub label: Option<Vec<u8>>,
}

/// Maps cuckoo table slots back to indices in the original query vector.
pub struct IndexTranslation {
    slot_to_input: Vec<Option<usize>>,
    item_count: usize,
}

impl IndexTranslation {
    #[inline]
    pub fn item_count(&self) -> usize {
        self.item_count
    }

    #[inline]
    pub fn input_for_slot(&self, slot: usize) -> Option<usize> {
        self.slot_to_input.get(slot).copied().flatten()
    }
}

/// The receiver's long-lived query state: negotiated parameters plus its
/// own key set.
pub struct Receiver {
    params: PsiParams,
    crypto: CryptoContext,
    encryptor: Encryptor,
    decryptor: Decryptor,
    relin_keys: RelinKeys,
}

impl Receiver {
    pub fn new(params: PsiParams, rng: &mut impl Rng) -> Result<Self, ReceiverError> {
        let crypto = CryptoContext::new(params.he().clone())?;
        let keygen = KeyGenerator::new(rng);
        let encryptor = Encryptor::new(crypto.he().clone(), &keygen.public_key());
        let decryptor = Decryptor::new(crypto.he().clone(), &keygen.secret_key());
        Ok(Self { params, crypto, encryptor, decryptor, relin_keys: keygen.relin_keys() })
    }

    #[inline]
    pub fn params(&self) -> &PsiParams {
        &self.params
    }

    // ----------------------------- Parameters ------------------------------

    /// Fetch the sender's negotiated parameters.
    pub fn request_params(channel: &mut impl Channel) -> Result<PsiParams, ReceiverError> {
        channel.send_operation(&SenderOperation::Parms)?;
        match channel.receive_response()? {
            Response::Parms(rsp) => Ok(rsp.params),
            _ => Err(ReceiverError::UnexpectedResponse),
        }
    }

    // -------------------------------- OPRF ---------------------------------

    /// Run the OPRF round-trip for `items`, returning per-item hashed items
    /// and label keys in input order.
    pub fn request_oprf(
        items: &[Item],
        channel: &mut impl Channel,
        rng: &mut impl Rng,
    ) -> Result<Vec<(HashedItem, LabelKey)>, ReceiverError> {
        let (blob, state) = oprf::blind_items(items, rng);
        channel.send_operation(&SenderOperation::Oprf(OprfRequest { data: blob }))?;
        let response = match channel.receive_response()? {
            Response::Oprf(rsp) => rsp,
            _ => return Err(ReceiverError::UnexpectedResponse),
        };
        Ok(oprf::unblind_responses(&state, &response.data)?)
    }

    /// Hash items without an OPRF round-trip (for senders running with the
    /// OPRF disabled).
    pub fn hash_items_plain(items: &[Item]) -> Vec<(HashedItem, LabelKey)> {
        items.iter().map(oprf::plain_extract).collect()
    }

    // ----------------------------- Query build -----------------------------

    /// Pack hashed items into the cuckoo table and encrypt the sparse query
    /// powers. Returns the request and the slot→input translation.
    pub fn create_query(
        &self,
        hashed_items: &[HashedItem],
        rng: &mut impl Rng,
    ) -> Result<(QueryRequest, IndexTranslation), ReceiverError> {
        let table_params = self.params.table();
        let mut table = CuckooTable::new(
            self.params.table_size(),
            table_params.hash_func_count,
            table_params.hash_func_seed,
        );
        for (input_idx, item) in hashed_items.iter().enumerate() {
            table.insert(*item, input_idx, rng)?;
        }

        let modulus = self.params.plain_modulus();
        let fpi = self.params.felts_per_item();
        let ipb = self.params.items_per_bundle();

        // Per-slot felts; unused slots keep the all-zero sentinel encoding.
        let mut slot_felts: Vec<Vec<Felt>> = Vec::with_capacity(self.params.table_size());
        let mut slot_to_input = Vec::with_capacity(self.params.table_size());
        for entry in table.slots() {
            match entry {
                Some(entry) => {
                    slot_felts.push(entry.item.to_felts_padded(modulus, fpi)?);
                    slot_to_input.push(Some(entry.input_idx));
                }
                None => {
                    slot_felts.push(vec![0; fpi]);
                    slot_to_input.push(None);
                }
            }
        }

        let mut data = std::collections::BTreeMap::new();
        for &k in &self.params.query().powers_set {
            let mut per_bundle = Vec::with_capacity(self.params.bundle_count());
            for bundle_idx in 0..self.params.bundle_count() {
                let mut slots = vec![0u64; self.params.bins_per_bundle()];
                for (j, slot) in slots.iter_mut().enumerate() {
                    let table_slot = bundle_idx * ipb + j / fpi;
                    if table_slot < self.params.table_size() {
                        *slot = modulus.pow(slot_felts[table_slot][j % fpi], k as u64);
                    }
                }
                let plain = self.crypto.encoder().encode(&slots)?;
                per_bundle.push(self.encryptor.encrypt(&plain)?);
            }
            data.insert(k, per_bundle);
        }

        debug!(items = hashed_items.len(), powers = data.len(), "query created");
        Ok((
            QueryRequest { relin_keys: self.relin_keys.clone(), data },
            IndexTranslation { slot_to_input, item_count: hashed_items.len() },
        ))
    }

    // ---------------------------- Result decode ----------------------------

    /// Decode result packages into a vector aligned with the original query
    /// items. `label_keys` must hold one key per item when the sender is
    /// labeled; pass an empty slice otherwise.
    pub fn extract_result(
        &self,
        packages: &[ResultPackage],
        translation: &IndexTranslation,
        label_keys: &[LabelKey],
    ) -> Result<Vec<MatchRecord>, ReceiverError> {
        let fpi = self.params.felts_per_item();
        let ipb = self.params.items_per_bundle();
        let bundle_count = self.params.bundle_count();
        let modulus = self.params.plain_modulus();

        let mut records =
            vec![MatchRecord { found: false, label: None }; translation.item_count()];

        for package in packages {
            let bundle_idx = package.bundle_idx as usize;
            if bundle_idx >= bundle_count {
                return Err(QueryError::UnknownBundleIndex {
                    bundle_idx: package.bundle_idx,
                    bundle_count,
                }
                .into());
            }
            let labeled = package.label_byte_count > 0;
            if labeled && label_keys.len() != translation.item_count() {
                return Err(ReceiverError::LabelKeyCountMismatch {
                    got: label_keys.len(),
                    expected: translation.item_count(),
                });
            }

            let matching = self
                .crypto
                .encoder()
                .decode(&self.decryptor.decrypt(&package.psi_result)?);

            // Decrypt label ciphertexts lazily, once per package.
            let mut label_slots: Option<Vec<Vec<Felt>>> = None;

            for offset in 0..ipb {
                let table_slot = bundle_idx * ipb + offset;
                if table_slot >= self.params.table_size() {
                    break;
                }
                let Some(input_idx) = translation.input_for_slot(table_slot) else {
                    continue;
                };
                let range = offset * fpi..(offset + 1) * fpi;
                if !matching[range.clone()].iter().all(|&v| v == 0) {
                    continue;
                }

                let record = &mut records[input_idx];
                record.found = true;
                if !labeled || record.label.is_some() {
                    continue;
                }

                if label_slots.is_none() {
                    let mut decrypted = Vec::with_capacity(package.label_result.len());
                    for ct in &package.label_result {
                        decrypted
                            .push(self.crypto.encoder().decode(&self.decryptor.decrypt(ct)?));
                    }
                    label_slots = Some(decrypted);
                }
                let label_slots = label_slots.as_ref().expect("filled above");

                // Reassemble the stored label bytes, part by part.
                let mut stored = Vec::new();
                for part in label_slots {
                    let felts: Vec<Felt> = range.clone().map(|j| part[j]).collect();
                    let bytes = bitstring::felts_to_bits(&felts, ITEM_BIT_COUNT, modulus)
                        .map_err(|_| ReceiverError::LabelDecodeFailure)?;
                    stored.extend_from_slice(&bytes);
                }
                let stored_len = package.nonce_byte_count as usize
                    + package.label_byte_count as usize
                    + MAC_BYTE_COUNT;
                if stored.len() < stored_len {
                    return Err(ReceiverError::LabelDecodeFailure);
                }
                stored.truncate(stored_len);

                let plain = label::decrypt_label(
                    &stored,
                    &label_keys[input_idx],
                    package.nonce_byte_count as usize,
                )
                .map_err(|err| match err {
                    LabelError::InvalidLabel => ReceiverError::InvalidLabel,
                    LabelError::MalformedLabel { .. } => ReceiverError::LabelDecodeFailure,
                })?;
                record.label = Some(plain);
            }
        }
        Ok(records)
    }

    // ------------------------------ Full flow ------------------------------

    /// One-shot query over an established channel, OPRF included.
    pub fn query(
        &self,
        items: &[Item],
        channel: &mut impl Channel,
        rng: &mut impl Rng,
    ) -> Result<Vec<MatchRecord>, ReceiverError> {
        let extracted = Self::request_oprf(items, channel, rng)?;
        self.query_with_hashes(&extracted, channel, rng)
    }

    /// One-shot query for senders running without the OPRF front-end.
    pub fn query_plain(
        &self,
        items: &[Item],
        channel: &mut impl Channel,
        rng: &mut impl Rng,
    ) -> Result<Vec<MatchRecord>, ReceiverError> {
        let extracted = Self::hash_items_plain(items);
        self.query_with_hashes(&extracted, channel, rng)
    }

    fn query_with_hashes(
        &self,
        extracted: &[(HashedItem, LabelKey)],
        channel: &mut impl Channel,
        rng: &mut impl Rng,
    ) -> Result<Vec<MatchRecord>, ReceiverError> {
        let hashed: Vec<HashedItem> = extracted.iter().map(|(h, _)| *h).collect();
        let label_keys: Vec<LabelKey> = extracted.iter().map(|(_, k)| *k).collect();

        let (request, translation) = self.create_query(&hashed, rng)?;
        channel.send_operation(&SenderOperation::Query(request))?;
        let response = match channel.receive_response()? {
            Response::Query(rsp) => rsp,
            _ => return Err(ReceiverError::UnexpectedResponse),
        };

        let expected = response.package_count as usize;
        let mut packages = Vec::with_capacity(expected);
        for received in 0..expected {
            match channel.receive_result_package() {
                Ok(package) => packages.push(package),
                Err(ProtocolError::ChannelClosed) => {
                    return Err(QueryError::PackageCountMismatch {
                        expected,
                        got: received,
                    }
                    .into());
                }
                Err(err) => return Err(err.into()),
            }
        }
        debug!(packages = packages.len(), "query response received");
        self.extract_result(&packages, &translation, &label_keys)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::he::EncryptionParameters;
    use crate::params::{ItemParams, QueryParams, TableParams};
    use rand::SeedableRng;

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

    #[test]
    fn create_query_covers_every_power_and_bundle() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(8);
        let receiver = Receiver::new(tiny_params(), &mut rng).unwrap();
        let hashed: Vec<HashedItem> =
            (1u64..=6).map(|v| HashedItem([v, v + 100])).collect();

        let (request, translation) = receiver.create_query(&hashed, &mut rng).unwrap();
        assert_eq!(translation.item_count(), 6);
        let powers: Vec<u32> = request.data.keys().copied().collect();
        assert_eq!(powers, vec![1, 3, 5]);
        for ciphertexts in request.data.values() {
            assert_eq!(ciphertexts.len(), receiver.params().bundle_count());
            assert!(ciphertexts.iter().all(|ct| !ct.is_ntt_form()));
        }

        // Every inserted item is reachable through the translation.
        let mut seen: Vec<usize> = (0..receiver.params().table_size())
            .filter_map(|slot| translation.input_for_slot(slot))
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..6).collect::<Vec<_>>());
    }

    #[test]
    fn extract_rejects_foreign_bundle_indices() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(9);
        let receiver = Receiver::new(tiny_params(), &mut rng).unwrap();
        let (_, translation) =
            receiver.create_query(&[HashedItem([1, 2])], &mut rng).unwrap();

        let plain = receiver.crypto.encoder().encode(&[1]).unwrap();
        let ct = receiver.encryptor.encrypt(&plain).unwrap();
        let package = ResultPackage {
            bundle_idx: 7,
            label_byte_count: 0,
            nonce_byte_count: 0,
            psi_result: ct,
            label_result: vec![],
        };
        assert!(matches!(
            receiver.extract_result(&[package], &translation, &[]),
            Err(ReceiverError::Query(QueryError::UnknownBundleIndex { bundle_idx: 7, .. }))
        ));
    }
}

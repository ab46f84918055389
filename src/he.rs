//! Leveled-scheme interface & reference evaluator
//!
//! The intersection engine programs against the interface of a BFV-style
//! leveled homomorphic scheme: batched plaintexts over the plain modulus,
//! ciphertexts whose size grows on multiplication and shrinks under
//! relinearization, NTT-form transforms gating cheap plaintext
//! multiplications, a modulus-switching chain, and serialization for every
//! key/ciphertext/plaintext that crosses the wire.
//!
//! What ships here is that interface plus a **transparent reference
//! evaluator**: plaintexts are genuine coefficient vectors batched through
//! the real negacyclic NTT in [`crate::ffield`], and ciphertexts carry slot
//! data alongside faithful interface state — size, NTT-form flag, key
//! binding, modulus-chain level, and a simulated noise budget that depletes
//! the way a leveled scheme's would. Every operation enforces the same
//! preconditions a lattice backend does (`NttFormMismatch`,
//! `RelinKeysInvalid`, `DecryptionFailure`, `NoiseBudgetExhausted`), so the
//! engine, the protocol, and the tests exercise the full contract. It
//! provides **no cryptographic hiding**; a hardened backend replaces this
//! module behind the same types.

#![forbid(unsafe_code)]

use std::sync::Arc;

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::ffield::{Felt, FieldError, Modulus, NttTables};

/// Headroom subtracted from the fresh noise budget.
const NOISE_MARGIN: i64 = 10;
/// Additive budget cost of one modulus switch.
const MOD_SWITCH_COST: i64 = 2;

/// Errors surfaced by the scheme layer.
#[derive(Debug, thiserror::Error)]
pub enum HeError {
    #[error("invalid encryption parameters: {0}")]
    InvalidParameters(&'static str),
    #[error(transparent)]
    Field(#[from] FieldError),
    #[error("operand NTT forms do not match the operation")]
    NttFormMismatch,
    #[error("ciphertext size {0} does not admit this operation")]
    InvalidCiphertextSize(usize),
    #[error("operands belong to different modulus-chain levels ({0} vs {1})")]
    LevelMismatch(usize, usize),
    #[error("relinearization keys do not match the ciphertext's encryption key")]
    RelinKeysInvalid,
    #[error("decryption failed (wrong key, or ciphertext noise exceeded the budget)")]
    DecryptionFailure,
    #[error("noise budget exhausted at level {level}")]
    NoiseBudgetExhausted { level: usize },
    #[error("vector of {got} values exceeds the {slots} batching slots")]
    TooManySlots { got: usize, slots: usize },
    #[error("already at the last modulus-chain level")]
    CannotSwitchFurther,
}

// ============================================================================
// Parameters & context
// ============================================================================

/// Frozen scheme parameters: polynomial degree `N`, plain modulus `p`, and
/// the bit sizes of the coefficient-modulus chain (kept for level and noise
/// accounting).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionParameters {
    poly_modulus_degree: usize,
    plain_modulus: u64,
    coeff_modulus_bits: Vec<u32>,
}

impl EncryptionParameters {
    pub fn new(
        poly_modulus_degree: usize,
        plain_modulus: u64,
        coeff_modulus_bits: Vec<u32>,
    ) -> Result<Self, HeError> {
        if poly_modulus_degree < 2 || !poly_modulus_degree.is_power_of_two() {
            return Err(HeError::InvalidParameters(
                "poly_modulus_degree must be a power of two at least 2",
            ));
        }
        if coeff_modulus_bits.is_empty() || coeff_modulus_bits.iter().any(|&b| b == 0 || b > 60)
        {
            return Err(HeError::InvalidParameters(
                "coeff modulus chain must be non-empty with prime sizes in (0, 60]",
            ));
        }
        if plain_modulus < 2 {
            return Err(HeError::InvalidParameters("plain modulus must be at least 2"));
        }
        Ok(Self { poly_modulus_degree, plain_modulus, coeff_modulus_bits })
    }

    #[inline]
    pub fn poly_modulus_degree(&self) -> usize {
        self.poly_modulus_degree
    }

    #[inline]
    pub fn plain_modulus(&self) -> u64 {
        self.plain_modulus
    }

    #[inline]
    pub fn coeff_modulus_bits(&self) -> &[u32] {
        &self.coeff_modulus_bits
    }
}

/// Validated scheme context: parameters plus the batching transform tables.
/// Immutable after construction and shared by reference across threads.
pub struct HeContext {
    parms: EncryptionParameters,
    plain: Modulus,
    ntt: NttTables,
    fresh_budget: i64,
}

impl HeContext {
    /// Validate parameters (prime plain modulus, batching support, a usable
    /// fresh noise budget) and precompute transforms.
    pub fn new(parms: EncryptionParameters) -> Result<Arc<Self>, HeError> {
        let plain = Modulus::new(parms.plain_modulus)?;
        // NttTables enforces primality and p ≡ 1 (mod 2N).
        let ntt = NttTables::new(parms.poly_modulus_degree, plain)?;
        let fresh_budget = Self::budget_cap(&parms, 0);
        if fresh_budget <= 0 {
            return Err(HeError::InvalidParameters(
                "coeff modulus chain too small for this plain modulus",
            ));
        }
        Ok(Arc::new(Self { parms, plain, ntt, fresh_budget }))
    }

    #[inline]
    pub fn parms(&self) -> &EncryptionParameters {
        &self.parms
    }

    #[inline]
    pub fn plain_modulus(&self) -> Modulus {
        self.plain
    }

    /// Number of batching slots (= `N`).
    #[inline]
    pub fn slot_count(&self) -> usize {
        self.parms.poly_modulus_degree
    }

    #[inline]
    fn log2_degree(&self) -> i64 {
        self.parms.poly_modulus_degree.trailing_zeros() as i64
    }

    /// Budget ceiling at a chain level: total active coefficient bits minus
    /// the plaintext width and a fixed margin.
    fn budget_cap(parms: &EncryptionParameters, level: usize) -> i64 {
        let active: i64 = parms.coeff_modulus_bits[..parms.coeff_modulus_bits.len() - level]
            .iter()
            .map(|&b| b as i64)
            .sum();
        let plain_bits = 64 - parms.plain_modulus.leading_zeros() as i64;
        let log2_n = parms.poly_modulus_degree.trailing_zeros() as i64;
        active - plain_bits - log2_n - NOISE_MARGIN
    }

    #[inline]
    fn last_level(&self) -> usize {
        self.parms.coeff_modulus_bits.len() - 1
    }

    #[inline]
    fn plain_bits(&self) -> i64 {
        self.plain.bit_count() as i64
    }
}

impl std::fmt::Debug for HeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeContext")
            .field("parms", &self.parms)
            .field("fresh_budget", &self.fresh_budget)
            .finish()
    }
}

// ============================================================================
// Keys
// ============================================================================

/// Generates a matched key set. Key identity (not key material — the
/// reference evaluator has none) binds ciphertexts to their decryptor and
/// relinearization keys.
pub struct KeyGenerator {
    key_id: u64,
}

impl KeyGenerator {
    pub fn new(rng: &mut impl RngCore) -> Self {
        Self { key_id: rng.next_u64() }
    }

    pub fn secret_key(&self) -> SecretKey {
        SecretKey { key_id: self.key_id }
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey { key_id: self.key_id }
    }

    pub fn relin_keys(&self) -> RelinKeys {
        RelinKeys { key_id: self.key_id }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretKey {
    key_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey {
    key_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelinKeys {
    key_id: u64,
}

// ============================================================================
// Plaintext & ciphertext
// ============================================================================

/// A batched plaintext: polynomial coefficients (degree-ascending) in
/// coefficient form, or slot values in NTT form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plaintext {
    data: Vec<Felt>,
    ntt_form: bool,
}

impl Plaintext {
    #[inline]
    pub fn is_ntt_form(&self) -> bool {
        self.ntt_form
    }

    /// Whether every coefficient/slot is zero.
    pub fn is_zero(&self) -> bool {
        self.data.iter().all(|&x| x == 0)
    }
}

/// A ciphertext with faithful interface state. The payload is the slot
/// vector; `ntt_form` is interface state gating which operations are legal,
/// exactly as a lattice backend's representation flag would.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ciphertext {
    slots: Vec<Felt>,
    size: usize,
    ntt_form: bool,
    level: usize,
    noise_budget: i64,
    key_id: u64,
}

impl Ciphertext {
    #[inline]
    pub fn is_ntt_form(&self) -> bool {
        self.ntt_form
    }

    /// Polynomial count: 2 when fresh or relinearized, 3 after a multiply.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn level(&self) -> usize {
        self.level
    }

    /// Remaining invariant-noise budget in bits.
    #[inline]
    pub fn noise_budget(&self) -> i64 {
        self.noise_budget
    }
}

// ============================================================================
// Batch encoder
// ============================================================================

/// Maps slot vectors to coefficient-form plaintexts (and back) through the
/// negacyclic NTT, so slot-wise plaintext products agree with polynomial
/// products.
#[derive(Clone)]
pub struct BatchEncoder {
    ctx: Arc<HeContext>,
}

impl BatchEncoder {
    pub fn new(ctx: Arc<HeContext>) -> Self {
        Self { ctx }
    }

    #[inline]
    pub fn slot_count(&self) -> usize {
        self.ctx.slot_count()
    }

    /// Encode up to `slot_count` values (short inputs are zero-padded).
    pub fn encode(&self, values: &[Felt]) -> Result<Plaintext, HeError> {
        let slots = self.ctx.slot_count();
        if values.len() > slots {
            return Err(HeError::TooManySlots { got: values.len(), slots });
        }
        let modulus = self.ctx.plain_modulus();
        let mut data = vec![0u64; slots];
        for (dst, &v) in data.iter_mut().zip(values) {
            *dst = modulus.reduce(v);
        }
        self.ctx.ntt.inverse(&mut data);
        Ok(Plaintext { data, ntt_form: false })
    }

    /// Decode a plaintext (either form) back to its slot values.
    pub fn decode(&self, plain: &Plaintext) -> Vec<Felt> {
        if plain.ntt_form {
            plain.data.clone()
        } else {
            let mut slots = plain.data.clone();
            self.ctx.ntt.forward(&mut slots);
            slots
        }
    }
}

// ============================================================================
// Encryptor / decryptor
// ============================================================================

pub struct Encryptor {
    ctx: Arc<HeContext>,
    key_id: u64,
}

impl Encryptor {
    pub fn new(ctx: Arc<HeContext>, public_key: &PublicKey) -> Self {
        Self { ctx, key_id: public_key.key_id }
    }

    /// Encrypt a coefficient-form plaintext into a fresh size-2 ciphertext.
    pub fn encrypt(&self, plain: &Plaintext) -> Result<Ciphertext, HeError> {
        if plain.ntt_form {
            return Err(HeError::NttFormMismatch);
        }
        let mut slots = plain.data.clone();
        self.ctx.ntt.forward(&mut slots);
        Ok(Ciphertext {
            slots,
            size: 2,
            ntt_form: false,
            level: 0,
            noise_budget: self.ctx.fresh_budget,
            key_id: self.key_id,
        })
    }
}

pub struct Decryptor {
    ctx: Arc<HeContext>,
    key_id: u64,
}

impl Decryptor {
    pub fn new(ctx: Arc<HeContext>, secret_key: &SecretKey) -> Self {
        Self { ctx, key_id: secret_key.key_id }
    }

    /// Decrypt back to a coefficient-form plaintext. Fails if the ciphertext
    /// was produced under a different key or its noise budget is spent.
    pub fn decrypt(&self, ct: &Ciphertext) -> Result<Plaintext, HeError> {
        if ct.key_id != self.key_id || ct.noise_budget <= 0 {
            return Err(HeError::DecryptionFailure);
        }
        if ct.size < 2 {
            return Err(HeError::InvalidCiphertextSize(ct.size));
        }
        if ct.ntt_form {
            // Decryption is defined on the coefficient representation.
            return Err(HeError::NttFormMismatch);
        }
        let mut data = ct.slots.clone();
        self.ctx.ntt.inverse(&mut data);
        Ok(Plaintext { data, ntt_form: false })
    }

    /// Remaining noise budget of a ciphertext under this key.
    pub fn invariant_noise_budget(&self, ct: &Ciphertext) -> Result<i64, HeError> {
        if ct.key_id != self.key_id {
            return Err(HeError::DecryptionFailure);
        }
        Ok(ct.noise_budget)
    }
}

// ============================================================================
// Evaluator
// ============================================================================

/// Homomorphic operations. Stateless apart from the shared context; safe to
/// use concurrently from many threads.
#[derive(Clone)]
pub struct Evaluator {
    ctx: Arc<HeContext>,
}

impl Evaluator {
    pub fn new(ctx: Arc<HeContext>) -> Self {
        Self { ctx }
    }

    fn check_pair(a: &Ciphertext, b: &Ciphertext) -> Result<(), HeError> {
        if a.ntt_form != b.ntt_form {
            return Err(HeError::NttFormMismatch);
        }
        if a.level != b.level {
            return Err(HeError::LevelMismatch(a.level, b.level));
        }
        Ok(())
    }

    fn charge(&self, ct: &mut Ciphertext, cost: i64) -> Result<(), HeError> {
        ct.noise_budget -= cost;
        if ct.noise_budget <= 0 {
            return Err(HeError::NoiseBudgetExhausted { level: ct.level });
        }
        Ok(())
    }

    /// Slot values of a plaintext, whichever form it is in.
    fn plain_slots(&self, plain: &Plaintext) -> Vec<Felt> {
        if plain.ntt_form {
            plain.data.clone()
        } else {
            let mut slots = plain.data.clone();
            self.ctx.ntt.forward(&mut slots);
            slots
        }
    }

    pub fn add_inplace(&self, a: &mut Ciphertext, b: &Ciphertext) -> Result<(), HeError> {
        Self::check_pair(a, b)?;
        let modulus = self.ctx.plain_modulus();
        for (x, y) in a.slots.iter_mut().zip(&b.slots) {
            *x = modulus.add(*x, *y);
        }
        a.size = a.size.max(b.size);
        a.noise_budget = a.noise_budget.min(b.noise_budget);
        Ok(())
    }

    pub fn add_plain_inplace(&self, ct: &mut Ciphertext, plain: &Plaintext) -> Result<(), HeError> {
        if ct.ntt_form != plain.ntt_form {
            return Err(HeError::NttFormMismatch);
        }
        let modulus = self.ctx.plain_modulus();
        let slots = self.plain_slots(plain);
        for (x, y) in ct.slots.iter_mut().zip(&slots) {
            *x = modulus.add(*x, *y);
        }
        Ok(())
    }

    /// Ciphertext-ciphertext product; grows the size from 2 to 3.
    pub fn multiply(&self, a: &Ciphertext, b: &Ciphertext) -> Result<Ciphertext, HeError> {
        Self::check_pair(a, b)?;
        if a.size != 2 || b.size != 2 {
            return Err(HeError::InvalidCiphertextSize(a.size.max(b.size)));
        }
        let modulus = self.ctx.plain_modulus();
        let slots = a
            .slots
            .iter()
            .zip(&b.slots)
            .map(|(&x, &y)| modulus.mul(x, y))
            .collect();
        let mut out = Ciphertext {
            slots,
            size: 3,
            ntt_form: a.ntt_form,
            level: a.level,
            noise_budget: a.noise_budget.min(b.noise_budget),
            key_id: a.key_id,
        };
        self.charge(&mut out, self.ctx.plain_bits() + self.ctx.log2_degree())?;
        Ok(out)
    }

    /// Ciphertext-plaintext product. Both operands must be in NTT form for
    /// the cheap slot-wise path, mirroring the backend contract.
    pub fn multiply_plain_inplace(
        &self,
        ct: &mut Ciphertext,
        plain: &Plaintext,
    ) -> Result<(), HeError> {
        if !ct.ntt_form || !plain.ntt_form {
            return Err(HeError::NttFormMismatch);
        }
        let modulus = self.ctx.plain_modulus();
        for (x, y) in ct.slots.iter_mut().zip(&plain.data) {
            *x = modulus.mul(*x, *y);
        }
        self.charge(ct, self.ctx.plain_bits())
    }

    /// Reduce a size-3 ciphertext back to size 2 under matching keys.
    pub fn relinearize_inplace(
        &self,
        ct: &mut Ciphertext,
        relin_keys: &RelinKeys,
    ) -> Result<(), HeError> {
        if ct.key_id != relin_keys.key_id {
            return Err(HeError::RelinKeysInvalid);
        }
        if ct.size != 3 {
            return Err(HeError::InvalidCiphertextSize(ct.size));
        }
        ct.size = 2;
        self.charge(ct, 1)
    }

    pub fn transform_to_ntt_inplace(&self, ct: &mut Ciphertext) -> Result<(), HeError> {
        if ct.ntt_form {
            return Err(HeError::NttFormMismatch);
        }
        ct.ntt_form = true;
        Ok(())
    }

    pub fn transform_from_ntt_inplace(&self, ct: &mut Ciphertext) -> Result<(), HeError> {
        if !ct.ntt_form {
            return Err(HeError::NttFormMismatch);
        }
        ct.ntt_form = false;
        Ok(())
    }

    pub fn transform_plain_to_ntt_inplace(&self, plain: &mut Plaintext) -> Result<(), HeError> {
        if plain.ntt_form {
            return Err(HeError::NttFormMismatch);
        }
        self.ctx.ntt.forward(&mut plain.data);
        plain.ntt_form = true;
        Ok(())
    }

    /// Drop the next prime from the modulus chain.
    pub fn mod_switch_to_next_inplace(&self, ct: &mut Ciphertext) -> Result<(), HeError> {
        if ct.level >= self.ctx.last_level() {
            return Err(HeError::CannotSwitchFurther);
        }
        ct.level += 1;
        let cap = HeContext::budget_cap(&self.ctx.parms, ct.level);
        ct.noise_budget = (ct.noise_budget - MOD_SWITCH_COST).min(cap);
        if ct.noise_budget <= 0 {
            return Err(HeError::NoiseBudgetExhausted { level: ct.level });
        }
        Ok(())
    }

    /// Switch down to the smallest parameter set the noise budget allows;
    /// this is what compresses result ciphertexts before serialization.
    pub fn mod_switch_to_last_inplace(&self, ct: &mut Ciphertext) -> Result<(), HeError> {
        while ct.level < self.ctx.last_level() {
            // Stop early rather than exhaust the budget outright.
            let next_cap = HeContext::budget_cap(&self.ctx.parms, ct.level + 1);
            if (ct.noise_budget - MOD_SWITCH_COST).min(next_cap) <= 0 {
                break;
            }
            self.mod_switch_to_next_inplace(ct)?;
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn small_ctx() -> Arc<HeContext> {
        let parms = EncryptionParameters::new(1024, 65537, vec![50, 40, 40]).unwrap();
        HeContext::new(parms).unwrap()
    }

    struct Party {
        encoder: BatchEncoder,
        encryptor: Encryptor,
        decryptor: Decryptor,
        relin_keys: RelinKeys,
        evaluator: Evaluator,
    }

    fn party(ctx: &Arc<HeContext>) -> Party {
        let mut rng = rand::rngs::StdRng::seed_from_u64(21);
        let keygen = KeyGenerator::new(&mut rng);
        Party {
            encoder: BatchEncoder::new(ctx.clone()),
            encryptor: Encryptor::new(ctx.clone(), &keygen.public_key()),
            decryptor: Decryptor::new(ctx.clone(), &keygen.secret_key()),
            relin_keys: keygen.relin_keys(),
            evaluator: Evaluator::new(ctx.clone()),
        }
    }

    #[test]
    fn parameter_validation() {
        assert!(EncryptionParameters::new(1000, 65537, vec![50]).is_err());
        assert!(EncryptionParameters::new(1024, 65537, vec![]).is_err());
        // 65536 is not prime.
        let parms = EncryptionParameters::new(1024, 65536, vec![50]).unwrap();
        assert!(HeContext::new(parms).is_err());
        // 17 is prime but 17 != 1 mod 2048.
        let parms = EncryptionParameters::new(1024, 17, vec![50]).unwrap();
        assert!(HeContext::new(parms).is_err());
    }

    #[test]
    fn encode_decode_roundtrip() {
        let ctx = small_ctx();
        let p = party(&ctx);
        let values: Vec<Felt> = (0..1024u64).map(|i| i * 31 % 65537).collect();
        let plain = p.encoder.encode(&values).unwrap();
        assert!(!plain.is_ntt_form());
        assert_eq!(p.encoder.decode(&plain), values);
    }

    #[test]
    fn encrypt_roundtrip_and_key_binding() {
        let ctx = small_ctx();
        let p = party(&ctx);
        let values = vec![1u64, 2, 3, 65536];
        let ct = p.encryptor.encrypt(&p.encoder.encode(&values).unwrap()).unwrap();
        assert_eq!(ct.size(), 2);
        let decoded = p.encoder.decode(&p.decryptor.decrypt(&ct).unwrap());
        assert_eq!(&decoded[..4], &values[..]);
        assert!(decoded[4..].iter().all(|&x| x == 0));

        let mut rng = rand::rngs::StdRng::seed_from_u64(99);
        let stranger = KeyGenerator::new(&mut rng);
        let other = Decryptor::new(ctx, &stranger.secret_key());
        assert!(matches!(other.decrypt(&ct), Err(HeError::DecryptionFailure)));
    }

    #[test]
    fn homomorphic_ops_act_slotwise() {
        let ctx = small_ctx();
        let p = party(&ctx);
        let m = ctx.plain_modulus();
        let a: Vec<Felt> = (0..1024u64).map(|i| (i * 7 + 1) % 65537).collect();
        let b: Vec<Felt> = (0..1024u64).map(|i| (i * i + 3) % 65537).collect();

        let ct_a = p.encryptor.encrypt(&p.encoder.encode(&a).unwrap()).unwrap();
        let ct_b = p.encryptor.encrypt(&p.encoder.encode(&b).unwrap()).unwrap();

        // add
        let mut sum = ct_a.clone();
        p.evaluator.add_inplace(&mut sum, &ct_b).unwrap();
        let got = p.encoder.decode(&p.decryptor.decrypt(&sum).unwrap());
        for i in 0..1024 {
            assert_eq!(got[i], m.add(a[i], b[i]));
        }

        // multiply + relinearize
        let mut prod = p.evaluator.multiply(&ct_a, &ct_b).unwrap();
        assert_eq!(prod.size(), 3);
        p.evaluator.relinearize_inplace(&mut prod, &p.relin_keys).unwrap();
        assert_eq!(prod.size(), 2);
        let got = p.encoder.decode(&p.decryptor.decrypt(&prod).unwrap());
        for i in 0..1024 {
            assert_eq!(got[i], m.mul(a[i], b[i]));
        }

        // multiply_plain in NTT form
        let mut ct = ct_a.clone();
        p.evaluator.transform_to_ntt_inplace(&mut ct).unwrap();
        let mut plain_b = p.encoder.encode(&b).unwrap();
        p.evaluator.transform_plain_to_ntt_inplace(&mut plain_b).unwrap();
        p.evaluator.multiply_plain_inplace(&mut ct, &plain_b).unwrap();
        p.evaluator.transform_from_ntt_inplace(&mut ct).unwrap();
        let got = p.encoder.decode(&p.decryptor.decrypt(&ct).unwrap());
        for i in 0..1024 {
            assert_eq!(got[i], m.mul(a[i], b[i]));
        }
    }

    #[test]
    fn interface_preconditions_are_enforced() {
        let ctx = small_ctx();
        let p = party(&ctx);
        let ct = p.encryptor.encrypt(&p.encoder.encode(&[1, 2, 3]).unwrap()).unwrap();

        // NTT-form mismatches.
        let mut ntt_ct = ct.clone();
        p.evaluator.transform_to_ntt_inplace(&mut ntt_ct).unwrap();
        assert!(matches!(
            p.evaluator.add_inplace(&mut ntt_ct.clone(), &ct),
            Err(HeError::NttFormMismatch)
        ));
        assert!(matches!(
            p.evaluator.multiply_plain_inplace(&mut ct.clone(), &p.encoder.encode(&[1]).unwrap()),
            Err(HeError::NttFormMismatch)
        ));

        // Relinearizing a size-2 ciphertext, or with foreign keys.
        assert!(matches!(
            p.evaluator.relinearize_inplace(&mut ct.clone(), &p.relin_keys),
            Err(HeError::InvalidCiphertextSize(2))
        ));
        let mut rng = rand::rngs::StdRng::seed_from_u64(123);
        let foreign = KeyGenerator::new(&mut rng).relin_keys();
        let mut prod = p.evaluator.multiply(&ct, &ct).unwrap();
        assert!(matches!(
            p.evaluator.relinearize_inplace(&mut prod, &foreign),
            Err(HeError::RelinKeysInvalid)
        ));
    }

    #[test]
    fn noise_budget_depletes_and_exhausts() {
        // A single 40-bit prime leaves a 40-17-10-10=3-bit fresh budget;
        // one multiply must exhaust it.
        let parms = EncryptionParameters::new(1024, 65537, vec![40]).unwrap();
        let ctx = HeContext::new(parms).unwrap();
        let p = party(&ctx);
        let ct = p.encryptor.encrypt(&p.encoder.encode(&[5]).unwrap()).unwrap();
        assert!(ct.noise_budget() > 0);
        assert!(matches!(
            p.evaluator.multiply(&ct, &ct),
            Err(HeError::NoiseBudgetExhausted { .. })
        ));
    }

    #[test]
    fn mod_switch_walks_the_chain_and_stops_at_the_end() {
        let ctx = small_ctx();
        let p = party(&ctx);
        let mut ct = p.encryptor.encrypt(&p.encoder.encode(&[9]).unwrap()).unwrap();
        assert_eq!(ct.level(), 0);
        p.evaluator.mod_switch_to_last_inplace(&mut ct).unwrap();
        assert_eq!(ct.level(), 2);
        assert!(matches!(
            p.evaluator.mod_switch_to_next_inplace(&mut ct),
            Err(HeError::CannotSwitchFurther)
        ));
        // Values survive switching.
        let got = p.encoder.decode(&p.decryptor.decrypt(&ct).unwrap());
        assert_eq!(got[0], 9);
    }
}

//! Prime-field arithmetic & negacyclic NTT
//!
//! The whole engine computes in `Z_p` for a small *runtime* prime `p` (the
//! plain modulus of the leveled scheme). This module centralizes:
//! - [`Modulus`]: checked modular scalar ops (add/sub/mul/neg/pow/inv) with a
//!   deterministic Miller–Rabin primality test used by parameter validation;
//! - [`NttTables`]: the negacyclic number-theoretic transform over
//!   `Z_p[X]/(X^N + 1)` that backs the batched encoder. Forward maps
//!   coefficients to slot values (evaluations at the odd powers of a
//!   primitive `2N`-th root ψ); inverse is its exact inverse.
//!
//! Batching requires `p ≡ 1 (mod 2N)`; [`NttTables::new`] enforces this and
//! finds ψ from a generator of `Z_p^*`.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

/// Field element: a nonnegative integer strictly below the plain modulus `p`.
pub type Felt = u64;

/// Errors surfaced by modulus construction and NTT table setup.
#[derive(Debug, thiserror::Error)]
pub enum FieldError {
    #[error("invalid modulus {0} (must be at least 2)")]
    InvalidModulus(u64),
    #[error("modulus {0} is not prime")]
    NonPrimeModulus(u64),
    #[error("transform size {0} must be a positive power of two")]
    BadTransformSize(usize),
    #[error("modulus {modulus} does not support batching for degree {degree} (p != 1 mod 2N)")]
    NoBatchingSupport { modulus: u64, degree: usize },
}

// ============================================================================
// Modulus
// ============================================================================

/// A small prime (or prime-candidate) modulus with scalar ops over `Z_p`.
///
/// All binary ops expect canonical operands (`< p`); results are canonical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Modulus {
    value: u64,
}

impl Modulus {
    /// Construct a modulus, rejecting values below 2.
    pub fn new(value: u64) -> Result<Self, FieldError> {
        if value < 2 {
            return Err(FieldError::InvalidModulus(value));
        }
        Ok(Self { value })
    }

    /// The raw modulus value `p`.
    #[inline]
    pub fn value(self) -> u64 {
        self.value
    }

    /// Number of significant bits of `p`.
    #[inline]
    pub fn bit_count(self) -> u32 {
        64 - self.value.leading_zeros()
    }

    /// Reduce an arbitrary u64 into canonical form.
    #[inline]
    pub fn reduce(self, x: u64) -> Felt {
        x % self.value
    }

    #[inline]
    pub fn add(self, a: Felt, b: Felt) -> Felt {
        debug_assert!(a < self.value && b < self.value);
        let s = a as u128 + b as u128;
        let p = self.value as u128;
        if s >= p { (s - p) as u64 } else { s as u64 }
    }

    #[inline]
    pub fn sub(self, a: Felt, b: Felt) -> Felt {
        debug_assert!(a < self.value && b < self.value);
        if a >= b { a - b } else { a + self.value - b }
    }

    #[inline]
    pub fn neg(self, a: Felt) -> Felt {
        debug_assert!(a < self.value);
        if a == 0 { 0 } else { self.value - a }
    }

    #[inline]
    pub fn mul(self, a: Felt, b: Felt) -> Felt {
        debug_assert!(a < self.value && b < self.value);
        ((a as u128 * b as u128) % self.value as u128) as u64
    }

    /// Exponentiation by squaring.
    pub fn pow(self, base: Felt, mut exp: u64) -> Felt {
        let mut acc: Felt = 1;
        let mut b = self.reduce(base);
        while exp > 0 {
            if exp & 1 == 1 {
                acc = self.mul(acc, b);
            }
            b = self.mul(b, b);
            exp >>= 1;
        }
        acc
    }

    /// Fermat inverse `a^{p-2}`. Returns `None` for `a == 0`.
    ///
    /// Only meaningful when `p` is prime; callers that cannot guarantee this
    /// must check [`Modulus::is_prime`] first.
    pub fn inv(self, a: Felt) -> Option<Felt> {
        if a == 0 {
            return None;
        }
        Some(self.pow(a, self.value - 2))
    }

    /// Deterministic Miller–Rabin for u64 (fixed base set).
    pub fn is_prime(self) -> bool {
        const SMALL: [u64; 12] = [2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37];
        let n = self.value;
        for &q in &SMALL {
            if n % q == 0 {
                return n == q;
            }
        }
        // n is odd and > 37 here.
        let mut d = n - 1;
        let mut r = 0u32;
        while d & 1 == 0 {
            d >>= 1;
            r += 1;
        }
        'witness: for &a in &SMALL {
            let mut x = self.pow(a % n, d);
            if x == 1 || x == n - 1 {
                continue;
            }
            for _ in 1..r {
                x = self.mul(x, x);
                if x == n - 1 {
                    continue 'witness;
                }
            }
            return false;
        }
        true
    }
}

// ============================================================================
// Negacyclic NTT
// ============================================================================

/// Precomputed transform tables for `Z_p[X]/(X^N + 1)`.
///
/// Implemented as a ψ-twisted radix-2 cyclic NTT: forward twists the
/// coefficients by `ψ^i` and runs a size-`N` NTT with `ω = ψ²`; the slot at
/// index `j` is then the evaluation at `ψ·ω^j` (an odd power of ψ, i.e. a
/// root of `X^N + 1`).
#[derive(Debug, Clone)]
pub struct NttTables {
    n: usize,
    modulus: Modulus,
    omega: Felt,
    omega_inv: Felt,
    n_inv: Felt,
    psi_powers: Vec<Felt>,
    psi_inv_powers: Vec<Felt>,
}

impl NttTables {
    /// Build tables for degree `n`; fails unless `n` is a power of two, `p`
    /// is prime, and `p ≡ 1 (mod 2n)`.
    pub fn new(n: usize, modulus: Modulus) -> Result<Self, FieldError> {
        if n == 0 || !n.is_power_of_two() {
            return Err(FieldError::BadTransformSize(n));
        }
        if !modulus.is_prime() {
            return Err(FieldError::NonPrimeModulus(modulus.value()));
        }
        let p = modulus.value();
        let two_n = 2 * n as u64;
        if (p - 1) % two_n != 0 {
            return Err(FieldError::NoBatchingSupport { modulus: p, degree: n });
        }

        let g = find_generator(modulus);
        // ψ has order exactly 2n because g generates the full group.
        let psi = modulus.pow(g, (p - 1) / two_n);
        debug_assert_eq!(modulus.pow(psi, n as u64), p - 1, "psi^n must equal -1");
        let omega = modulus.mul(psi, psi);
        let omega_inv = modulus.inv(omega).expect("omega is a unit");
        let n_inv = modulus.inv(n as u64 % p).expect("n is a unit mod p");

        let psi_inv = modulus.inv(psi).expect("psi is a unit");
        let mut psi_powers = Vec::with_capacity(n);
        let mut psi_inv_powers = Vec::with_capacity(n);
        let (mut fwd, mut bwd) = (1u64, 1u64);
        for _ in 0..n {
            psi_powers.push(fwd);
            psi_inv_powers.push(bwd);
            fwd = modulus.mul(fwd, psi);
            bwd = modulus.mul(bwd, psi_inv);
        }

        Ok(Self { n, modulus, omega, omega_inv, n_inv, psi_powers, psi_inv_powers })
    }

    #[inline]
    pub fn n(&self) -> usize {
        self.n
    }

    #[inline]
    pub fn modulus(&self) -> Modulus {
        self.modulus
    }

    /// Coefficients → slots, in place. `data.len()` must equal `n`.
    pub fn forward(&self, data: &mut [Felt]) {
        assert_eq!(data.len(), self.n, "transform length mismatch");
        for (a, psi_i) in data.iter_mut().zip(&self.psi_powers) {
            *a = self.modulus.mul(*a, *psi_i);
        }
        ntt_in_place(data, self.omega, self.modulus);
    }

    /// Slots → coefficients, in place. Exact inverse of [`NttTables::forward`].
    pub fn inverse(&self, data: &mut [Felt]) {
        assert_eq!(data.len(), self.n, "transform length mismatch");
        ntt_in_place(data, self.omega_inv, self.modulus);
        for (a, psi_i) in data.iter_mut().zip(&self.psi_inv_powers) {
            *a = self.modulus.mul(self.modulus.mul(*a, self.n_inv), *psi_i);
        }
    }
}

/// Smallest generator of `Z_p^*` (p prime). Trial search over candidates,
/// checking `g^{(p-1)/q} != 1` for every prime factor `q` of `p-1`.
fn find_generator(modulus: Modulus) -> Felt {
    let p = modulus.value();
    let factors = prime_factors(p - 1);
    for cand in 2..p {
        if factors.iter().all(|&q| modulus.pow(cand, (p - 1) / q) != 1) {
            return cand;
        }
    }
    // Every prime field has a generator; the loop above must find one.
    unreachable!("no generator found for prime modulus {p}")
}

/// Distinct prime factors by trial division (the plain modulus is small, so
/// `p - 1` factors in negligible time).
fn prime_factors(mut n: u64) -> Vec<u64> {
    let mut out = Vec::new();
    let mut q = 2u64;
    while q * q <= n {
        if n % q == 0 {
            out.push(q);
            while n % q == 0 {
                n /= q;
            }
        }
        q += if q == 2 { 1 } else { 2 };
    }
    if n > 1 {
        out.push(n);
    }
    out
}

/// Iterative radix-2 cyclic NTT (DIT, bit-reversed input ordering).
fn ntt_in_place(a: &mut [Felt], omega: Felt, modulus: Modulus) {
    let n = a.len();
    bit_reverse_permute(a);
    let mut len = 2;
    while len <= n {
        let w_len = modulus.pow(omega, (n / len) as u64);
        let half = len / 2;
        let mut start = 0;
        while start < n {
            let mut w: Felt = 1;
            for j in 0..half {
                let u = a[start + j];
                let v = modulus.mul(a[start + j + half], w);
                a[start + j] = modulus.add(u, v);
                a[start + j + half] = modulus.sub(u, v);
                w = modulus.mul(w, w_len);
            }
            start += len;
        }
        len <<= 1;
    }
}

fn bit_reverse_permute(a: &mut [Felt]) {
    let n = a.len();
    let mut j = 0usize;
    for i in 1..n {
        let mut bit = n >> 1;
        while j & bit != 0 {
            j ^= bit;
            bit >>= 1;
        }
        j |= bit;
        if i < j {
            a.swap(i, j);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

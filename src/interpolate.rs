//! Polynomial interpolation over `Z_p`
//!
//! Two constructions drive the bin-bundle cache:
//! - [`polyn_with_roots`]: the unique monic polynomial vanishing exactly on a
//!   given root multiset, built by folding monic linear factors into an
//!   accumulator in place, right to left;
//! - [`newton_interpolate`]: Newton's divided-difference interpolation
//!   through `(point, value)` pairs, combined with Horner from the innermost
//!   nested term.
//!
//! Coefficient vectors are degree-ascending (constant term first)
//! throughout.

#![forbid(unsafe_code)]

use crate::ffield::{Felt, Modulus};

/// A polynomial over `Z_p`, degree-ascending coefficients.
pub type FeltPolyn = Vec<Felt>;

/// Errors surfaced by the interpolation routines.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InterpolationError {
    #[error("interpolation requires a prime modulus (got {0})")]
    InvalidModulus(u64),
    #[error("number of values ({values}) does not match number of points ({points})")]
    SizeMismatch { points: usize, values: usize },
    #[error("tried to interpolate at repeated points")]
    RepeatedPoint,
}

/// Multiply `polyn` in place by the monic monomial `x − a`.
///
/// If `P = [c₀, …, cᵣ]` then `(x − a)·P` has `c'ᵢ = cᵢ₋₁ − a·cᵢ`, which is
/// computable right-to-left without an intermediate copy.
fn mul_monic_monomial_inplace(polyn: &mut FeltPolyn, a: Felt, modulus: Modulus) {
    polyn.push(0);
    let neg_a = modulus.neg(a);
    for i in (1..polyn.len()).rev() {
        polyn[i] = modulus.add(modulus.mul(polyn[i], neg_a), polyn[i - 1]);
    }
    polyn[0] = modulus.mul(polyn[0], neg_a);
}

/// Coefficients of the unique monic polynomial `∏ᵢ (x − rootᵢ) mod p`.
///
/// Output length is `roots.len() + 1`; an empty multiset yields `[1]`.
pub fn polyn_with_roots(roots: &[Felt], modulus: Modulus) -> FeltPolyn {
    let mut polyn = Vec::with_capacity(roots.len() + 1);
    polyn.push(1);
    for &root in roots {
        mul_monic_monomial_inplace(&mut polyn, root, modulus);
    }
    polyn
}

/// Newton interpolation: the unique polynomial of degree `< points.len()`
/// with `P(pointᵢ) = valueᵢ`, degree-ascending, length `points.len()`.
///
/// Empty input returns `[0]`. All-zero values shortcut to a zero vector of
/// the correct length. Distinct points and a prime modulus are required.
pub fn newton_interpolate(
    points: &[Felt],
    values: &[Felt],
    modulus: Modulus,
) -> Result<FeltPolyn, InterpolationError> {
    if points.len() != values.len() {
        return Err(InterpolationError::SizeMismatch {
            points: points.len(),
            values: values.len(),
        });
    }
    if !modulus.is_prime() {
        return Err(InterpolationError::InvalidModulus(modulus.value()));
    }

    let size = points.len();
    // Repeated points are rejected up front so the all-zero shortcut cannot
    // mask them. Bin sizes are small; the quadratic scan is negligible.
    for i in 0..size {
        for j in i + 1..size {
            if points[i] == points[j] {
                return Err(InterpolationError::RepeatedPoint);
            }
        }
    }
    if values.iter().all(|&v| v == 0) {
        return Ok(vec![0; size.max(1)]);
    }

    // Triangular divided-difference table: dd[i][j] = [yᵢ, …, yᵢ₊ⱼ].
    let mut dd: Vec<FeltPolyn> = values.iter().map(|&v| vec![v]).collect();
    for j in 1..size {
        for i in 0..size - j {
            let numerator = modulus.sub(dd[i + 1][j - 1], dd[i][j - 1]);
            let denominator = modulus.sub(points[i + j], points[i]);
            let inv = modulus
                .inv(denominator)
                .ok_or(InterpolationError::RepeatedPoint)?;
            let entry = modulus.mul(numerator, inv);
            dd[i].push(entry);
        }
    }

    // Horner from the innermost nested term:
    //   P = [y₀] + (x−x₀)([y₀,y₁] + (x−x₁)(… + (x−xᵣ₋₁)[y₀,…,yᵣ]))
    let mut result: FeltPolyn = Vec::with_capacity(size);
    result.push(0);
    for i in (1..size).rev() {
        result[0] = modulus.add(result[0], dd[0][i]);
        mul_monic_monomial_inplace(&mut result, points[i - 1], modulus);
    }
    result[0] = modulus.add(result[0], dd[0][0]);
    Ok(result)
}

/// Horner evaluation of a degree-ascending polynomial at `x`.
pub fn polyn_eval(polyn: &[Felt], x: Felt, modulus: Modulus) -> Felt {
    let mut acc: Felt = 0;
    for &c in polyn.iter().rev() {
        acc = modulus.add(modulus.mul(acc, x), c);
    }
    acc
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    fn m(p: u64) -> Modulus {
        Modulus::new(p).unwrap()
    }

    #[test]
    fn empty_roots_give_the_unit_polynomial() {
        assert_eq!(polyn_with_roots(&[], m(65537)), vec![1]);
    }

    #[test]
    fn roots_polynomial_vanishes_exactly_on_its_roots() {
        let modulus = m(65537);
        let roots = [3u64, 17, 500, 500, 65000];
        let polyn = polyn_with_roots(&roots, modulus);
        assert_eq!(polyn.len(), roots.len() + 1);
        assert_eq!(*polyn.last().unwrap(), 1, "monic");
        for &r in &roots {
            assert_eq!(polyn_eval(&polyn, r, modulus), 0);
        }
        for probe in [0u64, 1, 2, 499, 501, 65001] {
            assert_ne!(polyn_eval(&polyn, probe, modulus), 0, "probe={probe}");
        }
    }

    #[test]
    fn newton_passes_through_every_point() {
        let modulus = m(65537);
        let mut rng = rand::rngs::StdRng::seed_from_u64(11);
        for size in [1usize, 2, 5, 16] {
            // Distinct points by construction.
            let points: Vec<Felt> = (0..size as u64).map(|i| i * 97 + 5).collect();
            let values: Vec<Felt> =
                (0..size).map(|_| rng.gen_range(0..modulus.value())).collect();
            let polyn = newton_interpolate(&points, &values, modulus).unwrap();
            assert_eq!(polyn.len(), size);
            for (p, v) in points.iter().zip(&values) {
                assert_eq!(polyn_eval(&polyn, *p, modulus), *v);
            }
        }
    }

    #[test]
    fn newton_edge_cases() {
        let modulus = m(65537);
        assert_eq!(newton_interpolate(&[], &[], modulus).unwrap(), vec![0]);
        assert_eq!(
            newton_interpolate(&[1, 2, 3], &[0, 0, 0], modulus).unwrap(),
            vec![0, 0, 0]
        );
    }

    #[test]
    fn newton_failure_kinds() {
        assert_eq!(
            newton_interpolate(&[1, 1], &[0, 0], m(3)).unwrap_err(),
            InterpolationError::RepeatedPoint,
            "repeated points are rejected even when the values are all zero"
        );
        assert_eq!(
            newton_interpolate(&[1, 1], &[0, 1], m(3)).unwrap_err(),
            InterpolationError::RepeatedPoint
        );
        assert_eq!(
            newton_interpolate(&[1], &[1, 2], m(3)).unwrap_err(),
            InterpolationError::SizeMismatch { points: 1, values: 2 }
        );
        assert_eq!(
            newton_interpolate(&[1, 2], &[1, 2], m(15)).unwrap_err(),
            InterpolationError::InvalidModulus(15)
        );
    }
}

//! Algebraic semirings driving the contraction evaluator.
//!
//! A semiring (S, ⊕, ⊗, 0, 1) fixes how products of factor entries are
//! combined and how summed-over indices are reduced:
//!
//! | Semiring   | ⊕   | ⊗ | 0  | 1 | potential p maps to |
//! |------------|-----|---|----|---|---------------------|
//! | [`Real`]     | +   | × | 0  | 1 | p                   |
//! | [`Tropical`] | max | + | -∞ | 0 | ln p                |
//!
//! Elements are stored as `f64`; the evaluator never inspects which
//! semiring it runs under.

/// A commutative semiring over `f64` carriers.
pub trait Semiring: Copy + Send + Sync + 'static {
    /// Short name used in logs.
    const NAME: &'static str;

    /// Additive identity, absorbing for ⊗.
    fn zero() -> f64;

    /// Multiplicative identity.
    fn one() -> f64;

    /// Reduction operator ⊕.
    fn add(a: f64, b: f64) -> f64;

    /// Combination operator ⊗.
    fn mul(a: f64, b: f64) -> f64;

    /// Embed a non-negative potential into the semiring carrier.
    fn from_potential(p: f64) -> f64;

    /// Fold a sequence with ⊕.
    fn reduce<I: IntoIterator<Item = f64>>(values: I) -> f64 {
        values.into_iter().fold(Self::zero(), Self::add)
    }

    /// Fold a sequence with ⊗.
    fn combine<I: IntoIterator<Item = f64>>(values: I) -> f64 {
        values.into_iter().fold(Self::one(), Self::mul)
    }
}

/// Sum-product semiring on probabilities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Real;

impl Semiring for Real {
    const NAME: &'static str = "real";

    #[inline]
    fn zero() -> f64 {
        0.0
    }

    #[inline]
    fn one() -> f64 {
        1.0
    }

    #[inline]
    fn add(a: f64, b: f64) -> f64 {
        a + b
    }

    #[inline]
    fn mul(a: f64, b: f64) -> f64 {
        a * b
    }

    #[inline]
    fn from_potential(p: f64) -> f64 {
        p
    }
}

/// Max-plus semiring on log-probabilities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tropical;

impl Semiring for Tropical {
    const NAME: &'static str = "tropical";

    #[inline]
    fn zero() -> f64 {
        f64::NEG_INFINITY
    }

    #[inline]
    fn one() -> f64 {
        0.0
    }

    #[inline]
    fn add(a: f64, b: f64) -> f64 {
        a.max(b)
    }

    #[inline]
    fn mul(a: f64, b: f64) -> f64 {
        // -inf must stay absorbing even against +inf
        if a == f64::NEG_INFINITY || b == f64::NEG_INFINITY {
            f64::NEG_INFINITY
        } else {
            a + b
        }
    }

    #[inline]
    fn from_potential(p: f64) -> f64 {
        if p > 0.0 {
            p.ln()
        } else {
            f64::NEG_INFINITY
        }
    }
}

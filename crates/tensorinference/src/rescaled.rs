//! Log-scaled tensors for sum-product contraction.
//!
//! Multiplying hundreds of bounded potentials underflows (or overflows) an
//! `f64` long before the contraction finishes. A [`RescaledArray`] keeps the
//! magnitude in a separate log prefactor `α` and stores a body `N` with
//! `max |N| == 1`, so the logical tensor is `exp(α) · N`.
//!
//! The all-zero tensor is stored as `α = -∞` with a zero body; it is
//! absorbing under every product and never produces NaN.

use scirs2_core::ndarray::{ArrayD, IxDyn};

use crate::einsum::{einsum, label_size, EinCode, SizeDict};
use crate::error::{InferenceError, Result};
use crate::semiring::Real;

/// A tensor represented as `exp(log_factor) * normalized`.
#[derive(Debug, Clone, PartialEq)]
pub struct RescaledArray {
    log_factor: f64,
    normalized: ArrayD<f64>,
}

/// Rescale a dense tensor so that its largest magnitude becomes one.
pub fn rescale_array(tensor: &ArrayD<f64>) -> RescaledArray {
    RescaledArray::new(0.0, tensor.clone())
}

impl RescaledArray {
    /// Build `exp(log_factor) * body`, renormalizing the body.
    pub fn new(log_factor: f64, body: ArrayD<f64>) -> Self {
        let max = body.iter().fold(0.0f64, |m, x| m.max(x.abs()));
        if max.is_nan() || max <= 0.0 || log_factor == f64::NEG_INFINITY {
            return Self::zeros(body.raw_dim());
        }
        Self {
            log_factor: log_factor + max.ln(),
            normalized: body.mapv(|x| x / max),
        }
    }

    /// The zero tensor of the given shape.
    pub fn zeros(shape: IxDyn) -> Self {
        Self {
            log_factor: f64::NEG_INFINITY,
            normalized: ArrayD::zeros(shape),
        }
    }

    /// A tensor of ones.
    pub fn ones(shape: IxDyn) -> Self {
        Self {
            log_factor: 0.0,
            normalized: ArrayD::ones(shape),
        }
    }

    /// Log prefactor `α`; `-inf` for the zero tensor.
    pub fn log_factor(&self) -> f64 {
        self.log_factor
    }

    /// Normalized body `N`.
    pub fn normalized(&self) -> &ArrayD<f64> {
        &self.normalized
    }

    pub fn shape(&self) -> &[usize] {
        self.normalized.shape()
    }

    pub fn is_zero(&self) -> bool {
        self.log_factor == f64::NEG_INFINITY
    }

    /// Reconstruct the plain tensor `exp(α) · N`.
    pub fn to_array(&self) -> ArrayD<f64> {
        if self.is_zero() {
            return ArrayD::zeros(self.normalized.raw_dim());
        }
        let scale = self.log_factor.exp();
        let alpha = self.log_factor;
        self.normalized.mapv(|x| {
            if x == 0.0 {
                0.0
            } else if scale.is_finite() {
                x * scale
            } else {
                x.signum() * (alpha + x.abs().ln()).exp()
            }
        })
    }

    /// Elementwise natural logarithm of the logical values (`-inf` at zeros).
    pub fn log_values(&self) -> ArrayD<f64> {
        let alpha = self.log_factor;
        self.normalized.mapv(|x| {
            if x > 0.0 {
                alpha + x.ln()
            } else {
                f64::NEG_INFINITY
            }
        })
    }

    /// Elementwise product.
    pub fn combine(&self, other: &RescaledArray) -> Result<RescaledArray> {
        if self.shape() != other.shape() {
            return Err(InferenceError::DimensionMismatch {
                expected: self.shape().to_vec(),
                got: other.shape().to_vec(),
            });
        }
        if self.is_zero() || other.is_zero() {
            return Ok(Self::zeros(self.normalized.raw_dim()));
        }
        Ok(Self::new(
            self.log_factor + other.log_factor,
            &self.normalized * &other.normalized,
        ))
    }

    /// Sum-product contraction of rescaled operands.
    ///
    /// Bodies are contracted in the real semiring, prefactors add, and the
    /// result is renormalized.
    pub fn einsum(code: &EinCode, xs: &[&RescaledArray], size_dict: &SizeDict) -> Result<Self> {
        if xs.iter().any(|x| x.is_zero()) {
            let shape: Vec<usize> = code
                .iy
                .iter()
                .map(|&l| label_size(size_dict, l))
                .collect::<Result<_>>()?;
            code.check_shapes(xs.iter().map(|x| x.shape()), size_dict)?;
            return Ok(Self::zeros(IxDyn(&shape)));
        }
        let bodies: Vec<&ArrayD<f64>> = xs.iter().map(|x| &x.normalized).collect();
        let body = einsum::<Real>(code, &bodies, size_dict)?;
        let log_factor = xs.iter().map(|x| x.log_factor).sum();
        Ok(Self::new(log_factor, body))
    }

    /// Total mass as a rank-0 rescaled array.
    pub fn sum(&self) -> RescaledArray {
        let total: f64 = self.normalized.sum();
        Self::new(self.log_factor, ArrayD::from_elem(IxDyn(&[]), total))
    }

    /// Natural logarithm of the total mass.
    pub fn log_sum(&self) -> f64 {
        let total: f64 = self.normalized.sum();
        if self.is_zero() || total.is_nan() || total <= 0.0 {
            f64::NEG_INFINITY
        } else {
            self.log_factor + total.ln()
        }
    }

    /// The body divided by its total, i.e. a probability distribution.
    /// A zero tensor yields zeros.
    pub fn normalized_distribution(&self) -> ArrayD<f64> {
        let total: f64 = self.normalized.sum();
        if self.is_zero() || total.is_nan() || total <= 0.0 {
            return ArrayD::zeros(self.normalized.raw_dim());
        }
        self.normalized.mapv(|x| x / total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use scirs2_core::ndarray::Array;

    fn arr(shape: Vec<usize>, values: Vec<f64>) -> ArrayD<f64> {
        Array::from_shape_vec(shape, values).unwrap().into_dyn()
    }

    #[test]
    fn test_rescale_round_trip() {
        let t = arr(vec![2, 2], vec![0.5, 4.0, 1.0, 0.0]);
        let r = rescale_array(&t);
        assert_abs_diff_eq!(r.log_factor(), 4.0f64.ln(), epsilon = 1e-12);
        assert_abs_diff_eq!(r.normalized()[[0, 1]], 1.0);
        let back = r.to_array();
        for (a, b) in back.iter().zip(t.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_zero_tensor_sentinel() {
        let z = rescale_array(&ArrayD::zeros(IxDyn(&[3])));
        assert!(z.is_zero());
        assert_eq!(z.log_factor(), f64::NEG_INFINITY);
        assert!(z.to_array().iter().all(|&x| x == 0.0));
        assert!(z.log_values().iter().all(|&x| x == f64::NEG_INFINITY));
        assert_eq!(z.log_sum(), f64::NEG_INFINITY);
        assert!(z.normalized_distribution().iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_combine_adds_prefactors() {
        let a = rescale_array(&arr(vec![2], vec![2.0, 1.0]));
        let b = rescale_array(&arr(vec![2], vec![3.0, 6.0]));
        let c = a.combine(&b).unwrap();
        let plain = c.to_array();
        assert_abs_diff_eq!(plain[[0]], 6.0, epsilon = 1e-12);
        assert_abs_diff_eq!(plain[[1]], 6.0, epsilon = 1e-12);
        assert_abs_diff_eq!(c.normalized().iter().fold(0.0f64, |m, x| m.max(*x)), 1.0);
    }

    #[test]
    fn test_combine_with_zero_is_absorbing() {
        let a = rescale_array(&arr(vec![2], vec![2.0, 1.0]));
        let z = RescaledArray::zeros(IxDyn(&[2]));
        assert!(a.combine(&z).unwrap().is_zero());
        assert!(a.combine(&RescaledArray::zeros(IxDyn(&[3]))).is_err());
    }

    #[test]
    fn test_no_underflow_over_long_products() {
        let small = rescale_array(&arr(vec![2], vec![1e-200, 2e-200]));
        let mut acc = RescaledArray::ones(IxDyn(&[2]));
        for _ in 0..10 {
            acc = acc.combine(&small).unwrap();
        }
        // plain f64 would be exactly zero by now
        let expected = 10.0 * (2e-200f64).ln();
        assert_abs_diff_eq!(acc.log_values()[[1]], expected, epsilon = 1e-9);
        assert!(!acc.is_zero());
    }

    #[test]
    fn test_einsum_matches_plain_contraction() {
        let a = arr(vec![2, 2], vec![2.0, 1.0, 1.0, 2.0]);
        let b = arr(vec![2, 2], vec![1.0, 1.0, 1.0, 3.0]);
        let code = EinCode::new(vec![vec![0, 1], vec![1, 2]], vec![]);
        let sizes: SizeDict = [(0, 2), (1, 2), (2, 2)].into_iter().collect();
        let z = RescaledArray::einsum(&code, &[&rescale_array(&a), &rescale_array(&b)], &sizes)
            .unwrap();
        assert_abs_diff_eq!(z.to_array()[[]], 18.0, epsilon = 1e-10);
        assert_abs_diff_eq!(z.log_sum(), 18.0f64.ln(), epsilon = 1e-10);
    }

    #[test]
    fn test_sum_and_distribution() {
        let r = rescale_array(&arr(vec![3], vec![1.0, 3.0, 4.0]));
        assert_abs_diff_eq!(r.sum().to_array()[[]], 8.0, epsilon = 1e-12);
        let d = r.normalized_distribution();
        assert_abs_diff_eq!(d[[2]], 0.5, epsilon = 1e-12);
    }
}

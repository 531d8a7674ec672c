//! Einstein-summation specifications and the semiring-generic kernel.
//!
//! A single contraction step is written as an [`EinCode`]: one label list per
//! input tensor plus the output label list. Under a semiring (⊕, ⊗) the step
//! computes
//!
//! ```text
//! y[iy] = ⊕_{labels not in iy} ⊗_i x_i[ix_i]
//! ```
//!
//! Labels are variable identifiers (`usize`). A label may appear in several
//! inputs (shared index), several times in one input (diagonal), or only in
//! the output (broadcast).

use scirs2_core::ndarray::{ArrayD, Axis, IxDyn, Slice};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::error::{InferenceError, Result};
use crate::semiring::Semiring;

/// Mapping from label to dimension size.
pub type SizeDict = HashMap<usize, usize>;

/// Label specification of one (possibly n-ary) contraction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EinCode {
    /// Input index labels, one list per operand
    pub ixs: Vec<Vec<usize>>,
    /// Output index labels
    pub iy: Vec<usize>,
}

impl EinCode {
    /// Create a new einsum specification.
    pub fn new(ixs: Vec<Vec<usize>>, iy: Vec<usize>) -> Self {
        Self { ixs, iy }
    }

    /// Number of operands.
    pub fn arity(&self) -> usize {
        self.ixs.len()
    }

    /// Every distinct label, output labels first, then the summed labels in
    /// order of first appearance among the inputs.
    pub fn all_labels(&self) -> Vec<usize> {
        let mut labels: Vec<usize> = Vec::new();
        for &l in self.iy.iter().chain(self.ixs.iter().flatten()) {
            if !labels.contains(&l) {
                labels.push(l);
            }
        }
        labels
    }

    /// Labels summed over by this step, in order of first appearance.
    pub fn inner_labels(&self) -> Vec<usize> {
        let mut labels: Vec<usize> = Vec::new();
        for &l in self.ixs.iter().flatten() {
            if !self.iy.contains(&l) && !labels.contains(&l) {
                labels.push(l);
            }
        }
        labels
    }

    /// Check operand shapes against the labels and the size dictionary.
    pub fn check_shapes<'a, I>(&self, shapes: I, size_dict: &SizeDict) -> Result<()>
    where
        I: IntoIterator<Item = &'a [usize]>,
    {
        let mut count = 0;
        for (ix, shape) in self.ixs.iter().zip(shapes) {
            count += 1;
            if ix.len() != shape.len() {
                return Err(InferenceError::DimensionMismatch {
                    expected: ix.iter().map(|l| size_dict.get(l).copied().unwrap_or(0)).collect(),
                    got: shape.to_vec(),
                });
            }
            for (&label, &dim) in ix.iter().zip(shape) {
                let expected = label_size(size_dict, label)?;
                if expected != dim {
                    return Err(InferenceError::CardinalityMismatch {
                        var: label,
                        expected,
                        got: dim,
                    });
                }
            }
        }
        if count != self.ixs.len() {
            return Err(InferenceError::InvalidPlan(format!(
                "expected {} operands, got {}",
                self.ixs.len(),
                count
            )));
        }
        Ok(())
    }
}

impl std::fmt::Display for EinCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let fmt_ix = |ix: &[usize]| {
            ix.iter()
                .map(|l| l.to_string())
                .collect::<Vec<_>>()
                .join(" ")
        };
        let inputs: Vec<String> = self.ixs.iter().map(|ix| fmt_ix(ix)).collect();
        write!(f, "{} -> {}", inputs.join(", "), fmt_ix(&self.iy))
    }
}

/// Look up the size of a label.
pub fn label_size(size_dict: &SizeDict, label: usize) -> Result<usize> {
    size_dict
        .get(&label)
        .copied()
        .ok_or_else(|| InferenceError::InvalidPlan(format!("label {} has no size", label)))
}

/// Number of elements of a tensor with the given labels.
///
/// Computed in `u128` so that oversized plans are reported instead of
/// wrapping around.
pub fn tensor_len(labels: &[usize], size_dict: &SizeDict) -> Result<u128> {
    let mut len: u128 = 1;
    for &l in labels {
        len = len.saturating_mul(label_size(size_dict, l)? as u128);
    }
    Ok(len)
}

/// Infer the size dictionary of a network from its leaf tensors.
pub fn infer_size_dict<'a, I>(ixs: &[Vec<usize>], shapes: I) -> Result<SizeDict>
where
    I: IntoIterator<Item = &'a [usize]>,
{
    let mut size_dict = SizeDict::new();
    for (ix, shape) in ixs.iter().zip(shapes) {
        if ix.len() != shape.len() {
            return Err(InferenceError::DimensionMismatch {
                expected: vec![ix.len()],
                got: vec![shape.len()],
            });
        }
        for (&label, &dim) in ix.iter().zip(shape) {
            match size_dict.get(&label) {
                Some(&expected) if expected != dim => {
                    return Err(InferenceError::CardinalityMismatch {
                        var: label,
                        expected,
                        got: dim,
                    });
                }
                Some(_) => {}
                None => {
                    size_dict.insert(label, dim);
                }
            }
        }
    }
    Ok(size_dict)
}

/// Row-major stride contributed by every label of `labels` when indexing a
/// tensor laid out as `ix`. Repeated labels in `ix` add up (diagonal access);
/// labels absent from `ix` get stride zero.
fn label_strides(ix: &[usize], labels: &[usize], size_dict: &SizeDict) -> Result<Vec<usize>> {
    let mut strides = vec![0usize; ix.len()];
    let mut acc = 1usize;
    for k in (0..ix.len()).rev() {
        strides[k] = acc;
        acc = acc.saturating_mul(label_size(size_dict, ix[k])?);
    }
    Ok(labels
        .iter()
        .map(|l| {
            ix.iter()
                .zip(&strides)
                .filter(|(x, _)| *x == l)
                .map(|(_, s)| *s)
                .sum()
        })
        .collect())
}

/// Contract `xs` according to `code` under the semiring `S`.
///
/// Walks the joint index space of all labels once, combining the addressed
/// input entries with ⊗ and accumulating into the output cell with ⊕.
pub fn einsum<S: Semiring>(
    code: &EinCode,
    xs: &[&ArrayD<f64>],
    size_dict: &SizeDict,
) -> Result<ArrayD<f64>> {
    code.check_shapes(xs.iter().map(|x| x.shape()), size_dict)?;

    let labels = code.all_labels();
    let dims: Vec<usize> = labels
        .iter()
        .map(|&l| label_size(size_dict, l))
        .collect::<Result<_>>()?;
    let out_shape: Vec<usize> = code
        .iy
        .iter()
        .map(|&l| label_size(size_dict, l))
        .collect::<Result<_>>()?;

    let requested = tensor_len(&code.iy, size_dict)?;
    let out_len = usize::try_from(requested).map_err(|_| InferenceError::ResourceExhausted {
        requested,
        limit: usize::MAX,
    })?;
    let mut out = vec![S::zero(); out_len];

    let total = tensor_len(&labels, size_dict)?;
    if total > 0 {
        let data: Vec<Vec<f64>> = xs.iter().map(|x| x.iter().copied().collect()).collect();
        let in_strides: Vec<Vec<usize>> = code
            .ixs
            .iter()
            .map(|ix| label_strides(ix, &labels, size_dict))
            .collect::<Result<_>>()?;
        let out_strides = label_strides(&code.iy, &labels, size_dict)?;

        let mut counter = vec![0usize; labels.len()];
        let mut in_off = vec![0usize; data.len()];
        let mut out_off = 0usize;
        let mut remaining = total;
        while remaining > 0 {
            remaining -= 1;

            let mut value = S::one();
            for (x, &off) in data.iter().zip(&in_off) {
                value = S::mul(value, x[off]);
            }
            out[out_off] = S::add(out[out_off], value);

            // odometer step, last label fastest
            let mut k = labels.len();
            while k > 0 {
                k -= 1;
                counter[k] += 1;
                for (off, strides) in in_off.iter_mut().zip(&in_strides) {
                    *off += strides[k];
                }
                out_off += out_strides[k];
                if counter[k] < dims[k] {
                    break;
                }
                for (off, strides) in in_off.iter_mut().zip(&in_strides) {
                    *off -= strides[k] * dims[k];
                }
                out_off -= out_strides[k] * dims[k];
                counter[k] = 0;
            }
        }
    }

    ArrayD::from_shape_vec(IxDyn(&out_shape), out)
        .map_err(|e| InferenceError::InvalidPlan(format!("output shape {:?}: {}", out_shape, e)))
}

/// Slice every dimension of `tensor` whose label is fixed down to the fixed
/// index. The dimension is kept with size one so label lists stay valid.
pub fn slice_fixed(
    tensor: &ArrayD<f64>,
    ix: &[usize],
    fixed: &BTreeMap<usize, usize>,
) -> Result<ArrayD<f64>> {
    let mut out = tensor.clone();
    for (axis, label) in ix.iter().enumerate() {
        if let Some(&value) = fixed.get(label) {
            let dim = out.shape()[axis];
            if value >= dim {
                return Err(InferenceError::InvalidEvidence(format!(
                    "value {} out of range for variable {} with cardinality {}",
                    value, label, dim
                )));
            }
            out = out
                .slice_axis(Axis(axis), Slice::from(value..value + 1))
                .to_owned();
        }
    }
    Ok(out)
}

/// Convert a flat row-major offset into a multi-index.
pub fn unravel_index(mut flat: usize, shape: &[usize]) -> Vec<usize> {
    let mut index = vec![0; shape.len()];
    for k in (0..shape.len()).rev() {
        if shape[k] > 0 {
            index[k] = flat % shape[k];
            flat /= shape[k];
        }
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semiring::{Real, Tropical};
    use approx::assert_abs_diff_eq;
    use scirs2_core::ndarray::Array;

    fn arr(shape: Vec<usize>, values: Vec<f64>) -> ArrayD<f64> {
        Array::from_shape_vec(shape, values).unwrap().into_dyn()
    }

    fn sizes(pairs: &[(usize, usize)]) -> SizeDict {
        pairs.iter().copied().collect()
    }

    #[test]
    fn test_matrix_product() {
        // C[i,k] = Σ_j A[i,j] B[j,k]
        let a = arr(vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]);
        let b = arr(vec![2, 2], vec![5.0, 6.0, 7.0, 8.0]);
        let code = EinCode::new(vec![vec![0, 1], vec![1, 2]], vec![0, 2]);
        let c = einsum::<Real>(&code, &[&a, &b], &sizes(&[(0, 2), (1, 2), (2, 2)])).unwrap();
        assert_eq!(c.shape(), &[2, 2]);
        assert_abs_diff_eq!(c[[0, 0]], 19.0);
        assert_abs_diff_eq!(c[[0, 1]], 22.0);
        assert_abs_diff_eq!(c[[1, 0]], 43.0);
        assert_abs_diff_eq!(c[[1, 1]], 50.0);
    }

    #[test]
    fn test_tropical_matrix_product() {
        // C[i,k] = max_j (A[i,j] + B[j,k])
        let a = arr(vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]);
        let b = arr(vec![2, 2], vec![5.0, 6.0, 7.0, 8.0]);
        let code = EinCode::new(vec![vec![0, 1], vec![1, 2]], vec![0, 2]);
        let c = einsum::<Tropical>(&code, &[&a, &b], &sizes(&[(0, 2), (1, 2), (2, 2)])).unwrap();
        assert_abs_diff_eq!(c[[0, 0]], 9.0);
        assert_abs_diff_eq!(c[[1, 1]], 12.0);
    }

    #[test]
    fn test_full_reduction_to_scalar() {
        let a = arr(vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let code = EinCode::new(vec![vec![0, 1]], vec![]);
        let s = einsum::<Real>(&code, &[&a], &sizes(&[(0, 2), (1, 3)])).unwrap();
        assert_eq!(s.ndim(), 0);
        assert_abs_diff_eq!(s[[]], 21.0);
    }

    #[test]
    fn test_permutation_and_diagonal() {
        let a = arr(vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let code = EinCode::new(vec![vec![0, 1]], vec![1, 0]);
        let t = einsum::<Real>(&code, &[&a], &sizes(&[(0, 2), (1, 3)])).unwrap();
        assert_eq!(t.shape(), &[3, 2]);
        assert_abs_diff_eq!(t[[2, 1]], 6.0);

        let m = arr(vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]);
        let trace = EinCode::new(vec![vec![0, 0]], vec![]);
        let tr = einsum::<Real>(&trace, &[&m], &sizes(&[(0, 2)])).unwrap();
        assert_abs_diff_eq!(tr[[]], 5.0);
    }

    #[test]
    fn test_broadcast_output_label() {
        let a = arr(vec![2], vec![1.0, 2.0]);
        let code = EinCode::new(vec![vec![0]], vec![0, 1]);
        let b = einsum::<Real>(&code, &[&a], &sizes(&[(0, 2), (1, 3)])).unwrap();
        assert_eq!(b.shape(), &[2, 3]);
        assert_abs_diff_eq!(b[[1, 2]], 2.0);
    }

    #[test]
    fn test_ternary_contraction() {
        let a = arr(vec![2], vec![1.0, 2.0]);
        let b = arr(vec![2], vec![3.0, 4.0]);
        let c = arr(vec![2], vec![5.0, 6.0]);
        let code = EinCode::new(vec![vec![0], vec![0], vec![0]], vec![]);
        let s = einsum::<Real>(&code, &[&a, &b, &c], &sizes(&[(0, 2)])).unwrap();
        assert_abs_diff_eq!(s[[]], 1.0 * 3.0 * 5.0 + 2.0 * 4.0 * 6.0);
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let a = arr(vec![3], vec![1.0, 2.0, 3.0]);
        let code = EinCode::new(vec![vec![0]], vec![0]);
        let err = einsum::<Real>(&code, &[&a], &sizes(&[(0, 2)])).unwrap_err();
        assert!(matches!(err, InferenceError::CardinalityMismatch { var: 0, .. }));
    }

    #[test]
    fn test_infer_size_dict_detects_conflict() {
        let ixs = vec![vec![0, 1], vec![1]];
        let ok = infer_size_dict(&ixs, [&[2usize, 3][..], &[3][..]]).unwrap();
        assert_eq!(ok[&1], 3);
        assert!(infer_size_dict(&ixs, [&[2usize, 3][..], &[4][..]]).is_err());
    }

    #[test]
    fn test_slice_fixed_keeps_rank() {
        let a = arr(vec![2, 2], vec![0.1, 0.2, 0.3, 0.4]);
        let fixed: BTreeMap<usize, usize> = [(7, 1)].into_iter().collect();
        let s = slice_fixed(&a, &[3, 7], &fixed).unwrap();
        assert_eq!(s.shape(), &[2, 1]);
        assert_abs_diff_eq!(s[[1, 0]], 0.4);

        let bad: BTreeMap<usize, usize> = [(7, 2)].into_iter().collect();
        assert!(slice_fixed(&a, &[3, 7], &bad).is_err());
    }

    #[test]
    fn test_unravel_index() {
        assert_eq!(unravel_index(5, &[2, 3]), vec![1, 2]);
        assert_eq!(unravel_index(0, &[]), Vec::<usize>::new());
    }

    #[test]
    fn test_display() {
        let code = EinCode::new(vec![vec![0, 1], vec![1, 2]], vec![0, 2]);
        assert_eq!(code.to_string(), "0 1, 1 2 -> 0 2");
        assert_eq!(code.inner_labels(), vec![1]);
        assert_eq!(code.all_labels(), vec![0, 2, 1]);
    }
}

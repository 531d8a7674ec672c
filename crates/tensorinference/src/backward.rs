//! Backward passes over a cached forward contraction.
//!
//! # Tropical masks
//!
//! For one step `y[iy] = max_{inner} Σ_i x_i[ix_i]`, an entry of `x_i` takes
//! part in a maximizing assignment of a selected output cell exactly when
//!
//! ```text
//! x_i[ix_i] + max_{other labels} ( Σ_{j≠i} x_j[ix_j] - y[iy] ) == 0
//! ```
//!
//! The inner max is itself a tropical einsum of the other inputs and `-y`
//! (restricted to selected cells), so the whole rule reuses the forward
//! kernel. Applied root to leaves it marks every entry that participates in
//! some optimal assignment.
//!
//! # Decoding
//!
//! To read off one concrete assignment the masks are narrowed to a single
//! witness per node: starting from the first maximal root cell (row-major),
//! each node picks the first assignment of its summed labels (row-major, in
//! order of first appearance among its inputs) that its masks allow and that
//! reproduces the node's output value. Children then get one-hot masks, so
//! one consistent choice reaches the leaves.
//!
//! # Sum-product adjoint
//!
//! [`backward_real`] propagates `ȳ` with `x̄_i = Σ_{other labels} ȳ Π_{j≠i} x_j`.
//! With all-ones `ȳ` the adjoint of a per-variable leaf is that variable's
//! unnormalized marginal.

use scirs2_core::ndarray::{ArrayD, Zip};
use std::collections::HashMap;

use crate::contraction::{CachedTree, ContractionDag, DagOp};
use crate::einsum::{einsum, label_size, tensor_len, unravel_index, EinCode, SizeDict};
use crate::error::{InferenceError, Result};
use crate::rescaled::RescaledArray;
use crate::semiring::{Semiring, Tropical};

/// Whether two log values tie within a relative tolerance.
pub fn is_tie(a: f64, b: f64, tolerance: f64) -> bool {
    if !a.is_finite() || !b.is_finite() {
        return false;
    }
    (a - b).abs() <= tolerance * (1.0 + a.abs().max(b.abs()))
}

/// Masks of the input entries that produce the selected output cells of a
/// tropical einsum step.
///
/// Output cells whose value is `-inf` certify nothing, even when selected.
pub fn backward_tropical(
    ixs: &[Vec<usize>],
    xs: &[&ArrayD<f64>],
    iy: &[usize],
    y: &ArrayD<f64>,
    ymask: &ArrayD<bool>,
    size_dict: &SizeDict,
    tolerance: f64,
) -> Result<Vec<ArrayD<bool>>> {
    if y.shape() != ymask.shape() {
        return Err(InferenceError::DimensionMismatch {
            expected: y.shape().to_vec(),
            got: ymask.shape().to_vec(),
        });
    }
    if ixs.len() != xs.len() {
        return Err(InferenceError::InvalidPlan(format!(
            "{} label lists for {} tensors",
            ixs.len(),
            xs.len()
        )));
    }

    let yinv: ArrayD<f64> = Zip::from(y).and(ymask).map_collect(|&v, &m| {
        if m && v.is_finite() {
            -v
        } else {
            f64::NEG_INFINITY
        }
    });

    let mut masks = Vec::with_capacity(xs.len());
    for (i, x) in xs.iter().enumerate() {
        let mut sub_ixs: Vec<Vec<usize>> = Vec::with_capacity(xs.len());
        let mut sub_xs: Vec<&ArrayD<f64>> = Vec::with_capacity(xs.len());
        for (j, (ix, xj)) in ixs.iter().zip(xs).enumerate() {
            if j != i {
                sub_ixs.push(ix.clone());
                sub_xs.push(*xj);
            }
        }
        sub_ixs.push(iy.to_vec());
        sub_xs.push(&yinv);

        let code = EinCode::new(sub_ixs, ixs[i].clone());
        let a = einsum::<Tropical>(&code, &sub_xs, size_dict)?;
        if a.shape() != x.shape() {
            return Err(InferenceError::DimensionMismatch {
                expected: a.shape().to_vec(),
                got: x.shape().to_vec(),
            });
        }
        let mask = Zip::from(&a)
            .and(*x)
            .map_collect(|&a, &x| is_tie(a + x, 0.0, tolerance));
        masks.push(mask);
    }
    Ok(masks)
}

/// First maximal cell of `y` in row-major order, with its value.
pub fn first_argmax(y: &ArrayD<f64>) -> Option<(f64, Vec<usize>)> {
    let mut best: Option<(f64, usize)> = None;
    for (flat, &v) in y.iter().enumerate() {
        if best.map_or(true, |(b, _)| v > b) {
            best = Some((v, flat));
        }
    }
    best.map(|(v, flat)| (v, unravel_index(flat, y.shape())))
}

/// Mask of every cell of `y` tying with its maximum.
pub fn argmax_mask(y: &ArrayD<f64>, tolerance: f64) -> ArrayD<bool> {
    let max = y.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    y.mapv(|v| is_tie(v, max, tolerance))
}

/// Propagate `ymask` from the root to every leaf of a tropical forward pass.
///
/// Returns one mask per leaf tensor, indexed by tensor index.
pub fn leaf_masks(
    cache: &CachedTree<ArrayD<f64>>,
    ymask: ArrayD<bool>,
    num_leaves: usize,
    size_dict: &SizeDict,
    tolerance: f64,
) -> Result<Vec<ArrayD<bool>>> {
    propagate(&cache.dag, ymask, num_leaves, |id, eins, mask| {
        backward_tropical(
            &eins.ixs,
            &cache.operands(id),
            &eins.iy,
            &cache.values[id],
            &mask,
            size_dict,
            tolerance,
        )
    })
}

/// Thread one optimal assignment from the root cell `index` to the leaves.
///
/// Returns, per leaf tensor, the multi-index of the entry used.
pub fn decode_assignment(
    cache: &CachedTree<ArrayD<f64>>,
    index: Vec<usize>,
    num_leaves: usize,
    size_dict: &SizeDict,
    tolerance: f64,
) -> Result<Vec<Vec<usize>>> {
    propagate(&cache.dag, index, num_leaves, |id, eins, index| {
        select_witness(
            eins,
            &cache.operands(id),
            &cache.values[id],
            &index,
            size_dict,
            tolerance,
        )
    })
}

/// Push a value from the root down to the leaves, visiting nodes in reverse
/// topological order. `step` turns the value at a contraction node into one
/// value per operand.
fn propagate<T, F>(dag: &ContractionDag, seed: T, num_leaves: usize, mut step: F) -> Result<Vec<T>>
where
    F: FnMut(usize, &EinCode, T) -> Result<Vec<T>>,
{
    let mut pending: Vec<Option<T>> = (0..dag.len()).map(|_| None).collect();
    let mut out: Vec<Option<T>> = (0..num_leaves).map(|_| None).collect();
    store_leaf(&mut pending, dag.root, seed)?;

    for node in dag.nodes.iter().rev() {
        let Some(value) = pending.get_mut(node.id).and_then(Option::take) else {
            continue;
        };
        match &node.op {
            DagOp::Leaf { tensor_index } => store_leaf(&mut out, *tensor_index, value)?,
            DagOp::Contract { eins } => {
                let parts = step(node.id, eins, value)?;
                for (&operand, part) in node.operands.iter().zip(parts) {
                    store_leaf(&mut pending, operand, part)?;
                }
            }
        }
    }
    collect_leaves(out)
}

/// Pick the input entries certifying output cell `index` of one tropical step.
///
/// Falls back to the best-scoring assignment when rounding leaves no exact
/// witness, and to the first assignment when the cell is `-inf`.
pub fn select_witness(
    eins: &EinCode,
    xs: &[&ArrayD<f64>],
    y: &ArrayD<f64>,
    index: &[usize],
    size_dict: &SizeDict,
    tolerance: f64,
) -> Result<Vec<Vec<usize>>> {
    let target = *y.get(index).ok_or_else(|| InferenceError::DimensionMismatch {
        expected: y.shape().to_vec(),
        got: index.to_vec(),
    })?;
    let mut ymask = ArrayD::from_elem(y.raw_dim(), false);
    if let Some(cell) = ymask.get_mut(index) {
        *cell = true;
    }
    let masks = backward_tropical(&eins.ixs, xs, &eins.iy, y, &ymask, size_dict, tolerance)?;

    let mut assignment: HashMap<usize, usize> = eins.iy.iter().copied().zip(index.iter().copied()).collect();
    let inner = eins.inner_labels();
    let dims: Vec<usize> = inner
        .iter()
        .map(|&l| label_size(size_dict, l))
        .collect::<Result<_>>()?;
    let total = tensor_len(&inner, size_dict)?;

    let mut counter = vec![0usize; inner.len()];
    let mut fallback: Option<(f64, Vec<Vec<usize>>)> = None;
    let mut step: u128 = 0;
    while step < total {
        step += 1;
        for (&l, &v) in inner.iter().zip(&counter) {
            assignment.insert(l, v);
        }
        let picks: Vec<Vec<usize>> = eins
            .ixs
            .iter()
            .map(|ix| ix.iter().map(|l| assignment.get(l).copied().unwrap_or(0)).collect())
            .collect();
        let value = Tropical::combine(xs.iter().zip(&picks).map(|(x, p)| x[p.as_slice()]));
        let allowed = masks.iter().zip(&picks).all(|(m, p)| m[p.as_slice()]);
        if allowed && is_tie(value, target, tolerance) {
            return Ok(picks);
        }
        if fallback.as_ref().map_or(true, |(best, _)| value > *best) {
            fallback = Some((value, picks));
        }

        let mut k = inner.len();
        while k > 0 {
            k -= 1;
            counter[k] += 1;
            if counter[k] < dims[k] {
                break;
            }
            counter[k] = 0;
        }
    }

    fallback
        .map(|(_, picks)| picks)
        .ok_or_else(|| InferenceError::InvalidPlan(format!("no witness for node {}", eins)))
}

/// Sum-product adjoint from the root to every leaf.
///
/// Returns `x̄` per leaf tensor, indexed by tensor index.
pub fn backward_real(
    cache: &CachedTree<RescaledArray>,
    ybar: RescaledArray,
    num_leaves: usize,
    size_dict: &SizeDict,
) -> Result<Vec<RescaledArray>> {
    propagate(&cache.dag, ybar, num_leaves, |id, eins, ybar| {
        let xs = cache.operands(id);
        let mut out = Vec::with_capacity(xs.len());
        for i in 0..xs.len() {
            let mut sub_ixs: Vec<Vec<usize>> = Vec::with_capacity(xs.len());
            let mut sub_xs: Vec<&RescaledArray> = Vec::with_capacity(xs.len());
            for (j, (ix, x)) in eins.ixs.iter().zip(&xs).enumerate() {
                if j != i {
                    sub_ixs.push(ix.clone());
                    sub_xs.push(*x);
                }
            }
            sub_ixs.push(eins.iy.clone());
            sub_xs.push(&ybar);
            let code = EinCode::new(sub_ixs, eins.ixs[i].clone());
            out.push(RescaledArray::einsum(&code, &sub_xs, size_dict)?);
        }
        Ok(out)
    })
}

fn store_leaf<T>(out: &mut [Option<T>], index: usize, value: T) -> Result<()> {
    let slot = out
        .get_mut(index)
        .ok_or_else(|| InferenceError::InvalidPlan(format!("slot {} out of range", index)))?;
    *slot = Some(value);
    Ok(())
}

fn collect_leaves<T>(out: Vec<Option<T>>) -> Result<Vec<T>> {
    out.into_iter()
        .enumerate()
        .map(|(i, v)| {
            v.ok_or_else(|| InferenceError::InvalidPlan(format!("leaf {} is not in the plan", i)))
        })
        .collect()
}

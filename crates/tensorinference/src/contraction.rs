//! Contraction trees and the semiring-generic evaluator.
//!
//! A [`ContractionTree`] is a nested einsum: every internal node contracts
//! the outputs of its children with its own [`EinCode`]. The evaluator walks
//! the tree bottom-up and never looks at which semiring it runs under; the
//! only per-semiring code lives behind [`SemiringTensor`].
//!
//! The same plan is exposed as a flat [`ContractionDag`] for callers that
//! want to schedule node evaluations themselves.

use rayon::prelude::*;
use scirs2_core::ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::debug;

use crate::einsum::{einsum, tensor_len, EinCode, SizeDict};
use crate::error::{InferenceError, Result};
use crate::rescaled::RescaledArray;
use crate::semiring::{Real, Semiring};

/// Tensor storage that can be contracted under the semiring `S`.
pub trait SemiringTensor<S: Semiring>: Clone + Send + Sync + Sized {
    /// Embed a table of non-negative potentials.
    fn from_potentials(values: &ArrayD<f64>) -> Self;

    /// Dimension sizes.
    fn dims(&self) -> &[usize];

    /// Run one einsum step.
    fn contract(code: &EinCode, xs: &[&Self], size_dict: &SizeDict) -> Result<Self>;
}

impl<S: Semiring> SemiringTensor<S> for ArrayD<f64> {
    fn from_potentials(values: &ArrayD<f64>) -> Self {
        values.mapv(S::from_potential)
    }

    fn dims(&self) -> &[usize] {
        self.shape()
    }

    fn contract(code: &EinCode, xs: &[&Self], size_dict: &SizeDict) -> Result<Self> {
        einsum::<S>(code, xs, size_dict)
    }
}

impl SemiringTensor<Real> for RescaledArray {
    fn from_potentials(values: &ArrayD<f64>) -> Self {
        crate::rescaled::rescale_array(values)
    }

    fn dims(&self) -> &[usize] {
        self.shape()
    }

    fn contract(code: &EinCode, xs: &[&Self], size_dict: &SizeDict) -> Result<Self> {
        RescaledArray::einsum(code, xs, size_dict)
    }
}

/// Evaluation settings shared by every query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContractionOptions {
    /// Evaluate sibling subtrees (and marginal-MAP clusters) on the rayon pool
    pub parallel: bool,
    /// Largest number of elements any intermediate tensor may have
    pub max_tensor_size: usize,
    /// Relative tolerance when comparing log values for ties
    pub tie_tolerance: f64,
}

impl Default for ContractionOptions {
    fn default() -> Self {
        Self {
            parallel: true,
            max_tensor_size: 1 << 28,
            tie_tolerance: 1e-10,
        }
    }
}

impl ContractionOptions {
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_max_tensor_size(mut self, max_tensor_size: usize) -> Self {
        self.max_tensor_size = max_tensor_size;
        self
    }

    pub fn with_tie_tolerance(mut self, tie_tolerance: f64) -> Self {
        self.tie_tolerance = tie_tolerance;
        self
    }

    /// Fail if a tensor with `labels` would exceed the size limit.
    pub fn check_size(&self, labels: &[usize], size_dict: &SizeDict) -> Result<()> {
        let requested = tensor_len(labels, size_dict)?;
        if requested > self.max_tensor_size as u128 {
            return Err(InferenceError::ResourceExhausted {
                requested,
                limit: self.max_tensor_size,
            });
        }
        Ok(())
    }
}

/// A contraction plan as a tree of einsum steps.
///
/// `Node::eins.ixs[k]` must equal the output labels of `args[k]`; leaves
/// refer to the label lists of the network's [`EinCode`].
///
/// Plans for long chains nest thousands of levels deep, so every walk over
/// the tree (including `Clone`, `PartialEq` and `Drop`) uses an explicit
/// stack. Serialized trees take the flat [`ContractionDag`] form.
#[derive(Serialize, Deserialize)]
#[serde(into = "ContractionDag", try_from = "ContractionDag")]
pub enum ContractionTree {
    /// An input tensor of the network
    Leaf { tensor_index: usize },
    /// Contraction of the children's outputs
    Node {
        args: Vec<ContractionTree>,
        eins: EinCode,
    },
}

/// Intermediate results of a forward pass, one per node of the plan's DAG.
#[derive(Debug, Clone)]
pub struct CachedTree<T> {
    pub dag: ContractionDag,
    /// `values[id]` is the output of DAG node `id`
    pub values: Vec<T>,
}

impl<T> CachedTree<T> {
    /// Output of the root contraction.
    pub fn root(&self) -> &T {
        &self.values[self.dag.root]
    }

    /// Outputs consumed by node `id`, in operand order.
    pub fn operands(&self, id: usize) -> Vec<&T> {
        self.dag.nodes[id]
            .operands
            .iter()
            .map(|&o| &self.values[o])
            .collect()
    }
}

impl ContractionTree {
    pub fn leaf(tensor_index: usize) -> Self {
        ContractionTree::Leaf { tensor_index }
    }

    pub fn node(args: Vec<ContractionTree>, eins: EinCode) -> Self {
        ContractionTree::Node { args, eins }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, ContractionTree::Leaf { .. })
    }

    fn arity(&self) -> usize {
        match self {
            ContractionTree::Leaf { .. } => 0,
            ContractionTree::Node { args, .. } => args.len(),
        }
    }

    /// Post-order fold: `f` sees every subtree once, after its children,
    /// together with the children's results in order.
    fn fold<'a, R>(&'a self, mut f: impl FnMut(&'a ContractionTree, Vec<R>) -> R) -> R {
        let mut stack: Vec<(&'a ContractionTree, bool)> = Vec::new();
        let mut done: Vec<R> = Vec::new();
        let mut current = (self, false);
        loop {
            let (tree, expanded) = current;
            if let ContractionTree::Node { args, .. } = tree {
                if let (false, Some((first, rest))) = (expanded, args.split_first()) {
                    stack.push((tree, true));
                    stack.extend(rest.iter().rev().map(|a| (a, false)));
                    current = (first, false);
                    continue;
                }
            }
            let children = done.split_off(done.len().saturating_sub(tree.arity()));
            let result = f(tree, children);
            match stack.pop() {
                Some(next) => {
                    done.push(result);
                    current = next;
                }
                None => return result,
            }
        }
    }

    /// Output labels of this subtree within the network `code`.
    pub fn output_labels<'a>(&'a self, code: &'a EinCode) -> Result<&'a [usize]> {
        match self {
            ContractionTree::Leaf { tensor_index } => code
                .ixs
                .get(*tensor_index)
                .map(Vec::as_slice)
                .ok_or_else(|| {
                    InferenceError::InvalidPlan(format!(
                        "leaf {} out of range for {} tensors",
                        tensor_index,
                        code.ixs.len()
                    ))
                }),
            ContractionTree::Node { eins, .. } => Ok(&eins.iy),
        }
    }

    /// Leaf indices in left-to-right order.
    pub fn leaf_indices(&self) -> Vec<usize> {
        let mut out = Vec::new();
        self.fold(|tree, _: Vec<()>| {
            if let ContractionTree::Leaf { tensor_index } = tree {
                out.push(*tensor_index);
            }
        });
        out
    }

    /// Number of contraction steps.
    pub fn num_contractions(&self) -> usize {
        self.fold(|tree, children: Vec<usize>| {
            children.into_iter().sum::<usize>() + usize::from(!tree.is_leaf())
        })
    }

    /// Element count of the largest tensor any step produces.
    pub fn max_intermediate_len(&self, size_dict: &SizeDict) -> Result<u128> {
        self.fold(|tree, children: Vec<Result<u128>>| -> Result<u128> {
            let mut best = match tree {
                ContractionTree::Leaf { .. } => 0,
                ContractionTree::Node { eins, .. } => tensor_len(&eins.iy, size_dict)?,
            };
            for child in children {
                best = best.max(child?);
            }
            Ok(best)
        })
    }

    /// Check that this tree is a valid plan for `code`.
    ///
    /// Every leaf is used exactly once, every node's input labels match its
    /// children's outputs, the root produces `code.iy`, and no label is
    /// summed away while a tensor outside the subtree (or the final output)
    /// still carries it.
    pub fn validate(&self, code: &EinCode) -> Result<()> {
        let leaves = self.leaf_indices();
        let mut seen = vec![false; code.ixs.len()];
        for &i in &leaves {
            match seen.get_mut(i) {
                Some(flag) if !*flag => *flag = true,
                Some(_) => {
                    return Err(InferenceError::InvalidPlan(format!(
                        "leaf {} appears more than once",
                        i
                    )))
                }
                None => {
                    return Err(InferenceError::InvalidPlan(format!(
                        "leaf {} out of range for {} tensors",
                        i,
                        code.ixs.len()
                    )))
                }
            }
        }
        if let Some(missing) = seen.iter().position(|s| !s) {
            return Err(InferenceError::InvalidPlan(format!(
                "tensor {} is never contracted",
                missing
            )));
        }

        let root = self.output_labels(code)?;
        if root != code.iy.as_slice() {
            return Err(InferenceError::InvalidPlan(format!(
                "plan produces labels {:?}, expected {:?}",
                root, code.iy
            )));
        }

        let mut total: HashMap<usize, usize> = HashMap::new();
        for ix in &code.ixs {
            let distinct: HashSet<usize> = ix.iter().copied().collect();
            for l in distinct {
                *total.entry(l).or_insert(0) += 1;
            }
        }
        self.fold(|tree, children| validate_node(tree, children, code, &total))
            .map(|_| ())
    }

    /// Flatten into a dependency graph in topological order.
    pub fn to_dag(&self) -> ContractionDag {
        let mut nodes: Vec<DagNode> = Vec::new();
        let root = self.fold(|tree, operands: Vec<usize>| {
            let op = match tree {
                ContractionTree::Leaf { tensor_index } => DagOp::Leaf {
                    tensor_index: *tensor_index,
                },
                ContractionTree::Node { eins, .. } => DagOp::Contract { eins: eins.clone() },
            };
            let id = nodes.len();
            nodes.push(DagNode { id, operands, op });
            id
        });
        ContractionDag { nodes, root }
    }

    /// Contract `leaves` under `S`, returning only the root tensor.
    ///
    /// Nodes run level by level over [`ContractionDag::levels`]; each
    /// intermediate is dropped as soon as its consumer has run.
    pub fn evaluate<S, T>(
        &self,
        leaves: &[T],
        size_dict: &SizeDict,
        options: &ContractionOptions,
    ) -> Result<T>
    where
        S: Semiring,
        T: SemiringTensor<S>,
    {
        let dag = self.to_dag();
        dag.check_sizes(size_dict, options)?;

        let mut values: Vec<Option<T>> = (0..dag.len()).map(|_| None).collect();
        for level in dag.levels() {
            let mut jobs: Vec<(usize, Vec<T>)> = Vec::with_capacity(level.len());
            for id in level {
                let inputs = dag.nodes[id]
                    .operands
                    .iter()
                    .map(|&o| values[o].take().ok_or_else(|| missing_operand(o)))
                    .collect::<Result<Vec<T>>>()?;
                jobs.push((id, inputs));
            }
            let run = |(id, inputs): (usize, Vec<T>)| -> Result<(usize, T)> {
                let xs: Vec<&T> = inputs.iter().collect();
                Ok((id, eval_node::<S, T>(&dag.nodes[id].op, &xs, leaves, size_dict)?))
            };
            let computed: Vec<(usize, T)> = if options.parallel && jobs.len() > 1 {
                jobs.into_par_iter().map(run).collect::<Result<_>>()?
            } else {
                jobs.into_iter().map(run).collect::<Result<_>>()?
            };
            for (id, value) in computed {
                values[id] = Some(value);
            }
        }
        values[dag.root].take().ok_or_else(|| missing_operand(dag.root))
    }

    /// Contract `leaves` under `S`, keeping every intermediate result for
    /// the backward passes.
    pub fn evaluate_cached<S, T>(
        &self,
        leaves: &[T],
        size_dict: &SizeDict,
        options: &ContractionOptions,
    ) -> Result<CachedTree<T>>
    where
        S: Semiring,
        T: SemiringTensor<S>,
    {
        let dag = self.to_dag();
        dag.check_sizes(size_dict, options)?;

        let mut values: Vec<Option<T>> = (0..dag.len()).map(|_| None).collect();
        for level in dag.levels() {
            let run = |&id: &usize| -> Result<(usize, T)> {
                let xs = dag.nodes[id]
                    .operands
                    .iter()
                    .map(|&o| values[o].as_ref().ok_or_else(|| missing_operand(o)))
                    .collect::<Result<Vec<&T>>>()?;
                Ok((id, eval_node::<S, T>(&dag.nodes[id].op, &xs, leaves, size_dict)?))
            };
            let computed: Vec<(usize, T)> = if options.parallel && level.len() > 1 {
                level.par_iter().map(run).collect::<Result<_>>()?
            } else {
                level.iter().map(run).collect::<Result<_>>()?
            };
            for (id, value) in computed {
                values[id] = Some(value);
            }
        }

        let values = values
            .into_iter()
            .enumerate()
            .map(|(id, v)| v.ok_or_else(|| missing_operand(id)))
            .collect::<Result<Vec<T>>>()?;
        Ok(CachedTree { dag, values })
    }
}

impl Clone for ContractionTree {
    fn clone(&self) -> Self {
        self.fold(|tree, args| match tree {
            ContractionTree::Leaf { tensor_index } => ContractionTree::leaf(*tensor_index),
            ContractionTree::Node { eins, .. } => ContractionTree::node(args, eins.clone()),
        })
    }
}

impl PartialEq for ContractionTree {
    fn eq(&self, other: &Self) -> bool {
        self.to_dag() == other.to_dag()
    }
}

impl fmt::Debug for ContractionTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ContractionTree")
            .field(&self.to_dag().nodes)
            .finish()
    }
}

impl From<ContractionTree> for ContractionDag {
    fn from(tree: ContractionTree) -> Self {
        tree.to_dag()
    }
}

impl TryFrom<ContractionDag> for ContractionTree {
    type Error = InferenceError;

    /// Rebuild the tree. Every node must be stored at its id, consume only
    /// earlier nodes, and be used exactly once on the way to the root.
    fn try_from(dag: ContractionDag) -> Result<Self> {
        let mut built: Vec<Option<ContractionTree>> = Vec::with_capacity(dag.nodes.len());
        for (position, node) in dag.nodes.into_iter().enumerate() {
            if node.id != position {
                return Err(InferenceError::InvalidPlan(format!(
                    "node {} stored at position {}",
                    node.id, position
                )));
            }
            let tree = match node.op {
                DagOp::Leaf { tensor_index } if node.operands.is_empty() => {
                    ContractionTree::leaf(tensor_index)
                }
                DagOp::Leaf { .. } => {
                    return Err(InferenceError::InvalidPlan(format!(
                        "leaf node {} has operands",
                        position
                    )))
                }
                DagOp::Contract { eins } => {
                    let args = node
                        .operands
                        .iter()
                        .map(|&o| {
                            built.get_mut(o).and_then(Option::take).ok_or_else(|| {
                                InferenceError::InvalidPlan(format!(
                                    "node {} consumes unavailable node {}",
                                    position, o
                                ))
                            })
                        })
                        .collect::<Result<Vec<_>>>()?;
                    ContractionTree::node(args, eins)
                }
            };
            built.push(Some(tree));
        }

        let root = built
            .get_mut(dag.root)
            .and_then(Option::take)
            .ok_or_else(|| InferenceError::InvalidPlan(format!("root {} is not available", dag.root)))?;
        if let Some(stray) = built.iter().position(Option::is_some) {
            return Err(InferenceError::InvalidPlan(format!(
                "node {} does not reach the root",
                stray
            )));
        }
        Ok(root)
    }
}

impl Drop for ContractionTree {
    fn drop(&mut self) {
        let mut stack = match self {
            ContractionTree::Node { args, .. } => std::mem::take(args),
            ContractionTree::Leaf { .. } => return,
        };
        while let Some(mut tree) = stack.pop() {
            if let ContractionTree::Node { args, .. } = &mut tree {
                stack.append(args);
            }
        }
    }
}

/// One step of [`ContractionTree::validate`]: returns the number of leaves
/// below `tree` carrying each label.
fn validate_node(
    tree: &ContractionTree,
    children: Vec<Result<HashMap<usize, usize>>>,
    code: &EinCode,
    total: &HashMap<usize, usize>,
) -> Result<HashMap<usize, usize>> {
    match tree {
        ContractionTree::Leaf { .. } => {
            let ix = tree.output_labels(code)?;
            Ok(ix.iter().map(|&l| (l, 1)).collect())
        }
        ContractionTree::Node { args, eins } => {
            let mut maps = children.into_iter().collect::<Result<Vec<_>>>()?;
            if eins.ixs.len() != args.len() {
                return Err(InferenceError::InvalidPlan(format!(
                    "node {} has {} children",
                    eins,
                    args.len()
                )));
            }
            for (arg, ix) in args.iter().zip(&eins.ixs) {
                let child = arg.output_labels(code)?;
                if child != ix.as_slice() {
                    return Err(InferenceError::InvalidPlan(format!(
                        "node {} expects {:?} from a child producing {:?}",
                        eins, ix, child
                    )));
                }
            }

            // merge into the largest child map
            let largest = maps
                .iter()
                .enumerate()
                .max_by_key(|(_, m)| m.len())
                .map(|(i, _)| i);
            let mut counts = match largest {
                Some(i) => maps.swap_remove(i),
                None => HashMap::new(),
            };
            for map in maps {
                for (l, c) in map {
                    *counts.entry(l).or_insert(0) += c;
                }
            }

            let available: HashSet<usize> = eins.ixs.iter().flatten().copied().collect();
            for l in available {
                let Some(&c) = counts.get(&l) else {
                    continue;
                };
                let needed_outside = c < total.get(&l).copied().unwrap_or(0) || code.iy.contains(&l);
                if needed_outside && !eins.iy.contains(&l) {
                    return Err(InferenceError::InvalidPlan(format!(
                        "label {} is summed at node {} but still needed elsewhere",
                        l, eins
                    )));
                }
            }
            Ok(counts)
        }
    }
}

fn eval_node<S, T>(op: &DagOp, xs: &[&T], leaves: &[T], size_dict: &SizeDict) -> Result<T>
where
    S: Semiring,
    T: SemiringTensor<S>,
{
    match op {
        DagOp::Leaf { tensor_index } => fetch_leaf(leaves, *tensor_index),
        DagOp::Contract { eins } => {
            let out = T::contract(eins, xs, size_dict)?;
            debug!(semiring = S::NAME, eins = %eins, shape = ?out.dims(), "contracted node");
            Ok(out)
        }
    }
}

fn fetch_leaf<T: Clone>(leaves: &[T], tensor_index: usize) -> Result<T> {
    leaves.get(tensor_index).cloned().ok_or_else(|| {
        InferenceError::InvalidPlan(format!(
            "leaf {} out of range for {} tensors",
            tensor_index,
            leaves.len()
        ))
    })
}

fn missing_operand(id: usize) -> InferenceError {
    InferenceError::InvalidPlan(format!("node {} was not evaluated", id))
}

/// Operation performed by a DAG node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DagOp {
    Leaf { tensor_index: usize },
    Contract { eins: EinCode },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DagNode {
    pub id: usize,
    /// Ids of the nodes whose outputs this node consumes, in operand order
    pub operands: Vec<usize>,
    pub op: DagOp,
}

/// The dependency graph of a contraction plan.
///
/// Nodes are stored in topological order: every operand id is smaller than
/// the id of its consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractionDag {
    pub nodes: Vec<DagNode>,
    pub root: usize,
}

impl ContractionDag {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Fail before any work if some contraction would exceed the size limit.
    pub fn check_sizes(&self, size_dict: &SizeDict, options: &ContractionOptions) -> Result<()> {
        for node in &self.nodes {
            if let DagOp::Contract { eins } = &node.op {
                options.check_size(&eins.iy, size_dict)?;
            }
        }
        Ok(())
    }

    /// Group nodes into wavefronts. Nodes within one level have no mutual
    /// dependency and can run concurrently once all earlier levels are done.
    pub fn levels(&self) -> Vec<Vec<usize>> {
        let mut level = vec![0usize; self.nodes.len()];
        let mut out: Vec<Vec<usize>> = Vec::new();
        for node in &self.nodes {
            let l = node
                .operands
                .iter()
                .map(|&o| level[o] + 1)
                .max()
                .unwrap_or(0);
            level[node.id] = l;
            if out.len() <= l {
                out.resize(l + 1, Vec::new());
            }
            out[l].push(node.id);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rescaled::rescale_array;
    use crate::semiring::Tropical;
    use approx::{assert_abs_diff_eq, assert_relative_eq};
    use scirs2_core::ndarray::Array;

    fn arr(shape: Vec<usize>, values: Vec<f64>) -> ArrayD<f64> {
        Array::from_shape_vec(shape, values).unwrap().into_dyn()
    }

    /// Chain A-B-C with f(A,B), f(B,C) and per-variable vectors.
    fn chain() -> (EinCode, ContractionTree, Vec<ArrayD<f64>>, SizeDict) {
        let code = EinCode::new(
            vec![vec![0], vec![1], vec![2], vec![0, 1], vec![1, 2]],
            vec![],
        );
        let ab = ContractionTree::node(
            vec![ContractionTree::leaf(0), ContractionTree::leaf(3)],
            EinCode::new(vec![vec![0], vec![0, 1]], vec![1]),
        );
        let bc = ContractionTree::node(
            vec![ContractionTree::leaf(2), ContractionTree::leaf(4)],
            EinCode::new(vec![vec![2], vec![1, 2]], vec![1]),
        );
        let tree = ContractionTree::node(
            vec![ab, ContractionTree::leaf(1), bc],
            EinCode::new(vec![vec![1], vec![1], vec![1]], vec![]),
        );
        let tensors = vec![
            ArrayD::ones(vec![2]),
            ArrayD::ones(vec![2]),
            ArrayD::ones(vec![2]),
            arr(vec![2, 2], vec![2.0, 1.0, 1.0, 2.0]),
            arr(vec![2, 2], vec![1.0, 1.0, 1.0, 3.0]),
        ];
        let sizes: SizeDict = [(0, 2), (1, 2), (2, 2)].into_iter().collect();
        (code, tree, tensors, sizes)
    }

    #[test]
    fn test_validate_accepts_chain() {
        let (code, tree, _, _) = chain();
        tree.validate(&code).unwrap();
        assert_eq!(tree.leaf_indices(), vec![0, 3, 1, 2, 4]);
        assert_eq!(tree.num_contractions(), 3);
    }

    #[test]
    fn test_validate_rejects_bad_plans() {
        let (code, _, _, _) = chain();

        let missing = ContractionTree::node(
            vec![ContractionTree::leaf(0), ContractionTree::leaf(3)],
            EinCode::new(vec![vec![0], vec![0, 1]], vec![]),
        );
        assert!(missing.validate(&code).is_err());

        // sums B before f(B,C) joins
        let early = ContractionTree::node(
            vec![
                ContractionTree::node(
                    vec![ContractionTree::leaf(0), ContractionTree::leaf(3)],
                    EinCode::new(vec![vec![0], vec![0, 1]], vec![]),
                ),
                ContractionTree::leaf(1),
                ContractionTree::leaf(2),
                ContractionTree::leaf(4),
            ],
            EinCode::new(vec![vec![], vec![1], vec![2], vec![1, 2]], vec![]),
        );
        assert!(matches!(
            early.validate(&code),
            Err(InferenceError::InvalidPlan(_))
        ));

        let mislabeled = ContractionTree::node(
            vec![ContractionTree::leaf(0), ContractionTree::leaf(1)],
            EinCode::new(vec![vec![1], vec![0]], vec![]),
        );
        assert!(mislabeled.validate(&code).is_err());
    }

    #[test]
    fn test_evaluate_real_and_tropical() {
        let (_, tree, tensors, sizes) = chain();
        let opts = ContractionOptions::default().with_parallel(false);

        let z = tree
            .evaluate::<Real, ArrayD<f64>>(&tensors, &sizes, &opts)
            .unwrap();
        assert_abs_diff_eq!(z[[]], 18.0, epsilon = 1e-12);

        let rescaled: Vec<RescaledArray> = tensors.iter().map(rescale_array).collect();
        let zr = tree
            .evaluate::<Real, RescaledArray>(&rescaled, &sizes, &opts)
            .unwrap();
        assert_abs_diff_eq!(zr.log_sum(), 18.0f64.ln(), epsilon = 1e-12);

        let logs: Vec<ArrayD<f64>> = tensors
            .iter()
            .map(<ArrayD<f64> as SemiringTensor<Tropical>>::from_potentials)
            .collect();
        let m = tree
            .evaluate::<Tropical, ArrayD<f64>>(&logs, &sizes, &opts.clone().with_parallel(true))
            .unwrap();
        assert_abs_diff_eq!(m[[]], 6.0f64.ln(), epsilon = 1e-12);
    }

    #[test]
    fn test_cached_matches_plain() {
        let (_, tree, tensors, sizes) = chain();
        let opts = ContractionOptions::default();
        let cache = tree
            .evaluate_cached::<Real, ArrayD<f64>>(&tensors, &sizes, &opts)
            .unwrap();
        assert_eq!(cache.values.len(), 8);
        let root_inputs = cache.operands(cache.dag.root);
        assert_eq!(root_inputs.len(), 3);
        assert_eq!(root_inputs[0].shape(), &[2]);
        assert_abs_diff_eq!(cache.root()[[]], 18.0, epsilon = 1e-12);

        let plain = tree
            .evaluate::<Real, ArrayD<f64>>(&tensors, &sizes, &opts)
            .unwrap();
        assert_abs_diff_eq!(plain[[]], cache.root()[[]], epsilon = 1e-12);
    }

    /// Left-leaning plan over the chain f(0,1) f(1,2) ... f(n-2,n-1).
    fn deep_chain(n: usize) -> (EinCode, ContractionTree, SizeDict) {
        let ixs: Vec<Vec<usize>> = (0..n - 1).map(|i| vec![i, i + 1]).collect();
        let code = EinCode::new(ixs.clone(), vec![]);
        let mut tree = ContractionTree::leaf(0);
        let mut labels = ixs[0].clone();
        for k in 1..n - 1 {
            let iy = if k == n - 2 { vec![] } else { vec![k + 1] };
            tree = ContractionTree::node(
                vec![tree, ContractionTree::leaf(k)],
                EinCode::new(vec![labels, ixs[k].clone()], iy.clone()),
            );
            labels = iy;
        }
        let sizes = (0..n).map(|v| (v, 2)).collect();
        (code, tree, sizes)
    }

    #[test]
    fn test_deep_plan_evaluates_without_recursion() {
        let n = 5001;
        let (code, tree, sizes) = deep_chain(n);
        tree.validate(&code).unwrap();
        assert_eq!(tree.num_contractions(), n - 2);
        assert_eq!(tree.leaf_indices().len(), n - 1);
        assert_eq!(tree.max_intermediate_len(&sizes).unwrap(), 2);
        assert_eq!(tree.to_dag().levels().len(), n - 1);

        let table = arr(vec![2, 2], vec![2.0, 1.0, 1.0, 2.0]);
        let rescaled: Vec<RescaledArray> = (0..n - 1).map(|_| rescale_array(&table)).collect();
        let opts = ContractionOptions::default();
        assert!(opts.parallel);

        // Z = 2 * 3^(n-1)
        let z = tree
            .evaluate::<Real, RescaledArray>(&rescaled, &sizes, &opts)
            .unwrap();
        let expected = 2f64.ln() + (n - 1) as f64 * 3f64.ln();
        assert_relative_eq!(z.log_sum(), expected, max_relative = 1e-9);

        let logs: Vec<ArrayD<f64>> = (0..n - 1)
            .map(|_| <ArrayD<f64> as SemiringTensor<Tropical>>::from_potentials(&table))
            .collect();
        let cache = tree
            .evaluate_cached::<Tropical, ArrayD<f64>>(&logs, &sizes, &opts)
            .unwrap();
        assert_relative_eq!(cache.root()[[]], (n - 1) as f64 * 2f64.ln(), max_relative = 1e-9);
    }

    #[test]
    fn test_deep_plan_clone_compare_drop() {
        let (_, tree, _) = deep_chain(20_000);
        let copy = tree.clone();
        assert!(copy == tree);
        let (_, other, _) = deep_chain(19_999);
        assert!(other != tree);
        let rebuilt = ContractionTree::try_from(tree.to_dag()).unwrap();
        assert!(rebuilt == tree);
        drop(copy);
        drop(other);
        drop(rebuilt);
        drop(tree);
    }

    #[test]
    fn test_dag_round_trip_rejects_malformed() {
        let (_, tree, _, _) = chain();
        let dag = tree.to_dag();
        assert_eq!(ContractionTree::try_from(dag.clone()).unwrap(), tree);

        let mut reused = dag.clone();
        if let Some(node) = reused.nodes.iter_mut().find(|n| n.operands.len() == 2) {
            node.operands[1] = node.operands[0];
        }
        assert!(matches!(
            ContractionTree::try_from(reused),
            Err(InferenceError::InvalidPlan(_))
        ));

        let mut detached = dag;
        detached.root = 0;
        assert!(ContractionTree::try_from(detached).is_err());
        assert!(format!("{:?}", tree).contains("Contract"));
    }

    #[test]
    fn test_size_limit() {
        let (_, tree, tensors, sizes) = chain();
        let opts = ContractionOptions::default().with_max_tensor_size(1);
        let err = tree
            .evaluate::<Real, ArrayD<f64>>(&tensors, &sizes, &opts)
            .unwrap_err();
        assert!(matches!(
            err,
            InferenceError::ResourceExhausted {
                requested: 2,
                limit: 1
            }
        ));
        assert_eq!(tree.max_intermediate_len(&sizes).unwrap(), 2);
    }

    #[test]
    fn test_dag_levels() {
        let (_, tree, _, _) = chain();
        let dag = tree.to_dag();
        assert_eq!(dag.len(), 8);
        assert_eq!(dag.root, 7);
        for node in &dag.nodes {
            assert!(node.operands.iter().all(|&o| o < node.id));
        }
        let levels = dag.levels();
        assert_eq!(levels.len(), 3);
        assert_eq!(levels[0].len(), 5);
        assert_eq!(levels[1].len(), 2);
        assert_eq!(levels[2], vec![7]);
    }
}
